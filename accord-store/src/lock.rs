//! Promise lock registry
//!
//! Enforces `ifelapsed` and `expireafter` semantics across processes. For a
//! promise the registry keeps two entries in the locks database:
//!
//! - `last<key>` - unix time of the last completed actuation,
//! - `lock<key>` - unix time the currently held lock was acquired, 0/absent
//!   when free.
//!
//! A holder that dies between acquire and complete leaves its `lock` entry
//! behind; the next caller steals it once `expireafter` has passed. The
//! read-modify-write windows are serialised across processes with an
//! exclusive advisory lock on `locks.lock`; the critical section between
//! acquire and complete holds no file lock, only the `lock` entry.
//!
//! All methods take `now` explicitly so the protocol is testable without
//! sleeping.

use accord_core::{LockError, StoreError};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::db_id::DbId;
use crate::kv::{string_key, KvDb};
use crate::registry::{DbHandle, StoreRegistry};

/// Rate-limiting attributes of one promise, minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAttrs {
    pub ifelapsed_min: i64,
    pub expireafter_min: i64,
}

impl Default for LockAttrs {
    fn default() -> Self {
        Self {
            ifelapsed_min: 1,
            expireafter_min: 120,
        }
    }
}

/// Compute the lock key for a promise: a pure function of its identity
/// after variable expansion, so concurrent runs collide deterministically.
pub fn promise_lock_key(
    namespace: &str,
    bundle: &str,
    promise_type: &str,
    expanded_promiser: &str,
    constraints: &[(String, String)],
) -> String {
    let mut hasher = Sha256::new();
    for part in [namespace, bundle, promise_type, expanded_promiser] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    for (lval, rval) in constraints {
        hasher.update(lval.as_bytes());
        hasher.update([0u8]);
        hasher.update(rval.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Cross-process lock registry backed by the locks database.
#[derive(Clone)]
pub struct LockRegistry {
    stores: StoreRegistry,
    lock_file: PathBuf,
    /// Keys held by this process, for same-process serialisation.
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockRegistry {
    pub fn new(stores: StoreRegistry) -> Self {
        let lock_file = stores.state_dir().join("locks.lock");
        Self {
            stores,
            lock_file,
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Try to acquire the lock for `key` at time `now`.
    ///
    /// # Errors
    ///
    /// `LockError::TooSoon` when the last completion is closer than
    /// `ifelapsed`, `LockError::LockedByOther` when another holder is alive;
    /// both degrade the owning promise to a skipped outcome. Store errors
    /// propagate as-is.
    pub fn acquire(
        &self,
        key: &str,
        attrs: &LockAttrs,
        ignore_locks: bool,
        now: i64,
    ) -> Result<HeldLock, LockError> {
        {
            let held = self.lock_held();
            if held.contains(key) {
                return Err(LockError::LockedByOther { since: now });
            }
        }

        let db = self.stores.open(DbId::Locks)?;
        let file = self.exclusive_file()?;
        let result = acquire_inner(&db, key, attrs, ignore_locks, now);
        let _ = FileExt::unlock(&file);
        result?;

        self.lock_held().insert(key.to_string());
        Ok(HeldLock {
            key: key.to_string(),
            acquired_at: now,
            db,
            lock_file: self.lock_file.clone(),
            held: Arc::clone(&self.held),
        })
    }

    /// Unix time of the last completed actuation under `key`, 0 when none.
    pub fn last_completed(&self, key: &str) -> Result<i64, LockError> {
        let db = self.stores.open(DbId::Locks)?;
        Ok(read_time(&db, &format!("last{}", key))?)
    }

    fn exclusive_file(&self) -> Result<File, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_file)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn lock_held(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn acquire_inner(
    db: &KvDb,
    key: &str,
    attrs: &LockAttrs,
    ignore_locks: bool,
    now: i64,
) -> Result<(), LockError> {
    let last = read_time(db, &format!("last{}", key))?;
    if !ignore_locks && last != 0 {
        let elapsed = now - last;
        if elapsed < attrs.ifelapsed_min * 60 {
            return Err(LockError::TooSoon {
                elapsed_secs: elapsed,
                ifelapsed_min: attrs.ifelapsed_min,
            });
        }
    }

    let lock_at = read_time(db, &format!("lock{}", key))?;
    if lock_at != 0 {
        if now - lock_at >= attrs.expireafter_min * 60 {
            tracing::warn!(key, since = lock_at, "stealing expired lock from dead holder");
        } else if !ignore_locks {
            return Err(LockError::LockedByOther { since: lock_at });
        }
    }

    write_time(db, &format!("lock{}", key), now)?;
    Ok(())
}

/// A held promise lock. Completing it records the actuation time and frees
/// the lock entry; dropping it without completing leaves the entry behind,
/// exactly as a crashed holder would, making it stealable after
/// `expireafter`.
pub struct HeldLock {
    key: String,
    acquired_at: i64,
    db: DbHandle,
    lock_file: PathBuf,
    held: Arc<Mutex<HashSet<String>>>,
}

impl HeldLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn acquired_at(&self) -> i64 {
        self.acquired_at
    }

    /// Mark the critical section finished at time `now`: write `last`,
    /// clear `lock`. Consumes the lock.
    pub fn complete(self, now: i64) -> Result<(), LockError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_file)?;
        file.lock_exclusive()?;
        let result = (|| -> Result<(), StoreError> {
            write_time(&self.db, &format!("last{}", self.key), now)?;
            self.db.delete(&string_key(&format!("lock{}", self.key)))?;
            Ok(())
        })();
        let _ = FileExt::unlock(&file);
        result?;
        Ok(())
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let mut held = match self.held.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        held.remove(&self.key);
    }
}

fn read_time(db: &KvDb, key: &str) -> Result<i64, StoreError> {
    match db.read(&string_key(key))? {
        Some(bytes) if bytes.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes);
            Ok(i64::from_le_bytes(buf))
        }
        _ => Ok(0),
    }
}

fn write_time(db: &KvDb, key: &str, time: i64) -> Result<(), StoreError> {
    db.write(&string_key(key), &time.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_lock_registry() -> (LockRegistry, TempDir) {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let stores = StoreRegistry::new(tmp.path(), None);
        (LockRegistry::new(stores), tmp)
    }

    fn quick_attrs() -> LockAttrs {
        LockAttrs {
            ifelapsed_min: 1,
            expireafter_min: 1,
        }
    }

    #[test]
    fn test_lock_key_deterministic_and_sensitive() {
        let constraints = vec![("args".to_string(), "-v".to_string())];
        let a = promise_lock_key("default", "main", "commands", "/bin/true", &constraints);
        let b = promise_lock_key("default", "main", "commands", "/bin/true", &constraints);
        assert_eq!(a, b);

        let c = promise_lock_key("default", "main", "commands", "/bin/false", &constraints);
        assert_ne!(a, c);
    }

    #[test]
    fn test_ifelapsed_protocol() {
        let (locks, _tmp) = new_lock_registry();
        let attrs = quick_attrs();

        let held = locks
            .acquire("k1", &attrs, false, 1_000)
            .expect("first acquire should succeed");
        held.complete(1_001).expect("complete should succeed");

        // Within ifelapsed: refused.
        match locks.acquire("k1", &attrs, false, 1_030) {
            Err(LockError::TooSoon { elapsed_secs, .. }) => assert_eq!(elapsed_secs, 29),
            other => panic!("expected TooSoon, got {:?}", other.map(|l| l.key().to_string())),
        }

        // After ifelapsed: granted again.
        let held = locks
            .acquire("k1", &attrs, false, 1_062)
            .expect("third acquire should succeed");
        held.complete(1_063).expect("complete should succeed");
        assert_eq!(
            locks.last_completed("k1").expect("read should succeed"),
            1_063
        );
    }

    #[test]
    fn test_stale_lock_stolen_after_expireafter() {
        let (locks, _tmp) = new_lock_registry();
        let attrs = quick_attrs();

        // Simulate a crash: acquire and drop without completing.
        let crashed = locks
            .acquire("k2", &attrs, false, 1_000)
            .expect("acquire should succeed");
        drop(crashed);

        // Before expiry the dead holder still owns the lock.
        match locks.acquire("k2", &attrs, false, 1_030) {
            Err(LockError::LockedByOther { since }) => assert_eq!(since, 1_000),
            other => panic!("expected LockedByOther, got {:?}", other.map(|l| l.key().to_string())),
        }

        // At expiry the lock is stolen.
        let stolen = locks
            .acquire("k2", &attrs, false, 1_060)
            .expect("steal should succeed");
        stolen.complete(1_061).expect("complete should succeed");
    }

    #[test]
    fn test_ignore_locks_bypasses_contention() {
        let (locks, _tmp) = new_lock_registry();
        let attrs = quick_attrs();

        let held = locks
            .acquire("k3", &attrs, false, 1_000)
            .expect("acquire should succeed");
        held.complete(1_001).expect("complete should succeed");

        let held = locks
            .acquire("k3", &attrs, true, 1_002)
            .expect("ignore_locks acquire should succeed");
        held.complete(1_003).expect("complete should succeed");
    }

    #[test]
    fn test_same_process_serialisation() {
        let (locks, _tmp) = new_lock_registry();
        let attrs = quick_attrs();

        let first = locks
            .acquire("k4", &attrs, false, 1_000)
            .expect("acquire should succeed");
        assert!(matches!(
            locks.acquire("k4", &attrs, false, 1_001),
            Err(LockError::LockedByOther { .. })
        ));
        first.complete(1_002).expect("complete should succeed");
    }

    // One LMDB environment cannot be opened twice inside one process, so
    // the two "processes" here run sequentially over the same state dir;
    // what they share is the on-disk locks database.
    #[test]
    fn test_cross_process_contention_via_shared_state_dir() {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let attrs = quick_attrs();

        {
            let locks_a = LockRegistry::new(StoreRegistry::new(tmp.path(), None));
            let held = locks_a
                .acquire("k5", &attrs, false, 1_000)
                .expect("acquire should succeed");
            // First process dies mid-critical-section.
            drop(held);
        }

        let locks_b = LockRegistry::new(StoreRegistry::new(tmp.path(), None));

        // The second process observes the on-disk lock entry.
        assert!(matches!(
            locks_b.acquire("k5", &attrs, false, 1_010),
            Err(LockError::LockedByOther { since: 1_000 })
        ));

        // And steals it once expireafter has passed.
        let held_b = locks_b
            .acquire("k5", &attrs, false, 1_060)
            .expect("steal should succeed");
        held_b.complete(1_061).expect("complete should succeed");

        assert_eq!(
            locks_b.last_completed("k5").expect("read should succeed"),
            1_061
        );
    }
}
