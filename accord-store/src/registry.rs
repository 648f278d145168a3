//! Database handle registry
//!
//! One long-lived handle per database id, reference counted. A handle that
//! fails to open because the on-disk store is corrupt gets the store renamed
//! aside and recreated; a second failure freezes the slot so later opens
//! fail fast while outstanding users can still finish and close.

use accord_core::StoreError;
use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::db_id::DbId;
use crate::kv::KvDb;

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_DRAIN_POLL: Duration = Duration::from_millis(10);

/// Shared registry of open databases. Cheap to clone.
#[derive(Clone)]
pub struct StoreRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    state_dir: PathBuf,
    legacy_dir: Option<PathBuf>,
    slots: Mutex<HashMap<DbId, Slot>>,
}

#[derive(Default)]
struct Slot {
    db: Option<Arc<KvDb>>,
    refcount: usize,
    broken_attempts: u8,
    frozen: bool,
}

/// A counted reference to one open database. Dropping the handle is the
/// close operation; when the last handle for an id drops, the underlying
/// store is closed.
pub struct DbHandle {
    id: DbId,
    db: Arc<KvDb>,
    inner: Arc<RegistryInner>,
}

impl StoreRegistry {
    /// Create a registry rooted at `state_dir`. When `legacy_dir` is given,
    /// databases already present there are used in place; new databases are
    /// always created under `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>, legacy_dir: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state_dir: state_dir.into(),
                legacy_dir,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.inner.state_dir
    }

    /// Open `id`, creating or recovering the on-disk store as needed, and
    /// increment its reference count.
    pub fn open(&self, id: DbId) -> Result<DbHandle, StoreError> {
        let mut slots = self.lock_slots();
        let slot = slots.entry(id).or_default();

        if slot.frozen {
            return Err(StoreError::Frozen {
                name: id.dir_name().to_string(),
            });
        }

        if slot.db.is_none() {
            let path = id.resolve_path(&self.inner.state_dir, self.inner.legacy_dir.as_deref());
            match KvDb::open(&path, id.dir_name()) {
                Ok(db) => slot.db = Some(Arc::new(db)),
                Err(StoreError::Broken { .. }) => {
                    slot.broken_attempts += 1;
                    if slot.broken_attempts >= 2 {
                        slot.frozen = true;
                        return Err(StoreError::Frozen {
                            name: id.dir_name().to_string(),
                        });
                    }
                    tracing::warn!(db = %id, "database is broken, renaming aside and recreating");
                    rename_broken(&path)?;
                    match KvDb::open(&path, id.dir_name()) {
                        Ok(db) => slot.db = Some(Arc::new(db)),
                        Err(_) => {
                            slot.frozen = true;
                            return Err(StoreError::Frozen {
                                name: id.dir_name().to_string(),
                            });
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        slot.refcount += 1;
        let db = slot.db.as_ref().map(Arc::clone).ok_or_else(|| StoreError::Open {
            name: id.dir_name().to_string(),
            reason: "slot lost its store".to_string(),
        })?;

        Ok(DbHandle {
            id,
            db,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Open, verify and close every known database. Used by the start-up
    /// repair sweep.
    pub fn verify_all(&self) -> Result<usize, StoreError> {
        let mut entries = 0usize;
        for &id in DbId::all() {
            let handle = self.open(id)?;
            entries += handle.verify()?;
        }
        Ok(entries)
    }

    /// Total outstanding handle count across all databases.
    pub fn outstanding(&self) -> usize {
        self.lock_slots().values().map(|s| s.refcount).sum()
    }

    /// Wait for outstanding handles to drain, then close every store. After
    /// the drain timeout the stores are closed anyway and an error reports
    /// how many handles were still live.
    pub fn shutdown(&self) -> Result<(), StoreError> {
        self.shutdown_with_timeout(SHUTDOWN_DRAIN_TIMEOUT)
    }

    /// [`shutdown`](Self::shutdown) with an explicit drain window.
    pub fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let outstanding = self.outstanding();
            if outstanding == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(outstanding, "forcing store shutdown with live handles");
                self.close_all();
                return Err(StoreError::ShutdownTimeout { outstanding });
            }
            std::thread::sleep(SHUTDOWN_DRAIN_POLL);
        }
        self.close_all();
        Ok(())
    }

    fn close_all(&self) {
        let mut slots = self.lock_slots();
        for slot in slots.values_mut() {
            slot.db = None;
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<DbId, Slot>> {
        match self.inner.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    fn refcount(&self, id: DbId) -> usize {
        self.lock_slots().get(&id).map(|s| s.refcount).unwrap_or(0)
    }
}

impl DbHandle {
    pub fn id(&self) -> DbId {
        self.id
    }
}

impl Deref for DbHandle {
    type Target = KvDb;

    fn deref(&self) -> &KvDb {
        &self.db
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        let mut slots = match self.inner.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(slot) = slots.get_mut(&self.id) {
            slot.refcount = slot.refcount.saturating_sub(1);
            if slot.refcount == 0 {
                slot.db = None;
            }
        }
    }
}

/// Move a corrupt store out of the way as `<name>.broken`, replacing any
/// earlier broken copy.
fn rename_broken(path: &Path) -> Result<(), StoreError> {
    let mut broken = path.as_os_str().to_os_string();
    broken.push(".broken");
    let broken = PathBuf::from(broken);
    if broken.exists() {
        std::fs::remove_dir_all(&broken)?;
    }
    std::fs::rename(path, &broken)?;
    Ok(())
}
