//! LMDB-backed key-value database
//!
//! Uses the heed crate to provide a memory-mapped store with ACID
//! transactions. One environment per logical database, each in its own
//! directory under the state directory.
//!
//! # Keys
//!
//! Keys are byte slices. String-keyed entries include their NUL terminator
//! so that string and binary keys can never collide; [`string_key`] builds
//! such keys.

use accord_core::StoreError;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cursor::Cursor;

const MAP_SIZE_BYTES: usize = 64 * 1024 * 1024;

/// Encode a string key, including its terminator byte.
pub fn string_key(s: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(s.len() + 1);
    key.extend_from_slice(s.as_bytes());
    key.push(0);
    key
}

/// One open LMDB database.
pub struct KvDb {
    name: String,
    path: PathBuf,
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl KvDb {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Broken` when the on-disk store exists but cannot
    /// be opened or read - the caller decides whether to rename it aside and
    /// retry.
    pub fn open(path: &Path, name: &str) -> Result<Self, StoreError> {
        let pre_existing = path.exists();
        std::fs::create_dir_all(path)?;

        let env = match unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE_BYTES)
                .max_dbs(1)
                .open(path)
        } {
            Ok(env) => env,
            Err(e) => {
                return Err(open_failure(name, pre_existing, e));
            }
        };

        let mut wtxn = env.write_txn().map_err(|e| txn_error(name, e))?;
        let db: Database<Bytes, Bytes> = match env.create_database(&mut wtxn, None) {
            Ok(db) => db,
            Err(e) => return Err(open_failure(name, pre_existing, e)),
        };
        wtxn.commit().map_err(|e| txn_error(name, e))?;

        let kv = Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            env,
            db,
        };

        // A pre-existing store must also be readable end to end before it is
        // trusted; unreadable entries mean corruption.
        if pre_existing && kv.verify().is_err() {
            return Err(StoreError::Broken {
                name: name.to_string(),
            });
        }

        Ok(kv)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the value under `key`.
    pub fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn().map_err(|e| txn_error(&self.name, e))?;
        let value = self
            .db
            .get(&rtxn, key)
            .map_err(|e| txn_error(&self.name, e))?
            .map(|v| v.to_vec());
        Ok(value)
    }

    /// Write `value` under `key`, replacing any previous value.
    pub fn write(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(|e| txn_error(&self.name, e))?;
        self.db
            .put(&mut wtxn, key, value)
            .map_err(|e| txn_error(&self.name, e))?;
        wtxn.commit().map_err(|e| txn_error(&self.name, e))
    }

    /// Delete `key`; returns whether an entry existed.
    pub fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(|e| txn_error(&self.name, e))?;
        let deleted = self
            .db
            .delete(&mut wtxn, key)
            .map_err(|e| txn_error(&self.name, e))?;
        wtxn.commit().map_err(|e| txn_error(&self.name, e))?;
        Ok(deleted)
    }

    /// True when `key` has a value.
    pub fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.read(key)?.is_some())
    }

    /// Size in bytes of the value under `key`.
    pub fn value_size(&self, key: &[u8]) -> Result<Option<usize>, StoreError> {
        Ok(self.read(key)?.map(|v| v.len()))
    }

    /// Write `value` under `key` only when `predicate` accepts the current
    /// value. Runs inside a single write transaction, so the check and the
    /// write are atomic with respect to other processes.
    pub fn overwrite(
        &self,
        key: &[u8],
        value: &[u8],
        predicate: impl FnOnce(Option<&[u8]>) -> bool,
    ) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn().map_err(|e| txn_error(&self.name, e))?;
        let current = self
            .db
            .get(&wtxn, key)
            .map_err(|e| txn_error(&self.name, e))?;
        if !predicate(current) {
            return Ok(false);
        }
        self.db
            .put(&mut wtxn, key, value)
            .map_err(|e| txn_error(&self.name, e))?;
        wtxn.commit().map_err(|e| txn_error(&self.name, e))?;
        Ok(true)
    }

    /// Materialise the whole database into an ordered map.
    pub fn load_into_map(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StoreError> {
        let rtxn = self.env.read_txn().map_err(|e| txn_error(&self.name, e))?;
        let mut map = BTreeMap::new();
        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| txn_error(&self.name, e))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| txn_error(&self.name, e))?;
            map.insert(key.to_vec(), value.to_vec());
        }
        Ok(map)
    }

    /// Open a cursor over a snapshot of the database.
    pub fn cursor(&self) -> Result<Cursor<'_>, StoreError> {
        let entries = self
            .load_into_map()?
            .into_iter()
            .collect::<Vec<(Vec<u8>, Vec<u8>)>>();
        Ok(Cursor::new(self, entries))
    }

    /// Apply a batch of deletes then writes in one transaction. Used by
    /// [`Cursor::close`](crate::Cursor::close).
    pub(crate) fn apply_batch(
        &self,
        deletes: &[Vec<u8>],
        writes: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(|e| txn_error(&self.name, e))?;
        for key in deletes {
            self.db
                .delete(&mut wtxn, key)
                .map_err(|e| txn_error(&self.name, e))?;
        }
        for (key, value) in writes {
            self.db
                .put(&mut wtxn, key, value)
                .map_err(|e| txn_error(&self.name, e))?;
        }
        wtxn.commit().map_err(|e| txn_error(&self.name, e))
    }

    /// Walk every entry, proving the store is readable end to end.
    pub fn verify(&self) -> Result<usize, StoreError> {
        let rtxn = self.env.read_txn().map_err(|e| txn_error(&self.name, e))?;
        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| txn_error(&self.name, e))?;
        let mut count = 0usize;
        for entry in iter {
            entry.map_err(|e| txn_error(&self.name, e))?;
            count += 1;
        }
        Ok(count)
    }
}

fn txn_error(name: &str, e: heed::Error) -> StoreError {
    StoreError::Transaction {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

fn open_failure(name: &str, pre_existing: bool, e: heed::Error) -> StoreError {
    if pre_existing && is_corruption(&e) {
        StoreError::Broken {
            name: name.to_string(),
        }
    } else {
        StoreError::Open {
            name: name.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Only genuine on-disk damage counts as broken; anything else (permissions,
/// an environment already open in this process) must not trigger the
/// rename-aside recovery.
fn is_corruption(e: &heed::Error) -> bool {
    matches!(
        e,
        heed::Error::Mdb(
            heed::MdbError::Corrupted | heed::MdbError::Invalid | heed::MdbError::VersionMismatch
        )
    )
}
