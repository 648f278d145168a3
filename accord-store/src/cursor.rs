//! Database cursors
//!
//! A cursor walks a snapshot of the database taken when it was opened.
//! `delete_current` and `write_current` queue changes that are applied in a
//! single transaction when the cursor closes, so a walker never observes its
//! own edits mid-iteration.

use accord_core::StoreError;

use crate::kv::KvDb;

/// A snapshot cursor with buffered edits.
pub struct Cursor<'a> {
    db: &'a KvDb,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    /// Position of the current entry; `None` before the first `advance`.
    index: Option<usize>,
    pending_deletes: Vec<Vec<u8>>,
    pending_writes: Vec<(Vec<u8>, Vec<u8>)>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(db: &'a KvDb, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            db,
            entries,
            index: None,
            pending_deletes: Vec::new(),
            pending_writes: Vec::new(),
        }
    }

    /// Step to the next entry; `None` when the snapshot is exhausted.
    pub fn advance(&mut self) -> Option<(&[u8], &[u8])> {
        let next = match self.index {
            None => 0,
            Some(i) => i + 1,
        };
        if next >= self.entries.len() {
            return None;
        }
        self.index = Some(next);
        let (key, value) = &self.entries[next];
        Some((key.as_slice(), value.as_slice()))
    }

    /// Queue deletion of the entry the cursor is on.
    pub fn delete_current(&mut self) -> Result<(), StoreError> {
        let (key, _) = self.current()?;
        let key = key.to_vec();
        self.pending_deletes.push(key);
        Ok(())
    }

    /// Queue replacement of the value under the current key.
    pub fn write_current(&mut self, value: &[u8]) -> Result<(), StoreError> {
        let (key, _) = self.current()?;
        let key = key.to_vec();
        self.pending_writes.push((key, value.to_vec()));
        Ok(())
    }

    /// Apply queued edits and release the cursor.
    pub fn close(self) -> Result<(), StoreError> {
        if self.pending_deletes.is_empty() && self.pending_writes.is_empty() {
            return Ok(());
        }
        self.db
            .apply_batch(&self.pending_deletes, &self.pending_writes)
    }

    fn current(&self) -> Result<(&[u8], &[u8]), StoreError> {
        match self.index.and_then(|i| self.entries.get(i)) {
            Some((key, value)) => Ok((key.as_slice(), value.as_slice())),
            None => Err(StoreError::Transaction {
                name: self.db.name().to_string(),
                reason: "cursor is not positioned on an entry".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::string_key;
    use tempfile::TempDir;

    fn open_test_db() -> (KvDb, TempDir) {
        let tmp = TempDir::new().expect("tempdir should succeed");
        let db = KvDb::open(&tmp.path().join("cursor.lmdb"), "cursor.lmdb")
            .expect("open should succeed");
        (db, tmp)
    }

    #[test]
    fn test_walk_in_key_order() {
        let (db, _tmp) = open_test_db();
        db.write(&string_key("b"), b"2").expect("write should succeed");
        db.write(&string_key("a"), b"1").expect("write should succeed");

        let mut cursor = db.cursor().expect("cursor should open");
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.advance() {
            seen.push(key.to_vec());
        }
        assert_eq!(seen, vec![string_key("a"), string_key("b")]);
        cursor.close().expect("close should succeed");
    }

    #[test]
    fn test_delete_and_rewrite_apply_on_close() {
        let (db, _tmp) = open_test_db();
        db.write(&string_key("keep"), b"old").expect("write should succeed");
        db.write(&string_key("drop"), b"x").expect("write should succeed");

        let mut cursor = db.cursor().expect("cursor should open");
        while let Some((key, _)) = cursor.advance() {
            if key == string_key("drop").as_slice() {
                cursor.delete_current().expect("delete_current should succeed");
            } else {
                cursor.write_current(b"new").expect("write_current should succeed");
            }
        }

        // Buffered until close.
        assert!(db.has(&string_key("drop")).expect("has should succeed"));
        cursor.close().expect("close should succeed");

        assert!(!db.has(&string_key("drop")).expect("has should succeed"));
        assert_eq!(
            db.read(&string_key("keep")).expect("read should succeed"),
            Some(b"new".to_vec())
        );
    }

    #[test]
    fn test_edit_before_advance_is_an_error() {
        let (db, _tmp) = open_test_db();
        db.write(&string_key("a"), b"1").expect("write should succeed");
        let mut cursor = db.cursor().expect("cursor should open");
        assert!(cursor.delete_current().is_err());
    }
}
