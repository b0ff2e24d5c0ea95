//! Per-level registry of live table handles.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::fingerprint;
use crate::table::Table;

/// In-memory registry of the live tables at one level. Registration and
/// removal are atomic from a reader's perspective; point reads probe the
/// registered tables newest file id first, so within a level the most
/// recently written table answers first.
pub struct LevelHandler {
    tables: RwLock<BTreeMap<u32, Arc<Table>>>,
}

impl LevelHandler {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn add_table(&self, table: Arc<Table>, id: u32) {
        self.tables.write().unwrap().insert(id, table);
    }

    pub fn delete_table(&self, id: u32) -> Option<Arc<Table>> {
        self.tables.write().unwrap().remove(&id)
    }

    pub fn get_table(&self, id: u32) -> Option<Arc<Table>> {
        self.tables.read().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().unwrap().is_empty()
    }

    /// Returns the first hit among the registered tables, probing newest
    /// id first. The candidate set is snapshotted under the lock; no lock
    /// is held across disk reads.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let fp = fingerprint::of(key);
        let candidates: Vec<Arc<Table>> = {
            let tables = self.tables.read().unwrap();
            tables
                .values()
                .rev()
                .filter(|t| t.covers(fp))
                .cloned()
                .collect()
        };

        for table in candidates {
            if let Some(value) = table.get(fp, key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

impl Default for LevelHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::Memtable;
    use crate::tmpfs::TempDir;
    use std::path::Path;

    fn flushed_table(dir: &Path, id: u32, entries: &[(&[u8], &[u8])]) -> Arc<Table> {
        let mt = Memtable::new(1 << 20);
        for (k, v) in entries {
            mt.set(k.to_vec(), v.to_vec());
        }
        mt.to_disk(dir, id).expect("flush failed");
        Arc::new(Table::open(dir, id).expect("open failed"))
    }

    #[test]
    fn test_add_get_delete() {
        let dir = TempDir::new().expect("temp dir");
        let handler = LevelHandler::new();
        assert!(handler.is_empty());

        let table = flushed_table(dir.path(), 1, &[(b"key".as_slice(), b"value".as_slice())]);
        handler.add_table(table, 1);
        assert_eq!(handler.len(), 1);
        assert_eq!(handler.get(b"key").unwrap(), Some(b"value".to_vec()));
        assert_eq!(handler.get(b"missing").unwrap(), None);

        assert!(handler.delete_table(1).is_some());
        assert!(handler.delete_table(1).is_none());
        assert_eq!(handler.get(b"key").unwrap(), None);
    }

    #[test]
    fn test_newest_table_answers_first() {
        let dir = TempDir::new().expect("temp dir");
        let handler = LevelHandler::new();
        handler.add_table(
            flushed_table(dir.path(), 1, &[(b"key".as_slice(), b"old".as_slice())]),
            1,
        );
        handler.add_table(
            flushed_table(dir.path(), 2, &[(b"key".as_slice(), b"new".as_slice())]),
            2,
        );

        assert_eq!(handler.get(b"key").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_get_table_returns_handle() {
        let dir = TempDir::new().expect("temp dir");
        let handler = LevelHandler::new();
        let table = flushed_table(dir.path(), 5, &[(b"k".as_slice(), b"v".as_slice())]);
        handler.add_table(table, 5);

        assert_eq!(handler.get_table(5).expect("missing handle").id(), 5);
        assert!(handler.get_table(6).is_none());
    }
}
