use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ObjectKind, ObjectStore, Record};
use crate::error::{LabError, LabResult};

/// In-process store; counts writes so callers can check read paths stay read-only
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<ObjectKind, BTreeMap<String, Record>>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls since creation
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Inserts without counting as a write
    pub fn seed(&self, kind: ObjectKind, record: Record) {
        self.records
            .lock()
            .entry(kind)
            .or_default()
            .insert(record.name().to_string(), record);
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, kind: ObjectKind, name: &str) -> LabResult<Record> {
        self.records
            .lock()
            .get(&kind)
            .and_then(|m| m.get(name))
            .cloned()
            .ok_or_else(|| LabError::not_found(kind.as_str(), name))
    }

    fn list(&self, kind: ObjectKind) -> LabResult<Vec<String>> {
        Ok(self
            .records
            .lock()
            .get(&kind)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn put(&self, kind: ObjectKind, record: &Record) -> LabResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.seed(kind, record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_does_not_count_as_write() {
        let store = MemoryStore::new();
        store.seed(ObjectKind::Board, Record::new("bbb"));
        assert_eq!(store.writes(), 0);
        store.put(ObjectKind::Board, &Record::new("rpi")).unwrap();
        assert_eq!(store.writes(), 1);
        assert_eq!(store.list(ObjectKind::Board).unwrap(), vec!["bbb", "rpi"]);
    }
}
