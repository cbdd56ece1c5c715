//! Committed records keyed by id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::record::Record;

/// A record as held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: Record,
    pub committed_at: DateTime<Utc>,
    /// 1 on create, incremented by every committed update.
    pub revision: u64,
}

/// In-memory record store.
///
/// Cloning shares the underlying map. Writes to one id never block reads or
/// writes to another.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Arc<DashMap<String, StoredRecord>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.records.get(id).map(|entry| entry.record.clone())
    }

    pub fn get_stored(&self, id: &str) -> Option<StoredRecord> {
        self.records.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Insert or replace the record under `id`, returning the new revision.
    pub fn upsert(&self, id: &str, record: Record) -> u64 {
        let committed_at = Utc::now();
        match self.records.entry(id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                stored.record = record;
                stored.committed_at = committed_at;
                stored.revision += 1;
                stored.revision
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredRecord {
                    record,
                    committed_at,
                    revision: 1,
                });
                1
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, quantity: f64) -> Record {
        Record {
            record_id: id.to_string(),
            user_id: "u1".into(),
            org: "o1".into(),
            emission_gas_name: "CO2".into(),
            quantity,
            unit: "kg".into(),
        }
    }

    #[test]
    fn test_upsert_then_get() {
        let store = RecordStore::new();
        assert!(store.get("r1").is_none());

        assert_eq!(store.upsert("r1", record("r1", 100.0)), 1);
        assert_eq!(store.get("r1").unwrap().quantity, 100.0);
        assert!(store.contains("r1"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_bumps_revision_and_replaces() {
        let store = RecordStore::new();
        store.upsert("r1", record("r1", 100.0));
        assert_eq!(store.upsert("r1", record("r1", 250.0)), 2);

        let stored = store.get_stored("r1").unwrap();
        assert_eq!(stored.revision, 2);
        assert_eq!(stored.record.quantity, 250.0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let store = RecordStore::new();
        let other = store.clone();
        other.upsert("r1", record("r1", 1.0));
        assert!(store.contains("r1"));
    }
}
