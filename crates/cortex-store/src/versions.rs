//! Bounded, append-only version history.

use cortex_core::{keys, Record, RecordKind, Result, StorageConfig, VersionAction, VersionEntry};
use tracing::{debug, warn};

use crate::writer::DurableWriter;

/// Append `entry`, dropping the oldest entries beyond `max`.
pub fn append_capped(entries: &mut Vec<VersionEntry>, entry: VersionEntry, max: usize) {
    entries.push(entry);
    if entries.len() > max {
        let excess = entries.len() - max;
        entries.drain(..excess);
    }
}

/// Version ledger persisted under `cortex:versions`.
#[derive(Clone)]
pub struct VersionLedger {
    writer: DurableWriter,
    max_versions: usize,
    snapshot_max_bytes: usize,
}

impl VersionLedger {
    pub fn new(writer: DurableWriter, config: &StorageConfig) -> Self {
        Self {
            writer,
            max_versions: config.max_versions.max(1),
            snapshot_max_bytes: config.version_snapshot_max_bytes,
        }
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Result<Vec<VersionEntry>> {
        match self.writer.store().get(keys::VERSIONS_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Serialized snapshot of `record` if it is small enough to keep.
    pub fn snapshot_for(&self, record: &Record) -> Option<String> {
        match serde_json::to_string(record) {
            Ok(json) if json.len() <= self.snapshot_max_bytes => Some(json),
            Ok(_) => None,
            Err(e) => {
                warn!(record_id = record.id(), error = %e, "versions: snapshot serialization failed");
                None
            }
        }
    }

    /// Append an entry for a change to `entity_id`.
    pub fn record(
        &self,
        entity_kind: RecordKind,
        entity_id: &str,
        action: VersionAction,
        snapshot: Option<String>,
    ) -> Result<VersionEntry> {
        let mut entries = match self.entries() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    subsystem = "store",
                    component = "versions",
                    error = %e,
                    "Version ledger unreadable, starting a new one"
                );
                Vec::new()
            }
        };

        let entry = VersionEntry::new(entity_kind, entity_id, action, snapshot);
        append_capped(&mut entries, entry.clone(), self.max_versions);
        let value = serde_json::to_string(&entries)?;
        self.writer.write_reclaiming(keys::VERSIONS_KEY, &value)?;

        debug!(
            subsystem = "store",
            component = "versions",
            record_id = entity_id,
            action = %action,
            record_count = entries.len(),
            "Version recorded"
        );
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::EvictionPolicy;
    use crate::fast_store::MemoryFastStore;
    use cortex_core::{Document, EventBus, FastStore, Note};
    use std::sync::Arc;

    fn ledger(config: StorageConfig) -> (Arc<MemoryFastStore>, VersionLedger) {
        let store = Arc::new(MemoryFastStore::new(config.capacity_bytes));
        let policy = EvictionPolicy::new(store.clone(), &config);
        let writer = DurableWriter::new(store.clone(), policy, &config, EventBus::default());
        (store, VersionLedger::new(writer, &config))
    }

    fn entry(n: usize) -> VersionEntry {
        VersionEntry::new(RecordKind::Note, format!("n{n}"), VersionAction::Create, None)
    }

    #[test]
    fn test_append_capped_drops_oldest_in_order() {
        let mut entries = Vec::new();
        for n in 0..13 {
            append_capped(&mut entries, entry(n), 10);
        }
        let ids: Vec<&str> = entries.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids.len(), 10);
        assert_eq!(ids.first(), Some(&"n3"));
        assert_eq!(ids.last(), Some(&"n12"));
    }

    #[test]
    fn test_record_persists_and_caps() {
        let (_store, ledger) = ledger(StorageConfig::default().with_max_versions(3));
        for n in 0..5 {
            ledger
                .record(RecordKind::Note, &format!("n{n}"), VersionAction::Update, None)
                .unwrap();
        }
        let entries = ledger.entries().unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["n2", "n3", "n4"]);
    }

    #[test]
    fn test_snapshot_only_for_small_records() {
        let mut config = StorageConfig::default();
        config.version_snapshot_max_bytes = 200;
        let (_store, ledger) = ledger(config);

        let small = Record::Note(Note {
            id: "n1".into(),
            title: "t".into(),
            content: "short".into(),
            tags: Vec::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        });
        let large = Record::Document(Document::new("d1", "big", "x".repeat(500)));

        let snapshot = ledger.snapshot_for(&small).unwrap();
        assert_eq!(Record::from_json_bytes(snapshot.as_bytes()).unwrap(), small);
        assert!(ledger.snapshot_for(&large).is_none());
    }

    #[test]
    fn test_unreadable_ledger_is_replaced() {
        let (store, ledger) = ledger(StorageConfig::default());
        store.put(keys::VERSIONS_KEY, "{broken").unwrap();
        assert!(ledger.entries().is_err());

        ledger
            .record(RecordKind::Idea, "i1", VersionAction::Delete, None)
            .unwrap();
        assert_eq!(ledger.entries().unwrap().len(), 1);
    }
}
