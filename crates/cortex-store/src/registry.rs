//! Canonical registry entries held in the fast store.

use chrono::{DateTime, Utc};
use cortex_core::{keys, FastStore, Record, RecordKind, Result};
use serde::{Deserialize, Serialize};

/// Value stored under `cortex:rec:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "location", rename_all = "snake_case")]
pub enum RegistryEntry {
    /// The full record lives in the fast store.
    Inline { record: Record },
    /// The record lives in the object store under its id.
    Backend {
        id: String,
        kind: RecordKind,
        size_bytes: u64,
        updated_at: DateTime<Utc>,
    },
}

impl RegistryEntry {
    pub fn stub_for(record: &Record, size_bytes: u64) -> Self {
        RegistryEntry::Backend {
            id: record.id().to_string(),
            kind: record.kind(),
            size_bytes,
            updated_at: record.updated_at(),
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            RegistryEntry::Inline { record } => record.kind(),
            RegistryEntry::Backend { kind, .. } => *kind,
        }
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, RegistryEntry::Backend { .. })
    }
}

/// Read and parse the registry entry for an id.
pub fn read_entry(store: &dyn FastStore, id: &str) -> Result<Option<RegistryEntry>> {
    match store.get(&keys::registry_key(id))? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Ids of every registry key currently in the fast store.
pub fn registry_ids(store: &dyn FastStore) -> Result<Vec<String>> {
    let mut ids: Vec<String> = store
        .keys()?
        .iter()
        .filter_map(|k| keys::record_id_from_key(k).map(str::to_string))
        .collect();
    ids.sort();
    Ok(ids)
}
