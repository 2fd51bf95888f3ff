//! Fast-store writes with the degrading retry chain.
//!
//! A write is attempted at most three times: directly, after the eviction
//! passes, and after an emergency clear that keeps only the essential keys
//! and the unmigrated legacy registries.

use std::fmt;
use std::sync::Arc;

use cortex_core::{keys, Error, EventBus, FastStore, Result, StorageConfig, StorageEvent};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::eviction::EvictionPolicy;

/// Stage of the retry chain at which a write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStage {
    Direct,
    AfterEviction,
    AfterEmergencyClear,
}

impl WriteStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::AfterEviction => "after_eviction",
            Self::AfterEmergencyClear => "after_emergency_clear",
        }
    }
}

impl fmt::Display for WriteStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct DurableWriter {
    store: Arc<dyn FastStore>,
    policy: EvictionPolicy,
    essential_keys: Vec<String>,
    events: EventBus,
}

impl DurableWriter {
    pub fn new(
        store: Arc<dyn FastStore>,
        policy: EvictionPolicy,
        config: &StorageConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            policy,
            essential_keys: config.essential_keys.clone(),
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn FastStore> {
        &self.store
    }

    /// Write `value` under `key`, degrading through eviction and emergency clear.
    pub fn write(&self, key: &str, value: &str) -> Result<WriteStage> {
        match self.write_reclaiming(key, value) {
            Err(e) if e.is_capacity() => {
                warn!(
                    subsystem = "store",
                    component = "writer",
                    op = "write",
                    key,
                    error = %e,
                    "Write still failing after eviction, clearing to essential keys"
                );
            }
            other => return other,
        }

        self.emergency_clear()?;
        match self.store.put(key, value) {
            Ok(()) => self.landed(key, WriteStage::AfterEmergencyClear),
            Err(e) if e.is_capacity() => {
                error!(
                    subsystem = "store",
                    component = "writer",
                    op = "write",
                    key,
                    size_bytes = value.len() as u64,
                    error = %e,
                    "Write failed at every stage"
                );
                Err(Error::Unrecoverable {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Write `value` under `key`, running eviction when full but never clearing.
    ///
    /// Used for ledger and legacy bookkeeping. A store that is still full after
    /// eviction yields the capacity error.
    pub fn write_reclaiming(&self, key: &str, value: &str) -> Result<WriteStage> {
        match self.store.put(key, value) {
            Ok(()) => return self.landed(key, WriteStage::Direct),
            Err(e) if e.is_capacity() => {
                warn!(
                    subsystem = "store",
                    component = "writer",
                    op = "write",
                    key,
                    error = %e,
                    "Fast store full, running eviction before retry"
                );
            }
            Err(e) => return Err(e),
        }

        let bytes_freed = self.policy.run_all();
        if bytes_freed > 0 {
            self.events.emit(StorageEvent::EvictionRan { bytes_freed });
        }
        self.store.put(key, value)?;
        self.landed(key, WriteStage::AfterEviction)
    }

    fn landed(&self, key: &str, stage: WriteStage) -> Result<WriteStage> {
        debug!(
            subsystem = "store",
            component = "writer",
            key,
            stage = stage.as_str(),
            "Write landed"
        );
        Ok(stage)
    }

    /// Configured essential keys plus the unmigrated legacy registries.
    fn preserved_keys(&self) -> Vec<&str> {
        let mut kept: Vec<&str> = self.essential_keys.iter().map(String::as_str).collect();
        for legacy in [keys::LEGACY_DOCUMENTS_KEY, keys::LEGACY_VISUAL_KEY] {
            if !kept.contains(&legacy) {
                kept.push(legacy);
            }
        }
        kept
    }

    /// Clear the store, keeping only the preserved keys.
    fn emergency_clear(&self) -> Result<()> {
        let settings_key = keys::settings_key();
        let mut preserved = Vec::new();
        for key in self.preserved_keys() {
            if let Some(value) = self.store.get(key)? {
                let value = if key == settings_key {
                    strip_avatar(&value).unwrap_or(value)
                } else {
                    value
                };
                preserved.push((key.to_string(), value));
            }
        }

        self.store.clear()?;

        let mut restored = 0;
        for (key, value) in &preserved {
            match self.store.put(key, value) {
                Ok(()) => restored += 1,
                Err(e) => error!(
                    subsystem = "store",
                    component = "writer",
                    key = key.as_str(),
                    error = %e,
                    "Could not restore essential key after emergency clear"
                ),
            }
        }

        warn!(
            subsystem = "store",
            component = "writer",
            op = "emergency_clear",
            preserved_keys = restored,
            "Fast store cleared to essential keys"
        );
        self.events.emit(StorageEvent::EmergencyCleared {
            preserved_keys: restored,
        });
        Ok(())
    }
}

/// Drop the avatar from an inline settings entry. `None` if not applicable.
fn strip_avatar(raw: &str) -> Option<String> {
    let mut entry: Value = serde_json::from_str(raw).ok()?;
    let record = entry.get_mut("record")?.as_object_mut()?;
    record.remove("avatar")?;
    serde_json::to_string(&entry).ok()
}
