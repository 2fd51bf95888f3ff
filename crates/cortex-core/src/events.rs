//! Storage event types and event bus.
//!
//! Failed saves, capacity changes and migration outcomes are broadcast so the
//! UI layer can warn the user instead of relying on logs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::CapacityLevel;

/// Domain events emitted by the storage engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageEvent {
    /// A record could not be persisted.
    SaveFailed { record_id: String, error: String },
    /// Capacity classification changed.
    CapacityChanged {
        from: CapacityLevel,
        to: CapacityLevel,
        bytes_used: u64,
    },
    /// Eviction passes ran.
    EvictionRan { bytes_freed: u64 },
    /// The fast store was cleared down to its essential keys.
    EmergencyCleared { preserved_keys: usize },
    /// A legacy owner was migrated into the canonical registry.
    LegacyMigrated { owner_id: String },
    /// A legacy owner failed to migrate.
    LegacyMigrationFailed { owner_id: String, error: String },
    /// The version ledger could not be updated.
    VersionLedgerFailed { record_id: String, error: String },
    /// A debounced autosave failed.
    AutosaveFailed { record_id: String, error: String },
}

impl StorageEvent {
    /// Stable event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SaveFailed { .. } => "save_failed",
            Self::CapacityChanged { .. } => "capacity_changed",
            Self::EvictionRan { .. } => "eviction_ran",
            Self::EmergencyCleared { .. } => "emergency_cleared",
            Self::LegacyMigrated { .. } => "legacy_migrated",
            Self::LegacyMigrationFailed { .. } => "legacy_migration_failed",
            Self::VersionLedgerFailed { .. } => "version_ledger_failed",
            Self::AutosaveFailed { .. } => "autosave_failed",
        }
    }
}

/// Event plus delivery metadata.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// UUIDv7 event id.
    pub event_id: Uuid,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: StorageEvent,
}

impl EventEnvelope {
    pub fn new(event: StorageEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.event_type().to_string(),
            occurred_at: Utc::now(),
            payload: event,
        }
    }
}

/// Broadcast bus for storage events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all subscribers. Without subscribers the event is dropped.
    pub fn emit(&self, event: StorageEvent) {
        let envelope = EventEnvelope::new(event);
        tracing::debug!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to receive events. Each subscriber gets its own stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(StorageEvent::EvictionRan { bytes_freed: 42 });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event_type, "eviction_ran");
        assert_eq!(envelope.payload, StorageEvent::EvictionRan { bytes_freed: 42 });
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(StorageEvent::EmergencyCleared { preserved_keys: 1 });
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = StorageEvent::SaveFailed {
            record_id: "doc-1".into(),
            error: "full".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "save_failed");
        assert_eq!(json["record_id"], "doc-1");
    }
}
