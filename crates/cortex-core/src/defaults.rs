//! Centralized default constants for the cortex storage engine.
//!
//! **This module is the single source of truth** for shared default values.
//! [`crate::config::StorageConfig`] falls back to these when the environment
//! does not override them.

use crate::config::EvictionPassKind;

const MIB: u64 = 1024 * 1024;

// =============================================================================
// CAPACITY
// =============================================================================

/// Assumed hard ceiling of the fast store in bytes (10 MiB).
pub const CAPACITY_BYTES: u64 = 10 * MIB;

/// Usage at or above this level is classified as Warning (8 MiB).
pub const WARNING_BYTES: u64 = 8 * MIB;

/// Usage at or above this level is classified as Critical (9 MiB).
pub const CRITICAL_BYTES: u64 = 9 * MIB;

/// Records serializing to more than this are routed to the object store (4 MiB).
pub const INLINE_THRESHOLD_BYTES: u64 = 4 * MIB;

/// Interval of the periodic capacity check in milliseconds.
pub const MONITOR_INTERVAL_MS: u64 = 30_000;

// =============================================================================
// EVICTION
// =============================================================================

/// Number of most recent entries kept by the history truncation pass.
pub const HISTORY_KEEP: usize = 50;

/// Settings avatars larger than this are stripped under pressure (64 KiB).
pub const AVATAR_MAX_BYTES: usize = 64 * 1024;

/// Default pass order, least damaging first.
pub const EVICTION_PASSES: &[EvictionPassKind] = &[
    EvictionPassKind::StripBinary,
    EvictionPassKind::TruncateHistory,
    EvictionPassKind::DropEmbeddings,
];

// =============================================================================
// VERSION HISTORY
// =============================================================================

/// Maximum number of version entries retained by the ledger.
pub const MAX_VERSIONS: usize = 10;

/// Records serializing to more than this are versioned without a snapshot (64 KiB).
pub const VERSION_SNAPSHOT_MAX_BYTES: usize = 64 * 1024;

// =============================================================================
// AUTOSAVE
// =============================================================================

/// Quiet period after the last change before an autosave is written.
pub const AUTOSAVE_DEBOUNCE_MS: u64 = 500;

// =============================================================================
// EVENTS
// =============================================================================

/// Default event bus broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// EXPORT
// =============================================================================

/// Version tag written into export bundles.
pub const EXPORT_BUNDLE_VERSION: &str = "1.0.0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_are_ordered() {
        assert!(WARNING_BYTES < CRITICAL_BYTES);
        assert!(CRITICAL_BYTES < CAPACITY_BYTES);
        assert!(INLINE_THRESHOLD_BYTES < CAPACITY_BYTES);
    }

    #[test]
    fn test_eviction_passes_default_order() {
        let names: Vec<&str> = EVICTION_PASSES.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            names.join(","),
            "strip_binary,truncate_history,drop_embeddings"
        );
        assert_eq!(
            EvictionPassKind::parse_list(&names.join(",")).unwrap(),
            EVICTION_PASSES
        );
    }
}
