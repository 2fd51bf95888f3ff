//! Structured logging schema and field name constants for cortex.
//!
//! All crates use these constants for consistent structured logging fields
//! so log tooling can query by the same names across every component.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | A write was lost or a backend is unusable |
//! | WARN  | Recoverable issue, automatic fallback applied (eviction, emergency clear) |
//! | INFO  | Lifecycle events (open, close, migration summary) |
//! | DEBUG | Routing decisions, per-stage outcomes, capacity readings |
//! | TRACE | Per-item iteration (eviction candidates, scanned legacy rows) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "store", "cli"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "capacity", "eviction", "writer", "object_store", "legacy", "export", "facade"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "save", "load", "write", "run_all", "migrate"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Fast-store key being written.
pub const KEY: &str = "key";

/// Logical record id.
pub const RECORD_ID: &str = "record_id";

/// Record kind ("document", "visual", ...).
pub const RECORD_KIND: &str = "record_kind";

/// Legacy source tag ("source_a", "source_b").
pub const LEGACY_SOURCE: &str = "legacy_source";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Bytes currently used in the fast store.
pub const BYTES_USED: &str = "bytes_used";

/// Bytes released by an eviction pass.
pub const BYTES_FREED: &str = "bytes_freed";

/// Serialized size of a payload.
pub const SIZE_BYTES: &str = "size_bytes";

/// Number of records processed.
pub const RECORD_COUNT: &str = "record_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Retry chain stage ("direct", "after_eviction", "after_emergency_clear").
pub const STAGE: &str = "stage";

/// Capacity classification ("normal", "warning", "critical").
pub const LEVEL: &str = "level";

/// Storage tier a record was routed to ("fast", "backend").
pub const TIER: &str = "tier";

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
