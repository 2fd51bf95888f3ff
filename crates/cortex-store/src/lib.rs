//! # cortex-store
//!
//! Tiered persistence engine for cortex.
//!
//! Small records live in a capacity-limited fast store; large ones go to an
//! object store with a stub left in the fast-store registry. Writes degrade
//! through eviction and an emergency clear before failing, and records from
//! the legacy registries are folded into the canonical registry on demand.
//!
//! [`StorageFacade`] is the entry point.

pub mod autosave;
pub mod capacity;
pub mod eviction;
pub mod export;
pub mod facade;
pub mod fast_store;
pub mod legacy;
pub mod object_store;
pub mod registry;
pub mod versions;
pub mod writer;

pub use autosave::AutoSaver;
pub use capacity::{measure_bytes, CapacityCheck, CapacityMonitor, MonitorHandle};
pub use eviction::EvictionPolicy;
pub use export::{
    parse_import_bundle, DirectoryTargetProvider, ExportReport, FolderExportStore, ParsedImport,
    UnsupportedTargetProvider,
};
pub use facade::{SaveReceipt, SearchHit, StorageFacade, Tier};
pub use fast_store::{FileFastStore, MemoryFastStore};
pub use legacy::{
    merge, normalize, LegacyReconciler, LegacySource, MigrationOutcome, MigrationReport,
    MigrationTarget, RawLegacyRecord, ScannedLegacy, Winner,
};
pub use object_store::{FilesystemObjectStore, MemoryObjectStore};
pub use registry::RegistryEntry;
pub use versions::VersionLedger;
pub use writer::{DurableWriter, WriteStage};

// Re-export core types for convenience
pub use cortex_core::*;
