//! Core traits for cortex storage tiers and collaborators.
//!
//! These traits define the interfaces that concrete implementations
//! must satisfy, enabling pluggable backends and testability.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

// =============================================================================
// FAST STORE
// =============================================================================

/// Small-capacity, synchronous string key-value tier.
///
/// Implementations enforce a hard byte ceiling; a put that would exceed it
/// fails with [`crate::Error::CapacityExceeded`] and leaves the store unchanged.
pub trait FastStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or replace a value.
    fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// All keys currently stored, in unspecified order.
    fn keys(&self) -> Result<Vec<String>>;

    /// Remove every key.
    fn clear(&self) -> Result<()>;

    /// Hard ceiling in bytes.
    fn capacity_bytes(&self) -> u64;
}

/// Bytes charged for one fast-store entry.
pub fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

// =============================================================================
// OBJECT STORE
// =============================================================================

/// Large-capacity transactional tier for payloads keyed by id.
///
/// Writes to the same id are serialized; different ids may proceed
/// concurrently. Failures are surfaced and never retried here.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create or upgrade backing structures. Idempotent.
    async fn open(&self) -> Result<()>;

    /// Store bytes under an id, replacing any previous value.
    async fn put(&self, id: &str, bytes: &[u8]) -> Result<()>;

    /// Fetch bytes for an id.
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Delete an id. Deleting an absent id is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Ids currently stored.
    async fn list_ids(&self) -> Result<Vec<String>>;

    /// Check if an id exists.
    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.get(id).await?.is_some())
    }
}

// =============================================================================
// EXTERNAL EXPORT TARGET
// =============================================================================

/// A user-granted folder that exports are mirrored into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    pub root: PathBuf,
}

impl ExportTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

/// Capability that grants export folders.
///
/// The core never depends on a specific platform picker; callers supply an
/// implementation and a missing capability degrades to fast-store-only.
#[async_trait]
pub trait ExternalTargetProvider: Send + Sync {
    /// Whether this platform can grant targets at all.
    fn is_available(&self) -> bool;

    /// Ask for a target. A declined request returns [`crate::Error::UserCancelled`].
    async fn request_target(&self) -> Result<ExportTarget>;
}
