//! # cortex-core
//!
//! Core types, traits, and configuration for the cortex storage engine.
//!
//! This crate provides the record model, error taxonomy and the storage-tier
//! traits that `cortex-store` implements and composes.

pub mod config;
pub mod defaults;
pub mod error;
pub mod events;
pub mod file_safety;
pub mod keys;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{EvictionPassKind, StorageConfig};
pub use error::{Error, Result};
pub use events::{EventBus, EventEnvelope, StorageEvent};
pub use file_safety::sanitize_title;
pub use models::*;
pub use traits::*;
