//! Fast-store key layout.

use crate::models::SETTINGS_ID;

/// Prefix of canonical registry entries.
pub const REGISTRY_PREFIX: &str = "cortex:rec:";

/// Key of the version history ledger.
pub const VERSIONS_KEY: &str = "cortex:versions";

/// Older-format legacy document list.
pub const LEGACY_DOCUMENTS_KEY: &str = "documents";

/// Canonical-format legacy visual content registry.
pub const LEGACY_VISUAL_KEY: &str = "visual_content_registry";

/// Registry key for a record id.
pub fn registry_key(id: &str) -> String {
    format!("{REGISTRY_PREFIX}{id}")
}

/// Record id for a registry key, if the key belongs to the registry.
pub fn record_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(REGISTRY_PREFIX).filter(|id| !id.is_empty())
}

/// Registry key of the settings singleton.
pub fn settings_key() -> String {
    registry_key(SETTINGS_ID)
}
