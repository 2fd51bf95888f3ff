//! Storage engine configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::defaults;
use crate::error::{Error, Result};
use crate::keys;

/// One eviction pass, in the order configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionPassKind {
    /// Strip binary payloads and thumbnails from visual records, oversized avatars.
    StripBinary,
    /// Cap chat and version history lists.
    TruncateHistory,
    /// Remove embedding vectors from documents and chunks.
    DropEmbeddings,
}

impl EvictionPassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StripBinary => "strip_binary",
            Self::TruncateHistory => "truncate_history",
            Self::DropEmbeddings => "drop_embeddings",
        }
    }

    /// Parse a comma separated pass list.
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl fmt::Display for EvictionPassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPassKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "strip_binary" => Ok(Self::StripBinary),
            "truncate_history" => Ok(Self::TruncateHistory),
            "drop_embeddings" => Ok(Self::DropEmbeddings),
            other => Err(Error::Config(format!("unknown eviction pass: {other}"))),
        }
    }
}

/// Configuration for the storage engine.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Hard ceiling of the fast store.
    pub capacity_bytes: u64,
    /// Usage at or above this is Warning.
    pub warning_bytes: u64,
    /// Usage at or above this is Critical.
    pub critical_bytes: u64,
    /// Records serializing to more than this go to the object store.
    pub inline_threshold_bytes: u64,
    /// Eviction passes, least damaging first.
    pub eviction_passes: Vec<EvictionPassKind>,
    /// Entries kept per history list by the truncation pass.
    pub history_keep: usize,
    /// Avatars above this size are stripped under pressure.
    pub avatar_max_bytes: usize,
    /// Version ledger capacity.
    pub max_versions: usize,
    /// Largest record that is snapshotted into the version ledger.
    pub version_snapshot_max_bytes: usize,
    /// Quiet period before an autosave is written.
    pub autosave_debounce: Duration,
    /// Period of the background capacity check.
    pub monitor_interval: Duration,
    /// Keys preserved by an emergency clear.
    pub essential_keys: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: defaults::CAPACITY_BYTES,
            warning_bytes: defaults::WARNING_BYTES,
            critical_bytes: defaults::CRITICAL_BYTES,
            inline_threshold_bytes: defaults::INLINE_THRESHOLD_BYTES,
            eviction_passes: defaults::EVICTION_PASSES.to_vec(),
            history_keep: defaults::HISTORY_KEEP,
            avatar_max_bytes: defaults::AVATAR_MAX_BYTES,
            max_versions: defaults::MAX_VERSIONS,
            version_snapshot_max_bytes: defaults::VERSION_SNAPSHOT_MAX_BYTES,
            autosave_debounce: Duration::from_millis(defaults::AUTOSAVE_DEBOUNCE_MS),
            monitor_interval: Duration::from_millis(defaults::MONITOR_INTERVAL_MS),
            essential_keys: vec![keys::settings_key()],
        }
    }
}

impl StorageConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CORTEX_CAPACITY_BYTES` | `10485760` | Fast-store ceiling |
    /// | `CORTEX_WARNING_BYTES` | `8388608` | Warning threshold |
    /// | `CORTEX_CRITICAL_BYTES` | `9437184` | Critical threshold |
    /// | `CORTEX_INLINE_THRESHOLD_BYTES` | `4194304` | Fast-store / object-store cutoff |
    /// | `CORTEX_EVICTION_PASSES` | `strip_binary,truncate_history,drop_embeddings` | Pass order |
    /// | `CORTEX_HISTORY_KEEP` | `50` | Entries kept per history list |
    /// | `CORTEX_AVATAR_MAX_BYTES` | `65536` | Avatar strip threshold |
    /// | `CORTEX_MAX_VERSIONS` | `10` | Version ledger capacity |
    /// | `CORTEX_VERSION_SNAPSHOT_MAX_BYTES` | `65536` | Largest snapshotted record |
    /// | `CORTEX_AUTOSAVE_DEBOUNCE_MS` | `500` | Autosave quiet period |
    /// | `CORTEX_MONITOR_INTERVAL_MS` | `30000` | Capacity check period |
    ///
    /// Unparseable values are logged and replaced by the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();

        let eviction_passes = match lookup("CORTEX_EVICTION_PASSES") {
            Some(raw) => match EvictionPassKind::parse_list(&raw) {
                Ok(passes) => passes,
                Err(e) => {
                    warn!(error = %e, "Invalid CORTEX_EVICTION_PASSES, using default order");
                    base.eviction_passes.clone()
                }
            },
            None => base.eviction_passes.clone(),
        };

        Self {
            capacity_bytes: parse_or(&lookup, "CORTEX_CAPACITY_BYTES", base.capacity_bytes),
            warning_bytes: parse_or(&lookup, "CORTEX_WARNING_BYTES", base.warning_bytes),
            critical_bytes: parse_or(&lookup, "CORTEX_CRITICAL_BYTES", base.critical_bytes),
            inline_threshold_bytes: parse_or(
                &lookup,
                "CORTEX_INLINE_THRESHOLD_BYTES",
                base.inline_threshold_bytes,
            ),
            eviction_passes,
            history_keep: parse_or(&lookup, "CORTEX_HISTORY_KEEP", base.history_keep),
            avatar_max_bytes: parse_or(&lookup, "CORTEX_AVATAR_MAX_BYTES", base.avatar_max_bytes),
            max_versions: parse_or(&lookup, "CORTEX_MAX_VERSIONS", base.max_versions).max(1),
            version_snapshot_max_bytes: parse_or(
                &lookup,
                "CORTEX_VERSION_SNAPSHOT_MAX_BYTES",
                base.version_snapshot_max_bytes,
            ),
            autosave_debounce: Duration::from_millis(parse_or(
                &lookup,
                "CORTEX_AUTOSAVE_DEBOUNCE_MS",
                defaults::AUTOSAVE_DEBOUNCE_MS,
            )),
            monitor_interval: Duration::from_millis(parse_or(
                &lookup,
                "CORTEX_MONITOR_INTERVAL_MS",
                defaults::MONITOR_INTERVAL_MS,
            )),
            essential_keys: base.essential_keys,
        }
    }

    /// Check that thresholds are consistent.
    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Err(Error::Config("capacity_bytes must be positive".into()));
        }
        if self.warning_bytes > self.critical_bytes {
            return Err(Error::Config(format!(
                "warning threshold ({}) exceeds critical threshold ({})",
                self.warning_bytes, self.critical_bytes
            )));
        }
        if self.critical_bytes > self.capacity_bytes {
            return Err(Error::Config(format!(
                "critical threshold ({}) exceeds capacity ({})",
                self.critical_bytes, self.capacity_bytes
            )));
        }
        if self.inline_threshold_bytes > self.capacity_bytes {
            return Err(Error::Config(format!(
                "inline threshold ({}) exceeds capacity ({})",
                self.inline_threshold_bytes, self.capacity_bytes
            )));
        }
        if self.max_versions == 0 {
            return Err(Error::Config("max_versions must be at least 1".into()));
        }
        Ok(())
    }

    /// Set capacity and both thresholds at once.
    pub fn with_capacity(mut self, capacity: u64, warning: u64, critical: u64) -> Self {
        self.capacity_bytes = capacity;
        self.warning_bytes = warning;
        self.critical_bytes = critical;
        self
    }

    pub fn with_inline_threshold(mut self, bytes: u64) -> Self {
        self.inline_threshold_bytes = bytes;
        self
    }

    pub fn with_eviction_passes(mut self, passes: Vec<EvictionPassKind>) -> Self {
        self.eviction_passes = passes;
        self
    }

    pub fn with_history_keep(mut self, keep: usize) -> Self {
        self.history_keep = keep;
        self
    }

    pub fn with_max_versions(mut self, max: usize) -> Self {
        self.max_versions = max;
        self
    }

    pub fn with_autosave_debounce(mut self, debounce: Duration) -> Self {
        self.autosave_debounce = debounce;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_essential_keys(mut self, keys: Vec<String>) -> Self {
        self.essential_keys = keys;
        self
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy,
{
    match lookup(name) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(variable = name, value = %raw, "Unparseable config value, using default");
                default
            }
        },
        None => default,
    }
}
