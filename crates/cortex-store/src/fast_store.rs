//! Fast-store implementations.
//!
//! The fast store is the small, synchronous tier. Both implementations
//! charge `key.len() + value.len()` bytes per entry against a hard ceiling
//! and reject any put that would cross it without modifying the store.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use cortex_core::{entry_size, Error, FastStore, Result};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<String, String>,
    used: u64,
}

impl Entries {
    fn put(&mut self, key: &str, value: &str, capacity: u64) -> Result<()> {
        let new_size = entry_size(key, value);
        let old_size = self
            .map
            .get(key)
            .map(|old| entry_size(key, old))
            .unwrap_or(0);
        let base = self.used - old_size;
        if base + new_size > capacity {
            return Err(Error::CapacityExceeded {
                required: new_size,
                available: capacity.saturating_sub(base),
            });
        }
        self.map.insert(key.to_string(), value.to_string());
        self.used = base + new_size;
        Ok(())
    }

    fn remove(&mut self, key: &str) {
        if let Some(old) = self.map.remove(key) {
            self.used -= entry_size(key, &old);
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.used = 0;
    }
}

/// In-memory fast store with a byte ceiling.
#[derive(Debug)]
pub struct MemoryFastStore {
    entries: Mutex<Entries>,
    capacity: u64,
}

impl MemoryFastStore {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            capacity: capacity_bytes,
        }
    }

    /// Bytes currently charged.
    pub fn used_bytes(&self) -> u64 {
        self.lock().used
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // A panic while holding the lock cannot leave `Entries` half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FastStore for MemoryFastStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().map.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.lock().put(key, value, self.capacity)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock().map.keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }
}

/// Fast store persisted to a single JSON file.
///
/// Every mutation rewrites the file through a temp file + rename so a crash
/// leaves either the old or the new contents on disk.
#[derive(Debug)]
pub struct FileFastStore {
    path: PathBuf,
    entries: Mutex<Entries>,
    capacity: u64,
}

impl FileFastStore {
    /// Open or create the store file.
    pub fn open(path: impl Into<PathBuf>, capacity_bytes: u64) -> Result<Self> {
        let path = path.into();
        let mut entries = Entries::default();

        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let map: BTreeMap<String, String> = if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)?
            };
            for (key, value) in map {
                entries.used += entry_size(&key, &value);
                entries.map.insert(key, value);
            }
            if entries.used > capacity_bytes {
                warn!(
                    subsystem = "store",
                    component = "fast_store",
                    path = %path.display(),
                    bytes_used = entries.used,
                    capacity_bytes,
                    "Fast store file is over capacity; writes will fail until eviction runs"
                );
            }
        } else if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        debug!(
            subsystem = "store",
            component = "fast_store",
            op = "open",
            path = %path.display(),
            record_count = entries.map.len(),
            bytes_used = entries.used,
            "Opened file fast store"
        );

        Ok(Self {
            path,
            entries: Mutex::new(entries),
            capacity: capacity_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &Entries) -> Result<()> {
        let ordered: BTreeMap<&String, &String> = entries.map.iter().collect();
        let data = serde_json::to_vec(&ordered)?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| {
            warn!(from = %temp_path.display(), to = %self.path.display(), error = %e, "fast_store: rename failed");
            e
        })?;
        Ok(())
    }
}

impl FastStore for FileFastStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().map.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.lock();
        let previous = entries.map.get(key).cloned();
        entries.put(key, value, self.capacity)?;
        if let Err(e) = self.persist(&entries) {
            // Keep memory and disk in agreement.
            match previous {
                Some(old) => {
                    entries.remove(key);
                    entries.map.insert(key.to_string(), old.clone());
                    entries.used += entry_size(key, &old);
                }
                None => entries.remove(key),
            }
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.lock();
        if !entries.map.contains_key(key) {
            return Ok(());
        }
        entries.remove(key);
        self.persist(&entries)
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.lock().map.keys().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.lock();
        entries.clear();
        self.persist(&entries)
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity
    }
}
