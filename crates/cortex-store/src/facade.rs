//! The storage facade: single entry point over every tier.
//!
//! ```rust,ignore
//! let facade = StorageFacade::open(config, fast, objects, provider).await?;
//! facade.save(Record::Note(note)).await?;
//! let loaded = facade.load("note-1").await?;
//! facade.close().await?;
//! ```

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use cortex_core::{
    defaults, keys, Error, EventBus, EventEnvelope, ExportBundle, ExternalTargetProvider,
    FastStore, ImportSummary, ObjectStore, Record, RecordKind, Result, StorageConfig,
    StorageEvent, UsageReport, VersionAction, VersionEntry,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::capacity::{CapacityCheck, CapacityMonitor, MonitorHandle};
use crate::eviction::EvictionPolicy;
use crate::export::{parse_import_bundle, ExportReport, FolderExportStore};
use crate::legacy::{LegacyReconciler, MigrationReport, MigrationTarget};
use crate::registry::{read_entry, registry_ids, RegistryEntry};
use crate::versions::VersionLedger;
use crate::writer::{DurableWriter, WriteStage};

/// Tier a record was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Fast,
    Backend,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Backend => "backend",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how a save landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub id: String,
    pub tier: Tier,
    pub size_bytes: u64,
    /// Retry-chain stage of the fast-store write (registry entry or stub).
    pub stage: WriteStage,
    pub action: VersionAction,
}

/// A full-text search match.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub kind: RecordKind,
    pub title: Option<String>,
    pub snippet: String,
}

const SNIPPET_RADIUS: usize = 40;

fn snippet_around(text: &str, byte_pos: usize, match_len: usize) -> String {
    let mut start = byte_pos.saturating_sub(SNIPPET_RADIUS);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (byte_pos + match_len + SNIPPET_RADIUS).min(text.len());
    while !text.is_char_boundary(end) {
        end += 1;
    }
    let mut out = String::new();
    if start > 0 {
        out.push_str("...");
    }
    out.push_str(text[start..end].trim());
    if end < text.len() {
        out.push_str("...");
    }
    out
}

/// Tiered storage over a fast store and an object store.
pub struct StorageFacade {
    config: StorageConfig,
    fast: Arc<dyn FastStore>,
    objects: Arc<dyn ObjectStore>,
    backend_available: bool,
    writer: DurableWriter,
    policy: EvictionPolicy,
    monitor: Arc<CapacityMonitor>,
    ledger: VersionLedger,
    reconciler: LegacyReconciler,
    folder: FolderExportStore,
    events: EventBus,
    legacy_checked: Mutex<HashSet<String>>,
    legacy_swept: AtomicBool,
    monitor_handle: Mutex<Option<MonitorHandle>>,
}

impl StorageFacade {
    /// Open the engine. The object store is opened here; if that fails the
    /// engine runs fast-store only and large records are rejected.
    pub async fn open(
        config: StorageConfig,
        fast: Arc<dyn FastStore>,
        objects: Arc<dyn ObjectStore>,
        provider: Arc<dyn ExternalTargetProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let events = EventBus::new(defaults::EVENT_BUS_CAPACITY);

        let backend_available = match objects.open().await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    subsystem = "store",
                    component = "facade",
                    error = %e,
                    limit = config.inline_threshold_bytes,
                    "Object store unavailable, large records will be rejected"
                );
                false
            }
        };

        let policy = EvictionPolicy::new(fast.clone(), &config);
        let writer = DurableWriter::new(fast.clone(), policy.clone(), &config, events.clone());
        let monitor = Arc::new(CapacityMonitor::new(
            fast.clone(),
            policy.clone(),
            &config,
            events.clone(),
        ));
        let ledger = VersionLedger::new(writer.clone(), &config);
        let reconciler = LegacyReconciler::new(fast.clone(), writer.clone(), events.clone());

        let monitor_handle = if config.monitor_interval.is_zero() {
            None
        } else {
            Some(monitor.clone().spawn_periodic(config.monitor_interval))
        };

        info!(
            subsystem = "store",
            component = "facade",
            op = "open",
            capacity_bytes = config.capacity_bytes,
            inline_threshold = config.inline_threshold_bytes,
            backend_available,
            "Storage facade opened"
        );

        Ok(Self {
            folder: FolderExportStore::new(provider),
            config,
            fast,
            objects,
            backend_available,
            writer,
            policy,
            monitor,
            ledger,
            reconciler,
            events,
            legacy_checked: Mutex::new(HashSet::new()),
            legacy_swept: AtomicBool::new(false),
            monitor_handle: Mutex::new(monitor_handle),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn backend_available(&self) -> bool {
        self.backend_available
    }

    pub fn fast_store(&self) -> &Arc<dyn FastStore> {
        &self.fast
    }

    /// Subscribe to storage events.
    pub fn events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Stop background work.
    pub async fn close(&self) -> Result<()> {
        let handle = self
            .monitor_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.shutdown().await?;
        }
        info!(subsystem = "store", component = "facade", op = "close", "Storage facade closed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // save / load / list / delete
    // -------------------------------------------------------------------------

    /// Persist a record, replacing any previous version.
    pub async fn save(&self, record: Record) -> Result<SaveReceipt> {
        let id = record.id().to_string();
        match self.save_inner(record).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                error!(
                    subsystem = "store",
                    component = "facade",
                    op = "save",
                    record_id = id.as_str(),
                    error = %e,
                    "Save failed"
                );
                self.events.emit(StorageEvent::SaveFailed {
                    record_id: id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn save_inner(&self, record: Record) -> Result<SaveReceipt> {
        let start = Instant::now();
        record.validate()?;
        let id = record.id().to_string();
        let kind = record.kind();
        let bytes = record.to_json_bytes()?;
        let size = bytes.len() as u64;
        let threshold = self.config.inline_threshold_bytes;

        let previous = read_entry(self.fast.as_ref(), &id)?;
        let existed = previous.is_some() || self.object_exists(&id).await?;
        let action = if existed {
            VersionAction::Update
        } else {
            VersionAction::Create
        };

        let (tier, stage) = if size <= threshold {
            let entry = RegistryEntry::Inline {
                record: record.clone(),
            };
            let stage = self
                .writer
                .write(&keys::registry_key(&id), &serde_json::to_string(&entry)?)?;
            if previous.as_ref().is_some_and(RegistryEntry::is_backend) {
                if let Err(e) = self.objects.delete(&id).await {
                    warn!(record_id = id.as_str(), error = %e, "facade: stale backend payload not removed");
                }
            }
            (Tier::Fast, stage)
        } else {
            if !self.backend_available {
                return Err(Error::PayloadTooLarge {
                    size,
                    limit: threshold,
                });
            }
            self.objects.put(&id, &bytes).await?;
            let stub = RegistryEntry::stub_for(&record, size);
            let stage = self
                .writer
                .write(&keys::registry_key(&id), &serde_json::to_string(&stub)?)?;
            (Tier::Backend, stage)
        };

        debug!(
            subsystem = "store",
            component = "facade",
            op = "save",
            record_id = id.as_str(),
            record_kind = kind.as_str(),
            tier = tier.as_str(),
            size_bytes = size,
            stage = stage.as_str(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Record saved"
        );

        let snapshot = self.ledger.snapshot_for(&record);
        if let Err(e) = self.ledger.record(kind, &id, action, snapshot) {
            warn!(record_id = id.as_str(), error = %e, "facade: version ledger not updated");
            self.events.emit(StorageEvent::VersionLedgerFailed {
                record_id: id.clone(),
                error: e.to_string(),
            });
        }

        if let Err(e) = self.monitor.monitor() {
            warn!(error = %e, "facade: post-write capacity check failed");
        }

        // A concurrent emergency clear may have taken the entry with it.
        if read_entry(self.fast.as_ref(), &id)?.is_none() {
            return Err(Error::Transaction(format!(
                "registry entry for {id} was cleared before the save completed"
            )));
        }

        Ok(SaveReceipt {
            id,
            tier,
            size_bytes: size,
            stage,
            action,
        })
    }

    async fn object_exists(&self, id: &str) -> Result<bool> {
        if !self.backend_available {
            return Ok(false);
        }
        self.objects.exists(id).await
    }

    /// Look up a canonical record without touching legacy data.
    pub async fn load_canonical(&self, id: &str) -> Result<Option<Record>> {
        match read_entry(self.fast.as_ref(), id)? {
            Some(RegistryEntry::Inline { record }) => return Ok(Some(record)),
            Some(RegistryEntry::Backend { .. }) | None => {}
        }
        if !self.backend_available {
            return Ok(None);
        }
        match self.objects.get(id).await? {
            Some(bytes) => Ok(Some(Record::from_json_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load a record: registry, then object store, then a one-time legacy pass.
    pub async fn load(&self, id: &str) -> Result<Option<Record>> {
        if let Some(record) = self.load_canonical(id).await? {
            return Ok(Some(record));
        }

        let first_miss = self
            .legacy_checked
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.to_string());
        if !first_miss {
            return Ok(None);
        }

        match self.reconciler.reconcile_owner(self, id).await {
            Ok(Some(_)) => self.load_canonical(id).await,
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(
                    subsystem = "store",
                    component = "facade",
                    op = "load",
                    record_id = id,
                    error = %e,
                    "Legacy fallback failed"
                );
                // Allow a later load to try again.
                self.legacy_checked
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(id);
                Ok(None)
            }
        }
    }

    /// Every canonical record, optionally restricted to one kind, ordered by id.
    pub async fn list(&self, kind: Option<RecordKind>) -> Result<Vec<Record>> {
        if !self.legacy_swept.swap(true, Ordering::SeqCst) && self.reconciler.has_legacy_data()? {
            if let Err(e) = self.reconcile_legacy().await {
                warn!(error = %e, "facade: legacy sweep before list failed");
            }
        }

        let mut ids: BTreeSet<String> = registry_ids(self.fast.as_ref())?.into_iter().collect();
        if self.backend_available {
            ids.extend(self.objects.list_ids().await?);
        }

        let mut records = Vec::new();
        for id in ids {
            match self.load_canonical(&id).await {
                Ok(Some(record)) if kind.map_or(true, |k| record.kind() == k) => {
                    records.push(record)
                }
                Ok(_) => {}
                Err(e) => warn!(record_id = id.as_str(), error = %e, "facade: skipping unreadable record"),
            }
        }
        Ok(records)
    }

    /// Delete a record from every tier. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let existing = self.load_canonical(id).await?;
        let kind = match &existing {
            Some(record) => record.kind(),
            None => match read_entry(self.fast.as_ref(), id)? {
                Some(entry) => entry.kind(),
                None => return Ok(false),
            },
        };

        self.fast.remove(&keys::registry_key(id))?;
        if self.backend_available {
            self.objects.delete(id).await?;
        }

        if let Err(e) = self.ledger.record(kind, id, VersionAction::Delete, None) {
            warn!(record_id = id, error = %e, "facade: version ledger not updated");
            self.events.emit(StorageEvent::VersionLedgerFailed {
                record_id: id.to_string(),
                error: e.to_string(),
            });
        }
        debug!(subsystem = "store", component = "facade", op = "delete", record_id = id, "Record deleted");
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // export / import
    // -------------------------------------------------------------------------

    /// Notes, ideas and version history as an export bundle.
    pub async fn build_bundle(&self) -> Result<ExportBundle> {
        let mut notes = Vec::new();
        let mut ideas = Vec::new();
        for record in self.list(None).await? {
            match record {
                Record::Note(note) => notes.push(note),
                Record::Idea(idea) => ideas.push(idea),
                _ => {}
            }
        }
        Ok(ExportBundle {
            notes,
            ideas,
            version_history: self.version_history().unwrap_or_else(|e| {
                warn!(error = %e, "facade: version history unreadable, exporting without it");
                Vec::new()
            }),
            export_date: Utc::now(),
            version: defaults::EXPORT_BUNDLE_VERSION.to_string(),
        })
    }

    /// Mirror notes and ideas into the export folder.
    pub async fn export_all(&self) -> Result<ExportReport> {
        let bundle = self.build_bundle().await?;
        self.folder.export_all(&bundle).await
    }

    pub fn folder(&self) -> &FolderExportStore {
        &self.folder
    }

    /// Import notes and ideas. Each record is saved on its own; the first
    /// failure stops the import and earlier records stay committed.
    pub async fn import_bundle(&self, bytes: &[u8]) -> Result<ImportSummary> {
        let parsed = parse_import_bundle(bytes)?;
        let mut summary = ImportSummary::default();

        for note in parsed.notes {
            self.save(Record::Note(note)).await?;
            summary.notes_count += 1;
        }
        for idea in parsed.ideas {
            self.save(Record::Idea(idea)).await?;
            summary.ideas_count += 1;
        }

        info!(
            subsystem = "store",
            component = "facade",
            op = "import",
            notes = summary.notes_count,
            ideas = summary.ideas_count,
            "Import complete"
        );
        Ok(summary)
    }

    // -------------------------------------------------------------------------
    // search / diagnostics / legacy
    // -------------------------------------------------------------------------

    /// Case-insensitive substring scan over every record's text fields.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits = Vec::new();
        for record in self.list(None).await? {
            let found = record.searchable_text().into_iter().find_map(|text| {
                let lower = text.to_lowercase();
                // Lowercasing can change byte offsets; only map back when it did not.
                lower.find(&needle).map(|pos| {
                    if lower.len() == text.len() {
                        snippet_around(text, pos, needle.len())
                    } else {
                        snippet_around(&lower, pos, needle.len())
                    }
                })
            });
            if let Some(snippet) = found {
                hits.push(SearchHit {
                    id: record.id().to_string(),
                    kind: record.kind(),
                    title: record.title().map(str::to_string),
                    snippet,
                });
            }
        }
        Ok(hits)
    }

    pub fn usage(&self) -> Result<UsageReport> {
        self.monitor.measure()
    }

    /// Run a capacity check now.
    pub fn check_capacity(&self) -> Result<CapacityCheck> {
        self.monitor.monitor()
    }

    /// Run every eviction pass regardless of level. Returns bytes freed.
    pub fn run_eviction(&self) -> u64 {
        let freed = self.policy.run_all();
        if freed > 0 {
            self.events.emit(StorageEvent::EvictionRan { bytes_freed: freed });
        }
        freed
    }

    pub fn largest_items(&self, n: usize) -> Result<Vec<(String, u64)>> {
        self.monitor.largest_items(n)
    }

    pub fn version_history(&self) -> Result<Vec<VersionEntry>> {
        self.ledger.entries()
    }

    /// Fold both legacy registries into the canonical registry.
    pub async fn reconcile_legacy(&self) -> Result<MigrationReport> {
        self.legacy_swept.store(true, Ordering::SeqCst);
        self.reconciler.reconcile_all(self).await
    }
}

#[async_trait]
impl MigrationTarget for StorageFacade {
    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(read_entry(self.fast.as_ref(), id)?.is_some() || self.object_exists(id).await?)
    }

    async fn save_record(&self, record: Record) -> Result<()> {
        self.save(record).await.map(|_| ())
    }
}
