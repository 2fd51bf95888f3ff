//! Reconciliation of the legacy registries into the canonical registry.
//!
//! Two registries were written by older releases:
//!
//! - `documents` (source A): a JSON array of uploaded documents with inline
//!   base64 images and an epoch-millisecond upload time.
//! - `visual_content_registry` (source B, the canonical format): a JSON object
//!   keyed by document id holding extracted visuals and an RFC 3339 timestamp.
//!
//! Both are parsed into [`RawLegacyRecord`] at one boundary, deduplicated per
//! owner id (latest timestamp wins, ties go to source B), migrated through a
//! [`MigrationTarget`] and only then removed from the legacy registries.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use cortex_core::{
    keys, Document, Error, EventBus, FastStore, Record, Result, StorageEvent, VisualContentItem,
};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, trace, warn};

use crate::writer::DurableWriter;

const DEFAULT_MIME: &str = "application/octet-stream";

// =============================================================================
// RAW FORMATS
// =============================================================================

/// Which legacy registry a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LegacySource {
    /// `documents`, the older format.
    SourceA,
    /// `visual_content_registry`, the canonical format.
    SourceB,
}

impl LegacySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceA => "source_a",
            Self::SourceB => "source_b",
        }
    }

    pub fn registry_key(&self) -> &'static str {
        match self {
            Self::SourceA => keys::LEGACY_DOCUMENTS_KEY,
            Self::SourceB => keys::LEGACY_VISUAL_KEY,
        }
    }
}

impl fmt::Display for LegacySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyImage {
    pub id: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Element of the `documents` array.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyDocument {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    /// Epoch milliseconds.
    pub uploaded_at: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub images: Vec<LegacyImage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyVisual {
    pub id: String,
    #[serde(rename = "type", default)]
    pub visual_type: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub extracted_text: Option<String>,
    #[serde(default)]
    pub analysis: BTreeMap<String, JsonValue>,
}

/// Value of one `visual_content_registry` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyVisualEntry {
    /// Falls back to the registry key when absent.
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub visuals: Vec<LegacyVisual>,
}

/// A legacy record in its original shape.
#[derive(Debug, Clone, PartialEq)]
pub enum RawLegacyRecord {
    SourceA(LegacyDocument),
    SourceB(LegacyVisualEntry),
}

impl RawLegacyRecord {
    pub fn source(&self) -> LegacySource {
        match self {
            Self::SourceA(_) => LegacySource::SourceA,
            Self::SourceB(_) => LegacySource::SourceB,
        }
    }

    pub fn owner_id(&self) -> &str {
        match self {
            Self::SourceA(doc) => &doc.id,
            Self::SourceB(entry) => &entry.document_id,
        }
    }

    /// Last-modified time; unrepresentable epoch values sort first.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::SourceA(doc) => {
                DateTime::from_timestamp_millis(doc.uploaded_at).unwrap_or(DateTime::<Utc>::MIN_UTC)
            }
            Self::SourceB(entry) => entry.updated_at,
        }
    }
}

/// A scanned legacy record.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedLegacy {
    pub owner_id: String,
    pub source: LegacySource,
    pub raw: RawLegacyRecord,
}

/// Canonical records produced from one legacy record.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedLegacy {
    pub owner_id: String,
    pub document: Option<Document>,
    pub visuals: Vec<VisualContentItem>,
}

/// Decode a base64 field, accepting `data:<mime>;base64,` URLs.
fn decode_binary(field: &str, encoded: &str) -> Result<Vec<u8>> {
    let body = match encoded.split_once(";base64,") {
        Some((prefix, body)) if prefix.starts_with("data:") => body,
        _ => encoded,
    };
    STANDARD
        .decode(body.trim())
        .map_err(|e| Error::Serialization(format!("{field}: invalid base64: {e}")))
}

fn data_url_mime(encoded: &str) -> Option<&str> {
    encoded
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
        .map(|(mime, _)| mime)
        .filter(|mime| !mime.is_empty())
}

/// Convert a legacy record into canonical records.
pub fn normalize(raw: &RawLegacyRecord) -> Result<NormalizedLegacy> {
    match raw {
        RawLegacyRecord::SourceA(doc) => {
            let uploaded = DateTime::from_timestamp_millis(doc.uploaded_at).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "document {}: uploadedAt {} is out of range",
                    doc.id, doc.uploaded_at
                ))
            })?;

            let mut document = Document::new(&doc.id, &doc.name, &doc.content);
            document.metadata = doc.metadata.clone();
            document.created_at = uploaded;
            document.updated_at = uploaded;

            let visuals = doc
                .images
                .iter()
                .map(|image| {
                    let payload = if image.data.is_empty() {
                        None
                    } else {
                        Some(decode_binary(&image.id, &image.data)?)
                    };
                    let mime_type = image
                        .mime_type
                        .clone()
                        .or_else(|| data_url_mime(&image.data).map(str::to_string))
                        .unwrap_or_else(|| DEFAULT_MIME.to_string());
                    Ok(VisualContentItem {
                        id: image.id.clone(),
                        document_id: doc.id.clone(),
                        mime_type,
                        payload,
                        thumbnail: None,
                        extracted_text: None,
                        analysis: BTreeMap::new(),
                        created_at: uploaded,
                        updated_at: uploaded,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(NormalizedLegacy {
                owner_id: doc.id.clone(),
                document: Some(document),
                visuals,
            })
        }
        RawLegacyRecord::SourceB(entry) => {
            let document = if entry.title.is_some() || entry.text.is_some() {
                let mut document = Document::new(
                    &entry.document_id,
                    entry.title.clone().unwrap_or_default(),
                    entry.text.clone().unwrap_or_default(),
                );
                document.metadata = entry.metadata.clone();
                document.created_at = entry.updated_at;
                document.updated_at = entry.updated_at;
                Some(document)
            } else {
                None
            };

            let visuals = entry
                .visuals
                .iter()
                .map(|visual| {
                    let payload = visual
                        .data
                        .as_deref()
                        .map(|d| decode_binary(&visual.id, d))
                        .transpose()?;
                    let thumbnail = visual
                        .thumbnail
                        .as_deref()
                        .map(|d| decode_binary(&visual.id, d))
                        .transpose()?;
                    let mime_type = visual
                        .data
                        .as_deref()
                        .and_then(data_url_mime)
                        .map(str::to_string)
                        .unwrap_or_else(|| DEFAULT_MIME.to_string());
                    let mut analysis = visual.analysis.clone();
                    if let Some(kind) = &visual.visual_type {
                        analysis
                            .entry("type".to_string())
                            .or_insert_with(|| JsonValue::String(kind.clone()));
                    }
                    Ok(VisualContentItem {
                        id: visual.id.clone(),
                        document_id: entry.document_id.clone(),
                        mime_type,
                        payload,
                        thumbnail,
                        extracted_text: visual.extracted_text.clone(),
                        analysis,
                        created_at: entry.updated_at,
                        updated_at: entry.updated_at,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(NormalizedLegacy {
                owner_id: entry.document_id.clone(),
                document,
                visuals,
            })
        }
    }
}

// =============================================================================
// MERGE
// =============================================================================

/// The record chosen for one owner id, plus the duplicates it replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct Winner {
    pub owner_id: String,
    pub record: ScannedLegacy,
    pub losers: Vec<ScannedLegacy>,
}

/// Whether `candidate` should replace `current` as the winner.
fn beats(candidate: &ScannedLegacy, current: &ScannedLegacy) -> bool {
    let (a, b) = (candidate.raw.timestamp(), current.raw.timestamp());
    a > b || (a == b && candidate.source == LegacySource::SourceB && current.source != LegacySource::SourceB)
}

/// The newest duplicate that still normalizes to a document.
fn newest_loser_with_document(losers: &[ScannedLegacy]) -> Option<NormalizedLegacy> {
    let mut ordered: Vec<&ScannedLegacy> = losers.iter().collect();
    ordered.sort_by_key(|loser| std::cmp::Reverse(loser.raw.timestamp()));
    ordered.into_iter().find_map(|loser| match normalize(&loser.raw) {
        Ok(normalized) if normalized.document.is_some() => Some(normalized),
        Ok(_) => None,
        Err(e) => {
            warn!(
                record_id = loser.owner_id.as_str(),
                legacy_source = loser.source.as_str(),
                error = %e,
                "legacy: duplicate could not be normalized, ignoring"
            );
            None
        }
    })
}

/// Collapse duplicates per owner id: latest timestamp wins, ties go to source B.
pub fn merge(scanned: Vec<ScannedLegacy>) -> BTreeMap<String, Winner> {
    let mut winners: BTreeMap<String, Winner> = BTreeMap::new();
    for item in scanned {
        match winners.get_mut(&item.owner_id) {
            None => {
                winners.insert(
                    item.owner_id.clone(),
                    Winner {
                        owner_id: item.owner_id.clone(),
                        record: item,
                        losers: Vec::new(),
                    },
                );
            }
            Some(winner) => {
                if beats(&item, &winner.record) {
                    let previous = std::mem::replace(&mut winner.record, item);
                    winner.losers.push(previous);
                } else {
                    winner.losers.push(item);
                }
            }
        }
    }
    winners
}

// =============================================================================
// MIGRATION
// =============================================================================

/// Where migrated records are written.
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Whether a canonical record with this id exists, without consulting legacy data.
    async fn contains(&self, id: &str) -> Result<bool>;

    /// Persist a canonical record.
    async fn save_record(&self, record: Record) -> Result<()>;
}

/// Result of migrating one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// At least one record was written.
    Migrated { records_written: usize },
    /// Every record was already canonical; only legacy cleanup ran.
    AlreadyPresent,
}

/// Summary of a full reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub scanned: usize,
    pub duplicates_collapsed: usize,
    pub migrated: Vec<String>,
    pub already_present: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Scans, merges and migrates the legacy registries.
#[derive(Clone)]
pub struct LegacyReconciler {
    store: Arc<dyn FastStore>,
    writer: DurableWriter,
    events: EventBus,
}

impl LegacyReconciler {
    pub fn new(store: Arc<dyn FastStore>, writer: DurableWriter, events: EventBus) -> Self {
        Self {
            store,
            writer,
            events,
        }
    }

    /// Whether either legacy registry is present.
    pub fn has_legacy_data(&self) -> Result<bool> {
        Ok(self.store.get(keys::LEGACY_DOCUMENTS_KEY)?.is_some()
            || self.store.get(keys::LEGACY_VISUAL_KEY)?.is_some())
    }

    /// Parse both registries. Malformed entries are skipped with a warning.
    pub fn scan_legacy(&self) -> Result<Vec<ScannedLegacy>> {
        let mut scanned = Vec::new();

        if let Some(value) = self.read_registry(LegacySource::SourceA)? {
            match value {
                JsonValue::Array(items) => {
                    for (index, item) in items.into_iter().enumerate() {
                        match serde_json::from_value::<LegacyDocument>(item) {
                            Ok(doc) if !doc.id.trim().is_empty() => scanned.push(ScannedLegacy {
                                owner_id: doc.id.clone(),
                                source: LegacySource::SourceA,
                                raw: RawLegacyRecord::SourceA(doc),
                            }),
                            Ok(_) => warn!(legacy_source = "source_a", index, "legacy: skipping document without id"),
                            Err(e) => warn!(legacy_source = "source_a", index, error = %e, "legacy: skipping malformed document"),
                        }
                    }
                }
                _ => warn!(legacy_source = "source_a", "legacy: documents registry is not an array, skipping"),
            }
        }

        if let Some(value) = self.read_registry(LegacySource::SourceB)? {
            match value {
                JsonValue::Object(entries) => {
                    for (key, item) in entries {
                        match serde_json::from_value::<LegacyVisualEntry>(item) {
                            Ok(mut entry) => {
                                if entry.document_id.trim().is_empty() {
                                    entry.document_id = key.clone();
                                }
                                scanned.push(ScannedLegacy {
                                    owner_id: entry.document_id.clone(),
                                    source: LegacySource::SourceB,
                                    raw: RawLegacyRecord::SourceB(entry),
                                });
                            }
                            Err(e) => warn!(legacy_source = "source_b", key = key.as_str(), error = %e, "legacy: skipping malformed visual entry"),
                        }
                    }
                }
                _ => warn!(legacy_source = "source_b", "legacy: visual registry is not an object, skipping"),
            }
        }

        trace!(record_count = scanned.len(), "legacy: scan complete");
        Ok(scanned)
    }

    fn read_registry(&self, source: LegacySource) -> Result<Option<JsonValue>> {
        let raw = match self.store.get(source.registry_key())? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(legacy_source = source.as_str(), error = %e, "legacy: registry is not valid JSON, skipping");
                Ok(None)
            }
        }
    }

    /// Migrate one merged owner and clear its legacy entries.
    pub async fn migrate(
        &self,
        target: &dyn MigrationTarget,
        winner: &Winner,
    ) -> Result<MigrationOutcome> {
        let mut normalized = normalize(&winner.record.raw)?;

        // A visual-only winner takes the document from its newest duplicate.
        if normalized.document.is_none() {
            if let Some(fallback) = newest_loser_with_document(&winner.losers) {
                let taken: HashSet<String> =
                    normalized.visuals.iter().map(|v| v.id.clone()).collect();
                normalized.visuals.extend(
                    fallback
                        .visuals
                        .into_iter()
                        .filter(|v| !taken.contains(&v.id)),
                );
                normalized.document = fallback.document;
                trace!(
                    record_id = winner.owner_id.as_str(),
                    "legacy: document taken from an older duplicate"
                );
            }
        }

        // Referential check: visuals need an owning document.
        if !normalized.visuals.is_empty()
            && normalized.document.is_none()
            && !target.contains(&normalized.owner_id).await?
        {
            return Err(Error::InvalidInput(format!(
                "{} orphan visual(s): document {} does not exist",
                normalized.visuals.len(),
                normalized.owner_id
            )));
        }

        let mut pending: Vec<Record> = Vec::new();
        if let Some(document) = normalized.document {
            pending.push(Record::Document(document));
        }
        pending.extend(normalized.visuals.into_iter().map(Record::Visual));

        let mut written = 0;
        for record in pending {
            // Existence check: canonical records are never overwritten.
            if target.contains(record.id()).await? {
                trace!(record_id = record.id(), "legacy: already canonical, skipping");
                continue;
            }
            target.save_record(record).await?;
            written += 1;
        }

        self.remove_owner(&winner.owner_id)?;

        debug!(
            subsystem = "store",
            component = "legacy",
            op = "migrate",
            record_id = winner.owner_id.as_str(),
            legacy_source = winner.record.source.as_str(),
            records_written = written,
            duplicates = winner.losers.len(),
            "Legacy owner reconciled"
        );

        Ok(if written == 0 {
            MigrationOutcome::AlreadyPresent
        } else {
            MigrationOutcome::Migrated {
                records_written: written,
            }
        })
    }

    /// Remove every entry for `owner_id` from both legacy registries.
    fn remove_owner(&self, owner_id: &str) -> Result<()> {
        if let Some(JsonValue::Array(items)) = self.read_registry(LegacySource::SourceA)? {
            let before = items.len();
            let kept: Vec<JsonValue> = items
                .into_iter()
                .filter(|item| item.get("id").and_then(JsonValue::as_str) != Some(owner_id))
                .collect();
            if kept.len() != before {
                self.write_registry(LegacySource::SourceA, JsonValue::Array(kept))?;
            }
        }

        if let Some(JsonValue::Object(entries)) = self.read_registry(LegacySource::SourceB)? {
            let before = entries.len();
            let kept: Map<String, JsonValue> = entries
                .into_iter()
                .filter(|(key, item)| {
                    key != owner_id
                        && item.get("documentId").and_then(JsonValue::as_str) != Some(owner_id)
                })
                .collect();
            if kept.len() != before {
                self.write_registry(LegacySource::SourceB, JsonValue::Object(kept))?;
            }
        }
        Ok(())
    }

    fn write_registry(&self, source: LegacySource, value: JsonValue) -> Result<()> {
        let empty = match &value {
            JsonValue::Array(items) => items.is_empty(),
            JsonValue::Object(entries) => entries.is_empty(),
            _ => false,
        };
        if empty {
            self.store.remove(source.registry_key())
        } else {
            self.writer
                .write_reclaiming(source.registry_key(), &serde_json::to_string(&value)?)
                .map(|_| ())
        }
    }

    /// Reconcile every legacy owner. Failures are isolated per owner.
    pub async fn reconcile_all(&self, target: &dyn MigrationTarget) -> Result<MigrationReport> {
        let scanned = self.scan_legacy()?;
        let mut report = MigrationReport {
            scanned: scanned.len(),
            ..MigrationReport::default()
        };
        let winners = merge(scanned);
        report.duplicates_collapsed = winners.values().map(|w| w.losers.len()).sum();

        for winner in winners.values() {
            self.migrate_reporting(target, winner, &mut report).await;
        }

        info!(
            subsystem = "store",
            component = "legacy",
            op = "reconcile_all",
            record_count = report.scanned,
            migrated = report.migrated.len(),
            already_present = report.already_present.len(),
            failed = report.failed.len(),
            "Legacy reconciliation complete"
        );
        Ok(report)
    }

    /// Reconcile only the entries owned by `owner_id`.
    pub async fn reconcile_owner(
        &self,
        target: &dyn MigrationTarget,
        owner_id: &str,
    ) -> Result<Option<MigrationOutcome>> {
        let scanned: Vec<ScannedLegacy> = self
            .scan_legacy()?
            .into_iter()
            .filter(|s| s.owner_id == owner_id)
            .collect();
        let winners = merge(scanned);
        let winner = match winners.get(owner_id) {
            Some(winner) => winner,
            None => return Ok(None),
        };

        match self.migrate(target, winner).await {
            Ok(outcome) => {
                self.emit_outcome(owner_id, &Ok(outcome));
                Ok(Some(outcome))
            }
            Err(e) => {
                self.emit_outcome(owner_id, &Err(e.to_string()));
                Err(e)
            }
        }
    }

    async fn migrate_reporting(
        &self,
        target: &dyn MigrationTarget,
        winner: &Winner,
        report: &mut MigrationReport,
    ) {
        match self.migrate(target, winner).await {
            Ok(outcome) => {
                match outcome {
                    MigrationOutcome::Migrated { .. } => report.migrated.push(winner.owner_id.clone()),
                    MigrationOutcome::AlreadyPresent => {
                        report.already_present.push(winner.owner_id.clone())
                    }
                }
                self.emit_outcome(&winner.owner_id, &Ok(outcome));
            }
            Err(e) => {
                warn!(
                    subsystem = "store",
                    component = "legacy",
                    record_id = winner.owner_id.as_str(),
                    error = %e,
                    "Legacy owner failed to migrate, legacy entries kept"
                );
                self.emit_outcome(&winner.owner_id, &Err(e.to_string()));
                report.failed.push((winner.owner_id.clone(), e.to_string()));
            }
        }
    }

    fn emit_outcome(&self, owner_id: &str, outcome: &std::result::Result<MigrationOutcome, String>) {
        match outcome {
            Ok(MigrationOutcome::Migrated { .. }) => self.events.emit(StorageEvent::LegacyMigrated {
                owner_id: owner_id.to_string(),
            }),
            Ok(MigrationOutcome::AlreadyPresent) => {}
            Err(error) => self.events.emit(StorageEvent::LegacyMigrationFailed {
                owner_id: owner_id.to_string(),
                error: error.clone(),
            }),
        }
    }

    /// Owner ids currently present in either registry.
    pub fn legacy_owner_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .scan_legacy()?
            .into_iter()
            .map(|s| s.owner_id)
            .collect())
    }
}
