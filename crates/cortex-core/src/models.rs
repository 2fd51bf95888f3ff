//! Data models for records persisted by the cortex storage engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Id of the singleton settings record.
pub const SETTINGS_ID: &str = "settings";

// =============================================================================
// RECORD KINDS
// =============================================================================

/// Discriminant of a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Document,
    Visual,
    Settings,
    Note,
    Idea,
    Chat,
}

impl RecordKind {
    /// Every kind, in listing order.
    pub const ALL: [RecordKind; 6] = [
        RecordKind::Document,
        RecordKind::Visual,
        RecordKind::Settings,
        RecordKind::Note,
        RecordKind::Idea,
        RecordKind::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Visual => "visual",
            Self::Settings => "settings",
            Self::Note => "note",
            Self::Idea => "idea",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "document" | "documents" => Ok(Self::Document),
            "visual" | "visuals" => Ok(Self::Visual),
            "settings" => Ok(Self::Settings),
            "note" | "notes" => Ok(Self::Note),
            "idea" | "ideas" => Ok(Self::Idea),
            "chat" | "chats" => Ok(Self::Chat),
            other => Err(Error::InvalidInput(format!("unknown record kind: {other}"))),
        }
    }
}

// =============================================================================
// RECORD VARIANTS
// =============================================================================

/// A chunk of a document's text with its optional embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub index: u32,
    pub text: String,
    /// Derived; dropped under capacity pressure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// An uploaded document and its extracted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, JsonValue>,
    /// Derived; dropped under capacity pressure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Create a document with the current time as both timestamps.
    pub fn new(id: impl Into<String>, title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
            embedding: None,
            chunks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// An image or other visual extracted from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualContentItem {
    pub id: String,
    /// Owning document id.
    pub document_id: String,
    pub mime_type: String,
    #[serde(
        default,
        with = "base64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload: Option<Vec<u8>>,
    #[serde(
        default,
        with = "base64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub thumbnail: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(default)]
    pub analysis: BTreeMap<String, JsonValue>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Singleton application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsBlob {
    pub id: String,
    #[serde(default)]
    pub values: BTreeMap<String, JsonValue>,
    #[serde(
        default,
        with = "base64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub avatar: Option<Vec<u8>>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for SettingsBlob {
    fn default() -> Self {
        Self {
            id: SETTINGS_ID.to_string(),
            values: BTreeMap::new(),
            avatar: None,
            updated_at: Utc::now(),
        }
    }
}

/// A user-authored note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// A captured idea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Idea {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// One message of a chat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Append-only chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// A logical entity persisted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Document(Document),
    Visual(VisualContentItem),
    Settings(SettingsBlob),
    Note(Note),
    Idea(Idea),
    Chat(ChatSession),
}

impl Record {
    pub fn id(&self) -> &str {
        match self {
            Record::Document(d) => &d.id,
            Record::Visual(v) => &v.id,
            Record::Settings(s) => &s.id,
            Record::Note(n) => &n.id,
            Record::Idea(i) => &i.id,
            Record::Chat(c) => &c.id,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Document(_) => RecordKind::Document,
            Record::Visual(_) => RecordKind::Visual,
            Record::Settings(_) => RecordKind::Settings,
            Record::Note(_) => RecordKind::Note,
            Record::Idea(_) => RecordKind::Idea,
            Record::Chat(_) => RecordKind::Chat,
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Record::Document(d) => d.updated_at,
            Record::Visual(v) => v.updated_at,
            Record::Settings(s) => s.updated_at,
            Record::Note(n) => n.updated_at,
            Record::Idea(i) => i.updated_at,
            Record::Chat(c) => c.updated_at,
        }
    }

    /// Human-facing title, if the kind has one.
    pub fn title(&self) -> Option<&str> {
        match self {
            Record::Document(d) => Some(&d.title),
            Record::Note(n) => Some(&n.title),
            Record::Idea(i) => Some(&i.title),
            Record::Chat(c) => Some(&c.title),
            Record::Visual(_) | Record::Settings(_) => None,
        }
    }

    /// Text fields scanned by full-text search.
    pub fn searchable_text(&self) -> Vec<&str> {
        match self {
            Record::Document(d) => vec![d.title.as_str(), d.content.as_str()],
            Record::Visual(v) => v.extracted_text.as_deref().into_iter().collect(),
            Record::Settings(_) => Vec::new(),
            Record::Note(n) => {
                let mut fields = vec![n.title.as_str(), n.content.as_str()];
                fields.extend(n.tags.iter().map(String::as_str));
                fields
            }
            Record::Idea(i) => {
                let mut fields = vec![i.title.as_str(), i.description.as_str()];
                fields.extend(i.keywords.iter().map(String::as_str));
                fields
            }
            Record::Chat(c) => c.messages.iter().map(|m| m.content.as_str()).collect(),
        }
    }

    /// Reject records that can never be stored.
    pub fn validate(&self) -> Result<()> {
        if self.id().trim().is_empty() {
            return Err(Error::InvalidInput("record id must not be empty".into()));
        }
        match self {
            Record::Settings(s) if s.id != SETTINGS_ID => Err(Error::InvalidInput(format!(
                "settings record must use id '{SETTINGS_ID}', got '{}'",
                s.id
            ))),
            Record::Visual(v) if v.document_id.trim().is_empty() => Err(Error::InvalidInput(
                format!("visual item {} has no owning document", v.id),
            )),
            _ => Ok(()),
        }
    }

    /// Serialize to the canonical JSON byte form.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a record, surfacing malformed input as [`Error::Serialization`].
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// =============================================================================
// VERSION HISTORY
// =============================================================================

/// Change recorded in a [`VersionEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionAction {
    Create,
    Update,
    Delete,
}

impl fmt::Display for VersionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// An append-only history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub entity_kind: RecordKind,
    pub entity_id: String,
    pub action: VersionAction,
    /// Serialized record, omitted for large records and deletions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

impl VersionEntry {
    pub fn new(
        entity_kind: RecordKind,
        entity_id: impl Into<String>,
        action: VersionAction,
        snapshot: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            entity_kind,
            entity_id: entity_id.into(),
            action,
            snapshot,
        }
    }
}

// =============================================================================
// CAPACITY
// =============================================================================

/// Snapshot of fast-store usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub bytes_used: u64,
    pub capacity_bytes: u64,
    pub item_sizes: BTreeMap<String, u64>,
}

impl UsageReport {
    /// Keys ordered by size, largest first.
    pub fn largest(&self, n: usize) -> Vec<(&str, u64)> {
        let mut items: Vec<(&str, u64)> = self
            .item_sizes
            .iter()
            .map(|(k, v)| (k.as_str(), *v))
            .collect();
        items.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        items.truncate(n);
        items
    }

    pub fn percent_used(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        self.bytes_used as f64 * 100.0 / self.capacity_bytes as f64
    }
}

/// Classification of fast-store usage against the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityLevel {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for CapacityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

// =============================================================================
// EXPORT / IMPORT
// =============================================================================

/// Full JSON export bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub notes: Vec<Note>,
    pub ideas: Vec<Idea>,
    pub version_history: Vec<VersionEntry>,
    pub export_date: DateTime<Utc>,
    pub version: String,
}

/// Counts of records applied by an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub notes_count: usize,
    pub ideas_count: usize,
}

// =============================================================================
// SERDE HELPERS
// =============================================================================

/// Optional binary fields encoded as standard base64 strings.
pub mod base64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_visual() -> VisualContentItem {
        VisualContentItem {
            id: "img-1".into(),
            document_id: "doc-1".into(),
            mime_type: "image/png".into(),
            payload: Some(vec![0x89, 0x50, 0x4E, 0x47]),
            thumbnail: None,
            extracted_text: Some("caption".into()),
            analysis: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_tagged_by_kind() {
        let record = Record::Note(Note {
            id: "n1".into(),
            title: "Title".into(),
            content: "Body".into(),
            tags: vec!["a".into()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        let json: JsonValue = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "note");
        assert_eq!(json["id"], "n1");
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn test_binary_fields_are_base64() {
        let record = Record::Visual(sample_visual());
        let json: JsonValue = serde_json::to_value(&record).unwrap();
        assert_eq!(json["payload"], "iVBORw==");
        assert!(json.get("thumbnail").is_none());

        let back: Record = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_stripped_visual_still_deserializes() {
        let json = r#"{"kind":"visual","id":"img-1","documentId":"doc-1","mimeType":"image/png"}"#;
        let record = Record::from_json_bytes(json.as_bytes()).unwrap();
        match record {
            Record::Visual(v) => {
                assert!(v.payload.is_none());
                assert!(v.analysis.is_empty());
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_malformed_record_is_serialization_error() {
        let err = Record::from_json_bytes(b"{\"kind\":\"spaceship\",\"id\":\"x\"}").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let record = Record::Document(Document::new("  ", "t", "c"));
        assert!(matches!(record.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_validate_settings_singleton() {
        let mut settings = SettingsBlob::default();
        assert!(Record::Settings(settings.clone()).validate().is_ok());
        settings.id = "other".into();
        assert!(Record::Settings(settings).validate().is_err());
    }

    #[test]
    fn test_record_kind_from_str() {
        assert_eq!("notes".parse::<RecordKind>().unwrap(), RecordKind::Note);
        assert_eq!("Document".parse::<RecordKind>().unwrap(), RecordKind::Document);
        assert!("spaceship".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_usage_report_largest() {
        let mut report = UsageReport {
            bytes_used: 60,
            capacity_bytes: 100,
            item_sizes: BTreeMap::new(),
        };
        report.item_sizes.insert("a".into(), 10);
        report.item_sizes.insert("b".into(), 30);
        report.item_sizes.insert("c".into(), 20);
        assert_eq!(report.largest(2), vec![("b", 30), ("c", 20)]);
        assert!((report.percent_used() - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_searchable_text_includes_tags() {
        let record = Record::Note(Note {
            id: "n1".into(),
            title: "Title".into(),
            content: "Body".into(),
            tags: vec!["rust".into()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
        assert_eq!(record.searchable_text(), vec!["Title", "Body", "rust"]);
    }
}
