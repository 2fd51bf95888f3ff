//! Folder-backed export and bundle import parsing.
//!
//! Folder layout under the granted target:
//!
//! ```text
//! notes/notes.json           canonical note array
//! notes/<title>.md           one markdown file per note
//! ideas/ideas.json           canonical idea array
//! ideas/<title>.md           one markdown file per idea
//! exports/cortex-export-<timestamp>.json
//! backups/cortex-backup-<timestamp>.json
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cortex_core::{
    sanitize_title, Error, ExportBundle, ExportTarget, ExternalTargetProvider, Idea, Note, Result,
};
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const NOTES_DIR: &str = "notes";
const IDEAS_DIR: &str = "ideas";
const EXPORTS_DIR: &str = "exports";
const BACKUPS_DIR: &str = "backups";

// =============================================================================
// TARGET PROVIDERS
// =============================================================================

/// Grants a fixed directory, creating it on request.
#[derive(Debug, Clone)]
pub struct DirectoryTargetProvider {
    root: PathBuf,
}

impl DirectoryTargetProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ExternalTargetProvider for DirectoryTargetProvider {
    fn is_available(&self) -> bool {
        true
    }

    async fn request_target(&self) -> Result<ExportTarget> {
        fs::create_dir_all(&self.root).await?;
        Ok(ExportTarget::new(&self.root))
    }
}

/// For environments without folder access.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedTargetProvider;

#[async_trait]
impl ExternalTargetProvider for UnsupportedTargetProvider {
    fn is_available(&self) -> bool {
        false
    }

    async fn request_target(&self) -> Result<ExportTarget> {
        Err(Error::BackendUnavailable(
            "folder export is not supported here".into(),
        ))
    }
}

// =============================================================================
// IMPORT PARSING
// =============================================================================

/// Records parsed from an import bundle, validated before anything is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedImport {
    pub notes: Vec<Note>,
    pub ideas: Vec<Idea>,
}

fn parse_array<T: serde::de::DeserializeOwned>(field: &str, value: JsonValue) -> Result<Vec<T>> {
    match value {
        JsonValue::Array(_) => serde_json::from_value(value)
            .map_err(|e| Error::Serialization(format!("{field}: {e}"))),
        other => Err(Error::Serialization(format!(
            "{field}: expected an array, found {}",
            json_type(&other)
        ))),
    }
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Validate and parse an import bundle.
///
/// `{}` parses to nothing. A non-empty object without `notes` or `ideas` is
/// rejected; a bundle with only one of them imports the other as empty.
pub fn parse_import_bundle(bytes: &[u8]) -> Result<ParsedImport> {
    let value: JsonValue = serde_json::from_slice(bytes)?;
    let mut object = match value {
        JsonValue::Object(object) => object,
        other => {
            return Err(Error::InvalidInput(format!(
                "import bundle must be a JSON object, found {}",
                json_type(&other)
            )))
        }
    };
    if object.is_empty() {
        return Ok(ParsedImport::default());
    }

    let notes = object.remove("notes").filter(|v| !v.is_null());
    let ideas = object.remove("ideas").filter(|v| !v.is_null());
    if notes.is_none() && ideas.is_none() {
        return Err(Error::InvalidInput(
            "import bundle contains neither notes nor ideas".into(),
        ));
    }

    Ok(ParsedImport {
        notes: notes.map(|v| parse_array("notes", v)).transpose()?.unwrap_or_default(),
        ideas: ideas.map(|v| parse_array("ideas", v)).transpose()?.unwrap_or_default(),
    })
}

// =============================================================================
// MARKDOWN
// =============================================================================

fn yaml_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s.replace('"', "'")))
}

fn yaml_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|i| yaml_string(i)).collect();
    format!("[{}]", quoted.join(", "))
}

fn front_matter(
    id: &str,
    title: &str,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    list_name: &str,
    list: &[String],
) -> String {
    format!(
        "---\nid: {}\ntitle: {}\ncreated: {}\nupdated: {}\n{}: {}\n---\n",
        yaml_string(id),
        yaml_string(title),
        created.to_rfc3339(),
        updated.to_rfc3339(),
        list_name,
        yaml_list(list)
    )
}

pub fn note_markdown(note: &Note) -> String {
    let mut out = front_matter(
        &note.id,
        &note.title,
        note.created_at,
        note.updated_at,
        "tags",
        &note.tags,
    );
    if !note.title.is_empty() {
        out.push_str(&format!("\n# {}\n", note.title));
    }
    out.push('\n');
    out.push_str(&note.content);
    if !note.content.ends_with('\n') {
        out.push('\n');
    }
    out
}

pub fn idea_markdown(idea: &Idea) -> String {
    let mut out = front_matter(
        &idea.id,
        &idea.title,
        idea.created_at,
        idea.updated_at,
        "keywords",
        &idea.keywords,
    );
    if !idea.title.is_empty() {
        out.push_str(&format!("\n# {}\n", idea.title));
    }
    out.push('\n');
    out.push_str(&idea.description);
    if !idea.description.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Unique markdown filename for a title within one directory.
fn unique_file_name(title: &str, id: &str, used: &mut HashSet<String>) -> String {
    let stem = sanitize_title(title, &sanitize_title(id, "untitled"));
    let mut name = format!("{stem}.md");
    if used.contains(&name) {
        name = format!("{stem}-{}.md", sanitize_title(id, "dup"));
    }
    let mut n = 2;
    while used.contains(&name) {
        name = format!("{stem}-{n}.md");
        n += 1;
    }
    used.insert(name.clone());
    name
}

fn timestamp_for_file(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string()
}

// =============================================================================
// FOLDER STORE
// =============================================================================

/// Files written by an export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Mirror of notes and ideas into a user-granted folder.
pub struct FolderExportStore {
    provider: Arc<dyn ExternalTargetProvider>,
    target: Mutex<Option<ExportTarget>>,
}

impl FolderExportStore {
    pub fn new(provider: Arc<dyn ExternalTargetProvider>) -> Self {
        Self {
            provider,
            target: Mutex::new(None),
        }
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_available()
    }

    fn current_target(&self) -> Option<ExportTarget> {
        self.target
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Ask the provider for a folder, remembering the grant.
    pub async fn select_target(&self) -> Result<ExportTarget> {
        if let Some(target) = self.current_target() {
            return Ok(target);
        }
        if !self.provider.is_available() {
            return Err(Error::BackendUnavailable(
                "no external folder provider available".into(),
            ));
        }
        let target = match self.provider.request_target().await {
            Ok(target) => target,
            Err(Error::UserCancelled) => {
                info!(subsystem = "store", component = "export", "Folder selection cancelled by user");
                return Err(Error::UserCancelled);
            }
            Err(e) => return Err(e),
        };
        *self.target.lock().unwrap_or_else(|p| p.into_inner()) = Some(target.clone());
        info!(
            subsystem = "store",
            component = "export",
            path = %target.root.display(),
            "Export folder selected"
        );
        Ok(target)
    }

    /// Write the full folder mirror of `bundle`.
    pub async fn export_all(&self, bundle: &ExportBundle) -> Result<ExportReport> {
        let target = self.select_target().await?;
        let root = target.root.clone();
        let mut report = ExportReport {
            root: root.clone(),
            files: Vec::new(),
        };

        let notes_dir = root.join(NOTES_DIR);
        let ideas_dir = root.join(IDEAS_DIR);
        let exports_dir = root.join(EXPORTS_DIR);
        for dir in [&notes_dir, &ideas_dir, &exports_dir] {
            fs::create_dir_all(dir).await?;
        }

        let path = notes_dir.join("notes.json");
        write_atomic(&path, &serde_json::to_vec_pretty(&bundle.notes)?).await?;
        report.files.push(path);

        let path = ideas_dir.join("ideas.json");
        write_atomic(&path, &serde_json::to_vec_pretty(&bundle.ideas)?).await?;
        report.files.push(path);

        let mut used = HashSet::new();
        for note in &bundle.notes {
            let path = notes_dir.join(unique_file_name(&note.title, &note.id, &mut used));
            write_atomic(&path, note_markdown(note).as_bytes()).await?;
            report.files.push(path);
        }

        let mut used = HashSet::new();
        for idea in &bundle.ideas {
            let path = ideas_dir.join(unique_file_name(&idea.title, &idea.id, &mut used));
            write_atomic(&path, idea_markdown(idea).as_bytes()).await?;
            report.files.push(path);
        }

        // Renamed or deleted records leave markdown behind.
        let written: HashSet<PathBuf> = report.files.iter().cloned().collect();
        let pruned = prune_markdown(&notes_dir, &written).await?
            + prune_markdown(&ideas_dir, &written).await?;

        let path = exports_dir.join(format!(
            "cortex-export-{}.json",
            timestamp_for_file(bundle.export_date)
        ));
        write_atomic(&path, &serde_json::to_vec_pretty(bundle)?).await?;
        report.files.push(path);

        info!(
            subsystem = "store",
            component = "export",
            op = "export_all",
            path = %root.display(),
            notes = bundle.notes.len(),
            ideas = bundle.ideas.len(),
            record_count = report.files.len(),
            pruned,
            "Folder export complete"
        );
        Ok(report)
    }

    /// Write a timestamped bundle into `backups/`.
    pub async fn write_backup(&self, bundle: &ExportBundle) -> Result<PathBuf> {
        let target = self.select_target().await?;
        let dir = target.root.join(BACKUPS_DIR);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!(
            "cortex-backup-{}.json",
            timestamp_for_file(bundle.export_date)
        ));
        write_atomic(&path, &serde_json::to_vec_pretty(bundle)?).await?;
        debug!(subsystem = "store", component = "export", path = %path.display(), "Backup written");
        Ok(path)
    }

    /// Read the canonical arrays back as an import bundle.
    pub async fn read_folder_bundle(&self) -> Result<Vec<u8>> {
        let target = self.select_target().await?;
        let mut bundle = serde_json::Map::new();
        for (field, dir, file) in [
            ("notes", NOTES_DIR, "notes.json"),
            ("ideas", IDEAS_DIR, "ideas.json"),
        ] {
            let path = target.root.join(dir).join(file);
            match fs::read(&path).await {
                Ok(bytes) => {
                    let value: JsonValue = serde_json::from_slice(&bytes)?;
                    bundle.insert(field.to_string(), value);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "export: canonical file missing, treating as absent");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(serde_json::to_vec(&JsonValue::Object(bundle))?)
    }
}

/// Remove `.md` files in `dir` that are not in `written`.
async fn prune_markdown(dir: &Path, written: &HashSet<PathBuf>) -> Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md")
            || written.contains(&path)
            || !entry.file_type().await?.is_file()
        {
            continue;
        }
        fs::remove_file(&path).await?;
        debug!(path = %path.display(), "export: removed stale markdown");
        removed += 1;
    }
    Ok(removed)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp_path, path).await.map_err(|e| {
        warn!(from = %temp_path.display(), to = %path.display(), error = %e, "export: rename failed");
        e
    })?;
    Ok(())
}
