//! Large-capacity object store backends.
//!
//! Payloads are keyed by record id. Operations on the same id are serialized
//! through a per-id async mutex; different ids proceed concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use cortex_core::{Error, ObjectStore, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Per-id async locks.
#[derive(Debug, Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            // Drop locks nobody is holding or waiting on.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

fn transaction(op: &str, id: &str, e: std::io::Error) -> Error {
    Error::Transaction(format!("{op} {id}: {e}"))
}

/// Object store in a sharded directory tree.
///
/// Layout: `<root>/objects/<h0h1>/<h2h3>/<base64url(id)>.bin`, where `h` is the
/// BLAKE3 hex digest of the id.
#[derive(Debug)]
pub struct FilesystemObjectStore {
    root: PathBuf,
    opened: AtomicBool,
    locks: KeyLocks,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            opened: AtomicBool::new(false),
            locks: KeyLocks::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    /// Storage path of an id.
    pub fn object_path(&self, id: &str) -> PathBuf {
        let digest = blake3::hash(id.as_bytes()).to_hex();
        let hex = digest.as_str();
        self.objects_dir()
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(format!("{}.bin", URL_SAFE_NO_PAD.encode(id)))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::BackendUnavailable(format!(
                "object store at {} is not open",
                self.root.display()
            )))
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn open(&self) -> Result<()> {
        if self.opened.load(Ordering::Acquire) {
            return Ok(());
        }
        let dir = self.objects_dir();
        fs::create_dir_all(&dir).await.map_err(|e| {
            warn!(subsystem = "store", component = "object_store", path = %dir.display(), error = %e, "Object store open failed");
            Error::BackendUnavailable(format!("{}: {e}", dir.display()))
        })?;
        self.opened.store(true, Ordering::Release);
        info!(
            subsystem = "store",
            component = "object_store",
            op = "open",
            path = %self.root.display(),
            "Opened filesystem object store"
        );
        Ok(())
    }

    async fn put(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.locks.acquire(id).await;
        let path = self.object_path(id);
        debug!(subsystem = "store", component = "object_store", op = "put", record_id = id, size_bytes = bytes.len() as u64, path = %path.display(), "object_store: put");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| transaction("put", id, e))?;
        }

        // Atomic write: temp file + rename
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| transaction("put", id, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| transaction("put", id, e))?;
        file.sync_all()
            .await
            .map_err(|e| transaction("put", id, e))?;
        drop(file);

        fs::rename(&temp_path, &path).await.map_err(|e| {
            warn!(from = %temp_path.display(), to = %path.display(), error = %e, "object_store: rename failed");
            transaction("put", id, e)
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let _guard = self.locks.acquire(id).await;
        match fs::read(self.object_path(id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(transaction("get", id, e)),
        }
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.locks.acquire(id).await;
        match fs::remove_file(self.object_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(transaction("delete", id, e)),
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut ids = Vec::new();
        let mut pending = vec![(self.objects_dir(), 0usize)];

        while let Some((dir, depth)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(transaction("list", &dir.display().to_string(), e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| transaction("list", &dir.display().to_string(), e))?
            {
                let path = entry.path();
                if depth < 2 {
                    pending.push((path, depth + 1));
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                    continue;
                }
                let decoded = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| URL_SAFE_NO_PAD.decode(s).ok())
                    .and_then(|b| String::from_utf8(b).ok());
                match decoded {
                    Some(id) => ids.push(id),
                    None => warn!(path = %path.display(), "object_store: skipping unrecognised file"),
                }
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[derive(Debug, Default)]
struct MemoryObjects {
    objects: HashMap<String, Vec<u8>>,
    used: u64,
}

/// In-memory object store with an optional byte quota.
///
/// Can be built unavailable (open fails) or switched into a failing mode
/// where every write is rejected as a failed transaction.
#[derive(Debug)]
pub struct MemoryObjectStore {
    inner: Mutex<MemoryObjects>,
    quota_bytes: Option<u64>,
    available: bool,
    opened: AtomicBool,
    failing: AtomicBool,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryObjects::default()),
            quota_bytes: None,
            available: true,
            opened: AtomicBool::new(false),
            failing: AtomicBool::new(false),
        }
    }

    /// A store whose `open` always fails.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new()
        }
    }

    /// Make every subsequent put/delete fail with a transaction error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().used
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryObjects> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::BackendUnavailable("memory object store is not open".into()))
        }
    }

    fn ensure_writable(&self, op: &str, id: &str) -> Result<()> {
        self.ensure_open()?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Transaction(format!("{op} {id}: injected failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn open(&self) -> Result<()> {
        if !self.available {
            return Err(Error::BackendUnavailable(
                "memory object store configured as unavailable".into(),
            ));
        }
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    async fn put(&self, id: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_writable("put", id)?;
        let mut inner = self.lock();
        let old = inner.objects.get(id).map(|b| b.len() as u64).unwrap_or(0);
        let new_used = inner.used - old + bytes.len() as u64;
        if let Some(quota) = self.quota_bytes {
            if new_used > quota {
                return Err(Error::Transaction(format!(
                    "put {id}: quota exceeded ({new_used} > {quota} bytes)"
                )));
            }
        }
        inner.objects.insert(id.to_string(), bytes.to_vec());
        inner.used = new_used;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.lock().objects.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.ensure_writable("delete", id)?;
        let mut inner = self.lock();
        if let Some(old) = inner.objects.remove(id) {
            inner.used -= old.len() as u64;
        }
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut ids: Vec<String> = self.lock().objects.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_fs() -> (tempfile::TempDir, FilesystemObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path());
        store.open().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_fs_put_get_delete() {
        let (_dir, store) = open_fs().await;
        store.put("doc-1", b"hello").await.unwrap();
        assert_eq!(store.get("doc-1").await.unwrap(), Some(b"hello".to_vec()));
        assert!(store.exists("doc-1").await.unwrap());

        store.delete("doc-1").await.unwrap();
        assert_eq!(store.get("doc-1").await.unwrap(), None);
        // Deleting again is fine.
        store.delete("doc-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_open_is_idempotent() {
        let (_dir, store) = open_fs().await;
        store.put("a", b"1").await.unwrap();
        store.open().await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_fs_requires_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path());
        assert!(matches!(
            store.put("a", b"1").await,
            Err(Error::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_open_failure_is_backend_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let store = FilesystemObjectStore::new(&blocker);
        assert!(matches!(
            store.open().await,
            Err(Error::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_ids_with_path_characters() {
        let (_dir, store) = open_fs().await;
        let awkward = "../notes/2024: plan?";
        store.put(awkward, b"x").await.unwrap();
        store.put("plain", b"y").await.unwrap();

        let path = store.object_path(awkward);
        assert!(path.starts_with(store.root().join("objects")));
        assert_eq!(
            store.list_ids().await.unwrap(),
            vec![awkward.to_string(), "plain".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fs_overwrite_leaves_no_temp_file() {
        let (_dir, store) = open_fs().await;
        store.put("k", b"first").await.unwrap();
        store.put("k", b"second").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"second".to_vec()));
        assert!(!store.object_path("k").with_extension("tmp").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fs_same_key_writes_serialize() {
        let (_dir, store) = open_fs().await;
        let store = Arc::new(store);
        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.put("shared", &[i; 256]).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let bytes = store.get("shared").await.unwrap().unwrap();
        assert_eq!(bytes.len(), 256);
        assert!(bytes.iter().all(|b| *b == bytes[0]));
    }

    #[tokio::test]
    async fn test_memory_modes() {
        let unavailable = MemoryObjectStore::unavailable();
        assert!(matches!(
            unavailable.open().await,
            Err(Error::BackendUnavailable(_))
        ));

        let store = MemoryObjectStore::with_quota(10);
        store.open().await.unwrap();
        store.put("a", b"12345").await.unwrap();
        store.put("a", b"1234567890").await.unwrap();
        assert!(matches!(
            store.put("b", b"1").await,
            Err(Error::Transaction(_))
        ));
        assert_eq!(store.used_bytes(), 10);

        store.set_failing(true);
        assert!(matches!(
            store.delete("a").await,
            Err(Error::Transaction(_))
        ));
        store.set_failing(false);
        store.delete("a").await.unwrap();
        assert_eq!(store.list_ids().await.unwrap(), Vec::<String>::new());
    }
}
