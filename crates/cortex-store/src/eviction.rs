//! Size-reducing eviction passes over the fast store.
//!
//! Each pass rewrites fast-store values in place, only when it actually
//! shrinks them, so running a pass again frees nothing. Values that do not
//! parse, or lack the fields a pass looks for, are skipped.

use std::sync::Arc;

use cortex_core::{entry_size, keys, EvictionPassKind, FastStore, StorageConfig};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::capacity::measure_bytes;

/// Ordered eviction passes bound to a fast store.
#[derive(Clone)]
pub struct EvictionPolicy {
    store: Arc<dyn FastStore>,
    passes: Vec<EvictionPassKind>,
    history_keep: usize,
    avatar_max_bytes: usize,
}

impl EvictionPolicy {
    pub fn new(store: Arc<dyn FastStore>, config: &StorageConfig) -> Self {
        Self {
            store,
            passes: config.eviction_passes.clone(),
            history_keep: config.history_keep,
            avatar_max_bytes: config.avatar_max_bytes,
        }
    }

    pub fn passes(&self) -> &[EvictionPassKind] {
        &self.passes
    }

    /// Run every configured pass in order. Returns bytes freed.
    pub fn run_all(&self) -> u64 {
        let freed: u64 = self.passes.iter().map(|pass| self.run_pass(*pass)).sum();
        debug!(
            subsystem = "store",
            component = "eviction",
            op = "run_all",
            bytes_freed = freed,
            "Eviction passes complete"
        );
        freed
    }

    /// Run passes in order, stopping once usage is below `target_bytes`.
    pub fn run_until(&self, target_bytes: u64) -> u64 {
        let mut freed = 0;
        for pass in &self.passes {
            match measure_bytes(self.store.as_ref()) {
                Ok(used) if used < target_bytes => {
                    debug!(
                        subsystem = "store",
                        component = "eviction",
                        bytes_used = used,
                        target_bytes,
                        "Usage below target, stopping eviction early"
                    );
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "eviction: could not measure usage"),
            }
            freed += self.run_pass(*pass);
        }
        freed
    }

    /// Run a single pass. Returns bytes freed.
    pub fn run_pass(&self, pass: EvictionPassKind) -> u64 {
        let freed = match pass {
            EvictionPassKind::StripBinary => self.strip_binary(),
            EvictionPassKind::TruncateHistory => self.truncate_history(),
            EvictionPassKind::DropEmbeddings => self.drop_embeddings(),
        };
        debug!(
            subsystem = "store",
            component = "eviction",
            op = pass.as_str(),
            bytes_freed = freed,
            "Eviction pass finished"
        );
        freed
    }

    fn strip_binary(&self) -> u64 {
        let avatar_max = self.avatar_max_bytes;
        self.rewrite_registry(|record| match kind_of(record) {
            Some("visual") => {
                let obj = match record.as_object_mut() {
                    Some(obj) => obj,
                    None => return false,
                };
                let payload = obj.remove("payload").is_some();
                let thumbnail = obj.remove("thumbnail").is_some();
                payload || thumbnail
            }
            Some("settings") => {
                let oversized = record
                    .get("avatar")
                    .and_then(Value::as_str)
                    .map(|b64| decoded_len(b64) > avatar_max)
                    .unwrap_or(false);
                if oversized {
                    if let Some(obj) = record.as_object_mut() {
                        obj.remove("avatar");
                    }
                }
                oversized
            }
            _ => false,
        })
    }

    fn truncate_history(&self) -> u64 {
        let keep = self.history_keep;
        let mut freed = self.rewrite_registry(|record| {
            if kind_of(record) != Some("chat") {
                return false;
            }
            match record.get_mut("messages").and_then(Value::as_array_mut) {
                Some(messages) => keep_last(messages, keep),
                None => false,
            }
        });

        freed += self.rewrite_key(keys::VERSIONS_KEY, |value| match value.as_array_mut() {
            Some(entries) => keep_last(entries, keep),
            None => false,
        });
        freed
    }

    fn drop_embeddings(&self) -> u64 {
        self.rewrite_registry(|record| {
            if kind_of(record) != Some("document") {
                return false;
            }
            let mut changed = false;
            if let Some(obj) = record.as_object_mut() {
                changed |= obj.remove("embedding").is_some();
                if let Some(chunks) = obj.get_mut("chunks").and_then(Value::as_array_mut) {
                    for chunk in chunks.iter_mut().filter_map(Value::as_object_mut) {
                        changed |= chunk.remove("embedding").is_some();
                    }
                }
            }
            changed
        })
    }

    /// Apply `edit` to the record of every inline registry entry.
    fn rewrite_registry<F>(&self, mut edit: F) -> u64
    where
        F: FnMut(&mut Value) -> bool,
    {
        let all_keys = match self.store.keys() {
            Ok(all_keys) => all_keys,
            Err(e) => {
                warn!(error = %e, "eviction: could not list keys");
                return 0;
            }
        };

        all_keys
            .iter()
            .filter(|k| keys::record_id_from_key(k).is_some())
            .map(|key| {
                self.rewrite_key(key, |entry| {
                    if entry.get("location").and_then(Value::as_str) != Some("inline") {
                        return false;
                    }
                    match entry.get_mut("record") {
                        Some(record) => edit(record),
                        None => false,
                    }
                })
            })
            .sum()
    }

    /// Parse one key, apply `edit`, write back if it changed and shrank.
    fn rewrite_key<F>(&self, key: &str, edit: F) -> u64
    where
        F: FnOnce(&mut Value) -> bool,
    {
        let raw = match self.store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(e) => {
                warn!(key, error = %e, "eviction: read failed, skipping");
                return 0;
            }
        };
        let mut value: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                trace!(key, error = %e, "eviction: malformed value, skipping");
                return 0;
            }
        };

        if !edit(&mut value) {
            return 0;
        }

        let rewritten = match serde_json::to_string(&value) {
            Ok(s) => s,
            Err(e) => {
                warn!(key, error = %e, "eviction: could not re-serialize, skipping");
                return 0;
            }
        };
        let before = entry_size(key, &raw);
        let after = entry_size(key, &rewritten);
        if after >= before {
            return 0;
        }
        match self.store.put(key, &rewritten) {
            Ok(()) => {
                trace!(key, bytes_freed = before - after, "eviction: rewrote value");
                before - after
            }
            Err(e) => {
                warn!(key, error = %e, "eviction: write-back failed, skipping");
                0
            }
        }
    }
}

fn kind_of(record: &Value) -> Option<&str> {
    record.get("kind").and_then(Value::as_str)
}

/// Keep only the last `keep` items. Returns whether anything was dropped.
fn keep_last(items: &mut Vec<Value>, keep: usize) -> bool {
    if items.len() <= keep {
        return false;
    }
    let excess = items.len() - keep;
    items.drain(..excess);
    true
}

fn decoded_len(b64: &str) -> usize {
    b64.len() / 4 * 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_store::MemoryFastStore;
    use crate::registry::RegistryEntry;
    use chrono::Utc;
    use cortex_core::{
        ChatMessage, ChatSession, Chunk, Document, Record, SettingsBlob, VisualContentItem,
    };
    use std::collections::BTreeMap;

    fn store_with_capacity(capacity: u64) -> Arc<MemoryFastStore> {
        Arc::new(MemoryFastStore::new(capacity))
    }

    fn put_inline(store: &MemoryFastStore, record: Record) {
        let key = keys::registry_key(record.id());
        let value = serde_json::to_string(&RegistryEntry::Inline { record }).unwrap();
        store.put(&key, &value).unwrap();
    }

    fn load_inline(store: &MemoryFastStore, id: &str) -> Record {
        let raw = store.get(&keys::registry_key(id)).unwrap().unwrap();
        match serde_json::from_str::<RegistryEntry>(&raw).unwrap() {
            RegistryEntry::Inline { record } => record,
            other => panic!("expected inline entry, got {other:?}"),
        }
    }

    fn visual(id: &str, payload_len: usize) -> Record {
        Record::Visual(VisualContentItem {
            id: id.into(),
            document_id: "doc-1".into(),
            mime_type: "image/png".into(),
            payload: Some(vec![7u8; payload_len]),
            thumbnail: Some(vec![1u8; 64]),
            extracted_text: Some("chart".into()),
            analysis: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    fn embedded_document(id: &str) -> Record {
        let mut doc = Document::new(id, "Doc", "text");
        doc.embedding = Some(vec![0.5; 32]);
        doc.chunks = vec![Chunk {
            index: 0,
            text: "text".into(),
            embedding: Some(vec![0.25; 32]),
        }];
        Record::Document(doc)
    }

    fn policy(store: Arc<MemoryFastStore>) -> EvictionPolicy {
        let config = StorageConfig::default().with_history_keep(3);
        EvictionPolicy::new(store, &config)
    }

    #[test]
    fn test_strip_binary_removes_visual_payloads() {
        let store = store_with_capacity(1_000_000);
        put_inline(&store, visual("img-1", 4096));
        let before = store.used_bytes();

        let freed = policy(store.clone()).run_pass(EvictionPassKind::StripBinary);

        assert!(freed > 4096);
        assert_eq!(store.used_bytes(), before - freed);
        match load_inline(&store, "img-1") {
            Record::Visual(v) => {
                assert!(v.payload.is_none());
                assert!(v.thumbnail.is_none());
                assert_eq!(v.extracted_text.as_deref(), Some("chart"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_strip_binary_only_oversized_avatar() {
        let store = store_with_capacity(1_000_000);
        let mut settings = SettingsBlob::default();
        settings.avatar = Some(vec![3u8; 1024]);
        put_inline(&store, Record::Settings(settings.clone()));

        let config = StorageConfig::default();
        let small = EvictionPolicy::new(store.clone(), &config);
        assert_eq!(small.run_pass(EvictionPassKind::StripBinary), 0);

        settings.avatar = Some(vec![3u8; 128 * 1024]);
        put_inline(&store, Record::Settings(settings));
        assert!(small.run_pass(EvictionPassKind::StripBinary) > 0);
        match load_inline(&store, "settings") {
            Record::Settings(s) => assert!(s.avatar.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_truncate_history_keeps_most_recent() {
        let store = store_with_capacity(1_000_000);
        let messages = (0..10)
            .map(|i| ChatMessage {
                role: "user".into(),
                content: format!("message {i}"),
                timestamp: Utc::now(),
            })
            .collect();
        put_inline(
            &store,
            Record::Chat(ChatSession {
                id: "chat-1".into(),
                title: "Chat".into(),
                messages,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }),
        );

        assert!(policy(store.clone()).run_pass(EvictionPassKind::TruncateHistory) > 0);
        match load_inline(&store, "chat-1") {
            Record::Chat(c) => {
                let contents: Vec<&str> = c.messages.iter().map(|m| m.content.as_str()).collect();
                assert_eq!(contents, vec!["message 7", "message 8", "message 9"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_truncate_history_caps_version_ledger() {
        let store = store_with_capacity(1_000_000);
        let ledger: Vec<Value> = (0..6).map(|i| serde_json::json!({ "n": i })).collect();
        store
            .put(keys::VERSIONS_KEY, &serde_json::to_string(&ledger).unwrap())
            .unwrap();

        policy(store.clone()).run_pass(EvictionPassKind::TruncateHistory);

        let raw = store.get(keys::VERSIONS_KEY).unwrap().unwrap();
        let kept: Vec<Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0]["n"], 3);
    }

    #[test]
    fn test_drop_embeddings() {
        let store = store_with_capacity(1_000_000);
        put_inline(&store, embedded_document("doc-1"));

        assert!(policy(store.clone()).run_pass(EvictionPassKind::DropEmbeddings) > 0);
        match load_inline(&store, "doc-1") {
            Record::Document(d) => {
                assert!(d.embedding.is_none());
                assert!(d.chunks[0].embedding.is_none());
                assert_eq!(d.chunks[0].text, "text");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_run_all_is_idempotent() {
        let store = store_with_capacity(1_000_000);
        put_inline(&store, visual("img-1", 2048));
        put_inline(&store, embedded_document("doc-1"));
        let policy = policy(store.clone());

        let first = policy.run_all();
        let after_first = store.used_bytes();
        let second = policy.run_all();

        assert!(first > 0);
        assert_eq!(second, 0);
        assert_eq!(store.used_bytes(), after_first);
    }

    #[test]
    fn test_malformed_values_are_skipped() {
        let store = store_with_capacity(1_000_000);
        store.put(&keys::registry_key("broken"), "{not json").unwrap();
        store
            .put(&keys::registry_key("odd"), r#"{"location":"inline"}"#)
            .unwrap();
        store
            .put(&keys::registry_key("scalar"), r#"{"location":"inline","record":5}"#)
            .unwrap();
        store.put(keys::VERSIONS_KEY, r#"{"not":"a list"}"#).unwrap();

        let policy = policy(store.clone());
        assert_eq!(policy.run_all(), 0);
        assert_eq!(
            store.get(&keys::registry_key("broken")).unwrap().as_deref(),
            Some("{not json")
        );
    }

    #[test]
    fn test_run_until_stops_early() {
        let store = store_with_capacity(1_000_000);
        put_inline(&store, visual("img-1", 8192));
        put_inline(&store, embedded_document("doc-1"));
        let policy = policy(store.clone());

        // Strip the image; afterwards usage is far below the target.
        let freed = policy.run_until(4096);
        assert!(freed > 8192);
        match load_inline(&store, "doc-1") {
            Record::Document(d) => assert!(d.embedding.is_some()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_legacy_keys_untouched() {
        let store = store_with_capacity(1_000_000);
        let legacy = r#"[{"id":"d1","images":[{"id":"i1","data":"AAAA"}]}]"#;
        store.put(keys::LEGACY_DOCUMENTS_KEY, legacy).unwrap();
        assert_eq!(policy(store.clone()).run_all(), 0);
        assert_eq!(
            store.get(keys::LEGACY_DOCUMENTS_KEY).unwrap().as_deref(),
            Some(legacy)
        );
    }
}
