//! Debounced background saves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cortex_core::{Record, StorageEvent};
use tracing::{debug, warn};

use crate::facade::StorageFacade;

struct PendingSave {
    record: Record,
    generation: u64,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingSave>>>;

/// Coalesces bursts of edits per record id into one save.
pub struct AutoSaver {
    facade: Arc<StorageFacade>,
    debounce: Duration,
    pending: PendingMap,
    generation: AtomicU64,
}

impl AutoSaver {
    pub fn new(facade: Arc<StorageFacade>) -> Self {
        let debounce = facade.config().autosave_debounce;
        Self::with_debounce(facade, debounce)
    }

    pub fn with_debounce(facade: Arc<StorageFacade>, debounce: Duration) -> Self {
        Self {
            facade,
            debounce,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Save `record` once no newer version has been scheduled for `debounce`.
    pub fn schedule(&self, record: Record) {
        let id = record.id().to_string();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.pending).insert(id.clone(), PendingSave { record, generation });
        debug!(subsystem = "store", component = "autosave", record_id = id.as_str(), generation, "Autosave scheduled");

        let pending = self.pending.clone();
        let facade = self.facade.clone();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let due = {
                let mut map = lock(&pending);
                match map.get(&id) {
                    Some(p) if p.generation == generation => map.remove(&id),
                    _ => None,
                }
            };
            if let Some(due) = due {
                save_reporting(&facade, due.record).await;
            }
        });
    }

    /// Save everything pending now. Returns how many records were saved.
    pub async fn flush(&self) -> usize {
        let due: Vec<PendingSave> = lock(&self.pending).drain().map(|(_, p)| p).collect();
        let mut saved = 0;
        for p in due {
            if save_reporting(&self.facade, p.record).await {
                saved += 1;
            }
        }
        saved
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

fn lock(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<String, PendingSave>> {
    pending.lock().unwrap_or_else(|p| p.into_inner())
}

async fn save_reporting(facade: &StorageFacade, record: Record) -> bool {
    let id = record.id().to_string();
    match facade.save(record).await {
        Ok(_) => true,
        Err(e) => {
            warn!(subsystem = "store", component = "autosave", record_id = id.as_str(), error = %e, "Autosave failed");
            facade.event_bus().emit(StorageEvent::AutosaveFailed {
                record_id: id,
                error: e.to_string(),
            });
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::UnsupportedTargetProvider;
    use crate::fast_store::MemoryFastStore;
    use crate::object_store::MemoryObjectStore;
    use chrono::Utc;
    use cortex_core::{Document, Note, StorageConfig};

    async fn facade() -> Arc<StorageFacade> {
        let config = StorageConfig::default().with_monitor_interval(Duration::ZERO);
        let fast = Arc::new(MemoryFastStore::new(config.capacity_bytes));
        Arc::new(
            StorageFacade::open(
                config,
                fast,
                Arc::new(MemoryObjectStore::unavailable()),
                Arc::new(UnsupportedTargetProvider),
            )
            .await
            .unwrap(),
        )
    }

    fn note(content: &str) -> Record {
        Record::Note(Note {
            id: "n1".into(),
            title: "draft".into(),
            content: content.into(),
            tags: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced() {
        let facade = facade().await;
        let saver = AutoSaver::new(facade.clone());

        saver.schedule(note("a"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        saver.schedule(note("ab"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        saver.schedule(note("abc"));
        assert_eq!(saver.pending_count(), 1);
        assert_eq!(facade.load_canonical("n1").await.unwrap(), None);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(saver.pending_count(), 0);
        match facade.load_canonical("n1").await.unwrap() {
            Some(Record::Note(n)) => assert_eq!(n.content, "abc"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(facade.version_history().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_saves_immediately() {
        let facade = facade().await;
        let saver = AutoSaver::new(facade.clone());
        saver.schedule(note("now"));

        assert_eq!(saver.flush().await, 1);
        assert!(facade.load_canonical("n1").await.unwrap().is_some());

        // The timer firing later finds nothing to do.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(facade.version_history().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_reported() {
        let facade = facade().await;
        let mut rx = facade.events();
        let saver = AutoSaver::with_debounce(facade.clone(), Duration::from_millis(10));

        // Backend is unavailable, so an oversized document cannot be stored.
        let big = Record::Document(Document::new("d1", "big", "x".repeat(5 * 1024 * 1024)));
        saver.schedule(big);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut types = Vec::new();
        while let Ok(event) = rx.try_recv() {
            types.push(event.event_type);
        }
        assert!(types.contains(&"autosave_failed".to_string()));
    }
}
