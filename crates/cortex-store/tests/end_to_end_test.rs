//! End-to-end behaviour of the storage facade under the default thresholds.
//!
//! Records of 1 KiB, 3 MiB and 6 MiB are routed to the right tier and read
//! back; the fast store is then filled to the brim and a small save must
//! recover through eviction.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cortex_store::{
    keys, CapacityLevel, DirectoryTargetProvider, Document, FastStore, FilesystemObjectStore,
    MemoryFastStore, Record, RegistryEntry, StorageConfig, StorageFacade, Tier, VisualContentItem,
    WriteStage,
};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

fn document(id: &str, size: usize) -> Record {
    Record::Document(Document::new(id, format!("Document {id}"), "d".repeat(size)))
}

fn filler_visual(id: &str, payload_len: usize) -> String {
    let record = Record::Visual(VisualContentItem {
        id: id.to_string(),
        document_id: "filler-doc".into(),
        mime_type: "image/png".into(),
        payload: Some(vec![0xAB; payload_len]),
        thumbnail: None,
        extracted_text: None,
        analysis: Default::default(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    });
    serde_json::to_string(&RegistryEntry::Inline { record }).unwrap()
}

/// Put visual filler entries straight into the fast store until it is nearly full.
fn fill_fast_store(fast: &MemoryFastStore) -> usize {
    let mut count = 0;
    for payload_len in [512 * KIB, 16 * KIB, 512] {
        loop {
            let id = format!("filler-{count}");
            let value = filler_visual(&id, payload_len);
            if fast.put(&keys::registry_key(&id), &value).is_err() {
                break;
            }
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn test_round_trip_and_recovery_from_exhaustion() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::default().with_monitor_interval(Duration::ZERO);
    let fast = Arc::new(MemoryFastStore::new(config.capacity_bytes));
    let facade = StorageFacade::open(
        config,
        fast.clone(),
        Arc::new(FilesystemObjectStore::new(dir.path().join("objects"))),
        Arc::new(DirectoryTargetProvider::new(dir.path().join("export"))),
    )
    .await
    .unwrap();
    assert!(facade.backend_available());

    let small = document("doc-1k", KIB);
    let medium = document("doc-3m", 3 * MIB);
    let large = document("doc-6m", 6 * MIB);

    assert_eq!(facade.save(small.clone()).await.unwrap().tier, Tier::Fast);
    assert_eq!(facade.save(medium.clone()).await.unwrap().tier, Tier::Fast);
    assert_eq!(facade.save(large.clone()).await.unwrap().tier, Tier::Backend);

    assert_eq!(facade.load("doc-1k").await.unwrap(), Some(small));
    assert_eq!(facade.load("doc-3m").await.unwrap(), Some(medium.clone()));
    assert_eq!(facade.load("doc-6m").await.unwrap(), Some(large.clone()));

    // Simulated exhaustion.
    let fillers = fill_fast_store(&fast);
    assert!(fillers > 0);
    let free = fast.capacity_bytes() - fast.used_bytes();
    assert!(free < 2 * KIB as u64, "store still has {free} bytes free");

    let mut events = facade.events();
    let receipt = facade.save(document("doc-2k", 2 * KIB)).await.unwrap();
    assert_eq!(receipt.tier, Tier::Fast);
    assert_eq!(receipt.stage, WriteStage::AfterEviction);

    let check = facade.check_capacity().unwrap();
    assert_eq!(check.level, CapacityLevel::Normal);

    let mut saw_eviction = false;
    while let Ok(event) = events.try_recv() {
        saw_eviction |= event.event_type == "eviction_ran";
    }
    assert!(saw_eviction);

    // Eviction stripped binary payloads only; documents are intact.
    assert!(facade.load("doc-2k").await.unwrap().is_some());
    assert_eq!(facade.load("doc-3m").await.unwrap(), Some(medium));
    assert_eq!(facade.load("doc-6m").await.unwrap(), Some(large));
    match facade.load("filler-0").await.unwrap() {
        Some(Record::Visual(v)) => assert!(v.payload.is_none()),
        other => panic!("unexpected {other:?}"),
    }

    facade.close().await.unwrap();
}

#[tokio::test]
async fn test_version_history_capped_at_max_versions() {
    let config = StorageConfig::default().with_monitor_interval(Duration::ZERO);
    let fast = Arc::new(MemoryFastStore::new(config.capacity_bytes));
    let facade = StorageFacade::open(
        config,
        fast,
        Arc::new(cortex_store::MemoryObjectStore::new()),
        Arc::new(cortex_store::UnsupportedTargetProvider),
    )
    .await
    .unwrap();

    for n in 0..12 {
        facade.save(document(&format!("doc-{n:02}"), 16)).await.unwrap();
    }

    let history = facade.version_history().unwrap();
    let ids: Vec<&str> = history.iter().map(|e| e.entity_id.as_str()).collect();
    let expected: Vec<String> = (2..12).map(|n| format!("doc-{n:02}")).collect();
    assert_eq!(ids, expected.iter().map(String::as_str).collect::<Vec<_>>());
    assert!(history.iter().all(|e| e.snapshot.is_some()));
}
