//! Bundle import and folder export through the facade.

use std::sync::Arc;
use std::time::Duration;

use cortex_store::{
    keys, DirectoryTargetProvider, Error, FastStore, MemoryFastStore, MemoryObjectStore, Record,
    RecordKind, StorageConfig, StorageFacade,
};
use serde_json::json;

async fn open(fast: Arc<MemoryFastStore>, export_root: &std::path::Path) -> StorageFacade {
    StorageFacade::open(
        StorageConfig::default().with_monitor_interval(Duration::ZERO),
        fast,
        Arc::new(MemoryObjectStore::new()),
        Arc::new(DirectoryTargetProvider::new(export_root)),
    )
    .await
    .unwrap()
}

fn registry_keys(fast: &MemoryFastStore) -> Vec<String> {
    fast.keys()
        .unwrap()
        .into_iter()
        .filter(|k| keys::record_id_from_key(k).is_some())
        .collect()
}

#[tokio::test]
async fn test_empty_object_imports_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fast = Arc::new(MemoryFastStore::new(1_000_000));
    let facade = open(fast.clone(), dir.path()).await;

    let summary = facade.import_bundle(b"{}").await.unwrap();
    assert_eq!(summary.notes_count, 0);
    assert_eq!(summary.ideas_count, 0);
    assert!(fast.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_bundles_write_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let fast = Arc::new(MemoryFastStore::new(1_000_000));
    let facade = open(fast.clone(), dir.path()).await;

    let err = facade.import_bundle(b"not json").await.unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));

    let err = facade.import_bundle(br#"{"foo": 1}"#).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = facade.import_bundle(br#"{"notes": {"id": "n1"}}"#).await.unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));

    assert!(fast.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_import_counts_and_partial_failure() {
    let dir = tempfile::tempdir().unwrap();
    let fast = Arc::new(MemoryFastStore::new(1_000_000));
    let facade = open(fast.clone(), dir.path()).await;

    let bundle = json!({
        "notes": [
            { "id": "n1", "title": "Groceries", "content": "milk", "tags": ["home"] },
            { "id": "n2", "title": "Standup", "content": "notes" }
        ],
        "ideas": [{ "id": "i1", "title": "Garden", "description": "raised beds" }],
        "versionHistory": []
    });
    let summary = facade
        .import_bundle(bundle.to_string().as_bytes())
        .await
        .unwrap();
    assert_eq!(summary.notes_count, 2);
    assert_eq!(summary.ideas_count, 1);
    assert_eq!(registry_keys(&fast).len(), 3);
    assert_eq!(facade.version_history().unwrap().len(), 3);

    // The second note is invalid; the first one stays committed.
    let bundle = json!({
        "notes": [
            { "id": "n3", "title": "Kept" },
            { "id": "", "title": "Broken" },
            { "id": "n4", "title": "Never reached" }
        ]
    });
    let err = facade
        .import_bundle(bundle.to_string().as_bytes())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert!(facade.load("n3").await.unwrap().is_some());
    assert!(facade.load_canonical("n4").await.unwrap().is_none());
}

#[tokio::test]
async fn test_export_then_reimport_from_folder() {
    let dir = tempfile::tempdir().unwrap();
    let export_root = dir.path().join("export");
    let fast = Arc::new(MemoryFastStore::new(1_000_000));
    let facade = open(fast, &export_root).await;

    let bundle = json!({
        "notes": [
            { "id": "n1", "title": "Trip / plan", "content": "pack bags", "tags": ["travel"] },
            { "id": "n2", "title": "Trip / plan", "content": "second copy" }
        ],
        "ideas": [{ "id": "i1", "title": "Garden", "description": "raised beds", "keywords": ["spring"] }]
    });
    facade
        .import_bundle(bundle.to_string().as_bytes())
        .await
        .unwrap();

    let report = facade.export_all().await.unwrap();
    assert_eq!(report.root, export_root);
    assert!(export_root.join("notes/notes.json").is_file());
    assert!(export_root.join("ideas/ideas.json").is_file());

    let markdown: Vec<_> = report
        .files
        .iter()
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
        .collect();
    assert_eq!(markdown.len(), 3);

    let idea_md = markdown
        .iter()
        .find(|p| p.starts_with(export_root.join("ideas")))
        .unwrap();
    let text = std::fs::read_to_string(idea_md).unwrap();
    assert!(text.starts_with("---\n"));
    assert!(text.contains("keywords: [\"spring\"]"));
    assert!(text.contains("# Garden"));
    assert!(text.contains("raised beds"));

    let exports: Vec<_> = std::fs::read_dir(export_root.join("exports"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(exports.len(), 1);
    assert!(exports[0].starts_with("cortex-export-"));

    // A second facade picks the folder contents back up.
    let other = open(Arc::new(MemoryFastStore::new(1_000_000)), &export_root).await;
    let bytes = other.folder().read_folder_bundle().await.unwrap();
    let summary = other.import_bundle(&bytes).await.unwrap();
    assert_eq!(summary.notes_count, 2);
    assert_eq!(summary.ideas_count, 1);

    let notes = other.list(Some(RecordKind::Note)).await.unwrap();
    assert_eq!(notes.len(), 2);
    match other.load("n1").await.unwrap() {
        Some(Record::Note(note)) => {
            assert_eq!(note.content, "pack bags");
            assert_eq!(note.tags, vec!["travel"]);
        }
        other => panic!("unexpected {other:?}"),
    }
}
