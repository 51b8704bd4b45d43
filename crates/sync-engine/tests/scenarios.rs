use std::sync::Arc;

use sync_core::testing::{PassthroughDocumentProcessor, RecordingIndexTarget};
use sync_core::{ChangeDetector, ChangeEvent, ChangeType, FileMetadata, SourceType};
use sync_detectors::FilesystemDetector;
use sync_engine::UpdateEngine;
use sync_state::testing::InMemoryStateStore;
use sync_state::StateStoreApi;

const CONFIG_ID: &str = "cfg-1";

fn file_metadata(path: &str, ordinal: i64) -> FileMetadata {
    FileMetadata {
        source_type: SourceType::Filesystem,
        path: path.to_string(),
        ordinal,
        size_bytes: None,
        mime_type: None,
        modified_timestamp: chrono::DateTime::from_timestamp_micros(ordinal),
        extra: Default::default(),
    }
}

fn build_engine(vector: Arc<RecordingIndexTarget>, search: Arc<RecordingIndexTarget>) -> (UpdateEngine, Arc<InMemoryStateStore>) {
    let state = Arc::new(InMemoryStateStore::new());
    let engine = UpdateEngine::new(
        Some(vector),
        Some(search),
        None,
        Arc::new(PassthroughDocumentProcessor),
        state.clone(),
    );
    (engine, state)
}

/// S1: a filesystem CREATE, then a MODIFY, then a DELETE end with the
/// document present in both targets after the update and gone after the
/// delete, with exactly one surviving state row in between.
#[tokio::test]
async fn s1_filesystem_create_modify_delete() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, b"v1").unwrap();
    let path = file.to_str().unwrap().to_string();

    let detector: Arc<dyn ChangeDetector> = Arc::new(FilesystemDetector::new(vec![dir.path().to_path_buf()]));
    let vector = Arc::new(RecordingIndexTarget::new("vector"));
    let search = Arc::new(RecordingIndexTarget::new("search"));
    let (engine, state) = build_engine(vector.clone(), search.clone());

    let create = ChangeEvent::new(ChangeType::Create, file_metadata(&path, 1));
    engine.handle_event(create, &detector, CONFIG_ID).await.unwrap();

    let doc_id = sync_core::make_doc_id(CONFIG_ID, &path);
    assert!(vector.contains_doc(&doc_id));
    assert!(search.contains_doc(&doc_id));
    assert_eq!(state.row_count(), 1);

    std::fs::write(&file, b"v2").unwrap();
    let update = ChangeEvent::new(ChangeType::Update, file_metadata(&path, 2));
    engine.handle_event(update, &detector, CONFIG_ID).await.unwrap();
    assert!(vector.contains_doc(&doc_id));

    let delete = ChangeEvent::new(ChangeType::Delete, file_metadata(&path, 3));
    engine.handle_event(delete, &detector, CONFIG_ID).await.unwrap();
    assert!(!vector.contains_doc(&doc_id));
    assert!(!search.contains_doc(&doc_id));
    assert_eq!(state.row_count(), 0);
}

/// S1b: the modify-delete the real filesystem detector emits for a
/// rewrite of an already-known path (not a hand-built `Update` event)
/// deletes the old indexed content and its requeued callback re-ingests
/// the new content, leaving it present in the targets afterward.
#[tokio::test]
async fn s1b_real_modify_delete_event_reingests_new_content() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, b"v1").unwrap();
    let path = file.to_str().unwrap().to_string();

    let detector: Arc<dyn ChangeDetector> = Arc::new(FilesystemDetector::new(vec![dir.path().to_path_buf()]));
    detector.start().await.unwrap();
    let mut changes = detector.get_changes().await.unwrap();

    let vector = Arc::new(RecordingIndexTarget::new("vector"));
    let search = Arc::new(RecordingIndexTarget::new("search"));
    let (engine, state) = build_engine(vector.clone(), search.clone());

    engine
        .handle_event(ChangeEvent::new(ChangeType::Create, file_metadata(&path, 1)), &detector, CONFIG_ID)
        .await
        .unwrap();
    let doc_id = sync_core::make_doc_id(CONFIG_ID, &path);
    assert!(vector.contains_doc(&doc_id));
    assert_eq!(vector.text(&doc_id).unwrap(), "v1");

    std::fs::write(&file, b"v2").unwrap();

    let modify_delete = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            match changes.recv().await.expect("detector channel closed before emitting an event") {
                sync_core::DetectorEvent::Event(event) if event.metadata.path == path && event.is_modify_delete => {
                    return event;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("detector never emitted the modify-delete for the rewritten path");

    engine.handle_event(modify_delete, &detector, CONFIG_ID).await.unwrap();
    assert!(!vector.contains_doc(&doc_id), "modify-delete must remove the stale content first");
    assert_eq!(state.row_count(), 0, "the delete half hard-deletes the state row before the re-ingest");

    let requeued_create = tokio::time::timeout(std::time::Duration::from_secs(5), changes.recv())
        .await
        .expect("requeued create never arrived on the channel")
        .expect("detector channel closed before requeuing the create");
    let sync_core::DetectorEvent::Event(requeued_create) = requeued_create else {
        panic!("expected the requeued event to carry a create");
    };
    assert_eq!(requeued_create.change_type, ChangeType::Create);

    engine.handle_event(requeued_create, &detector, CONFIG_ID).await.unwrap();

    assert!(vector.contains_doc(&doc_id));
    assert!(search.contains_doc(&doc_id));
    assert_eq!(vector.text(&doc_id).unwrap(), "v2");
    assert_eq!(search.text(&doc_id).unwrap(), "v2");
    assert_eq!(state.row_count(), 1);
}

/// S2: a duplicate CREATE followed by a metadata-only update (same
/// content, same ordinal) is processed once; the repeat with an identical
/// ordinal is skipped rather than reprocessed.
#[tokio::test]
async fn s2_duplicate_create_is_processed_once() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, b"same content").unwrap();
    let path = file.to_str().unwrap().to_string();

    let detector: Arc<dyn ChangeDetector> = Arc::new(FilesystemDetector::new(vec![dir.path().to_path_buf()]));
    let vector = Arc::new(RecordingIndexTarget::new("vector"));
    let search = Arc::new(RecordingIndexTarget::new("search"));
    let (engine, state) = build_engine(vector.clone(), search.clone());

    let first = ChangeEvent::new(ChangeType::Create, file_metadata(&path, 10));
    engine.handle_event(first, &detector, CONFIG_ID).await.unwrap();
    assert_eq!(state.row_count(), 1);

    let duplicate = ChangeEvent::new(ChangeType::Update, file_metadata(&path, 10));
    engine.handle_event(duplicate, &detector, CONFIG_ID).await.unwrap();
    assert_eq!(state.row_count(), 1);
}

/// S3: a rename-only event (same `modified_timestamp`, new ordinal) just
/// bumps the ordinal and never touches the index targets.
#[tokio::test]
async fn s3_rename_bumps_ordinal_without_reindexing() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, b"content").unwrap();
    let path = file.to_str().unwrap().to_string();

    let detector: Arc<dyn ChangeDetector> = Arc::new(FilesystemDetector::new(vec![dir.path().to_path_buf()]));
    let vector = Arc::new(RecordingIndexTarget::new("vector"));
    let search = Arc::new(RecordingIndexTarget::new("search"));
    let (engine, state) = build_engine(vector.clone(), search.clone());

    let metadata = file_metadata(&path, 100);
    let modified_timestamp = metadata.modified_timestamp;
    engine
        .handle_event(ChangeEvent::new(ChangeType::Create, metadata), &detector, CONFIG_ID)
        .await
        .unwrap();

    let doc_id = sync_core::make_doc_id(CONFIG_ID, &path);
    let before = state.get(&doc_id).await.unwrap().unwrap();
    assert_eq!(before.ordinal, 100);

    let mut renamed = file_metadata(&path, 101);
    renamed.modified_timestamp = modified_timestamp;
    engine
        .handle_event(ChangeEvent::new(ChangeType::Update, renamed), &detector, CONFIG_ID)
        .await
        .unwrap();

    let after = state.get(&doc_id).await.unwrap().unwrap();
    assert_eq!(after.ordinal, 101);
    assert_eq!(before.content_hash, after.content_hash);
}

/// S4: a brand-new document discovered by periodic refresh on a detector
/// with its own event stream is deferred; periodic refresh leaves it
/// untouched once the event stream has already indexed it.
#[tokio::test]
async fn s4_periodic_refresh_defers_to_event_stream_for_event_stream_detectors() {
    struct StubDetector {
        files: Vec<FileMetadata>,
    }

    #[async_trait::async_trait]
    impl ChangeDetector for StubDetector {
        fn source_type(&self) -> SourceType {
            SourceType::GoogleDrive
        }
        async fn start(&self) -> Result<(), sync_core::SyncError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), sync_core::SyncError> {
            Ok(())
        }
        async fn list_all_files(&self) -> Result<Vec<FileMetadata>, sync_core::SyncError> {
            Ok(self.files.clone())
        }
        async fn get_changes(&self) -> Result<tokio::sync::mpsc::Receiver<sync_core::DetectorEvent>, sync_core::SyncError> {
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok(rx)
        }
        fn has_event_stream(&self) -> bool {
            true
        }
        async fn load_file_content(&self, _path: &str) -> Result<Vec<u8>, sync_core::SyncError> {
            Ok(b"drive bytes".to_vec())
        }
    }

    let detector: Arc<dyn ChangeDetector> = Arc::new(StubDetector {
        files: vec![file_metadata("drive://folder/new.txt", 5)],
    });
    let vector = Arc::new(RecordingIndexTarget::new("vector"));
    let search = Arc::new(RecordingIndexTarget::new("search"));
    let (engine, state) = build_engine(vector.clone(), search.clone());

    engine.periodic_refresh(&detector, CONFIG_ID).await.unwrap();
    assert_eq!(state.row_count(), 0);
    assert!(vector.is_empty());
}

/// S5: out-of-order events never reprocess a document; an ordinal lower
/// than or equal to the recorded one is always skipped.
#[tokio::test]
async fn s5_out_of_order_events_are_skipped() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, b"newer").unwrap();
    let path = file.to_str().unwrap().to_string();

    let detector: Arc<dyn ChangeDetector> = Arc::new(FilesystemDetector::new(vec![dir.path().to_path_buf()]));
    let vector = Arc::new(RecordingIndexTarget::new("vector"));
    let search = Arc::new(RecordingIndexTarget::new("search"));
    let (engine, state) = build_engine(vector.clone(), search.clone());

    engine
        .handle_event(ChangeEvent::new(ChangeType::Create, file_metadata(&path, 50)), &detector, CONFIG_ID)
        .await
        .unwrap();

    let doc_id = sync_core::make_doc_id(CONFIG_ID, &path);
    let after_first = state.get(&doc_id).await.unwrap().unwrap();
    assert_eq!(after_first.ordinal, 50);

    engine
        .handle_event(ChangeEvent::new(ChangeType::Update, file_metadata(&path, 20)), &detector, CONFIG_ID)
        .await
        .unwrap();

    let after_stale = state.get(&doc_id).await.unwrap().unwrap();
    assert_eq!(after_stale.ordinal, 50, "an older ordinal must never move the recorded watermark backward");
}

/// S6: one target failing to upsert leaves the others marked synced and
/// the state row recorded; a later retry only needs to repair the failed
/// target instead of redoing all of them.
#[tokio::test]
async fn s6_partial_target_failure_leaves_others_synced() {
    struct FailingTarget;

    #[async_trait::async_trait]
    impl sync_core::IndexTarget for FailingTarget {
        fn name(&self) -> &'static str {
            "graph"
        }
        async fn upsert(&self, _doc_id: &str, _text: &str, _metadata: &serde_json::Value) -> Result<(), sync_core::SyncError> {
            Err(sync_core::SyncError::Transient("graph backend unavailable".into()))
        }
        async fn delete(&self, _doc_id: &str) -> Result<(), sync_core::SyncError> {
            Ok(())
        }
    }

    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("a.txt");
    std::fs::write(&file, b"content").unwrap();
    let path = file.to_str().unwrap().to_string();

    let detector: Arc<dyn ChangeDetector> = Arc::new(FilesystemDetector::new(vec![dir.path().to_path_buf()]));
    let vector = Arc::new(RecordingIndexTarget::new("vector"));
    let search = Arc::new(RecordingIndexTarget::new("search"));
    let state = Arc::new(InMemoryStateStore::new());
    let engine = UpdateEngine::new(
        Some(vector.clone()),
        Some(search.clone()),
        Some(Arc::new(FailingTarget)),
        Arc::new(PassthroughDocumentProcessor),
        state.clone(),
    );

    engine
        .handle_event(ChangeEvent::new(ChangeType::Create, file_metadata(&path, 1)), &detector, CONFIG_ID)
        .await
        .unwrap();

    let doc_id = sync_core::make_doc_id(CONFIG_ID, &path);
    assert!(vector.contains_doc(&doc_id));
    assert!(search.contains_doc(&doc_id));

    let row = state.get(&doc_id).await.unwrap().unwrap();
    assert!(row.vector_synced_at.is_some());
    assert!(row.search_synced_at.is_some());
    assert!(row.graph_synced_at.is_none());
}
