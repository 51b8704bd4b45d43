use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::event::{EventKind, ModifyKind, RemoveKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sync_core::{ChangeDetector, ChangeEvent, ChangeType, DetectorEvent, FileMetadata, SourceType, SyncError};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::base::{requeue_as_create, DebounceTracker, KnownIds};

/// CREATE+MODIFY bursts within this window collapse to a single event.
const BURST_DEBOUNCE: Duration = Duration::from_secs(1);

struct Inner {
    roots: Vec<PathBuf>,
    known: KnownIds,
    debounce: DebounceTracker,
    quiet_until_micros: AtomicI64,
    watcher: Mutex<Option<RecommendedWatcher>>,
    receiver: Mutex<Option<mpsc::Receiver<DetectorEvent>>>,
}

impl Inner {
    fn in_quiet_period(&self) -> bool {
        Utc::now().timestamp_micros() < self.quiet_until_micros.load(Ordering::Relaxed)
    }

    /// Translates one raw filesystem notification into the public event
    /// sequence: DELETE passes through; a CREATE/UPDATE within the
    /// debounce window is dropped; a CREATE/UPDATE for a path already in
    /// `known` synthesizes the MODIFY-DELETE pair, otherwise it is a
    /// plain CREATE.
    fn translate(&self, change_type: ChangeType, path: &Path, tx: &mpsc::Sender<DetectorEvent>) -> Option<ChangeEvent> {
        let normalized = normalize(path);
        if self.in_quiet_period() {
            debug!(path = %normalized, "dropping filesystem event during quiet period");
            return None;
        }
        if self.debounce.is_debounced(&normalized, BURST_DEBOUNCE) {
            return None;
        }
        self.debounce.mark_processed(&normalized);

        match change_type {
            ChangeType::Delete => {
                self.known.remove(&normalized);
                Some(ChangeEvent::new(ChangeType::Delete, build_metadata(&normalized)))
            }
            ChangeType::Create | ChangeType::Update => {
                if self.known.mark_seen(&normalized) {
                    Some(ChangeEvent::new(ChangeType::Create, build_metadata(&normalized)))
                } else {
                    let metadata = build_metadata(&normalized);
                    Some(ChangeEvent::modify_delete(metadata.clone(), requeue_as_create(tx.clone(), metadata)))
                }
            }
        }
    }
}

fn normalize(path: &Path) -> String {
    sync_core::normalize_filesystem_path(&path.to_string_lossy())
}

fn build_metadata(path: &str) -> FileMetadata {
    let (ordinal, size_bytes) = match std::fs::metadata(path) {
        Ok(meta) => {
            let modified = meta.modified().ok().map(|t| DateTime::<Utc>::from(t).timestamp_micros());
            (modified.unwrap_or_else(|| Utc::now().timestamp_micros()), Some(meta.len()))
        }
        Err(_) => (Utc::now().timestamp_micros(), None),
    };
    FileMetadata {
        source_type: SourceType::Filesystem,
        path: path.to_string(),
        ordinal,
        size_bytes,
        mime_type: None,
        modified_timestamp: DateTime::from_timestamp_micros(ordinal),
        extra: HashMap::new(),
    }
}

/// Watches one or more filesystem roots recursively, case-folding paths
/// on Windows so `C:\X` and `c:\X` collide. Filesystem is the one
/// event-stream detector whose periodic refresh is *not* skipped for
/// newly seen documents.
pub struct FilesystemDetector {
    inner: Arc<Inner>,
}

impl FilesystemDetector {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                roots,
                known: KnownIds::new(),
                debounce: DebounceTracker::new(),
                quiet_until_micros: AtomicI64::new(0),
                watcher: Mutex::new(None),
                receiver: Mutex::new(None),
            }),
        }
    }
}

#[async_trait]
impl ChangeDetector for FilesystemDetector {
    fn source_type(&self) -> SourceType {
        SourceType::Filesystem
    }

    async fn start(&self) -> Result<(), SyncError> {
        for file in self.list_all_files().await? {
            self.inner.known.mark_seen(&file.path);
        }

        let (tx, rx) = mpsc::channel(256);
        *self.inner.receiver.lock().unwrap() = Some(rx);

        let inner = Arc::clone(&self.inner);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let Ok(event) = res else { return };
            let change_type = match event.kind {
                EventKind::Create(_) => Some(ChangeType::Create),
                EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => Some(ChangeType::Update),
                EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => Some(ChangeType::Delete),
                _ => None,
            };
            let Some(change_type) = change_type else { return };
            for path in &event.paths {
                if path.is_dir() {
                    continue;
                }
                if let Some(change_event) = inner.translate(change_type, path, &tx) {
                    if tx.blocking_send(DetectorEvent::Event(change_event)).is_err() {
                        return;
                    }
                }
            }
        })
        .map_err(|e| SyncError::Io(format!("creating filesystem watcher: {e}")))?;

        for root in &self.inner.roots {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| SyncError::Io(format!("watching {}: {e}", root.display())))?;
        }
        *self.inner.watcher.lock().unwrap() = Some(watcher);

        info!(roots = ?self.inner.roots, "filesystem detector started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        if let Some(mut watcher) = self.inner.watcher.lock().unwrap().take() {
            for root in &self.inner.roots {
                let _ = watcher.unwatch(root);
            }
        }
        self.inner.receiver.lock().unwrap().take();
        Ok(())
    }

    async fn list_all_files(&self) -> Result<Vec<FileMetadata>, SyncError> {
        let mut files = Vec::new();
        for root in &self.inner.roots {
            if root.is_file() {
                files.push(build_metadata(&normalize(root)));
                continue;
            }
            let mut stack = vec![root.clone()];
            while let Some(dir) = stack.pop() {
                let entries = std::fs::read_dir(&dir).map_err(|e| SyncError::Io(e.to_string()))?;
                for entry in entries {
                    let entry = entry.map_err(|e| SyncError::Io(e.to_string()))?;
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else if path.is_file() {
                        files.push(build_metadata(&normalize(&path)));
                    }
                }
            }
        }
        Ok(files)
    }

    async fn get_changes(&self) -> Result<mpsc::Receiver<DetectorEvent>, SyncError> {
        self.inner
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SyncError::Internal("get_changes called before start() or more than once".into()))
    }

    fn has_event_stream(&self) -> bool {
        true
    }

    fn skips_periodic_refresh_for_new_docs(&self) -> bool {
        false
    }

    async fn load_file_content(&self, path: &str) -> Result<Vec<u8>, SyncError> {
        std::fs::read(path).map_err(|e| SyncError::Io(format!("reading {path}: {e}")))
    }

    fn set_quiet_period(&self, duration: Duration) {
        let until = Utc::now().timestamp_micros() + duration.as_micros() as i64;
        self.inner.quiet_until_micros.store(until, Ordering::Relaxed);
        debug!(micros = until, "filesystem detector quiet period set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn list_all_files_finds_nested_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

        let detector = FilesystemDetector::new(vec![dir.path().to_path_buf()]);
        let files = detector.list_all_files().await.unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn load_file_content_reads_bytes() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let detector = FilesystemDetector::new(vec![dir.path().to_path_buf()]);
        let bytes = detector.load_file_content(file.to_str().unwrap()).await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    fn fresh_inner() -> Inner {
        Inner {
            roots: vec![],
            known: KnownIds::new(),
            debounce: DebounceTracker::new(),
            quiet_until_micros: AtomicI64::new(0),
            watcher: Mutex::new(None),
            receiver: Mutex::new(None),
        }
    }

    #[tokio::test]
    async fn create_of_new_path_is_plain_create() {
        let inner = fresh_inner();
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let (tx, _rx) = mpsc::channel(8);

        let event = inner.translate(ChangeType::Create, &file, &tx).unwrap();
        assert!(!event.is_modify_delete);
        assert_eq!(event.change_type, ChangeType::Create);
    }

    #[tokio::test]
    async fn update_of_already_known_path_synthesizes_modify_delete() {
        let inner = fresh_inner();
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        inner.known.mark_seen(&normalize(&file));
        let (tx, _rx) = mpsc::channel(8);

        let event = inner.translate(ChangeType::Update, &file, &tx).unwrap();
        assert!(event.is_modify_delete);
        assert_eq!(event.change_type, ChangeType::Delete);
    }

    #[tokio::test]
    async fn modify_delete_callback_requeues_a_create_on_the_channel() {
        let inner = fresh_inner();
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        inner.known.mark_seen(&normalize(&file));
        let (tx, mut rx) = mpsc::channel(8);

        let event = inner.translate(ChangeType::Update, &file, &tx).unwrap();
        (event.modify_callback.unwrap())().await.unwrap();

        match rx.recv().await.unwrap() {
            DetectorEvent::Event(requeued) => {
                assert_eq!(requeued.change_type, ChangeType::Create);
                assert_eq!(requeued.metadata.path, normalize(&file));
            }
            other => panic!("expected a requeued create event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn quiet_period_drops_events() {
        let inner = fresh_inner();
        inner.quiet_until_micros.store(Utc::now().timestamp_micros() + 5_000_000, Ordering::Relaxed);
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let (tx, _rx) = mpsc::channel(8);

        assert!(inner.translate(ChangeType::Create, &file, &tx).is_none());
    }
}
