use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::types::{DetectorEvent, FileMetadata, SourceType};

/// A single parsed document ready for indexing, produced by the external
/// `DocumentProcessor` collaborator. Parsing/chunking itself is out of
/// scope for this crate; only the shape it hands back matters.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub doc_id: String,
    pub text: String,
    pub ordinal: i64,
    pub metadata: JsonValue,
}

/// External text-extraction collaborator. Consumed, not implemented, by
/// this crate; a trivial pass-through impl lives in
/// `sync-core::testing` for tests.
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    async fn process(
        &self,
        bytes: &[u8],
        metadata: &FileMetadata,
    ) -> Result<Vec<ParsedDocument>, SyncError>;
}

/// One of the three downstream index back-ends. Delete is idempotent; a
/// version conflict on delete is treated as success, since the end
/// state the caller wants (the document gone) already holds.
#[async_trait]
pub trait IndexTarget: Send + Sync {
    fn name(&self) -> &'static str;

    async fn upsert(&self, doc_id: &str, extracted_text: &str, metadata: &JsonValue) -> Result<(), SyncError>;

    async fn delete(&self, doc_id: &str) -> Result<(), SyncError>;

    /// Optional: probing support varies per back-end. `None` means "not
    /// supported", not "absent".
    async fn contains(&self, _doc_id: &str) -> Result<Option<bool>, SyncError> {
        Ok(None)
    }
}

/// Common contract every `ChangeDetector` variant implements. Detectors
/// are long-lived and own whatever connection state their backend
/// needs; the orchestrator holds them behind `Arc<dyn ChangeDetector>`
/// so a worker's periodic-refresh and event-stream tasks can share one
/// instance.
#[async_trait]
pub trait ChangeDetector: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Connects, verifies access, and populates `known_ids` via one full
    /// listing before any event subscription is opened.
    async fn start(&self) -> Result<(), SyncError>;

    /// Releases all resources deterministically.
    async fn stop(&self) -> Result<(), SyncError>;

    /// Complete current inventory; used for periodic refresh and initial
    /// baselining.
    async fn list_all_files(&self) -> Result<Vec<FileMetadata>, SyncError>;

    /// Opens the detector's change sequence exactly once. Calling this
    /// more than once per detector lifetime is a logic error in the
    /// caller.
    async fn get_changes(&self) -> Result<mpsc::Receiver<DetectorEvent>, SyncError>;

    /// Whether this detector runs an event-stream loop in addition to
    /// periodic refresh. Used by the engine to decide whether a newly
    /// seen document in a periodic refresh should be skipped in favor of
    /// the event stream: every detector with an event stream skips
    /// except filesystem, the named exception.
    fn has_event_stream(&self) -> bool;

    /// Filesystem is the one event-stream detector whose periodic
    /// refresh still reconciles new documents through the generic
    /// byte-fetch path rather than deferring to the event stream.
    /// Defaults to mirroring `has_event_stream`.
    fn skips_periodic_refresh_for_new_docs(&self) -> bool {
        self.has_event_stream()
    }

    /// Fetch a single document's bytes so the engine can hash and parse
    /// it through the generic pipeline.
    async fn load_file_content(&self, path: &str) -> Result<Vec<u8>, SyncError>;

    /// Tell the detector to ignore events for `duration` (filesystem:
    /// ignore the engine's own writes). No-op for detectors that don't
    /// need it.
    fn set_quiet_period(&self, _duration: Duration) {}
}
