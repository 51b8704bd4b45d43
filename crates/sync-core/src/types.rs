use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// The eight source kinds a `DataSourceConfig` can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Filesystem,
    S3,
    Gcs,
    AzureBlob,
    Alfresco,
    GoogleDrive,
    OneDrive,
    SharePoint,
    Box,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceType::Filesystem => "filesystem",
            SourceType::S3 => "s3",
            SourceType::Gcs => "gcs",
            SourceType::AzureBlob => "azure_blob",
            SourceType::Alfresco => "alfresco",
            SourceType::GoogleDrive => "google_drive",
            SourceType::OneDrive => "onedrive",
            SourceType::SharePoint => "sharepoint",
            SourceType::Box => "box",
        };
        f.write_str(s)
    }
}

/// A single item observed in a source listing or change feed.
///
/// `path` is always in the *stable path* form (glossary): an absolute
/// local path, `<bucket>/<key>`, or `<scheme>://<native-id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub source_type: SourceType,
    pub path: String,
    /// Microsecond-scale monotonic ordinal (glossary).
    pub ordinal: i64,
    pub size_bytes: Option<u64>,
    pub mime_type: Option<String>,
    pub modified_timestamp: Option<DateTime<Utc>>,
    /// Source-native identifiers and anything else a detector needs at
    /// DELETE time (file_id, node_id, object_key, blob_name, ...).
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl FileMetadata {
    /// Look up a source-native id under any of the conventional keys
    /// used by the cloud detectors.
    pub fn source_native_id(&self) -> Option<&str> {
        for key in ["file_id", "node_id", "object_key", "blob_name", "id"] {
            if let Some(v) = self.extra.get(key) {
                return Some(v.as_str());
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// A boxed one-shot action invoked after a MODIFY-DELETE's delete half
/// completes successfully. A named, structured field rather than a
/// closure silently captured over detector state.
pub type ModifyCallback = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), SyncError>> + Send>;

/// A single detected or synthesized change, flowing from a detector
/// through a `SourceWorker` into the `UpdateEngine`.
pub struct ChangeEvent {
    pub change_type: ChangeType,
    pub metadata: FileMetadata,
    pub timestamp: DateTime<Utc>,
    /// True when this event is the DELETE half of a MODIFY pair.
    pub is_modify_delete: bool,
    /// Present only when `is_modify_delete` is true.
    pub modify_callback: Option<ModifyCallback>,
}

impl fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEvent")
            .field("change_type", &self.change_type)
            .field("metadata", &self.metadata)
            .field("timestamp", &self.timestamp)
            .field("is_modify_delete", &self.is_modify_delete)
            .field("modify_callback", &self.modify_callback.is_some())
            .finish()
    }
}

impl ChangeEvent {
    pub fn new(change_type: ChangeType, metadata: FileMetadata) -> Self {
        Self {
            change_type,
            metadata,
            timestamp: Utc::now(),
            is_modify_delete: false,
            modify_callback: None,
        }
    }

    /// Build the synthesized DELETE half of a MODIFY pair: a CREATE or
    /// UPDATE whose id is already in `known_ids`.
    pub fn modify_delete(metadata: FileMetadata, callback: ModifyCallback) -> Self {
        Self {
            change_type: ChangeType::Delete,
            metadata,
            timestamp: Utc::now(),
            is_modify_delete: true,
            modify_callback: Some(callback),
        }
    }
}

/// What a detector's change stream yields on each poll.
#[derive(Debug)]
pub enum DetectorEvent {
    Event(ChangeEvent),
    Idle,
    End,
}

/// The three downstream index kinds a `DocumentState` tracks sync
/// timestamps for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Vector,
    Search,
    Graph,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetKind::Vector => "vector",
            TargetKind::Search => "search",
            TargetKind::Graph => "graph",
        };
        f.write_str(s)
    }
}
