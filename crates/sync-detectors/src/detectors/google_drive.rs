use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sync_core::{ChangeDetector, ChangeEvent, ChangeType, DetectorEvent, FileMetadata, SourceType, SyncError};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::base::{requeue_as_create, DebounceTracker, KnownIds, DEFAULT_DEBOUNCE_WINDOW};

const POLL_INTERVAL: Duration = Duration::from_secs(30);
/// A file whose `createdTime` and `modifiedTime` are within this window
/// of each other is treated as a first-time upload rather than an edit
/// of an existing file, mirroring the gap the Drive API itself leaves
/// between the two timestamps on initial upload.
const CREATE_VS_UPDATE_SKEW: chrono::Duration = chrono::Duration::seconds(5);

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    changes: Vec<DriveChange>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "newStartPageToken")]
    new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveChange {
    #[serde(rename = "fileId")]
    file_id: String,
    removed: bool,
    file: Option<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    name: String,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "createdTime")]
    created_time: Option<DateTime<Utc>>,
    #[serde(rename = "modifiedTime")]
    modified_time: Option<DateTime<Utc>>,
    size: Option<String>,
    parents: Option<Vec<String>>,
    trashed: Option<bool>,
}

/// Polls the Drive Changes API using a persisted start-page token,
/// scoped to files under one folder. Drive has no push-notification
/// transport usable without a public webhook endpoint, so this is the
/// one non-filesystem detector whose "event stream" is itself a poll
/// loop rather than a long-lived connection.
pub struct GoogleDriveDetector {
    folder_id: String,
    http: reqwest::Client,
    known: KnownIds,
    debounce: DebounceTracker,
    receiver: Mutex<Option<mpsc::Receiver<DetectorEvent>>>,
    stop_flag: Arc<tokio::sync::Notify>,
}

impl GoogleDriveDetector {
    pub fn new(folder_id: String, http: reqwest::Client) -> Self {
        Self {
            folder_id,
            http,
            known: KnownIds::new(),
            debounce: DebounceTracker::new(),
            receiver: Mutex::new(None),
            stop_flag: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Drive's stable path is the bare file id; Drive has no equivalent
    /// of a bucket or container to qualify it with, and scheme prefixes
    /// are reserved for sources whose native id is ambiguous without one.
    fn stable_path(&self, file_id: &str) -> String {
        file_id.to_string()
    }

    async fn fetch_start_page_token(&self) -> Result<String, SyncError> {
        #[derive(Deserialize)]
        struct StartToken {
            #[serde(rename = "startPageToken")]
            start_page_token: String,
        }
        self.http
            .get("https://www.googleapis.com/drive/v3/changes/startPageToken")
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("fetching drive start page token: {e}")))?
            .json::<StartToken>()
            .await
            .map(|t| t.start_page_token)
            .map_err(|e| SyncError::Transient(format!("decoding drive start page token: {e}")))
    }
}

#[async_trait]
impl ChangeDetector for GoogleDriveDetector {
    fn source_type(&self) -> SourceType {
        SourceType::GoogleDrive
    }

    async fn start(&self) -> Result<(), SyncError> {
        for file in self.list_all_files().await? {
            self.known.mark_seen(&file.path);
        }

        let (tx, rx) = mpsc::channel(256);
        *self.receiver.lock().await = Some(rx);

        let mut page_token = self.fetch_start_page_token().await?;
        let http = self.http.clone();
        let known = self.known.clone();
        let debounce = self.debounce.clone();
        let folder_id = self.folder_id.clone();
        let stop_flag = Arc::clone(&self.stop_flag);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_flag.notified() => return,
                    _ = ticker.tick() => {
                        let url = format!(
                            "https://www.googleapis.com/drive/v3/changes?pageToken={page_token}&fields=nextPageToken,newStartPageToken,changes(fileId,removed,file(name,mimeType,createdTime,modifiedTime,size,parents,trashed))"
                        );
                        match http.get(&url).send().await {
                            Ok(resp) => match resp.json::<ChangesResponse>().await {
                                Ok(body) => {
                                    for change in body.changes {
                                        handle_change(change, &folder_id, &known, &debounce, &tx).await;
                                    }
                                    if let Some(next) = body.next_page_token {
                                        page_token = next;
                                    } else if let Some(new_start) = body.new_start_page_token {
                                        page_token = new_start;
                                    }
                                }
                                Err(e) => warn!(error = %e, "decoding drive changes failed"),
                            },
                            Err(e) => warn!(error = %e, "polling drive changes failed"),
                        }
                    }
                }
            }
        });

        info!(folder = %self.folder_id, "Google Drive detector started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        self.stop_flag.notify_waiters();
        self.receiver.lock().await.take();
        Ok(())
    }

    async fn list_all_files(&self) -> Result<Vec<FileMetadata>, SyncError> {
        #[derive(Deserialize)]
        struct FileListResponse {
            files: Vec<DriveListedFile>,
            #[serde(rename = "nextPageToken")]
            next_page_token: Option<String>,
        }
        #[derive(Deserialize)]
        struct DriveListedFile {
            id: String,
            name: String,
            #[serde(rename = "mimeType")]
            mime_type: Option<String>,
            #[serde(rename = "modifiedTime")]
            modified_time: Option<DateTime<Utc>>,
            size: Option<String>,
        }

        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let query = format!("'{}' in parents and trashed = false", self.folder_id);
            let mut request = self.http.get("https://www.googleapis.com/drive/v3/files").query(&[
                ("q", query.as_str()),
                ("fields", "nextPageToken,files(id,name,mimeType,modifiedTime,size)"),
                ("pageSize", "100"),
            ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let response = request
                .send()
                .await
                .map_err(|e| SyncError::Transient(format!("listing drive folder {}: {e}", self.folder_id)))?
                .json::<FileListResponse>()
                .await
                .map_err(|e| SyncError::Transient(format!("decoding drive listing: {e}")))?;

            for file in response.files {
                let mut extra = HashMap::new();
                extra.insert("file_id".to_string(), file.id.clone());
                extra.insert("file_name".to_string(), file.name);
                files.push(FileMetadata {
                    source_type: SourceType::GoogleDrive,
                    path: self.stable_path(&file.id),
                    ordinal: file.modified_time.map(|t| t.timestamp_micros()).unwrap_or_else(|| Utc::now().timestamp_micros()),
                    size_bytes: file.size.and_then(|s| s.parse().ok()),
                    mime_type: file.mime_type,
                    modified_timestamp: file.modified_time,
                    extra,
                });
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(files)
    }

    async fn get_changes(&self) -> Result<mpsc::Receiver<DetectorEvent>, SyncError> {
        self.receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| SyncError::Internal("get_changes called before start() or more than once".into()))
    }

    fn has_event_stream(&self) -> bool {
        true
    }

    async fn load_file_content(&self, path: &str) -> Result<Vec<u8>, SyncError> {
        let file_id = path;
        let url = format!("https://www.googleapis.com/drive/v3/files/{file_id}?alt=media");
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("fetching drive file {file_id}: {e}")))?
            .bytes()
            .await
            .map_err(|e| SyncError::Io(format!("reading drive file body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

async fn handle_change(
    change: DriveChange,
    folder_id: &str,
    known: &KnownIds,
    debounce: &DebounceTracker,
    tx: &mpsc::Sender<DetectorEvent>,
) {
    let stable_path = change.file_id.clone();

    if change.removed || change.file.as_ref().and_then(|f| f.trashed).unwrap_or(false) {
        known.remove(&stable_path);
        let metadata = FileMetadata {
            source_type: SourceType::GoogleDrive,
            path: stable_path.clone(),
            ordinal: Utc::now().timestamp_micros(),
            size_bytes: None,
            mime_type: None,
            modified_timestamp: Some(Utc::now()),
            extra: HashMap::new(),
        };
        let _ = tx.send(DetectorEvent::Event(ChangeEvent::new(ChangeType::Delete, metadata))).await;
        return;
    }

    let Some(file) = change.file else { return };
    if !file.parents.as_ref().is_some_and(|parents| parents.iter().any(|p| p == folder_id)) {
        return;
    }

    if debounce.is_debounced(&stable_path, DEFAULT_DEBOUNCE_WINDOW) {
        return;
    }
    debounce.mark_processed(&stable_path);

    let is_new_upload = match (file.created_time, file.modified_time) {
        (Some(created), Some(modified)) => (modified - created) < CREATE_VS_UPDATE_SKEW,
        _ => !known.contains(&stable_path),
    };

    let mut extra = HashMap::new();
    extra.insert("file_id".to_string(), change.file_id.clone());
    extra.insert("file_name".to_string(), file.name);
    let metadata = FileMetadata {
        source_type: SourceType::GoogleDrive,
        path: stable_path.clone(),
        ordinal: file.modified_time.map(|t| t.timestamp_micros()).unwrap_or_else(|| Utc::now().timestamp_micros()),
        size_bytes: file.size.and_then(|s| s.parse().ok()),
        mime_type: file.mime_type,
        modified_timestamp: file.modified_time,
        extra,
    };

    let newly_seen = known.mark_seen(&stable_path);
    let event = if is_new_upload && newly_seen {
        ChangeEvent::new(ChangeType::Create, metadata)
    } else if newly_seen {
        ChangeEvent::new(ChangeType::Update, metadata)
    } else {
        ChangeEvent::modify_delete(metadata.clone(), requeue_as_create(tx.clone(), metadata))
    };
    let _ = tx.send(DetectorEvent::Event(event)).await;
}
