use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::Deserialize;
use sync_core::{ChangeDetector, ChangeEvent, ChangeType, DetectorEvent, FileMetadata, SourceType, SyncError};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::base::{requeue_as_create, DebounceTracker, KnownIds, DEFAULT_DEBOUNCE_WINDOW};

const POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct EventsResponse {
    entries: Vec<BoxEvent>,
    #[serde(rename = "next_stream_position")]
    next_stream_position: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BoxEvent {
    event_type: String,
    source: BoxEventSource,
}

#[derive(Debug, Deserialize)]
struct BoxEventSource {
    #[serde(rename = "type")]
    item_type: Option<String>,
    id: Option<String>,
    name: Option<String>,
    size: Option<u64>,
    #[serde(rename = "modified_at")]
    modified_at: Option<DateTime<Utc>>,
    parent: Option<BoxParent>,
}

#[derive(Debug, Deserialize)]
struct BoxParent {
    id: String,
}

/// Polls the Box Events API's long-poll stream position, holding a
/// cache of folder ids under the monitored subtree so item events
/// outside of it are dropped without a per-event folder lookup.
pub struct BoxDetector {
    root_folder_id: String,
    http: reqwest::Client,
    known: KnownIds,
    debounce: DebounceTracker,
    folder_subtree: Arc<DashSet<String>>,
    receiver: Mutex<Option<mpsc::Receiver<DetectorEvent>>>,
    stop_flag: Arc<tokio::sync::Notify>,
}

impl BoxDetector {
    pub fn new(root_folder_id: String, http: reqwest::Client) -> Self {
        Self {
            root_folder_id,
            http,
            known: KnownIds::new(),
            debounce: DebounceTracker::new(),
            folder_subtree: Arc::new(DashSet::new()),
            receiver: Mutex::new(None),
            stop_flag: Arc::new(tokio::sync::Notify::new()),
        }
    }

    fn stable_path(&self, file_id: &str) -> String {
        format!("box://{file_id}")
    }

    async fn current_stream_position(&self) -> Result<String, SyncError> {
        let response = self
            .http
            .get("https://api.box.com/2.0/events")
            .query(&[("stream_position", "now"), ("stream_type", "changes")])
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("fetching box stream position: {e}")))?
            .json::<EventsResponse>()
            .await
            .map_err(|e| SyncError::Transient(format!("decoding box stream position: {e}")))?;
        Ok(response.next_stream_position.to_string())
    }

    async fn walk_folder(&self, folder_id: &str, out: &mut Vec<FileMetadata>) -> Result<(), SyncError> {
        #[derive(Deserialize)]
        struct ItemsResponse {
            entries: Vec<BoxItem>,
            offset: u32,
            limit: u32,
            #[serde(rename = "total_count")]
            total_count: u32,
        }
        #[derive(Deserialize)]
        struct BoxItem {
            #[serde(rename = "type")]
            item_type: String,
            id: String,
            name: String,
            size: Option<u64>,
            #[serde(rename = "modified_at")]
            modified_at: Option<DateTime<Utc>>,
        }

        self.folder_subtree.insert(folder_id.to_string());
        let mut offset = 0u32;
        loop {
            let url = format!("https://api.box.com/2.0/folders/{folder_id}/items");
            let response = self
                .http
                .get(&url)
                .query(&[("offset", offset.to_string()), ("limit", "1000".to_string())])
                .send()
                .await
                .map_err(|e| SyncError::Transient(format!("listing box folder {folder_id}: {e}")))?
                .json::<ItemsResponse>()
                .await
                .map_err(|e| SyncError::Transient(format!("decoding box folder listing: {e}")))?;

            for item in &response.entries {
                if item.item_type == "folder" {
                    Box::pin(self.walk_folder(&item.id, out)).await?;
                    continue;
                }
                let mut extra = HashMap::new();
                extra.insert("file_id".to_string(), item.id.clone());
                extra.insert("file_name".to_string(), item.name.clone());
                out.push(FileMetadata {
                    source_type: SourceType::Box,
                    path: self.stable_path(&item.id),
                    ordinal: item.modified_at.map(|t| t.timestamp_micros()).unwrap_or_else(|| Utc::now().timestamp_micros()),
                    size_bytes: item.size,
                    mime_type: None,
                    modified_timestamp: item.modified_at,
                    extra,
                });
            }

            offset += response.entries.len() as u32;
            if offset >= response.total_count || response.entries.is_empty() {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeDetector for BoxDetector {
    fn source_type(&self) -> SourceType {
        SourceType::Box
    }

    async fn start(&self) -> Result<(), SyncError> {
        for file in self.list_all_files().await? {
            self.known.mark_seen(&file.path);
        }

        let (tx, rx) = mpsc::channel(256);
        *self.receiver.lock().await = Some(rx);

        let mut stream_position = self.current_stream_position().await?;
        let http = self.http.clone();
        let known = self.known.clone();
        let debounce = self.debounce.clone();
        let folder_subtree = Arc::clone(&self.folder_subtree);
        let stop_flag = Arc::clone(&self.stop_flag);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_flag.notified() => return,
                    _ = ticker.tick() => {
                        let url = "https://api.box.com/2.0/events";
                        match http
                            .get(url)
                            .query(&[("stream_position", stream_position.as_str()), ("stream_type", "changes")])
                            .send()
                            .await
                        {
                            Ok(resp) => match resp.json::<EventsResponse>().await {
                                Ok(body) => {
                                    for event in body.entries {
                                        handle_event(event, &folder_subtree, &known, &debounce, &tx).await;
                                    }
                                    stream_position = body.next_stream_position.to_string();
                                }
                                Err(e) => warn!(error = %e, "decoding box events failed"),
                            },
                            Err(e) => warn!(error = %e, "polling box events failed"),
                        }
                    }
                }
            }
        });

        info!(folder = %self.root_folder_id, "Box detector started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        self.stop_flag.notify_waiters();
        self.receiver.lock().await.take();
        Ok(())
    }

    async fn list_all_files(&self) -> Result<Vec<FileMetadata>, SyncError> {
        let mut files = Vec::new();
        self.walk_folder(&self.root_folder_id, &mut files).await?;
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
        let file_id = path.strip_prefix("box://").unwrap_or(path);
        let url = format!("https://api.box.com/2.0/files/{file_id}/content");
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("fetching box file {file_id}: {e}")))?
            .bytes()
            .await
            .map_err(|e| SyncError::Io(format!("reading box file body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

async fn handle_event(
    event: BoxEvent,
    folder_subtree: &DashSet<String>,
    known: &KnownIds,
    debounce: &DebounceTracker,
    tx: &mpsc::Sender<DetectorEvent>,
) {
    if event.source.item_type.as_deref() != Some("file") {
        return;
    }
    let Some(file_id) = event.source.id.clone() else { return };
    let parent_in_scope = event
        .source
        .parent
        .as_ref()
        .is_some_and(|parent| folder_subtree.contains(&parent.id));
    if !parent_in_scope {
        return;
    }

    let change_type = match event.event_type.as_str() {
        "ITEM_UPLOAD" | "ITEM_CREATE" | "ITEM_COPY" => ChangeType::Create,
        "ITEM_MODIFY" | "ITEM_RENAME" | "ITEM_MOVE" => ChangeType::Update,
        "ITEM_TRASH" | "ITEM_DELETE" => ChangeType::Delete,
        _ => return,
    };
    let stable_path = format!("box://{file_id}");

    if debounce.is_debounced(&stable_path, DEFAULT_DEBOUNCE_WINDOW) {
        return;
    }
    debounce.mark_processed(&stable_path);

    let mut extra = HashMap::new();
    extra.insert("file_id".to_string(), file_id.clone());
    if let Some(name) = &event.source.name {
        extra.insert("file_name".to_string(), name.clone());
    }
    let metadata = FileMetadata {
        source_type: SourceType::Box,
        path: stable_path.clone(),
        ordinal: event.source.modified_at.map(|t| t.timestamp_micros()).unwrap_or_else(|| Utc::now().timestamp_micros()),
        size_bytes: event.source.size,
        mime_type: None,
        modified_timestamp: event.source.modified_at,
        extra,
    };

    let mapped = match change_type {
        ChangeType::Delete => {
            known.remove(&stable_path);
            ChangeEvent::new(ChangeType::Delete, metadata)
        }
        ChangeType::Create | ChangeType::Update => {
            if known.mark_seen(&stable_path) {
                ChangeEvent::new(ChangeType::Create, metadata)
            } else {
                ChangeEvent::modify_delete(metadata.clone(), requeue_as_create(tx.clone(), metadata))
            }
        }
    };
    let _ = tx.send(DetectorEvent::Event(mapped)).await;
}
