use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sync_core::{ChangeDetector, ChangeEvent, ChangeType, DetectorEvent, FileMetadata, SourceType, SyncError};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::base::{requeue_as_create, DebounceTracker, KnownIds};

const AZURE_DEBOUNCE: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ChangeFeedSegment {
    events: Vec<ChangeFeedEvent>,
    #[serde(rename = "continuationToken")]
    continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangeFeedEvent {
    #[serde(rename = "eventType")]
    event_type: String,
    #[serde(rename = "eventTime")]
    event_time: DateTime<Utc>,
    subject: String,
    data: ChangeFeedEventData,
}

#[derive(Debug, Deserialize)]
struct ChangeFeedEventData {
    #[serde(rename = "contentLength")]
    content_length: Option<u64>,
}

/// Pages through Azure Storage's Change Feed, persisting a continuation
/// token in memory. If the `$blobchangefeed` container is absent
/// (feature not enabled on the account), change-feed mode is disabled
/// permanently for this detector and it relies on periodic refresh
/// alone.
pub struct AzureBlobDetector {
    account_url: String,
    container: String,
    http: reqwest::Client,
    feed_disabled: AtomicBool,
    known: KnownIds,
    debounce: DebounceTracker,
    receiver: Mutex<Option<mpsc::Receiver<DetectorEvent>>>,
    stop_flag: Arc<tokio::sync::Notify>,
}

impl AzureBlobDetector {
    pub fn new(account_url: String, container: String, http: reqwest::Client) -> Self {
        Self {
            account_url,
            container,
            http,
            feed_disabled: AtomicBool::new(false),
            known: KnownIds::new(),
            debounce: DebounceTracker::new(),
            receiver: Mutex::new(None),
            stop_flag: Arc::new(tokio::sync::Notify::new()),
        }
    }

    fn stable_path(&self, blob_name: &str) -> String {
        format!("{}/{blob_name}", self.container)
    }
}

fn change_feed_url(account_url: &str, continuation_token: Option<&str>) -> String {
    let mut url = format!("{account_url}/$blobchangefeed?restype=container&comp=list");
    if let Some(token) = continuation_token {
        url.push_str(&format!("&continuationToken={token}"));
    }
    url
}

#[async_trait]
impl ChangeDetector for AzureBlobDetector {
    fn source_type(&self) -> SourceType {
        SourceType::AzureBlob
    }

    async fn start(&self) -> Result<(), SyncError> {
        for file in self.list_all_files().await? {
            self.known.mark_seen(&file.path);
        }

        let (tx, rx) = mpsc::channel(256);
        *self.receiver.lock().await = Some(rx);

        let probe = self.http.get(change_feed_url(&self.account_url, None)).send().await;
        match probe {
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                warn!(container = %self.container, "$blobchangefeed absent; disabling change-feed mode permanently");
                self.feed_disabled.store(true, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "probing Azure change feed failed; continuing with periodic refresh only for now");
                return Ok(());
            }
            _ => {}
        }

        let http = self.http.clone();
        let container = self.container.clone();
        let base_url = self.account_url.clone();
        let known = self.known.clone();
        let debounce = self.debounce.clone();
        let stop_flag = Arc::clone(&self.stop_flag);
        let detector_started_at = Utc::now();
        tokio::spawn(async move {
            let mut continuation_token: Option<String> = None;
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_flag.notified() => return,
                    _ = ticker.tick() => {
                        let url = change_feed_url(&base_url, continuation_token.as_deref());
                        match http.get(&url).send().await {
                            Ok(resp) => match resp.json::<ChangeFeedSegment>().await {
                                Ok(segment) => {
                                    for event in segment.events {
                                        if continuation_token.is_none() && event.event_time < detector_started_at {
                                            continue;
                                        }
                                        handle_event(event, &container, &known, &debounce, &tx).await;
                                    }
                                    continuation_token = segment.continuation_token;
                                }
                                Err(e) => warn!(error = %e, "decoding Azure change feed segment failed"),
                            },
                            Err(e) => warn!(error = %e, "polling Azure change feed failed"),
                        }
                    }
                }
            }
        });

        info!(container = %self.container, "Azure Blob detector started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        self.stop_flag.notify_waiters();
        self.receiver.lock().await.take();
        Ok(())
    }

    async fn list_all_files(&self) -> Result<Vec<FileMetadata>, SyncError> {
        #[derive(Deserialize)]
        struct ListBlobsResponse {
            #[serde(default)]
            blobs: Vec<BlobItem>,
            #[serde(rename = "nextMarker")]
            next_marker: Option<String>,
        }
        #[derive(Deserialize)]
        struct BlobItem {
            name: String,
            #[serde(rename = "contentLength")]
            content_length: Option<u64>,
            #[serde(rename = "lastModified")]
            last_modified: Option<DateTime<Utc>>,
        }

        let mut files = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut url = format!("{}/{}?restype=container&comp=list", self.account_url, self.container);
            if let Some(m) = &marker {
                url.push_str(&format!("&marker={m}"));
            }
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| SyncError::Transient(format!("listing azure container {}: {e}", self.container)))?
                .json::<ListBlobsResponse>()
                .await
                .map_err(|e| SyncError::Transient(format!("decoding azure listing: {e}")))?;

            for blob in response.blobs {
                let mut extra = HashMap::new();
                extra.insert("blob_name".to_string(), blob.name.clone());
                files.push(FileMetadata {
                    source_type: SourceType::AzureBlob,
                    path: self.stable_path(&blob.name),
                    ordinal: blob
                        .last_modified
                        .map(|t| t.timestamp_micros())
                        .unwrap_or_else(|| Utc::now().timestamp_micros()),
                    size_bytes: blob.content_length,
                    mime_type: None,
                    modified_timestamp: blob.last_modified,
                    extra,
                });
            }

            marker = response.next_marker;
            if marker.is_none() {
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
        !self.feed_disabled.load(Ordering::Relaxed)
    }

    async fn load_file_content(&self, path: &str) -> Result<Vec<u8>, SyncError> {
        let blob_name = path.strip_prefix(&format!("{}/", self.container)).unwrap_or(path);
        let url = format!("{}/{}/{blob_name}", self.account_url, self.container);
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("fetching azure blob {blob_name}: {e}")))?
            .bytes()
            .await
            .map_err(|e| SyncError::Io(format!("reading azure blob body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

async fn handle_event(
    event: ChangeFeedEvent,
    container: &str,
    known: &KnownIds,
    debounce: &DebounceTracker,
    tx: &mpsc::Sender<DetectorEvent>,
) {
    let change_type = match event.event_type.as_str() {
        "BlobCreated" => ChangeType::Create,
        "BlobDeleted" => ChangeType::Delete,
        _ => return,
    };
    let blob_name = event.subject.rsplit('/').next().unwrap_or(&event.subject).to_string();
    let stable_path = format!("{container}/{blob_name}");

    if debounce.is_debounced(&stable_path, AZURE_DEBOUNCE) {
        return;
    }
    debounce.mark_processed(&stable_path);

    let mut extra = HashMap::new();
    extra.insert("blob_name".to_string(), blob_name.clone());
    let metadata = FileMetadata {
        source_type: SourceType::AzureBlob,
        path: stable_path.clone(),
        ordinal: event.event_time.timestamp_micros(),
        size_bytes: event.data.content_length,
        mime_type: None,
        modified_timestamp: Some(event.event_time),
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
