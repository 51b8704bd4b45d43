use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sync_core::{ChangeDetector, ChangeEvent, ChangeType, DetectorEvent, FileMetadata, SourceType, SyncError};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::base::{requeue_as_create, DebounceTracker, KnownIds, DEFAULT_DEBOUNCE_WINDOW};

const PULL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct PubSubPullResponse {
    #[serde(rename = "receivedMessages", default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
struct ReceivedMessage {
    #[serde(rename = "ackId")]
    ack_id: String,
    message: PubSubMessage,
}

#[derive(Debug, Deserialize)]
struct PubSubMessage {
    #[serde(default)]
    attributes: HashMap<String, String>,
}

/// Pulls GCS object-change notifications from a Cloud Pub/Sub
/// subscription. `eventType` lives in message attributes, not the
/// payload; `OBJECT_FINALIZE` with `generation==1` is a CREATE, anything
/// else finalize-shaped is an UPDATE, and `OBJECT_DELETE`/`OBJECT_ARCHIVE`
/// are DELETE.
pub struct GcsDetector {
    bucket: String,
    subscription_url: String,
    http: reqwest::Client,
    known: KnownIds,
    debounce: DebounceTracker,
    receiver: Mutex<Option<mpsc::Receiver<DetectorEvent>>>,
    stop_flag: std::sync::Arc<tokio::sync::Notify>,
}

impl GcsDetector {
    pub fn new(bucket: String, subscription_url: String, http: reqwest::Client) -> Self {
        Self {
            bucket,
            subscription_url,
            http,
            known: KnownIds::new(),
            debounce: DebounceTracker::new(),
            receiver: Mutex::new(None),
            stop_flag: std::sync::Arc::new(tokio::sync::Notify::new()),
        }
    }

    fn stable_path(&self, object_name: &str) -> String {
        format!("{}/{object_name}", self.bucket)
    }
}

#[async_trait]
impl ChangeDetector for GcsDetector {
    fn source_type(&self) -> SourceType {
        SourceType::Gcs
    }

    async fn start(&self) -> Result<(), SyncError> {
        for file in self.list_all_files().await? {
            self.known.mark_seen(&file.path);
        }

        let (tx, rx) = mpsc::channel(256);
        *self.receiver.lock().await = Some(rx);

        let http = self.http.clone();
        let url = self.subscription_url.clone();
        let known = self.known.clone();
        let debounce = self.debounce.clone();
        let stop_flag = std::sync::Arc::clone(&self.stop_flag);
        let bucket = self.bucket.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PULL_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_flag.notified() => return,
                    _ = ticker.tick() => {
                        match http.post(format!("{url}:pull")).json(&serde_json::json!({"maxMessages": 50})).send().await {
                            Ok(resp) => match resp.json::<PubSubPullResponse>().await {
                                Ok(body) => {
                                    for received in body.received_messages {
                                        handle_message(&received.message, &bucket, &known, &debounce, &tx).await;
                                        let _ = http.post(format!("{url}:acknowledge")).json(&serde_json::json!({"ackIds": [received.ack_id]})).send().await;
                                    }
                                }
                                Err(e) => warn!(error = %e, "decoding Pub/Sub pull response failed"),
                            },
                            Err(e) => warn!(error = %e, "Pub/Sub pull failed"),
                        }
                    }
                }
            }
        });

        info!(bucket = %self.bucket, "GCS detector started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        self.stop_flag.notify_waiters();
        self.receiver.lock().await.take();
        Ok(())
    }

    async fn list_all_files(&self) -> Result<Vec<FileMetadata>, SyncError> {
        #[derive(Deserialize)]
        struct ObjectsResponse {
            #[serde(default)]
            items: Vec<ObjectItem>,
            #[serde(rename = "nextPageToken")]
            next_page_token: Option<String>,
        }
        #[derive(Deserialize)]
        struct ObjectItem {
            name: String,
            size: Option<String>,
            updated: Option<DateTime<Utc>>,
            generation: Option<String>,
        }

        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .http
                .get(format!("https://storage.googleapis.com/storage/v1/b/{}/o", self.bucket));
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let response = request
                .send()
                .await
                .map_err(|e| SyncError::Transient(format!("listing gcs bucket {}: {e}", self.bucket)))?
                .json::<ObjectsResponse>()
                .await
                .map_err(|e| SyncError::Transient(format!("decoding gcs listing: {e}")))?;

            for item in response.items {
                let mut extra = HashMap::new();
                extra.insert("object_key".to_string(), item.name.clone());
                if let Some(generation) = &item.generation {
                    extra.insert("generation".to_string(), generation.clone());
                }
                files.push(FileMetadata {
                    source_type: SourceType::Gcs,
                    path: self.stable_path(&item.name),
                    ordinal: item.updated.map(|t| t.timestamp_micros()).unwrap_or_else(|| Utc::now().timestamp_micros()),
                    size_bytes: item.size.and_then(|s| s.parse().ok()),
                    mime_type: None,
                    modified_timestamp: item.updated,
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
        let object_name = path.strip_prefix(&format!("{}/", self.bucket)).unwrap_or(path);
        let encoded = urlencoding_slashes(object_name);
        let url = format!(
            "https://storage.googleapis.com/storage/v1/b/{}/o/{encoded}?alt=media",
            self.bucket
        );
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("fetching gcs object {object_name}: {e}")))?
            .bytes()
            .await
            .map_err(|e| SyncError::Io(format!("reading gcs object body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

fn urlencoding_slashes(object_name: &str) -> String {
    object_name.replace('/', "%2F")
}

async fn handle_message(
    message: &PubSubMessage,
    bucket: &str,
    known: &KnownIds,
    debounce: &DebounceTracker,
    tx: &mpsc::Sender<DetectorEvent>,
) {
    let Some(event_type) = message.attributes.get("eventType") else { return };
    let Some(object_name) = message.attributes.get("objectId") else { return };
    let generation = message.attributes.get("objectGeneration").map(String::as_str);

    let change_type = match event_type.as_str() {
        "OBJECT_FINALIZE" => {
            if generation == Some("1") {
                ChangeType::Create
            } else {
                ChangeType::Update
            }
        }
        "OBJECT_DELETE" | "OBJECT_ARCHIVE" => ChangeType::Delete,
        _ => return,
    };

    let stable_path = format!("{bucket}/{object_name}");
    if debounce.is_debounced(&stable_path, DEFAULT_DEBOUNCE_WINDOW) {
        return;
    }
    debounce.mark_processed(&stable_path);

    let mut extra = HashMap::new();
    extra.insert("object_key".to_string(), object_name.clone());
    let metadata = FileMetadata {
        source_type: SourceType::Gcs,
        path: stable_path.clone(),
        ordinal: Utc::now().timestamp_micros(),
        size_bytes: None,
        mime_type: None,
        modified_timestamp: Some(Utc::now()),
        extra,
    };

    let event = match change_type {
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
    let _ = tx.send(DetectorEvent::Event(event)).await;
}
