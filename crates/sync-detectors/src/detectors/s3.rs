use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sync_core::{ChangeDetector, ChangeEvent, ChangeType, DetectorEvent, FileMetadata, SourceType, SyncError};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::base::{requeue_as_create, DebounceTracker, KnownIds, DEFAULT_DEBOUNCE_WINDOW};

/// SQS long-poll wait time.
const SQS_WAIT_SECONDS: i32 = 20;

#[derive(Debug, Deserialize)]
struct S3EventRecord {
    #[serde(rename = "eventName")]
    event_name: String,
    s3: S3EventInner,
}

#[derive(Debug, Deserialize)]
struct S3EventInner {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct S3EventEnvelope {
    #[serde(rename = "Records")]
    records: Vec<S3EventRecord>,
}

/// Watches bucket notifications through an SQS queue bound to the
/// bucket, falling back to periodic-only reconciliation when no queue is
/// configured. The SQS receive call is blocking in the official SDK's
/// long-poll mode, so it runs on a dedicated blocking task rather than
/// the async runtime.
pub struct S3Detector {
    bucket: String,
    prefix: Option<String>,
    queue_url: Option<String>,
    client: S3Client,
    sqs_client: Option<aws_sdk_sqs::Client>,
    known: KnownIds,
    debounce: DebounceTracker,
    receiver: Mutex<Option<mpsc::Receiver<DetectorEvent>>>,
    stop_flag: Arc<tokio::sync::Notify>,
}

impl S3Detector {
    pub fn new(
        bucket: String,
        prefix: Option<String>,
        queue_url: Option<String>,
        client: S3Client,
        sqs_client: Option<aws_sdk_sqs::Client>,
    ) -> Self {
        Self {
            bucket,
            prefix,
            queue_url,
            client,
            sqs_client,
            known: KnownIds::new(),
            debounce: DebounceTracker::new(),
            receiver: Mutex::new(None),
            stop_flag: Arc::new(tokio::sync::Notify::new()),
        }
    }

    fn stable_path(&self, key: &str) -> String {
        format!("{}/{key}", self.bucket)
    }
}

#[async_trait]
impl ChangeDetector for S3Detector {
    fn source_type(&self) -> SourceType {
        SourceType::S3
    }

    async fn start(&self) -> Result<(), SyncError> {
        for file in self.list_all_files().await? {
            self.known.mark_seen(&file.path);
        }

        let (tx, rx) = mpsc::channel(256);
        *self.receiver.lock().await = Some(rx);

        let Some(queue_url) = self.queue_url.clone() else {
            warn!(bucket = %self.bucket, "S3 detector has no SQS queue configured; relying on periodic refresh only");
            return Ok(());
        };
        let Some(sqs) = self.sqs_client.clone() else {
            warn!(bucket = %self.bucket, "SQS queue configured without an SQS client; relying on periodic refresh only");
            return Ok(());
        };

        let bucket = self.bucket.clone();
        let prefix = self.prefix.clone();
        let stop_flag = Arc::clone(&self.stop_flag);
        let known = self.known.clone();
        let debounce = self.debounce.clone();
        tokio::spawn(async move {
            loop {
                let receive = sqs
                    .receive_message()
                    .queue_url(&queue_url)
                    .wait_time_seconds(SQS_WAIT_SECONDS)
                    .max_number_of_messages(10);
                tokio::select! {
                    _ = stop_flag.notified() => return,
                    result = receive.send() => {
                        match result {
                            Ok(output) => {
                                for message in output.messages() {
                                    let Some(body) = message.body() else { continue };
                                    handle_message(body, &prefix, &known, &debounce, &tx).await;
                                    if let Some(receipt) = message.receipt_handle() {
                                        let _ = sqs.delete_message().queue_url(&queue_url).receipt_handle(receipt).send().await;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "S3 SQS receive failed");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }
        });

        info!(bucket = %self.bucket, "S3 detector started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        self.stop_flag.notify_waiters();
        self.receiver.lock().await.take();
        Ok(())
    }

    async fn list_all_files(&self) -> Result<Vec<FileMetadata>, SyncError> {
        let mut files = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(prefix) = &self.prefix {
                request = request.prefix(prefix);
            }
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| SyncError::Transient(format!("listing s3://{}: {e}", self.bucket)))?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                let modified = object.last_modified().and_then(|t| {
                    DateTime::from_timestamp(t.secs(), t.subsec_nanos()).map(|dt| dt.timestamp_micros())
                });
                let mut extra = HashMap::new();
                extra.insert("object_key".to_string(), key.to_string());
                files.push(FileMetadata {
                    source_type: SourceType::S3,
                    path: self.stable_path(key),
                    ordinal: modified.unwrap_or_else(|| Utc::now().timestamp_micros()),
                    size_bytes: object.size().map(|s| s as u64),
                    mime_type: None,
                    modified_timestamp: modified.and_then(DateTime::from_timestamp_micros),
                    extra,
                });
            }

            continuation_token = output.next_continuation_token().map(String::from);
            if continuation_token.is_none() {
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
        self.queue_url.is_some()
    }

    async fn load_file_content(&self, path: &str) -> Result<Vec<u8>, SyncError> {
        let key = path.strip_prefix(&format!("{}/", self.bucket)).unwrap_or(path);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("fetching s3://{}/{key}: {e}", self.bucket)))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| SyncError::Io(format!("reading s3 body: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }
}

async fn handle_message(
    body: &str,
    prefix: &Option<String>,
    known: &KnownIds,
    debounce: &DebounceTracker,
    tx: &mpsc::Sender<DetectorEvent>,
) {
    // SNS wraps the raw S3 notification in a `Message` field; unwrap it
    // when present.
    let unwrapped: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return,
    };
    let raw = unwrapped
        .get("Message")
        .and_then(|m| m.as_str())
        .map(String::from)
        .unwrap_or_else(|| body.to_string());

    let Ok(envelope) = serde_json::from_str::<S3EventEnvelope>(&raw) else {
        return;
    };

    for record in envelope.records {
        if let Some(p) = prefix {
            if !record.s3.object.key.starts_with(p) {
                continue;
            }
        }
        let change_type = if record.event_name.starts_with("ObjectCreated") {
            ChangeType::Create
        } else if record.event_name.starts_with("ObjectRemoved") {
            ChangeType::Delete
        } else {
            continue;
        };
        let stable_path = format!("{}/{}", record.s3.bucket.name, record.s3.object.key);

        if debounce.is_debounced(&stable_path, DEFAULT_DEBOUNCE_WINDOW) {
            continue;
        }
        debounce.mark_processed(&stable_path);

        let mut extra = HashMap::new();
        extra.insert("object_key".to_string(), record.s3.object.key.clone());
        let metadata = FileMetadata {
            source_type: SourceType::S3,
            path: stable_path.clone(),
            ordinal: Utc::now().timestamp_micros(),
            size_bytes: record.s3.object.size,
            mime_type: None,
            modified_timestamp: Some(Utc::now()),
            extra,
        };

        // Shared event-to-action mapping: DELETE passes through and
        // drops the id from `known`; CREATE/UPDATE for an id already
        // seen synthesizes the MODIFY-DELETE pair instead of
        // a plain CREATE.
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
        if tx.send(DetectorEvent::Event(event)).await.is_err() {
            return;
        }
    }
}
