use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sync_core::{ChangeDetector, ChangeEvent, ChangeType, DetectorEvent, FileMetadata, SourceType, SyncError};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::alfresco_broadcaster::StompConnection;
use crate::base::{requeue_as_create, DebounceTracker, KnownIds, DEFAULT_DEBOUNCE_WINDOW};

/// Listens to Alfresco's `alfresco.repo.event2` repository event topic
/// over a connection shared with every other detector on the same
/// broker, filtering to nodes under one monitored folder and collapsing
/// thumbnail-rendition churn that the repository emits alongside real
/// content updates.
pub struct AlfrescoDetector {
    detector_id: String,
    repository_url: String,
    monitored_folder_id: String,
    http: reqwest::Client,
    connection: Arc<StompConnection>,
    known: KnownIds,
    debounce: DebounceTracker,
    receiver: Mutex<Option<mpsc::Receiver<DetectorEvent>>>,
}

impl AlfrescoDetector {
    pub fn new(
        detector_id: String,
        repository_url: String,
        monitored_folder_id: String,
        http: reqwest::Client,
        connection: Arc<StompConnection>,
    ) -> Self {
        Self {
            detector_id,
            repository_url,
            monitored_folder_id,
            http,
            connection,
            known: KnownIds::new(),
            debounce: DebounceTracker::new(),
            receiver: Mutex::new(None),
        }
    }

    fn stable_path(&self, node_id: &str) -> String {
        format!("alfresco://{node_id}")
    }

    async fn list_children(&self, folder_id: &str, out: &mut Vec<FileMetadata>) -> Result<(), SyncError> {
        #[derive(Deserialize)]
        struct ChildrenResponse {
            list: ChildrenList,
        }
        #[derive(Deserialize)]
        struct ChildrenList {
            pagination: Pagination,
            entries: Vec<ChildEntry>,
        }
        #[derive(Deserialize)]
        struct Pagination {
            #[serde(rename = "hasMoreItems")]
            has_more_items: bool,
        }
        #[derive(Deserialize)]
        struct ChildEntry {
            entry: NodeEntry,
        }
        #[derive(Deserialize)]
        struct NodeEntry {
            id: String,
            name: String,
            #[serde(rename = "isFile")]
            is_file: bool,
            #[serde(rename = "isFolder")]
            is_folder: bool,
            #[serde(rename = "modifiedAt")]
            modified_at: Option<DateTime<Utc>>,
            content: Option<NodeContent>,
        }
        #[derive(Deserialize)]
        struct NodeContent {
            #[serde(rename = "mimeType")]
            mime_type: Option<String>,
            #[serde(rename = "sizeInBytes")]
            size_in_bytes: Option<u64>,
        }

        let mut skip_count = 0u32;
        loop {
            let url = format!(
                "{}/alfresco/api/-default-/public/alfresco/versions/1/nodes/{folder_id}/children?maxItems=100&skipCount={skip_count}",
                self.repository_url
            );
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| SyncError::Transient(format!("listing alfresco folder {folder_id}: {e}")))?
                .json::<ChildrenResponse>()
                .await
                .map_err(|e| SyncError::Transient(format!("decoding alfresco children: {e}")))?;

            for child in &response.list.entries {
                let entry = &child.entry;
                if entry.is_folder {
                    Box::pin(self.list_children(&entry.id, out)).await?;
                    continue;
                }
                if !entry.is_file {
                    continue;
                }
                let mut extra = HashMap::new();
                extra.insert("node_name".to_string(), entry.name.clone());
                out.push(FileMetadata {
                    source_type: SourceType::Alfresco,
                    path: self.stable_path(&entry.id),
                    ordinal: entry.modified_at.map(|t| t.timestamp_micros()).unwrap_or_else(|| Utc::now().timestamp_micros()),
                    size_bytes: entry.content.as_ref().and_then(|c| c.size_in_bytes),
                    mime_type: entry.content.as_ref().and_then(|c| c.mime_type.clone()),
                    modified_timestamp: entry.modified_at,
                    extra,
                });
            }

            if !response.list.pagination.has_more_items {
                break;
            }
            skip_count += response.list.entries.len() as u32;
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeDetector for AlfrescoDetector {
    fn source_type(&self) -> SourceType {
        SourceType::Alfresco
    }

    async fn start(&self) -> Result<(), SyncError> {
        for file in self.list_all_files().await? {
            self.known.mark_seen(&file.path);
        }

        let mut broker_rx = self.connection.register(self.detector_id.clone());
        let (tx, rx) = mpsc::channel(256);
        *self.receiver.lock().await = Some(rx);

        let known = self.known.clone();
        let debounce = self.debounce.clone();
        let monitored_folder_id = self.monitored_folder_id.clone();
        tokio::spawn(async move {
            while let Some(event) = broker_rx.recv().await {
                handle_cloud_event(event, &monitored_folder_id, &known, &debounce, &tx).await;
            }
            debug!("alfresco broadcaster channel closed");
        });

        info!(folder = %self.monitored_folder_id, "Alfresco detector started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), SyncError> {
        self.connection.unregister(&self.detector_id);
        self.receiver.lock().await.take();
        Ok(())
    }

    async fn list_all_files(&self) -> Result<Vec<FileMetadata>, SyncError> {
        let mut files = Vec::new();
        self.list_children(&self.monitored_folder_id, &mut files).await?;
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
        let node_id = path.strip_prefix("alfresco://").unwrap_or(path);
        let url = format!(
            "{}/alfresco/api/-default-/public/alfresco/versions/1/nodes/{node_id}/content",
            self.repository_url
        );
        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("fetching alfresco content for {node_id}: {e}")))?
            .bytes()
            .await
            .map_err(|e| SyncError::Io(format!("reading alfresco content body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Deserialize)]
struct NodeResource {
    #[serde(rename = "id")]
    node_id: String,
    name: Option<String>,
    #[serde(rename = "nodeType")]
    node_type: Option<String>,
    #[serde(rename = "isFile", default)]
    is_file: bool,
    #[serde(rename = "modifiedAt")]
    modified_at: Option<DateTime<Utc>>,
    #[serde(rename = "primaryHierarchy", default)]
    primary_hierarchy: Vec<String>,
    content: Option<NodeResourceContent>,
}

#[derive(Debug, Deserialize)]
struct NodeResourceContent {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "sizeInBytes")]
    size_in_bytes: Option<u64>,
}

async fn handle_cloud_event(
    event: JsonValue,
    monitored_folder_id: &str,
    known: &KnownIds,
    debounce: &DebounceTracker,
    tx: &mpsc::Sender<DetectorEvent>,
) {
    let Some(event_type) = event.get("type").and_then(JsonValue::as_str) else {
        return;
    };
    let change_type = match event_type {
        "org.alfresco.event.node.Created" => ChangeType::Create,
        "org.alfresco.event.node.Updated" => ChangeType::Update,
        "org.alfresco.event.node.Deleted" => ChangeType::Delete,
        _ => return,
    };

    let Some(resource_value) = event.pointer("/data/resource") else {
        return;
    };
    let Ok(resource) = serde_json::from_value::<NodeResource>(resource_value.clone()) else {
        return;
    };
    if !resource.is_file && change_type != ChangeType::Delete {
        return;
    }
    if !resource.primary_hierarchy.iter().any(|ancestor| ancestor == monitored_folder_id) {
        return;
    }
    // Renditions (thumbnails, previews) surface as updates to a child
    // rendition node, not the document itself; drop them so a thumbnail
    // regeneration doesn't masquerade as a content change.
    if resource
        .node_type
        .as_deref()
        .is_some_and(|t| t.eq_ignore_ascii_case("cm:thumbnail") || t.eq_ignore_ascii_case("rn:rendition"))
    {
        return;
    }

    let stable_path = format!("alfresco://{}", resource.node_id);
    if debounce.is_debounced(&stable_path, DEFAULT_DEBOUNCE_WINDOW) {
        return;
    }
    debounce.mark_processed(&stable_path);

    let mut extra = HashMap::new();
    if let Some(name) = &resource.name {
        extra.insert("node_name".to_string(), name.clone());
    }
    let metadata = FileMetadata {
        source_type: SourceType::Alfresco,
        path: stable_path.clone(),
        ordinal: resource.modified_at.map(|t| t.timestamp_micros()).unwrap_or_else(|| Utc::now().timestamp_micros()),
        size_bytes: resource.content.as_ref().and_then(|c| c.size_in_bytes),
        mime_type: resource.content.as_ref().and_then(|c| c.mime_type.clone()),
        modified_timestamp: resource.modified_at,
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

    if tx.send(DetectorEvent::Event(mapped)).await.is_err() {
        warn!("alfresco event channel closed while dispatching");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn thumbnail_update_is_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        let known = KnownIds::new();
        let debounce = DebounceTracker::new();
        let event = json!({
            "type": "org.alfresco.event.node.Updated",
            "data": {
                "resource": {
                    "id": "node-1",
                    "isFile": true,
                    "nodeType": "cm:thumbnail",
                    "primaryHierarchy": ["folder-1"],
                }
            }
        });
        handle_cloud_event(event, "folder-1", &known, &debounce, &tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn event_outside_monitored_folder_is_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        let known = KnownIds::new();
        let debounce = DebounceTracker::new();
        let event = json!({
            "type": "org.alfresco.event.node.Created",
            "data": {
                "resource": {
                    "id": "node-2",
                    "isFile": true,
                    "primaryHierarchy": ["other-folder"],
                }
            }
        });
        handle_cloud_event(event, "folder-1", &known, &debounce, &tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn new_node_in_monitored_folder_yields_create() {
        let (tx, mut rx) = mpsc::channel(8);
        let known = KnownIds::new();
        let debounce = DebounceTracker::new();
        let event = json!({
            "type": "org.alfresco.event.node.Created",
            "data": {
                "resource": {
                    "id": "node-3",
                    "isFile": true,
                    "primaryHierarchy": ["folder-1"],
                }
            }
        });
        handle_cloud_event(event, "folder-1", &known, &debounce, &tx).await;
        let DetectorEvent::Event(change) = rx.try_recv().unwrap() else { panic!("expected event") };
        assert_eq!(change.change_type, ChangeType::Create);
    }
}
