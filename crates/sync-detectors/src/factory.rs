//! Builds a `ChangeDetector` for a `DataSourceConfig`, wiring each
//! variant's source-specific connection parameters out of the config's
//! free-form `connection_params` JSON and sharing the resources that
//! make sense shared across an entire process (HTTP client, AWS SDK
//! clients, the Alfresco STOMP broker registry).

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use sync_core::{ChangeDetector, SourceType, SyncError};
use sync_state::DataSourceConfig;

use crate::alfresco_broadcaster::StompBroadcasterRegistry;
use crate::detectors::alfresco::AlfrescoDetector;
use crate::detectors::azure_blob::AzureBlobDetector;
use crate::detectors::box_detector::BoxDetector;
use crate::detectors::filesystem::FilesystemDetector;
use crate::detectors::gcs::GcsDetector;
use crate::detectors::google_drive::GoogleDriveDetector;
use crate::detectors::onedrive_sharepoint::MsGraphDetector;
use crate::detectors::s3::S3Detector;

pub struct DetectorFactory {
    http: reqwest::Client,
    s3_client: aws_sdk_s3::Client,
    sqs_client: aws_sdk_sqs::Client,
    stomp_registry: Arc<StompBroadcasterRegistry>,
}

impl DetectorFactory {
    pub async fn new() -> Self {
        let aws_cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            http: reqwest::Client::new(),
            s3_client: aws_sdk_s3::Client::new(&aws_cfg),
            sqs_client: aws_sdk_sqs::Client::new(&aws_cfg),
            stomp_registry: Arc::new(StompBroadcasterRegistry::new()),
        }
    }

    pub async fn build(&self, config: &DataSourceConfig) -> Result<Arc<dyn ChangeDetector>, SyncError> {
        let params = &config.connection_params;
        let detector: Arc<dyn ChangeDetector> = match config.source_type {
            SourceType::Filesystem => {
                let roots = string_array(params, "roots")?.into_iter().map(PathBuf::from).collect();
                Arc::new(FilesystemDetector::new(roots))
            }
            SourceType::S3 => {
                let bucket = required_string(params, "bucket", config)?;
                let prefix = optional_string(params, "prefix");
                let queue_url = optional_string(params, "queue_url");
                let sqs_client = queue_url.as_ref().map(|_| self.sqs_client.clone());
                Arc::new(S3Detector::new(bucket, prefix, queue_url, self.s3_client.clone(), sqs_client))
            }
            SourceType::Gcs => {
                let bucket = required_string(params, "bucket", config)?;
                let subscription_url = required_string(params, "subscription_url", config)?;
                Arc::new(GcsDetector::new(bucket, subscription_url, self.http.clone()))
            }
            SourceType::AzureBlob => {
                let account_url = required_string(params, "account_url", config)?;
                let container = required_string(params, "container", config)?;
                Arc::new(AzureBlobDetector::new(account_url, container, self.http.clone()))
            }
            SourceType::Alfresco => {
                let repository_url = required_string(params, "repository_url", config)?;
                let monitored_folder_id = required_string(params, "monitored_folder_id", config)?;
                let host = required_string(params, "stomp_host", config)?;
                let port = params
                    .get("stomp_port")
                    .and_then(JsonValue::as_u64)
                    .ok_or_else(|| SyncError::Configuration(format!("{}: missing stomp_port", config.config_id)))? as u16;
                let destination = optional_string(params, "stomp_destination")
                    .unwrap_or_else(|| "/topic/alfresco.repo.event2".to_string());
                let connection = self.stomp_registry.connect(&host, port, &destination).await?;
                Arc::new(AlfrescoDetector::new(
                    config.config_id.clone(),
                    repository_url,
                    monitored_folder_id,
                    self.http.clone(),
                    connection,
                ))
            }
            SourceType::GoogleDrive => {
                let folder_id = required_string(params, "folder_id", config)?;
                Arc::new(GoogleDriveDetector::new(folder_id, self.http.clone()))
            }
            SourceType::OneDrive | SourceType::SharePoint => {
                let drive_id = required_string(params, "drive_id", config)?;
                Arc::new(MsGraphDetector::new(
                    config.source_type,
                    drive_id,
                    self.http.clone(),
                    config.enable_change_stream,
                ))
            }
            SourceType::Box => {
                let root_folder_id = required_string(params, "root_folder_id", config)?;
                Arc::new(BoxDetector::new(root_folder_id, self.http.clone()))
            }
        };
        Ok(detector)
    }
}

fn required_string(params: &JsonValue, key: &str, config: &DataSourceConfig) -> Result<String, SyncError> {
    optional_string(params, key)
        .ok_or_else(|| SyncError::Configuration(format!("{}: missing connection_params.{key}", config.config_id)))
}

fn optional_string(params: &JsonValue, key: &str) -> Option<String> {
    params.get(key).and_then(JsonValue::as_str).map(String::from)
}

fn string_array(params: &JsonValue, key: &str) -> Result<Vec<String>, SyncError> {
    params
        .get(key)
        .and_then(JsonValue::as_array)
        .map(|items| items.iter().filter_map(JsonValue::as_str).map(String::from).collect())
        .ok_or_else(|| SyncError::Configuration(format!("missing connection_params.{key} array")))
}
