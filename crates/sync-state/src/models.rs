use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sync_core::SourceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "syncing" => SyncStatus::Syncing,
            "error" => SyncStatus::Error,
            _ => SyncStatus::Idle,
        }
    }
}

/// One monitored source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub config_id: String,
    pub project_id: Option<String>,
    pub source_type: SourceType,
    pub source_name: String,
    pub connection_params: JsonValue,
    pub refresh_interval_seconds: i32,
    pub watchdog_filesystem_seconds: i32,
    pub enable_change_stream: bool,
    pub skip_graph: bool,
    pub is_active: bool,
    pub sync_status: SyncStatus,
    pub last_sync_ordinal: Option<i64>,
    pub last_sync_completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Emitted by `ConfigStore::watch`.
#[derive(Debug, Clone)]
pub enum ConfigChange {
    Insert(DataSourceConfig),
    Update(DataSourceConfig),
    Delete(String),
}

/// One tracked document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentState {
    pub doc_id: String,
    pub config_id: String,
    pub source_path: String,
    pub source_id: Option<String>,
    pub ordinal: i64,
    pub content_hash: Option<String>,
    pub modified_timestamp: Option<DateTime<Utc>>,
    pub vector_synced_at: Option<DateTime<Utc>>,
    pub search_synced_at: Option<DateTime<Utc>>,
    pub graph_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of `StateStore::should_process`. `reason` is always populated
/// so callers can log a debug-level explanation even when
/// `should_process` is true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDecision {
    pub should_process: bool,
    pub reason: &'static str,
}

impl ProcessDecision {
    pub fn process(reason: &'static str) -> Self {
        Self {
            should_process: true,
            reason,
        }
    }

    pub fn skip(reason: &'static str) -> Self {
        Self {
            should_process: false,
            reason,
        }
    }
}
