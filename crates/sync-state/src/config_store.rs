use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use sync_core::SyncError;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::models::{ConfigChange, DataSourceConfig, SyncStatus};

const WATCH_INTERVAL: Duration = Duration::from_secs(30);

/// Persists one row per monitored source and lets the orchestrator watch
/// for inserts, updates, and deletes among the active set.
pub struct ConfigStore {
    pool: PgPool,
}

impl ConfigStore {
    pub async fn connect(database_url: &str) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| SyncError::Io(format!("connecting to config store: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent on first call.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS datasource_config (
                config_id TEXT PRIMARY KEY,
                project_id TEXT,
                source_type TEXT NOT NULL,
                source_name TEXT NOT NULL,
                connection_params JSONB NOT NULL,
                refresh_interval_seconds INT NOT NULL DEFAULT 3600 CHECK (refresh_interval_seconds >= 60),
                watchdog_filesystem_seconds INT NOT NULL DEFAULT 60,
                enable_change_stream BOOLEAN NOT NULL DEFAULT false,
                skip_graph BOOLEAN NOT NULL DEFAULT false,
                is_active BOOLEAN NOT NULL DEFAULT true,
                sync_status TEXT NOT NULL DEFAULT 'idle',
                last_sync_ordinal BIGINT,
                last_sync_completed_at TIMESTAMPTZ,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Internal(format!("creating datasource_config: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_datasource_config_project ON datasource_config (project_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("creating project index: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_datasource_config_active ON datasource_config (is_active)")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("creating active index: {e}")))?;

        Ok(())
    }

    #[instrument(skip(self, connection_params))]
    pub async fn create(&self, config: &DataSourceConfig, connection_params: JsonValue) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO datasource_config (
                config_id, project_id, source_type, source_name, connection_params,
                refresh_interval_seconds, watchdog_filesystem_seconds, enable_change_stream,
                skip_graph, is_active, sync_status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&config.config_id)
        .bind(&config.project_id)
        .bind(config.source_type.to_string())
        .bind(&config.source_name)
        .bind(connection_params)
        .bind(config.refresh_interval_seconds)
        .bind(config.watchdog_filesystem_seconds)
        .bind(config.enable_change_stream)
        .bind(config.skip_graph)
        .bind(config.is_active)
        .bind(config.sync_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Internal(format!("inserting datasource_config: {e}")))?;
        Ok(())
    }

    pub async fn read(&self, config_id: &str) -> Result<Option<DataSourceConfig>, SyncError> {
        let row = sqlx::query("SELECT * FROM datasource_config WHERE config_id = $1")
            .bind(config_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("reading datasource_config: {e}")))?;
        Ok(row.map(|r| row_to_config(&r)))
    }

    pub async fn list_all_active(&self) -> Result<Vec<DataSourceConfig>, SyncError> {
        let rows = sqlx::query("SELECT * FROM datasource_config WHERE is_active = true")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("listing active configs: {e}")))?;
        Ok(rows.iter().map(row_to_config).collect())
    }

    #[instrument(skip(self, connection_params))]
    pub async fn update(
        &self,
        config_id: &str,
        refresh_interval_seconds: Option<i32>,
        enable_change_stream: Option<bool>,
        skip_graph: Option<bool>,
        is_active: Option<bool>,
        connection_params: Option<JsonValue>,
    ) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            UPDATE datasource_config SET
                refresh_interval_seconds = COALESCE($2, refresh_interval_seconds),
                enable_change_stream = COALESCE($3, enable_change_stream),
                skip_graph = COALESCE($4, skip_graph),
                is_active = COALESCE($5, is_active),
                connection_params = COALESCE($6, connection_params),
                updated_at = now()
            WHERE config_id = $1
            "#,
        )
        .bind(config_id)
        .bind(refresh_interval_seconds)
        .bind(enable_change_stream)
        .bind(skip_graph)
        .bind(is_active)
        .bind(connection_params)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Internal(format!("updating datasource_config: {e}")))?;
        Ok(())
    }

    pub async fn delete(&self, config_id: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM datasource_config WHERE config_id = $1")
            .bind(config_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("deleting datasource_config: {e}")))?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn update_sync_status(
        &self,
        config_id: &str,
        status: SyncStatus,
        last_sync_ordinal: Option<i64>,
        last_error: Option<&str>,
    ) -> Result<(), SyncError> {
        let completed_at = matches!(status, SyncStatus::Idle).then(Utc::now);
        sqlx::query(
            r#"
            UPDATE datasource_config SET
                sync_status = $2,
                last_sync_ordinal = COALESCE($3, last_sync_ordinal),
                last_sync_completed_at = COALESCE($4, last_sync_completed_at),
                last_error = $5,
                updated_at = now()
            WHERE config_id = $1
            "#,
        )
        .bind(config_id)
        .bind(status.as_str())
        .bind(last_sync_ordinal)
        .bind(completed_at)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Internal(format!("updating sync_status: {e}")))?;
        Ok(())
    }

    /// Poll-based watch with a fixed 30 s cadence: diffs the current
    /// active set against the previously observed one and emits one
    /// `ConfigChange` per difference. Intra-tick changes are not
    /// observed.
    pub fn watch(&self) -> mpsc::Receiver<ConfigChange> {
        let (tx, rx) = mpsc::channel(64);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut known: HashMap<String, DataSourceConfig> = HashMap::new();
            let mut interval = tokio::time::interval(WATCH_INTERVAL);
            loop {
                interval.tick().await;
                let rows = match sqlx::query("SELECT * FROM datasource_config WHERE is_active = true")
                    .fetch_all(&pool)
                    .await
                {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(error = %e, "config watch poll failed");
                        continue;
                    }
                };
                let current: HashMap<String, DataSourceConfig> =
                    rows.iter().map(row_to_config).map(|c| (c.config_id.clone(), c)).collect();

                for (id, config) in &current {
                    match known.get(id) {
                        None => {
                            if tx.send(ConfigChange::Insert(config.clone())).await.is_err() {
                                return;
                            }
                        }
                        Some(prev) if prev.updated_at != config.updated_at => {
                            if tx.send(ConfigChange::Update(config.clone())).await.is_err() {
                                return;
                            }
                        }
                        Some(_) => {}
                    }
                }
                for id in known.keys() {
                    if !current.contains_key(id) {
                        if tx.send(ConfigChange::Delete(id.clone())).await.is_err() {
                            return;
                        }
                    }
                }
                debug!(count = current.len(), "config watch tick");
                known = current;
            }
        });
        rx
    }
}

fn row_to_config(row: &sqlx::postgres::PgRow) -> DataSourceConfig {
    use sync_core::SourceType;

    let source_type_str: String = row.get("source_type");
    let source_type = match source_type_str.as_str() {
        "s3" => SourceType::S3,
        "gcs" => SourceType::Gcs,
        "azure_blob" => SourceType::AzureBlob,
        "alfresco" => SourceType::Alfresco,
        "google_drive" => SourceType::GoogleDrive,
        "onedrive" => SourceType::OneDrive,
        "sharepoint" => SourceType::SharePoint,
        "box" => SourceType::Box,
        _ => SourceType::Filesystem,
    };

    DataSourceConfig {
        config_id: row.get("config_id"),
        project_id: row.get("project_id"),
        source_type,
        source_name: row.get("source_name"),
        connection_params: row.get("connection_params"),
        refresh_interval_seconds: row.get("refresh_interval_seconds"),
        watchdog_filesystem_seconds: row.get("watchdog_filesystem_seconds"),
        enable_change_stream: row.get("enable_change_stream"),
        skip_graph: row.get("skip_graph"),
        is_active: row.get("is_active"),
        sync_status: SyncStatus::from_str(row.get::<String, _>("sync_status").as_str()),
        last_sync_ordinal: row.get("last_sync_ordinal"),
        last_sync_completed_at: row.get("last_sync_completed_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}
