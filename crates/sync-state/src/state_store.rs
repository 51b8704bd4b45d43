use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use sync_core::{SyncError, TargetKind};
use tracing::instrument;

use crate::models::{DocumentState, ProcessDecision};

/// Window within which a row with no content hash yet is assumed to have
/// just been synced by the same ingest that is now racing to backfill the
/// hash. Checked against `vector_synced_at` specifically rather than any
/// of the three targets or their maximum.
pub(crate) const RECENTLY_SYNCED_WINDOW: ChronoDuration = ChronoDuration::minutes(5);

/// Persists one row per tracked document and drives the idempotency and
/// skip/reprocess decisions every detector's events pass through.
pub struct StateStore {
    pool: PgPool,
}

impl StateStore {
    pub async fn connect(database_url: &str) -> Result<Self, SyncError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| SyncError::Io(format!("connecting to state store: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS document_state (
                doc_id TEXT PRIMARY KEY,
                config_id TEXT NOT NULL,
                source_path TEXT NOT NULL,
                source_id TEXT,
                ordinal BIGINT NOT NULL,
                content_hash TEXT,
                modified_timestamp TIMESTAMPTZ,
                vector_synced_at TIMESTAMPTZ,
                search_synced_at TIMESTAMPTZ,
                graph_synced_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Internal(format!("creating document_state: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_document_state_config ON document_state (config_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("creating config index: {e}")))?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_document_state_config_ordinal ON document_state (config_id, ordinal)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Internal(format!("creating config/ordinal index: {e}")))?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_document_state_config_source_id ON document_state (config_id, source_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Internal(format!("creating config/source_id index: {e}")))?;

        Ok(())
    }

    pub async fn get(&self, doc_id: &str) -> Result<Option<DocumentState>, SyncError> {
        let row = sqlx::query("SELECT * FROM document_state WHERE doc_id = $1")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("reading document_state: {e}")))?;
        Ok(row.as_ref().map(row_to_state))
    }

    pub async fn get_by_source_id(&self, config_id: &str, source_id: &str) -> Result<Option<DocumentState>, SyncError> {
        let row = sqlx::query("SELECT * FROM document_state WHERE config_id = $1 AND source_id = $2")
            .bind(config_id)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("reading document_state by source_id: {e}")))?;
        Ok(row.as_ref().map(row_to_state))
    }

    pub async fn get_all_for_config(&self, config_id: &str) -> Result<Vec<DocumentState>, SyncError> {
        let rows = sqlx::query("SELECT * FROM document_state WHERE config_id = $1")
            .bind(config_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("listing document_state for config: {e}")))?;
        Ok(rows.iter().map(row_to_state).collect())
    }

    /// Implements the seven-rule skip/reprocess table. Rules 4 and 6
    /// perform their own in-place update before returning: update the
    /// hash/ordinal in place, do not reprocess.
    #[instrument(skip(self, new_content_hash))]
    pub async fn should_process(
        &self,
        doc_id: &str,
        new_ordinal: i64,
        new_content_hash: &str,
    ) -> Result<ProcessDecision, SyncError> {
        let prior = match self.get(doc_id).await? {
            Some(p) => p,
            None => return Ok(ProcessDecision::process("new")),
        };

        if new_ordinal < prior.ordinal {
            return Ok(ProcessDecision::skip("file already processed (ordinal regression)"));
        }
        if new_ordinal == prior.ordinal {
            return Ok(ProcessDecision::skip("same version"));
        }

        match &prior.content_hash {
            None => {
                let recently_synced = prior
                    .vector_synced_at
                    .map(|t| Utc::now() - t < RECENTLY_SYNCED_WINDOW)
                    .unwrap_or(false);
                if recently_synced {
                    self.update_hash_only(doc_id, new_content_hash).await?;
                    Ok(ProcessDecision::skip("hash backfilled for recently synced row"))
                } else {
                    Ok(ProcessDecision::process("no prior content hash"))
                }
            }
            Some(prior_hash) if prior_hash == new_content_hash => {
                self.update_ordinal_only(doc_id, new_ordinal).await?;
                Ok(ProcessDecision::skip("content unchanged"))
            }
            Some(_) => Ok(ProcessDecision::process("content changed")),
        }
    }

    /// Upsert by `doc_id`; an incoming null `source_id` does not clobber
    /// an existing one.
    #[instrument(skip(self, state))]
    pub async fn save(&self, state: &DocumentState) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            INSERT INTO document_state (
                doc_id, config_id, source_path, source_id, ordinal, content_hash,
                modified_timestamp, vector_synced_at, search_synced_at, graph_synced_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (doc_id) DO UPDATE SET
                source_path = EXCLUDED.source_path,
                source_id = COALESCE(EXCLUDED.source_id, document_state.source_id),
                ordinal = EXCLUDED.ordinal,
                content_hash = COALESCE(EXCLUDED.content_hash, document_state.content_hash),
                modified_timestamp = COALESCE(EXCLUDED.modified_timestamp, document_state.modified_timestamp),
                vector_synced_at = COALESCE(EXCLUDED.vector_synced_at, document_state.vector_synced_at),
                search_synced_at = COALESCE(EXCLUDED.search_synced_at, document_state.search_synced_at),
                graph_synced_at = COALESCE(EXCLUDED.graph_synced_at, document_state.graph_synced_at),
                updated_at = now()
            "#,
        )
        .bind(&state.doc_id)
        .bind(&state.config_id)
        .bind(&state.source_path)
        .bind(&state.source_id)
        .bind(state.ordinal)
        .bind(&state.content_hash)
        .bind(state.modified_timestamp)
        .bind(state.vector_synced_at)
        .bind(state.search_synced_at)
        .bind(state.graph_synced_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Internal(format!("saving document_state: {e}")))?;
        Ok(())
    }

    pub async fn update_ordinal_only(&self, doc_id: &str, ordinal: i64) -> Result<(), SyncError> {
        sqlx::query("UPDATE document_state SET ordinal = $2, updated_at = now() WHERE doc_id = $1")
            .bind(doc_id)
            .bind(ordinal)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("updating ordinal: {e}")))?;
        Ok(())
    }

    pub async fn update_hash_only(&self, doc_id: &str, content_hash: &str) -> Result<(), SyncError> {
        sqlx::query("UPDATE document_state SET content_hash = $2, updated_at = now() WHERE doc_id = $1")
            .bind(doc_id)
            .bind(content_hash)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("updating content_hash: {e}")))?;
        Ok(())
    }

    pub async fn mark_target_synced(&self, doc_id: &str, target: TargetKind) -> Result<(), SyncError> {
        let column = match target {
            TargetKind::Vector => "vector_synced_at",
            TargetKind::Search => "search_synced_at",
            TargetKind::Graph => "graph_synced_at",
        };
        let sql = format!("UPDATE document_state SET {column} = now(), updated_at = now() WHERE doc_id = $1");
        sqlx::query(&sql)
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("marking {target} synced: {e}")))?;
        Ok(())
    }

    pub async fn mark_deleted(&self, doc_id: &str) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM document_state WHERE doc_id = $1")
            .bind(doc_id)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Internal(format!("deleting document_state: {e}")))?;
        Ok(())
    }
}

/// SHA-256 of the UTF-8 extracted text, hex-encoded.
pub fn compute_content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Microseconds-since-epoch derived from the best available modification
/// timestamp, else current time.
pub fn compute_ordinal(modified_timestamp: Option<DateTime<Utc>>) -> i64 {
    modified_timestamp.unwrap_or_else(Utc::now).timestamp_micros()
}

fn row_to_state(row: &sqlx::postgres::PgRow) -> DocumentState {
    DocumentState {
        doc_id: row.get("doc_id"),
        config_id: row.get("config_id"),
        source_path: row.get("source_path"),
        source_id: row.get("source_id"),
        ordinal: row.get("ordinal"),
        content_hash: row.get("content_hash"),
        modified_timestamp: row.get("modified_timestamp"),
        vector_synced_at: row.get("vector_synced_at"),
        search_synced_at: row.get("search_synced_at"),
        graph_synced_at: row.get("graph_synced_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(compute_content_hash("hello"), compute_content_hash("hello"));
        assert_ne!(compute_content_hash("hello"), compute_content_hash("hello world"));
    }

    #[test]
    fn ordinal_prefers_modified_timestamp() {
        let ts = Utc::now();
        assert_eq!(compute_ordinal(Some(ts)), ts.timestamp_micros());
    }
}
