//! In-memory `StateStoreApi` double for engine/detector integration
//! tests, mirroring `StateStore`'s rules without a Postgres pool.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sync_core::{SyncError, TargetKind};

use crate::models::{DocumentState, ProcessDecision};
use crate::state_store::RECENTLY_SYNCED_WINDOW;
use crate::traits::StateStoreApi;

#[derive(Default)]
pub struct InMemoryStateStore {
    rows: Mutex<HashMap<String, DocumentState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl StateStoreApi for InMemoryStateStore {
    async fn get(&self, doc_id: &str) -> Result<Option<DocumentState>, SyncError> {
        Ok(self.rows.lock().unwrap().get(doc_id).cloned())
    }

    async fn get_by_source_id(&self, config_id: &str, source_id: &str) -> Result<Option<DocumentState>, SyncError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|row| row.config_id == config_id && row.source_id.as_deref() == Some(source_id))
            .cloned())
    }

    async fn get_all_for_config(&self, config_id: &str) -> Result<Vec<DocumentState>, SyncError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.config_id == config_id)
            .cloned()
            .collect())
    }

    async fn should_process(
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

    async fn save(&self, state: &DocumentState) -> Result<(), SyncError> {
        let mut rows = self.rows.lock().unwrap();
        let merged = match rows.get(&state.doc_id) {
            Some(existing) => DocumentState {
                source_id: state.source_id.clone().or_else(|| existing.source_id.clone()),
                content_hash: state.content_hash.clone().or_else(|| existing.content_hash.clone()),
                modified_timestamp: state.modified_timestamp.or(existing.modified_timestamp),
                vector_synced_at: state.vector_synced_at.or(existing.vector_synced_at),
                search_synced_at: state.search_synced_at.or(existing.search_synced_at),
                graph_synced_at: state.graph_synced_at.or(existing.graph_synced_at),
                created_at: existing.created_at,
                ..state.clone()
            },
            None => state.clone(),
        };
        rows.insert(state.doc_id.clone(), merged);
        Ok(())
    }

    async fn update_ordinal_only(&self, doc_id: &str, ordinal: i64) -> Result<(), SyncError> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(doc_id) {
            row.ordinal = ordinal;
        }
        Ok(())
    }

    async fn mark_target_synced(&self, doc_id: &str, target: TargetKind) -> Result<(), SyncError> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(doc_id) {
            let now = Some(Utc::now());
            match target {
                TargetKind::Vector => row.vector_synced_at = now,
                TargetKind::Search => row.search_synced_at = now,
                TargetKind::Graph => row.graph_synced_at = now,
            }
        }
        Ok(())
    }

    async fn mark_deleted(&self, doc_id: &str) -> Result<(), SyncError> {
        self.rows.lock().unwrap().remove(doc_id);
        Ok(())
    }
}

impl InMemoryStateStore {
    async fn update_hash_only(&self, doc_id: &str, content_hash: &str) -> Result<(), SyncError> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(doc_id) {
            row.content_hash = Some(content_hash.to_string());
        }
        Ok(())
    }
}
