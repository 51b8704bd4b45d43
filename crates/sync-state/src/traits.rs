//! Trait surface over `StateStore` so `sync-engine` can be exercised
//! against an in-memory double instead of a live Postgres pool.

use async_trait::async_trait;
use sync_core::{SyncError, TargetKind};

use crate::models::{DocumentState, ProcessDecision};

#[async_trait]
pub trait StateStoreApi: Send + Sync {
    async fn get(&self, doc_id: &str) -> Result<Option<DocumentState>, SyncError>;

    async fn get_by_source_id(&self, config_id: &str, source_id: &str) -> Result<Option<DocumentState>, SyncError>;

    async fn get_all_for_config(&self, config_id: &str) -> Result<Vec<DocumentState>, SyncError>;

    async fn should_process(
        &self,
        doc_id: &str,
        new_ordinal: i64,
        new_content_hash: &str,
    ) -> Result<ProcessDecision, SyncError>;

    async fn save(&self, state: &DocumentState) -> Result<(), SyncError>;

    async fn update_ordinal_only(&self, doc_id: &str, ordinal: i64) -> Result<(), SyncError>;

    async fn mark_target_synced(&self, doc_id: &str, target: TargetKind) -> Result<(), SyncError>;

    async fn mark_deleted(&self, doc_id: &str) -> Result<(), SyncError>;
}

#[async_trait]
impl StateStoreApi for crate::state_store::StateStore {
    async fn get(&self, doc_id: &str) -> Result<Option<DocumentState>, SyncError> {
        crate::state_store::StateStore::get(self, doc_id).await
    }

    async fn get_by_source_id(&self, config_id: &str, source_id: &str) -> Result<Option<DocumentState>, SyncError> {
        crate::state_store::StateStore::get_by_source_id(self, config_id, source_id).await
    }

    async fn get_all_for_config(&self, config_id: &str) -> Result<Vec<DocumentState>, SyncError> {
        crate::state_store::StateStore::get_all_for_config(self, config_id).await
    }

    async fn should_process(
        &self,
        doc_id: &str,
        new_ordinal: i64,
        new_content_hash: &str,
    ) -> Result<ProcessDecision, SyncError> {
        crate::state_store::StateStore::should_process(self, doc_id, new_ordinal, new_content_hash).await
    }

    async fn save(&self, state: &DocumentState) -> Result<(), SyncError> {
        crate::state_store::StateStore::save(self, state).await
    }

    async fn update_ordinal_only(&self, doc_id: &str, ordinal: i64) -> Result<(), SyncError> {
        crate::state_store::StateStore::update_ordinal_only(self, doc_id, ordinal).await
    }

    async fn mark_target_synced(&self, doc_id: &str, target: TargetKind) -> Result<(), SyncError> {
        crate::state_store::StateStore::mark_target_synced(self, doc_id, target).await
    }

    async fn mark_deleted(&self, doc_id: &str) -> Result<(), SyncError> {
        crate::state_store::StateStore::mark_deleted(self, doc_id).await
    }
}
