use std::collections::HashSet;
use std::sync::Arc;

use sync_core::{
    make_doc_id, ChangeDetector, ChangeEvent, ChangeType, DocumentProcessor, FileMetadata, IndexTarget, SourceType,
    SyncError, TargetKind,
};
use sync_state::{DocumentState, StateStoreApi};
use tracing::{debug, instrument, warn};

/// Reconciles one `ChangeEvent` at a time against up to three index
/// targets and the state store. Vector, search, and graph are each
/// optional: disabled globally by omission or per-config via
/// `skip_graph`.
pub struct UpdateEngine {
    vector: Option<Arc<dyn IndexTarget>>,
    search: Option<Arc<dyn IndexTarget>>,
    graph: Option<Arc<dyn IndexTarget>>,
    processor: Arc<dyn DocumentProcessor>,
    state: Arc<dyn StateStoreApi>,
}

impl UpdateEngine {
    pub fn new(
        vector: Option<Arc<dyn IndexTarget>>,
        search: Option<Arc<dyn IndexTarget>>,
        graph: Option<Arc<dyn IndexTarget>>,
        processor: Arc<dyn DocumentProcessor>,
        state: Arc<dyn StateStoreApi>,
    ) -> Self {
        Self {
            vector,
            search,
            graph,
            processor,
            state,
        }
    }

    fn enabled_targets(&self) -> Vec<(TargetKind, &Arc<dyn IndexTarget>)> {
        let mut targets = Vec::with_capacity(3);
        if let Some(t) = &self.vector {
            targets.push((TargetKind::Vector, t));
        }
        if let Some(t) = &self.search {
            targets.push((TargetKind::Search, t));
        }
        if let Some(t) = &self.graph {
            targets.push((TargetKind::Graph, t));
        }
        targets
    }

    /// Every row this engine writes carries a stable `doc_id`
    /// (`<config_id>:<stable_path>`), and targets are always upserted
    /// under that id, filesystem included.
    fn resolve_target_id(&self, row: &DocumentState, _source_type: SourceType) -> String {
        row.doc_id.clone()
    }

    async fn lookup_existing(&self, config_id: &str, event: &ChangeEvent, doc_id: &str) -> Result<Option<DocumentState>, SyncError> {
        if let Some(source_id) = event.metadata.source_native_id() {
            if let Some(row) = self.state.get_by_source_id(config_id, source_id).await? {
                return Ok(Some(row));
            }
        }
        self.state.get(doc_id).await
    }

    #[instrument(skip(self, event), fields(change_type = ?event.change_type, path = %event.metadata.path))]
    async fn handle_delete(&self, event: ChangeEvent, config_id: &str) -> Result<(), SyncError> {
        let doc_id = make_doc_id(config_id, &event.metadata.path);
        let existing = self.lookup_existing(config_id, &event, &doc_id).await?;

        let Some(row) = existing else {
            debug!(doc_id = %doc_id, "delete for document with no known state, skipping");
            if event.is_modify_delete {
                if let Some(callback) = event.modify_callback {
                    callback().await?;
                }
            }
            return Ok(());
        };

        let target_id = self.resolve_target_id(&row, event.metadata.source_type);
        for (kind, target) in self.enabled_targets() {
            if let Err(e) = target.delete(&target_id).await {
                warn!(target = %kind, doc_id = %target_id, error = %e, "delete failed on target, treating version conflicts as already-deleted");
            }
        }

        self.state.mark_deleted(&row.doc_id).await?;

        if event.is_modify_delete {
            if let Some(callback) = event.modify_callback {
                callback().await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self, event, detector), fields(change_type = ?event.change_type, path = %event.metadata.path))]
    async fn handle_create_update(
        &self,
        event: ChangeEvent,
        detector: &Arc<dyn ChangeDetector>,
        config_id: &str,
    ) -> Result<(), SyncError> {
        let doc_id = make_doc_id(config_id, &event.metadata.path);
        let prior = self.lookup_existing(config_id, &event, &doc_id).await?;

        if let Some(row) = &prior {
            if row.modified_timestamp.is_some() && row.modified_timestamp == event.metadata.modified_timestamp {
                self.state.update_ordinal_only(&row.doc_id, event.metadata.ordinal).await?;
                return Ok(());
            }
        }

        let bytes = detector.load_file_content(&event.metadata.path).await?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let content_hash = sync_state::compute_content_hash(&text);

        let decision = self.state.should_process(&doc_id, event.metadata.ordinal, &content_hash).await?;
        if !decision.should_process {
            debug!(doc_id = %doc_id, reason = decision.reason, "skipping document");
            return Ok(());
        }

        let parsed_docs = self.processor.process(&bytes, &event.metadata).await?;

        let already_indexed = prior
            .as_ref()
            .is_some_and(|row| row.vector_synced_at.is_some() || row.search_synced_at.is_some() || row.graph_synced_at.is_some());
        if already_indexed {
            if let Some(row) = &prior {
                let target_id = self.resolve_target_id(row, event.metadata.source_type);
                for (kind, target) in self.enabled_targets() {
                    if let Err(e) = target.delete(&target_id).await {
                        warn!(target = %kind, doc_id = %target_id, error = %e, "pre-upsert delete failed");
                    }
                }
            }
        }

        let source_id = event.metadata.source_native_id().map(String::from);
        let new_state = DocumentState {
            doc_id: doc_id.clone(),
            config_id: config_id.to_string(),
            source_path: event.metadata.path.clone(),
            source_id: source_id.or_else(|| prior.as_ref().and_then(|r| r.source_id.clone())),
            ordinal: event.metadata.ordinal,
            content_hash: Some(content_hash),
            modified_timestamp: event.metadata.modified_timestamp,
            vector_synced_at: prior.as_ref().and_then(|r| r.vector_synced_at),
            search_synced_at: prior.as_ref().and_then(|r| r.search_synced_at),
            graph_synced_at: prior.as_ref().and_then(|r| r.graph_synced_at),
            created_at: prior.as_ref().map(|r| r.created_at).unwrap_or_else(chrono::Utc::now),
            updated_at: chrono::Utc::now(),
        };
        self.state.save(&new_state).await?;

        for parsed in &parsed_docs {
            if let Some(target) = &self.vector {
                match target.upsert(&doc_id, &parsed.text, &parsed.metadata).await {
                    Ok(()) => self.state.mark_target_synced(&doc_id, TargetKind::Vector).await?,
                    Err(e) => warn!(error = %e, doc_id = %doc_id, "vector upsert failed"),
                }
            }
            if let Some(target) = &self.search {
                match target.upsert(&doc_id, &parsed.text, &parsed.metadata).await {
                    Ok(()) => self.state.mark_target_synced(&doc_id, TargetKind::Search).await?,
                    Err(e) => warn!(error = %e, doc_id = %doc_id, "search upsert failed"),
                }
            }
            if let Some(target) = &self.graph {
                match target.upsert(&doc_id, &parsed.text, &parsed.metadata).await {
                    Ok(()) => self.state.mark_target_synced(&doc_id, TargetKind::Graph).await?,
                    Err(e) => warn!(error = %e, doc_id = %doc_id, "graph upsert failed"),
                }
            }
        }

        Ok(())
    }

    pub async fn handle_event(&self, event: ChangeEvent, detector: &Arc<dyn ChangeDetector>, config_id: &str) -> Result<(), SyncError> {
        match event.change_type {
            ChangeType::Delete => self.handle_delete(event, config_id).await,
            ChangeType::Create | ChangeType::Update => self.handle_create_update(event, detector, config_id).await,
        }
    }

    /// Processes a batch without letting one document's failure abort the
    /// rest; each failure is logged and the next event still runs.
    pub async fn process_batch(&self, events: Vec<ChangeEvent>, detector: &Arc<dyn ChangeDetector>, config_id: &str) {
        for event in events {
            if let Err(e) = self.handle_event(event, detector, config_id).await {
                warn!(error = %e, config_id = %config_id, "engine failed to process event, continuing");
            }
        }
    }

    /// Lists the detector's full inventory, diffs it against recorded
    /// state, and synthesizes UPDATE/DELETE events for every difference.
    /// Returns the maximum ordinal observed across the inventory so the
    /// caller can record the worker's watermark.
    #[instrument(skip(self, detector), fields(config_id))]
    pub async fn periodic_refresh(&self, detector: &Arc<dyn ChangeDetector>, config_id: &str) -> Result<i64, SyncError> {
        let inventory = detector.list_all_files().await?;
        let existing_rows = self.state.get_all_for_config(config_id).await?;
        let existing_by_doc_id: std::collections::HashMap<String, DocumentState> =
            existing_rows.into_iter().map(|row| (row.doc_id.clone(), row)).collect();

        let mut max_ordinal = 0i64;
        let mut seen_doc_ids = HashSet::with_capacity(inventory.len());

        for file in inventory {
            let doc_id = make_doc_id(config_id, &file.path);
            max_ordinal = max_ordinal.max(file.ordinal);
            seen_doc_ids.insert(doc_id.clone());

            let is_new = !existing_by_doc_id.contains_key(&doc_id);
            if is_new && detector.skips_periodic_refresh_for_new_docs() {
                debug!(doc_id = %doc_id, "new document deferred to event stream, skipping in periodic refresh");
                continue;
            }

            let event = ChangeEvent::new(ChangeType::Update, file);
            if let Err(e) = self.handle_event(event, detector, config_id).await {
                warn!(error = %e, doc_id = %doc_id, "periodic refresh update failed");
            }
        }

        for (doc_id, row) in existing_by_doc_id {
            if seen_doc_ids.contains(&doc_id) {
                continue;
            }
            let metadata = FileMetadata {
                source_type: detector.source_type(),
                path: row.source_path.clone(),
                ordinal: row.ordinal,
                size_bytes: None,
                mime_type: None,
                modified_timestamp: row.modified_timestamp,
                extra: Default::default(),
            };
            let event = ChangeEvent::new(ChangeType::Delete, metadata);
            if let Err(e) = self.handle_event(event, detector, config_id).await {
                warn!(error = %e, doc_id = %doc_id, "periodic refresh delete failed");
            }
        }

        Ok(max_ordinal)
    }
}
