//! Ties the config store, the detector factory, and the update engine
//! together: one `SourceWorker` per active `DataSourceConfig`, started
//! and stopped as `ConfigStore::watch` reports inserts, updates, and
//! deletes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sync_core::{DocumentProcessor, IndexTarget, SyncError};
use sync_detectors::DetectorFactory;
use sync_engine::UpdateEngine;
use sync_state::{ConfigChange, ConfigStore, DataSourceConfig, StateStore, StateStoreApi};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::targets::{HttpDocumentProcessor, HttpIndexTarget};
use crate::worker::SourceWorker;

pub struct IndexTargetUrls {
    pub vector: Option<String>,
    pub search: Option<String>,
    pub graph: Option<String>,
    pub extract: String,
}

pub struct Orchestrator {
    config_store: Arc<ConfigStore>,
    state_store: Arc<dyn StateStoreApi>,
    detector_factory: Arc<DetectorFactory>,
    urls: IndexTargetUrls,
    http: reqwest::Client,
    workers: Mutex<HashMap<String, Arc<SourceWorker>>>,
}

impl Orchestrator {
    pub async fn new(
        config_store: Arc<ConfigStore>,
        state_store: Arc<StateStore>,
        urls: IndexTargetUrls,
    ) -> Self {
        Self {
            config_store,
            state_store,
            detector_factory: Arc::new(DetectorFactory::new().await),
            urls,
            http: reqwest::Client::new(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn build_engine(&self, config: &DataSourceConfig) -> Arc<UpdateEngine> {
        let target = |name: &'static str, url: &Option<String>| -> Option<Arc<dyn IndexTarget>> {
            url.as_ref().map(|base| Arc::new(HttpIndexTarget::new(name, base.clone(), self.http.clone())) as Arc<dyn IndexTarget>)
        };

        let vector = target("vector", &self.urls.vector);
        let search = target("search", &self.urls.search);
        let graph = if config.skip_graph { None } else { target("graph", &self.urls.graph) };
        let processor: Arc<dyn DocumentProcessor> =
            Arc::new(HttpDocumentProcessor::new(self.urls.extract.clone(), self.http.clone()));

        Arc::new(UpdateEngine::new(vector, search, graph, processor, Arc::clone(&self.state_store)))
    }

    #[instrument(skip(self, config))]
    async fn start_worker(&self, config: DataSourceConfig) -> Result<(), SyncError> {
        if !config.is_active {
            return Ok(());
        }
        let detector = self.detector_factory.build(&config).await?;
        let engine = self.build_engine(&config);
        let worker = SourceWorker::new(
            config.config_id.clone(),
            Duration::from_secs(config.refresh_interval_seconds.max(1) as u64),
            config.enable_change_stream,
            detector,
            engine,
            Arc::clone(&self.config_store),
        );
        worker.run().await?;
        self.workers.lock().await.insert(config.config_id.clone(), worker);
        info!(config_id = %config.config_id, source_type = ?config.source_type, "source worker started");
        Ok(())
    }

    async fn stop_worker(&self, config_id: &str) {
        if let Some(worker) = self.workers.lock().await.remove(config_id) {
            worker.stop().await;
            info!(config_id, "source worker stopped");
        }
    }

    /// Loads every active config, starts its worker, then applies
    /// `ConfigStore::watch` events until `run` returns on shutdown.
    pub async fn run(&self) -> Result<(), SyncError> {
        for config in self.config_store.list_all_active().await? {
            if let Err(e) = self.start_worker(config.clone()).await {
                warn!(config_id = %config.config_id, error = %e, "failed to start source worker");
            }
        }

        let mut changes = self.config_store.watch();
        loop {
            match changes.recv().await {
                Some(ConfigChange::Insert(config)) | Some(ConfigChange::Update(config)) => {
                    self.stop_worker(&config.config_id).await;
                    if let Err(e) = self.start_worker(config.clone()).await {
                        warn!(config_id = %config.config_id, error = %e, "failed to (re)start source worker");
                    }
                }
                Some(ConfigChange::Delete(config_id)) => {
                    self.stop_worker(&config_id).await;
                }
                None => {
                    info!("config watch stream closed, shutting down orchestrator");
                    return Ok(());
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_worker(&id).await;
        }
    }

    pub async fn trigger_manual_sync(&self, config_id: &str) -> bool {
        if let Some(worker) = self.workers.lock().await.get(config_id) {
            worker.trigger_manual_sync();
            true
        } else {
            false
        }
    }
}
