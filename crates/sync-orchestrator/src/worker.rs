//! One `SourceWorker` runs exactly one `DataSourceConfig`'s periodic
//! refresh loop, plus an event-stream loop when the source has one.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sync_core::ChangeDetector;
use sync_engine::UpdateEngine;
use sync_state::{ConfigStore, SyncStatus};
use tokio::sync::Notify;
use tracing::{error, info, instrument, warn};

/// Grace period before the first periodic refresh, letting a burst of
/// workers starting together spread their first database hit out a
/// little instead of landing in the same instant.
const INITIAL_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How long the event-stream loop sleeps after a detector error before
/// retrying.
const EVENT_STREAM_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct SourceWorker {
    config_id: String,
    refresh_interval: Duration,
    enable_change_stream: bool,
    detector: Arc<dyn ChangeDetector>,
    engine: Arc<UpdateEngine>,
    config_store: Arc<ConfigStore>,
    stop: Arc<Notify>,
    manual_trigger: Arc<Notify>,
    last_ordinal: AtomicI64,
}

impl SourceWorker {
    pub fn new(
        config_id: String,
        refresh_interval: Duration,
        enable_change_stream: bool,
        detector: Arc<dyn ChangeDetector>,
        engine: Arc<UpdateEngine>,
        config_store: Arc<ConfigStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config_id,
            refresh_interval,
            enable_change_stream,
            detector,
            engine,
            config_store,
            stop: Arc::new(Notify::new()),
            manual_trigger: Arc::new(Notify::new()),
            last_ordinal: AtomicI64::new(0),
        })
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    /// The highest ordinal observed by the most recently completed
    /// periodic refresh.
    pub fn last_ordinal(&self) -> i64 {
        self.last_ordinal.load(Ordering::Relaxed)
    }

    /// Spawns the periodic-refresh task and, when this source has its own
    /// event stream, a second task consuming it. Returns once both tasks
    /// are spawned; they run until `stop()` is called.
    #[instrument(skip(self), fields(config_id = %self.config_id))]
    pub async fn run(self: &Arc<Self>) -> Result<(), sync_core::SyncError> {
        self.detector.start().await?;

        let refresh_worker = Arc::clone(self);
        tokio::spawn(async move { refresh_worker.run_periodic_refresh().await });

        if self.enable_change_stream && self.detector.has_event_stream() {
            let changes = self.detector.get_changes().await?;
            let event_worker = Arc::clone(self);
            tokio::spawn(async move { event_worker.run_event_stream(changes).await });
        }

        Ok(())
    }

    async fn run_periodic_refresh(self: Arc<Self>) {
        tokio::select! {
            _ = tokio::time::sleep(INITIAL_GRACE_PERIOD) => {},
            _ = self.stop.notified() => return,
        }

        loop {
            if let Err(e) = self.config_store.update_sync_status(&self.config_id, SyncStatus::Syncing, None, None).await {
                warn!(error = %e, config_id = %self.config_id, "failed to mark source syncing");
            }

            match self.engine.periodic_refresh(&self.detector, &self.config_id).await {
                Ok(ordinal) => {
                    self.last_ordinal.store(ordinal, Ordering::Relaxed);
                    if let Err(e) = self
                        .config_store
                        .update_sync_status(&self.config_id, SyncStatus::Idle, Some(ordinal), None)
                        .await
                    {
                        warn!(error = %e, config_id = %self.config_id, "failed to mark source idle");
                    }
                }
                Err(e) => {
                    error!(error = %e, config_id = %self.config_id, "periodic refresh failed");
                    if let Err(store_err) = self
                        .config_store
                        .update_sync_status(&self.config_id, SyncStatus::Error, None, Some(&e.to_string()))
                        .await
                    {
                        warn!(error = %store_err, config_id = %self.config_id, "failed to record sync error");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.refresh_interval) => {},
                _ = self.manual_trigger.notified() => {
                    info!(config_id = %self.config_id, "manual sync triggered");
                },
                _ = self.stop.notified() => return,
            }
        }
    }

    async fn run_event_stream(self: Arc<Self>, mut changes: tokio::sync::mpsc::Receiver<sync_core::DetectorEvent>) {
        loop {
            tokio::select! {
                event = changes.recv() => {
                    let Some(event) = event else {
                        info!(config_id = %self.config_id, "event stream closed");
                        return;
                    };
                    match event {
                        sync_core::DetectorEvent::Event(change_event) => {
                            if let Err(e) = self.engine.handle_event(change_event, &self.detector, &self.config_id).await {
                                warn!(error = %e, config_id = %self.config_id, "event processing failed, retrying after delay");
                                tokio::time::sleep(EVENT_STREAM_RETRY_DELAY).await;
                            }
                        }
                        sync_core::DetectorEvent::Idle => {}
                        sync_core::DetectorEvent::End => {
                            info!(config_id = %self.config_id, "detector ended its change sequence");
                            return;
                        }
                    }
                }
                _ = self.stop.notified() => return,
            }
        }
    }

    pub fn trigger_manual_sync(&self) {
        self.manual_trigger.notify_one();
    }

    pub async fn stop(&self) {
        self.stop.notify_waiters();
        if let Err(e) = self.detector.stop().await {
            warn!(error = %e, config_id = %self.config_id, "detector stop failed");
        }
    }
}
