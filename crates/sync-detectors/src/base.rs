//! Shared building blocks every detector variant is built from: the
//! known-ids set, the debounce tracker, the start-time staleness
//! filter, and the MODIFY-DELETE requeue callback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use sync_core::{ChangeEvent, ChangeType, DetectorEvent, FileMetadata, ModifyCallback};
use tokio::sync::mpsc;

/// Dedup window shared by detectors that emit bursty duplicate
/// notifications.
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(30);

/// Tracks the last time an id was *processed* so a detector can drop
/// duplicate notifications without suppressing the first event of a
/// genuinely new burst. The window resets on every processed event, not
/// on every arriving event.
/// Cloning a `DebounceTracker` yields another handle onto the same
/// shared map (cheap `Arc` clone), so it can be handed to a spawned task
/// without detaching from the detector's view of debounce state.
#[derive(Clone, Default)]
pub struct DebounceTracker {
    last_processed: Arc<DashMap<String, Instant>>,
}

impl DebounceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `key` is still inside its debounce window and the caller
    /// should drop the event.
    pub fn is_debounced(&self, key: &str, window: Duration) -> bool {
        self.last_processed.get(key).is_some_and(|last| last.elapsed() < window)
    }

    pub fn mark_processed(&self, key: &str) {
        self.last_processed.insert(key.to_string(), Instant::now());
    }
}

/// The in-memory set of document identifiers a detector has already
/// seen, seeded by one full listing at `start()` before any event
/// subscription opens.
/// Cloning a `KnownIds` yields another handle onto the same shared set
/// (cheap `Arc` clone); see `DebounceTracker`.
#[derive(Clone, Default)]
pub struct KnownIds {
    ids: Arc<DashSet<String>>,
}

impl KnownIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, ids: impl IntoIterator<Item = String>) {
        for id in ids {
            self.ids.insert(id);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn remove(&self, id: &str) {
        self.ids.remove(id);
    }

    /// Inserts `id` if absent and reports whether it was new. This is
    /// the shared CREATE-vs-MODIFY test every backend-integrated
    /// detector applies.
    pub fn mark_seen(&self, id: &str) -> bool {
        self.ids.insert(id.to_string())
    }
}

/// Discards change-feed events whose timestamp predates the detector's
/// own start time when no durable cursor is available, otherwise a
/// restart would replay all history.
pub struct StartTimeFilter {
    started_at: DateTime<Utc>,
}

impl StartTimeFilter {
    pub fn new() -> Self {
        Self { started_at: Utc::now() }
    }

    pub fn is_stale(&self, event_time: DateTime<Utc>) -> bool {
        event_time < self.started_at
    }
}

/// Builds the deferred ADD half of a MODIFY-DELETE pair: once the
/// engine's delete half completes, this re-injects the same path as a
/// fresh CREATE on the detector's own event channel, so the engine
/// re-fetches current content, re-processes it, and re-upserts it under
/// the same `doc_id` instead of leaving the document missing.
pub fn requeue_as_create(tx: mpsc::Sender<DetectorEvent>, metadata: FileMetadata) -> ModifyCallback {
    Box::new(move || {
        Box::pin(async move {
            let _ = tx.send(DetectorEvent::Event(ChangeEvent::new(ChangeType::Create, metadata))).await;
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_ids_reports_new_once() {
        let ids = KnownIds::new();
        assert!(ids.mark_seen("a"));
        assert!(!ids.mark_seen("a"));
    }

    #[test]
    fn debounce_blocks_within_window() {
        let tracker = DebounceTracker::new();
        tracker.mark_processed("k");
        assert!(tracker.is_debounced("k", Duration::from_secs(30)));
        assert!(!tracker.is_debounced("other", Duration::from_secs(30)));
    }

    #[test]
    fn start_time_filter_rejects_past_events() {
        let filter = StartTimeFilter::new();
        let past = Utc::now() - chrono::Duration::seconds(60);
        assert!(filter.is_stale(past));
        assert!(!filter.is_stale(Utc::now() + chrono::Duration::seconds(5)));
    }
}
