//! Play notifications for the shop's analytics.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::catalog::{ProductId, TrackIndex};

/// A stream that started successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayEvent {
    pub product_id: ProductId,
    pub track: TrackIndex,
    /// Resolved source URL or path
    pub url: String,
    pub at: DateTime<Utc>,
}

impl PlayEvent {
    pub fn new(product_id: ProductId, track: TrackIndex, url: impl Into<String>) -> Self {
        Self {
            product_id,
            track,
            url: url.into(),
            at: Utc::now(),
        }
    }
}

/// Errors reported by a notifier; logged and otherwise ignored.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Play notification rejected: {reason}")]
    Rejected { reason: String },
}

/// Receives play notifications.
#[async_trait]
pub trait PlayNotifier: Send + Sync {
    /// # Errors
    ///
    /// - `NotifyError::Rejected` - Collector refused or failed to record the play
    async fn record_play(&self, event: PlayEvent) -> Result<(), NotifyError>;
}

/// Sends `event` on a detached task so the stream never waits on analytics.
pub fn notify_detached(notifier: Arc<dyn PlayNotifier>, event: PlayEvent) {
    tokio::spawn(async move {
        let product_id = event.product_id;
        if let Err(e) = notifier.record_play(event).await {
            tracing::warn!("Play notification for product {} failed: {}", product_id, e);
        }
    });
}

/// In-process play counters.
#[derive(Debug, Default)]
pub struct PlayCounter {
    counts: RwLock<HashMap<ProductId, u64>>,
}

impl PlayCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, product_id: ProductId) -> u64 {
        self.counts.read().get(&product_id).copied().unwrap_or(0)
    }

    /// All counters, ordered by product id.
    pub fn snapshot(&self) -> BTreeMap<ProductId, u64> {
        self.counts
            .read()
            .iter()
            .map(|(id, count)| (*id, *count))
            .collect()
    }
}

#[async_trait]
impl PlayNotifier for PlayCounter {
    async fn record_play(&self, event: PlayEvent) -> Result<(), NotifyError> {
        tracing::trace!(
            "Play recorded for product {} track {}",
            event.product_id,
            event.track
        );
        *self.counts.write().entry(event.product_id).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct FailingNotifier;

    #[async_trait]
    impl PlayNotifier for FailingNotifier {
        async fn record_play(&self, _event: PlayEvent) -> Result<(), NotifyError> {
            Err(NotifyError::Rejected {
                reason: "collector offline".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_counter_increments_per_product() {
        let counter = PlayCounter::new();
        for _ in 0..3 {
            counter
                .record_play(PlayEvent::new(1, TrackIndex::new("0_1"), "/a.mp3"))
                .await
                .unwrap();
        }
        counter
            .record_play(PlayEvent::new(2, TrackIndex::new("0_2"), "/b.mp3"))
            .await
            .unwrap();

        assert_eq!(counter.count(1), 3);
        assert_eq!(counter.count(3), 0);
        assert_eq!(counter.snapshot().into_iter().collect::<Vec<_>>(), vec![(1, 3), (2, 1)]);
    }

    #[tokio::test]
    async fn test_detached_notification_delivers() {
        let counter = Arc::new(PlayCounter::new());
        notify_detached(
            counter.clone(),
            PlayEvent::new(5, TrackIndex::new("a"), "/a.mp3"),
        );

        for _ in 0..50 {
            if counter.count(5) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("notification was not delivered");
    }

    #[tokio::test]
    async fn test_failing_notifier_is_contained() {
        notify_detached(
            Arc::new(FailingNotifier),
            PlayEvent::new(5, TrackIndex::new("a"), "/a.mp3"),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
