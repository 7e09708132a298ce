//! Sync driver
//!
//! Flushes the sync queue to a [`MutationSink`] one item at a time in FIFO
//! order. Each pass works on a snapshot and settles the results back into
//! the queue; items that reach the retry ceiling are moved to the
//! dead-letter store.
//!
//! Passes never overlap. A trigger that arrives while a pass is running is
//! skipped with [`SkipReason::InProgress`]; anything it would have sent is
//! picked up by the next pass.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use storage::{Clock, DeadLetterStore, PassOutcome, SyncQueue, SyncQueueItem};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::connectivity::ConnectivityState;

/// Delivery error types
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeliveryError {
    /// The server answered with a non-success status
    #[error("Rejected with HTTP {status}: {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// The request never got an answer
    #[error("Transport error: {0}")]
    Transport(String),

    /// The delivery exceeded its time budget
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type for deliveries
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Destination of queued mutations
///
/// A delivery either succeeds or fails; there is no partial success.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MutationSink: Send + Sync {
    /// Deliver one mutation
    async fn deliver(&self, item: &SyncQueueItem) -> Result<()>;
}

/// Why a sync pass did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The device is offline
    Offline,
    /// Nothing is queued
    EmptyQueue,
    /// Another pass is running
    InProgress,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Offline => write!(f, "offline"),
            SkipReason::EmptyQueue => write!(f, "empty queue"),
            SkipReason::InProgress => write!(f, "pass in progress"),
        }
    }
}

/// Summary of a sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Items attempted
    pub attempted: usize,
    /// Items delivered and removed
    pub delivered: usize,
    /// Items that failed and stay queued
    pub retried: usize,
    /// Items that reached the retry ceiling
    pub dropped: usize,
    /// Items left in the queue after the pass
    pub remaining: usize,
    /// Set when the pass did not run
    pub skipped: Option<SkipReason>,
}

impl SyncReport {
    /// A report for a pass that did not run
    pub fn skipped(reason: SkipReason) -> Self {
        Self { skipped: Some(reason), ..Default::default() }
    }
}

/// Events emitted by the offline layer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Online or reconnecting flag changed
    ConnectivityChanged(ConnectivityState),
    /// A sync pass finished
    PassCompleted(SyncReport),
    /// A mutation was moved to the dead-letter store
    ItemDropped {
        /// Item id
        id: String,
        /// Target endpoint
        endpoint: String,
        /// Failed attempts
        retries: u32,
        /// Error of the last attempt
        error: String,
    },
}

/// Delivers queued mutations and settles the results
pub struct SyncDriver {
    queue: Arc<SyncQueue>,
    dead_letters: Arc<DeadLetterStore>,
    sink: Arc<dyn MutationSink>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    delivery_timeout: Option<Duration>,
    pass_lock: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncDriver {
    /// Create a driver over the given queue and sink
    pub fn new(
        queue: Arc<SyncQueue>,
        dead_letters: Arc<DeadLetterStore>,
        sink: Arc<dyn MutationSink>,
        clock: Arc<dyn Clock>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            queue,
            dead_letters,
            sink,
            clock,
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            delivery_timeout: None,
            pass_lock: Mutex::new(()),
            events,
        }
    }

    /// Set the retry ceiling
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Bound each delivery
    pub fn with_delivery_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Whether a pass is currently running
    pub fn is_syncing(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    /// Run one sync pass
    pub async fn sync_data(&self, is_online: bool) -> SyncReport {
        if !is_online {
            debug!("Skipping sync pass while offline");
            return SyncReport::skipped(SkipReason::Offline);
        }

        let Ok(_pass) = self.pass_lock.try_lock() else {
            debug!("Sync pass already running");
            return SyncReport::skipped(SkipReason::InProgress);
        };

        let items = self.queue.snapshot().await;
        if items.is_empty() {
            return SyncReport::skipped(SkipReason::EmptyQueue);
        }

        info!(pending = items.len(), "Starting sync pass");

        let mut outcome = PassOutcome::new();
        for item in &items {
            match self.deliver(item).await {
                Ok(()) => {
                    debug!(item_id = %item.id, endpoint = %item.endpoint, "Delivered mutation");
                    outcome.record_success(item.id.clone());
                }
                Err(e) => {
                    warn!(
                        item_id = %item.id,
                        endpoint = %item.endpoint,
                        retries = item.retries,
                        error = %e,
                        "Failed to deliver mutation"
                    );
                    outcome.record_failure(item.id.clone(), e.to_string());
                }
            }
        }

        let settlement = self.queue.settle(&outcome, self.max_retries).await;
        let now = self.clock.now_millis();

        for dropped in &settlement.dropped {
            error!(
                item_id = %dropped.item.id,
                endpoint = %dropped.item.endpoint,
                retries = dropped.item.retries,
                error = %dropped.error,
                "Dropping mutation after final retry"
            );
            let _ = self.events.send(SyncEvent::ItemDropped {
                id: dropped.item.id.clone(),
                endpoint: dropped.item.endpoint.clone(),
                retries: dropped.item.retries,
                error: dropped.error.clone(),
            });
        }

        let dropped_count = settlement.dropped.len();
        for dropped in settlement.dropped {
            self.dead_letters.record(dropped.item, dropped.error, now).await;
        }

        let report = SyncReport {
            attempted: items.len(),
            delivered: settlement.delivered,
            retried: settlement.retried,
            dropped: dropped_count,
            remaining: settlement.remaining,
            skipped: None,
        };

        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            retried = report.retried,
            dropped = report.dropped,
            remaining = report.remaining,
            "Sync pass finished"
        );
        let _ = self.events.send(SyncEvent::PassCompleted(report.clone()));
        report
    }

    async fn deliver(&self, item: &SyncQueueItem) -> Result<()> {
        match self.delivery_timeout {
            Some(limit) => tokio::time::timeout(limit, self.sink.deliver(item))
                .await
                .unwrap_or(Err(DeliveryError::Timeout(limit))),
            None => self.sink.deliver(item).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use storage::{KvStore, ManualClock, SyncAction, DEFAULT_DEAD_LETTER_KEY, DEFAULT_QUEUE_KEY};

    /// Sink that answers per endpoint from a script, succeeding once it runs out
    #[derive(Default)]
    struct ScriptedSink {
        script: SyncMutex<HashMap<String, VecDeque<bool>>>,
        calls: SyncMutex<Vec<String>>,
    }

    impl ScriptedSink {
        fn fail_times(self, endpoint: &str, times: usize) -> Self {
            self.script
                .lock()
                .insert(endpoint.to_string(), std::iter::repeat(false).take(times).collect());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl MutationSink for ScriptedSink {
        async fn deliver(&self, item: &SyncQueueItem) -> Result<()> {
            self.calls.lock().push(item.endpoint.clone());
            let ok = self
                .script
                .lock()
                .get_mut(&item.endpoint)
                .and_then(|answers| answers.pop_front())
                .unwrap_or(true);
            if ok {
                Ok(())
            } else {
                Err(DeliveryError::Rejected { status: 503, message: "unavailable".to_string() })
            }
        }
    }

    struct Fixture {
        driver: SyncDriver,
        queue: Arc<SyncQueue>,
        dead_letters: Arc<DeadLetterStore>,
        events: broadcast::Receiver<SyncEvent>,
    }

    async fn fixture(sink: Arc<dyn MutationSink>) -> Fixture {
        let kv = Arc::new(KvStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(1_000));
        let queue = Arc::new(SyncQueue::load(kv.clone(), clock.clone(), DEFAULT_QUEUE_KEY).await);
        let dead_letters = Arc::new(DeadLetterStore::load(kv, DEFAULT_DEAD_LETTER_KEY, 10).await);
        let (tx, events) = broadcast::channel(32);
        let driver = SyncDriver::new(queue.clone(), dead_letters.clone(), sink, clock, tx);
        Fixture { driver, queue, dead_letters, events }
    }

    #[tokio::test]
    async fn test_offline_is_noop() {
        let mut sink = MockMutationSink::new();
        sink.expect_deliver().never();
        let f = fixture(Arc::new(sink)).await;
        f.queue.enqueue(SyncAction::Create, "/bookings", json!({})).await;

        let report = f.driver.sync_data(false).await;
        assert_eq!(report.skipped, Some(SkipReason::Offline));
        assert_eq!(f.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        let mut sink = MockMutationSink::new();
        sink.expect_deliver().never();
        let mut f = fixture(Arc::new(sink)).await;

        let report = f.driver.sync_data(true).await;
        assert_eq!(report.skipped, Some(SkipReason::EmptyQueue));
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_all_delivered_empties_queue() {
        let mut sink = MockMutationSink::new();
        sink.expect_deliver().times(2).returning(|_| Ok(()));
        let f = fixture(Arc::new(sink)).await;

        f.queue.enqueue(SyncAction::Create, "/bookings", json!({"slot": 9})).await;
        f.queue.enqueue(SyncAction::Delete, "/bookings/7", json!(null)).await;

        let report = f.driver.sync_data(true).await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.remaining, 0);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_items() {
        let sink = Arc::new(ScriptedSink::default().fail_times("/a", 1));
        let f = fixture(sink.clone()).await;

        f.queue.enqueue(SyncAction::Update, "/a", json!({})).await;
        f.queue.enqueue(SyncAction::Update, "/b", json!({})).await;

        let report = f.driver.sync_data(true).await;
        assert_eq!(sink.calls(), vec!["/a", "/b"]);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.retried, 1);

        let remaining = f.queue.snapshot().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].endpoint, "/a");
        assert_eq!(remaining[0].retries, 1);
    }

    #[tokio::test]
    async fn test_three_pass_retry_then_success() {
        let sink = Arc::new(ScriptedSink::default().fail_times("/a", 2));
        let f = fixture(sink.clone()).await;

        f.queue.enqueue(SyncAction::Create, "/a", json!({"n": 1})).await;
        f.queue.enqueue(SyncAction::Create, "/b", json!({"n": 2})).await;

        let first = f.driver.sync_data(true).await;
        assert_eq!((first.delivered, first.retried, first.remaining), (1, 1, 1));
        assert_eq!(f.queue.snapshot().await[0].retries, 1);

        let second = f.driver.sync_data(true).await;
        assert_eq!((second.delivered, second.retried, second.remaining), (0, 1, 1));
        assert_eq!(f.queue.snapshot().await[0].retries, 2);

        let third = f.driver.sync_data(true).await;
        assert_eq!((third.delivered, third.retried, third.remaining), (1, 0, 0));
        assert!(f.queue.is_empty().await);
        assert!(f.dead_letters.is_empty().await);
        assert_eq!(sink.calls(), vec!["/a", "/b", "/a", "/a"]);
    }

    #[tokio::test]
    async fn test_retry_ceiling_moves_item_to_dead_letters() {
        let sink = Arc::new(ScriptedSink::default().fail_times("/a", 10));
        let mut f = fixture(sink).await;
        let item = f.queue.enqueue(SyncAction::Create, "/a", json!({})).await;

        f.driver.sync_data(true).await;
        f.driver.sync_data(true).await;
        let last = f.driver.sync_data(true).await;

        assert_eq!(last.dropped, 1);
        assert!(f.queue.is_empty().await);

        let letters = f.dead_letters.list().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].item.id, item.id);
        assert_eq!(letters[0].item.retries, 3);
        assert_eq!(letters[0].failed_at, 1_000);
        assert!(letters[0].last_error.contains("503"));

        let mut dropped_event = None;
        while let Ok(event) = f.events.try_recv() {
            if let SyncEvent::ItemDropped { id, retries, .. } = event {
                dropped_event = Some((id, retries));
            }
        }
        assert_eq!(dropped_event, Some((item.id, 3)));
    }

    #[tokio::test]
    async fn test_custom_retry_ceiling() {
        let sink = Arc::new(ScriptedSink::default().fail_times("/a", 10));
        let Fixture { driver, queue, dead_letters, .. } = fixture(sink).await;
        let driver = driver.with_max_retries(1);

        queue.enqueue(SyncAction::Create, "/a", json!({})).await;
        let report = driver.sync_data(true).await;

        assert_eq!(report.dropped, 1);
        assert_eq!(dead_letters.len().await, 1);
    }

    #[tokio::test]
    async fn test_pass_completed_event() {
        let mut sink = MockMutationSink::new();
        sink.expect_deliver().returning(|_| Ok(()));
        let mut f = fixture(Arc::new(sink)).await;
        f.queue.enqueue(SyncAction::Create, "/bookings", json!({})).await;

        let report = f.driver.sync_data(true).await;
        assert_eq!(f.events.try_recv().unwrap(), SyncEvent::PassCompleted(report));
    }

    struct SlowSink;

    #[async_trait]
    impl MutationSink for SlowSink {
        async fn deliver(&self, _item: &SyncQueueItem) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_timeout_counts_as_failure() {
        let Fixture { driver, queue, .. } = fixture(Arc::new(SlowSink)).await;
        let driver = driver.with_delivery_timeout(Some(Duration::from_secs(5)));
        queue.enqueue(SyncAction::Update, "/slow", json!({})).await;

        let report = driver.sync_data(true).await;
        assert_eq!(report.retried, 1);
        assert_eq!(queue.snapshot().await[0].retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_pass_is_skipped() {
        let f = fixture(Arc::new(SlowSink)).await;
        f.queue.enqueue(SyncAction::Update, "/slow", json!({})).await;

        let driver = Arc::new(f.driver);
        let running = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.sync_data(true).await })
        };
        for _ in 0..10 {
            if driver.is_syncing() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(driver.is_syncing());

        let second = driver.sync_data(true).await;
        assert_eq!(second.skipped, Some(SkipReason::InProgress));

        let first = running.await.unwrap();
        assert_eq!(first.delivered, 1);
        assert!(!driver.is_syncing());
    }

    #[tokio::test]
    async fn test_item_enqueued_during_pass_survives() {
        struct EnqueueingSink {
            queue: SyncMutex<Option<Arc<SyncQueue>>>,
        }

        #[async_trait]
        impl MutationSink for EnqueueingSink {
            async fn deliver(&self, _item: &SyncQueueItem) -> Result<()> {
                let queue = self.queue.lock().take();
                if let Some(queue) = queue {
                    queue.enqueue(SyncAction::Create, "/late", json!({})).await;
                }
                Ok(())
            }
        }

        let sink = Arc::new(EnqueueingSink { queue: SyncMutex::new(None) });
        let f = fixture(sink.clone()).await;
        *sink.queue.lock() = Some(f.queue.clone());
        f.queue.enqueue(SyncAction::Create, "/early", json!({})).await;

        let report = f.driver.sync_data(true).await;
        assert_eq!(report.delivered, 1);

        let remaining = f.queue.snapshot().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].endpoint, "/late");
        assert_eq!(remaining[0].retries, 0);
    }
}
