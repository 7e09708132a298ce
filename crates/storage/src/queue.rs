//! Persisted sync queue
//!
//! Pending mutations (create/update/delete against a named endpoint) are
//! kept in insertion order and mirrored into storage after every change so
//! they survive restarts.
//!
//! All mutations go through one async mutex. A sync pass works on a
//! snapshot and hands its results back to [`SyncQueue::settle`], which
//! recomputes the queue from the *current* contents, so items enqueued
//! while a pass was in flight are kept.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::{NoContext, Timestamp, Uuid};

use crate::clock::Clock;
use crate::kv::{KeyValueStorage, KvError};

/// Storage key of the persisted queue
pub const DEFAULT_QUEUE_KEY: &str = "@sync_queue";

/// Queue error types
#[derive(Debug, Error)]
pub enum QueueError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// KV store error
    #[error("KV store error: {0}")]
    Kv(#[from] KvError),
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    /// Create a resource
    Create,
    /// Update a resource
    Update,
    /// Delete a resource
    Delete,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncAction::Create => write!(f, "create"),
            SyncAction::Update => write!(f, "update"),
            SyncAction::Delete => write!(f, "delete"),
        }
    }
}

/// A mutation waiting to be delivered to the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Time-ordered identifier (enqueue time plus random bits)
    pub id: String,
    /// Kind of mutation
    pub action: SyncAction,
    /// Target resource path
    pub endpoint: String,
    /// Mutation payload
    pub data: serde_json::Value,
    /// Enqueue time in milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Number of failed delivery attempts
    #[serde(default)]
    pub retries: u32,
}

impl SyncQueueItem {
    /// Build a fresh item stamped at `now_millis`
    pub fn new(
        action: SyncAction,
        endpoint: impl Into<String>,
        data: serde_json::Value,
        now_millis: u64,
    ) -> Self {
        Self {
            id: generate_id(now_millis),
            action,
            endpoint: endpoint.into(),
            data,
            timestamp: now_millis,
            retries: 0,
        }
    }
}

fn generate_id(now_millis: u64) -> String {
    let ts = Timestamp::from_unix(
        NoContext,
        now_millis / 1_000,
        ((now_millis % 1_000) * 1_000_000) as u32,
    );
    Uuid::new_v7(ts).to_string()
}

/// Per-item results of one sync pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    completed: HashSet<String>,
    failed: HashMap<String, String>,
}

impl PassOutcome {
    /// Create an empty outcome
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivered item
    pub fn record_success(&mut self, id: impl Into<String>) {
        self.completed.insert(id.into());
    }

    /// Record a failed delivery and its error message
    pub fn record_failure(&mut self, id: impl Into<String>, error: impl Into<String>) {
        self.failed.insert(id.into(), error.into());
    }
}

/// An item removed after reaching the retry ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedItem {
    /// The item, with its final retry count
    pub item: SyncQueueItem,
    /// Error of the last failed attempt
    pub error: String,
}

/// Result of applying a [`PassOutcome`] to the queue
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settlement {
    /// Items removed after successful delivery
    pub delivered: usize,
    /// Failed items kept for the next pass
    pub retried: usize,
    /// Items removed after reaching the retry ceiling
    pub dropped: Vec<DroppedItem>,
    /// Items left in the queue
    pub remaining: usize,
}

/// Ordered, persisted queue of pending mutations
pub struct SyncQueue {
    storage: Arc<dyn KeyValueStorage>,
    clock: Arc<dyn Clock>,
    key: String,
    items: Mutex<Vec<SyncQueueItem>>,
}

impl SyncQueue {
    /// Load the queue persisted under `key`
    ///
    /// A missing or unreadable queue starts empty.
    pub async fn load(
        storage: Arc<dyn KeyValueStorage>,
        clock: Arc<dyn Clock>,
        key: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let items = match read_items(storage.as_ref(), &key).await {
            Ok(items) => {
                if !items.is_empty() {
                    info!(pending = items.len(), "Restored sync queue");
                }
                items
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to restore sync queue; starting empty");
                Vec::new()
            }
        };

        Self { storage, clock, key, items: Mutex::new(items) }
    }

    /// Append a new mutation and persist the queue
    ///
    /// The in-memory queue is updated before the write, so the item is
    /// visible to [`snapshot`](Self::snapshot) even if persisting fails.
    pub async fn enqueue(
        &self,
        action: SyncAction,
        endpoint: impl Into<String>,
        data: serde_json::Value,
    ) -> SyncQueueItem {
        let item = SyncQueueItem::new(action, endpoint, data, self.clock.now_millis());

        let mut items = self.items.lock().await;
        items.push(item.clone());
        self.persist(&items).await;

        info!(
            item_id = %item.id,
            action = %item.action,
            endpoint = %item.endpoint,
            pending = items.len(),
            "Queued mutation for sync"
        );
        item
    }

    /// Put previously dropped items back at the end of the queue with a fresh retry budget
    pub async fn requeue(&self, returned: Vec<SyncQueueItem>) -> usize {
        if returned.is_empty() {
            return 0;
        }

        let count = returned.len();
        let mut items = self.items.lock().await;
        items.extend(returned.into_iter().map(|mut item| {
            item.retries = 0;
            item
        }));
        self.persist(&items).await;

        info!(count, pending = items.len(), "Requeued mutations");
        count
    }

    /// Copy of the current queue in FIFO order
    pub async fn snapshot(&self) -> Vec<SyncQueueItem> {
        self.items.lock().await.clone()
    }

    /// Number of pending items
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    /// Check if nothing is pending
    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Drop every pending item
    pub async fn clear(&self) {
        let mut items = self.items.lock().await;
        let dropped = items.len();
        items.clear();
        self.persist(&items).await;
        warn!(dropped, "Cleared sync queue");
    }

    /// Apply the results of a sync pass
    ///
    /// Delivered items are removed. Failed items get exactly one more retry;
    /// those reaching `max_retries` are removed and returned in
    /// [`Settlement::dropped`]. Items that were not part of the pass keep
    /// their place. The resulting queue is persisted.
    pub async fn settle(&self, outcome: &PassOutcome, max_retries: u32) -> Settlement {
        let mut items = self.items.lock().await;
        let mut settlement = Settlement::default();
        let mut next = Vec::with_capacity(items.len());

        for mut item in items.drain(..) {
            if outcome.completed.contains(&item.id) {
                settlement.delivered += 1;
                continue;
            }

            if let Some(error) = outcome.failed.get(&item.id) {
                item.retries += 1;
                if item.retries >= max_retries {
                    settlement.dropped.push(DroppedItem { item, error: error.clone() });
                    continue;
                }
                settlement.retried += 1;
            }

            next.push(item);
        }

        *items = next;
        settlement.remaining = items.len();
        self.persist(&items).await;

        debug!(
            delivered = settlement.delivered,
            retried = settlement.retried,
            dropped = settlement.dropped.len(),
            remaining = settlement.remaining,
            "Settled sync pass"
        );
        settlement
    }

    async fn persist(&self, items: &[SyncQueueItem]) {
        if let Err(e) = write_items(self.storage.as_ref(), &self.key, items).await {
            error!(key = %self.key, error = %e, "Failed to persist sync queue");
        }
    }
}

async fn read_items(storage: &dyn KeyValueStorage, key: &str) -> Result<Vec<SyncQueueItem>> {
    match storage.get(key).await? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(Vec::new()),
    }
}

async fn write_items(storage: &dyn KeyValueStorage, key: &str, items: &[SyncQueueItem]) -> Result<()> {
    let json = serde_json::to_string(items)?;
    storage.set(key, &json).await?;
    Ok(())
}
