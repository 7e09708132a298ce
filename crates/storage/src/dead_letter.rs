//! Dead-letter store for mutations that exhausted their retries
//!
//! Items dropped from the sync queue are kept here, bounded and persisted,
//! so an operator or the UI can inspect and requeue them.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::kv::KeyValueStorage;
use crate::queue::SyncQueueItem;

/// Storage key of the persisted dead letters
pub const DEFAULT_DEAD_LETTER_KEY: &str = "@sync_dead_letters";

/// Default number of dead letters kept
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 50;

/// A mutation removed from the queue after its final failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The dropped item with its final retry count
    pub item: SyncQueueItem,
    /// When the item was dropped, in milliseconds since the Unix epoch
    pub failed_at: u64,
    /// Error of the last attempt
    pub last_error: String,
}

/// Bounded, persisted list of dead letters (oldest evicted first)
pub struct DeadLetterStore {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
    capacity: usize,
    letters: Mutex<VecDeque<DeadLetter>>,
}

impl DeadLetterStore {
    /// Load the dead letters persisted under `key`
    pub async fn load(
        storage: Arc<dyn KeyValueStorage>,
        key: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let key = key.into();
        let letters = match storage.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str::<VecDeque<DeadLetter>>(&raw).unwrap_or_else(|e| {
                error!(key = %key, error = %e, "Discarding unreadable dead letters");
                VecDeque::new()
            }),
            Ok(None) => VecDeque::new(),
            Err(e) => {
                error!(key = %key, error = %e, "Failed to load dead letters");
                VecDeque::new()
            }
        };

        Self { storage, key, capacity, letters: Mutex::new(letters) }
    }

    /// Record a dropped item, evicting the oldest letter when full
    pub async fn record(&self, item: SyncQueueItem, last_error: String, failed_at: u64) {
        let mut letters = self.letters.lock().await;

        if self.capacity == 0 {
            warn!(item_id = %item.id, "Dead-letter store disabled; mutation discarded");
            return;
        }

        while letters.len() >= self.capacity {
            if let Some(evicted) = letters.pop_front() {
                warn!(item_id = %evicted.item.id, "Dead-letter store full; discarding oldest");
            }
        }

        letters.push_back(DeadLetter { item, failed_at, last_error });
        self.persist(&letters).await;
    }

    /// All dead letters, oldest first
    pub async fn list(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.iter().cloned().collect()
    }

    /// Number of dead letters
    pub async fn len(&self) -> usize {
        self.letters.lock().await.len()
    }

    /// Check if there are no dead letters
    pub async fn is_empty(&self) -> bool {
        self.letters.lock().await.is_empty()
    }

    /// Remove and return every dead letter
    pub async fn take_all(&self) -> Vec<DeadLetter> {
        let mut letters = self.letters.lock().await;
        let taken: Vec<DeadLetter> = letters.drain(..).collect();
        self.persist(&letters).await;
        taken
    }

    /// Discard every dead letter, returning how many were removed
    pub async fn clear(&self) -> usize {
        self.take_all().await.len()
    }

    async fn persist(&self, letters: &VecDeque<DeadLetter>) {
        let result = match serde_json::to_string(letters) {
            Ok(json) => self.storage.set(&self.key, &json).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Err(e) = result {
            error!(key = %self.key, error = %e, "Failed to persist dead letters");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvStore;
    use crate::queue::SyncAction;
    use serde_json::json;

    fn item(endpoint: &str) -> SyncQueueItem {
        let mut item = SyncQueueItem::new(SyncAction::Create, endpoint, json!({}), 10);
        item.retries = 3;
        item
    }

    #[tokio::test]
    async fn test_record_and_reload() {
        let kv = Arc::new(KvStore::in_memory().unwrap());

        let store = DeadLetterStore::load(kv.clone(), DEFAULT_DEAD_LETTER_KEY, 10).await;
        store.record(item("/bookings"), "HTTP 422".to_string(), 99).await;

        let reloaded = DeadLetterStore::load(kv, DEFAULT_DEAD_LETTER_KEY, 10).await;
        let letters = reloaded.list().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].item.endpoint, "/bookings");
        assert_eq!(letters[0].last_error, "HTTP 422");
        assert_eq!(letters[0].failed_at, 99);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let kv = Arc::new(KvStore::in_memory().unwrap());
        let store = DeadLetterStore::load(kv, DEFAULT_DEAD_LETTER_KEY, 2).await;

        store.record(item("/a"), "e".to_string(), 1).await;
        store.record(item("/b"), "e".to_string(), 2).await;
        store.record(item("/c"), "e".to_string(), 3).await;

        let endpoints: Vec<String> =
            store.list().await.into_iter().map(|l| l.item.endpoint).collect();
        assert_eq!(endpoints, vec!["/b", "/c"]);
    }

    #[tokio::test]
    async fn test_take_all_empties_store() {
        let kv = Arc::new(KvStore::in_memory().unwrap());
        let store = DeadLetterStore::load(kv.clone(), DEFAULT_DEAD_LETTER_KEY, 5).await;

        store.record(item("/a"), "e".to_string(), 1).await;
        store.record(item("/b"), "e".to_string(), 2).await;

        assert_eq!(store.take_all().await.len(), 2);
        assert!(store.is_empty().await);
        assert_eq!(kv.get(DEFAULT_DEAD_LETTER_KEY).await.unwrap(), Some("[]".to_string()));
    }

    #[tokio::test]
    async fn test_zero_capacity_discards() {
        let kv = Arc::new(KvStore::in_memory().unwrap());
        let store = DeadLetterStore::load(kv, DEFAULT_DEAD_LETTER_KEY, 0).await;

        store.record(item("/a"), "e".to_string(), 1).await;
        assert_eq!(store.len().await, 0);
    }
}
