//! Storage layer for Tidybook
//!
//! This crate provides the persistent key-value capability, the versioned
//! cache store, the persisted sync queue and the dead-letter store used by
//! the offline layer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod clock;
pub mod dead_letter;
pub mod kv;
pub mod queue;

pub use cache::{
    CacheConfig, CacheError, CacheStore, CachedEntry, DEFAULT_CACHE_PREFIX, DEFAULT_MAX_AGE,
    DEFAULT_MAX_ENTRIES,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dead_letter::{
    DeadLetter, DeadLetterStore, DEFAULT_DEAD_LETTER_CAPACITY, DEFAULT_DEAD_LETTER_KEY,
};
pub use kv::{KeyValueStorage, KvConfig, KvError, KvStore};
pub use queue::{
    DroppedItem, PassOutcome, QueueError, Settlement, SyncAction, SyncQueue, SyncQueueItem,
    DEFAULT_QUEUE_KEY,
};
