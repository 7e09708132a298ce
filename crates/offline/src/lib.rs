//! Offline support for Tidybook
//!
//! This crate tracks connectivity, queues mutations made while offline and
//! flushes them to the backend in order with bounded retries, alongside a
//! persisted snapshot cache for offline reads.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connectivity;
pub mod support;
pub mod sync;

pub use config::{ConfigError, OfflineConfig};
pub use connectivity::{
    AppLifecycle, ConnectivityEvent, ConnectivityMonitor, ConnectivityState, Transition,
};
pub use support::{FetchError, FlushReason, OfflineHandle, OfflineSupport};
pub use sync::{DeliveryError, MutationSink, SkipReason, SyncDriver, SyncEvent, SyncReport};
