//! Offline support composition root
//!
//! [`OfflineSupport`] ties the cache, the sync queue, the connectivity
//! monitor and the sync driver together behind one cloneable handle.
//! Callers either forward platform events themselves through
//! [`handle_connectivity`](OfflineSupport::handle_connectivity) and
//! [`handle_lifecycle`](OfflineSupport::handle_lifecycle), or hand the
//! platform's watch channels to [`spawn`](OfflineSupport::spawn), which runs
//! the automatic flush loop:
//!
//! - an offline to online transition flushes once, with `is_reconnecting` set
//! - coming to the foreground while online flushes once
//! - while online and in the foreground, a timer flushes every `sync_interval`
//!
//! Signals that arrive together are merged into a single flush.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use storage::{
    CacheStore, CachedEntry, Clock, DeadLetter, DeadLetterStore, KeyValueStorage, SyncAction,
    SyncQueue, SyncQueueItem, SystemClock,
};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{self, OfflineConfig};
use crate::connectivity::{
    AppLifecycle, ConnectivityEvent, ConnectivityMonitor, ConnectivityState, Transition,
};
use crate::sync::{MutationSink, SyncDriver, SyncEvent, SyncReport};

/// What started a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The device came back online
    Reconnect,
    /// The app came to the foreground
    Foreground,
    /// The periodic timer fired
    Timer,
    /// A caller asked for it
    Manual,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushReason::Reconnect => write!(f, "reconnect"),
            FlushReason::Foreground => write!(f, "foreground"),
            FlushReason::Timer => write!(f, "timer"),
            FlushReason::Manual => write!(f, "manual"),
        }
    }
}

/// Error from [`OfflineSupport::fetch_with_cache`]
#[derive(Debug, Error)]
pub enum FetchError<E> {
    /// Offline with nothing cached
    #[error("No cached data for {0} while offline")]
    Offline(String),

    /// The fetch failed with nothing cached
    #[error("Fetch failed: {0}")]
    Fetch(E),
}

/// Offline cache and sync queue for one app instance
pub struct OfflineSupport {
    config: Arc<OfflineConfig>,
    cache: Arc<CacheStore>,
    queue: Arc<SyncQueue>,
    dead_letters: Arc<DeadLetterStore>,
    driver: Arc<SyncDriver>,
    monitor: Arc<ConnectivityMonitor>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SyncEvent>,
}

impl OfflineSupport {
    /// Load persisted state from `storage` and deliver through `sink`
    pub async fn new(
        storage: Arc<dyn KeyValueStorage>,
        sink: Arc<dyn MutationSink>,
        config: OfflineConfig,
    ) -> config::Result<Self> {
        Self::with_clock(storage, sink, config, Arc::new(SystemClock)).await
    }

    /// Like [`new`](Self::new) with an explicit clock
    pub async fn with_clock(
        storage: Arc<dyn KeyValueStorage>,
        sink: Arc<dyn MutationSink>,
        config: OfflineConfig,
        clock: Arc<dyn Clock>,
    ) -> config::Result<Self> {
        config.validate()?;

        let cache =
            CacheStore::open(storage.clone(), clock.clone(), config.cache_config()).await;
        let queue = Arc::new(
            SyncQueue::load(storage.clone(), clock.clone(), config.queue_key.clone()).await,
        );
        let dead_letters = Arc::new(
            DeadLetterStore::load(
                storage,
                config.dead_letter_key.clone(),
                config.dead_letter_capacity,
            )
            .await,
        );

        let (events, _) = broadcast::channel(config.event_buffer);
        let driver = SyncDriver::new(
            queue.clone(),
            dead_letters.clone(),
            sink,
            clock.clone(),
            events.clone(),
        )
        .with_max_retries(config.max_retries)
        .with_delivery_timeout(config.delivery_timeout);

        Ok(Self {
            config: Arc::new(config),
            cache: Arc::new(cache),
            queue,
            dead_letters,
            driver: Arc::new(driver),
            monitor: Arc::new(ConnectivityMonitor::new()),
            clock,
            events,
        })
    }

    /// The active configuration
    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    // Cache

    /// Cache `data` under `key` with a version tag
    pub async fn set_cached_data<T>(&self, key: &str, data: &T, version: &str)
    where
        T: Serialize + ?Sized,
    {
        self.cache.set_cached_data(key, data, version).await;
    }

    /// Cached payload under `key`
    pub async fn get_cached_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.cache.get_cached_data(key).await
    }

    /// Cached payload with its write time and version
    pub async fn get_cached_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CachedEntry<T>> {
        self.cache.get_cached_entry(key).await
    }

    /// Whether `key` is missing or older than `max_age` (default window when `None`)
    pub async fn is_data_stale(&self, key: &str, max_age: Option<Duration>) -> bool {
        let max_age = max_age.unwrap_or(self.config.default_max_age);
        self.cache.is_data_stale(key, max_age).await
    }

    /// Remove every cache entry
    pub async fn clear_cache(&self) -> usize {
        self.cache.clear_cache().await
    }

    /// Serve `key` from cache when fresh, otherwise fetch and cache
    ///
    /// Stale data is returned when offline or when the fetch fails.
    pub async fn fetch_with_cache<T, E, F, Fut>(
        &self,
        key: &str,
        version: &str,
        max_age: Option<Duration>,
        fetch: F,
    ) -> Result<T, FetchError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_age = max_age.unwrap_or(self.config.default_max_age);
        let cached = match self.cache.get_cached_entry::<T>(key).await {
            Some(entry) if !entry.is_stale(self.clock.now_millis(), max_age) => {
                debug!(key, "Serving fresh cache entry");
                return Ok(entry.data);
            }
            stale => stale,
        };

        if !self.monitor.is_online() {
            return match cached {
                Some(entry) => {
                    debug!(key, "Offline; serving stale cache entry");
                    Ok(entry.data)
                }
                None => Err(FetchError::Offline(key.to_string())),
            };
        }

        match fetch().await {
            Ok(data) => {
                self.cache.set_cached_data(key, &data, version).await;
                Ok(data)
            }
            Err(e) => match cached {
                Some(entry) => {
                    warn!(key, error = %e, "Fetch failed; serving stale cache entry");
                    Ok(entry.data)
                }
                None => Err(FetchError::Fetch(e)),
            },
        }
    }

    // Sync queue

    /// Queue a mutation for delivery
    pub async fn add_to_sync_queue(
        &self,
        action: SyncAction,
        endpoint: impl Into<String>,
        data: serde_json::Value,
    ) -> SyncQueueItem {
        self.queue.enqueue(action, endpoint, data).await
    }

    /// Pending mutations in delivery order
    pub async fn sync_queue(&self) -> Vec<SyncQueueItem> {
        self.queue.snapshot().await
    }

    /// Number of pending mutations
    pub async fn pending_count(&self) -> usize {
        self.queue.len().await
    }

    /// Flush the queue now
    pub async fn sync_data(&self) -> SyncReport {
        self.flush(FlushReason::Manual).await
    }

    // Connectivity

    /// Current connectivity state
    pub fn state(&self) -> ConnectivityState {
        self.monitor.state()
    }

    /// Subscribe to connectivity state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectivityState> {
        self.monitor.subscribe()
    }

    /// Apply a platform connectivity event, flushing on reconnect
    pub async fn handle_connectivity(&self, event: ConnectivityEvent) -> Option<SyncReport> {
        match self.apply_connectivity(event) {
            Transition::CameOnline => Some(self.reconnect_flush().await),
            Transition::WentOffline | Transition::Unchanged => None,
        }
    }

    /// Apply an app lifecycle change, flushing when it came to the foreground online
    pub async fn handle_lifecycle(&self, lifecycle: AppLifecycle) -> Option<SyncReport> {
        let came_foreground = self.monitor.set_lifecycle(lifecycle);
        if came_foreground && self.monitor.is_online() {
            Some(self.flush(FlushReason::Foreground).await)
        } else {
            None
        }
    }

    /// Subscribe to sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // Dead letters

    /// Mutations dropped after their final retry
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.list().await
    }

    /// Move every dead letter back into the queue with a fresh retry budget
    pub async fn requeue_dead_letters(&self) -> usize {
        let letters = self.dead_letters.take_all().await;
        self.queue
            .requeue(letters.into_iter().map(|letter| letter.item).collect())
            .await
    }

    /// Discard every dead letter
    pub async fn clear_dead_letters(&self) -> usize {
        self.dead_letters.clear().await
    }

    // Automatic flushing

    /// Run the automatic flush loop on the platform's signals
    ///
    /// The current value of each receiver is applied first, so a device that
    /// is already online flushes anything restored from storage.
    pub fn spawn(
        &self,
        connectivity: watch::Receiver<ConnectivityEvent>,
        lifecycle: watch::Receiver<AppLifecycle>,
    ) -> OfflineHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let support = self.clone();
        let task = tokio::spawn(async move {
            support.run(connectivity, lifecycle, stop_rx).await;
        });

        OfflineHandle { stop_tx: Some(stop_tx), task }
    }

    async fn run(
        self,
        mut connectivity: watch::Receiver<ConnectivityEvent>,
        mut lifecycle: watch::Receiver<AppLifecycle>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        info!(interval = ?self.config.sync_interval, "Offline sync loop started");

        let mut connectivity_open = true;
        let mut lifecycle_open = true;
        let mut timer: Option<Interval> = None;

        let mut trigger = Trigger::default();
        let initial = *lifecycle.borrow_and_update();
        self.absorb_lifecycle(initial, &mut trigger);
        let initial = *connectivity.borrow_and_update();
        self.absorb_connectivity(initial, &mut trigger);
        self.fire(trigger, &mut timer).await;

        loop {
            let mut trigger = Trigger::default();

            tokio::select! {
                _ = &mut stop_rx => break,
                changed = connectivity.changed(), if connectivity_open => {
                    if changed.is_ok() {
                        let event = *connectivity.borrow_and_update();
                        self.absorb_connectivity(event, &mut trigger);
                    } else {
                        debug!("Connectivity source closed");
                        connectivity_open = false;
                    }
                }
                changed = lifecycle.changed(), if lifecycle_open => {
                    if changed.is_ok() {
                        let state = *lifecycle.borrow_and_update();
                        self.absorb_lifecycle(state, &mut trigger);
                    } else {
                        debug!("Lifecycle source closed");
                        lifecycle_open = false;
                    }
                }
                _ = tick(&mut timer), if timer.is_some() => {
                    trigger.timer = true;
                }
            }

            // Merge whatever else is already pending into this flush
            if connectivity_open && connectivity.has_changed().unwrap_or(false) {
                let event = *connectivity.borrow_and_update();
                self.absorb_connectivity(event, &mut trigger);
            }
            if lifecycle_open && lifecycle.has_changed().unwrap_or(false) {
                let state = *lifecycle.borrow_and_update();
                self.absorb_lifecycle(state, &mut trigger);
            }

            self.fire(trigger, &mut timer).await;
        }

        info!("Offline sync loop stopped");
    }

    fn absorb_connectivity(&self, event: ConnectivityEvent, trigger: &mut Trigger) {
        if self.apply_connectivity(event) == Transition::CameOnline {
            trigger.reconnect = true;
        }
    }

    fn absorb_lifecycle(&self, lifecycle: AppLifecycle, trigger: &mut Trigger) {
        if self.monitor.set_lifecycle(lifecycle) {
            trigger.foreground = true;
        }
    }

    async fn fire(&self, trigger: Trigger, timer: &mut Option<Interval>) {
        let online = self.monitor.is_online();

        if !online {
            if timer.take().is_some() {
                debug!("Sync timer stopped");
            }
        } else if timer.is_none() {
            *timer = Some(sync_timer(self.config.sync_interval));
            debug!("Sync timer started");
        }

        let Some(reason) = trigger.reason() else {
            return;
        };

        match reason {
            FlushReason::Reconnect => {
                self.reconnect_flush().await;
            }
            FlushReason::Foreground if online => {
                self.flush(reason).await;
            }
            FlushReason::Timer if online && self.monitor.is_foreground() => {
                self.flush(reason).await;
            }
            _ => return,
        }

        if reason != FlushReason::Timer {
            if let Some(timer) = timer.as_mut() {
                timer.reset();
            }
        }
    }

    fn apply_connectivity(&self, event: ConnectivityEvent) -> Transition {
        let transition = self.monitor.apply(event);
        if transition != Transition::Unchanged {
            self.publish_state();
        }
        transition
    }

    async fn reconnect_flush(&self) -> SyncReport {
        self.monitor.begin_reconnect();
        self.publish_state();

        let report = self.flush(FlushReason::Reconnect).await;

        self.monitor.end_reconnect();
        self.publish_state();
        report
    }

    async fn flush(&self, reason: FlushReason) -> SyncReport {
        debug!(reason = %reason, "Sync triggered");
        self.driver.sync_data(self.monitor.is_online()).await
    }

    fn publish_state(&self) {
        let _ = self.events.send(SyncEvent::ConnectivityChanged(self.monitor.state()));
    }
}

impl Clone for OfflineSupport {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            cache: Arc::clone(&self.cache),
            queue: Arc::clone(&self.queue),
            dead_letters: Arc::clone(&self.dead_letters),
            driver: Arc::clone(&self.driver),
            monitor: Arc::clone(&self.monitor),
            clock: Arc::clone(&self.clock),
            events: self.events.clone(),
        }
    }
}

/// Signals collected for one loop iteration
#[derive(Debug, Default, Clone, Copy)]
struct Trigger {
    reconnect: bool,
    foreground: bool,
    timer: bool,
}

impl Trigger {
    fn reason(&self) -> Option<FlushReason> {
        if self.reconnect {
            Some(FlushReason::Reconnect)
        } else if self.foreground {
            Some(FlushReason::Foreground)
        } else if self.timer {
            Some(FlushReason::Timer)
        } else {
            None
        }
    }
}

fn sync_timer(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Handle to the automatic flush loop
///
/// Dropping the handle stops the loop.
pub struct OfflineHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl OfflineHandle {
    /// Stop the loop and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Offline sync loop ended abnormally");
        }
    }

    /// Whether the loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for OfflineHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}
