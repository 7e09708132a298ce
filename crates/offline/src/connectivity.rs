//! Connectivity and app lifecycle tracking
//!
//! The platform reports raw network events; the monitor folds them into a
//! single `is_online` flag and tells the caller when the device actually
//! transitioned, so each reconnect triggers exactly one flush.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info};

/// Raw network event from the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectivityEvent {
    /// A network interface is up
    pub connected: bool,
    /// Whether the internet is reachable; `None` while the platform is still probing
    pub internet_reachable: Option<bool>,
}

impl ConnectivityEvent {
    /// A connected event with confirmed reachability
    pub fn online() -> Self {
        Self { connected: true, internet_reachable: Some(true) }
    }

    /// A disconnected event
    pub fn offline() -> Self {
        Self { connected: false, internet_reachable: Some(false) }
    }

    /// Unknown reachability counts as offline
    pub fn is_online(&self) -> bool {
        self.connected && self.internet_reachable == Some(true)
    }
}

/// App lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppLifecycle {
    /// In the foreground and receiving input
    #[default]
    Active,
    /// Visible but not receiving input
    Inactive,
    /// Not visible
    Background,
}

impl AppLifecycle {
    /// Only `Active` counts as foreground
    pub fn is_foreground(&self) -> bool {
        matches!(self, AppLifecycle::Active)
    }
}

impl fmt::Display for AppLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppLifecycle::Active => write!(f, "active"),
            AppLifecycle::Inactive => write!(f, "inactive"),
            AppLifecycle::Background => write!(f, "background"),
        }
    }
}

/// Connectivity state exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectivityState {
    /// Connected with confirmed internet reachability
    pub is_online: bool,
    /// A reconnect flush is in flight
    pub is_reconnecting: bool,
}

/// Result of applying a connectivity event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Offline to online
    CameOnline,
    /// Online to offline
    WentOffline,
    /// No change in `is_online`
    Unchanged,
}

/// Tracks connectivity and lifecycle, publishing state through a watch channel
pub struct ConnectivityMonitor {
    state_tx: watch::Sender<ConnectivityState>,
    lifecycle: Mutex<AppLifecycle>,
}

impl ConnectivityMonitor {
    /// Create a monitor that starts offline and in the foreground
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectivityState::default());
        Self { state_tx, lifecycle: Mutex::new(AppLifecycle::Active) }
    }

    /// Fold a platform event into the state
    pub fn apply(&self, event: ConnectivityEvent) -> Transition {
        let online = event.is_online();
        let mut transition = Transition::Unchanged;

        self.state_tx.send_if_modified(|state| {
            if state.is_online == online {
                return false;
            }
            state.is_online = online;
            transition = if online { Transition::CameOnline } else { Transition::WentOffline };
            true
        });

        match transition {
            Transition::CameOnline => info!("Connectivity restored"),
            Transition::WentOffline => info!("Connectivity lost"),
            Transition::Unchanged => {
                debug!(connected = event.connected, reachable = ?event.internet_reachable, "Connectivity unchanged")
            }
        }
        transition
    }

    /// Record a lifecycle change, returning true when the app came to the foreground
    pub fn set_lifecycle(&self, next: AppLifecycle) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        let previous = std::mem::replace(&mut *lifecycle, next);
        if previous != next {
            debug!(from = %previous, to = %next, "App lifecycle changed");
        }
        !previous.is_foreground() && next.is_foreground()
    }

    /// Current lifecycle state
    pub fn lifecycle(&self) -> AppLifecycle {
        *self.lifecycle.lock()
    }

    /// Whether the app is in the foreground
    pub fn is_foreground(&self) -> bool {
        self.lifecycle().is_foreground()
    }

    /// Mark a reconnect flush as started
    pub fn begin_reconnect(&self) {
        self.set_reconnecting(true);
    }

    /// Mark a reconnect flush as finished
    pub fn end_reconnect(&self) {
        self.set_reconnecting(false);
    }

    fn set_reconnecting(&self, reconnecting: bool) {
        self.state_tx.send_if_modified(|state| {
            let changed = state.is_reconnecting != reconnecting;
            state.is_reconnecting = reconnecting;
            changed
        });
    }

    /// Current state
    pub fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    /// Whether the device is online
    pub fn is_online(&self) -> bool {
        self.state_tx.borrow().is_online
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
