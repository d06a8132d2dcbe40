//! Online/offline connectivity tracking for the Versecraft client.
//!
//! The platform feeds transitions into a [`ConnectivityMonitor`]; everything
//! else observes connectivity through the [`NetworkMonitor`] trait, so tests
//! can substitute a deterministic monitor they drive by hand.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Read side of the connectivity signal.
pub trait NetworkMonitor: Send + Sync {
    /// Current connectivity.
    fn is_online(&self) -> bool;

    /// Subscribe to connectivity changes. The receiver yields the new value
    /// exactly once per transition; no duplicate events while the state is
    /// unchanged.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Concrete connectivity monitor.
///
/// The owner pushes platform transitions in via [`set_online`]; observers
/// read through the [`NetworkMonitor`] trait.
///
/// [`set_online`]: ConnectivityMonitor::set_online
pub struct ConnectivityMonitor {
    sender: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the initial connectivity read from the platform.
    pub fn new(initially_online: bool) -> Arc<Self> {
        let (sender, _) = watch::channel(initially_online);
        Arc::new(Self { sender })
    }

    /// Record a connectivity transition. A no-op if the state is unchanged,
    /// so subscribers see exactly one event per real transition.
    pub fn set_online(&self, online: bool) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!(online, "Connectivity changed");
        }
    }
}

impl NetworkMonitor for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}
