//! Connectivity signal consumed by the sync engine.
//!
//! The core does not detect connectivity itself; the host reports
//! transitions into a [`ConnectivityMonitor`] and the engine and
//! driver observe them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Receives online/offline transition reports from the host.
///
/// Transitions fan out to every watcher; repeated reports of the same
/// state are not re-delivered.
pub struct ConnectivityMonitor {
    online: Arc<AtomicBool>,
    watchers: Mutex<Vec<Sender<bool>>>,
}

impl ConnectivityMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(initially_online)),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Reports that connectivity is available.
    pub fn report_online(&self) {
        if !self.online.swap(true, Ordering::SeqCst) {
            debug!("connectivity: online");
            self.notify(true);
        }
    }

    /// Reports that connectivity was lost.
    pub fn report_offline(&self) {
        if self.online.swap(false, Ordering::SeqCst) {
            debug!("connectivity: offline");
            self.notify(false);
        }
    }

    /// Returns the current state.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns a lightweight handle for state checks.
    pub fn handle(&self) -> ConnectivityHandle {
        ConnectivityHandle {
            online: Arc::clone(&self.online),
        }
    }

    /// Subscribes to transitions. The subscription ends when the
    /// receiver is dropped.
    pub fn watch(&self) -> Receiver<bool> {
        let (tx, rx) = mpsc::channel();
        self.watchers.lock().push(tx);
        rx
    }

    fn notify(&self, online: bool) {
        self.watchers
            .lock()
            .retain(|tx| tx.send(online).is_ok());
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Cloneable view of the connectivity state.
#[derive(Clone)]
pub struct ConnectivityHandle {
    online: Arc<AtomicBool>,
}

impl ConnectivityHandle {
    /// Returns the current state.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Creates a handle that is always online. For tests and hosts
    /// without a connectivity signal.
    pub fn always_online() -> Self {
        Self {
            online: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_fan_out_once() {
        let monitor = ConnectivityMonitor::new(false);
        let rx = monitor.watch();

        monitor.report_online();
        monitor.report_online();
        monitor.report_offline();

        assert!(rx.try_recv().unwrap());
        assert!(!rx.try_recv().unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handle_tracks_state() {
        let monitor = ConnectivityMonitor::new(false);
        let handle = monitor.handle();

        assert!(!handle.is_online());
        monitor.report_online();
        assert!(handle.is_online());
    }

    #[test]
    fn dropped_watcher_is_pruned() {
        let monitor = ConnectivityMonitor::new(false);
        drop(monitor.watch());

        monitor.report_online();
        assert_eq!(monitor.watchers.lock().len(), 0);
    }
}
