//! Background thread that runs sync cycles.
//!
//! The driver reacts to three things: connectivity coming back,
//! explicit nudges (a local mutation was enqueued, or the host wants
//! a sync now), and a poll tick that retries entries sitting in
//! backoff. Connectivity going away cancels the cycle in progress.

use crate::connectivity::ConnectivityMonitor;
use crate::engine::SyncEngine;
use crate::error::SyncError;
use crate::gateway::RemoteGateway;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

enum Signal {
    Sync,
    Shutdown,
}

/// Owns the background sync thread.
pub struct SyncDriver {
    tx: Sender<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl SyncDriver {
    /// Spawns the driver over an engine and connectivity monitor.
    pub fn spawn<G: RemoteGateway + 'static>(
        engine: Arc<SyncEngine<G>>,
        monitor: &ConnectivityMonitor,
        poll_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel();

        // Forward connectivity transitions: online nudges a cycle,
        // offline cancels the one in progress. Exits when the monitor
        // or the driver goes away.
        let watch = monitor.watch();
        let forward_tx = tx.clone();
        let forward_engine = Arc::clone(&engine);
        std::thread::spawn(move || {
            for online in watch {
                if online {
                    if forward_tx.send(Signal::Sync).is_err() {
                        break;
                    }
                } else {
                    forward_engine.cancel();
                }
            }
        });

        let connectivity = monitor.handle();
        let handle = std::thread::spawn(move || loop {
            match rx.recv_timeout(poll_interval) {
                Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(Signal::Sync) | Err(RecvTimeoutError::Timeout) => {}
            }

            if !connectivity.is_online() {
                continue;
            }

            // Run the cycle, plus one follow-up per trigger recorded
            // while it ran.
            loop {
                match engine.run_cycle() {
                    Ok(_) => {}
                    Err(SyncError::Stopped) => break,
                    Err(e) if e.is_retryable() => {
                        debug!("sync cycle will be retried: {e}");
                        break;
                    }
                    Err(SyncError::Cancelled | SyncError::CycleInProgress) => break,
                    Err(e) => {
                        warn!("sync cycle failed: {e}");
                        break;
                    }
                }
                if !engine.take_pending_trigger() {
                    break;
                }
            }
        });

        Self {
            tx,
            handle: Some(handle),
        }
    }

    /// Asks the driver to run a cycle soon.
    pub fn nudge(&self) {
        // A dead driver thread just means shutdown already happened.
        let _ = self.tx.send(Signal::Sync);
    }

    /// Stops the driver, cancelling any cycle in progress, and waits
    /// for the thread to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(Signal::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for SyncDriver {
    fn drop(&mut self) {
        self.stop();
    }
}
