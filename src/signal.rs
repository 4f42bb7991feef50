//! Cross-task signals between the RPC delivery task and the main loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Notify, watch};

/// Returned when an operation stopped because shutdown was requested.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled by shutdown request")]
pub struct Cancelled;

/// Single-slot "rescan requested" signal.
///
/// Set from the RPC delivery task, taken by the main loop. Repeated requests
/// before the main loop gets to them collapse into one rescan.
#[derive(Debug, Clone)]
pub struct RescanSignal {
    requested: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl RescanSignal {
    /// Create a signal, optionally already set.
    pub fn new(requested: bool) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(requested)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Resolves once a rescan is pending, immediately if one already is.
    ///
    /// A wake-up left over from a request that [`RescanSignal::take`] already
    /// consumed is swallowed.
    pub async fn requested(&self) {
        while !self.is_requested() {
            self.wake.notified().await;
        }
    }
}

impl Default for RescanSignal {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Observer side of the process shutdown request.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Trigger side of the process shutdown request.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Create a connected trigger/observer pair.
pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested. Never resolves if every
    /// trigger was dropped without firing.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let stopped = rx.wait_for(|stop| *stop).await.is_ok();
        if !stopped {
            std::future::pending::<()>().await;
        }
    }

    /// `Err(Cancelled)` once shutdown has been requested.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}
