//! Last-known reachability of the backend.
//!
//! The flag is written by whatever watches the network (the sync loop's
//! health probe, or a platform listener in the host app) and read by every
//! binding to choose between "enqueue" and "call directly". A stale read can
//! only cost one extra queued item, which the next drain pass picks up.

use tokio::sync::watch;
use tracing::info;

/// Cloneable handle to the shared connectivity flag.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: watch::Sender<bool>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the flag. Returns `true` when the value actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            if online {
                info!("Network restored; queued mutations will be replayed");
            } else {
                info!("Network offline; mutations will be queued locally");
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolve once `rx` observes the flag flipping from offline to online,
    /// including a flip that happened since `rx` last looked. Returns
    /// `false` if the sender side is gone.
    pub async fn wait_for_reconnect(rx: &mut watch::Receiver<bool>) -> bool {
        // Receivers are only notified on actual changes, so an unseen change
        // that ends at `true` went through offline first.
        loop {
            if rx.changed().await.is_err() {
                return false;
            }
            if *rx.borrow_and_update() {
                return true;
            }
        }
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
