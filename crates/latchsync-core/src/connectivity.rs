// ── Connectivity monitor ──
//
// Reports online/offline status and the offline→online edge. Holds no
// retry policy: the dispatcher decides what to do with an edge.

use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::watch;
use tracing::info;

/// Network reachability as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

impl From<bool> for Connectivity {
    fn from(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }
}

/// Current connectivity plus change notification.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    state: watch::Sender<Connectivity>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state }
    }

    /// Record a status report from the platform.
    ///
    /// Returns `true` if the status changed. Repeated reports of the same
    /// status wake nobody.
    pub fn report(&self, online: bool) -> bool {
        let next = Connectivity::from(online);
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(connectivity = %next, "connectivity changed");
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Edge trigger for offline→online transitions observed after this call.
    pub fn reconnections(&self) -> Reconnections {
        Reconnections {
            receiver: self.state.subscribe(),
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(Connectivity::Offline)
    }
}

/// Awaitable stream of reconnect edges.
pub struct Reconnections {
    receiver: watch::Receiver<Connectivity>,
}

impl Reconnections {
    /// Wait for the next transition into `Online`.
    ///
    /// Returns `None` once the monitor is dropped.
    pub async fn next(&mut self) -> Option<()> {
        loop {
            self.receiver.changed().await.ok()?;
            if self.receiver.borrow_and_update().is_online() {
                return Some(());
            }
        }
    }
}
