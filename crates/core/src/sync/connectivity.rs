//! Connectivity monitor shared by the sync engine, scheduler and gateway.

use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::utils::time_utils::now_millis;

/// Current reachability of the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub online: bool,
    /// When `online` last flipped, in ms. `None` until the first transition.
    pub changed_at: Option<i64>,
}

/// Tracks online/offline transitions. Cloning shares the same underlying state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(ConnectivityState {
            online: initially_online,
            changed_at: None,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Records an observation. Returns true when it was a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            state.online = online;
            state.changed_at = Some(now_millis());
            true
        });
        if changed {
            info!(
                "[Connectivity] Remote authority is now {}",
                if online { "reachable" } else { "unreachable" }
            );
        }
        changed
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Invokes `handler(online)` on every transition until the monitor is dropped.
    /// Must be called from within a Tokio runtime.
    pub fn on_connectivity_change<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = rx.borrow_and_update().online;
                handler(online);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}
