//! Cooperative named locks.
//!
//! The server grants each lock to one client at a time. `locked` and
//! `stolen` notifications are routed into the registry and surface as state
//! changes on the handles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{ClientError, Result};

/// State of a named lock from this client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Requested but currently held by another client.
    Waiting,
    /// Granted to this client.
    Held,
    /// Taken away by a `steal` from another client.
    Stolen,
    /// Released, or never requested on this connection.
    Released,
}

#[derive(Debug)]
struct LockShared {
    state: StdMutex<LockState>,
    notify: Notify,
}

impl LockShared {
    fn set(&self, state: LockState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
        self.notify.notify_waiters();
    }
}

/// Handle to one named lock.
#[derive(Debug, Clone)]
pub struct LockHandle {
    name: String,
    shared: Arc<LockShared>,
}

impl LockHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> LockState {
        self.shared
            .state
            .lock()
            .map(|state| *state)
            .unwrap_or(LockState::Released)
    }

    /// Wait until the server grants the lock. Fails `LockContended` when
    /// the deadline passes first.
    pub async fn wait_held(&self, deadline: Duration) -> Result<()> {
        let granted = async {
            loop {
                // Register before checking so a grant between the check and
                // the await is not missed.
                let notified = self.shared.notify.notified();
                if self.state() == LockState::Held {
                    return;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(deadline, granted).await {
            Ok(()) => Ok(()),
            Err(_) => Err(ClientError::LockContended(format!(
                "lock {} not granted within {deadline:?}",
                self.name
            ))),
        }
    }

    /// Wait for any state change.
    pub async fn changed(&self) -> LockState {
        self.shared.notify.notified().await;
        self.state()
    }
}

/// Registry of this connection's lock handles.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: StdMutex<HashMap<String, Arc<LockShared>>>,
}

impl LockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for a lock name, creating its shared state on first use.
    #[must_use]
    pub fn handle(&self, name: &str) -> LockHandle {
        let shared = match self.locks.lock() {
            Ok(mut locks) => Arc::clone(locks.entry(name.to_string()).or_insert_with(|| {
                Arc::new(LockShared {
                    state: StdMutex::new(LockState::Released),
                    notify: Notify::new(),
                })
            })),
            Err(_) => Arc::new(LockShared {
                state: StdMutex::new(LockState::Released),
                notify: Notify::new(),
            }),
        };
        LockHandle {
            name: name.to_string(),
            shared,
        }
    }

    /// Route a state change from a reply or notification.
    pub fn set_state(&self, name: &str, state: LockState) {
        if let Ok(locks) = self.locks.lock() {
            if let Some(shared) = locks.get(name) {
                shared.set(state);
            } else {
                tracing::debug!(name, "lock notification for unknown lock");
            }
        }
    }

    /// Locks do not survive the connection; on disconnect every handle
    /// reverts to `Released`.
    pub fn reset(&self) {
        if let Ok(locks) = self.locks.lock() {
            for shared in locks.values() {
                shared.set(LockState::Released);
            }
        }
    }
}
