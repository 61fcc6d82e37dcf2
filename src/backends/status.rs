use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Connection lifecycle of a backend.
///
/// Local and memory backends start `Connected` and only ever move to
/// `Destroyed`. Remote backends walk the full machine. `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Destroyed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Immutable record of one real status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChangeEvent {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
    pub timestamp: DateTime<Utc>,
    /// Human-readable cause, set when the transition was triggered by a failure.
    pub error: Option<String>,
}

/// A status listener. An `Err` (or a panic) is logged and isolated: it never
/// stops delivery to the remaining listeners.
pub type StatusListener = Arc<dyn Fn(&StatusChangeEvent) -> anyhow::Result<()> + Send + Sync>;

struct Registry {
    status: ConnectionStatus,
    listeners: Vec<(u64, StatusListener)>,
    next_id: u64,
}

/// Status state plus an ordered listener registry, shared by every backend.
pub struct StatusManager {
    inner: Arc<Mutex<Registry>>,
}

/// Handle returned by [`StatusManager::subscribe`].
///
/// Dropping it does NOT unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().listeners.retain(|(id, _)| *id != self.id);
        }
    }
}

impl StatusManager {
    pub fn new(initial: ConnectionStatus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                status: initial,
                listeners: Vec::new(),
                next_id: 0,
            })),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status
    }

    /// Transitions to `to`, notifying listeners in registration order.
    ///
    /// Returns `false` when nothing happened: `to` equals the current status,
    /// or the manager is already destroyed. Listeners run synchronously on the
    /// caller's task, outside the registry lock.
    pub fn set_status(&self, to: ConnectionStatus, error: Option<String>) -> bool {
        let (event, listeners) = {
            let mut registry = self.inner.lock();
            if registry.status == to || registry.status == ConnectionStatus::Destroyed {
                return false;
            }
            let event = StatusChangeEvent {
                from: registry.status,
                to,
                timestamp: Utc::now(),
                error,
            };
            registry.status = to;
            let listeners: Vec<StatusListener> =
                registry.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (event, listeners)
        };

        debug!("Status {} -> {}", event.from, event.to);

        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Status listener failed on {} -> {}: {e}", event.from, event.to),
                Err(_) => warn!("Status listener panicked on {} -> {}", event.from, event.to),
            }
        }
        true
    }

    /// Registers a listener. Listeners added after destruction are never
    /// stored, since no further transition can happen.
    pub fn subscribe(&self, listener: StatusListener) -> Subscription {
        let mut registry = self.inner.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        if registry.status != ConnectionStatus::Destroyed {
            registry.listeners.push((id, listener));
        }
        Subscription {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Terminal transition followed by dropping every listener.
    pub fn destroy(&self) {
        self.set_status(ConnectionStatus::Destroyed, None);
        self.inner.lock().listeners.clear();
    }
}
