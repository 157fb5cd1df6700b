//! Health registry
//!
//! In-memory map from service name to [`HealthStatus`]. The empty name is the
//! overall server status. Lookups never fail: an unregistered name is
//! [`HealthStatus::Unknown`].
//!
//! Watchers get their own unbounded queue, fed from the mutation path while
//! the registry lock is held. That gives each subscriber a consistent first
//! value and every later change for its name, in order, with no coalescing.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

/// Serving status of a named service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// Never registered, or cleared
    #[default]
    Unknown,
    /// Ready to take traffic
    Serving,
    /// Registered but not taking traffic
    NotServing,
}

#[derive(Debug)]
struct Watcher {
    id: u64,
    tx: mpsc::UnboundedSender<HealthStatus>,
}

#[derive(Debug, Default)]
struct RegistryState {
    statuses: HashMap<String, HealthStatus>,
    watchers: HashMap<String, Vec<Watcher>>,
    next_watcher_id: u64,
}

impl RegistryState {
    fn notify(&mut self, name: &str, status: HealthStatus) {
        if let Some(watchers) = self.watchers.get_mut(name) {
            watchers.retain(|w| w.tx.send(status).is_ok());
            if watchers.is_empty() {
                self.watchers.remove(name);
            }
        }
    }
}

/// Shared, cloneable health registry
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl HealthRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Every mutation leaves the map consistent, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert the status for `name`
    pub fn set_status(&self, name: &str, status: HealthStatus) {
        let mut state = self.lock();
        state.statuses.insert(name.to_string(), status);
        state.notify(name, status);
        tracing::debug!(service = %name, ?status, "health status set");
    }

    /// Remove the entry for `name`, reverting it to Unknown. Idempotent.
    pub fn clear_status(&self, name: &str) {
        let mut state = self.lock();
        state.statuses.remove(name);
        state.notify(name, HealthStatus::Unknown);
        tracing::debug!(service = %name, "health status cleared");
    }

    /// Remove every entry
    ///
    /// Watchers of names that had an entry observe Unknown.
    pub fn clear_all(&self) {
        let mut state = self.lock();
        let names: Vec<String> = state.statuses.drain().map(|(name, _)| name).collect();
        for name in names {
            state.notify(&name, HealthStatus::Unknown);
        }
        tracing::debug!("health registry cleared");
    }

    /// Current status for `name`
    pub fn check(&self, name: &str) -> HealthStatus {
        self.lock()
            .statuses
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Subscribe to status changes for `name`
    ///
    /// The stream yields the current status first, then one item per later
    /// `set_status`/`clear_status` on that name. Dropping it unsubscribes.
    pub fn watch(&self, name: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let current = state.statuses.get(name).copied().unwrap_or_default();
        let id = state.next_watcher_id;
        state.next_watcher_id += 1;
        state
            .watchers
            .entry(name.to_string())
            .or_default()
            .push(Watcher { id, tx });

        Subscription {
            name: name.to_string(),
            id,
            first: Some(current),
            rx,
            registry: self.clone(),
        }
    }

    /// Mark every registered entry NOT_SERVING
    ///
    /// Used when the plugin starts draining so watchers see it go away.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        let names: Vec<String> = state.statuses.keys().cloned().collect();
        for name in names {
            state.statuses.insert(name.clone(), HealthStatus::NotServing);
            state.notify(&name, HealthStatus::NotServing);
        }
        tracing::info!("health registry marked not serving");
    }

    /// Number of live subscriptions for `name`
    pub fn watcher_count(&self, name: &str) -> usize {
        self.lock().watchers.get(name).map_or(0, Vec::len)
    }

    fn unsubscribe(&self, name: &str, id: u64) {
        let mut state = self.lock();
        if let Some(watchers) = state.watchers.get_mut(name) {
            watchers.retain(|w| w.id != id);
            if watchers.is_empty() {
                state.watchers.remove(name);
            }
        }
    }
}

/// Stream of status changes for one service name
#[derive(Debug)]
pub struct Subscription {
    name: String,
    id: u64,
    first: Option<HealthStatus>,
    rx: mpsc::UnboundedReceiver<HealthStatus>,
    registry: HealthRegistry,
}

impl Subscription {
    /// Service name this subscription follows
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Stream for Subscription {
    type Item = HealthStatus;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(status) = self.first.take() {
            return Poll::Ready(Some(status));
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.name, self.id);
        tracing::trace!(service = %self.name, "health watch released");
    }
}
