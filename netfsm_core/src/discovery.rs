//! Discovery: demand → respond → register.
//!
//! ```text
//! Requester                       Authoritative peer
//!   |-- Demand(identity) ------------->|
//!   |                                  |  single-flight(identity) {
//!   |                                  |     existing View? else mint lowest free id
//!   |                                  |  }
//!   |<----------- Respond(identity, id, owner)
//!   |  register View(id, owner) unless already known
//!   |  wake waiters for identity
//! ```
//!
//! Two demands for an identity nobody has seen can reach the authoritative
//! peer back to back. Resolution takes a per-identity lock, so the second
//! demand always finds the View the first one minted.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use netfsm_env::PeerId;
use thiserror::Error;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tracing::debug;

use crate::identity::EntityIdentity;
use crate::view::{OwnershipPolicy, SharedViews, View, ViewId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no response for identity {identity} within {timeout_ms}ms")]
    Timeout { identity: EntityIdentity, timeout_ms: u64 },

    #[error("discovery for identity {0} was abandoned")]
    Abandoned(EntityIdentity),
}

/// The View a demand resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub view: ViewId,
    pub owner: PeerId,
    pub policy: OwnershipPolicy,
}

/// Serializes async work per key.
pub struct SingleFlight<K> {
    locks: Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<K, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until no other holder of `key` is in flight.
    pub async fn acquire(&self, key: &K) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks().entry(key.clone()).or_default());
        lock.lock_owned().await
    }

    /// Drops the lock entry for `key` if nobody holds or awaits it.
    pub fn forget(&self, key: &K) {
        let mut locks = self.locks();
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.locks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-host discovery state: waiters on the requesting side and the
/// single-flight locks on the authoritative side.
#[derive(Default)]
pub struct Discovery {
    waiters: Mutex<HashMap<EntityIdentity, Vec<oneshot::Sender<Resolution>>>>,
    flights: SingleFlight<EntityIdentity>,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<EntityIdentity, Vec<oneshot::Sender<Resolution>>>> {
        self.waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers interest in `identity`. Must be called before the demand
    /// is sent so a fast response is not missed.
    pub fn wait_for(&self, identity: EntityIdentity) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        self.waiters().entry(identity).or_default().push(tx);
        rx
    }

    pub async fn await_resolution(
        &self,
        identity: EntityIdentity,
        receiver: oneshot::Receiver<Resolution>,
        timeout: Duration,
    ) -> Result<Resolution, DiscoveryError> {
        let outcome = tokio::time::timeout(timeout, receiver).await;
        match outcome {
            Ok(Ok(resolution)) => Ok(resolution),
            Ok(Err(_)) => Err(DiscoveryError::Abandoned(identity)),
            Err(_) => {
                self.prune_closed(identity);
                Err(DiscoveryError::Timeout {
                    identity,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn prune_closed(&self, identity: EntityIdentity) {
        let mut waiters = self.waiters();
        if let Some(pending) = waiters.get_mut(&identity) {
            pending.retain(|tx| !tx.is_closed());
            if pending.is_empty() {
                waiters.remove(&identity);
            }
        }
    }

    /// Authoritative side: finds the View bound to `identity`, minting one
    /// owned by `authoritative` if none exists.
    pub async fn resolve_demand(
        &self,
        views: &SharedViews,
        identity: EntityIdentity,
        policy: OwnershipPolicy,
        authoritative: PeerId,
    ) -> Resolution {
        let _flight = self.flights.acquire(&identity).await;
        let mut registry = views.lock();

        if let Some(existing) = registry.find_by_identity(identity) {
            debug!(%identity, view = %existing.id, "demand resolved to existing view");
            return Resolution {
                view: existing.id,
                owner: existing.owner.unwrap_or(authoritative),
                policy: existing.policy,
            };
        }

        let id = registry.next_free_id();
        registry.register(View::new(id, Some(authoritative), policy).with_identity(identity));
        debug!(%identity, view = %id, "minted view for demand");
        Resolution {
            view: id,
            owner: authoritative,
            policy,
        }
    }

    /// Requesting side: registers the View from a response unless one with
    /// that id is already known, then wakes every waiter for `identity`.
    /// Returns true if a View was registered.
    pub fn accept_response(
        &self,
        views: &SharedViews,
        identity: EntityIdentity,
        resolution: Resolution,
        owner_active: bool,
        authoritative: PeerId,
    ) -> bool {
        let registered = {
            let mut registry = views.lock();
            if registry.get(resolution.view).is_some() {
                registry.bind_identity(resolution.view, identity);
                false
            } else {
                let mut view = View::new(resolution.view, Some(resolution.owner), resolution.policy)
                    .with_identity(identity);
                if !owner_active {
                    view.controller = Some(authoritative);
                }
                registry.register(view)
            }
        };

        let pending = self.waiters().remove(&identity).unwrap_or_default();
        for waiter in pending {
            let _ = waiter.send(resolution);
        }
        registered
    }

    pub fn forget(&self, identity: EntityIdentity) {
        self.flights.forget(&identity);
    }

    pub fn pending_waiters(&self) -> usize {
        self.waiters().values().map(Vec::len).sum()
    }
}
