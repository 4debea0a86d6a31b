//! Views: the replicated owner/controller record of one entity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use netfsm_env::PeerId;
use serde::{Deserialize, Serialize};

use crate::identity::EntityIdentity;

/// Numeric id of a View, unique among the Views of one machine type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ViewId(pub u32);

impl std::fmt::Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "view#{}", self.0)
    }
}

/// Who may take control of a View, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnershipPolicy {
    /// Ownership never changes.
    Fixed,
    /// Any peer may claim ownership; the authoritative peer arbitrates.
    Takeover,
    /// A peer asks; the current owner or controller decides.
    RequestConsent,
}

/// Progress of an ownership negotiation on one View.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Stable,
    /// Only reachable under [`OwnershipPolicy::RequestConsent`].
    RequestPending { requester: PeerId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub id: ViewId,
    pub owner: Option<PeerId>,
    pub controller: Option<PeerId>,
    pub policy: OwnershipPolicy,
    pub identity: Option<EntityIdentity>,
    pub negotiation: Negotiation,
}

impl View {
    pub fn new(id: ViewId, owner: Option<PeerId>, policy: OwnershipPolicy) -> Self {
        Self {
            id,
            owner,
            controller: owner,
            policy,
            identity: None,
            negotiation: Negotiation::Stable,
        }
    }

    pub fn with_identity(mut self, identity: EntityIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Sets owner and controller to `new_owner` and ends any negotiation.
    ///
    /// The controller falls back to `authoritative` when the new owner is
    /// not a live peer. Returns the previous owner.
    pub fn assign_owner(
        &mut self,
        new_owner: PeerId,
        new_owner_active: bool,
        authoritative: PeerId,
    ) -> Option<PeerId> {
        let previous = self.owner;
        self.owner = Some(new_owner);
        self.controller = Some(if new_owner_active { new_owner } else { authoritative });
        self.negotiation = Negotiation::Stable;
        previous
    }

    pub fn is_controlled_by(&self, peer: PeerId) -> bool {
        self.controller == Some(peer)
    }

    pub fn is_owned_by(&self, peer: PeerId) -> bool {
        self.owner == Some(peer)
    }
}

/// All Views known to one peer for one machine type.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    views: BTreeMap<ViewId, View>,
    by_identity: HashMap<EntityIdentity, ViewId>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest id >= 1 not currently in use.
    pub fn next_free_id(&self) -> ViewId {
        let mut candidate = 1u32;
        for id in self.views.keys() {
            if id.0 == candidate {
                candidate += 1;
            } else if id.0 > candidate {
                break;
            }
        }
        ViewId(candidate)
    }

    /// Registers a View. Returns false (and changes nothing) if the id is
    /// already taken.
    pub fn register(&mut self, view: View) -> bool {
        if self.views.contains_key(&view.id) {
            return false;
        }
        if let Some(identity) = view.identity {
            self.by_identity.insert(identity, view.id);
        }
        self.views.insert(view.id, view);
        true
    }

    pub fn remove(&mut self, id: ViewId) -> Option<View> {
        let view = self.views.remove(&id)?;
        if let Some(identity) = view.identity {
            if self.by_identity.get(&identity) == Some(&id) {
                self.by_identity.remove(&identity);
            }
        }
        Some(view)
    }

    pub fn get(&self, id: ViewId) -> Option<&View> {
        self.views.get(&id)
    }

    pub fn get_mut(&mut self, id: ViewId) -> Option<&mut View> {
        self.views.get_mut(&id)
    }

    pub fn find_by_identity(&self, identity: EntityIdentity) -> Option<&View> {
        self.by_identity
            .get(&identity)
            .and_then(|id| self.views.get(id))
    }

    /// Binds `identity` to an already registered View.
    pub fn bind_identity(&mut self, id: ViewId, identity: EntityIdentity) -> bool {
        let Some(view) = self.views.get_mut(&id) else {
            return false;
        };
        view.identity = Some(identity);
        self.by_identity.insert(identity, id);
        true
    }

    /// Hands control of every View controlled by `departed` to
    /// `authoritative`. Returns the affected ids.
    pub fn degrade_controller(&mut self, departed: PeerId, authoritative: PeerId) -> Vec<ViewId> {
        let mut affected = Vec::new();
        for view in self.views.values_mut() {
            if view.controller == Some(departed) {
                view.controller = Some(authoritative);
                affected.push(view.id);
            }
        }
        affected
    }

    pub fn ids(&self) -> Vec<ViewId> {
        self.views.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut View> {
        self.views.values_mut()
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

/// A View registry shared between a host and its machines.
#[derive(Debug, Clone, Default)]
pub struct SharedViews(Arc<Mutex<ViewRegistry>>);

impl SharedViews {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ViewRegistry> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of one View.
    pub fn get(&self, id: ViewId) -> Option<View> {
        self.lock().get(id).cloned()
    }
}
