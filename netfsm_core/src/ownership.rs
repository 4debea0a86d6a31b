//! The ownership protocol.
//!
//! Three policies decide how a View changes hands:
//!
//! | policy           | request                                   | transfer                  |
//! |------------------|-------------------------------------------|---------------------------|
//! | `Fixed`          | ignored                                   | refused                   |
//! | `Takeover`       | arbitrated by the authoritative peer      | anyone                    |
//! | `RequestConsent` | broadcast; the owner decides              | owner or controller only  |
//!
//! Takeover claims carry the owner the requester believed current. The
//! authoritative peer serializes claims and grants one only while that
//! belief still matches its own record, so of two simultaneous claims
//! exactly one wins and the other is told it failed.
//!
//! This module only decides; the host performs the sends.

use netfsm_env::PeerId;
use thiserror::Error;

use crate::observer::{Observers, SubscriptionId};
use crate::view::{Negotiation, OwnershipPolicy, View, ViewId};
use crate::wire::WireMessage;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("unknown {0}")]
    UnknownView(ViewId),

    #[error("{view} has a fixed owner")]
    FixedPolicy { view: ViewId },

    #[error("{caller} is neither owner nor controller of {view}")]
    NotOwner { view: ViewId, caller: PeerId },
}

/// Notifications raised on every peer, each carrying the View and the
/// other peer involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipEvent {
    Requested {
        view: ViewId,
        requester: PeerId,
    },
    Transferred {
        view: ViewId,
        new_owner: PeerId,
        previous_owner: Option<PeerId>,
    },
    TransferFailed {
        view: ViewId,
        requester: PeerId,
    },
}

impl OwnershipEvent {
    pub fn view(&self) -> ViewId {
        match self {
            OwnershipEvent::Requested { view, .. }
            | OwnershipEvent::Transferred { view, .. }
            | OwnershipEvent::TransferFailed { view, .. } => *view,
        }
    }
}

/// Where a request must go.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestRoute {
    /// Unicast to the authoritative peer.
    ToAuthoritative(WireMessage),
    /// Broadcast to every peer.
    Broadcast(WireMessage),
}

/// Outcome of arbitrating a takeover claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Granted { previous_owner: Option<PeerId> },
    Rejected,
}

/// Ownership decisions plus the observer list for ownership events.
#[derive(Default)]
pub struct OwnershipProtocol {
    events: Observers<OwnershipEvent>,
}

impl OwnershipProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&OwnershipEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn raise(&self, event: OwnershipEvent) {
        self.events.notify(&event);
    }

    /// Decides how `requester`'s request for `view` travels.
    pub fn route_request(&self, view: &View, requester: PeerId) -> Result<RequestRoute, OwnershipError> {
        match view.policy {
            OwnershipPolicy::Fixed => Err(OwnershipError::FixedPolicy { view: view.id }),
            OwnershipPolicy::Takeover => Ok(RequestRoute::ToAuthoritative(WireMessage::TakeoverRequest {
                view: view.id,
                requester,
                expected_owner: view.owner,
            })),
            OwnershipPolicy::RequestConsent => Ok(RequestRoute::Broadcast(WireMessage::OwnershipRequested {
                view: view.id,
                requester,
            })),
        }
    }

    /// Arbitrates a takeover claim against the authoritative record and,
    /// when granted, applies it to `view` immediately so the next claim is
    /// judged against the new owner.
    pub fn arbitrate(
        &self,
        view: &mut View,
        requester: PeerId,
        expected_owner: Option<PeerId>,
        requester_active: bool,
        authoritative: PeerId,
    ) -> Verdict {
        let current = view.owner;
        let fresh = current.is_none() || current == expected_owner || current == Some(requester);
        if view.policy != OwnershipPolicy::Takeover || !fresh {
            return Verdict::Rejected;
        }
        let previous_owner = view.assign_owner(requester, requester_active, authoritative);
        Verdict::Granted { previous_owner }
    }

    /// Checks whether `caller` may hand `view` to another peer.
    pub fn authorize_transfer(&self, view: &View, caller: PeerId) -> Result<(), OwnershipError> {
        match view.policy {
            OwnershipPolicy::Fixed => Err(OwnershipError::FixedPolicy { view: view.id }),
            OwnershipPolicy::Takeover => Ok(()),
            OwnershipPolicy::RequestConsent => {
                if view.is_owned_by(caller) || view.is_controlled_by(caller) {
                    Ok(())
                } else {
                    Err(OwnershipError::NotOwner { view: view.id, caller })
                }
            }
        }
    }

    /// Records a pending consent request.
    pub fn note_request(&self, view: &mut View, requester: PeerId) {
        if view.policy == OwnershipPolicy::RequestConsent {
            view.negotiation = Negotiation::RequestPending { requester };
        }
    }

    /// Applies a broadcast transfer. Returns the event to raise, or `None`
    /// when the View already has that owner (the arbitrating peer applied
    /// it before broadcasting).
    pub fn apply_transfer(
        &self,
        view: &mut View,
        new_owner: PeerId,
        new_owner_active: bool,
        authoritative: PeerId,
    ) -> Option<OwnershipEvent> {
        if view.owner == Some(new_owner) {
            view.controller = Some(if new_owner_active { new_owner } else { authoritative });
            view.negotiation = Negotiation::Stable;
            return None;
        }
        let previous_owner = view.assign_owner(new_owner, new_owner_active, authoritative);
        Some(OwnershipEvent::Transferred {
            view: view.id,
            new_owner,
            previous_owner,
        })
    }
}
