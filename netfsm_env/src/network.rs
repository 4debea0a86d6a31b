//! Network transport abstraction for netfsm peers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::EnvError;
use crate::types::{Envelope, PeerId};

/// Which peers a broadcast reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastScope {
    /// Every live peer, including the sender.
    All,

    /// Every live peer, including the sender, and replayed to peers that
    /// join later.
    AllBuffered,
}

/// Destination of a call: a broadcast scope or one specific peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    All,
    AllBuffered,
    Peer(PeerId),
}

/// Abstraction for the session transport between peers.
///
/// The core relies on two guarantees only:
/// - calls from one sender reach every receiver in emission order
/// - broadcasts include the sender itself, so every peer (sender included)
///   applies a broadcast change through the same receive path
///
/// No total order across different senders is assumed.
///
/// # Implementations
///
/// - **Production**: wraps a relay/room service
/// - **Simulation**: channel-based router with partitions and late joiners
///
/// # Call Flow
///
/// ```text
/// Peer A                    Transport                    Peer B
///   |                           |                          |
///   |-- broadcast(All, call) -->|                          |
///   |<-- call (loopback) -------|-- call ----------------->|
///   |                           |                          |-- try_recv() -> call
/// ```
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Sends an envelope to one peer.
    ///
    /// Sending to `local_id()` loops the envelope back to this peer.
    ///
    /// # Returns
    /// * `Ok(())` - Envelope queued for delivery
    /// * `Err(EnvError::NotConnected)` - No session
    /// * `Err(EnvError::PeerUnreachable)` - Target is not a live peer
    async fn send(&self, target: PeerId, envelope: Envelope) -> Result<(), EnvError>;

    /// Broadcasts an envelope to every live peer, including this one.
    ///
    /// # Returns
    /// Number of peers the envelope was queued for.
    async fn broadcast(&self, scope: BroadcastScope, envelope: Envelope) -> Result<usize, EnvError>;

    /// Delivers an envelope to a [`Target`].
    async fn deliver(&self, target: Target, envelope: Envelope) -> Result<usize, EnvError> {
        match target {
            Target::All => self.broadcast(BroadcastScope::All, envelope).await,
            Target::AllBuffered => self.broadcast(BroadcastScope::AllBuffered, envelope).await,
            Target::Peer(peer) => self.send(peer, envelope).await.map(|_| 1),
        }
    }

    /// Receives the next envelope addressed to this peer.
    ///
    /// # Returns
    /// * `Some((sender, envelope))` - An envelope was received
    /// * `None` - The channel was closed (shutdown)
    async fn recv(&self) -> Option<(PeerId, Envelope)>;

    /// Receives the next envelope if one is already waiting.
    fn try_recv(&self) -> Option<(PeerId, Envelope)>;

    /// Returns this peer's ID.
    fn local_id(&self) -> PeerId;

    /// Returns the peer currently responsible for resolving Views
    /// during discovery.
    fn authoritative_peer(&self) -> PeerId;

    /// Whether this peer is currently part of a session.
    fn is_connected(&self) -> bool;

    /// Whether `peer` is a live member of the session.
    fn is_active(&self, peer: PeerId) -> bool;
}
