//! Simulated network transport with membership control.
//!
//! Every outgoing message goes through one central router queue owned by
//! the world, so messages from one sender are delivered in send order.
//! Broadcasts reach every active peer, the sender included.

use async_trait::async_trait;
use netfsm_env::{BroadcastScope, EnvError, Envelope, NetworkTransport, PeerId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Where a routed message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Peer(PeerId),
    All,
    /// Broadcast and keep in the replay log for later joiners.
    AllBuffered,
}

/// Internal message to the network router.
#[derive(Debug)]
pub struct NetworkMessage {
    pub from: PeerId,
    pub route: Route,
    pub envelope: Envelope,
}

/// Who is on the simulated network, in join order.
#[derive(Debug, Default)]
pub struct Membership {
    order: Vec<PeerId>,
    active: HashSet<PeerId>,
    disconnected: HashSet<PeerId>,
}

impl Membership {
    pub fn join(&mut self, peer: PeerId) {
        if !self.order.contains(&peer) {
            self.order.push(peer);
        }
        self.active.insert(peer);
        self.disconnected.remove(&peer);
    }

    pub fn leave(&mut self, peer: PeerId) -> bool {
        self.active.remove(&peer)
    }

    pub fn is_active(&self, peer: PeerId) -> bool {
        self.active.contains(&peer)
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.is_active(peer) && !self.disconnected.contains(&peer)
    }

    pub fn set_connected(&mut self, peer: PeerId, connected: bool) {
        if connected {
            self.disconnected.remove(&peer);
        } else {
            self.disconnected.insert(peer);
        }
    }

    /// The earliest-joined peer still active.
    pub fn authoritative(&self) -> Option<PeerId> {
        self.order.iter().copied().find(|peer| self.active.contains(peer))
    }

    /// Active peers in join order.
    pub fn active_peers(&self) -> Vec<PeerId> {
        self.order
            .iter()
            .copied()
            .filter(|peer| self.active.contains(peer))
            .collect()
    }
}

/// Membership shared between the world and every peer's transport.
#[derive(Debug, Clone, Default)]
pub struct SharedMembership(Arc<Mutex<Membership>>);

impl SharedMembership {
    pub fn lock(&self) -> MutexGuard<'_, Membership> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Simulated network interface for one peer.
pub struct SimNetwork {
    /// This peer's ID
    local_id: PeerId,

    /// Sender to central router
    tx: mpsc::Sender<NetworkMessage>,

    /// Receiver for incoming envelopes (behind tokio mutex for async)
    rx: tokio::sync::Mutex<mpsc::Receiver<(PeerId, Envelope)>>,

    membership: SharedMembership,
}

impl SimNetwork {
    pub fn new(
        local_id: PeerId,
        tx: mpsc::Sender<NetworkMessage>,
        rx: mpsc::Receiver<(PeerId, Envelope)>,
        membership: SharedMembership,
    ) -> Self {
        Self {
            local_id,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            membership,
        }
    }

    async fn submit(&self, route: Route, envelope: Envelope) -> Result<(), EnvError> {
        let msg = NetworkMessage {
            from: self.local_id,
            route,
            envelope,
        };
        self.tx
            .send(msg)
            .await
            .map_err(|_| EnvError::network("router closed"))
    }

    fn ensure_connected(&self) -> Result<(), EnvError> {
        if self.membership.lock().is_connected(self.local_id) {
            Ok(())
        } else {
            Err(EnvError::NotConnected)
        }
    }
}

#[async_trait]
impl NetworkTransport for SimNetwork {
    async fn send(&self, target: PeerId, envelope: Envelope) -> Result<(), EnvError> {
        self.ensure_connected()?;
        if !self.membership.lock().is_active(target) {
            return Err(EnvError::unreachable(target));
        }
        self.submit(Route::Peer(target), envelope).await
    }

    async fn broadcast(&self, scope: BroadcastScope, envelope: Envelope) -> Result<usize, EnvError> {
        self.ensure_connected()?;
        let reach = self.membership.lock().active_peers().len();
        let route = match scope {
            BroadcastScope::All => Route::All,
            BroadcastScope::AllBuffered => Route::AllBuffered,
        };
        self.submit(route, envelope).await?;
        Ok(reach)
    }

    async fn recv(&self) -> Option<(PeerId, Envelope)> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn try_recv(&self) -> Option<(PeerId, Envelope)> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    fn local_id(&self) -> PeerId {
        self.local_id
    }

    fn authoritative_peer(&self) -> PeerId {
        self.membership.lock().authoritative().unwrap_or(self.local_id)
    }

    fn is_connected(&self) -> bool {
        self.membership.lock().is_connected(self.local_id)
    }

    fn is_active(&self, peer: PeerId) -> bool {
        self.membership.lock().is_active(peer)
    }
}

/// Network controller for membership changes and connectivity faults.
#[derive(Debug, Clone, Default)]
pub struct SimNetworkController {
    membership: SharedMembership,
}

impl SimNetworkController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn membership(&self) -> SharedMembership {
        self.membership.clone()
    }

    pub fn join(&self, peer: PeerId) {
        self.membership.lock().join(peer);
    }

    pub fn leave(&self, peer: PeerId) -> bool {
        self.membership.lock().leave(peer)
    }

    /// Cuts `peer` off: it can neither send nor receive.
    pub fn disconnect(&self, peer: PeerId) {
        self.membership.lock().set_connected(peer, false);
    }

    pub fn reconnect(&self, peer: PeerId) {
        self.membership.lock().set_connected(peer, true);
    }

    pub fn can_receive(&self, peer: PeerId) -> bool {
        self.membership.lock().is_connected(peer)
    }

    pub fn authoritative(&self) -> Option<PeerId> {
        self.membership.lock().authoritative()
    }

    pub fn active_peers(&self) -> Vec<PeerId> {
        self.membership.lock().active_peers()
    }
}
