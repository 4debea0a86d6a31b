//! SimWorld - The simulation harness container.

use crate::context::SimContext;
use crate::network::{NetworkMessage, Route, SimNetwork, SimNetworkController};

use netfsm_core::{
    CommandRegistry, HostConfig, HostError, NetworkedStateMachine, OwnershipPolicy, ReplicaHost,
    StateKey, TransitionEngine, ViewId, WireMessage,
};
use netfsm_env::{Envelope, PeerContext, PeerId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Router and inbox capacity.
const CHANNEL_CAPACITY: usize = 4096;

/// Upper bound on route/pump rounds in one `settle`.
const MAX_SETTLE_ROUNDS: usize = 256;

/// Scheduler turns handed to background transitions every tick.
const TASK_YIELDS_PER_TICK: usize = 16;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Host(#[from] HostError),

    #[error("attach task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of peers to spawn
    pub num_peers: usize,

    /// Tick rate in Hz
    pub tick_rate_hz: u32,

    /// Maximum ticks a scenario may run
    pub max_ticks: u64,

    /// How long a peer waits for a demand to be answered
    pub demand_timeout: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_peers: 4,
            tick_rate_hz: 30,
            max_ticks: 300,
            demand_timeout: Duration::from_secs(2),
        }
    }
}

/// Router counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingStats {
    pub routed: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub replayed: u64,
}

pub type SimHost<S> = ReplicaHost<SimContext, SimNetwork, S>;
pub type SimMachine<S> = NetworkedStateMachine<SimContext, SimNetwork, S>;

/// Handle to a simulated peer.
pub struct PeerHandle<S: StateKey> {
    pub id: PeerId,
    pub host: Arc<SimHost<S>>,
    inbox_tx: mpsc::Sender<(PeerId, Envelope)>,
}

impl<S: StateKey> Clone for PeerHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            host: Arc::clone(&self.host),
            inbox_tx: self.inbox_tx.clone(),
        }
    }
}

/// The SimWorld - every peer, the router and the shared virtual clock.
///
/// All methods take `&self` so a scenario can keep routing while peers
/// are blocked in `attach`.
pub struct SimWorld<S: StateKey> {
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Membership and connectivity
    pub controller: SimNetworkController,

    /// Peers in join order
    peers: Mutex<Vec<PeerHandle<S>>>,

    router_tx: mpsc::Sender<NetworkMessage>,
    router_rx: Mutex<mpsc::Receiver<NetworkMessage>>,

    /// Buffered broadcasts, replayed to every later joiner
    replay_log: Mutex<Vec<(PeerId, Envelope)>>,

    stats: Mutex<RoutingStats>,
    ownership_events: Arc<AtomicU64>,
    tick_count: AtomicU64,
    next_peer_seed: AtomicU64,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: StateKey> SimWorld<S> {
    pub fn new(config: SimConfig) -> Self {
        let context = SimContext::shared(config.seed);
        let (router_tx, router_rx) = mpsc::channel::<NetworkMessage>(CHANNEL_CAPACITY);

        Self {
            config,
            context,
            controller: SimNetworkController::new(),
            peers: Mutex::new(Vec::new()),
            router_tx,
            router_rx: Mutex::new(router_rx),
            replay_log: Mutex::new(Vec::new()),
            stats: Mutex::new(RoutingStats::default()),
            ownership_events: Arc::new(AtomicU64::new(0)),
            tick_count: AtomicU64::new(0),
            next_peer_seed: AtomicU64::new(0),
        }
    }

    /// Spawns `config.num_peers` peers and returns their IDs in join order.
    pub fn spawn_peers(&self) -> Vec<PeerId> {
        (0..self.config.num_peers).map(|_| self.join_peer()).collect()
    }

    /// Adds one peer. Everything broadcast buffered so far is queued to it
    /// first, flagged as replayed.
    pub fn join_peer(&self) -> PeerId {
        let index = self.next_peer_seed.fetch_add(1, Ordering::SeqCst);
        let id = PeerId::from_seed(self.config.seed.wrapping_mul(0x9e3779b97f4a7c15) ^ index);
        let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let network = Arc::new(SimNetwork::new(
            id,
            self.router_tx.clone(),
            inbox_rx,
            self.controller.membership(),
        ));
        let host_config = HostConfig {
            name: format!("peer-{}", index),
            demand_timeout: self.config.demand_timeout,
            tick_rate_hz: self.config.tick_rate_hz,
            ..HostConfig::default()
        };
        let host = Arc::new(ReplicaHost::new(host_config, Arc::clone(&self.context), network));

        let events = Arc::clone(&self.ownership_events);
        host.subscribe_ownership(move |_| {
            events.fetch_add(1, Ordering::Relaxed);
        });

        self.controller.join(id);

        let backlog = locked(&self.replay_log).clone();
        let mut replayed = 0;
        for (from, mut envelope) in backlog {
            envelope.replayed = true;
            if inbox_tx.try_send((from, envelope)).is_ok() {
                replayed += 1;
            }
        }
        locked(&self.stats).replayed += replayed;

        locked(&self.peers).push(PeerHandle { id, host, inbox_tx });
        info!(peer = %id, index, replayed, "peer joined");
        id
    }

    /// Removes `peer` and tells every remaining host it left.
    pub fn leave_peer(&self, peer: PeerId) -> bool {
        if !self.controller.leave(peer) {
            return false;
        }
        let remaining: Vec<PeerHandle<S>> = {
            let mut peers = locked(&self.peers);
            peers.retain(|handle| handle.id != peer);
            peers.clone()
        };
        for handle in &remaining {
            handle.host.on_peer_left(peer);
        }
        info!(%peer, "peer left");
        true
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        locked(&self.peers).iter().map(|handle| handle.id).collect()
    }

    pub fn host(&self, peer: PeerId) -> Result<Arc<SimHost<S>>, SimError> {
        locked(&self.peers)
            .iter()
            .find(|handle| handle.id == peer)
            .map(|handle| Arc::clone(&handle.host))
            .ok_or(SimError::UnknownPeer(peer))
    }

    pub fn hosts(&self) -> Vec<Arc<SimHost<S>>> {
        locked(&self.peers)
            .iter()
            .map(|handle| Arc::clone(&handle.host))
            .collect()
    }

    /// Moves every queued message from the router to its recipients.
    pub fn route(&self) -> usize {
        let peers = locked(&self.peers).clone();
        let mut router = locked(&self.router_rx);
        let mut stats = locked(&self.stats);
        let mut routed = 0;

        while let Ok(msg) = router.try_recv() {
            routed += 1;
            let recipients = match msg.route {
                Route::Peer(peer) => vec![peer],
                Route::All => self.controller.active_peers(),
                Route::AllBuffered => {
                    locked(&self.replay_log).push((msg.from, msg.envelope.clone()));
                    self.controller.active_peers()
                }
            };

            for recipient in recipients {
                let handle = peers.iter().find(|handle| handle.id == recipient);
                let delivered = match handle {
                    Some(handle) if self.controller.can_receive(recipient) => handle
                        .inbox_tx
                        .try_send((msg.from, msg.envelope.clone()))
                        .is_ok(),
                    _ => false,
                };
                if delivered {
                    stats.delivered += 1;
                } else {
                    stats.dropped += 1;
                    debug!(from = %msg.from, to = %recipient, "message dropped");
                }
            }
        }
        stats.routed += routed as u64;
        routed
    }

    /// Lets every host handle what is waiting in its inbox.
    pub async fn pump_all(&self) -> usize {
        let mut handled = 0;
        for host in self.hosts() {
            handled += host.pump().await;
        }
        handled
    }

    /// Routes and pumps until nothing moves for a few rounds.
    pub async fn settle(&self) {
        let mut quiet_rounds = 0;
        for _ in 0..MAX_SETTLE_ROUNDS {
            let routed = self.route();
            let handled = self.pump_all().await;
            tokio::task::yield_now().await;

            if routed + handled == 0 {
                quiet_rounds += 1;
                if quiet_rounds >= 3 {
                    return;
                }
            } else {
                quiet_rounds = 0;
            }
        }
    }

    /// Advances the clock by one tick, ticks every host and settles.
    pub async fn tick(&self) {
        let dt = Duration::from_secs_f64(1.0 / self.config.tick_rate_hz.max(1) as f64);
        self.context.advance_time(dt);

        for host in self.hosts() {
            host.tick();
        }
        for _ in 0..TASK_YIELDS_PER_TICK {
            tokio::task::yield_now().await;
        }
        self.settle().await;
        self.tick_count.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn run_ticks(&self, ticks: u64) {
        for _ in 0..ticks {
            self.tick().await;
        }
    }

    /// Attaches `path` on one peer while the world keeps routing.
    pub async fn attach<F>(
        &self,
        peer: PeerId,
        path: &str,
        policy: OwnershipPolicy,
        build: F,
    ) -> Result<SimMachine<S>, SimError>
    where
        F: Fn(PeerId) -> Result<(TransitionEngine<S>, CommandRegistry<S>), HostError>,
    {
        let host = self.host(peer)?;
        let (engine, commands) = build(peer)?;
        let (attached, _) = tokio::join!(host.attach(path, policy, engine, commands), self.settle());
        Ok(attached?)
    }

    /// Attaches `path` on all of `peers` at once, so their demands reach
    /// the authoritative peer concurrently.
    pub async fn attach_all<F>(
        &self,
        peers: &[PeerId],
        path: &str,
        policy: OwnershipPolicy,
        build: F,
    ) -> Result<Vec<(PeerId, SimMachine<S>)>, SimError>
    where
        F: Fn(PeerId) -> Result<(TransitionEngine<S>, CommandRegistry<S>), HostError>,
    {
        let mut tasks = Vec::with_capacity(peers.len());
        for &peer in peers {
            let host = self.host(peer)?;
            let (engine, commands) = build(peer)?;
            let path = path.to_string();
            let task = tokio::spawn(async move { host.attach(&path, policy, engine, commands).await });
            tasks.push((peer, task));
        }

        for _ in 0..MAX_SETTLE_ROUNDS {
            if tasks.iter().all(|(_, task)| task.is_finished()) {
                break;
            }
            self.settle().await;
        }

        let mut machines = Vec::with_capacity(tasks.len());
        for (peer, task) in tasks {
            machines.push((peer, task.await??));
        }
        Ok(machines)
    }

    /// Despawns `view` on every peer and drops its buffered broadcasts, so
    /// a later entity reusing the id does not inherit them. Returns how
    /// many peers still knew the View.
    pub fn despawn(&self, view: ViewId) -> usize {
        let removed = self
            .hosts()
            .iter()
            .filter(|host| host.despawn(view))
            .count();

        let mut log = locked(&self.replay_log);
        let before = log.len();
        log.retain(|(_, envelope)| {
            WireMessage::decode(envelope).map_or(true, |message| message.view() != Some(view))
        });
        info!(%view, removed, pruned = before - log.len(), "view despawned");
        removed
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }

    pub fn peer_count(&self) -> usize {
        locked(&self.peers).len()
    }

    pub fn stats(&self) -> RoutingStats {
        *locked(&self.stats)
    }

    /// Ownership events raised across all peers so far.
    pub fn ownership_events(&self) -> u64 {
        self.ownership_events.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{sentry, Journal, Mode};

    fn world(num_peers: usize) -> SimWorld<Mode> {
        SimWorld::new(SimConfig {
            num_peers,
            ..Default::default()
        })
    }

    #[test]
    fn test_sim_world_creation() {
        let world = world(3);
        let ids = world.spawn_peers();

        assert_eq!(ids.len(), 3);
        assert_eq!(world.peer_count(), 3);
        assert_eq!(world.controller.authoritative(), Some(ids[0]));
    }

    #[tokio::test]
    async fn test_sim_world_tick() {
        let world = world(1);
        assert_eq!(world.tick_count(), 0);
        assert_eq!(world.time(), 0.0);

        world.tick().await;

        assert_eq!(world.tick_count(), 1);
        assert!((world.time() - 1.0 / 30.0).abs() < 0.0001);
    }

    #[test]
    fn test_same_seed_same_peer_ids() {
        let a = world(3);
        let b = world(3);
        assert_eq!(a.spawn_peers(), b.spawn_peers());
    }

    #[tokio::test]
    async fn test_buffered_broadcast_is_replayed_to_joiner() {
        let world = world(2);
        let peers = world.spawn_peers();
        let machines = world
            .attach_all(&peers, "Yard/Gate", OwnershipPolicy::Takeover, |_| sentry(&Journal::new()))
            .await
            .unwrap();

        machines[0].1.queue_new_state(Mode::Alert, false).await.unwrap();
        world.settle().await;

        world.join_peer();
        assert_eq!(world.stats().replayed, 1);
    }

    #[tokio::test]
    async fn test_despawn_prunes_buffered_broadcasts() {
        let world = world(2);
        let peers = world.spawn_peers();
        let machines = world
            .attach_all(&peers, "Yard/Gate", OwnershipPolicy::Takeover, |_| sentry(&Journal::new()))
            .await
            .unwrap();
        let view = machines[0].1.view_id();

        machines[0].1.queue_new_state(Mode::Alert, false).await.unwrap();
        world.settle().await;
        assert_eq!(world.despawn(view), 2);

        let late = world.join_peer();
        assert_eq!(world.stats().replayed, 0);

        let machine = world
            .attach(late, "Yard/Lamp", OwnershipPolicy::Takeover, |_| sentry(&Journal::new()))
            .await
            .unwrap();
        assert_eq!(machine.view_id(), view);
        assert!(machine.engine().pending().is_empty());
    }
}
