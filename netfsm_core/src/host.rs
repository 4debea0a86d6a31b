//! ReplicaHost - one peer's side of every networked machine of one type.
//!
//! The host owns the View registry, the attached machines, discovery and
//! the ownership protocol. Inbound envelopes are decoded and routed here;
//! the role of the local peer (authoritative or not) is read from the
//! transport on every message and passed down explicitly.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use netfsm_env::{EnvError, Envelope, NetworkTransport, PeerContext, PeerId, Target};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::discovery::{Discovery, DiscoveryError, Resolution};
use crate::dispatch::{CommandRegistry, DispatchError};
use crate::engine::{EngineError, TransitionEngine};
use crate::identity::EntityIdentity;
use crate::machine::{NetworkedStateMachine, TickStatus};
use crate::observer::SubscriptionId;
use crate::ownership::{OwnershipError, OwnershipEvent, OwnershipProtocol, RequestRoute, Verdict};
use crate::state::{SpatialEvent, StateCodecError, StateKey};
use crate::view::{OwnershipPolicy, SharedViews, View, ViewId};
use crate::wire::{WireError, WireMessage};

/// State messages kept per View while no machine is attached to it.
const PARKED_PER_VIEW: usize = 64;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Codec(#[from] StateCodecError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("{0} already has a machine attached")]
    AlreadyAttached(ViewId),
}

type Machines<Ctx, Net, S> = BTreeMap<ViewId, NetworkedStateMachine<Ctx, Net, S>>;

pub struct ReplicaHost<Ctx, Net, S: StateKey> {
    config: HostConfig,
    context: Arc<Ctx>,
    network: Arc<Net>,
    views: SharedViews,
    machines: Mutex<Machines<Ctx, Net, S>>,
    parked: Mutex<BTreeMap<ViewId, VecDeque<WireMessage>>>,
    discovery: Discovery,
    ownership: OwnershipProtocol,
}

impl<Ctx, Net, S> ReplicaHost<Ctx, Net, S>
where
    Ctx: PeerContext,
    Net: NetworkTransport,
    S: StateKey,
{
    pub fn new(config: HostConfig, context: Arc<Ctx>, network: Arc<Net>) -> Self {
        Self {
            config,
            context,
            network,
            views: SharedViews::new(),
            machines: Mutex::new(BTreeMap::new()),
            parked: Mutex::new(BTreeMap::new()),
            discovery: Discovery::new(),
            ownership: OwnershipProtocol::new(),
        }
    }

    fn machines(&self) -> MutexGuard<'_, Machines<Ctx, Net, S>> {
        self.machines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn parked(&self) -> MutexGuard<'_, BTreeMap<ViewId, VecDeque<WireMessage>>> {
        self.parked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<Net> {
        &self.network
    }

    pub fn local_id(&self) -> PeerId {
        self.network.local_id()
    }

    pub fn is_authoritative(&self) -> bool {
        self.network.authoritative_peer() == self.network.local_id()
    }

    pub fn views(&self) -> &SharedViews {
        &self.views
    }

    pub fn view(&self, id: ViewId) -> Option<View> {
        self.views.get(id)
    }

    pub fn machine(&self, id: ViewId) -> Option<NetworkedStateMachine<Ctx, Net, S>> {
        self.machines().get(&id).cloned()
    }

    pub fn machine_ids(&self) -> Vec<ViewId> {
        self.machines().keys().copied().collect()
    }

    pub fn subscribe_ownership<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&OwnershipEvent) + Send + Sync + 'static,
    {
        self.ownership.subscribe(callback)
    }

    pub fn unsubscribe_ownership(&self, id: SubscriptionId) -> bool {
        self.ownership.unsubscribe(id)
    }

    fn stamp(&self) -> u64 {
        self.context.now().as_millis() as u64
    }

    async fn emit(&self, target: Target, message: WireMessage) -> Result<usize, HostError> {
        debug!(host = %self.config.name, kind = message.kind(), ?target, "sending");
        let envelope = message.encode(self.stamp())?;
        Ok(self.network.deliver(target, envelope).await?)
    }

    // ---------------------------------------------------------------
    // Discovery
    // ---------------------------------------------------------------

    /// Resolves the View bound to `identity`, asking the authoritative peer
    /// when connected. Off-line the local registry is authoritative.
    pub async fn demand(
        &self,
        identity: EntityIdentity,
        policy: OwnershipPolicy,
    ) -> Result<Resolution, HostError> {
        let local = self.network.local_id();
        if !self.network.is_connected() {
            debug!(host = %self.config.name, %identity, "offline, resolving locally");
            return Ok(self.discovery.resolve_demand(&self.views, identity, policy, local).await);
        }

        let receiver = self.discovery.wait_for(identity);
        let demand = WireMessage::Demand {
            identity,
            requester: local,
            policy,
        };
        self.emit(Target::Peer(self.network.authoritative_peer()), demand)
            .await?;

        let resolution = self
            .discovery
            .await_resolution(identity, receiver, self.config.demand_timeout)
            .await
            .inspect_err(|err| warn!(host = %self.config.name, error = %err, "demand failed"))?;
        Ok(resolution)
    }

    /// Discovers the entity at `path` and binds `engine` to its View.
    ///
    /// Any state changes that arrived for the View before it was attached
    /// are applied to the engine in arrival order.
    pub async fn attach(
        &self,
        path: &str,
        policy: OwnershipPolicy,
        engine: TransitionEngine<S>,
        commands: CommandRegistry<S>,
    ) -> Result<NetworkedStateMachine<Ctx, Net, S>, HostError> {
        let identity = EntityIdentity::from_path(path);
        let resolution = self.demand(identity, policy).await?;

        let machine = NetworkedStateMachine::new(
            resolution.view,
            identity,
            Arc::clone(&self.context),
            Arc::clone(&self.network),
            self.views.clone(),
            engine,
            Arc::new(commands),
            self.config.buffer_state_changes,
        );
        {
            let mut machines = self.machines();
            if machines.contains_key(&resolution.view) {
                return Err(HostError::AlreadyAttached(resolution.view));
            }
            machines.insert(resolution.view, machine.clone());
        }
        info!(host = %self.config.name, path, view = %resolution.view, owner = %resolution.owner, "attached");

        let backlog = self.parked().remove(&resolution.view).unwrap_or_default();
        for message in backlog {
            machine.receive(message);
        }
        Ok(machine)
    }

    /// Drops the machine and View for `id` on this peer.
    pub fn despawn(&self, id: ViewId) -> bool {
        let machine = self.machines().remove(&id);
        self.parked().remove(&id);
        let view = self.views.lock().remove(id);
        if let Some(identity) = view.as_ref().and_then(|view| view.identity) {
            self.discovery.forget(identity);
        }
        machine.is_some() || view.is_some()
    }

    // ---------------------------------------------------------------
    // Ownership
    // ---------------------------------------------------------------

    /// Asks for ownership of `id` on behalf of `requester`.
    pub async fn request_ownership(&self, id: ViewId, requester: PeerId) -> Result<(), HostError> {
        let view = self.views.get(id).ok_or(OwnershipError::UnknownView(id))?;
        let route = self
            .ownership
            .route_request(&view, requester)
            .inspect_err(|err| warn!(host = %self.config.name, error = %err, "ownership request ignored"))?;
        self.require_connection("ownership request")?;

        match route {
            RequestRoute::ToAuthoritative(message) => {
                self.emit(Target::Peer(self.network.authoritative_peer()), message)
                    .await?;
            }
            RequestRoute::Broadcast(message) => {
                self.emit(Target::All, message).await?;
            }
        }
        Ok(())
    }

    /// Hands `id` to `new_owner`. Refused under the fixed policy, and under
    /// the consent policy unless this peer owns or controls the View.
    pub async fn transfer_ownership(&self, id: ViewId, new_owner: PeerId) -> Result<(), HostError> {
        let view = self.views.get(id).ok_or(OwnershipError::UnknownView(id))?;
        self.ownership
            .authorize_transfer(&view, self.network.local_id())
            .inspect_err(|err| warn!(host = %self.config.name, error = %err, "transfer refused"))?;
        self.require_connection("ownership transfer")?;

        let message = WireMessage::OwnershipTransferred {
            view: id,
            new_owner,
            previous_owner: view.owner,
        };
        self.emit(Target::All, message).await?;
        Ok(())
    }

    fn require_connection(&self, what: &str) -> Result<(), HostError> {
        if self.network.is_connected() {
            return Ok(());
        }
        warn!(host = %self.config.name, "{} needs a connection", what);
        Err(EnvError::NotConnected.into())
    }

    /// Hands control of every View controlled by `peer` to the current
    /// authoritative peer. Call after the transport reports a departure.
    pub fn on_peer_left(&self, peer: PeerId) -> Vec<ViewId> {
        let authoritative = self.network.authoritative_peer();
        let affected = self.views.lock().degrade_controller(peer, authoritative);
        if !affected.is_empty() {
            info!(host = %self.config.name, %peer, views = affected.len(), "controller departed, control degraded");
        }
        affected
    }

    /// Recomputes every controller from its owner's liveness.
    pub fn refresh_controllers(&self) -> Vec<ViewId> {
        let authoritative = self.network.authoritative_peer();
        let mut changed = Vec::new();
        for view in self.views.lock().iter_mut() {
            let controller = match view.owner {
                Some(owner) if self.network.is_active(owner) => owner,
                _ => authoritative,
            };
            if view.controller != Some(controller) {
                view.controller = Some(controller);
                changed.push(view.id);
            }
        }
        changed
    }

    // ---------------------------------------------------------------
    // Driving
    // ---------------------------------------------------------------

    /// Ticks every attached machine once.
    pub fn tick(&self) -> Vec<(ViewId, TickStatus<S>)> {
        let machines: Vec<_> = self.machines().values().cloned().collect();
        machines
            .iter()
            .map(|machine| (machine.view_id(), machine.tick()))
            .collect()
    }

    pub fn on_spatial_event(&self, id: ViewId, event: &SpatialEvent) -> bool {
        self.machine(id)
            .is_some_and(|machine| machine.on_spatial_event(event))
    }

    /// Handles every envelope already waiting in the transport. Returns
    /// how many were handled.
    pub async fn pump(&self) -> usize {
        let mut handled = 0;
        while let Some((from, envelope)) = self.network.try_recv() {
            self.handle_envelope(from, envelope).await;
            handled += 1;
        }
        handled
    }

    /// Decodes and applies one inbound envelope. Errors are logged.
    pub async fn handle_envelope(&self, from: PeerId, envelope: Envelope) {
        match WireMessage::decode(&envelope) {
            Ok(message) => {
                debug!(host = %self.config.name, %from, kind = message.kind(), replayed = envelope.replayed, "received");
                self.handle_message(from, message).await;
            }
            Err(err) => warn!(host = %self.config.name, %from, error = %err, "dropping envelope"),
        }
    }

    async fn handle_message(&self, from: PeerId, message: WireMessage) {
        let authoritative = self.network.authoritative_peer();
        match message {
            WireMessage::QueueState { view, .. }
            | WireMessage::ForceState { view, .. }
            | WireMessage::Command { view, .. } => self.route_to_machine(view, message),

            WireMessage::TakeoverRequest {
                view,
                requester,
                expected_owner,
            } => {
                if !self.is_authoritative() {
                    warn!(host = %self.config.name, %from, "takeover request reached a non-authoritative peer");
                    return;
                }
                self.arbitrate(view, requester, expected_owner, authoritative).await;
            }

            WireMessage::OwnershipRequested { view, requester } => {
                let known = match self.views.lock().get_mut(view) {
                    Some(record) => {
                        self.ownership.note_request(record, requester);
                        true
                    }
                    None => false,
                };
                if known {
                    self.ownership.raise(OwnershipEvent::Requested { view, requester });
                }
            }

            WireMessage::OwnershipTransferred { view, new_owner, .. } => {
                let active = self.network.is_active(new_owner);
                let event = self
                    .views
                    .lock()
                    .get_mut(view)
                    .and_then(|record| self.ownership.apply_transfer(record, new_owner, active, authoritative));
                if let Some(event) = event {
                    info!(host = %self.config.name, %view, %new_owner, "ownership transferred");
                    self.ownership.raise(event);
                }
            }

            WireMessage::OwnershipTransferFailed { view, requester } => {
                self.ownership.raise(OwnershipEvent::TransferFailed { view, requester });
            }

            WireMessage::Demand {
                identity,
                requester,
                policy,
            } => {
                if !self.is_authoritative() {
                    warn!(host = %self.config.name, %from, %identity, "demand reached a non-authoritative peer");
                    return;
                }
                let resolution = self
                    .discovery
                    .resolve_demand(&self.views, identity, policy, authoritative)
                    .await;
                let respond = WireMessage::Respond {
                    identity,
                    view: resolution.view,
                    owner: resolution.owner,
                    policy: resolution.policy,
                };
                if let Err(err) = self.emit(Target::Peer(requester), respond).await {
                    warn!(host = %self.config.name, %requester, error = %err, "could not answer demand");
                }
            }

            WireMessage::Respond {
                identity,
                view,
                owner,
                policy,
            } => {
                let resolution = Resolution { view, owner, policy };
                let active = self.network.is_active(owner);
                self.discovery
                    .accept_response(&self.views, identity, resolution, active, authoritative);
            }
        }
    }

    async fn arbitrate(
        &self,
        view: ViewId,
        requester: PeerId,
        expected_owner: Option<PeerId>,
        authoritative: PeerId,
    ) {
        let active = self.network.is_active(requester);
        let verdict = match self.views.lock().get_mut(view) {
            Some(record) => {
                self.ownership
                    .arbitrate(record, requester, expected_owner, active, authoritative)
            }
            None => Verdict::Rejected,
        };

        let outcome = match verdict {
            Verdict::Granted { previous_owner } => {
                info!(host = %self.config.name, %view, %requester, "takeover granted");
                self.ownership.raise(OwnershipEvent::Transferred {
                    view,
                    new_owner: requester,
                    previous_owner,
                });
                WireMessage::OwnershipTransferred {
                    view,
                    new_owner: requester,
                    previous_owner,
                }
            }
            Verdict::Rejected => {
                warn!(host = %self.config.name, %view, %requester, "takeover rejected");
                WireMessage::OwnershipTransferFailed { view, requester }
            }
        };
        if let Err(err) = self.emit(Target::All, outcome).await {
            warn!(host = %self.config.name, %view, error = %err, "could not announce takeover verdict");
        }
    }

    fn route_to_machine(&self, view: ViewId, message: WireMessage) {
        if let Some(machine) = self.machine(view) {
            machine.receive(message);
            return;
        }
        if matches!(message, WireMessage::Command { .. }) {
            debug!(host = %self.config.name, %view, "command for unattached view dropped");
            return;
        }
        let mut parked = self.parked();
        let backlog = parked.entry(view).or_default();
        if backlog.len() == PARKED_PER_VIEW {
            backlog.pop_front();
        }
        backlog.push_back(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CommandFailure;
    use crate::engine::tests::Recorder;
    use crate::machine::InvokeOutcome;
    use crate::state::tests::Phase;
    use async_trait::async_trait;
    use netfsm_env::{BroadcastScope, TokioContext};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A single-peer transport that loops everything back to itself.
    struct Loopback {
        id: PeerId,
        connected: AtomicBool,
        inbox: Mutex<VecDeque<(PeerId, Envelope)>>,
    }

    impl Loopback {
        fn new(connected: bool) -> Arc<Self> {
            Arc::new(Self {
                id: PeerId::from_seed(1),
                connected: AtomicBool::new(connected),
                inbox: Mutex::new(VecDeque::new()),
            })
        }

        fn push(&self, envelope: Envelope) -> Result<(), EnvError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(EnvError::NotConnected);
            }
            self.inbox.lock().unwrap().push_back((self.id, envelope));
            Ok(())
        }
    }

    #[async_trait]
    impl NetworkTransport for Loopback {
        async fn send(&self, target: PeerId, envelope: Envelope) -> Result<(), EnvError> {
            if target != self.id {
                return Err(EnvError::unreachable(target));
            }
            self.push(envelope)
        }

        async fn broadcast(&self, _scope: BroadcastScope, envelope: Envelope) -> Result<usize, EnvError> {
            self.push(envelope).map(|_| 1)
        }

        async fn recv(&self) -> Option<(PeerId, Envelope)> {
            self.try_recv()
        }

        fn try_recv(&self) -> Option<(PeerId, Envelope)> {
            self.inbox.lock().unwrap().pop_front()
        }

        fn local_id(&self) -> PeerId {
            self.id
        }

        fn authoritative_peer(&self) -> PeerId {
            self.id
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn is_active(&self, peer: PeerId) -> bool {
            peer == self.id
        }
    }

    type Host = ReplicaHost<TokioContext, Loopback, Phase>;

    fn host(connected: bool) -> Host {
        ReplicaHost::new(
            HostConfig::named("test"),
            Arc::new(TokioContext::new()),
            Loopback::new(connected),
        )
    }

    fn engine() -> (TransitionEngine<Phase>, Arc<std::sync::Mutex<Vec<String>>>) {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let engine = TransitionEngine::builder()
            .with_state(Recorder::new(Phase::Idle, &log))
            .with_state(Recorder::new(Phase::Active, &log))
            .with_state(Recorder::new(Phase::Error, &log))
            .build()
            .unwrap();
        (engine, log)
    }

    fn commands() -> CommandRegistry<Phase> {
        CommandRegistry::builder()
            .command(Phase::Active, "mark", |recorder: &mut Recorder, _: &[Value]| {
                recorder.log.lock().unwrap().push("mark".into());
                Ok(())
            })
            .command(Phase::Error, "explode", |_: &mut Recorder, _: &[Value]| {
                Err(CommandFailure::new("boom"))
            })
            .build()
            .unwrap()
    }

    /// Pumps the host until its inbox stays empty.
    async fn settle(host: &Host) {
        for _ in 0..8 {
            host.pump().await;
            tokio::task::yield_now().await;
        }
    }

    /// Runs a transition to completion on the calling task.
    async fn drive(machine: &NetworkedStateMachine<TokioContext, Loopback, Phase>) {
        if let crate::engine::Tick::Transition { run, .. } = machine.engine().tick() {
            run.await;
        }
    }

    #[tokio::test]
    async fn test_offline_attach_resolves_locally() {
        let host = host(false);
        let (engine, _) = engine();
        let machine = host
            .attach("Level/Door", OwnershipPolicy::Takeover, engine, commands())
            .await
            .unwrap();

        assert_eq!(machine.view_id(), ViewId(1));
        assert!(machine.is_mine());
        assert_eq!(host.view(ViewId(1)).unwrap().identity, Some(EntityIdentity::from_path("Level/Door")));
    }

    #[tokio::test]
    async fn test_connected_demand_round_trips_through_transport() {
        let host = host(true);
        let identity = EntityIdentity::from_path("Level/Lamp");

        let (resolution, _) = tokio::join!(host.demand(identity, OwnershipPolicy::Fixed), settle(&host));

        let resolution = resolution.unwrap();
        assert_eq!(resolution.view, ViewId(1));
        assert_eq!(resolution.owner, host.local_id());
        assert_eq!(host.views().lock().len(), 1);
    }

    #[tokio::test]
    async fn test_controller_queue_applies_on_loopback() {
        let host = host(false);
        let (engine, log) = engine();
        let machine = host
            .attach("Level/Door", OwnershipPolicy::Takeover, engine, commands())
            .await
            .unwrap();
        host.network().connected.store(true, Ordering::SeqCst);

        machine.queue_new_state(Phase::Active, true).await.unwrap();
        assert!(machine.engine().pending().is_empty());

        settle(&host).await;
        assert_eq!(machine.engine().pending(), vec![Phase::Active]);
        drive(&machine).await;
        assert_eq!(machine.current_state(), Some(Phase::Active));
        assert_eq!(*log.lock().unwrap(), vec!["enter Active".to_string()]);
    }

    #[tokio::test]
    async fn test_offline_invoke_dispatches_locally() {
        let host = host(false);
        let (engine, log) = engine();
        let machine = host
            .attach("Level/Door", OwnershipPolicy::Takeover, engine, commands())
            .await
            .unwrap();
        machine.queue_new_state(Phase::Active, false).await.unwrap();
        drive(&machine).await;

        let outcome = machine.invoke("mark", Target::All, vec![]).await.unwrap();
        assert_eq!(outcome, InvokeOutcome::Local(crate::dispatch::DispatchOutcome::Invoked));
        assert!(log.lock().unwrap().contains(&"mark".to_string()));

        let skipped = machine.invoke("explode", Target::All, vec![]).await.unwrap();
        assert_eq!(skipped, InvokeOutcome::Local(crate::dispatch::DispatchOutcome::SkippedDivergent));

        assert!(matches!(
            machine.invoke("missing", Target::All, vec![]).await,
            Err(HostError::Dispatch(DispatchError::UnknownCommand(_)))
        ));
    }

    #[tokio::test]
    async fn test_fixed_view_refuses_ownership_changes() {
        let host = host(true);
        let identity = EntityIdentity::from_path("Level/Statue");
        let (resolution, _) = tokio::join!(host.demand(identity, OwnershipPolicy::Fixed), settle(&host));
        let view = resolution.unwrap().view;

        let requested = host.request_ownership(view, PeerId::from_seed(9)).await;
        assert!(matches!(
            requested,
            Err(HostError::Ownership(OwnershipError::FixedPolicy { .. }))
        ));
        assert!(host.transfer_ownership(view, PeerId::from_seed(9)).await.is_err());
        assert_eq!(host.view(view).unwrap().owner, Some(host.local_id()));
    }

    #[tokio::test]
    async fn test_state_messages_before_attach_are_replayed() {
        let host = host(true);
        let early = WireMessage::QueueState {
            view: ViewId(1),
            state: 1,
            save_previous: false,
        };
        host.handle_envelope(host.local_id(), early.encode(0).unwrap()).await;

        let (engine, _) = engine();
        let (machine, _) = tokio::join!(
            host.attach("Level/Door", OwnershipPolicy::Takeover, engine, commands()),
            settle(&host)
        );
        let machine = machine.unwrap();
        assert_eq!(machine.engine().pending(), vec![Phase::Active]);
    }

    #[tokio::test]
    async fn test_despawn_forgets_view() {
        let host = host(false);
        let (engine, _) = engine();
        let machine = host
            .attach("Level/Door", OwnershipPolicy::Takeover, engine, commands())
            .await
            .unwrap();

        assert!(host.despawn(machine.view_id()));
        assert!(host.machine(machine.view_id()).is_none());
        assert!(host.view(machine.view_id()).is_none());
        assert!(!host.despawn(machine.view_id()));
    }

    #[tokio::test]
    async fn test_command_behind_transition_does_not_stall_other_views() {
        let host = host(false);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let gate = Arc::new(tokio::sync::Notify::new());
        let mut active = Recorder::new(Phase::Active, &log);
        active.gate = Some(Arc::clone(&gate));
        let gated = TransitionEngine::builder()
            .with_state(Recorder::new(Phase::Idle, &log))
            .with_state(active)
            .with_state(Recorder::new(Phase::Error, &log))
            .build()
            .unwrap();
        let slow = host
            .attach("Level/Gate", OwnershipPolicy::Takeover, gated, commands())
            .await
            .unwrap();
        let (engine, _) = engine();
        let other = host
            .attach("Level/Lamp", OwnershipPolicy::Takeover, engine, commands())
            .await
            .unwrap();

        slow.queue_new_state(Phase::Active, false).await.unwrap();
        let crate::engine::Tick::Transition { run, .. } = slow.engine().tick() else {
            panic!("expected a transition");
        };
        let in_flight = tokio::spawn(run);
        tokio::task::yield_now().await;

        host.network().connected.store(true, Ordering::SeqCst);
        let mark = WireMessage::Command {
            view: slow.view_id(),
            index: slow.commands().resolve("mark").unwrap(),
            args: Vec::new(),
        };
        let queue = WireMessage::QueueState {
            view: other.view_id(),
            state: 1,
            save_previous: false,
        };
        host.network().push(mark.encode(0).unwrap()).unwrap();
        host.network().push(queue.encode(0).unwrap()).unwrap();

        let handled = tokio::time::timeout(std::time::Duration::from_millis(300), host.pump()).await;
        assert_eq!(handled.ok(), Some(2));
        assert_eq!(other.engine().pending(), vec![Phase::Active]);
        assert_eq!(slow.deferred_commands(), 1);
        assert!(matches!(slow.tick(), TickStatus::Busy));

        gate.notify_one();
        in_flight.await.unwrap();
        assert!(matches!(slow.tick(), TickStatus::Updated(Phase::Active)));
        assert_eq!(slow.deferred_commands(), 0);
        assert!(log.lock().unwrap().contains(&"mark".to_string()));
    }

    #[tokio::test]
    async fn test_garbage_envelope_is_dropped() {
        let host = host(true);
        host.handle_envelope(host.local_id(), Envelope::new(vec![0xff], 0)).await;
        assert!(host.views().lock().is_empty());
    }
}
