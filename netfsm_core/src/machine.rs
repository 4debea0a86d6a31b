//! NetworkedStateMachine - one entity's engine bound to its View.
//!
//! State changes issued on the controlling peer are broadcast and applied
//! by every peer (the sender included) when the broadcast arrives. Off-line,
//! or on a peer that does not control the View, they apply to the local
//! engine only.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use netfsm_env::{BroadcastScope, NetworkTransport, PeerContext, Target};
use serde_json::Value;
use tracing::{debug, warn};

use crate::dispatch::{CommandRegistry, DispatchOutcome};
use crate::engine::{Tick, TransitionEngine};
use crate::host::HostError;
use crate::identity::EntityIdentity;
use crate::state::{decode_state, encode_state, SpatialEvent, StateKey};
use crate::view::{SharedViews, View, ViewId};
use crate::wire::WireMessage;

/// Inbound commands held per machine while a transition owns the behaviours.
const DEFERRED_COMMANDS: usize = 64;

type Deferred = Arc<Mutex<VecDeque<(u8, Vec<Value>)>>>;

/// What one tick did to a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus<S> {
    Busy,
    Idle,
    Updated(S),
    /// A transition towards this state was started in the background.
    Started(S),
}

/// How a command invocation was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeOutcome {
    /// Broadcast to the target; `peers` is the transport's fan-out.
    Sent { peers: usize },
    /// Off-line: dispatched against the local engine.
    Local(DispatchOutcome),
}

pub struct NetworkedStateMachine<Ctx, Net, S: StateKey> {
    view: ViewId,
    identity: EntityIdentity,
    context: Arc<Ctx>,
    network: Arc<Net>,
    views: SharedViews,
    engine: TransitionEngine<S>,
    commands: Arc<CommandRegistry<S>>,
    deferred: Deferred,
    buffered: bool,
}

impl<Ctx, Net, S: StateKey> Clone for NetworkedStateMachine<Ctx, Net, S> {
    fn clone(&self) -> Self {
        Self {
            view: self.view,
            identity: self.identity,
            context: Arc::clone(&self.context),
            network: Arc::clone(&self.network),
            views: self.views.clone(),
            engine: self.engine.clone(),
            commands: Arc::clone(&self.commands),
            deferred: Arc::clone(&self.deferred),
            buffered: self.buffered,
        }
    }
}

impl<Ctx, Net, S> NetworkedStateMachine<Ctx, Net, S>
where
    Ctx: PeerContext,
    Net: NetworkTransport,
    S: StateKey,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        view: ViewId,
        identity: EntityIdentity,
        context: Arc<Ctx>,
        network: Arc<Net>,
        views: SharedViews,
        engine: TransitionEngine<S>,
        commands: Arc<CommandRegistry<S>>,
        buffered: bool,
    ) -> Self {
        Self {
            view,
            identity,
            context,
            network,
            views,
            engine,
            commands,
            deferred: Arc::default(),
            buffered,
        }
    }

    pub fn view_id(&self) -> ViewId {
        self.view
    }

    pub fn identity(&self) -> EntityIdentity {
        self.identity
    }

    pub fn engine(&self) -> &TransitionEngine<S> {
        &self.engine
    }

    pub fn commands(&self) -> &CommandRegistry<S> {
        &self.commands
    }

    /// Snapshot of the bound View.
    pub fn view(&self) -> Option<View> {
        self.views.get(self.view)
    }

    /// Whether the local peer currently controls this entity.
    pub fn is_mine(&self) -> bool {
        let local = self.network.local_id();
        self.views
            .get(self.view)
            .is_some_and(|view| view.is_controlled_by(local))
    }

    pub fn current_state(&self) -> Option<S> {
        self.engine.current_state()
    }

    /// Received commands still waiting for a transition to finish.
    pub fn deferred_commands(&self) -> usize {
        self.deferred().len()
    }

    fn deferred(&self) -> MutexGuard<'_, VecDeque<(u8, Vec<Value>)>> {
        self.deferred.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stamp(&self) -> u64 {
        self.context.now().as_millis() as u64
    }

    fn state_scope(&self) -> BroadcastScope {
        if self.buffered {
            BroadcastScope::AllBuffered
        } else {
            BroadcastScope::All
        }
    }

    /// Queues `state` on every peer if this peer controls the entity,
    /// otherwise on the local engine only.
    ///
    /// A state whose ordinal does not fit in a byte is rejected before
    /// anything is queued or sent.
    pub async fn queue_new_state(&self, state: S, save_previous: bool) -> Result<(), HostError> {
        let byte = encode_state(state).inspect_err(|err| {
            warn!(view = %self.view, error = %err, "refusing to queue state");
        })?;

        if self.network.is_connected() && self.is_mine() {
            let envelope = WireMessage::QueueState {
                view: self.view,
                state: byte,
                save_previous,
            }
            .encode(self.stamp())?;
            self.network.broadcast(self.state_scope(), envelope).await?;
            return Ok(());
        }

        if self.network.is_connected() {
            debug!(view = %self.view, state = ?state, "not the controller, queueing locally");
        }
        self.engine.enqueue(state, save_previous);
        Ok(())
    }

    /// Forces `state` on every peer if this peer controls the entity,
    /// otherwise on the local engine only (waiting for any in-flight
    /// transition to finish).
    pub async fn force_change_state(&self, state: S) -> Result<(), HostError> {
        let byte = encode_state(state).inspect_err(|err| {
            warn!(view = %self.view, error = %err, "refusing to force state");
        })?;

        if self.network.is_connected() && self.is_mine() {
            let envelope = WireMessage::ForceState {
                view: self.view,
                state: byte,
            }
            .encode(self.stamp())?;
            self.network.broadcast(self.state_scope(), envelope).await?;
            return Ok(());
        }

        if self.network.is_connected() {
            debug!(view = %self.view, state = ?state, "not the controller, forcing locally");
        }
        self.engine.force(state).await;
        Ok(())
    }

    /// Invokes the command registered as `name`.
    ///
    /// Connected: sends its index to `target`; receivers run it only if
    /// their active state owns the command. Off-line: runs it against the
    /// local engine under the same rule.
    pub async fn invoke(
        &self,
        name: &str,
        target: Target,
        args: Vec<Value>,
    ) -> Result<InvokeOutcome, HostError> {
        let index = self.commands.resolve(name).inspect_err(|err| {
            warn!(view = %self.view, error = %err, "command skipped");
        })?;

        if self.network.is_connected() {
            let envelope = WireMessage::Command {
                view: self.view,
                index,
                args,
            }
            .encode(self.stamp())?;
            let peers = self.network.deliver(target, envelope).await?;
            return Ok(InvokeOutcome::Sent { peers });
        }

        let outcome = self
            .commands
            .dispatch(&self.engine, index, &args)
            .await
            .inspect_err(|err| warn!(view = %self.view, error = %err, "command failed"))?;
        Ok(InvokeOutcome::Local(outcome))
    }

    /// Advances the engine; a started transition runs as a background task.
    ///
    /// Deferred commands run first, against the state they would have seen
    /// on arrival, so no new transition starts while any are left.
    pub fn tick(&self) -> TickStatus<S> {
        if !self.run_deferred() {
            return TickStatus::Busy;
        }
        match self.engine.tick() {
            Tick::Busy => TickStatus::Busy,
            Tick::Idle => TickStatus::Idle,
            Tick::Updated(state) => TickStatus::Updated(state),
            Tick::Transition { next, run } => {
                self.context.spawn("transition", async move {
                    run.await;
                });
                TickStatus::Started(next)
            }
        }
    }

    pub fn on_spatial_event(&self, event: &SpatialEvent) -> bool {
        self.engine.on_spatial_event(event)
    }

    pub fn peek_previous_state(&self) -> Option<S> {
        self.engine.peek_previous_state()
    }

    pub fn pop_previous_state(&self) -> Option<S> {
        self.engine.pop_previous_state()
    }

    pub fn clear_history(&self) {
        self.engine.clear_history();
    }

    /// Runs deferred commands in arrival order. False while a transition
    /// still holds the behaviours.
    fn run_deferred(&self) -> bool {
        let mut deferred = self.deferred();
        while let Some((index, args)) = deferred.front() {
            let index = *index;
            match self.commands.try_dispatch(&self.engine, index, args) {
                Ok(None) => return false,
                Ok(Some(outcome)) => debug!(view = %self.view, index, ?outcome, "deferred command dispatched"),
                Err(err) => warn!(view = %self.view, error = %err, "deferred command failed"),
            }
            deferred.pop_front();
        }
        true
    }

    /// Applies a state or command message that arrived for this View.
    ///
    /// Never waits: a command that meets a running transition is deferred
    /// to a later tick. Failures are logged and never propagate into the
    /// receive loop.
    pub(crate) fn receive(&self, message: WireMessage) {
        match message {
            WireMessage::QueueState { state, save_previous, .. } => match decode_state::<S>(state) {
                Ok(state) => self.engine.enqueue(state, save_previous),
                Err(err) => warn!(view = %self.view, error = %err, "dropping queued state"),
            },
            WireMessage::ForceState { state, .. } => match decode_state::<S>(state) {
                Ok(state) => self.context.spawn("force", self.engine.force(state)),
                Err(err) => warn!(view = %self.view, error = %err, "dropping forced state"),
            },
            WireMessage::Command { index, args, .. } => {
                let mut deferred = self.deferred();
                if deferred.is_empty() {
                    match self.commands.try_dispatch(&self.engine, index, &args) {
                        Ok(Some(outcome)) => {
                            debug!(view = %self.view, index, ?outcome, "command dispatched");
                            return;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(view = %self.view, error = %err, "command failed");
                            return;
                        }
                    }
                }
                if deferred.len() == DEFERRED_COMMANDS {
                    warn!(view = %self.view, "deferred command backlog full, dropping oldest");
                    deferred.pop_front();
                }
                deferred.push_back((index, args));
                debug!(view = %self.view, index, "command deferred behind running transition");
            }
            other => debug!(view = %self.view, kind = other.kind(), "not a machine message"),
        }
    }
}
