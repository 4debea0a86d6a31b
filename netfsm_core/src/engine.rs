//! The local transition engine.
//!
//! Each entity owns one engine: the behaviours bound to every state key, a
//! FIFO of pending keys, a history stack and the currently active key.
//!
//! # Single flight
//!
//! ```text
//!  tick() ──► queue non-empty? ──► in_transition = true
//!                                      │
//!                          exit(current).await
//!                          current = next
//!                          enter(next).await
//!                                      │
//!                         in_transition = false ──► idle.notify_waiters()
//!                                                  └► changed(previous, next)
//! ```
//!
//! While a transition is in flight (or a force is waiting for one to
//! finish) `tick()` does nothing. A transition, once started, runs to
//! completion; `force()` only decides what the queue holds afterwards.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{Notify, TryLockError};
use tracing::{debug, error};

use crate::observer::{Observers, SubscriptionId};
use crate::state::{SpatialEvent, StateBehavior, StateKey};

/// Configuration errors detected when an engine is built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("state {0} is bound to more than one behaviour")]
    DuplicateBinding(String),

    #[error("state {0} has no behaviour bound")]
    MissingBinding(String),
}

/// Notification emitted after every completed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChanged<S> {
    pub previous: S,
    pub next: S,
}

/// A started transition. Must be driven to completion.
pub type TransitionFuture<S> = Pin<Box<dyn Future<Output = StateChanged<S>> + Send>>;

/// What a single `tick()` did.
pub enum Tick<S: StateKey> {
    /// A transition or a force is in flight.
    Busy,
    /// Nothing queued and no active state.
    Idle,
    /// The active state's `update_state` ran.
    Updated(S),
    /// A transition towards `next` was started.
    Transition { next: S, run: TransitionFuture<S> },
}

type Behaviors<S> = HashMap<S, Box<dyn StateBehavior<S>>>;

struct Bookkeeping<S> {
    queue: VecDeque<S>,
    history: Vec<S>,
    last_enqueued: Option<S>,
    current: Option<S>,
    in_transition: bool,
    forcing: usize,
    /// Bumped by every `force`; only the latest force may replace the queue.
    force_generation: u64,
}

impl<S: StateKey> Bookkeeping<S> {
    /// Clears the queue and enqueues exactly `state`, saving the previously
    /// enqueued key like a default `enqueue` does.
    fn replace_queue(&mut self, state: S) {
        if let Some(previous) = self.last_enqueued {
            self.history.push(previous);
        }
        self.queue.clear();
        self.queue.push_back(state);
        self.last_enqueued = Some(state);
    }
}

struct EngineShared<S: StateKey> {
    book: Mutex<Bookkeeping<S>>,
    behaviors: tokio::sync::Mutex<Behaviors<S>>,
    idle: Notify,
    changed: Observers<StateChanged<S>>,
}

impl<S: StateKey> EngineShared<S> {
    fn book(&self) -> MutexGuard<'_, Bookkeeping<S>> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps the forcing count raised until the pending force is applied or
/// dropped.
struct ForcingGuard<S: StateKey> {
    shared: Arc<EngineShared<S>>,
}

impl<S: StateKey> Drop for ForcingGuard<S> {
    fn drop(&mut self) {
        let mut book = self.shared.book();
        book.forcing = book.forcing.saturating_sub(1);
    }
}

/// Holds `in_transition` for one started transition. Released when the
/// transition completes or its future is dropped unfinished.
struct TransitionGuard<S: StateKey> {
    shared: Arc<EngineShared<S>>,
}

impl<S: StateKey> Drop for TransitionGuard<S> {
    fn drop(&mut self) {
        self.shared.book().in_transition = false;
        self.shared.idle.notify_waiters();
    }
}

/// Collects behaviours and validates that every key is bound exactly once.
pub struct EngineBuilder<S: StateKey> {
    states: Vec<Box<dyn StateBehavior<S>>>,
}

impl<S: StateKey> EngineBuilder<S> {
    pub fn new() -> Self {
        Self { states: Vec::new() }
    }

    pub fn with_state<B: StateBehavior<S>>(mut self, behavior: B) -> Self {
        self.states.push(Box::new(behavior));
        self
    }

    /// Builds the engine.
    ///
    /// Every variant of `S` must be bound exactly once, so a key accepted
    /// into the queue can always be resolved at transition time.
    pub fn build(self) -> Result<TransitionEngine<S>, EngineError> {
        let mut behaviors: Behaviors<S> = HashMap::with_capacity(self.states.len());
        for behavior in self.states {
            let key = behavior.key();
            if behaviors.insert(key, behavior).is_some() {
                return Err(EngineError::DuplicateBinding(format!("{:?}", key)));
            }
        }

        if let Some(missing) = S::variants().into_iter().find(|key| !behaviors.contains_key(key)) {
            return Err(EngineError::MissingBinding(format!("{:?}", missing)));
        }

        Ok(TransitionEngine {
            shared: Arc::new(EngineShared {
                book: Mutex::new(Bookkeeping {
                    queue: VecDeque::new(),
                    history: Vec::new(),
                    last_enqueued: None,
                    current: None,
                    in_transition: false,
                    forcing: 0,
                    force_generation: 0,
                }),
                behaviors: tokio::sync::Mutex::new(behaviors),
                idle: Notify::new(),
                changed: Observers::new(),
            }),
        })
    }
}

impl<S: StateKey> Default for EngineBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one entity's transition engine. Clones share the engine.
pub struct TransitionEngine<S: StateKey> {
    shared: Arc<EngineShared<S>>,
}

impl<S: StateKey> Clone for TransitionEngine<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: StateKey> TransitionEngine<S> {
    pub fn builder() -> EngineBuilder<S> {
        EngineBuilder::new()
    }

    /// Appends `state` to the queue.
    ///
    /// With `save_previous`, the previously enqueued key is pushed onto the
    /// history stack first.
    pub fn enqueue(&self, state: S, save_previous: bool) {
        let mut book = self.shared.book();
        if save_previous {
            if let Some(previous) = book.last_enqueued {
                book.history.push(previous);
            }
        }
        book.queue.push_back(state);
        book.last_enqueued = Some(state);
    }

    /// Replaces the queue with exactly `[state]`.
    ///
    /// Applied immediately when no transition is in flight. Otherwise the
    /// engine stops starting transitions, and the returned future applies
    /// the replacement as soon as the in-flight transition completes.
    /// Enqueues issued in between are discarded by the replacement, and a
    /// later force supersedes a waiting one.
    pub fn force(&self, state: S) -> impl Future<Output = ()> + Send + 'static {
        let shared = Arc::clone(&self.shared);
        let (generation, guard) = {
            let mut book = shared.book();
            book.force_generation += 1;
            let generation = book.force_generation;
            if book.in_transition {
                book.forcing += 1;
                let guard = ForcingGuard {
                    shared: Arc::clone(&shared),
                };
                (generation, Some(guard))
            } else {
                book.replace_queue(state);
                (generation, None)
            }
        };

        async move {
            let Some(_guard) = guard else {
                return;
            };
            loop {
                let idle = shared.idle.notified();
                {
                    let mut book = shared.book();
                    if book.force_generation != generation {
                        debug!(state = ?state, "force superseded by a later force");
                        return;
                    }
                    if !book.in_transition {
                        book.replace_queue(state);
                        debug!(state = ?state, "force applied after in-flight transition");
                        return;
                    }
                }
                idle.await;
            }
        }
    }

    /// Advances the engine by one scheduling step.
    ///
    /// A returned [`Tick::Transition`] should be awaited (or spawned); the
    /// engine stays busy until it finishes or is dropped.
    pub fn tick(&self) -> Tick<S> {
        let next = {
            let mut book = self.shared.book();
            if book.in_transition || book.forcing > 0 {
                return Tick::Busy;
            }
            match book.queue.pop_front() {
                Some(next) => {
                    book.in_transition = true;
                    next
                }
                None => {
                    drop(book);
                    return self.update();
                }
            }
        };

        let guard = TransitionGuard {
            shared: Arc::clone(&self.shared),
        };
        Tick::Transition {
            next,
            run: Box::pin(run_transition(guard, next)),
        }
    }

    fn update(&self) -> Tick<S> {
        let Some(current) = self.current_state() else {
            return Tick::Idle;
        };
        match self.shared.behaviors.try_lock() {
            Ok(mut behaviors) => {
                if let Some(behavior) = behaviors.get_mut(&current) {
                    behavior.update_state();
                }
                Tick::Updated(current)
            }
            Err(_) => Tick::Busy,
        }
    }

    /// Routes a spatial event to the active behaviour.
    ///
    /// Returns false when there is no active state or a transition holds
    /// the behaviours.
    pub fn on_spatial_event(&self, event: &SpatialEvent) -> bool {
        let Some(current) = self.current_state() else {
            return false;
        };
        let Ok(mut behaviors) = self.shared.behaviors.try_lock() else {
            return false;
        };
        match behaviors.get_mut(&current) {
            Some(behavior) => {
                behavior.on_spatial_event(event);
                true
            }
            None => false,
        }
    }

    /// Runs `f` against the active behaviour, waiting for any in-flight
    /// transition to release it first.
    pub async fn with_active<R>(
        &self,
        f: impl FnOnce(S, &mut dyn StateBehavior<S>) -> R,
    ) -> Option<R> {
        let mut behaviors = self.shared.behaviors.lock().await;
        let current = self.current_state()?;
        let behavior = behaviors.get_mut(&current)?;
        Some(f(current, behavior.as_mut()))
    }

    /// Like [`with_active`](Self::with_active), but fails instead of
    /// waiting while a transition holds the behaviours.
    pub fn try_with_active<R>(
        &self,
        f: impl FnOnce(S, &mut dyn StateBehavior<S>) -> R,
    ) -> Result<Option<R>, TryLockError> {
        let mut behaviors = self.shared.behaviors.try_lock()?;
        let Some(current) = self.current_state() else {
            return Ok(None);
        };
        Ok(behaviors
            .get_mut(&current)
            .map(|behavior| f(current, behavior.as_mut())))
    }

    pub fn pop_previous_state(&self) -> Option<S> {
        self.shared.book().history.pop()
    }

    pub fn peek_previous_state(&self) -> Option<S> {
        self.shared.book().history.last().copied()
    }

    pub fn clear_history(&self) {
        self.shared.book().history.clear();
    }

    pub fn current_state(&self) -> Option<S> {
        self.shared.book().current
    }

    pub fn is_in_transition(&self) -> bool {
        self.shared.book().in_transition
    }

    pub fn is_forcing(&self) -> bool {
        self.shared.book().forcing > 0
    }

    /// Snapshot of the pending queue, front first.
    pub fn pending(&self) -> Vec<S> {
        self.shared.book().queue.iter().copied().collect()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StateChanged<S>) + Send + Sync + 'static,
    {
        self.shared.changed.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.changed.unsubscribe(id)
    }
}

async fn run_transition<S: StateKey>(guard: TransitionGuard<S>, next: S) -> StateChanged<S> {
    let shared = Arc::clone(&guard.shared);
    let mut behaviors = shared.behaviors.lock().await;
    let previous = shared.book().current;

    if let Some(previous) = previous {
        if let Some(behavior) = behaviors.get_mut(&previous) {
            behavior.exit_state().await;
        }
    }

    shared.book().current = Some(next);
    match behaviors.get_mut(&next) {
        Some(behavior) => behavior.enter_state().await,
        None => error!(state = ?next, "no behaviour bound for entered state"),
    }
    drop(behaviors);
    drop(guard);

    let change = StateChanged {
        previous: previous.unwrap_or_default(),
        next,
    };
    debug!(previous = ?change.previous, next = ?change.next, "state changed");
    shared.changed.notify(&change);
    change
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::identity::EntityIdentity;
    use crate::state::tests::Phase;
    use crate::state::SpatialEventKind;
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records lifecycle calls into a shared log; can hold `enter` open
    /// until a gate is released.
    pub struct Recorder {
        pub key: Phase,
        pub log: Arc<Mutex<Vec<String>>>,
        pub gate: Option<Arc<Notify>>,
        pub active: Arc<AtomicUsize>,
        pub max_active: Arc<AtomicUsize>,
    }

    impl Recorder {
        pub fn new(key: Phase, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                key,
                log: Arc::clone(log),
                gate: None,
                active: Arc::new(AtomicUsize::new(0)),
                max_active: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn push(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl StateBehavior<Phase> for Recorder {
        fn key(&self) -> Phase {
            self.key
        }

        async fn enter_state(&mut self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            tokio::task::yield_now().await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.push(format!("enter {:?}", self.key));
        }

        async fn exit_state(&mut self) {
            tokio::task::yield_now().await;
            self.push(format!("exit {:?}", self.key));
        }

        fn update_state(&mut self) {
            self.push(format!("update {:?}", self.key));
        }

        fn on_spatial_event(&mut self, event: &SpatialEvent) {
            self.push(format!("spatial {:?} {:?}", self.key, event.kind));
        }
    }

    fn engine_with_log() -> (TransitionEngine<Phase>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = TransitionEngine::builder()
            .with_state(Recorder::new(Phase::Idle, &log))
            .with_state(Recorder::new(Phase::Active, &log))
            .with_state(Recorder::new(Phase::Error, &log))
            .build()
            .unwrap();
        (engine, log)
    }

    async fn run_tick(engine: &TransitionEngine<Phase>) -> Option<StateChanged<Phase>> {
        match engine.tick() {
            Tick::Transition { run, .. } => Some(run.await),
            _ => None,
        }
    }

    #[test]
    fn test_missing_binding_rejected_at_build() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = TransitionEngine::builder()
            .with_state(Recorder::new(Phase::Idle, &log))
            .with_state(Recorder::new(Phase::Active, &log))
            .build();
        assert_eq!(result.err(), Some(EngineError::MissingBinding("Error".into())));
    }

    #[test]
    fn test_duplicate_binding_rejected_at_build() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let result = TransitionEngine::builder()
            .with_state(Recorder::new(Phase::Idle, &log))
            .with_state(Recorder::new(Phase::Idle, &log))
            .build();
        assert_eq!(result.err(), Some(EngineError::DuplicateBinding("Idle".into())));
    }

    #[tokio::test]
    async fn test_first_transition_reports_default_previous() {
        let (engine, log) = engine_with_log();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            engine.subscribe(move |change| seen.lock().unwrap().push(*change));
        }

        assert!(matches!(engine.tick(), Tick::Idle));
        engine.enqueue(Phase::Idle, true);
        let change = run_tick(&engine).await.unwrap();

        assert_eq!(change, StateChanged { previous: Phase::Idle, next: Phase::Idle });
        assert_eq!(engine.current_state(), Some(Phase::Idle));
        assert_eq!(*seen.lock().unwrap(), vec![change]);
        assert_eq!(*log.lock().unwrap(), vec!["enter Idle".to_string()]);
    }

    #[tokio::test]
    async fn test_exit_runs_before_enter_and_update_when_queue_empty() {
        let (engine, log) = engine_with_log();
        engine.enqueue(Phase::Idle, true);
        engine.enqueue(Phase::Active, true);
        run_tick(&engine).await;
        run_tick(&engine).await;

        assert!(matches!(engine.tick(), Tick::Updated(Phase::Active)));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter Idle", "exit Idle", "enter Active", "update Active"]
        );
    }

    #[test]
    fn test_history_tracks_previously_enqueued() {
        let (engine, _) = engine_with_log();
        engine.enqueue(Phase::Idle, true);
        engine.enqueue(Phase::Active, true);
        assert_eq!(engine.peek_previous_state(), Some(Phase::Idle));

        engine.enqueue(Phase::Error, false);
        assert_eq!(engine.peek_previous_state(), Some(Phase::Idle));

        assert_eq!(engine.pop_previous_state(), Some(Phase::Idle));
        assert_eq!(engine.pop_previous_state(), None);

        engine.enqueue(Phase::Idle, true);
        engine.clear_history();
        assert_eq!(engine.peek_previous_state(), None);
    }

    #[tokio::test]
    async fn test_force_when_idle_replaces_queue_immediately() {
        let (engine, _) = engine_with_log();
        engine.enqueue(Phase::Idle, true);
        engine.enqueue(Phase::Active, true);

        let pending = engine.force(Phase::Error);
        assert_eq!(engine.pending(), vec![Phase::Error]);
        assert!(!engine.is_forcing());
        pending.await;
    }

    #[tokio::test]
    async fn test_force_during_transition_waits_for_enter() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());
        let mut active = Recorder::new(Phase::Active, &log);
        active.gate = Some(Arc::clone(&gate));
        let engine = TransitionEngine::builder()
            .with_state(Recorder::new(Phase::Idle, &log))
            .with_state(active)
            .with_state(Recorder::new(Phase::Error, &log))
            .build()
            .unwrap();

        engine.enqueue(Phase::Idle, true);
        engine.enqueue(Phase::Active, true);
        run_tick(&engine).await;

        let Tick::Transition { run, next } = engine.tick() else {
            panic!("expected a transition");
        };
        assert_eq!(next, Phase::Active);
        let in_flight = tokio::spawn(run);
        tokio::task::yield_now().await;
        assert!(engine.is_in_transition());

        let forced = tokio::spawn(engine.force(Phase::Error));
        engine.enqueue(Phase::Idle, true);
        assert!(engine.is_forcing());
        assert!(matches!(engine.tick(), Tick::Busy));

        gate.notify_one();
        let change = in_flight.await.unwrap();
        forced.await.unwrap();

        assert_eq!(change, StateChanged { previous: Phase::Idle, next: Phase::Active });
        assert_eq!(engine.pending(), vec![Phase::Error]);
        assert!(!engine.is_forcing());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter Idle", "exit Idle", "enter Active"]
        );

        let change = run_tick(&engine).await.unwrap();
        assert_eq!(change.next, Phase::Error);
    }

    #[tokio::test]
    async fn test_dropped_force_releases_engine() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());
        let mut idle = Recorder::new(Phase::Idle, &log);
        idle.gate = Some(Arc::clone(&gate));
        let engine = TransitionEngine::builder()
            .with_state(idle)
            .with_state(Recorder::new(Phase::Active, &log))
            .with_state(Recorder::new(Phase::Error, &log))
            .build()
            .unwrap();

        engine.enqueue(Phase::Idle, true);
        let Tick::Transition { run, .. } = engine.tick() else {
            panic!("expected a transition");
        };
        let in_flight = tokio::spawn(run);
        tokio::task::yield_now().await;

        drop(engine.force(Phase::Error));
        assert!(!engine.is_forcing());

        gate.notify_one();
        in_flight.await.unwrap();
        assert!(engine.pending().is_empty());
    }

    #[tokio::test]
    async fn test_spatial_event_reaches_active_state() {
        let (engine, log) = engine_with_log();
        let event = SpatialEvent {
            kind: SpatialEventKind::Enter,
            other: EntityIdentity::from_path("Level/Player"),
        };
        assert!(!engine.on_spatial_event(&event));

        engine.enqueue(Phase::Active, true);
        run_tick(&engine).await;
        assert!(engine.on_spatial_event(&event));
        assert_eq!(log.lock().unwrap().last().unwrap(), "spatial Active Enter");
    }

    fn gated_engine(gated: Phase) -> (TransitionEngine<Phase>, Arc<Notify>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Notify::new());
        let mut builder = TransitionEngine::builder();
        for key in Phase::variants() {
            let mut recorder = Recorder::new(key, &log);
            if key == gated {
                recorder.gate = Some(Arc::clone(&gate));
            }
            builder = builder.with_state(recorder);
        }
        (builder.build().unwrap(), gate)
    }

    #[tokio::test]
    async fn test_later_force_wins_over_force_still_waiting() {
        let (engine, gate) = gated_engine(Phase::Idle);
        engine.enqueue(Phase::Idle, true);
        let Tick::Transition { run, .. } = engine.tick() else {
            panic!("expected a transition");
        };
        let in_flight = tokio::spawn(run);
        tokio::task::yield_now().await;

        // Not polled yet: still waiting when the transition finishes.
        let waiting = engine.force(Phase::Active);
        gate.notify_one();
        in_flight.await.unwrap();
        assert!(!engine.is_in_transition());

        engine.force(Phase::Error).await;
        assert_eq!(engine.pending(), vec![Phase::Error]);

        waiting.await;
        assert_eq!(engine.pending(), vec![Phase::Error]);
        assert!(!engine.is_forcing());
    }

    #[tokio::test]
    async fn test_two_waiting_forces_apply_in_issue_order() {
        let (engine, gate) = gated_engine(Phase::Idle);
        engine.enqueue(Phase::Idle, true);
        let Tick::Transition { run, .. } = engine.tick() else {
            panic!("expected a transition");
        };
        let in_flight = tokio::spawn(run);
        tokio::task::yield_now().await;

        let first = tokio::spawn(engine.force(Phase::Active));
        let second = tokio::spawn(engine.force(Phase::Error));
        tokio::task::yield_now().await;

        gate.notify_one();
        in_flight.await.unwrap();
        second.await.unwrap();
        first.await.unwrap();

        assert_eq!(engine.pending(), vec![Phase::Error]);
        assert!(!engine.is_forcing());
    }

    #[tokio::test]
    async fn test_force_saves_previously_enqueued() {
        let (engine, _) = engine_with_log();
        engine.enqueue(Phase::Idle, true);
        engine.force(Phase::Error).await;

        assert_eq!(engine.pending(), vec![Phase::Error]);
        assert_eq!(engine.peek_previous_state(), Some(Phase::Idle));
    }

    #[tokio::test]
    async fn test_dropped_transition_releases_engine() {
        let (engine, _) = engine_with_log();
        engine.enqueue(Phase::Idle, true);
        let Tick::Transition { run, .. } = engine.tick() else {
            panic!("expected a transition");
        };
        assert!(engine.is_in_transition());
        drop(run);
        assert!(!engine.is_in_transition());

        engine.enqueue(Phase::Active, true);
        let change = run_tick(&engine).await.unwrap();
        assert_eq!(change.next, Phase::Active);
    }

    #[tokio::test]
    async fn test_try_with_active_fails_while_transition_holds_behaviours() {
        let (engine, gate) = gated_engine(Phase::Active);
        assert_eq!(engine.try_with_active(|state, _| state).ok(), Some(None));

        engine.enqueue(Phase::Active, true);
        let Tick::Transition { run, .. } = engine.tick() else {
            panic!("expected a transition");
        };
        let in_flight = tokio::spawn(run);
        tokio::task::yield_now().await;
        assert!(engine.try_with_active(|state, _| state).is_err());

        gate.notify_one();
        in_flight.await.unwrap();
        assert_eq!(engine.try_with_active(|state, _| state).ok(), Some(Some(Phase::Active)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(u8),
        Force(u8),
        Tick,
        Yield,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3).prop_map(Op::Enqueue),
            (0u8..3).prop_map(Op::Force),
            Just(Op::Tick),
            Just(Op::Yield),
        ]
    }

    proptest! {
        #[test]
        fn prop_at_most_one_transition_in_flight(ops in proptest::collection::vec(op(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let max_active = runtime.block_on(async move {
                let log = Arc::new(Mutex::new(Vec::new()));
                let active = Arc::new(AtomicUsize::new(0));
                let max_active = Arc::new(AtomicUsize::new(0));
                let mut builder = TransitionEngine::builder();
                for key in Phase::variants() {
                    let mut recorder = Recorder::new(key, &log);
                    recorder.active = Arc::clone(&active);
                    recorder.max_active = Arc::clone(&max_active);
                    builder = builder.with_state(recorder);
                }
                let engine = builder.build().unwrap();
                let mut tasks = Vec::new();

                for op in ops {
                    match op {
                        Op::Enqueue(raw) => engine.enqueue(Phase::from_ordinal(raw as usize).unwrap(), true),
                        Op::Force(raw) => tasks.push(tokio::spawn(engine.force(Phase::from_ordinal(raw as usize).unwrap()))),
                        Op::Tick => {
                            if let Tick::Transition { run, .. } = engine.tick() {
                                tasks.push(tokio::spawn(async move { run.await; }));
                            }
                        }
                        Op::Yield => tokio::task::yield_now().await,
                    }
                }
                for task in tasks {
                    task.await.unwrap();
                }
                max_active.load(Ordering::SeqCst)
            });
            prop_assert!(max_active <= 1);
        }
    }
}
