//! Scenario runner - executes multi-peer protocol scenarios.

use crate::demo::{sentry, Journal, Mode};
use crate::scenarios::ScenarioId;
use crate::world::{RoutingStats, SimConfig, SimError, SimMachine, SimWorld};

use netfsm_core::{
    HostError, Negotiation, OwnershipError, OwnershipEvent, OwnershipPolicy, ViewId,
};
use netfsm_env::{PeerId, Target};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Ticks given to every peer to finish queued transitions.
const SETTLE_TICKS: u64 = 12;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Messages taken off the router queue
    pub messages_routed: u64,

    /// Deliveries that reached an inbox
    pub messages_delivered: u64,

    /// Deliveries dropped (departed or disconnected recipient)
    pub messages_dropped: u64,

    /// Buffered messages replayed to late joiners
    pub messages_replayed: u64,

    /// Ownership events raised across all peers
    pub ownership_events: u64,
}

impl ScenarioMetrics {
    fn collect(stats: RoutingStats, ownership_events: u64) -> Self {
        Self {
            messages_routed: stats.routed,
            messages_delivered: stats.delivered,
            messages_dropped: stats.dropped,
            messages_replayed: stats.replayed,
            ownership_events,
        }
    }
}

#[derive(Debug, Error)]
pub enum ScenarioFailure {
    #[error("{0}")]
    Check(String),

    #[error(transparent)]
    Sim(#[from] SimError),

    #[error(transparent)]
    Host(#[from] HostError),
}

fn ensure(condition: bool, message: impl Into<String>) -> Result<(), ScenarioFailure> {
    if condition {
        Ok(())
    } else {
        Err(ScenarioFailure::Check(message.into()))
    }
}

/// One journal per peer, so behaviours on different peers log separately.
#[derive(Default)]
struct Journals(Mutex<HashMap<PeerId, Journal>>);

impl Journals {
    fn of(&self, peer: PeerId) -> Journal {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(peer)
            .or_default()
            .clone()
    }
}

/// Ownership events seen per peer.
#[derive(Default, Clone)]
struct EventLog(Arc<Mutex<Vec<(PeerId, OwnershipEvent)>>>);

impl EventLog {
    fn record(&self, world: &SimWorld<Mode>, peers: &[PeerId]) -> Result<(), SimError> {
        for &peer in peers {
            let log = self.clone();
            world.host(peer)?.subscribe_ownership(move |event| {
                log.0
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push((peer, *event));
            });
        }
        Ok(())
    }

    fn count(&self, peer: PeerId, matches: impl Fn(&OwnershipEvent) -> bool) -> usize {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(seen_by, event)| *seen_by == peer && matches(event))
            .count()
    }
}

/// Runs protocol scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of peers
    num_peers: usize,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Tick budget per scenario
    max_ticks: u64,
}

impl ScenarioRunner {
    pub fn new(seed: u64, num_peers: usize) -> Self {
        Self {
            seed,
            num_peers,
            tick_rate_hz: 30,
            max_ticks: 300,
        }
    }

    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz;
        self
    }

    pub fn with_max_ticks(mut self, ticks: u64) -> Self {
        self.max_ticks = ticks;
        self
    }

    /// Runs a scenario on a fresh single-threaded runtime.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(self.run_async(scenario)),
            Err(err) => ScenarioResult {
                scenario,
                seed: self.seed,
                passed: false,
                total_ticks: 0,
                final_time_secs: 0.0,
                failure_reason: Some(format!("runtime: {}", err)),
                metrics: ScenarioMetrics::default(),
            },
        }
    }

    /// Runs a scenario on the caller's runtime.
    pub async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        let world = SimWorld::<Mode>::new(SimConfig {
            seed: self.seed,
            num_peers: self.num_peers.max(scenario.min_peers()),
            tick_rate_hz: self.tick_rate_hz,
            max_ticks: self.max_ticks,
            demand_timeout: Duration::from_secs(2),
        });

        let outcome = match scenario {
            ScenarioId::TakeoverRace => self.run_takeover_race(&world).await,
            ScenarioId::ConsentHandoff => self.run_consent_handoff(&world).await,
            ScenarioId::LateJoin => self.run_late_join(&world).await,
            ScenarioId::ConcurrentDemand => self.run_concurrent_demand(&world).await,
            ScenarioId::ForceDuringTransition => self.run_force_during_transition(&world).await,
            ScenarioId::DivergentCommand => self.run_divergent_command(&world).await,
            ScenarioId::ControllerDeparture => self.run_controller_departure(&world).await,
        };
        let outcome = outcome.and_then(|()| {
            ensure(
                world.tick_count() <= self.max_ticks,
                format!("ran {} ticks, budget {}", world.tick_count(), self.max_ticks),
            )
        });

        if let Err(err) = &outcome {
            warn!(scenario = scenario.name(), error = %err, "scenario failed");
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: outcome.is_ok(),
            total_ticks: world.tick_count(),
            final_time_secs: world.time(),
            failure_reason: outcome.err().map(|err| err.to_string()),
            metrics: ScenarioMetrics::collect(world.stats(), world.ownership_events()),
        }
    }

    /// Spawns the peers and attaches one sentry per peer to `path`.
    async fn setup(
        &self,
        world: &SimWorld<Mode>,
        journals: &Journals,
        path: &str,
        policy: OwnershipPolicy,
    ) -> Result<(Vec<PeerId>, Vec<(PeerId, SimMachine<Mode>)>), ScenarioFailure> {
        let peers = world.spawn_peers();
        let machines = world
            .attach_all(&peers, path, policy, |peer| sentry(&journals.of(peer)))
            .await?;
        let view = machines[0].1.view_id();
        ensure(
            machines.iter().all(|(_, machine)| machine.view_id() == view),
            "peers resolved the entity to different views",
        )?;
        Ok((peers, machines))
    }

    fn check_all_in(
        machines: &[(PeerId, SimMachine<Mode>)],
        expected: Mode,
    ) -> Result<(), ScenarioFailure> {
        for (peer, machine) in machines {
            ensure(
                machine.current_state() == Some(expected),
                format!("{} is in {:?}, expected {:?}", peer, machine.current_state(), expected),
            )?;
        }
        Ok(())
    }

    fn owners(world: &SimWorld<Mode>, view: ViewId) -> Vec<(Option<PeerId>, Option<PeerId>)> {
        world
            .hosts()
            .iter()
            .map(|host| {
                host.view(view)
                    .map(|record| (record.owner, record.controller))
                    .unwrap_or((None, None))
            })
            .collect()
    }

    /// NET-001: TakeoverRace - two claims against the same believed owner.
    ///
    /// **Assertion**: one owner on every peer; every peer sees one transfer
    /// and one failure.
    async fn run_takeover_race(&self, world: &SimWorld<Mode>) -> Result<(), ScenarioFailure> {
        info!("NET-001: TakeoverRace");
        let journals = Journals::default();
        let (peers, machines) = self
            .setup(world, &journals, "Arena/Flag", OwnershipPolicy::Takeover)
            .await?;
        let view = machines[0].1.view_id();
        let events = EventLog::default();
        events.record(world, &peers)?;

        let (a, b) = (peers[1], peers[2]);
        let (host_a, host_b) = (world.host(a)?, world.host(b)?);
        let (claim_a, claim_b) = tokio::join!(
            host_a.request_ownership(view, a),
            host_b.request_ownership(view, b)
        );
        claim_a?;
        claim_b?;
        world.settle().await;

        let owners = Self::owners(world, view);
        let (winner, _) = owners[0];
        ensure(
            winner == Some(a) || winner == Some(b),
            format!("owner after race is {:?}", winner),
        )?;
        ensure(
            owners.iter().all(|(owner, controller)| *owner == winner && *controller == winner),
            "peers disagree on the winner",
        )?;

        for &peer in &peers {
            let transferred = events.count(peer, |e| matches!(e, OwnershipEvent::Transferred { .. }));
            let failed = events.count(peer, |e| matches!(e, OwnershipEvent::TransferFailed { .. }));
            ensure(
                transferred == 1 && failed == 1,
                format!("{} saw {} transfers and {} failures", peer, transferred, failed),
            )?;
        }
        Ok(())
    }

    /// NET-002: ConsentHandoff - request, owner consents, new owner drives.
    async fn run_consent_handoff(&self, world: &SimWorld<Mode>) -> Result<(), ScenarioFailure> {
        info!("NET-002: ConsentHandoff");
        let journals = Journals::default();
        let (peers, machines) = self
            .setup(world, &journals, "Hall/Lectern", OwnershipPolicy::RequestConsent)
            .await?;
        let view = machines[0].1.view_id();
        let (owner, requester, outsider) = (peers[0], peers[1], peers[2]);
        let events = EventLog::default();
        events.record(world, &[owner])?;

        world.host(requester)?.request_ownership(view, requester).await?;
        world.settle().await;

        ensure(
            events.count(owner, |e| {
                matches!(e, OwnershipEvent::Requested { requester: r, .. } if *r == requester)
            }) == 1,
            "owner never saw the request",
        )?;
        for host in world.hosts() {
            let pending = host.view(view).map(|record| record.negotiation);
            ensure(
                pending == Some(Negotiation::RequestPending { requester }),
                format!("negotiation on {} is {:?}", host.local_id(), pending),
            )?;
        }

        let refused = world.host(outsider)?.transfer_ownership(view, outsider).await;
        ensure(
            matches!(refused, Err(HostError::Ownership(OwnershipError::NotOwner { .. }))),
            "an outsider was allowed to transfer a consent view",
        )?;

        world.host(owner)?.transfer_ownership(view, requester).await?;
        world.settle().await;
        ensure(
            Self::owners(world, view)
                .iter()
                .all(|pair| *pair == (Some(requester), Some(requester))),
            "handoff did not reach every peer",
        )?;

        let driver = &machines[1].1;
        ensure(driver.is_mine(), "new owner does not control the view")?;
        driver.queue_new_state(Mode::Patrol, false).await?;
        world.run_ticks(SETTLE_TICKS).await;
        Self::check_all_in(&machines, Mode::Patrol)
    }

    /// NET-003: LateJoin - buffered changes reach a peer that joins later.
    async fn run_late_join(&self, world: &SimWorld<Mode>) -> Result<(), ScenarioFailure> {
        info!("NET-003: LateJoin");
        let journals = Journals::default();
        let (_, machines) = self
            .setup(world, &journals, "Tower/Beacon", OwnershipPolicy::Takeover)
            .await?;
        let view = machines[0].1.view_id();
        let controller = &machines[0].1;

        controller.queue_new_state(Mode::Patrol, false).await?;
        controller.queue_new_state(Mode::Alert, true).await?;
        world.settle().await;
        world.run_ticks(SETTLE_TICKS).await;
        Self::check_all_in(&machines, Mode::Alert)?;

        let late = world.join_peer();
        world.settle().await;
        let machine = world
            .attach(late, "Tower/Beacon", OwnershipPolicy::Takeover, |peer| sentry(&journals.of(peer)))
            .await?;
        ensure(machine.view_id() == view, "late joiner resolved a different view")?;

        world.run_ticks(SETTLE_TICKS).await;
        ensure(
            machine.current_state() == Some(Mode::Alert),
            format!("late joiner is in {:?}", machine.current_state()),
        )?;
        ensure(
            machine.peek_previous_state() == Some(Mode::Patrol),
            "late joiner lost the saved history",
        )?;
        ensure(
            journals.of(late).position("enter Patrol") < journals.of(late).position("enter Alert"),
            "late joiner replayed out of order",
        )
    }

    /// NET-004: ConcurrentDemand - every peer demands one identity at once.
    ///
    /// **Assertion**: one View id everywhere and one registry entry per peer.
    async fn run_concurrent_demand(&self, world: &SimWorld<Mode>) -> Result<(), ScenarioFailure> {
        info!("NET-004: ConcurrentDemand");
        let journals = Journals::default();
        let mut peers = world.spawn_peers();
        world.context.shuffle(&mut peers);

        let build = |peer| sentry(&journals.of(peer));
        let first = world
            .attach_all(&peers, "Hall/Chandelier", OwnershipPolicy::Takeover, build)
            .await?;
        let view = first[0].1.view_id();
        ensure(
            first.iter().all(|(_, machine)| machine.view_id() == view),
            "concurrent demands minted more than one view",
        )?;

        let second = world
            .attach_all(&peers, "Hall/Organ", OwnershipPolicy::Fixed, build)
            .await?;
        ensure(
            second.iter().all(|(_, machine)| machine.view_id() == second[0].1.view_id()),
            "second identity split across views",
        )?;
        ensure(second[0].1.view_id() != view, "two identities share a view")?;

        for host in world.hosts() {
            let known = host.views().lock().len();
            ensure(
                known == 2,
                format!("{} knows {} views", host.local_id(), known),
            )?;
        }
        Ok(())
    }

    /// NET-005: ForceDuringTransition - a force lands while Patrol is entering.
    ///
    /// **Assertion**: every peer ends in Alert, entered after Patrol.
    async fn run_force_during_transition(&self, world: &SimWorld<Mode>) -> Result<(), ScenarioFailure> {
        info!("NET-005: ForceDuringTransition");
        let journals = Journals::default();
        let (peers, machines) = self
            .setup(world, &journals, "Gate/Turret", OwnershipPolicy::Fixed)
            .await?;
        let controller = &machines[0].1;

        controller.queue_new_state(Mode::Patrol, false).await?;
        world.settle().await;
        world.tick().await;
        controller.force_change_state(Mode::Alert).await?;
        world.settle().await;
        world.run_ticks(SETTLE_TICKS).await;

        Self::check_all_in(&machines, Mode::Alert)?;
        for peer in peers {
            let journal = journals.of(peer);
            let (patrol, alert) = (journal.position("enter Patrol"), journal.position("enter Alert"));
            ensure(
                patrol.is_some() && patrol < alert,
                format!("{} entered out of order: {:?}", peer, journal.entries()),
            )?;
        }
        Ok(())
    }

    /// NET-006: DivergentCommand - one peer is in Alert when `ping` arrives.
    async fn run_divergent_command(&self, world: &SimWorld<Mode>) -> Result<(), ScenarioFailure> {
        info!("NET-006: DivergentCommand");
        let journals = Journals::default();
        let (peers, machines) = self
            .setup(world, &journals, "Wall/Sentry", OwnershipPolicy::Takeover)
            .await?;
        let controller = &machines[0].1;

        controller.queue_new_state(Mode::Patrol, false).await?;
        world.settle().await;
        world.run_ticks(SETTLE_TICKS).await;

        let (stray, stray_machine) = &machines[machines.len() - 1];
        ensure(!stray_machine.is_mine(), "stray peer unexpectedly controls the view")?;
        stray_machine.queue_new_state(Mode::Alert, false).await?;
        world.run_ticks(SETTLE_TICKS).await;
        ensure(
            stray_machine.current_state() == Some(Mode::Alert),
            "stray peer did not diverge",
        )?;

        controller.invoke("ping", Target::All, Vec::new()).await?;
        world.settle().await;

        for peer in peers {
            let expected = if peer == *stray { 0 } else { 1 };
            let pings = journals.of(peer).count("ping");
            ensure(
                pings == expected,
                format!("{} ran ping {} times, expected {}", peer, pings, expected),
            )?;
        }
        Ok(())
    }

    /// NET-007: ControllerDeparture - control returns to the authoritative peer.
    async fn run_controller_departure(&self, world: &SimWorld<Mode>) -> Result<(), ScenarioFailure> {
        info!("NET-007: ControllerDeparture");
        let journals = Journals::default();
        let (peers, machines) = self
            .setup(world, &journals, "Bridge/Lever", OwnershipPolicy::Takeover)
            .await?;
        let view = machines[0].1.view_id();
        let (authoritative, taker) = (peers[0], peers[1]);

        world.host(taker)?.request_ownership(view, taker).await?;
        world.settle().await;
        ensure(
            Self::owners(world, view)
                .iter()
                .all(|pair| *pair == (Some(taker), Some(taker))),
            "takeover did not reach every peer",
        )?;

        world.leave_peer(taker);
        ensure(
            Self::owners(world, view)
                .iter()
                .all(|pair| *pair == (Some(taker), Some(authoritative))),
            "control did not fall back to the authoritative peer",
        )?;

        let remaining: Vec<_> = machines
            .into_iter()
            .filter(|(peer, _)| *peer != taker)
            .collect();
        let fallback = &remaining[0].1;
        ensure(fallback.is_mine(), "authoritative peer does not control the view")?;
        fallback.queue_new_state(Mode::Alert, false).await?;
        world.settle().await;
        world.run_ticks(SETTLE_TICKS).await;
        Self::check_all_in(&remaining, Mode::Alert)
    }
}
