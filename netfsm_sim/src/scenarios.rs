//! Multi-peer protocol scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// NET-001: two peers claim a takeover View at the same time
    TakeoverRace,

    /// NET-002: request-consent negotiation ending in a handoff
    ConsentHandoff,

    /// NET-003: a peer joins after state changes were broadcast
    LateJoin,

    /// NET-004: every peer demands the same unknown identity at once
    ConcurrentDemand,

    /// NET-005: a forced state arrives while a transition is running
    ForceDuringTransition,

    /// NET-006: a command reaches a peer whose state has diverged
    DivergentCommand,

    /// NET-007: the controlling peer leaves the network
    ControllerDeparture,
}

impl ScenarioId {
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::TakeoverRace,
            ScenarioId::ConsentHandoff,
            ScenarioId::LateJoin,
            ScenarioId::ConcurrentDemand,
            ScenarioId::ForceDuringTransition,
            ScenarioId::DivergentCommand,
            ScenarioId::ControllerDeparture,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::TakeoverRace => "takeover_race",
            ScenarioId::ConsentHandoff => "consent_handoff",
            ScenarioId::LateJoin => "late_join",
            ScenarioId::ConcurrentDemand => "concurrent_demand",
            ScenarioId::ForceDuringTransition => "force_during_transition",
            ScenarioId::DivergentCommand => "divergent_command",
            ScenarioId::ControllerDeparture => "controller_departure",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::TakeoverRace => "Simultaneous takeover claims, exactly one winner everywhere",
            ScenarioId::ConsentHandoff => "Consent request observed by the owner, then handed off",
            ScenarioId::LateJoin => "Buffered state changes replayed to a late joiner",
            ScenarioId::ConcurrentDemand => "Concurrent demands for one identity mint one View",
            ScenarioId::ForceDuringTransition => "Forced state applied after the in-flight transition",
            ScenarioId::DivergentCommand => "Command skipped on a peer in a different state",
            ScenarioId::ControllerDeparture => "Control falls back to the authoritative peer",
        }
    }

    /// Fewest peers the scenario needs.
    pub fn min_peers(&self) -> usize {
        match self {
            ScenarioId::LateJoin | ScenarioId::ForceDuringTransition => 2,
            _ => 3,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "takeover_race" | "takeover" | "net-001" => Ok(ScenarioId::TakeoverRace),
            "consent_handoff" | "consent" | "net-002" => Ok(ScenarioId::ConsentHandoff),
            "late_join" | "latejoin" | "net-003" => Ok(ScenarioId::LateJoin),
            "concurrent_demand" | "demand" | "net-004" => Ok(ScenarioId::ConcurrentDemand),
            "force_during_transition" | "force" | "net-005" => Ok(ScenarioId::ForceDuringTransition),
            "divergent_command" | "divergent" | "net-006" => Ok(ScenarioId::DivergentCommand),
            "controller_departure" | "departure" | "net-007" => Ok(ScenarioId::ControllerDeparture),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
