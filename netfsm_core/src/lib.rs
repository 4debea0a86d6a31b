//! netfsm core - replicated finite-state machines over a peer network.
//!
//! Every peer runs its own [`TransitionEngine`] per entity. The peer that
//! controls an entity decides which state comes next and broadcasts it; all
//! peers (the sender included) apply the change when the broadcast arrives.
//!
//! 1. **Transitions**: single-flight exit → enter sequencing with a FIFO
//!    queue, history and forced replacement.
//! 2. **Ownership**: fixed, takeover and request-consent policies, with
//!    takeover races arbitrated by the authoritative peer.
//! 3. **Discovery**: a content-hashed identity is resolved to one View id
//!    across all peers by the authoritative peer.
//! 4. **Commands**: named per-state handlers indexed by one byte on the
//!    wire, skipped on peers whose state has diverged.
//!
//! The network and clock are injected through the `netfsm_env` traits, so
//! the same code runs under tokio or inside the deterministic simulator.

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod engine;
pub mod host;
pub mod identity;
pub mod machine;
pub mod observer;
pub mod ownership;
pub mod state;
pub mod view;
pub mod wire;

// Re-export key types for convenience
pub use config::HostConfig;
pub use discovery::{Discovery, DiscoveryError, Resolution, SingleFlight};
pub use dispatch::{CommandFailure, CommandRegistry, CommandRegistryBuilder, DispatchError, DispatchOutcome};
pub use engine::{EngineBuilder, EngineError, StateChanged, Tick, TransitionEngine};
pub use host::{HostError, ReplicaHost};
pub use identity::EntityIdentity;
pub use machine::{InvokeOutcome, NetworkedStateMachine, TickStatus};
pub use observer::{Observers, SubscriptionId};
pub use ownership::{OwnershipError, OwnershipEvent, OwnershipProtocol};
pub use state::{
    decode_state, encode_state, AsAny, SpatialEvent, SpatialEventKind, StateBehavior, StateCodecError,
    StateKey,
};
pub use view::{Negotiation, OwnershipPolicy, SharedViews, View, ViewId, ViewRegistry};
pub use wire::{WireError, WireMessage};
