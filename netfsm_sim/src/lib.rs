//! netfsm Deterministic Simulation Harness
//!
//! Runs many replica hosts in one process against a simulated network so
//! the multi-peer protocols can be exercised and checked.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: a virtual clock advanced one tick at a time
//! - **Network**: one router queue, drained by the world between ticks
//! - **Randomness**: all draws come from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        SimWorld                           │
//! │   SimContext (virtual clock + seeded RNG)                 │
//! │                                                           │
//! │  ┌─────────────┐              ┌─────────────┐             │
//! │  │ ReplicaHost │              │ ReplicaHost │    ...      │
//! │  │   peer-0    │              │   peer-1    │             │
//! │  └──────┬──────┘              └──────┬──────┘             │
//! │         │ SimNetwork                 │ SimNetwork         │
//! │  ┌──────▼────────────────────────────▼──────┐             │
//! │  │ Router (ordered queue + replay log)      │             │
//! │  └──────────────────────────────────────────┘             │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use netfsm_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4).run(ScenarioId::TakeoverRace);
//! assert!(result.passed);
//! ```

mod context;
pub mod demo;
mod network;
mod runner;
pub mod scenarios;
mod world;

pub use context::SimContext;
pub use network::{Membership, NetworkMessage, Route, SharedMembership, SimNetwork, SimNetworkController};
pub use runner::{ScenarioFailure, ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{PeerHandle, RoutingStats, SimConfig, SimError, SimHost, SimMachine, SimWorld};
