//! netfsm Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction that lets the netfsm core
//! run against a real transport (tokio) or a deterministic in-memory one
//! (the `netfsm_sim` harness).
//!
//! # Core Concept
//!
//! The replicated state machine never touches sockets, clocks or the task
//! scheduler directly. Everything it consumes from the outside world goes
//! through two traits:
//! - [`PeerContext`]: time, sleeping and spawning background work
//! - [`NetworkTransport`]: sender-ordered delivery plus the membership view
//!   (local peer, authoritative peer, liveness of other peers)
//!
//! # Example
//!
//! ```ignore
//! use netfsm_env::{NetworkTransport, PeerContext};
//!
//! async fn peer_loop<Ctx: PeerContext, Net: NetworkTransport>(ctx: &Ctx, net: &Net) {
//!     loop {
//!         while let Some((from, envelope)) = net.try_recv() {
//!             handle(from, envelope).await;
//!         }
//!         tick();
//!         ctx.sleep(Duration::from_millis(33)).await;
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use context::PeerContext;
pub use network::{BroadcastScope, NetworkTransport, Target};
pub use types::{Envelope, PeerId};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
