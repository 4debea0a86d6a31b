//! Common types for the netfsm environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a peer participating in a session.
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub Uuid);

impl PeerId {
    /// Creates a new random PeerId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic PeerId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Envelope for calls transmitted between peers.
///
/// This is a transport-layer wrapper - the payload is opaque bytes that
/// the receiving core deserializes into its own wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The encoded call
    pub payload: Vec<u8>,

    /// Timestamp when the envelope was created (sender's clock)
    pub timestamp_ms: u64,

    /// Set by the transport when the envelope is a replay of a buffered
    /// broadcast delivered to a late joiner
    pub replayed: bool,
}

impl Envelope {
    /// Creates a new envelope from payload bytes.
    pub fn new(payload: Vec<u8>, timestamp_ms: u64) -> Self {
        Self {
            payload,
            timestamp_ms,
            replayed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_seed_is_deterministic() {
        assert_eq!(PeerId::from_seed(7), PeerId::from_seed(7));
        assert_ne!(PeerId::from_seed(7), PeerId::from_seed(8));
    }

    #[test]
    fn test_peer_id_display_is_short() {
        let id = PeerId::from_seed(1);
        assert_eq!(id.to_string().len(), 8);
    }
}
