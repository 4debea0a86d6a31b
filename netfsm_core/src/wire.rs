//! Wire messages carried inside transport envelopes.
//!
//! Every call the core makes across peers is one `WireMessage`, serialized
//! as JSON into `Envelope::payload`. State keys travel as their one-byte
//! ordinal and commands as their registry index.

use netfsm_env::{Envelope, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::EntityIdentity;
use crate::view::{OwnershipPolicy, ViewId};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode wire message: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode wire message: {0}")]
    Decode(serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Enqueue a state on every peer's engine for `view`.
    QueueState {
        view: ViewId,
        state: u8,
        save_previous: bool,
    },

    /// Force a state on every peer's engine for `view`.
    ForceState { view: ViewId, state: u8 },

    /// Invoke a registered command on peers whose active state declares it.
    Command {
        view: ViewId,
        index: u8,
        args: Vec<serde_json::Value>,
    },

    /// Takeover claim, sent to the authoritative peer for arbitration.
    TakeoverRequest {
        view: ViewId,
        requester: PeerId,
        expected_owner: Option<PeerId>,
    },

    /// Consent request, broadcast so the current owner can react.
    OwnershipRequested { view: ViewId, requester: PeerId },

    OwnershipTransferred {
        view: ViewId,
        new_owner: PeerId,
        previous_owner: Option<PeerId>,
    },

    OwnershipTransferFailed { view: ViewId, requester: PeerId },

    /// Ask the authoritative peer for the View bound to `identity`.
    Demand {
        identity: EntityIdentity,
        requester: PeerId,
        policy: OwnershipPolicy,
    },

    /// Answer to a `Demand`.
    Respond {
        identity: EntityIdentity,
        view: ViewId,
        owner: PeerId,
        policy: OwnershipPolicy,
    },
}

impl WireMessage {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::QueueState { .. } => "queue_state",
            WireMessage::ForceState { .. } => "force_state",
            WireMessage::Command { .. } => "command",
            WireMessage::TakeoverRequest { .. } => "takeover_request",
            WireMessage::OwnershipRequested { .. } => "ownership_requested",
            WireMessage::OwnershipTransferred { .. } => "ownership_transferred",
            WireMessage::OwnershipTransferFailed { .. } => "ownership_transfer_failed",
            WireMessage::Demand { .. } => "demand",
            WireMessage::Respond { .. } => "respond",
        }
    }

    /// The View a message addresses, if any. Discovery messages name an
    /// identity instead.
    pub fn view(&self) -> Option<ViewId> {
        match self {
            WireMessage::QueueState { view, .. }
            | WireMessage::ForceState { view, .. }
            | WireMessage::Command { view, .. }
            | WireMessage::TakeoverRequest { view, .. }
            | WireMessage::OwnershipRequested { view, .. }
            | WireMessage::OwnershipTransferred { view, .. }
            | WireMessage::OwnershipTransferFailed { view, .. }
            | WireMessage::Respond { view, .. } => Some(*view),
            WireMessage::Demand { .. } => None,
        }
    }

    pub fn encode(&self, timestamp_ms: u64) -> Result<Envelope, WireError> {
        let payload = serde_json::to_vec(self).map_err(WireError::Encode)?;
        Ok(Envelope::new(payload, timestamp_ms))
    }

    pub fn decode(envelope: &Envelope) -> Result<Self, WireError> {
        serde_json::from_slice(&envelope.payload).map_err(WireError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_envelope_carries_index_not_name() {
        let message = WireMessage::Command {
            view: ViewId(3),
            index: 7,
            args: vec![serde_json::json!(42)],
        };
        let envelope = message.encode(10).unwrap();
        let text = String::from_utf8(envelope.payload.clone()).unwrap();

        assert!(text.contains("\"type\":\"command\""));
        assert!(text.contains("\"index\":7"));
        assert_eq!(envelope.timestamp_ms, 10);
        assert_eq!(WireMessage::decode(&envelope).unwrap(), message);
    }

    #[test]
    fn test_view_of_state_and_discovery_messages() {
        let force = WireMessage::ForceState { view: ViewId(4), state: 0 };
        assert_eq!(force.view(), Some(ViewId(4)));

        let demand = WireMessage::Demand {
            identity: EntityIdentity::from_path("Level/Door"),
            requester: PeerId::from_seed(1),
            policy: OwnershipPolicy::Takeover,
        };
        assert_eq!(demand.view(), None);
    }

    #[test]
    fn test_garbage_payload_is_a_decode_error() {
        let envelope = Envelope::new(b"not json".to_vec(), 0);
        assert!(matches!(WireMessage::decode(&envelope), Err(WireError::Decode(_))));
    }
}
