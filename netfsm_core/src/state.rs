//! State keys, state behaviours and the one-byte state codec.
//!
//! A state machine type declares a closed set of keys (`StateKey`) and binds
//! one `StateBehavior` to every key. Only the key crosses the wire, encoded
//! as a single byte, so a state space is limited to 256 variants.

use async_trait::async_trait;
use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use thiserror::Error;

use crate::identity::EntityIdentity;

/// Errors from encoding or decoding a state key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateCodecError {
    #[error("state {state} has ordinal {ordinal}, which does not fit in one byte")]
    OrdinalOutOfRange { state: String, ordinal: usize },

    #[error("byte {0} does not name a state")]
    UnknownOrdinal(u8),
}

/// A closed enumeration of states for one state machine type.
///
/// `Default` is the key reported as "previous" for the very first
/// transition of a machine.
pub trait StateKey: Copy + Eq + Hash + Debug + Default + Send + Sync + 'static {
    /// Every variant, in declaration order.
    fn variants() -> Vec<Self>;

    /// Position of this variant in declaration order.
    fn ordinal(self) -> usize;

    fn from_ordinal(ordinal: usize) -> Option<Self> {
        Self::variants().into_iter().find(|v| v.ordinal() == ordinal)
    }
}

/// Implements [`StateKey`] for a fieldless enum.
///
/// ```ignore
/// #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
/// enum Door { #[default] Closed, Open, Locked }
/// netfsm_core::state_key!(Door { Closed, Open, Locked });
/// ```
#[macro_export]
macro_rules! state_key {
    ($ty:ident { $($variant:ident),+ $(,)? }) => {
        impl $crate::StateKey for $ty {
            fn variants() -> Vec<Self> {
                vec![$($ty::$variant),+]
            }

            fn ordinal(self) -> usize {
                self as usize
            }
        }
    };
}

/// Encodes a state key as its wire byte.
///
/// Fails closed: a key whose ordinal does not fit in a byte is rejected and
/// never replaced by a default.
pub fn encode_state<S: StateKey>(state: S) -> Result<u8, StateCodecError> {
    let ordinal = state.ordinal();
    u8::try_from(ordinal).map_err(|_| StateCodecError::OrdinalOutOfRange {
        state: format!("{:?}", state),
        ordinal,
    })
}

/// Decodes a wire byte back into a state key.
pub fn decode_state<S: StateKey>(byte: u8) -> Result<S, StateCodecError> {
    S::from_ordinal(byte as usize).ok_or(StateCodecError::UnknownOrdinal(byte))
}

/// Kind of a spatial (trigger volume) event injected by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialEventKind {
    Enter,
    Stay,
    Exit,
}

/// A spatial event involving another entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialEvent {
    pub kind: SpatialEventKind,
    pub other: EntityIdentity,
}

/// Access to the concrete behaviour behind a `dyn StateBehavior`.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Behaviour bound to one state key of one machine.
///
/// Behaviours know nothing about the transport. Entering and exiting are
/// asynchronous; the engine awaits them and never runs two transitions at
/// once.
#[async_trait]
pub trait StateBehavior<S: StateKey>: AsAny + Send {
    /// The key this behaviour is bound to.
    fn key(&self) -> S;

    async fn enter_state(&mut self) {}

    async fn exit_state(&mut self) {}

    /// Called once per tick while this state is active and nothing is queued.
    fn update_state(&mut self) {}

    fn on_spatial_event(&mut self, _event: &SpatialEvent) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub enum Phase {
        #[default]
        Idle,
        Active,
        Error,
    }

    crate::state_key!(Phase { Idle, Active, Error });

    /// A key type wider than one byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Wide(pub u16);

    impl StateKey for Wide {
        fn variants() -> Vec<Self> {
            (0..300).map(Wide).collect()
        }

        fn ordinal(self) -> usize {
            self.0 as usize
        }
    }

    #[test]
    fn test_macro_ordinals_follow_declaration_order() {
        assert_eq!(Phase::variants(), vec![Phase::Idle, Phase::Active, Phase::Error]);
        assert_eq!(Phase::Error.ordinal(), 2);
        assert_eq!(Phase::from_ordinal(1), Some(Phase::Active));
        assert_eq!(Phase::from_ordinal(3), None);
    }

    #[test]
    fn test_unknown_byte_is_rejected() {
        assert_eq!(
            decode_state::<Phase>(9),
            Err(StateCodecError::UnknownOrdinal(9))
        );
    }

    #[test]
    fn test_wide_ordinal_fails_closed() {
        let err = encode_state(Wide(256)).unwrap_err();
        assert!(matches!(err, StateCodecError::OrdinalOutOfRange { ordinal: 256, .. }));
        assert_eq!(encode_state(Wide(255)), Ok(255));
    }

    proptest! {
        #[test]
        fn prop_byte_round_trip(raw in 0u16..300) {
            let state = Wide(raw);
            match encode_state(state) {
                Ok(byte) => {
                    prop_assert!(raw < 256);
                    prop_assert_eq!(decode_state::<Wide>(byte), Ok(state));
                }
                Err(_) => prop_assert!(raw >= 256),
            }
        }
    }
}
