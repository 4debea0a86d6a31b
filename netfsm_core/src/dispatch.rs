//! Command dispatch.
//!
//! Integrators register named commands per state key. The registry sorts
//! them by `(state ordinal, name)` and assigns dense one-byte indices, so
//! every peer that registers the same commands derives the same table and
//! only the index has to cross the wire.
//!
//! A command runs only on a peer whose active state is the command's
//! owning state. Anywhere else it is skipped without error: peers are
//! allowed to disagree about the active state for a while.

use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::engine::TransitionEngine;
use crate::state::{StateBehavior, StateKey};

/// Failure reported by a command handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CommandFailure(pub String);

impl CommandFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<serde_json::Error> for CommandFailure {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("bad argument: {}", err))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("command {0} is registered more than once")]
    DuplicateCommand(String),

    #[error("{0} commands registered; at most 256 fit in a one-byte index")]
    TooManyCommands(usize),

    #[error("unknown command {0}")]
    UnknownCommand(String),

    #[error("command index {index} out of range ({len} registered)")]
    IndexOutOfRange { index: u8, len: usize },

    #[error("command {name} failed: {reason}")]
    HandlerFailed { name: String, reason: CommandFailure },
}

/// Result of dispatching a command on this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Invoked,
    /// The active state is not the command's owning state.
    SkippedDivergent,
    /// The engine has not entered any state yet.
    NoActiveState,
}

type Handler<S> =
    Arc<dyn Fn(&mut dyn StateBehavior<S>, &[Value]) -> Result<(), CommandFailure> + Send + Sync>;

struct CommandEntry<S: StateKey> {
    owner: S,
    name: String,
    handler: Handler<S>,
}

pub struct CommandRegistryBuilder<S: StateKey> {
    entries: Vec<CommandEntry<S>>,
}

impl<S: StateKey> CommandRegistryBuilder<S> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Registers `name` as a command of the behaviour `B` bound to `owner`.
    pub fn command<B, F>(mut self, owner: S, name: &str, handler: F) -> Self
    where
        B: StateBehavior<S>,
        F: Fn(&mut B, &[Value]) -> Result<(), CommandFailure> + Send + Sync + 'static,
    {
        let wrapped = move |behavior: &mut dyn StateBehavior<S>, args: &[Value]| {
            match behavior.as_any_mut().downcast_mut::<B>() {
                Some(concrete) => handler(concrete, args),
                None => Err(CommandFailure(format!(
                    "active behaviour is not a {}",
                    type_name::<B>()
                ))),
            }
        };
        self.entries.push(CommandEntry {
            owner,
            name: name.to_string(),
            handler: Arc::new(wrapped),
        });
        self
    }

    pub fn build(mut self) -> Result<CommandRegistry<S>, DispatchError> {
        self.entries.sort_by(|a, b| {
            a.owner
                .ordinal()
                .cmp(&b.owner.ordinal())
                .then_with(|| a.name.cmp(&b.name))
        });

        if self.entries.len() > 256 {
            return Err(DispatchError::TooManyCommands(self.entries.len()));
        }

        let mut by_name = HashMap::with_capacity(self.entries.len());
        for (index, entry) in self.entries.iter().enumerate() {
            if by_name.insert(entry.name.clone(), index as u8).is_some() {
                return Err(DispatchError::DuplicateCommand(entry.name.clone()));
            }
        }

        Ok(CommandRegistry {
            entries: self.entries,
            by_name,
        })
    }
}

impl<S: StateKey> Default for CommandRegistryBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Name → index table plus the handlers, built once per machine instance.
pub struct CommandRegistry<S: StateKey> {
    entries: Vec<CommandEntry<S>>,
    by_name: HashMap<String, u8>,
}

impl<S: StateKey> CommandRegistry<S> {
    pub fn builder() -> CommandRegistryBuilder<S> {
        CommandRegistryBuilder::new()
    }

    pub fn resolve(&self, name: &str) -> Result<u8, DispatchError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| DispatchError::UnknownCommand(name.to_string()))
    }

    pub fn name(&self, index: u8) -> Result<&str, DispatchError> {
        self.entry(index).map(|entry| entry.name.as_str())
    }

    pub fn owner(&self, index: u8) -> Result<S, DispatchError> {
        self.entry(index).map(|entry| entry.owner)
    }

    fn entry(&self, index: u8) -> Result<&CommandEntry<S>, DispatchError> {
        self.entries
            .get(index as usize)
            .ok_or(DispatchError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            })
    }

    /// Registered `(owner, name)` pairs in index order.
    pub fn table(&self) -> Vec<(S, &str)> {
        self.entries
            .iter()
            .map(|entry| (entry.owner, entry.name.as_str()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs command `index` against `engine`'s active behaviour if that
    /// behaviour is bound to the command's owning state, waiting for any
    /// in-flight transition first.
    pub async fn dispatch(
        &self,
        engine: &TransitionEngine<S>,
        index: u8,
        args: &[Value],
    ) -> Result<DispatchOutcome, DispatchError> {
        let entry = self.entry(index)?;
        engine
            .with_active(|active, behavior| entry.run(active, behavior, args))
            .await
            .unwrap_or(Ok(DispatchOutcome::NoActiveState))
    }

    /// Like [`dispatch`](Self::dispatch), but returns `Ok(None)` instead of
    /// waiting while a transition holds the behaviours.
    pub fn try_dispatch(
        &self,
        engine: &TransitionEngine<S>,
        index: u8,
        args: &[Value],
    ) -> Result<Option<DispatchOutcome>, DispatchError> {
        let entry = self.entry(index)?;
        match engine.try_with_active(|active, behavior| entry.run(active, behavior, args)) {
            Ok(Some(outcome)) => outcome.map(Some),
            Ok(None) => Ok(Some(DispatchOutcome::NoActiveState)),
            Err(_) => Ok(None),
        }
    }
}

impl<S: StateKey> CommandEntry<S> {
    fn run(
        &self,
        active: S,
        behavior: &mut dyn StateBehavior<S>,
        args: &[Value],
    ) -> Result<DispatchOutcome, DispatchError> {
        if active != self.owner {
            debug!(command = %self.name, active = ?active, owner = ?self.owner, "command skipped, state diverged");
            return Ok(DispatchOutcome::SkippedDivergent);
        }
        (self.handler)(behavior, args)
            .map(|_| DispatchOutcome::Invoked)
            .map_err(|reason| DispatchError::HandlerFailed {
                name: self.name.clone(),
                reason,
            })
    }
}
