//! The sentry machine every scenario replicates.
//!
//! Three modes, one behaviour type. Each peer gets its own journal so a
//! scenario can check what ran where.

use async_trait::async_trait;
use netfsm_core::{
    CommandFailure, CommandRegistry, HostError, SpatialEvent, StateBehavior, TransitionEngine,
};
use serde_json::Value;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    #[default]
    Idle,
    Patrol,
    Alert,
}

netfsm_core::state_key!(Mode { Idle, Patrol, Alert });

/// Shared log of lifecycle calls and command effects for one peer.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| e.as_str() == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.as_str() == entry)
    }
}

pub struct Sentry {
    mode: Mode,
    journal: Journal,
    /// Scheduler turns `enter_state` gives up before completing
    enter_yields: usize,
}

impl Sentry {
    pub fn new(mode: Mode, journal: &Journal) -> Self {
        Self {
            mode,
            journal: journal.clone(),
            enter_yields: 0,
        }
    }

    pub fn slow(mut self, yields: usize) -> Self {
        self.enter_yields = yields;
        self
    }
}

#[async_trait]
impl StateBehavior<Mode> for Sentry {
    fn key(&self) -> Mode {
        self.mode
    }

    async fn enter_state(&mut self) {
        for _ in 0..self.enter_yields {
            tokio::task::yield_now().await;
        }
        self.journal.push(format!("enter {:?}", self.mode));
    }

    async fn exit_state(&mut self) {
        self.journal.push(format!("exit {:?}", self.mode));
    }

    fn on_spatial_event(&mut self, event: &SpatialEvent) {
        self.journal.push(format!("{:?} {}", event.kind, event.other));
    }
}

fn ping(sentry: &mut Sentry, _args: &[Value]) -> Result<(), CommandFailure> {
    sentry.journal.push("ping");
    Ok(())
}

fn sound_alarm(sentry: &mut Sentry, args: &[Value]) -> Result<(), CommandFailure> {
    let level: u8 = serde_json::from_value(args.first().cloned().unwrap_or(Value::Null))?;
    sentry.journal.push(format!("alarm {}", level));
    Ok(())
}

/// Engine plus command table for one peer. Entering `Patrol` takes a few
/// scheduler turns so forced changes can land mid-transition.
pub fn sentry(journal: &Journal) -> Result<(TransitionEngine<Mode>, CommandRegistry<Mode>), HostError> {
    let engine = TransitionEngine::builder()
        .with_state(Sentry::new(Mode::Idle, journal))
        .with_state(Sentry::new(Mode::Patrol, journal).slow(8))
        .with_state(Sentry::new(Mode::Alert, journal))
        .build()?;

    let commands = CommandRegistry::builder()
        .command(Mode::Patrol, "ping", ping)
        .command(Mode::Alert, "sound_alarm", sound_alarm)
        .command(Mode::Idle, "wake", |sentry: &mut Sentry, _: &[Value]| {
            sentry.journal.push("wake");
            Ok(())
        })
        .build()?;

    Ok((engine, commands))
}

#[cfg(test)]
mod tests {
    use super::*;
    use netfsm_core::{decode_state, encode_state, Tick};

    #[test]
    fn test_mode_codec() {
        assert_eq!(encode_state(Mode::Alert), Ok(2));
        assert_eq!(decode_state::<Mode>(1), Ok(Mode::Patrol));
        assert!(decode_state::<Mode>(3).is_err());
    }

    #[test]
    fn test_command_table_is_stable() {
        let (_, commands) = sentry(&Journal::new()).unwrap();
        assert_eq!(
            commands.table(),
            vec![(Mode::Idle, "wake"), (Mode::Patrol, "ping"), (Mode::Alert, "sound_alarm")]
        );
    }

    #[tokio::test]
    async fn test_slow_patrol_still_completes() {
        let journal = Journal::new();
        let (engine, _) = sentry(&journal).unwrap();
        engine.enqueue(Mode::Patrol, false);
        match engine.tick() {
            Tick::Transition { run, .. } => {
                run.await;
            }
            _ => panic!("expected a transition"),
        }
        assert_eq!(journal.entries(), vec!["enter Patrol".to_string()]);
    }

    #[tokio::test]
    async fn test_alarm_level_is_parsed() {
        let journal = Journal::new();
        let (engine, commands) = sentry(&journal).unwrap();
        engine.enqueue(Mode::Alert, false);
        if let Tick::Transition { run, .. } = engine.tick() {
            run.await;
        }
        let index = commands.resolve("sound_alarm").unwrap();
        commands
            .dispatch(&engine, index, &[serde_json::json!(3)])
            .await
            .unwrap();
        assert_eq!(journal.count("alarm 3"), 1);
    }
}
