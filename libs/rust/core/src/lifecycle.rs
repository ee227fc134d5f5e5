//! Build lifecycle identity and the per-run state machine.
//!
//! States:
//! - Planned (fold plan computed, nothing dispatched)
//! - Running (first sub-job dispatched)
//! - Aggregating (every fold reported ONE_DONE)
//! - Succeeded / Failed / Cancelled (terminal)
//!
//! Each transition is timestamped so a handle can report time spent per state.

use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token minted once per top-level build; correlates transform state across stages.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModelLifecycleId(String);

impl ModelLifecycleId {
    pub fn mint() -> Self { Self(Uuid::new_v4().to_string()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<&str> for ModelLifecycleId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl Display for ModelLifecycleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunState { Planned, Running, Aggregating, Succeeded, Failed, Cancelled }

impl RunState {
    pub fn is_terminal(&self) -> bool { matches!(self, RunState::Succeeded | RunState::Failed | RunState::Cancelled) }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Planned => "planned",
            RunState::Running => "running",
            RunState::Aggregating => "aggregating",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    fn can_move_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Planned, Running) | (Planned, Cancelled) | (Planned, Failed) => true,
            (Running, Aggregating) | (Running, Cancelled) | (Running, Failed) => true,
            (Aggregating, Succeeded) | (Aggregating, Failed) | (Aggregating, Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct RunLifecycle {
    state: RunState,
    started_at: Instant,
    state_started_at: Instant,
    durations: Vec<(RunState, Duration)>,
}

impl Default for RunLifecycle {
    fn default() -> Self { Self::new() }
}

impl RunLifecycle {
    pub fn new() -> Self { Self { state: RunState::Planned, started_at: Instant::now(), state_started_at: Instant::now(), durations: Vec::new() } }
    pub fn state(&self) -> RunState { self.state }

    /// Moves to `next`; returns false (and stays put) for an illegal transition.
    pub fn advance(&mut self, next: RunState) -> bool {
        if !self.state.can_move_to(next) { return false; }
        let now = Instant::now();
        self.durations.push((self.state, now - self.state_started_at));
        self.state = next;
        self.state_started_at = now;
        true
    }

    pub fn elapsed(&self) -> Duration { self.started_at.elapsed() }
    pub fn durations(&self) -> &[(RunState, Duration)] { &self.durations }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsm_progresses_to_success() {
        let mut lc = RunLifecycle::new();
        assert_eq!(lc.state(), RunState::Planned);
        assert!(lc.advance(RunState::Running));
        assert!(lc.advance(RunState::Aggregating));
        assert!(lc.advance(RunState::Succeeded));
        assert!(lc.state().is_terminal());
        assert_eq!(lc.durations().len(), 3);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut lc = RunLifecycle::new();
        lc.advance(RunState::Running);
        lc.advance(RunState::Cancelled);
        assert!(!lc.advance(RunState::Aggregating));
        assert!(!lc.advance(RunState::Succeeded));
        assert_eq!(lc.state(), RunState::Cancelled);
    }

    #[test]
    fn cannot_skip_running() {
        let mut lc = RunLifecycle::new();
        assert!(!lc.advance(RunState::Succeeded));
    }

    #[test]
    fn lifecycle_ids_are_unique() {
        assert_ne!(ModelLifecycleId::mint(), ModelLifecycleId::mint());
    }
}
