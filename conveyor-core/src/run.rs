//! Canonical run state.
//!
//! One [`RunState`] value describes the whole pipeline run. Observers only
//! ever see clones of it (inside `state_change` events or via
//! `get_current_state`); the orchestrator is the sole writer, with the
//! watchdog permitted to force a terminal transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::RunId;
use crate::stage::StageKind;

/// What caused a run to start.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    /// The interval scheduler fired.
    Scheduled,
    /// An operator or the surrounding system called `start_run`.
    Manual,
}

/// Phase of the run state machine.
///
/// `Success`, `Failed`, and `Stopped` are absorbing; once a run enters one of
/// them no later transition is accepted for that run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RunPhase {
    /// No run has been started yet (placeholder before the first run).
    Idle,
    /// Lock acquired, stages not yet sequenced.
    Starting,
    /// A stage attempt is executing.
    RunningStage {
        /// Stage currently executing.
        stage: StageKind,
    },
    /// A failed stage is about to be re-run.
    Retrying {
        /// Stage being retried.
        stage: StageKind,
        /// Retry ordinal (1 = first retry).
        attempt: u32,
    },
    /// All applicable stages completed.
    Success,
    /// The run failed and will not continue.
    Failed {
        /// Human-readable failure reason.
        reason: String,
    },
    /// The run was cancelled by an operator or by shutdown.
    Stopped,
}

impl RunPhase {
    /// True for the absorbing phases.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::Success | RunPhase::Failed { .. } | RunPhase::Stopped
        )
    }
}

/// Per-stage retry counters, reset when the stage succeeds.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StageRetries {
    /// Retries consumed by the translate stage.
    pub translate: u32,
    /// Retries consumed by the analyze stage.
    pub analyze: u32,
    /// Retries consumed by the merge stage.
    pub merge: u32,
}

impl StageRetries {
    /// Retries consumed so far for `stage`.
    pub fn get(&self, stage: StageKind) -> u32 {
        match stage {
            StageKind::Translate => self.translate,
            StageKind::Analyze => self.analyze,
            StageKind::Merge => self.merge,
        }
    }

    /// Record one more retry for `stage`, returning the new count.
    pub fn bump(&mut self, stage: StageKind) -> u32 {
        let slot = match stage {
            StageKind::Translate => &mut self.translate,
            StageKind::Analyze => &mut self.analyze,
            StageKind::Merge => &mut self.merge,
        };
        *slot += 1;
        *slot
    }

    /// Clear the counter once `stage` succeeds.
    pub fn reset(&mut self, stage: StageKind) {
        match stage {
            StageKind::Translate => self.translate = 0,
            StageKind::Analyze => self.analyze = 0,
            StageKind::Merge => self.merge = 0,
        }
    }
}

/// Structured failure detail attached to a failed run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    /// Stage the failure is attributed to, if any (watchdog interventions
    /// may fire between stages).
    pub stage: Option<StageKind>,
    /// Exit code of the failing process, when one was observed.
    pub exit_code: Option<i32>,
    /// Human-readable description suitable for display.
    pub message: String,
    /// The attempt exceeded its wall-clock ceiling.
    pub timed_out: bool,
    /// The attempt produced no output for longer than the hang threshold.
    pub hung: bool,
}

/// Complete snapshot of one pipeline run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunState {
    /// Opaque unique token minted at run start.
    pub run_id: RunId,
    /// Current phase of the state machine.
    pub phase: RunPhase,
    /// What started the run.
    pub trigger: RunTrigger,
    /// Stage currently executing or retrying, if any.
    pub current_stage: Option<StageKind>,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// Last progress timestamp; the watchdog compares against this.
    pub updated_at: DateTime<Utc>,
    /// Per-stage retry counters.
    pub retries: StageRetries,
    /// Failure detail, populated before the `Failed` transition.
    pub error: Option<RunError>,
}

impl RunState {
    /// Placeholder state before any run exists.
    pub fn idle() -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::nil(),
            phase: RunPhase::Idle,
            trigger: RunTrigger::Manual,
            current_stage: None,
            started_at: now,
            updated_at: now,
            retries: StageRetries::default(),
            error: None,
        }
    }

    /// Fresh state for a newly started run.
    pub fn begin(run_id: RunId, trigger: RunTrigger) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            phase: RunPhase::Starting,
            trigger,
            current_stage: None,
            started_at: now,
            updated_at: now,
            retries: StageRetries::default(),
            error: None,
        }
    }

    /// True once the run has reached an absorbing phase.
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Apply a phase transition. Returns `false` (and leaves the state
    /// untouched) when the run is already terminal; terminal phases are
    /// write-once.
    pub fn transition(&mut self, phase: RunPhase) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.current_stage = match &phase {
            RunPhase::RunningStage { stage } | RunPhase::Retrying { stage, .. } => Some(*stage),
            _ => None,
        };
        self.phase = phase;
        self.updated_at = Utc::now();
        true
    }

    /// Refresh `updated_at` without changing phase, marking progress for the
    /// watchdog.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phase_is_write_once() {
        let mut state = RunState::begin(RunId::new(), RunTrigger::Manual);
        assert!(state.transition(RunPhase::RunningStage {
            stage: StageKind::Translate
        }));
        assert!(state.transition(RunPhase::Success));
        assert!(state.is_terminal());

        // Late transitions for the same run must not overwrite the outcome.
        assert!(!state.transition(RunPhase::Failed {
            reason: "late".into()
        }));
        assert!(!state.transition(RunPhase::Stopped));
        assert_eq!(state.phase, RunPhase::Success);
    }

    #[test]
    fn transition_tracks_current_stage() {
        let mut state = RunState::begin(RunId::new(), RunTrigger::Scheduled);
        state.transition(RunPhase::RunningStage {
            stage: StageKind::Analyze,
        });
        assert_eq!(state.current_stage, Some(StageKind::Analyze));

        state.transition(RunPhase::Retrying {
            stage: StageKind::Analyze,
            attempt: 1,
        });
        assert_eq!(state.current_stage, Some(StageKind::Analyze));

        state.transition(RunPhase::Success);
        assert_eq!(state.current_stage, None);
    }

    #[test]
    fn retries_are_tracked_per_stage() {
        let mut retries = StageRetries::default();
        assert_eq!(retries.bump(StageKind::Translate), 1);
        assert_eq!(retries.bump(StageKind::Translate), 2);
        assert_eq!(retries.get(StageKind::Analyze), 0);

        retries.bump(StageKind::Analyze);
        retries.reset(StageKind::Translate);
        assert_eq!(retries.get(StageKind::Translate), 0);
        assert_eq!(retries.get(StageKind::Analyze), 1);
    }
}
