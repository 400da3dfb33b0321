//! Event model for the pipeline log.
//!
//! Events are immutable once published. The bus assigns each one the next
//! slot in a single global, strictly increasing sequence; subscribers rely on
//! that order for replay and live delivery alike.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::RunId;
use crate::run::RunState;
use crate::stage::StageKind;

/// Which component produced an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    /// The interval trigger.
    Scheduler,
    /// The orchestrator state machine (including the watchdog).
    Pipeline,
    /// The translate stage.
    Translator,
    /// The analyze stage.
    Analyzer,
    /// The merge stage.
    Merger,
}

impl From<StageKind> for EventSource {
    fn from(kind: StageKind) -> Self {
        match kind {
            StageKind::Translate => EventSource::Translator,
            StageKind::Analyze => EventSource::Analyzer,
            StageKind::Merge => EventSource::Merger,
        }
    }
}

/// Broad classification of an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A stage attempt began.
    Start,
    /// Informational message (skips, lock reclamation, trigger no-ops).
    Log,
    /// Quantitative measurement (stage duration, output volume).
    Metric,
    /// A stage attempt succeeded.
    Success,
    /// A stage attempt or the whole run failed.
    Failure,
    /// Authoritative, complete [`RunState`] snapshot.
    StateChange,
}

/// Structured payload carried by some events, tagged so subscribers can match
/// exhaustively instead of probing an open-ended map.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    /// Complete run snapshot; every `state_change` event carries one so an
    /// observer reconstructing state from the stream alone never needs
    /// earlier events.
    StateChange {
        /// The full current run state.
        snapshot: RunState,
    },
    /// Detail for a failed stage attempt.
    StageFailure {
        /// Stage that failed.
        stage: StageKind,
        /// Exit code, when the process exited on its own.
        exit_code: Option<i32>,
        /// The attempt exceeded its wall-clock ceiling.
        timed_out: bool,
        /// The attempt went silent past the hang threshold.
        hung: bool,
        /// The process had to be terminated by the supervisor.
        terminated: bool,
        /// Last stderr lines, for operator display.
        stderr_tail: Vec<String>,
    },
    /// Stage completion measurements.
    StageMetric {
        /// Stage the measurement belongs to.
        stage: StageKind,
        /// Wall-clock duration of the attempt in milliseconds.
        duration_ms: u64,
        /// Output lines observed on stdout and stderr combined.
        output_lines: u64,
    },
    /// A stage was skipped because it had no eligible input.
    StageSkipped {
        /// Stage that was skipped.
        stage: StageKind,
        /// Why it was skipped.
        reason: String,
    },
    /// Partitions that failed inside an otherwise successful stage.
    PartialFailures {
        /// Stage reporting the sub-failures.
        stage: StageKind,
        /// Partition/instrument identifiers that failed.
        partitions: Vec<String>,
    },
    /// The run lock was cleared outside the normal release path.
    LockCleared {
        /// Run that held the lock, if the lock file was readable.
        holder: Option<RunId>,
        /// True for the operator escape hatch, false for stale-lock
        /// reclamation.
        forced: bool,
    },
}

/// One immutable entry in the pipeline log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Position in the single global log order. Strictly increasing.
    pub sequence: u64,
    /// Run this event belongs to.
    pub run_id: RunId,
    /// Producing component.
    pub source: EventSource,
    /// Broad classification.
    pub kind: EventKind,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// Optional human-readable message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<EventData>,
}

/// Event as produced by a component, before the bus assigns its sequence
/// number and timestamp.
#[derive(Clone, Debug)]
pub struct EventDraft {
    /// Run this event belongs to.
    pub run_id: RunId,
    /// Producing component.
    pub source: EventSource,
    /// Broad classification.
    pub kind: EventKind,
    /// Optional human-readable message.
    pub message: Option<String>,
    /// Optional structured payload.
    pub data: Option<EventData>,
}

impl EventDraft {
    /// Draft with no message or payload.
    pub fn new(run_id: RunId, source: EventSource, kind: EventKind) -> Self {
        Self {
            run_id,
            source,
            kind,
            message: None,
            data: None,
        }
    }

    /// Attach a human-readable message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach a structured payload.
    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = Some(data);
        self
    }
}

/// Sink any component can publish events through.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Assign the draft its sequence slot, persist it best-effort, and fan it
    /// out to live subscribers. Returns the finished event.
    async fn publish(&self, draft: EventDraft) -> Result<Event>;
}
