//! Configuration for the orchestration core.
//!
//! All fields carry defaults so an embedding system can adopt individual
//! knobs without supplying a full configuration payload.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::stage::StageKind;

/// Global knobs that tune the pipeline core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConveyorConfig {
    /// Per-stage timeouts, retry budgets, and output matchers.
    pub stages: StagesConfig,
    /// Periodic trigger settings.
    pub scheduler: SchedulerConfig,
    /// Stuck-run detection settings.
    pub watchdog: WatchdogConfig,
    /// Event bus sizing (ring buffer, subscriber queues, writer queue).
    pub bus: BusConfig,
    /// Run-lock placement.
    pub lock: LockConfig,
    /// How many completed run records to retain in memory.
    #[serde(default = "ConveyorConfig::default_run_history_limit")]
    pub run_history_limit: usize,
}

impl Default for ConveyorConfig {
    fn default() -> Self {
        Self {
            stages: StagesConfig::default(),
            scheduler: SchedulerConfig::default(),
            watchdog: WatchdogConfig::default(),
            bus: BusConfig::default(),
            lock: LockConfig::default(),
            run_history_limit: Self::default_run_history_limit(),
        }
    }
}

impl ConveyorConfig {
    const fn default_run_history_limit() -> usize {
        32
    }
}

/// Timeout, retry, and output-matching policy for one stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageConfig {
    /// Wall-clock ceiling for one stage attempt (seconds).
    pub timeout_secs: u64,
    /// Terminate the stage if no output line arrives for this long (seconds).
    pub hang_timeout_secs: u64,
    /// How many times a failed attempt is re-run before the run fails.
    pub max_retries: u32,
    /// Regex matched against output lines; a match counts as stage success
    /// even when the process exits non-zero or has to be reaped. Compatibility
    /// shim for legacy stage tools that are unreliable about exit codes.
    #[serde(default)]
    pub success_marker: Option<String>,
    /// Regex whose first capture group names a partition/instrument that
    /// failed inside an otherwise successful stage.
    #[serde(default)]
    pub partition_failure_pattern: Option<String>,
    /// Grace period after the success marker appears before the process is
    /// reaped for failing to exit on its own (milliseconds).
    pub marker_exit_grace_ms: u64,
    /// Grace period between the graceful termination signal and the forceful
    /// kill (milliseconds).
    pub term_grace_ms: u64,
}

impl StageConfig {
    fn long_running() -> Self {
        Self {
            timeout_secs: 3_600,
            hang_timeout_secs: 300,
            max_retries: 1,
            success_marker: None,
            partition_failure_pattern: None,
            marker_exit_grace_ms: 5_000,
            term_grace_ms: 5_000,
        }
    }

    fn quick() -> Self {
        Self {
            timeout_secs: 600,
            hang_timeout_secs: 120,
            ..Self::long_running()
        }
    }
}

/// Per-stage configuration bundle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Translation of raw input files (long-running, large data).
    pub translate: StageConfig,
    /// Analysis of translated output (long-running, large data).
    pub analyze: StageConfig,
    /// Merge of analysis results (quick).
    pub merge: StageConfig,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            translate: StageConfig::long_running(),
            analyze: StageConfig::long_running(),
            merge: StageConfig::quick(),
        }
    }
}

impl StagesConfig {
    /// Configuration for a specific stage.
    pub fn get(&self, kind: StageKind) -> &StageConfig {
        match kind {
            StageKind::Translate => &self.translate,
            StageKind::Analyze => &self.analyze,
            StageKind::Merge => &self.merge,
        }
    }

    /// Mutable access, used by embedders layering overrides on defaults.
    pub fn get_mut(&mut self, kind: StageKind) -> &mut StageConfig {
        match kind {
            StageKind::Translate => &mut self.translate,
            StageKind::Analyze => &mut self.analyze,
            StageKind::Merge => &mut self.merge,
        }
    }
}

/// Periodic trigger settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Whether the interval trigger runs at all. External (OS-level) timers
    /// can drive `start_run` instead without changing any contract.
    pub enabled: bool,
    /// Interval between trigger attempts (seconds).
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 900,
        }
    }
}

/// Stuck-run detection settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Cadence of the background check (seconds).
    pub check_interval_secs: u64,
    /// A non-terminal run with no progress event for this long is forced to
    /// failed (seconds). Must exceed the largest stage timeout.
    pub stall_ceiling_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            stall_ceiling_secs: 7_200,
        }
    }
}

/// Event bus sizing.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BusConfig {
    /// In-memory ring buffer capacity (events).
    pub ring_capacity: usize,
    /// Bounded delivery queue per subscriber; overflow disconnects that
    /// subscriber only.
    pub subscriber_queue_capacity: usize,
    /// Maximum events handed to a new subscriber as its initial snapshot.
    pub snapshot_limit: usize,
    /// Bounded hand-off queue to the durable-log writer task.
    pub writer_queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1_024,
            subscriber_queue_capacity: 256,
            snapshot_limit: 256,
            writer_queue_capacity: 1_024,
        }
    }
}

/// Run-lock placement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockConfig {
    /// Path of the lock file guarding single-flight execution.
    pub path: PathBuf,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("conveyor.lock"),
        }
    }
}
