//! Stage definitions and per-stage runners.
//!
//! A runner is a thin adapter: it asks the input probe whether the stage has
//! anything to do, asks the command plan how to invoke the stage, delegates
//! execution to the [`ProcessSupervisor`], and publishes the stage-scoped
//! events. It never touches input/output file lifecycle; deletion after
//! confirmed downstream success is an external policy.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::config::StageConfig;
use crate::error::{ConveyorError, Result};
use crate::events::{EventData, EventDraft, EventKind, EventPublisher};
use crate::ids::RunId;
use crate::supervisor::{ExecSpec, ProcessSupervisor, StageResult};

/// The three pipeline stages, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Translate raw input files into the analysis format.
    Translate,
    /// Analyze translated files.
    Analyze,
    /// Merge analysis results.
    Merge,
}

impl StageKind {
    /// All stages in pipeline order.
    pub fn all() -> [StageKind; 3] {
        [StageKind::Translate, StageKind::Analyze, StageKind::Merge]
    }

    /// Stable lowercase name, matching the serialized form.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Translate => "translate",
            StageKind::Analyze => "analyze",
            StageKind::Merge => "merge",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fully resolved invocation for one stage attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageCommand {
    /// Executable to launch.
    pub program: String,
    /// Arguments, already split.
    pub args: Vec<String>,
    /// Working directory, when the stage cares.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    #[serde(default)]
    pub envs: Vec<(String, String)>,
}

/// Side-effect-free query answering whether a stage has eligible input.
#[async_trait]
pub trait InputProbe: Send + Sync {
    /// Number of unprocessed input items waiting for `stage`.
    async fn pending_input(&self, stage: StageKind) -> Result<u64>;
}

/// Pure per-stage command construction, supplied by the embedding system.
#[async_trait]
pub trait CommandPlan: Send + Sync {
    /// Build the invocation for `stage` within run `run_id`.
    async fn command_for(&self, stage: StageKind, run_id: RunId) -> Result<StageCommand>;
}

/// Executes one stage on behalf of the orchestrator.
#[derive(Clone)]
pub struct StageRunner {
    kind: StageKind,
    config: StageConfig,
    success_marker: Option<Regex>,
    partition_failure: Option<Regex>,
    probe: Arc<dyn InputProbe>,
    plan: Arc<dyn CommandPlan>,
    bus: Arc<EventBus>,
    supervisor: ProcessSupervisor,
}

impl fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRunner")
            .field("kind", &self.kind)
            .field("config", &self.config)
            .finish()
    }
}

impl StageRunner {
    /// Build a runner, compiling the configured output matchers once.
    pub fn new(
        kind: StageKind,
        config: StageConfig,
        probe: Arc<dyn InputProbe>,
        plan: Arc<dyn CommandPlan>,
        bus: Arc<EventBus>,
    ) -> Result<Self> {
        let success_marker = compile(kind, "success_marker", config.success_marker.as_deref())?;
        let partition_failure = compile(
            kind,
            "partition_failure_pattern",
            config.partition_failure_pattern.as_deref(),
        )?;
        Ok(Self {
            kind,
            config,
            success_marker,
            partition_failure,
            probe,
            plan,
            bus,
            supervisor: ProcessSupervisor::default(),
        })
    }

    /// Stage this runner executes.
    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Retry budget for this stage.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Whether the stage has eligible input. Pure query, no side effects.
    pub async fn should_run(&self) -> Result<bool> {
        let pending = self
            .probe
            .pending_input(self.kind)
            .await
            .map_err(|err| ConveyorError::Collaborator {
                stage: self.kind,
                message: format!("input probe failed: {err}"),
            })?;
        Ok(pending > 0)
    }

    /// Execute one attempt of the stage, publishing its start/outcome events.
    /// Per-partition sub-failures are extracted from the output stream and
    /// reported as a non-fatal partial-failure event.
    pub async fn run(&self, run_id: RunId, attempt: u32) -> Result<StageResult> {
        let source = self.kind.into();

        self.publish(
            EventDraft::new(run_id, source, EventKind::Start)
                .with_message(format!("{} starting (attempt {})", self.kind, attempt + 1)),
        )
        .await;

        let command = self
            .plan
            .command_for(self.kind, run_id)
            .await
            .map_err(|err| ConveyorError::Collaborator {
                stage: self.kind,
                message: format!("command plan failed: {err}"),
            })?;

        let spec = ExecSpec {
            stage: self.kind,
            timeout: Duration::from_secs(self.config.timeout_secs),
            hang_timeout: Duration::from_secs(self.config.hang_timeout_secs),
            success_marker: self.success_marker.clone(),
            marker_exit_grace: Duration::from_millis(self.config.marker_exit_grace_ms),
            term_grace: Duration::from_millis(self.config.term_grace_ms),
        };

        let mut failed_partitions: Vec<String> = Vec::new();
        let partition_failure = self.partition_failure.as_ref();
        let stage = self.kind;

        let mut result = self
            .supervisor
            .execute(&command, &spec, |_, line| {
                tracing::trace!(target: "conveyor::stage", %stage, line, "stage output");
                if let Some(pattern) = partition_failure
                    && let Some(captures) = pattern.captures(line)
                {
                    let partition = captures
                        .get(1)
                        .map(|m| m.as_str())
                        .unwrap_or_else(|| captures.get(0).map(|m| m.as_str()).unwrap_or(line));
                    failed_partitions.push(partition.to_string());
                }
            })
            .await?;
        result.failed_partitions = failed_partitions;

        self.publish(
            EventDraft::new(run_id, source, EventKind::Metric).with_data(EventData::StageMetric {
                stage: self.kind,
                duration_ms: result.duration_ms,
                output_lines: result.output_lines,
            }),
        )
        .await;

        if !result.failed_partitions.is_empty() {
            self.publish(
                EventDraft::new(run_id, source, EventKind::Log)
                    .with_message(format!(
                        "{} reported {} failed partition(s)",
                        self.kind,
                        result.failed_partitions.len()
                    ))
                    .with_data(EventData::PartialFailures {
                        stage: self.kind,
                        partitions: result.failed_partitions.clone(),
                    }),
            )
            .await;
        }

        if result.success {
            let message = if result.terminated {
                format!("{} succeeded via marker, process reaped", self.kind)
            } else {
                format!("{} succeeded", self.kind)
            };
            self.publish(EventDraft::new(run_id, source, EventKind::Success).with_message(message))
                .await;
        } else {
            let message = if result.timed_out {
                format!(
                    "{} timed out after {} ms",
                    self.kind, result.duration_ms
                )
            } else if result.hung {
                format!(
                    "{} produced no output for {} s and was terminated",
                    self.kind, self.config.hang_timeout_secs
                )
            } else {
                format!(
                    "{} failed with exit code {:?}",
                    self.kind, result.exit_code
                )
            };
            self.publish(
                EventDraft::new(run_id, source, EventKind::Failure)
                    .with_message(message)
                    .with_data(EventData::StageFailure {
                        stage: self.kind,
                        exit_code: result.exit_code,
                        timed_out: result.timed_out,
                        hung: result.hung,
                        terminated: result.terminated,
                        stderr_tail: result.stderr_tail.clone(),
                    }),
            )
            .await;
        }

        Ok(result)
    }

    async fn publish(&self, draft: EventDraft) {
        if let Err(err) = self.bus.publish(draft).await {
            tracing::warn!(target: "conveyor::stage", stage = %self.kind, error = %err, "failed to publish stage event");
        }
    }
}

fn compile(kind: StageKind, field: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    match pattern {
        None => Ok(None),
        Some(raw) => Regex::new(raw).map(Some).map_err(|err| {
            ConveyorError::Collaborator {
                stage: kind,
                message: format!("invalid {field} regex: {err}"),
            }
        }),
    }
}
