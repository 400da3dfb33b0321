//! Pipeline orchestrator.
//!
//! Owns the single [`RunState`], sequences the translate, analyze, and merge
//! stages, and enforces single-flight execution through the run lock. All
//! observable progress goes out through the event bus; `state_change` events
//! carry the complete snapshot so observers never reconstruct state from
//! deltas.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, EventStore, EventSubscription, NullEventStore};
use crate::config::ConveyorConfig;
use crate::error::{ConveyorError, Result};
use crate::events::{Event, EventData, EventDraft, EventKind, EventPublisher, EventSource};
use crate::ids::RunId;
use crate::lock::{LockMetadata, ProcessProbe, RunLock, SystemProcessProbe};
use crate::run::{RunError, RunPhase, RunState, RunTrigger};
use crate::stage::{CommandPlan, InputProbe, StageKind, StageRunner};
use crate::supervisor::StageResult;
use crate::{scheduler, watchdog};

/// Outcome of a start request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartOutcome {
    /// A new run was started.
    Started(RunId),
    /// A run is already in flight (in this process or under a foreign lock);
    /// the request was dropped, not queued.
    AlreadyRunning,
}

/// State shared between the orchestrator, the run driver task, and the
/// watchdog.
pub(crate) struct RunShared {
    bus: Arc<EventBus>,
    lock: Arc<RunLock>,
    current: Mutex<RunState>,
    history: Mutex<VecDeque<RunState>>,
    // Cancellation token for the in-flight run; None when no run is active.
    active_cancel: Mutex<Option<CancellationToken>>,
    stop_reason: Mutex<Option<String>>,
    history_limit: usize,
}

impl RunShared {
    pub(crate) async fn snapshot(&self) -> RunState {
        self.current.lock().await.clone()
    }

    async fn publish(&self, draft: EventDraft) {
        if let Err(err) = self.bus.publish(draft).await {
            tracing::warn!(target: "conveyor::orchestrator", error = %err, "failed to publish event");
        }
    }

    async fn publish_state(&self, snapshot: RunState) {
        let draft =
            EventDraft::new(snapshot.run_id, EventSource::Pipeline, EventKind::StateChange)
                .with_data(EventData::StateChange { snapshot });
        self.publish(draft).await;
    }

    /// Apply a phase transition and broadcast the resulting snapshot. Returns
    /// `None` when the run is already terminal, in which case nothing was
    /// changed or published.
    async fn transition(&self, phase: RunPhase) -> Option<RunState> {
        let snapshot = {
            let mut current = self.current.lock().await;
            if !current.transition(phase) {
                return None;
            }
            current.clone()
        };
        self.publish_state(snapshot.clone()).await;
        Some(snapshot)
    }

    /// Archive a finished run, release its lock, and clear the active slot.
    async fn finalize(&self, snapshot: &RunState) {
        {
            let mut history = self.history.lock().await;
            history.push_front(snapshot.clone());
            while history.len() > self.history_limit.max(1) {
                history.pop_back();
            }
        }
        if let Err(err) = self.lock.release(snapshot.run_id).await {
            tracing::warn!(
                target: "conveyor::orchestrator",
                run = %snapshot.run_id,
                error = %err,
                "failed to release run lock"
            );
        }
        *self.active_cancel.lock().await = None;
        *self.stop_reason.lock().await = None;
    }

    /// Force the in-flight run to `Failed`, then cancel its driver. Applied
    /// before the cancellation so the driver's own stop path loses the race
    /// against the write-once terminal phase. Returns `false` when there was
    /// no run to fail.
    pub(crate) async fn force_fail(&self, reason: String, error: RunError) -> bool {
        let cancel = self.active_cancel.lock().await.clone();
        let snapshot = {
            let mut current = self.current.lock().await;
            if matches!(current.phase, RunPhase::Idle) || current.is_terminal() {
                return false;
            }
            current.error = Some(error);
            if !current.transition(RunPhase::Failed {
                reason: reason.clone(),
            }) {
                return false;
            }
            current.clone()
        };
        self.publish(
            EventDraft::new(snapshot.run_id, EventSource::Pipeline, EventKind::Failure)
                .with_message(reason),
        )
        .await;
        self.publish_state(snapshot.clone()).await;
        self.finalize(&snapshot).await;
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        true
    }
}

/// Builder for [`Orchestrator`]. The input probe and command plan have no
/// useful defaults and must be supplied.
pub struct OrchestratorBuilder {
    config: ConveyorConfig,
    store: Option<Arc<dyn EventStore>>,
    process_probe: Option<Arc<dyn ProcessProbe>>,
    input_probe: Option<Arc<dyn InputProbe>>,
    command_plan: Option<Arc<dyn CommandPlan>>,
}

impl std::fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("has_store", &self.store.is_some())
            .field("has_input_probe", &self.input_probe.is_some())
            .field("has_command_plan", &self.command_plan.is_some())
            .finish()
    }
}

impl OrchestratorBuilder {
    fn new(config: ConveyorConfig) -> Self {
        Self {
            config,
            store: None,
            process_probe: None,
            input_probe: None,
            command_plan: None,
        }
    }

    /// Durable event log. Defaults to [`NullEventStore`] (live feed only).
    pub fn with_event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Liveness probe for lock holders. Defaults to the operating system.
    pub fn with_process_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.process_probe = Some(probe);
        self
    }

    /// Source of per-stage pending-input counts. Required.
    pub fn with_input_probe(mut self, probe: Arc<dyn InputProbe>) -> Self {
        self.input_probe = Some(probe);
        self
    }

    /// Source of per-stage command invocations. Required.
    pub fn with_command_plan(mut self, plan: Arc<dyn CommandPlan>) -> Self {
        self.command_plan = Some(plan);
        self
    }

    /// Assemble the orchestrator. Fails when a required collaborator is
    /// missing or a configured stage regex does not compile.
    pub async fn build(self) -> Result<Arc<Orchestrator>> {
        let input_probe = self
            .input_probe
            .ok_or_else(|| ConveyorError::Internal("orchestrator requires an input probe".into()))?;
        let command_plan = self
            .command_plan
            .ok_or_else(|| ConveyorError::Internal("orchestrator requires a command plan".into()))?;
        let store = self.store.unwrap_or_else(|| Arc::new(NullEventStore));
        let process_probe = self
            .process_probe
            .unwrap_or_else(|| Arc::new(SystemProcessProbe));

        let bus = Arc::new(EventBus::new(store, self.config.bus).await);
        let lock = Arc::new(RunLock::new(self.config.lock.path.clone(), process_probe));

        let mut runners = Vec::with_capacity(StageKind::all().len());
        for kind in StageKind::all() {
            runners.push(StageRunner::new(
                kind,
                self.config.stages.get(kind).clone(),
                Arc::clone(&input_probe),
                Arc::clone(&command_plan),
                Arc::clone(&bus),
            )?);
        }

        let shared = Arc::new(RunShared {
            bus,
            lock,
            current: Mutex::new(RunState::idle()),
            history: Mutex::new(VecDeque::new()),
            active_cancel: Mutex::new(None),
            stop_reason: Mutex::new(None),
            history_limit: self.config.run_history_limit,
        });

        Ok(Arc::new(Orchestrator {
            config: self.config,
            shared,
            runners,
            shutdown: CancellationToken::new(),
            driver: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        }))
    }
}

/// Central coordinator for pipeline runs.
pub struct Orchestrator {
    config: ConveyorConfig,
    shared: Arc<RunShared>,
    runners: Vec<StageRunner>,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    /// Start building an orchestrator over `config`.
    pub fn builder(config: ConveyorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Spawn the background services: the watchdog, and the interval
    /// scheduler when enabled. Also sweeps a stale lock left behind by a
    /// crashed predecessor, announcing the reclamation on the bus.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.shared.lock.is_stale().await? {
            let meta = self.shared.lock.force_clear().await?;
            let holder = meta.as_ref().map(|m| m.holder_run_id);
            tracing::warn!(
                target: "conveyor::orchestrator",
                holder = ?holder,
                "removed stale run lock left by a dead process"
            );
            self.shared
                .publish(
                    EventDraft::new(
                        holder.unwrap_or_else(RunId::nil),
                        EventSource::Pipeline,
                        EventKind::Log,
                    )
                    .with_message("stale run lock from a dead process was removed")
                    .with_data(EventData::LockCleared {
                        holder,
                        forced: false,
                    }),
                )
                .await;
        }

        let mut background = self.background.lock().await;
        background.push(watchdog::spawn(
            Arc::clone(&self.shared),
            self.config.watchdog,
            self.shutdown.child_token(),
        ));
        if self.config.scheduler.enabled {
            background.push(scheduler::spawn(
                Arc::clone(self),
                self.config.scheduler,
                self.shutdown.child_token(),
            ));
        }
        Ok(())
    }

    /// Request a pipeline run. At most one run is in flight at a time; a
    /// request arriving while one is active is dropped (with a log event),
    /// never queued.
    pub async fn start_run(&self, trigger: RunTrigger) -> Result<StartOutcome> {
        let source = match trigger {
            RunTrigger::Scheduled => EventSource::Scheduler,
            RunTrigger::Manual => EventSource::Pipeline,
        };
        let run_id = RunId::new();

        let cancel = {
            let mut active = self.shared.active_cancel.lock().await;
            if active.is_some() {
                let current = self.shared.snapshot().await;
                self.shared
                    .publish(
                        EventDraft::new(current.run_id, source, EventKind::Log)
                            .with_message("run request skipped, a run is already in progress"),
                    )
                    .await;
                return Ok(StartOutcome::AlreadyRunning);
            }
            if !self.shared.lock.try_acquire(run_id).await? {
                let holder = self
                    .shared
                    .lock
                    .current()
                    .await?
                    .map(|meta| meta.holder_run_id);
                self.shared
                    .publish(
                        EventDraft::new(holder.unwrap_or(run_id), source, EventKind::Log)
                            .with_message(
                                "run request skipped, pipeline lock held by another process",
                            ),
                    )
                    .await;
                return Ok(StartOutcome::AlreadyRunning);
            }
            let cancel = self.shutdown.child_token();
            *active = Some(cancel.clone());
            cancel
        };

        let state = RunState::begin(run_id, trigger);
        *self.shared.current.lock().await = state.clone();
        self.shared.publish_state(state).await;
        tracing::info!(
            target: "conveyor::orchestrator",
            run = %run_id,
            ?trigger,
            "pipeline run started"
        );

        let handle = tokio::spawn(drive_run(
            Arc::clone(&self.shared),
            self.runners.clone(),
            run_id,
            cancel,
        ));
        *self.driver.lock().await = Some(handle);

        Ok(StartOutcome::Started(run_id))
    }

    /// Cancel the in-flight run, recording `reason`. Returns `false` when no
    /// run was active.
    pub async fn stop_run(&self, reason: impl Into<String>) -> bool {
        let cancel = self.shared.active_cancel.lock().await.clone();
        match cancel {
            Some(token) => {
                *self.shared.stop_reason.lock().await = Some(reason.into());
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the run lock unconditionally. Operator escape hatch for a lock
    /// wedged by circumstances the staleness probe cannot see; announced on
    /// the bus because misuse can break single-flight.
    pub async fn force_clear_lock(&self) -> Result<Option<LockMetadata>> {
        let meta = self.shared.lock.force_clear().await?;
        let holder = meta.as_ref().map(|m| m.holder_run_id);
        tracing::warn!(
            target: "conveyor::orchestrator",
            holder = ?holder,
            "run lock force-cleared by operator"
        );
        self.shared
            .publish(
                EventDraft::new(
                    holder.unwrap_or_else(RunId::nil),
                    EventSource::Pipeline,
                    EventKind::Log,
                )
                .with_message("run lock force-cleared")
                .with_data(EventData::LockCleared {
                    holder,
                    forced: true,
                }),
            )
            .await;
        Ok(meta)
    }

    /// Snapshot of the current (or most recently finished) run.
    pub async fn get_current_state(&self) -> RunState {
        self.shared.snapshot().await
    }

    /// Completed runs, newest first, bounded by the configured history limit.
    pub async fn recent_runs(&self) -> Vec<RunState> {
        self.shared.history.lock().await.iter().cloned().collect()
    }

    /// Attach a new event observer (bounded snapshot plus live feed).
    pub async fn subscribe_to_events(&self) -> EventSubscription {
        self.shared.bus.subscribe().await
    }

    /// Replay events after `sequence` from the durable log.
    pub async fn replay_events_since(&self, sequence: u64) -> Result<Vec<Event>> {
        self.shared.bus.replay_since(sequence).await
    }

    /// The underlying event bus, for embedders wiring their own publishers.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    /// Stop background services, cancel any in-flight run, and flush the
    /// durable event log.
    pub async fn shutdown(&self) {
        self.stop_run("shutting down").await;
        self.shutdown.cancel();

        if let Some(handle) = self.driver.lock().await.take()
            && tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
        {
            tracing::warn!(
                target: "conveyor::orchestrator",
                "run driver did not stop within the shutdown grace period"
            );
        }
        for handle in self.background.lock().await.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    target: "conveyor::orchestrator",
                    "background task did not stop within the shutdown grace period"
                );
            }
        }
        self.shared.bus.flush().await;
    }
}

/// Sequence the stages of one run to completion.
async fn drive_run(
    shared: Arc<RunShared>,
    runners: Vec<StageRunner>,
    run_id: RunId,
    cancel: CancellationToken,
) {
    for runner in &runners {
        // The watchdog may have forced the run terminal between stages.
        if shared.snapshot().await.is_terminal() {
            return;
        }
        if cancel.is_cancelled() {
            stop(&shared, run_id).await;
            return;
        }

        match runner.should_run().await {
            Ok(true) => {}
            Ok(false) => {
                let kind = runner.kind();
                shared
                    .publish(
                        EventDraft::new(run_id, kind.into(), EventKind::Log)
                            .with_message(format!("{kind} skipped, no pending input"))
                            .with_data(EventData::StageSkipped {
                                stage: kind,
                                reason: "no pending input".into(),
                            }),
                    )
                    .await;
                continue;
            }
            Err(err) => {
                let error = RunError {
                    stage: Some(runner.kind()),
                    exit_code: None,
                    message: err.to_string(),
                    timed_out: false,
                    hung: false,
                };
                fail(&shared, run_id, error, err.to_string()).await;
                return;
            }
        }

        let mut attempt: u32 = 0;
        loop {
            if shared
                .transition(RunPhase::RunningStage {
                    stage: runner.kind(),
                })
                .await
                .is_none()
            {
                return;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    stop(&shared, run_id).await;
                    return;
                }
                outcome = runner.run(run_id, attempt) => outcome,
            };

            let error = match outcome {
                Ok(result) if result.success => {
                    shared.current.lock().await.retries.reset(runner.kind());
                    break;
                }
                Ok(result) => RunError {
                    stage: Some(runner.kind()),
                    exit_code: result.exit_code,
                    message: failure_message(&result),
                    timed_out: result.timed_out,
                    hung: result.hung,
                },
                Err(err) => RunError {
                    stage: Some(runner.kind()),
                    exit_code: None,
                    message: err.to_string(),
                    timed_out: false,
                    hung: false,
                },
            };

            if attempt < runner.max_retries() {
                attempt += 1;
                shared.current.lock().await.retries.bump(runner.kind());
                if shared
                    .transition(RunPhase::Retrying {
                        stage: runner.kind(),
                        attempt,
                    })
                    .await
                    .is_none()
                {
                    return;
                }
                continue;
            }

            let reason = format!(
                "{} failed after {} attempt(s): {}",
                runner.kind(),
                attempt + 1,
                error.message
            );
            fail(&shared, run_id, error, reason).await;
            return;
        }
    }

    if let Some(snapshot) = shared.transition(RunPhase::Success).await {
        shared
            .publish(
                EventDraft::new(run_id, EventSource::Pipeline, EventKind::Success)
                    .with_message("pipeline run completed"),
            )
            .await;
        shared.finalize(&snapshot).await;
        tracing::info!(target: "conveyor::orchestrator", run = %run_id, "pipeline run succeeded");
    }
}

fn failure_message(result: &StageResult) -> String {
    if result.timed_out {
        format!("{} exceeded its wall-clock timeout", result.stage)
    } else if result.hung {
        format!("{} produced no output past the hang threshold", result.stage)
    } else {
        format!("{} exited with code {:?}", result.stage, result.exit_code)
    }
}

async fn fail(shared: &Arc<RunShared>, run_id: RunId, error: RunError, reason: String) {
    shared.current.lock().await.error = Some(error);
    if let Some(snapshot) = shared
        .transition(RunPhase::Failed {
            reason: reason.clone(),
        })
        .await
    {
        shared
            .publish(
                EventDraft::new(run_id, EventSource::Pipeline, EventKind::Failure)
                    .with_message(reason.clone()),
            )
            .await;
        shared.finalize(&snapshot).await;
        tracing::error!(target: "conveyor::orchestrator", run = %run_id, reason, "pipeline run failed");
    }
}

async fn stop(shared: &Arc<RunShared>, run_id: RunId) {
    let reason = shared
        .stop_reason
        .lock()
        .await
        .take()
        .unwrap_or_else(|| "stop requested".into());
    if let Some(snapshot) = shared.transition(RunPhase::Stopped).await {
        shared
            .publish(
                EventDraft::new(run_id, EventSource::Pipeline, EventKind::Log)
                    .with_message(format!("run stopped: {reason}")),
            )
            .await;
        shared.finalize(&snapshot).await;
        tracing::info!(target: "conveyor::orchestrator", run = %run_id, reason, "pipeline run stopped");
    }
}
