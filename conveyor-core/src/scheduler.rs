//! Interval trigger.
//!
//! Fires `start_run` on a fixed cadence. The orchestrator's single-flight
//! check makes an overlapping tick a no-op, so the scheduler carries no state
//! of its own; deployments driving runs from an external timer can disable it
//! without losing any contract.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::orchestrator::{Orchestrator, StartOutcome};
use crate::run::RunTrigger;

pub(crate) fn spawn(
    orchestrator: Arc<Orchestrator>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; consume it so the first
        // trigger lands one full interval after startup.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            match orchestrator.start_run(RunTrigger::Scheduled).await {
                Ok(StartOutcome::Started(run_id)) => {
                    tracing::info!(target: "conveyor::scheduler", run = %run_id, "scheduled run started");
                }
                Ok(StartOutcome::AlreadyRunning) => {
                    tracing::debug!(
                        target: "conveyor::scheduler",
                        "scheduled trigger skipped, a run is already in progress"
                    );
                }
                Err(err) => {
                    tracing::warn!(target: "conveyor::scheduler", error = %err, "scheduled trigger failed");
                }
            }
        }
    })
}
