//! Stuck-run detection.
//!
//! The supervisor's per-attempt timeouts cover a misbehaving child process;
//! the watchdog covers everything else. A non-terminal run whose last
//! progress timestamp is older than the stall ceiling is forced to `Failed`,
//! its lock released, and its driver cancelled. The forced transition is
//! applied before the cancellation so the driver cannot overwrite the
//! outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogConfig;
use crate::orchestrator::RunShared;
use crate::run::{RunError, RunPhase};

pub(crate) fn spawn(
    shared: Arc<RunShared>,
    config: WatchdogConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config.check_interval_secs.max(1));
        let ceiling = i64::try_from(config.stall_ceiling_secs).unwrap_or(i64::MAX);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let snapshot = shared.snapshot().await;
            if matches!(snapshot.phase, RunPhase::Idle) || snapshot.is_terminal() {
                continue;
            }

            let stalled_secs = Utc::now()
                .signed_duration_since(snapshot.updated_at)
                .num_seconds();
            if stalled_secs < ceiling {
                continue;
            }

            tracing::error!(
                target: "conveyor::watchdog",
                run = %snapshot.run_id,
                stalled_secs,
                stage = ?snapshot.current_stage,
                "run made no progress past the stall ceiling, forcing failure"
            );
            let reason = format!("watchdog: no progress for {stalled_secs} s");
            let error = RunError {
                stage: snapshot.current_stage,
                exit_code: None,
                message: reason.clone(),
                timed_out: true,
                hung: false,
            };
            shared.force_fail(reason, error).await;
        }
    })
}
