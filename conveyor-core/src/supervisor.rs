//! Child-process supervision for pipeline stages.
//!
//! Runs one external command, streams its combined stdout/stderr line by
//! line, and enforces two independent limits: a wall-clock timeout and a
//! no-output hang threshold. Either one terminates the process (graceful
//! signal first, forceful kill after a grace window).
//!
//! A configurable success-marker matcher doubles as an alternate completion
//! signal: some legacy stage tools print their completion line and then fail
//! to exit, or exit with a bogus status. The marker is authoritative; a
//! process reaped after printing it is still recorded as successful.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{ConveyorError, Result};
use crate::stage::{StageCommand, StageKind};

/// Which stream a captured line arrived on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamKind {
    /// Child stdout.
    Stdout,
    /// Child stderr.
    Stderr,
}

/// Limits and matchers for one stage attempt.
#[derive(Clone, Debug)]
pub struct ExecSpec {
    /// Stage being executed, for errors and logging.
    pub stage: StageKind,
    /// Wall-clock ceiling for the whole attempt.
    pub timeout: Duration,
    /// Terminate if no output line arrives for this long.
    pub hang_timeout: Duration,
    /// Line pattern that counts as completion regardless of exit code.
    pub success_marker: Option<Regex>,
    /// How long after the marker appears the process may keep running before
    /// it is reaped.
    pub marker_exit_grace: Duration,
    /// Window between the graceful signal and the forceful kill.
    pub term_grace: Duration,
}

/// Structured outcome of one stage attempt.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StageResult {
    /// Stage this attempt belonged to.
    pub stage: StageKind,
    /// Exit code zero or success marker observed.
    pub success: bool,
    /// The success marker was observed in output.
    pub marker_seen: bool,
    /// Exit code, when the process exited (on its own or after the graceful
    /// signal).
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the attempt in milliseconds.
    pub duration_ms: u64,
    /// Total output lines observed across both streams.
    pub output_lines: u64,
    /// Last stdout lines, bounded.
    pub stdout_tail: Vec<String>,
    /// Last stderr lines, bounded.
    pub stderr_tail: Vec<String>,
    /// The wall-clock ceiling was exceeded.
    pub timed_out: bool,
    /// The no-output threshold was exceeded.
    pub hung: bool,
    /// The supervisor had to terminate the process.
    pub terminated: bool,
    /// Partition identifiers that failed inside the stage. Filled in by the
    /// stage runner from the output stream; always empty here.
    pub failed_partitions: Vec<String>,
}

/// Runs one external command under timeout and hang supervision.
#[derive(Clone, Debug)]
pub struct ProcessSupervisor {
    tail_limit: usize,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(50)
    }
}

/// Why the supervision loop stopped consuming output.
enum LoopExit {
    /// Both streams reached EOF; the child is exiting or closed its pipes.
    Eof,
    /// The wall-clock ceiling fired.
    TimedOut,
    /// The no-output threshold fired.
    Hung,
    /// The marker grace window elapsed without the child exiting.
    MarkerGraceExpired,
}

impl ProcessSupervisor {
    /// Supervisor keeping the last `tail_limit` lines of each stream.
    pub fn new(tail_limit: usize) -> Self {
        Self {
            tail_limit: tail_limit.max(1),
        }
    }

    /// Run `command` to completion under `spec`, invoking `on_output` for
    /// every line as it arrives. The callback sees live progress; output is
    /// never buffered and returned only at the end.
    pub async fn execute(
        &self,
        command: &StageCommand,
        spec: &ExecSpec,
        mut on_output: impl FnMut(StreamKind, &str) + Send,
    ) -> Result<StageResult> {
        let started = Instant::now();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &command.envs {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| ConveyorError::Spawn {
            stage: spec.stage,
            source,
        })?;

        let (line_tx, mut line_rx) = mpsc::channel::<(StreamKind, String)>(256);
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, StreamKind::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, StreamKind::Stderr, line_tx);
        } else {
            drop(line_tx);
        }

        let deadline = started + spec.timeout;
        let mut hang_deadline = started + spec.hang_timeout;
        let mut marker_deadline: Option<Instant> = None;
        let mut marker_seen = false;

        let mut stdout_tail: VecDeque<String> = VecDeque::new();
        let mut stderr_tail: VecDeque<String> = VecDeque::new();
        let mut output_lines = 0u64;

        let exit = loop {
            let mut wake = deadline.min(hang_deadline);
            if let Some(marker) = marker_deadline {
                wake = wake.min(marker);
            }

            tokio::select! {
                line = line_rx.recv() => match line {
                    Some((stream, text)) => {
                        output_lines += 1;
                        hang_deadline = Instant::now() + spec.hang_timeout;
                        on_output(stream, &text);

                        if !marker_seen
                            && let Some(marker) = &spec.success_marker
                            && marker.is_match(&text)
                        {
                            marker_seen = true;
                            marker_deadline = Some(Instant::now() + spec.marker_exit_grace);
                            tracing::debug!(
                                target: "conveyor::supervisor",
                                stage = %spec.stage,
                                "success marker observed, arming exit grace"
                            );
                        }

                        let tail = match stream {
                            StreamKind::Stdout => &mut stdout_tail,
                            StreamKind::Stderr => &mut stderr_tail,
                        };
                        tail.push_back(text);
                        while tail.len() > self.tail_limit {
                            tail.pop_front();
                        }
                    }
                    None => break LoopExit::Eof,
                },
                _ = tokio::time::sleep_until(wake) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break LoopExit::TimedOut;
                    }
                    if marker_deadline.is_some_and(|m| now >= m) {
                        break LoopExit::MarkerGraceExpired;
                    }
                    if now >= hang_deadline {
                        break LoopExit::Hung;
                    }
                    // Spurious wakeup from timer granularity; re-arm.
                }
            }
        };

        let mut timed_out = false;
        let mut hung = false;
        let mut terminated = false;

        let exit_code = match exit {
            LoopExit::Eof => {
                // Streams are closed but the child may still linger; give it
                // a bounded window to exit before reaping.
                let grace = if marker_seen {
                    spec.marker_exit_grace
                } else {
                    deadline
                        .duration_since(Instant::now())
                        .max(spec.term_grace)
                };
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => status.code(),
                    Ok(Err(err)) => {
                        tracing::warn!(
                            target: "conveyor::supervisor",
                            stage = %spec.stage,
                            error = %err,
                            "wait on stage child failed"
                        );
                        None
                    }
                    Err(_) => {
                        terminated = true;
                        if !marker_seen {
                            timed_out = true;
                        }
                        terminate(&mut child, spec.term_grace).await
                    }
                }
            }
            LoopExit::TimedOut => {
                timed_out = true;
                terminated = true;
                terminate(&mut child, spec.term_grace).await
            }
            LoopExit::Hung => {
                hung = true;
                terminated = true;
                terminate(&mut child, spec.term_grace).await
            }
            LoopExit::MarkerGraceExpired => {
                terminated = true;
                terminate(&mut child, spec.term_grace).await
            }
        };

        let success = marker_seen || matches!(exit_code, Some(0) if !timed_out && !hung);
        let duration_ms = started.elapsed().as_millis() as u64;

        if terminated {
            tracing::warn!(
                target: "conveyor::supervisor",
                stage = %spec.stage,
                timed_out,
                hung,
                marker_seen,
                duration_ms,
                "stage process terminated by supervisor"
            );
        }

        Ok(StageResult {
            stage: spec.stage,
            success,
            marker_seen,
            exit_code,
            duration_ms,
            output_lines,
            stdout_tail: stdout_tail.into_iter().collect(),
            stderr_tail: stderr_tail.into_iter().collect(),
            timed_out,
            hung,
            terminated,
            failed_partitions: Vec::new(),
        })
    }
}

fn spawn_reader<R>(stream: R, kind: StreamKind, tx: mpsc::Sender<(StreamKind, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send((kind, line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(
                        target: "conveyor::supervisor",
                        error = %err,
                        "stage output read error"
                    );
                    break;
                }
            }
        }
    });
}

/// Graceful signal first, forceful kill after the grace window. Returns the
/// exit code when the graceful path yielded one.
async fn terminate(child: &mut Child, grace: Duration) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: signalling a pid we own; failure is handled by the kill
        // fallback below.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
            return status.code();
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(err) = child.start_kill() {
        tracing::warn!(target: "conveyor::supervisor", error = %err, "force kill failed");
    }
    match child.wait().await {
        Ok(status) => status.code(),
        Err(err) => {
            tracing::warn!(target: "conveyor::supervisor", error = %err, "wait after kill failed");
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> StageCommand {
        StageCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            cwd: None,
            envs: Vec::new(),
        }
    }

    fn spec(timeout_ms: u64, hang_ms: u64, marker: Option<&str>) -> ExecSpec {
        ExecSpec {
            stage: StageKind::Translate,
            timeout: Duration::from_millis(timeout_ms),
            hang_timeout: Duration::from_millis(hang_ms),
            success_marker: marker.map(|m| Regex::new(m).expect("marker regex")),
            marker_exit_grace: Duration::from_millis(200),
            term_grace: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn clean_exit_zero_is_success() {
        let supervisor = ProcessSupervisor::default();
        let mut lines = Vec::new();
        let result = supervisor
            .execute(
                &sh("echo one; echo two >&2; echo three"),
                &spec(5_000, 5_000, None),
                |stream, line| lines.push((stream, line.to_string())),
            )
            .await
            .expect("execute");

        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
        assert!(!result.hung);
        assert!(!result.terminated);
        assert_eq!(result.output_lines, 3);
        assert_eq!(result.stdout_tail, vec!["one", "three"]);
        assert_eq!(result.stderr_tail, vec!["two"]);
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn nonzero_exit_is_failure_with_stderr_tail() {
        let supervisor = ProcessSupervisor::default();
        let result = supervisor
            .execute(
                &sh("echo broken input >&2; exit 3"),
                &spec(5_000, 5_000, None),
                |_, _| {},
            )
            .await
            .expect("execute");

        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr_tail, vec!["broken input"]);
    }

    #[tokio::test]
    async fn silent_process_is_reaped_as_hang() {
        let supervisor = ProcessSupervisor::default();
        let started = std::time::Instant::now();
        let result = supervisor
            .execute(&sh("sleep 30"), &spec(60_000, 300, None), |_, _| {})
            .await
            .expect("execute");

        assert!(!result.success);
        assert!(result.hung);
        assert!(!result.timed_out);
        assert!(result.terminated);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn chatty_process_is_reaped_at_wall_clock_ceiling() {
        let supervisor = ProcessSupervisor::default();
        let result = supervisor
            .execute(
                &sh("while true; do echo tick; sleep 0.05; done"),
                &spec(400, 5_000, None),
                |_, _| {},
            )
            .await
            .expect("execute");

        assert!(!result.success);
        assert!(result.timed_out);
        assert!(!result.hung);
        assert!(result.terminated);
        assert!(result.output_lines >= 1);
    }

    #[tokio::test]
    async fn marker_then_no_exit_counts_as_success() {
        // The observed legacy failure mode: completion line printed, process
        // never exits.
        let supervisor = ProcessSupervisor::default();
        let result = supervisor
            .execute(
                &sh("echo 'TRANSLATE COMPLETE'; sleep 30"),
                &spec(60_000, 10_000, Some("TRANSLATE COMPLETE")),
                |_, _| {},
            )
            .await
            .expect("execute");

        assert!(result.success);
        assert!(result.marker_seen);
        assert!(result.terminated);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn marker_overrides_nonzero_exit_code() {
        let supervisor = ProcessSupervisor::default();
        let result = supervisor
            .execute(
                &sh("echo 'MERGE COMPLETE'; exit 7"),
                &spec(5_000, 5_000, Some("MERGE COMPLETE")),
                |_, _| {},
            )
            .await
            .expect("execute");

        assert!(result.success);
        assert!(result.marker_seen);
        assert_eq!(result.exit_code, Some(7));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let supervisor = ProcessSupervisor::default();
        let command = StageCommand {
            program: "/definitely/not/a/real/binary".into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        };
        let err = supervisor
            .execute(&command, &spec(1_000, 1_000, None), |_, _| {})
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, ConveyorError::Spawn { .. }));
    }
}
