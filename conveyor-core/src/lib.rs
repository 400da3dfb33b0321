//! # Conveyor Core
//!
//! Orchestration core for a three-stage batch processing pipeline: external
//! tools translate raw input files, analyze the translated output, and merge
//! the analysis results. Conveyor sequences those tools, supervises their
//! processes, and broadcasts everything that happens as an ordered event
//! stream.
//!
//! ## Overview
//!
//! - **Single-flight runs**: a file-based lock with pid liveness ensures at
//!   most one pipeline run at a time, across processes
//! - **Process supervision**: wall-clock timeouts, no-output hang detection,
//!   graceful-then-forceful termination, and a success-marker matcher for
//!   stage tools that are unreliable about exit codes
//! - **Ordered events**: one global strictly-increasing sequence; subscribers
//!   get a bounded snapshot plus a live feed with no gaps or duplicates, and
//!   a durable JSONL log supports replay across restarts
//! - **State machine**: every transition is broadcast as a complete
//!   [`RunState`] snapshot with write-once terminal phases
//! - **Self-healing**: a watchdog force-fails stalled runs, stale locks from
//!   dead processes are reclaimed, and failed stages are retried within a
//!   per-stage budget
//!
//! ## Architecture
//!
//! - [`orchestrator`]: run state machine, single-flight control, stage
//!   sequencing
//! - [`stage`]: stage definitions and the embedder-supplied collaborators
//!   ([`InputProbe`], [`CommandPlan`])
//! - [`supervisor`]: child-process execution under timeout and hang limits
//! - [`bus`]: in-process event distribution with a durable tail
//! - [`lock`]: cross-process single-flight lock
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use conveyor_core::{
//!     CommandPlan, ConveyorConfig, InputProbe, Orchestrator, Result, RunId, RunTrigger,
//!     StageCommand, StageKind,
//! };
//!
//! struct Probe;
//!
//! #[async_trait::async_trait]
//! impl InputProbe for Probe {
//!     async fn pending_input(&self, _stage: StageKind) -> Result<u64> {
//!         Ok(1)
//!     }
//! }
//!
//! struct Plan;
//!
//! #[async_trait::async_trait]
//! impl CommandPlan for Plan {
//!     async fn command_for(&self, stage: StageKind, _run_id: RunId) -> Result<StageCommand> {
//!         Ok(StageCommand {
//!             program: format!("/opt/pipeline/bin/{stage}"),
//!             args: vec!["--batch".into()],
//!             cwd: None,
//!             envs: Vec::new(),
//!         })
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let orchestrator = Orchestrator::builder(ConveyorConfig::default())
//!     .with_input_probe(Arc::new(Probe))
//!     .with_command_plan(Arc::new(Plan))
//!     .build()
//!     .await?;
//! orchestrator.start().await?;
//! orchestrator.start_run(RunTrigger::Manual).await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod lock;
pub mod orchestrator;
pub mod run;
mod scheduler;
pub mod stage;
pub mod supervisor;
mod watchdog;

pub use bus::{EventBus, EventStore, EventSubscription, JsonlEventStore, NullEventStore};
pub use config::{
    BusConfig, ConveyorConfig, LockConfig, SchedulerConfig, StageConfig, StagesConfig,
    WatchdogConfig,
};
pub use error::{ConveyorError, Result};
pub use events::{Event, EventData, EventDraft, EventKind, EventPublisher, EventSource};
pub use ids::{RunId, SubscriberId};
pub use lock::{LockMetadata, ProcessProbe, RunLock, SystemProcessProbe};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, StartOutcome};
pub use run::{RunError, RunPhase, RunState, RunTrigger, StageRetries};
pub use stage::{CommandPlan, InputProbe, StageCommand, StageKind, StageRunner};
pub use supervisor::{ExecSpec, ProcessSupervisor, StageResult, StreamKind};
