//! Orchestration layer: scheduling, workers, resource locks and executors.
//!
//! The [`Scheduler`] drives a [`Plan`](crate::core::Plan) to completion on
//! top of an [`Executor`]. Two executors ship with the crate: the
//! [`ClaudeExecutor`] for real runs and the [`SimulatedExecutor`] for demos
//! and tests.

pub mod claude;
pub mod events;
pub mod executor;
pub mod locks;
pub mod pool;
pub mod scheduler;
pub mod simulated;
pub mod summary;

pub use claude::{ClaudeExecutor, ClaudeResponse, ResultType, StreamItem, DEFAULT_MAX_TURNS};
pub use events::{EventLog, EventSink, RunEvent, SchedulerEvent};
pub use executor::{
    AgentProfile, ExecutionFailure, ExecutionOutput, ExecutionRequest, ExecutionResult, Executor,
    ProfileRegistry, ProgressEvent, ProgressReporter, DEFAULT_EXECUTION_MODEL,
};
pub use locks::{ResourceConflict, ResourceLockTable};
pub use pool::{Worker, WorkerId, WorkerStatus, WorkerTable};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerSnapshot, TaskView};
pub use simulated::{Invocation, SimulatedExecutor, SimulatedStep};
pub use summary::{aggregate, HaltReason, RunResult, RunStats};
