//! Core domain models for swarm scheduling.
//!
//! Tasks and the plan that owns them for the duration of one run.

pub mod plan;
pub mod task;

pub use plan::{Plan, PlanIssue};
pub use task::{Task, TaskId, TaskStatus, DEFAULT_AGENT_TYPE, DEFAULT_TOOLS};
