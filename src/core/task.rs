//! Task data model for the scheduling graph.
//!
//! Tasks are the atomic units of work handed to workers. Each task
//! tracks its status, declared resources, assignment, and results.
//! Only the scheduler drives the transition methods below.

use crate::orchestration::WorkerId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capabilities granted to a task when neither the task nor its agent
/// profile names any.
pub const DEFAULT_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Grep", "Glob"];

/// Agent type used when a task does not declare one.
pub const DEFAULT_AGENT_TYPE: &str = "coder";

/// Stable identifier for a task within a plan.
///
/// Ids come from the decomposition step (e.g. `task-1`) and are compared
/// as plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task status in its lifecycle.
///
/// `Pending → Running → Completed | Failed`, with the detours
/// `Pending → Blocked → Pending` (resource conflict) and
/// `Failed → Pending` (retry). Any non-terminal status may become
/// `Cancelled` when the run halts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    /// Deferred because a declared resource is held by a running task.
    Blocked,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Completed, Failed and Cancelled are terminal for `all_terminal()`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Blocked => write!(f, "blocked"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single task in the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub description: String,
    /// Free-form profile label; only the executor side interprets it.
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Logical resources (usually file paths) the task intends to mutate.
    #[serde(default, alias = "files_to_modify")]
    pub resources: Vec<String>,
    /// Instructions handed to the executor. Falls back to the description.
    #[serde(default)]
    pub prompt: String,
    /// Allowed capability set. Empty means "use the agent profile".
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub assigned_worker: Option<WorkerId>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub retry_count: u32,
}

fn default_agent_type() -> String {
    DEFAULT_AGENT_TYPE.to_string()
}

impl Task {
    /// Create a pending task with no dependencies or resources.
    pub fn new(id: impl Into<TaskId>, description: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            agent_type: default_agent_type(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            resources: Vec::new(),
            prompt: String::new(),
            tools: Vec::new(),
            assigned_worker: None,
            result: None,
            error: None,
            cost: 0.0,
            duration_ms: 0,
            retry_count: 0,
        }
    }

    pub fn with_agent_type(mut self, agent_type: &str) -> Self {
        self.agent_type = agent_type.to_string();
        self
    }

    pub fn with_dependencies<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = prompt.to_string();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    /// The instructions an executor should receive.
    pub fn effective_prompt(&self) -> &str {
        if self.prompt.trim().is_empty() {
            &self.description
        } else {
            &self.prompt
        }
    }

    /// Hand the task to a worker.
    pub fn start(&mut self, worker: WorkerId) {
        self.status = TaskStatus::Running;
        self.assigned_worker = Some(worker);
    }

    /// Record a successful attempt.
    pub fn complete(&mut self, output: String, cost: f64, duration: Duration) {
        self.status = TaskStatus::Completed;
        self.result = Some(output);
        self.error = None;
        self.record_attempt(cost, duration);
    }

    /// Record a failed attempt. Whether it is final is the scheduler's call.
    pub fn fail(&mut self, error: &str, cost: f64, duration: Duration) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
        self.record_attempt(cost, duration);
    }

    /// Put a failed task back in line for another attempt.
    pub fn retry(&mut self) {
        self.status = TaskStatus::Pending;
        self.retry_count += 1;
        self.assigned_worker = None;
    }

    /// Defer the task because a declared resource is held elsewhere.
    pub fn block(&mut self) {
        self.status = TaskStatus::Blocked;
    }

    /// Return a blocked task to the admission queue.
    pub fn unblock(&mut self) {
        self.status = TaskStatus::Pending;
    }

    /// Cancel a task that never got to run.
    pub fn cancel(&mut self, reason: &str) {
        self.status = TaskStatus::Cancelled;
        self.error = Some(reason.to_string());
        self.assigned_worker = None;
    }

    /// Clear everything a run records, leaving a fresh Pending task.
    ///
    /// Returns true if the task carried any run state.
    pub fn reset(&mut self) -> bool {
        let dirty = self.status != TaskStatus::Pending
            || self.assigned_worker.is_some()
            || self.result.is_some()
            || self.error.is_some()
            || self.cost != 0.0
            || self.duration_ms != 0
            || self.retry_count != 0;
        self.status = TaskStatus::Pending;
        self.assigned_worker = None;
        self.result = None;
        self.error = None;
        self.cost = 0.0;
        self.duration_ms = 0;
        self.retry_count = 0;
        dirty
    }

    fn record_attempt(&mut self, cost: f64, duration: Duration) {
        self.cost += cost;
        self.duration_ms += duration.as_millis() as u64;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending or Blocked: the task has not started and can still be cancelled.
    pub fn is_waiting(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Blocked)
    }
}
