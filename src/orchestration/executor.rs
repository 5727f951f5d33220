//! Executor seam and worker launch glue.
//!
//! An [`Executor`] performs one task attempt as an opaque, possibly long
//! running operation. It may report progress through a [`ProgressReporter`]
//! and finishes with exactly one outcome. Workers never touch scheduling
//! state: everything they learn travels back to the scheduler as a
//! `WorkerMessage` on a single channel.

use crate::core::{Task, TaskId, DEFAULT_TOOLS};
use crate::orchestration::WorkerId;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default model for task execution when a profile does not name one.
pub const DEFAULT_EXECUTION_MODEL: &str = "haiku";

/// Everything an executor needs for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRequest {
    pub task_id: TaskId,
    pub agent_type: String,
    /// Profile prompt (if any) followed by the task's own instructions.
    pub prompt: String,
    /// Allowed capability set.
    pub tools: Vec<String>,
    pub model: String,
    /// Cost ceiling for this single attempt.
    pub cost_ceiling: f64,
    pub cwd: PathBuf,
    /// Declared resources, for executors that want to report on them.
    pub resources: Vec<String>,
}

/// A successful attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub output: String,
    pub cost: f64,
    /// Zero means "not reported"; the worker then records wall-clock time.
    pub duration: Duration,
}

/// A failed attempt. The scheduler does not interpret the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub error: String,
    /// Cost incurred before failing; still counts against the budget.
    pub cost: f64,
}

impl ExecutionFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

pub type ExecutionResult = std::result::Result<ExecutionOutput, ExecutionFailure>;

/// One action observed during an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub action: String,
    /// The resource the action touched, if any.
    pub resource: Option<String>,
}

/// Performs task attempts.
pub trait Executor: Send + Sync {
    /// Short name for logs, e.g. `claude` or `simulated`.
    fn name(&self) -> &str;

    fn execute<'a>(
        &'a self,
        request: ExecutionRequest,
        progress: ProgressReporter,
    ) -> BoxFuture<'a, ExecutionResult>;
}

/// What a worker tells the scheduler.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Progress {
        worker_id: WorkerId,
        task_id: TaskId,
        event: ProgressEvent,
    },
    Finished {
        worker_id: WorkerId,
        task_id: TaskId,
        outcome: ExecutionResult,
        elapsed: Duration,
    },
}

/// Handle an executor uses to report progress for its attempt.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    worker_id: WorkerId,
    task_id: TaskId,
    tx: Option<mpsc::UnboundedSender<WorkerMessage>>,
}

impl ProgressReporter {
    pub(crate) fn new(
        worker_id: WorkerId,
        task_id: TaskId,
        tx: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            worker_id,
            task_id,
            tx: Some(tx),
        }
    }

    /// A reporter that drops everything, for calling executors directly.
    pub fn detached(task_id: TaskId) -> Self {
        Self {
            worker_id: WorkerId::new(),
            task_id,
            tx: None,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn report(&self, action: &str, resource: Option<&str>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(WorkerMessage::Progress {
                worker_id: self.worker_id,
                task_id: self.task_id.clone(),
                event: ProgressEvent {
                    action: action.to_string(),
                    resource: resource.map(str::to_string),
                },
            });
        }
    }
}

/// Per-agent-type execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_execution_model")]
    pub model: String,
    #[serde(default = "default_tools")]
    pub tools: Vec<String>,
    #[serde(default)]
    pub prompt: String,
}

fn default_execution_model() -> String {
    DEFAULT_EXECUTION_MODEL.to_string()
}

fn default_tools() -> Vec<String> {
    DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect()
}

impl Default for AgentProfile {
    fn default() -> Self {
        Self {
            description: String::new(),
            model: default_execution_model(),
            tools: default_tools(),
            prompt: String::new(),
        }
    }
}

/// Resolves a task's `agent_type` into execution settings.
///
/// The scheduler never looks inside; unknown agent types get the default
/// profile.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, AgentProfile>,
    fallback: AgentProfile,
}

impl ProfileRegistry {
    pub fn new(profiles: HashMap<String, AgentProfile>) -> Self {
        Self {
            profiles,
            fallback: AgentProfile::default(),
        }
    }

    pub fn profile(&self, agent_type: &str) -> &AgentProfile {
        self.profiles.get(agent_type).unwrap_or(&self.fallback)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Build the request for one attempt of `task`.
    pub fn build_request(&self, task: &Task, cwd: PathBuf, cost_ceiling: f64) -> ExecutionRequest {
        let profile = self.profile(&task.agent_type);
        let prompt = if profile.prompt.trim().is_empty() {
            task.effective_prompt().to_string()
        } else {
            format!("{}\n\n{}", profile.prompt.trim_end(), task.effective_prompt())
        };
        let tools = if task.tools.is_empty() {
            profile.tools.clone()
        } else {
            task.tools.clone()
        };
        ExecutionRequest {
            task_id: task.id.clone(),
            agent_type: task.agent_type.clone(),
            prompt,
            tools,
            model: profile.model.clone(),
            cost_ceiling,
            cwd,
            resources: task.resources.clone(),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("executor panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("executor panicked: {}", s)
    } else {
        "executor panicked".to_string()
    }
}

/// Run one attempt on its own tokio task.
///
/// Exactly one `Finished` message is sent per call, even if the executor
/// panics.
pub(crate) fn launch(
    executor: Arc<dyn Executor>,
    request: ExecutionRequest,
    worker_id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let task_id = request.task_id.clone();
        let reporter = ProgressReporter::new(worker_id, task_id.clone(), tx.clone());
        let started = Instant::now();

        let outcome = AssertUnwindSafe(executor.execute(request, reporter))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ExecutionFailure::new(panic_message(payload))));
        let elapsed = started.elapsed();

        let outcome = outcome.map(|mut output| {
            if output.duration.is_zero() {
                output.duration = elapsed;
            }
            output
        });

        let _ = tx.send(WorkerMessage::Finished {
            worker_id,
            task_id,
            outcome,
            elapsed,
        });
    })
}
