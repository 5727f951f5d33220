//! In-process executor with scripted outcomes.
//!
//! Used by `swarm demo`, `swarm run --simulate` and the test suite. Each
//! task id can carry a script of steps consumed one per attempt; the last
//! step repeats once the script runs out, and tasks without a script use
//! the default step.

use crate::core::TaskId;
use crate::orchestration::executor::{
    ExecutionFailure, ExecutionOutput, ExecutionRequest, ExecutionResult, Executor,
    ProgressReporter,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Outcome of one simulated attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedStep {
    Succeed { cost: f64, delay: Duration },
    Fail { error: String, cost: f64, delay: Duration },
}

impl SimulatedStep {
    pub fn succeed(cost: f64, delay: Duration) -> Self {
        Self::Succeed { cost, delay }
    }

    pub fn fail(error: &str, delay: Duration) -> Self {
        Self::Fail {
            error: error.to_string(),
            cost: 0.0,
            delay,
        }
    }

    fn delay(&self) -> Duration {
        match self {
            Self::Succeed { delay, .. } | Self::Fail { delay, .. } => *delay,
        }
    }
}

/// One recorded attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub task_id: TaskId,
    /// Zero-based attempt number for this task.
    pub attempt: usize,
    /// Tasks that were mid-attempt when this one started.
    pub concurrent_with: Vec<TaskId>,
}

#[derive(Debug, Default)]
struct SimState {
    attempts: HashMap<TaskId, usize>,
    running: Vec<TaskId>,
    invocations: Vec<Invocation>,
}

/// Scripted executor.
#[derive(Debug)]
pub struct SimulatedExecutor {
    scripts: HashMap<TaskId, Vec<SimulatedStep>>,
    default_step: SimulatedStep,
    state: Mutex<SimState>,
    peak: AtomicUsize,
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(SimulatedStep::succeed(0.0, Duration::from_millis(10)))
    }
}

impl SimulatedExecutor {
    pub fn new(default_step: SimulatedStep) -> Self {
        Self {
            scripts: HashMap::new(),
            default_step,
            state: Mutex::new(SimState::default()),
            peak: AtomicUsize::new(0),
        }
    }

    /// Script the attempts of one task.
    pub fn script(mut self, task_id: &str, steps: Vec<SimulatedStep>) -> Self {
        self.scripts.insert(TaskId::from(task_id), steps);
        self
    }

    fn step_for(&self, task_id: &TaskId, attempt: usize) -> SimulatedStep {
        self.scripts
            .get(task_id)
            .and_then(|steps| steps.get(attempt).or_else(|| steps.last()))
            .unwrap_or(&self.default_step)
            .clone()
    }

    /// Every attempt started so far, in start order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.state
            .lock()
            .map(|s| s.invocations.clone())
            .unwrap_or_default()
    }

    /// Attempts started for one task.
    pub fn attempts(&self, task_id: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.attempts.get(&TaskId::from(task_id)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Highest number of attempts that were in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn begin(&self, task_id: &TaskId) -> usize {
        let Ok(mut state) = self.state.lock() else {
            return 0;
        };
        let attempt = {
            let counter = state.attempts.entry(task_id.clone()).or_insert(0);
            let attempt = *counter;
            *counter += 1;
            attempt
        };
        let concurrent_with = state.running.clone();
        state.running.push(task_id.clone());
        state.invocations.push(Invocation {
            task_id: task_id.clone(),
            attempt,
            concurrent_with,
        });
        self.peak.fetch_max(state.running.len(), Ordering::SeqCst);
        attempt
    }

    fn end(&self, task_id: &TaskId) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(pos) = state.running.iter().position(|t| t == task_id) {
                state.running.remove(pos);
            }
        }
    }
}

/// Marks an attempt finished even if the future is dropped mid-flight.
struct RunningGuard<'a> {
    executor: &'a SimulatedExecutor,
    task_id: TaskId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.executor.end(&self.task_id);
    }
}

impl Executor for SimulatedExecutor {
    fn name(&self) -> &str {
        "simulated"
    }

    fn execute<'a>(
        &'a self,
        request: ExecutionRequest,
        progress: ProgressReporter,
    ) -> BoxFuture<'a, ExecutionResult> {
        async move {
            let attempt = self.begin(&request.task_id);
            let _guard = RunningGuard {
                executor: self,
                task_id: request.task_id.clone(),
            };
            let step = self.step_for(&request.task_id, attempt);

            if request.resources.is_empty() {
                progress.report("Read", None);
            }
            for resource in &request.resources {
                progress.report("Edit", Some(resource));
            }

            tokio::time::sleep(step.delay()).await;

            match step {
                SimulatedStep::Succeed { cost, delay } => Ok(ExecutionOutput {
                    output: format!("{} finished (attempt {})", request.task_id, attempt + 1),
                    cost,
                    duration: delay,
                }),
                SimulatedStep::Fail { error, cost, .. } => {
                    Err(ExecutionFailure::new(error).with_cost(cost))
                }
            }
        }
        .boxed()
    }
}
