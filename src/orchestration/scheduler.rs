//! Scheduler for parallel task execution.
//!
//! The Scheduler owns the plan, the resource lock table, the worker table
//! and the cost accumulator for one run. It is the only thing that mutates
//! any of them: workers run on their own tokio tasks and report back over a
//! single channel, which the loop drains before every decision.
//!
//! Each poll:
//! 1. apply worker messages (progress, completions, failures)
//! 2. check the budget and the shutdown token
//! 3. stop once every task is terminal
//! 4. admit ready tasks up to the concurrency limit, deferring conflicts,
//!    or cancel waiting tasks if the run has halted
//! 5. wait for the next worker message or the poll interval
//!
//! A run always ends with a [`RunResult`], including on budget exhaustion,
//! shutdown and stalls.

use crate::core::{Plan, Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::events::{EventSink, RunEvent, SchedulerEvent};
use crate::orchestration::executor::{launch, Executor, ProfileRegistry, WorkerMessage};
use crate::orchestration::locks::{ResourceConflict, ResourceLockTable};
use crate::orchestration::pool::{Worker, WorkerStatus, WorkerTable};
use crate::orchestration::summary::{aggregate, HaltReason, RunResult, RunStats};
use crate::orchestration::WorkerId;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Run-scoped limits, fixed when the scheduler is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum number of workers in flight.
    pub max_concurrent: usize,
    /// Ceiling on cumulative cost across all attempts.
    pub budget: f64,
    /// A failed task is retried while its `retry_count` is below this.
    pub max_retries: u32,
    /// Cost ceiling handed to the executor for each attempt.
    pub task_budget: f64,
    pub poll_interval: Duration,
    /// Consecutive idle polls before the run is declared stalled.
    pub stall_polls: u32,
    /// Working directory for executors.
    pub cwd: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            budget: 5.0,
            max_retries: 0,
            task_budget: 0.5,
            poll_interval: Duration::from_millis(500),
            stall_polls: 3,
            cwd: PathBuf::from("."),
        }
    }
}

impl SchedulerConfig {
    /// # Errors
    /// Returns [`Error::Validation`] for a zero concurrency limit, a
    /// non-positive or non-finite budget, a zero poll interval or a zero
    /// stall threshold.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Validation(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if !self.budget.is_finite() || self.budget <= 0.0 {
            return Err(Error::Validation(format!(
                "budget must be a positive number, got {}",
                self.budget
            )));
        }
        if !self.task_budget.is_finite() || self.task_budget <= 0.0 {
            return Err(Error::Validation(format!(
                "task budget must be a positive number, got {}",
                self.task_budget
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Validation(
                "poll interval must be non-zero".to_string(),
            ));
        }
        if self.stall_polls == 0 {
            return Err(Error::Validation(
                "stall_polls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Status of one task as seen by a dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub cost: f64,
    pub assigned_worker: Option<WorkerId>,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
            status: task.status,
            retry_count: task.retry_count,
            cost: task.cost,
            assigned_worker: task.assigned_worker,
        }
    }
}

/// Pull-style view of a run in progress.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub tasks: Vec<TaskView>,
    pub workers: Vec<Worker>,
    pub total_cost: f64,
    pub budget: f64,
    pub open_conflicts: Vec<ResourceConflict>,
    pub halt: Option<HaltReason>,
    pub elapsed_ms: u64,
}

impl SchedulerSnapshot {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

/// Drives one plan to completion.
pub struct Scheduler {
    plan: Plan,
    config: SchedulerConfig,
    executor: Arc<dyn Executor>,
    profiles: ProfileRegistry,
    locks: ResourceLockTable,
    workers: WorkerTable,
    conflicts: Vec<ResourceConflict>,
    total_cost: f64,
    budget_exceeded: bool,
    halt: Option<HaltReason>,
    stalled: Vec<TaskId>,
    sink: Option<Box<dyn EventSink>>,
    shutdown: Option<CancellationToken>,
    snapshot_tx: watch::Sender<SchedulerSnapshot>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    rx: mpsc::UnboundedReceiver<WorkerMessage>,
    started: Instant,
}

impl Scheduler {
    /// # Errors
    /// Returns [`Error::Validation`] if `config` is invalid.
    pub fn new(plan: Plan, config: SchedulerConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let workers = WorkerTable::new(config.max_concurrent);
        let scheduler = Self {
            plan,
            config,
            executor,
            profiles: ProfileRegistry::default(),
            locks: ResourceLockTable::new(),
            workers,
            conflicts: Vec::new(),
            total_cost: 0.0,
            budget_exceeded: false,
            halt: None,
            stalled: Vec::new(),
            sink: None,
            shutdown: None,
            snapshot_tx: watch::channel(empty_snapshot()).0,
            tx,
            rx,
            started: Instant::now(),
        };
        scheduler.publish_snapshot();
        Ok(scheduler)
    }

    /// Send run events to `sink`.
    pub fn with_events(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn with_profiles(mut self, profiles: ProfileRegistry) -> Self {
        self.profiles = profiles;
        self
    }

    /// Halt admission when `token` is cancelled. In-flight workers drain.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    /// Receiver that sees a fresh snapshot after every poll.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn active_count(&self) -> usize {
        self.workers.active_count()
    }

    /// Current task statuses, active workers, cost and open conflicts.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            tasks: self.plan.tasks().iter().map(TaskView::from).collect(),
            workers: self.workers.active().into_iter().cloned().collect(),
            total_cost: self.total_cost,
            budget: self.config.budget,
            open_conflicts: self
                .conflicts
                .iter()
                .filter(|c| !c.resolved)
                .cloned()
                .collect(),
            halt: self.halt,
            elapsed_ms: self.elapsed_ms(),
        }
    }

    /// Run until every task is terminal.
    pub async fn run(mut self) -> RunResult {
        self.started = Instant::now();
        for issue in self.plan.diagnose() {
            crate::slog_warn!("Plan issue: {}", issue);
        }
        crate::slog!(
            "Starting run: {} tasks, {} executor, max {} concurrent, budget ${:.2}, {} retries",
            self.plan.len(),
            self.executor.name(),
            self.config.max_concurrent,
            self.config.budget,
            self.config.max_retries
        );

        let mut idle_polls = 0u32;
        loop {
            self.drain_messages();
            self.check_halt();
            if self.plan.all_terminal() {
                break;
            }

            let admitted = if self.halt.is_some() {
                self.cancel_waiting();
                0
            } else {
                self.admit_ready()
            };
            self.publish_snapshot();
            if self.plan.all_terminal() {
                break;
            }

            if self.workers.active_count() == 0 && admitted == 0 {
                idle_polls += 1;
                if idle_polls >= self.config.stall_polls {
                    self.declare_stall();
                    idle_polls = 0;
                    continue;
                }
            } else {
                idle_polls = 0;
            }

            self.wait().await;
        }

        self.finish()
    }

    async fn wait(&mut self) {
        let shutdown = self.shutdown.clone();
        let halted = self.halt.is_some();
        let cancelled = async move {
            match shutdown {
                Some(token) if !halted => token.cancelled().await,
                _ => std::future::pending::<()>().await,
            }
        };
        let message = tokio::select! {
            message = self.rx.recv() => message,
            _ = tokio::time::sleep(self.config.poll_interval) => None,
            _ = cancelled => None,
        };
        if let Some(message) = message {
            self.handle_message(message);
        }
    }

    fn drain_messages(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Progress {
                worker_id,
                task_id,
                event,
            } => {
                crate::slog_trace!(
                    "{} ({}): {} {}",
                    worker_id,
                    task_id,
                    event.action,
                    event.resource.as_deref().unwrap_or("")
                );
                self.workers
                    .record_progress(&worker_id, &event.action, event.resource.as_deref());
                self.emit(SchedulerEvent::Progress {
                    task_id,
                    worker_id,
                    action: event.action,
                    resource: event.resource,
                });
            }
            WorkerMessage::Finished {
                worker_id,
                task_id,
                outcome,
                elapsed,
            } => match outcome {
                Ok(output) => {
                    if self
                        .retire(&worker_id, WorkerStatus::Completed, output.cost)
                        .is_none()
                    {
                        return;
                    }
                    self.total_cost += output.cost;
                    let duration = output.duration;
                    let cost = output.cost;
                    self.transition(&task_id, |t| t.complete(output.output, cost, duration));
                    crate::slog!(
                        "Task {} completed by {} (${:.4}, {}ms)",
                        task_id,
                        worker_id,
                        cost,
                        duration.as_millis()
                    );
                    self.emit(SchedulerEvent::TaskCompleted {
                        task_id: task_id.clone(),
                        worker_id,
                        cost,
                        duration_ms: duration.as_millis() as u64,
                    });
                    self.release(&task_id);
                }
                Err(failure) => {
                    if self
                        .retire(&worker_id, WorkerStatus::Failed, failure.cost)
                        .is_none()
                    {
                        return;
                    }
                    self.total_cost += failure.cost;
                    self.transition(&task_id, |t| t.fail(&failure.error, failure.cost, elapsed));
                    let retry_count = self
                        .plan
                        .get(&task_id)
                        .map(|t| t.retry_count)
                        .unwrap_or_default();
                    let will_retry = retry_count < self.config.max_retries;
                    if will_retry {
                        crate::slog_warn!(
                            "Task {} failed (attempt {}), retrying: {}",
                            task_id,
                            retry_count + 1,
                            failure.error
                        );
                    } else {
                        crate::slog_error!(
                            "Task {} failed permanently after {} retries: {}",
                            task_id,
                            retry_count,
                            failure.error
                        );
                    }
                    self.emit(SchedulerEvent::TaskFailed {
                        task_id: task_id.clone(),
                        worker_id,
                        error: failure.error,
                        retry_count,
                        will_retry,
                    });
                    if will_retry {
                        self.transition(&task_id, Task::retry);
                    }
                    self.release(&task_id);
                }
            },
        }
    }

    /// Retire a worker, or log and skip a message from an unknown one.
    fn retire(&mut self, worker_id: &WorkerId, status: WorkerStatus, cost: f64) -> Option<Worker> {
        match self.workers.retire(worker_id, status, cost) {
            Ok(worker) => Some(worker),
            Err(e) => {
                crate::slog_warn!("Ignoring completion: {}", e);
                None
            }
        }
    }

    /// Release a finished attempt's locks, resolve conflicts it caused and
    /// return Blocked tasks whose resources are now free to Pending.
    fn release(&mut self, task_id: &TaskId) {
        if let Some(task) = self.plan.get(task_id) {
            self.locks.unlock(task);
        }
        for conflict in self
            .conflicts
            .iter_mut()
            .filter(|c| !c.resolved && &c.holder == task_id)
        {
            conflict.resolved = true;
        }

        let unblocked: Vec<TaskId> = self
            .plan
            .tasks_with_status(TaskStatus::Blocked)
            .filter(|t| self.locks.is_free(t))
            .map(|t| t.id.clone())
            .collect();
        for id in unblocked {
            crate::slog_debug!("Task {} unblocked", id);
            self.transition(&id, Task::unblock);
        }
    }

    fn check_halt(&mut self) {
        if !self.budget_exceeded && self.total_cost >= self.config.budget {
            self.budget_exceeded = true;
            crate::slog_warn!(
                "Budget exceeded: ${:.4} spent of ${:.2}; halting admission",
                self.total_cost,
                self.config.budget
            );
            self.emit(SchedulerEvent::BudgetExceeded {
                total_cost: self.total_cost,
                budget: self.config.budget,
            });
            if self.halt.is_none() {
                self.halt = Some(HaltReason::BudgetExceeded);
            }
        }
        if self.halt.is_none()
            && self
                .shutdown
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
        {
            crate::slog_warn!(
                "Shutdown requested; waiting for {} active workers",
                self.workers.active_count()
            );
            self.emit(SchedulerEvent::ShutdownRequested);
            self.halt = Some(HaltReason::Shutdown);
        }
    }

    /// Cancel every Pending or Blocked task after a halt.
    fn cancel_waiting(&mut self) {
        let reason = match self.halt {
            Some(HaltReason::BudgetExceeded) => format!(
                "budget exceeded: ${:.4} spent of ${:.2}",
                self.total_cost, self.config.budget
            ),
            Some(HaltReason::Shutdown) => "run shut down before the task started".to_string(),
            Some(HaltReason::Stalled) | None => "run halted".to_string(),
        };
        let waiting: Vec<TaskId> = self
            .plan
            .tasks()
            .iter()
            .filter(|t| t.is_waiting())
            .map(|t| t.id.clone())
            .collect();
        for id in waiting {
            crate::slog_debug!("Cancelling task {}: {}", id, reason);
            self.transition(&id, |t| t.cancel(&reason));
        }
    }

    /// Admit ready tasks in plan order until the pool is full.
    fn admit_ready(&mut self) -> usize {
        let candidates: Vec<TaskId> = self
            .plan
            .ready_tasks()
            .into_iter()
            .map(|t| t.id.clone())
            .collect();

        let mut admitted = 0;
        for task_id in candidates {
            if !self.workers.has_capacity() {
                break;
            }
            let Some(task) = self.plan.get(&task_id) else {
                continue;
            };
            if let Some(mut conflict) = self.locks.check_conflict(task, &self.plan) {
                conflict.detected_at_ms = self.elapsed_ms();
                crate::slog!(
                    "Conflict: task {} deferred, {} is held by {}",
                    conflict.blocked,
                    conflict.resource,
                    conflict.holder
                );
                self.emit(SchedulerEvent::ConflictDetected {
                    task_id: conflict.blocked.clone(),
                    holder: conflict.holder.clone(),
                    resource: conflict.resource.clone(),
                });
                self.conflicts.push(conflict);
                self.transition(&task_id, Task::block);
                continue;
            }
            match self.start_task(&task_id) {
                Ok(()) => admitted += 1,
                Err(e) => {
                    crate::slog_error!("Failed to admit task {}: {}", task_id, e);
                    break;
                }
            }
        }
        admitted
    }

    fn start_task(&mut self, task_id: &TaskId) -> Result<()> {
        let task = self
            .plan
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
        let request =
            self.profiles
                .build_request(task, self.config.cwd.clone(), self.config.task_budget);
        let worker_id = self.workers.spawn(task_id, &task.agent_type)?;
        self.locks.lock(task);
        let attempt = task.retry_count + 1;

        self.transition(task_id, |t| t.start(worker_id));
        crate::slog!(
            "Admitted task {} to {} (attempt {}, {} active)",
            task_id,
            worker_id,
            attempt,
            self.workers.active_count()
        );
        self.emit(SchedulerEvent::TaskAdmitted {
            task_id: task_id.clone(),
            worker_id,
            attempt,
        });

        let _ = launch(
            Arc::clone(&self.executor),
            request,
            worker_id,
            self.tx.clone(),
        );
        Ok(())
    }

    /// Cancel every task that can no longer make progress, including
    /// Running tasks with no live worker behind them.
    fn declare_stall(&mut self) {
        let stranded: Vec<(TaskId, String)> = self
            .plan
            .tasks()
            .iter()
            .filter(|t| t.is_waiting() || self.is_orphaned(t))
            .map(|t| (t.id.clone(), self.stall_reason(t)))
            .collect();
        let ids: Vec<TaskId> = stranded.iter().map(|(id, _)| id.clone()).collect();
        crate::slog_warn!(
            "Run stalled; cancelling {} tasks: {}",
            ids.len(),
            ids.iter()
                .map(TaskId::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );
        for (id, reason) in stranded {
            self.transition(&id, |t| t.cancel(&reason));
        }
        self.halt = Some(HaltReason::Stalled);
        self.emit(SchedulerEvent::RunStalled {
            task_ids: ids.clone(),
        });
        self.stalled = ids;
    }

    fn is_orphaned(&self, task: &Task) -> bool {
        task.status == TaskStatus::Running
            && !self
                .workers
                .active()
                .iter()
                .any(|w| Some(w.id) == task.assigned_worker)
    }

    fn stall_reason(&self, task: &Task) -> String {
        if task.status == TaskStatus::Running {
            return "stalled: no worker is running this task".to_string();
        }
        let unmet = task
            .dependencies
            .iter()
            .find(|d| self.plan.status_of(d) != Some(TaskStatus::Completed));
        match unmet {
            None => "stalled: no progress possible".to_string(),
            Some(dep) => match self.plan.status_of(dep) {
                None => format!("stalled: depends on unknown task {}", dep),
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) => {
                    format!("stalled: dependency {} did not complete", dep)
                }
                Some(_) => format!("stalled: dependency {} can never become ready", dep),
            },
        }
    }

    /// Apply a lifecycle change and report it if the status moved.
    fn transition<F>(&mut self, task_id: &TaskId, apply: F)
    where
        F: FnOnce(&mut Task),
    {
        let Some(task) = self.plan.get_mut(task_id) else {
            crate::slog_warn!("Transition for unknown task {}", task_id);
            return;
        };
        let from = task.status;
        apply(task);
        let to = task.status;
        if from != to {
            self.emit(SchedulerEvent::TaskStatusChanged {
                task_id: task_id.clone(),
                from,
                to,
            });
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(RunEvent {
                elapsed_ms: self.elapsed_ms(),
                event,
            });
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn finish(self) -> RunResult {
        self.publish_snapshot();
        let result = aggregate(
            &self.plan,
            &self.conflicts,
            RunStats {
                total_cost: self.total_cost,
                duration: self.started.elapsed(),
                workers_used: self.workers.spawned(),
                budget_exceeded: self.budget_exceeded,
                halt: self.halt,
                stalled: self.stalled.clone(),
            },
        );
        crate::slog!(
            "Run finished: {} completed, {} failed, {} cancelled, ${:.4}",
            result.completed.len(),
            result.failed.len(),
            result.cancelled.len(),
            result.total_cost
        );
        self.emit(SchedulerEvent::RunCompleted {
            completed: result.completed.len(),
            failed: result.failed.len(),
            cancelled: result.cancelled.len(),
            total_cost: result.total_cost,
        });
        result
    }
}

fn empty_snapshot() -> SchedulerSnapshot {
    SchedulerSnapshot {
        tasks: Vec::new(),
        workers: Vec::new(),
        total_cost: 0.0,
        budget: 0.0,
        open_conflicts: Vec::new(),
        halt: None,
        elapsed_ms: 0,
    }
}
