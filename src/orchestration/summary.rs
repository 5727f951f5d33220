//! Run result aggregation.

use crate::core::{Plan, Task, TaskId, TaskStatus};
use crate::orchestration::locks::ResourceConflict;
use serde::Serialize;
use std::time::Duration;

/// Why a run stopped admitting work before every task could run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    BudgetExceeded,
    Shutdown,
    /// No task could make progress (cycle, dangling or failed dependency).
    Stalled,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::BudgetExceeded => write!(f, "budget exceeded"),
            HaltReason::Shutdown => write!(f, "shutdown requested"),
            HaltReason::Stalled => write!(f, "stalled"),
        }
    }
}

/// Run-level counters gathered by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub total_cost: f64,
    pub duration: Duration,
    pub workers_used: usize,
    pub budget_exceeded: bool,
    pub halt: Option<HaltReason>,
    pub stalled: Vec<TaskId>,
}

/// Immutable summary of one scheduling run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub request: String,
    pub completed: Vec<Task>,
    pub failed: Vec<Task>,
    pub cancelled: Vec<Task>,
    pub conflicts: Vec<ResourceConflict>,
    pub total_cost: f64,
    pub duration_ms: u64,
    pub workers_used: usize,
    pub budget_exceeded: bool,
    /// Tasks cancelled because the run stalled.
    pub stalled: Vec<TaskId>,
    pub halt: Option<HaltReason>,
}

impl RunResult {
    /// True when every task completed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.completed.len() + self.failed.len() + self.cancelled.len()
    }

    pub fn completed_ids(&self) -> Vec<&TaskId> {
        self.completed.iter().map(|t| &t.id).collect()
    }

    pub fn failed_ids(&self) -> Vec<&TaskId> {
        self.failed.iter().map(|t| &t.id).collect()
    }

    pub fn cancelled_ids(&self) -> Vec<&TaskId> {
        self.cancelled.iter().map(|t| &t.id).collect()
    }
}

impl std::fmt::Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Request:   {}", self.request)?;
        writeln!(
            f,
            "Tasks:     {} completed, {} failed, {} cancelled",
            self.completed.len(),
            self.failed.len(),
            self.cancelled.len()
        )?;
        writeln!(f, "Cost:      ${:.4}", self.total_cost)?;
        writeln!(f, "Duration:  {:.1}s", self.duration_ms as f64 / 1000.0)?;
        writeln!(f, "Workers:   {}", self.workers_used)?;
        writeln!(f, "Conflicts: {}", self.conflicts.len())?;
        if let Some(halt) = self.halt {
            writeln!(f, "Halted:    {}", halt)?;
        }
        for task in &self.failed {
            writeln!(
                f,
                "  FAILED    {} (retries: {}): {}",
                task.id,
                task.retry_count,
                task.error.as_deref().unwrap_or("unknown error")
            )?;
        }
        for task in &self.cancelled {
            writeln!(
                f,
                "  CANCELLED {}: {}",
                task.id,
                task.error.as_deref().unwrap_or("cancelled")
            )?;
        }
        Ok(())
    }
}

/// Assemble the run result from the final plan state.
///
/// Tasks are grouped by status in plan order. Tasks still non-terminal
/// (only possible if the caller aggregates mid-run) are left out.
pub fn aggregate(plan: &Plan, conflicts: &[ResourceConflict], stats: RunStats) -> RunResult {
    let collect = |status: TaskStatus| -> Vec<Task> {
        plan.tasks_with_status(status).cloned().collect()
    };
    RunResult {
        request: plan.request.clone(),
        completed: collect(TaskStatus::Completed),
        failed: collect(TaskStatus::Failed),
        cancelled: collect(TaskStatus::Cancelled),
        conflicts: conflicts.to_vec(),
        total_cost: stats.total_cost,
        duration_ms: stats.duration.as_millis() as u64,
        workers_used: stats.workers_used,
        budget_exceeded: stats.budget_exceeded,
        stalled: stats.stalled,
        halt: stats.halt,
    }
}
