//! Worker table for one scheduling run.
//!
//! A worker is the live execution of exactly one task attempt. The
//! `WorkerTable` tracks the ones in flight, enforces the concurrency limit,
//! and retires workers when their attempt ends. Workers are never reused.

use crate::core::TaskId;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Unique identifier for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.short())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Working,
    Completed,
    Failed,
}

/// Bookkeeping for one in-flight task attempt.
///
/// `last_action` and `resources_touched` are observability only; conflict
/// detection uses the task's declared resources.
#[derive(Debug, Clone, Serialize)]
pub struct Worker {
    pub id: WorkerId,
    pub task_id: TaskId,
    pub agent_type: String,
    pub status: WorkerStatus,
    pub cost: f64,
    pub actions: u32,
    pub last_action: Option<String>,
    pub resources_touched: Vec<String>,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    seq: usize,
}

impl Worker {
    fn new(task_id: TaskId, agent_type: &str, seq: usize) -> Self {
        Self {
            id: WorkerId::new(),
            task_id,
            agent_type: agent_type.to_string(),
            status: WorkerStatus::Working,
            cost: 0.0,
            actions: 0,
            last_action: None,
            resources_touched: Vec::new(),
            started: Instant::now(),
            seq,
        }
    }

    /// Display name, e.g. `coder-task-1`.
    pub fn name(&self) -> String {
        format!("{}-{}", self.agent_type, self.task_id)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Tracks in-flight workers and the concurrency limit.
#[derive(Debug)]
pub struct WorkerTable {
    workers: HashMap<WorkerId, Worker>,
    max_concurrent: usize,
    spawned: usize,
}

impl WorkerTable {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            workers: HashMap::new(),
            max_concurrent,
            spawned: 0,
        }
    }

    /// Register a worker for a task attempt.
    ///
    /// # Errors
    /// Returns [`Error::WorkerPoolFull`] when the limit is reached.
    pub fn spawn(&mut self, task_id: &TaskId, agent_type: &str) -> Result<WorkerId> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.max_concurrent,
            });
        }
        let worker = Worker::new(task_id.clone(), agent_type, self.spawned);
        let id = worker.id;
        self.workers.insert(id, worker);
        self.spawned += 1;
        Ok(id)
    }

    /// Note an action reported by a worker.
    pub fn record_progress(&mut self, id: &WorkerId, action: &str, resource: Option<&str>) {
        if let Some(worker) = self.workers.get_mut(id) {
            worker.actions += 1;
            worker.last_action = Some(action.to_string());
            if let Some(resource) = resource {
                if !worker.resources_touched.iter().any(|r| r == resource) {
                    worker.resources_touched.push(resource.to_string());
                }
            }
        }
    }

    /// Remove a worker whose attempt has ended.
    ///
    /// # Errors
    /// Returns [`Error::WorkerNotFound`] for an unknown or already retired id.
    pub fn retire(&mut self, id: &WorkerId, status: WorkerStatus, cost: f64) -> Result<Worker> {
        let mut worker = self
            .workers
            .remove(id)
            .ok_or(Error::WorkerNotFound { id: *id })?;
        worker.status = status;
        worker.cost = cost;
        Ok(worker)
    }

    pub fn get(&self, id: &WorkerId) -> Option<&Worker> {
        self.workers.get(id)
    }

    /// In-flight workers, oldest first.
    pub fn active(&self) -> Vec<&Worker> {
        let mut workers: Vec<&Worker> = self.workers.values().collect();
        workers.sort_by_key(|w| w.seq);
        workers
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Workers created over the whole run.
    pub fn spawned(&self) -> usize {
        self.spawned
    }
}
