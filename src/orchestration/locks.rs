//! Advisory resource locks for in-flight tasks.
//!
//! Each declared resource of a running task maps to that task's id. A
//! candidate conflicts when any of its declared resources is held by a
//! different task that is still Running. Undeclared resources are invisible
//! here.

use crate::core::{Plan, Task, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An overlap between a candidate task and a running task's declared
/// resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConflict {
    pub resource: String,
    /// The running task that holds the resource.
    pub holder: TaskId,
    /// The task that was deferred.
    pub blocked: TaskId,
    /// Flips to true once the holder reaches a terminal state.
    pub resolved: bool,
    /// Milliseconds since run start when the conflict was detected.
    pub detected_at_ms: u64,
}

impl ResourceConflict {
    pub fn new(resource: &str, holder: TaskId, blocked: TaskId) -> Self {
        Self {
            resource: resource.to_string(),
            holder,
            blocked,
            resolved: false,
            detected_at_ms: 0,
        }
    }

    /// Both task ids, holder first.
    pub fn task_ids(&self) -> [&TaskId; 2] {
        [&self.holder, &self.blocked]
    }
}

/// Resource identifier → id of the running task holding it.
#[derive(Debug, Default)]
pub struct ResourceLockTable {
    locks: HashMap<String, TaskId>,
}

impl ResourceLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// First declared resource of `task` held by another Running task.
    pub fn check_conflict(&self, task: &Task, plan: &Plan) -> Option<ResourceConflict> {
        task.resources.iter().find_map(|resource| {
            let holder = self.locks.get(resource)?;
            if holder == &task.id || plan.status_of(holder) != Some(TaskStatus::Running) {
                return None;
            }
            Some(ResourceConflict::new(
                resource,
                holder.clone(),
                task.id.clone(),
            ))
        })
    }

    /// Whether none of `task`'s declared resources is held by another task.
    pub fn is_free(&self, task: &Task) -> bool {
        task.resources
            .iter()
            .all(|r| self.locks.get(r).map_or(true, |holder| holder == &task.id))
    }

    /// Claim every declared resource of `task`.
    pub fn lock(&mut self, task: &Task) {
        for resource in &task.resources {
            self.locks.insert(resource.clone(), task.id.clone());
        }
    }

    /// Release every declared resource of `task`. Idempotent; entries held
    /// by other tasks are left alone.
    pub fn unlock(&mut self, task: &Task) {
        for resource in &task.resources {
            if self.locks.get(resource) == Some(&task.id) {
                self.locks.remove(resource);
            }
        }
    }

    pub fn holder(&self, resource: &str) -> Option<&TaskId> {
        self.locks.get(resource)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
