//! Run events for observers.
//!
//! The scheduler emits a `RunEvent` for every lifecycle change. Sinks are
//! write-only: the scheduler never reads anything back from them.

use crate::core::{TaskId, TaskStatus};
use crate::orchestration::WorkerId;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SchedulerEvent {
    /// Every status transition of every task.
    TaskStatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// A task was handed to a new worker.
    TaskAdmitted {
        task_id: TaskId,
        worker_id: WorkerId,
        attempt: u32,
    },
    /// A worker reported an action (tool call, file write, ...).
    Progress {
        task_id: TaskId,
        worker_id: WorkerId,
        action: String,
        resource: Option<String>,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
        cost: f64,
        duration_ms: u64,
    },
    /// An attempt failed. `will_retry` tells whether it goes back to Pending.
    TaskFailed {
        task_id: TaskId,
        worker_id: WorkerId,
        error: String,
        retry_count: u32,
        will_retry: bool,
    },
    ConflictDetected {
        task_id: TaskId,
        holder: TaskId,
        resource: String,
    },
    /// Emitted once per run.
    BudgetExceeded { total_cost: f64, budget: f64 },
    /// Emitted once per run when shutdown was requested.
    ShutdownRequested,
    /// No progress is possible; the listed tasks were cancelled.
    RunStalled { task_ids: Vec<TaskId> },
    RunCompleted {
        completed: usize,
        failed: usize,
        cancelled: usize,
        total_cost: f64,
    },
}

impl SchedulerEvent {
    /// The task the event is about, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            SchedulerEvent::TaskStatusChanged { task_id, .. }
            | SchedulerEvent::TaskAdmitted { task_id, .. }
            | SchedulerEvent::Progress { task_id, .. }
            | SchedulerEvent::TaskCompleted { task_id, .. }
            | SchedulerEvent::TaskFailed { task_id, .. }
            | SchedulerEvent::ConflictDetected { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// A timestamped event.
///
/// Serialized as one flat JSON object: `{"elapsed_ms": 12, "event": "task_admitted", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub event: SchedulerEvent,
}

/// Notification sink for run events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RunEvent);
}

/// Forwards events into a channel. A dropped receiver is ignored.
impl EventSink for mpsc::UnboundedSender<RunEvent> {
    fn emit(&self, event: RunEvent) {
        let _ = self.send(event);
    }
}

/// In-memory recorder, cheap to clone and inspect after a run.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<RunEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Status sequence of one task, starting with its first `from`.
    pub fn status_history(&self, task_id: &TaskId) -> Vec<TaskStatus> {
        let mut history = Vec::new();
        for event in self.events() {
            if let SchedulerEvent::TaskStatusChanged { task_id: id, from, to } = event.event {
                if &id == task_id {
                    if history.is_empty() {
                        history.push(from);
                    }
                    history.push(to);
                }
            }
        }
        history
    }

    /// Events matching a predicate.
    pub fn filter<F>(&self, pred: F) -> Vec<SchedulerEvent>
    where
        F: Fn(&SchedulerEvent) -> bool,
    {
        self.events()
            .into_iter()
            .map(|e| e.event)
            .filter(|e| pred(e))
            .collect()
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: RunEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Fans an event out to several sinks.
impl EventSink for Vec<Box<dyn EventSink>> {
    fn emit(&self, event: RunEvent) {
        for sink in self {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(id: &str, from: TaskStatus, to: TaskStatus) -> RunEvent {
        RunEvent {
            elapsed_ms: 0,
            event: SchedulerEvent::TaskStatusChanged {
                task_id: TaskId::from(id),
                from,
                to,
            },
        }
    }

    #[test]
    fn test_event_log_records_in_order() {
        let log = EventLog::new();
        assert!(log.is_empty());
        log.emit(changed("a", TaskStatus::Pending, TaskStatus::Running));
        log.emit(changed("a", TaskStatus::Running, TaskStatus::Completed));
        assert_eq!(log.len(), 2);
        assert_eq!(
            log.status_history(&TaskId::from("a")),
            vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed]
        );
        assert!(log.status_history(&TaskId::from("b")).is_empty());
    }

    #[test]
    fn test_event_log_clones_share_storage() {
        let log = EventLog::new();
        let handle = log.clone();
        handle.emit(changed("a", TaskStatus::Pending, TaskStatus::Blocked));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        tx.emit(changed("a", TaskStatus::Pending, TaskStatus::Running));
    }

    #[test]
    fn test_fan_out_sink() {
        let first = EventLog::new();
        let second = EventLog::new();
        let sinks: Vec<Box<dyn EventSink>> = vec![Box::new(first.clone()), Box::new(second.clone())];
        sinks.emit(changed("a", TaskStatus::Pending, TaskStatus::Running));
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_event_serializes_flat_with_tag() {
        let event = RunEvent {
            elapsed_ms: 12,
            event: SchedulerEvent::BudgetExceeded {
                total_cost: 1.2,
                budget: 1.0,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "budget_exceeded");
        assert_eq!(json["elapsed_ms"], 12);
        assert_eq!(json["budget"], 1.0);
    }

    #[test]
    fn test_event_parses_from_json_line() {
        let line = r#"{"elapsed_ms": 340, "event": "task_failed", "task_id": "task-2",
            "worker_id": "8f14e45f-ceea-467f-a0e6-f3c4a1b2c3d4", "error": "tests failed",
            "retry_count": 1, "will_retry": true}"#;
        let event: RunEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.elapsed_ms, 340);
        assert!(matches!(
            event.event,
            SchedulerEvent::TaskFailed { retry_count: 1, will_retry: true, ref error, .. }
                if error == "tests failed"
        ));

        let bare: RunEvent =
            serde_json::from_str(r#"{"elapsed_ms": 1, "event": "shutdown_requested"}"#).unwrap();
        assert_eq!(bare.event, SchedulerEvent::ShutdownRequested);
    }

    #[test]
    fn test_task_id_accessor() {
        let event = SchedulerEvent::ConflictDetected {
            task_id: TaskId::from("b"),
            holder: TaskId::from("a"),
            resource: "f1".to_string(),
        };
        assert_eq!(event.task_id(), Some(&TaskId::from("b")));
        assert_eq!(SchedulerEvent::ShutdownRequested.task_id(), None);
    }
}
