//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Fast scheduler configs
//! - Predefined plans
//! - Running a plan and capturing its events

use std::sync::Arc;
use std::time::Duration;

use swarm::core::{Plan, Task};
use swarm::orchestration::{
    EventLog, RunResult, Scheduler, SchedulerConfig, SimulatedExecutor, SimulatedStep,
};

/// Scheduler config with a short poll interval.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

/// A successful attempt with the given cost and a short delay.
pub fn quick(cost: f64) -> SimulatedStep {
    SimulatedStep::succeed(cost, Duration::from_millis(10))
}

/// A failed attempt with a short delay.
pub fn broken(error: &str) -> SimulatedStep {
    SimulatedStep::fail(error, Duration::from_millis(5))
}

/// `n` independent tasks named t0..tn.
pub fn independent_tasks(n: usize) -> Vec<Task> {
    (0..n)
        .map(|i| Task::new(format!("t{}", i), &format!("Task {}", i)))
        .collect()
}

/// a and b both write f1; c needs both.
pub fn shared_file_plan() -> Plan {
    Plan::new(
        "shared file",
        vec![
            Task::new("a", "Edit f1 first").with_resources(["f1"]),
            Task::new("b", "Edit f1 second").with_resources(["f1"]),
            Task::new("c", "Check the result").with_dependencies(["a", "b"]),
        ],
    )
    .expect("valid plan")
}

/// Run a plan to completion and return the result with every event.
pub async fn run_plan(
    plan: Plan,
    config: SchedulerConfig,
    executor: Arc<SimulatedExecutor>,
) -> (RunResult, EventLog) {
    let log = EventLog::new();
    let result = Scheduler::new(plan, config, executor)
        .expect("valid config")
        .with_events(log.clone())
        .run()
        .await;
    (result, log)
}

pub fn ids<T: ToString>(items: &[T]) -> Vec<String> {
    items.iter().map(|t| t.to_string()).collect()
}
