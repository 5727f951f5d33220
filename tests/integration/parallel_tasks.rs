//! Parallel execution correctness tests.
//!
//! These tests verify that runs respect the concurrency limit and never
//! let two tasks touching the same resource overlap.

use std::sync::Arc;
use std::time::Duration;

use swarm::core::{Plan, Task, TaskId, TaskStatus};
use swarm::orchestration::{SchedulerConfig, SchedulerEvent, SimulatedExecutor, SimulatedStep};

use crate::fixtures::{fast_config, ids, independent_tasks, quick, run_plan, shared_file_plan};

/// Test: Shared file conflict
/// Given a and b writing f1 and c depending on both, limit 2
/// When the plan runs
/// Then b waits for a, c runs last and the conflict is recorded
#[tokio::test]
async fn test_shared_resource_is_serialized() {
    let exec = Arc::new(SimulatedExecutor::new(quick(0.1)));
    let config = SchedulerConfig {
        max_concurrent: 2,
        ..fast_config()
    };
    let (result, log) = run_plan(shared_file_plan(), config, exec.clone()).await;

    assert!(result.is_success());
    assert_eq!(result.completed.len(), 3);

    assert_eq!(result.conflicts.len(), 1);
    let conflict = &result.conflicts[0];
    assert_eq!(conflict.resource, "f1");
    assert_eq!(ids(&conflict.task_ids()), vec!["a", "b"]);
    assert!(conflict.resolved);

    assert_eq!(
        log.status_history(&TaskId::from("b")),
        vec![
            TaskStatus::Pending,
            TaskStatus::Blocked,
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
        ]
    );

    let order: Vec<String> = exec
        .invocations()
        .iter()
        .map(|i| i.task_id.to_string())
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

/// Test: Overlapping resources never run concurrently
/// Given tasks sharing resources pairwise
/// When the plan runs with spare capacity
/// Then no invocation overlaps another that shares a resource
#[tokio::test]
async fn test_overlapping_resources_never_concurrent() {
    let plan = Plan::new(
        "overlap",
        vec![
            Task::new("a", "A").with_resources(["x", "y"]),
            Task::new("b", "B").with_resources(["y", "z"]),
            Task::new("c", "C").with_resources(["z"]),
            Task::new("d", "D").with_resources(["w"]),
        ],
    )
    .unwrap();
    let resources = |id: &TaskId| -> Vec<&'static str> {
        match id.as_str() {
            "a" => vec!["x", "y"],
            "b" => vec!["y", "z"],
            "c" => vec!["z"],
            _ => vec!["w"],
        }
    };
    let exec = Arc::new(SimulatedExecutor::new(SimulatedStep::succeed(
        0.0,
        Duration::from_millis(20),
    )));
    let (result, _) = run_plan(plan, fast_config(), exec.clone()).await;

    assert!(result.is_success());
    for invocation in exec.invocations() {
        let mine = resources(&invocation.task_id);
        for other in &invocation.concurrent_with {
            assert!(
                resources(other).iter().all(|r| !mine.contains(r)),
                "{} ran alongside {} on a shared resource",
                invocation.task_id,
                other
            );
        }
    }
    assert!(!result.conflicts.is_empty());
}

/// Test: Concurrency limit
/// Given 8 independent tasks and a limit of 3
/// When the plan runs
/// Then at most 3 run at once and all complete
#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let plan = Plan::new("wide", independent_tasks(8)).unwrap();
    let exec = Arc::new(SimulatedExecutor::new(SimulatedStep::succeed(
        0.01,
        Duration::from_millis(25),
    )));
    let config = SchedulerConfig {
        max_concurrent: 3,
        ..fast_config()
    };
    let (result, log) = run_plan(plan, config, exec.clone()).await;

    assert_eq!(result.completed.len(), 8);
    assert_eq!(exec.peak_concurrency(), 3);
    assert_eq!(result.workers_used, 8);
    assert!((result.total_cost - 0.08).abs() < 1e-9);

    let admitted = log.filter(|e| matches!(e, SchedulerEvent::TaskAdmitted { .. }));
    assert_eq!(admitted.len(), 8);
}

/// Test: Independent tasks fan out
/// Given 4 independent tasks and a limit of 4
/// When the plan runs
/// Then all 4 run at the same time
#[tokio::test]
async fn test_independent_tasks_run_in_parallel() {
    let plan = Plan::new("fan out", independent_tasks(4)).unwrap();
    let exec = Arc::new(SimulatedExecutor::new(SimulatedStep::succeed(
        0.0,
        Duration::from_millis(40),
    )));
    let (result, _) = run_plan(plan, fast_config(), exec.clone()).await;

    assert!(result.is_success());
    assert_eq!(exec.peak_concurrency(), 4);
    assert!(result.conflicts.is_empty());
}

/// Test: Dependencies gate admission
/// Given a diamond a -> (b, c) -> d
/// When the plan runs
/// Then every task starts only after its dependencies completed
#[tokio::test]
async fn test_diamond_respects_dependencies() {
    let plan = Plan::new(
        "diamond",
        vec![
            Task::new("a", "A"),
            Task::new("b", "B").with_dependencies(["a"]),
            Task::new("c", "C").with_dependencies(["a"]),
            Task::new("d", "D").with_dependencies(["b", "c"]),
        ],
    )
    .unwrap();
    let exec = Arc::new(SimulatedExecutor::new(quick(0.0)));
    let (result, log) = run_plan(plan, fast_config(), exec.clone()).await;

    assert!(result.is_success());
    let order: Vec<String> = exec
        .invocations()
        .iter()
        .map(|i| i.task_id.to_string())
        .collect();
    assert_eq!(order.first().map(String::as_str), Some("a"));
    assert_eq!(order.last().map(String::as_str), Some("d"));

    let events = log.events();
    let position = |wanted: &SchedulerEvent| events.iter().position(|e| &e.event == wanted);
    let completed = |id: &str| {
        events.iter().position(|e| {
            matches!(&e.event, SchedulerEvent::TaskCompleted { task_id, .. } if task_id.as_str() == id)
        })
    };
    let started_d = position(&SchedulerEvent::TaskStatusChanged {
        task_id: TaskId::from("d"),
        from: TaskStatus::Pending,
        to: TaskStatus::Running,
    })
    .unwrap();
    assert!(completed("b").unwrap() < started_d);
    assert!(completed("c").unwrap() < started_d);
}
