//! Retry, budget, stall and shutdown tests.
//!
//! These tests verify that runs always end with a result, whatever goes
//! wrong along the way.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use swarm::core::{Plan, Task, TaskId, TaskStatus};
use swarm::orchestration::{
    EventLog, HaltReason, Scheduler, SchedulerConfig, SchedulerEvent, SimulatedExecutor,
    SimulatedStep,
};

use crate::fixtures::{broken, fast_config, ids, independent_tasks, quick, run_plan};

/// Test: Retry exhaustion
/// Given a task that always fails and max_retries = 2
/// When the plan runs
/// Then it is attempted 3 times and ends Failed with retry_count 2
#[tokio::test]
async fn test_retries_exhausted() {
    let plan = Plan::new("always fails", vec![Task::new("a", "A")]).unwrap();
    let exec = Arc::new(SimulatedExecutor::new(broken("compile error")));
    let config = SchedulerConfig {
        max_retries: 2,
        ..fast_config()
    };
    let (result, log) = run_plan(plan, config, exec.clone()).await;

    assert_eq!(
        log.status_history(&TaskId::from("a")),
        vec![
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Failed,
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Failed,
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Failed,
        ]
    );
    assert_eq!(exec.attempts("a"), 3);
    assert!(!result.is_success());
    let failed = &result.failed[0];
    assert_eq!(failed.retry_count, 2);
    assert_eq!(failed.error.as_deref(), Some("compile error"));

    let retries: Vec<bool> = log
        .filter(|e| matches!(e, SchedulerEvent::TaskFailed { .. }))
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::TaskFailed { will_retry, .. } => Some(will_retry),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![true, true, false]);
}

/// Test: Flaky task recovers
/// Given a task that fails once then succeeds, with one retry allowed
/// When the plan runs
/// Then it completes and the failed attempt's cost is kept
#[tokio::test]
async fn test_flaky_task_recovers_on_retry() {
    let plan = Plan::new("flaky", vec![Task::new("a", "A")]).unwrap();
    let exec = Arc::new(SimulatedExecutor::new(quick(0.2)).script(
        "a",
        vec![
            SimulatedStep::Fail {
                error: "rate limited".to_string(),
                cost: 0.05,
                delay: Duration::from_millis(5),
            },
            quick(0.2),
        ],
    ));
    let config = SchedulerConfig {
        max_retries: 1,
        ..fast_config()
    };
    let (result, _) = run_plan(plan, config, exec).await;

    assert!(result.is_success());
    assert_eq!(result.completed[0].retry_count, 1);
    assert!((result.total_cost - 0.25).abs() < 1e-9);
}

/// Test: Budget overshoot by in-flight work
/// Given budget 1.0 and two parallel tasks costing 0.6 each
/// When the plan runs
/// Then both complete and the run reports the budget as exceeded
#[tokio::test]
async fn test_budget_exceeded_by_running_tasks() {
    let plan = Plan::new("pricey", independent_tasks(2)).unwrap();
    let exec = Arc::new(SimulatedExecutor::new(quick(0.6)));
    let config = SchedulerConfig {
        budget: 1.0,
        ..fast_config()
    };
    let (result, log) = run_plan(plan, config, exec).await;

    assert_eq!(result.completed.len(), 2);
    assert_eq!(result.cancelled.len(), 0);
    assert!(result.budget_exceeded);
    assert!((result.total_cost - 1.2).abs() < 1e-9);
    assert_eq!(
        log.filter(|e| matches!(e, SchedulerEvent::BudgetExceeded { .. }))
            .len(),
        1
    );
}

/// Test: Budget halts admission
/// Given a chain whose first task spends the whole budget
/// When the plan runs
/// Then the remaining tasks are cancelled, never started
#[tokio::test]
async fn test_budget_cancels_pending_tasks() {
    let plan = Plan::new(
        "chain",
        vec![
            Task::new("a", "A"),
            Task::new("b", "B").with_dependencies(["a"]),
            Task::new("c", "C").with_dependencies(["b"]),
        ],
    )
    .unwrap();
    let exec = Arc::new(SimulatedExecutor::new(quick(0.5)).script("a", vec![quick(1.5)]));
    let config = SchedulerConfig {
        budget: 1.0,
        ..fast_config()
    };
    let (result, _) = run_plan(plan, config, exec.clone()).await;

    assert_eq!(ids(&result.completed_ids()), vec!["a"]);
    assert_eq!(ids(&result.cancelled_ids()), vec!["b", "c"]);
    assert_eq!(result.halt, Some(HaltReason::BudgetExceeded));
    assert!(result.budget_exceeded);
    assert_eq!(exec.attempts("b"), 0);
    for task in &result.cancelled {
        assert!(task
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("budget exceeded")));
    }
}

/// Test: Cycle detection at run time
/// Given two tasks depending on each other
/// When the plan runs
/// Then the run stalls, cancels both and returns
#[tokio::test]
async fn test_cycle_stalls_and_returns() {
    let plan = Plan::new(
        "cycle",
        vec![
            Task::new("a", "A").with_dependencies(["b"]),
            Task::new("b", "B").with_dependencies(["a"]),
            Task::new("c", "C"),
        ],
    )
    .unwrap();
    let exec = Arc::new(SimulatedExecutor::new(quick(0.0)));
    let (result, log) = run_plan(plan, fast_config(), exec).await;

    assert_eq!(ids(&result.completed_ids()), vec!["c"]);
    assert_eq!(ids(&result.stalled), vec!["a", "b"]);
    assert_eq!(result.halt, Some(HaltReason::Stalled));
    assert!(result.cancelled.iter().all(|t| t
        .error
        .as_deref()
        .is_some_and(|e| e.contains("can never become ready"))));
    assert_eq!(
        log.filter(|e| matches!(e, SchedulerEvent::RunStalled { .. }))
            .len(),
        1
    );
}

/// Test: Permanent failure strands dependents
/// Given b depending on a failing task
/// When the plan runs
/// Then b is cancelled with the failed dependency named
#[tokio::test]
async fn test_failed_dependency_cancels_dependents() {
    let plan = Plan::new(
        "downstream",
        vec![
            Task::new("a", "A"),
            Task::new("b", "B").with_dependencies(["a"]),
            Task::new("c", "C").with_dependencies(["b"]),
        ],
    )
    .unwrap();
    let exec = Arc::new(SimulatedExecutor::new(quick(0.0)).script("a", vec![broken("boom")]));
    let (result, _) = run_plan(plan, fast_config(), exec).await;

    assert_eq!(ids(&result.failed_ids()), vec!["a"]);
    assert_eq!(ids(&result.cancelled_ids()), vec!["b", "c"]);
    assert_eq!(result.task_count(), 3);
    let reason = result.cancelled[0].error.as_deref().unwrap_or_default();
    assert!(reason.contains("dependency a did not complete"), "{}", reason);
}

/// Test: Cooperative shutdown
/// Given a long-running task and a pending dependent
/// When the shutdown token is cancelled mid-run
/// Then the running task finishes and the dependent is cancelled
#[tokio::test]
async fn test_shutdown_drains_running_work() {
    let plan = Plan::new(
        "shutdown",
        vec![
            Task::new("a", "A"),
            Task::new("b", "B").with_dependencies(["a"]),
        ],
    )
    .unwrap();
    let exec = Arc::new(SimulatedExecutor::new(SimulatedStep::succeed(
        0.1,
        Duration::from_millis(100),
    )));
    let token = CancellationToken::new();
    let log = EventLog::new();
    let scheduler = Scheduler::new(plan, fast_config(), exec)
        .unwrap()
        .with_shutdown(token.clone())
        .with_events(log.clone());

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });
    let result = scheduler.run().await;

    assert_eq!(result.halt, Some(HaltReason::Shutdown));
    assert_eq!(ids(&result.completed_ids()), vec!["a"]);
    assert_eq!(ids(&result.cancelled_ids()), vec!["b"]);
    assert_eq!(
        log.filter(|e| matches!(e, SchedulerEvent::ShutdownRequested))
            .len(),
        1
    );
}
