//! End-to-end workflow tests.
//!
//! These tests go from a plan on disk (or a built-in scenario) to a final
//! run result, through config loading and the scheduler.

use std::io::Write;
use std::sync::Arc;

use tempfile::{NamedTempFile, TempDir};

use swarm::config::Config;
use swarm::core::{Plan, TaskId, TaskStatus};
use swarm::demo::Scenario;
use swarm::orchestration::{
    EventLog, EventSink, ProfileRegistry, Scheduler, SchedulerConfig, SchedulerEvent,
    SimulatedExecutor,
};
use swarm::session::SessionStore;
use swarm::util::blocking;

use crate::fixtures::{fast_config, ids, quick, run_plan};

const PLAN_JSON: &str = r#"{
    "request": "Add rate limiting",
    "model": "sonnet",
    "estimated_cost": 0.4,
    "tasks": [
        {"id": "task-1", "description": "Write limiter", "agent_type": "coder",
         "files_to_modify": ["src/limiter.rs"]},
        {"id": "task-2", "description": "Wire into router", "agent_type": "coder",
         "dependencies": ["task-1"], "files_to_modify": ["src/router.rs"]},
        {"id": "task-3", "description": "Test limiter", "agent_type": "tester",
         "dependencies": ["task-1"], "files_to_modify": ["tests/limiter.rs"]},
        {"id": "task-4", "description": "Review", "agent_type": "reviewer",
         "dependencies": ["task-2", "task-3"]}
    ]
}"#;

/// Test: Plan file to result
/// Given a JSON plan on disk
/// When it is loaded and run
/// Then every task completes in wave order
#[tokio::test]
async fn test_plan_file_runs_to_completion() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(PLAN_JSON.as_bytes()).unwrap();
    let path = file.path().to_path_buf();
    let plan = blocking(move || Plan::load(&path)).await.unwrap();

    assert_eq!(plan.model, "sonnet");
    assert_eq!(plan.estimated_cost, 0.4);
    assert_eq!(
        plan.wave_decomposition(),
        vec![
            vec![TaskId::from("task-1")],
            vec![TaskId::from("task-2"), TaskId::from("task-3")],
            vec![TaskId::from("task-4")],
        ]
    );

    let exec = Arc::new(SimulatedExecutor::new(quick(0.05)));
    let (result, _) = run_plan(plan, fast_config(), exec).await;

    assert!(result.is_success());
    assert_eq!(result.request, "Add rate limiting");
    assert_eq!(
        ids(&result.completed_ids()),
        vec!["task-1", "task-2", "task-3", "task-4"]
    );
    assert!(result
        .completed
        .iter()
        .all(|t| t.result.as_deref().is_some_and(|r| r.contains("finished"))));
}

/// Test: Decomposer output as a plan
/// Given decomposer text with a fenced JSON block
/// When it is parsed and run
/// Then the embedded tasks run with default tools
#[tokio::test]
async fn test_decomposition_output_runs() {
    let text = "Here is the breakdown:\n```json\n{\"tasks\": [\
        {\"id\": \"a\", \"description\": \"first\"},\
        {\"id\": \"b\", \"description\": \"second\", \"dependencies\": [\"a\"]}\
    ]}\n```\nGood luck.";
    let plan = Plan::from_decomposition("two steps", "opus", text).unwrap();
    assert_eq!(plan.len(), 2);
    assert!(plan.tasks().iter().all(|t| !t.tools.is_empty()));

    let (result, _) = run_plan(plan, fast_config(), Arc::new(SimulatedExecutor::default())).await;
    assert_eq!(ids(&result.completed_ids()), vec!["a", "b"]);
}

/// Test: Demo scenario end to end
/// Given the auth scenario at high speed
/// When it runs through the scheduler
/// Then every task completes and the costs add up
#[tokio::test]
async fn test_auth_demo_end_to_end() {
    let scenario = Scenario::Auth;
    let plan = scenario.plan().unwrap();
    let exec = Arc::new(scenario.executor(100.0));
    let (result, log) = run_plan(plan, fast_config(), exec.clone()).await;

    assert!(result.is_success(), "{}", result);
    assert_eq!(result.completed.len(), 5);
    let expected = 0.046 * 3.0 + 0.031 + 0.018;
    assert!((result.total_cost - expected).abs() < 1e-9);

    // The reviewer needs every coder task first.
    let order: Vec<String> = exec
        .invocations()
        .iter()
        .map(|i| i.task_id.to_string())
        .collect();
    assert_eq!(order.last().map(String::as_str), Some("task-5"));
    assert_eq!(
        log.status_history(&TaskId::from("task-5")).last(),
        Some(&TaskStatus::Completed)
    );
}

/// Test: Demo under a tight limit
/// Given the api scenario with a single worker
/// When it runs
/// Then tasks run one at a time and still all complete
#[tokio::test]
async fn test_api_demo_single_worker() {
    let scenario = Scenario::Api;
    let exec = Arc::new(scenario.executor(100.0));
    let config = SchedulerConfig {
        max_concurrent: 1,
        ..fast_config()
    };
    let (result, _) = run_plan(scenario.plan().unwrap(), config, exec.clone()).await;

    assert!(result.is_success());
    assert_eq!(exec.peak_concurrency(), 1);
    assert_eq!(result.workers_used, 4);
}

/// Test: Config file drives the run
/// Given a swarm.toml in the working directory
/// When the scheduler config is built from it
/// Then its limits apply to the run
#[tokio::test]
async fn test_config_file_limits_apply() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("swarm.toml"),
        "[swarm]\nmax_concurrent = 1\nbudget_usd = 0.15\npoll_interval_ms = 5\n\n\
         [agents.coder]\nmodel = \"sonnet\"\n",
    )
    .unwrap();

    let config = Config::load(None, dir.path()).unwrap();
    let scheduler_config = config.scheduler_config(dir.path()).unwrap();
    assert_eq!(scheduler_config.max_concurrent, 1);
    assert_eq!(config.profiles().profile("coder").model, "sonnet");

    let plan = Plan::new("budgeted", crate::fixtures::independent_tasks(4)).unwrap();
    let exec = Arc::new(SimulatedExecutor::new(quick(0.1)));
    let log = EventLog::new();
    let result = Scheduler::new(plan, scheduler_config, exec)
        .unwrap()
        .with_profiles(config.profiles())
        .with_events(log.clone())
        .run()
        .await;

    // One at a time: the second completion crosses 0.15 and the rest never start.
    assert_eq!(result.completed.len(), 2);
    assert_eq!(result.cancelled.len(), 2);
    assert!(result.budget_exceeded);
    assert_eq!(
        log.filter(|e| matches!(e, SchedulerEvent::TaskAdmitted { .. }))
            .len(),
        2
    );
}

/// Test: Result serialization
/// Given a finished run
/// When the result is written as JSON
/// Then the task buckets and totals are present
#[tokio::test]
async fn test_run_result_json() {
    let plan = Plan::new("json", crate::fixtures::independent_tasks(2)).unwrap();
    let result = Scheduler::new(plan, fast_config(), Arc::new(SimulatedExecutor::new(quick(0.1))))
        .unwrap()
        .with_profiles(ProfileRegistry::default())
        .run()
        .await;

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["request"], "json");
    assert_eq!(json["completed"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["failed"].as_array().map(Vec::len), Some(0));
    assert_eq!(json["budget_exceeded"], false);
    assert!(json["halt"].is_null());
}

const STALE_PLAN_JSON: &str = r#"{
    "request": "Resume an interrupted run",
    "tasks": [
        {"id": "task-1", "description": "Was running", "status": "running",
         "assigned_worker": "8f14e45f-ceea-467f-a0e6-f3c4a1b2c3d4"},
        {"id": "task-2", "description": "Was done", "status": "completed",
         "result": "old output", "cost": 0.9, "duration_ms": 1200},
        {"id": "task-3", "description": "Was failing", "status": "failed",
         "dependencies": ["task-2"], "error": "old error", "retry_count": 4}
    ]
}"#;

/// Test: Plan file saved mid-run
/// Given a plan on disk whose tasks carry status, cost and retries
/// When it is loaded and run
/// Then every task starts fresh, runs once and the run finishes
#[tokio::test]
async fn test_plan_file_with_run_state_runs_fresh() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(STALE_PLAN_JSON.as_bytes()).unwrap();
    let path = file.path().to_path_buf();
    let plan = blocking(move || Plan::load(&path)).await.unwrap();

    for task in plan.tasks() {
        assert_eq!(task.status, TaskStatus::Pending, "{}", task.id);
        assert!(task.assigned_worker.is_none());
        assert!(task.result.is_none());
        assert!(task.error.is_none());
        assert_eq!(task.cost, 0.0);
        assert_eq!(task.retry_count, 0);
    }

    let exec = Arc::new(SimulatedExecutor::new(quick(0.1)));
    let (result, _) = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        run_plan(plan, fast_config(), exec.clone()),
    )
    .await
    .expect("run finished");

    assert!(result.is_success(), "{}", result);
    assert_eq!(
        ids(&result.completed_ids()),
        vec!["task-1", "task-2", "task-3"]
    );
    for id in ["task-1", "task-2", "task-3"] {
        assert_eq!(exec.attempts(id), 1, "{}", id);
    }
    assert!((result.total_cost - 0.3).abs() < 1e-9);
}

/// Test: Recorded session replays the live timeline
/// Given a demo run fanned out to a live log and a session recorder
/// When the session is loaded back from disk
/// Then it lists with its outcome and replays exactly the live events
#[tokio::test]
async fn test_recorded_session_matches_live_events() {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::new(dir.path().join("sessions"));
    let scenario = Scenario::Auth;
    let plan = scenario.plan().unwrap();
    let recorder = store.create(&plan.request, dir.path(), plan.len()).unwrap();

    let live = EventLog::new();
    let sinks: Vec<Box<dyn EventSink>> = vec![Box::new(live.clone()), Box::new(recorder.clone())];
    let result = Scheduler::new(plan, fast_config(), Arc::new(scenario.executor(100.0)))
        .unwrap()
        .with_events(sinks)
        .run()
        .await;
    recorder.finish(&result).unwrap();

    let sessions = store.list(20).await.unwrap();
    assert_eq!(sessions.len(), 1);
    let meta = &sessions[0];
    assert_eq!(meta.id, recorder.id());
    assert_eq!(meta.task_count, 5);
    let outcome = meta.outcome.as_ref().unwrap();
    assert!(outcome.success);
    assert!((outcome.total_cost - result.total_cost).abs() < 1e-9);

    let id = store.resolve(&meta.id.short()).unwrap();
    let replayed = store.load_events(id).await.unwrap();
    let live = live.events();
    assert_eq!(replayed.len(), live.len());
    for (recorded, seen) in replayed.iter().zip(&live) {
        assert_eq!(recorded.elapsed_ms, seen.elapsed_ms);
        assert_eq!(recorded.event.task_id(), seen.event.task_id());
        assert_eq!(
            std::mem::discriminant(&recorded.event),
            std::mem::discriminant(&seen.event)
        );
    }
}
