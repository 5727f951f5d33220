use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use swarm::config::Config;
use swarm::core::Plan;
use swarm::demo::Scenario;
use swarm::orchestration::{
    ClaudeExecutor, EventSink, Executor, ProfileRegistry, RunEvent, RunResult, Scheduler,
    SchedulerConfig, SchedulerEvent, SimulatedExecutor, SimulatedStep,
};
use swarm::session::{SessionRecorder, SessionStore};
use swarm::util::{blocking, one_line};
use swarm::{slog, slog_error, slog_warn, Result};

/// Swarm - run a plan of dependent tasks across parallel agents
#[derive(Parser, Debug)]
#[command(name = "swarm")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    SWARM_DEBUG=1   Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.swarm/swarm.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Execute a plan file
    Run(RunArgs),

    /// Show the execution waves of a plan file
    Waves {
        plan: PathBuf,
    },

    /// Run a built-in scenario on the simulated executor
    Demo {
        #[arg(long, value_enum, default_value_t = Scenario::Auth)]
        scenario: Scenario,

        /// Speed multiplier (2.0 = twice as fast)
        #[arg(long, default_value_t = 1.0)]
        speed: f64,

        /// Maximum concurrent agents
        #[arg(short = 'n', long, default_value_t = 4)]
        max_concurrent: usize,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// List recorded runs, newest first
    Sessions {
        /// Number of sessions to show
        #[arg(short = 'l', long, default_value_t = 20)]
        limit: usize,
    },

    /// Print the timeline of a recorded run
    Replay {
        /// Session id, or a unique prefix of one
        session_id: String,

        /// Print the recorded events as JSON lines
        #[arg(long)]
        events: bool,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Plan file: a JSON plan, or decomposer output containing one
    plan: PathBuf,

    /// Working directory for agents (defaults to the current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Maximum concurrent agents
    #[arg(short = 'n', long)]
    max_concurrent: Option<usize>,

    /// Budget ceiling in USD
    #[arg(short = 'b', long)]
    budget: Option<f64>,

    /// Retries per failed task
    #[arg(short = 'r', long)]
    retries: Option<u32>,

    /// Config file (defaults to swarm.toml lookup)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Use the simulated executor instead of claude
    #[arg(long)]
    simulate: bool,

    /// Print the execution waves and stop
    #[arg(long)]
    dry_run: bool,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct OutputArgs {
    /// Stream run events as JSON lines
    #[arg(long)]
    events: bool,

    /// Print the run result as JSON
    #[arg(long)]
    json: bool,

    /// Do not record the run under ~/.swarm/sessions
    #[arg(long)]
    no_record: bool,
}

/// How run progress is shown on the terminal.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Output {
    Human,
    Events,
    Json,
}

impl Output {
    fn from_flags(events: bool, json: bool) -> Self {
        if events {
            Output::Events
        } else if json {
            Output::Json
        } else {
            Output::Human
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    swarm::log::init_with_debug(cli.debug);
    slog!("Command: {:?}", cli.command);

    let success = match cli.command {
        Command::Run(args) => run_plan_file(args)?,
        Command::Waves { plan } => run_waves(plan)?,
        Command::Demo {
            scenario,
            speed,
            max_concurrent,
            output,
        } => run_demo(scenario, speed, max_concurrent, output)?,
        Command::Sessions { limit } => run_sessions(limit)?,
        Command::Replay { session_id, events } => run_replay(&session_id, events)?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

fn run_plan_file(args: RunArgs) -> Result<bool> {
    let cwd = match &args.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let file_config = Config::load(args.config.as_deref(), &cwd)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let path = args.plan.clone();
        let model = file_config.swarm.model.clone();
        let plan = blocking(move || load_plan(&path, &model)).await?;
        if args.dry_run {
            print_waves(&plan);
            return Ok(true);
        }

        let mut scheduler_config = file_config.scheduler_config(&cwd)?;
        if let Some(n) = args.max_concurrent {
            scheduler_config.max_concurrent = n;
        }
        if let Some(b) = args.budget {
            scheduler_config.budget = b;
        }
        if let Some(r) = args.retries {
            scheduler_config.max_retries = r;
        }
        scheduler_config.validate()?;

        let executor: Arc<dyn Executor> = if args.simulate {
            Arc::new(SimulatedExecutor::new(SimulatedStep::succeed(
                0.01,
                Duration::from_millis(500),
            )))
        } else {
            Arc::new(ClaudeExecutor::from_command(&file_config.swarm.command)?)
        };
        execute(
            plan,
            scheduler_config,
            executor,
            file_config.profiles(),
            &args.output,
            &cwd,
        )
        .await
    })
}

fn run_waves(path: PathBuf) -> Result<bool> {
    let rt = tokio::runtime::Runtime::new()?;
    let plan = rt.block_on(blocking(move || load_plan(&path, "opus")))?;
    print_waves(&plan);
    Ok(true)
}

fn run_demo(scenario: Scenario, speed: f64, max_concurrent: usize, output: OutputArgs) -> Result<bool> {
    let plan = scenario.plan()?;
    let config = SchedulerConfig {
        max_concurrent,
        poll_interval: Duration::from_millis(100),
        ..Default::default()
    };
    config.validate()?;
    if Output::from_flags(output.events, output.json) == Output::Human {
        println!("Demo: {}", plan.request);
        print_waves(&plan);
    }
    let cwd = std::env::current_dir()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(execute(
        plan,
        config,
        Arc::new(scenario.executor(speed)),
        ProfileRegistry::default(),
        &output,
        &cwd,
    ))
}

fn run_sessions(limit: usize) -> Result<bool> {
    let store = SessionStore::open_default()?;
    let rt = tokio::runtime::Runtime::new()?;
    let sessions = rt.block_on(store.list(limit))?;

    if sessions.is_empty() {
        println!("No sessions found. Run a plan first!");
        return Ok(true);
    }
    println!(
        "{:<10} {:<17} {:>8} {:>9}  {:<10} REQUEST",
        "ID", "STARTED", "DURATION", "COST", "RESULT"
    );
    for meta in sessions {
        let (cost, outcome) = match &meta.outcome {
            Some(o) if o.success => (format!("${:.4}", o.total_cost), "ok".to_string()),
            Some(o) => (
                format!("${:.4}", o.total_cost),
                format!("{} failed", o.failed + o.cancelled),
            ),
            None => ("-".to_string(), "unfinished".to_string()),
        };
        println!(
            "{:<10} {:<17} {:>7.1}s {:>9}  {:<10} {}",
            meta.id.short(),
            meta.started_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M"),
            meta.duration_ms as f64 / 1000.0,
            cost,
            outcome,
            one_line(&meta.request, 50)
        );
    }
    Ok(true)
}

fn run_replay(session_id: &str, events: bool) -> Result<bool> {
    let store = SessionStore::open_default()?;
    let rt = tokio::runtime::Runtime::new()?;
    let (meta, recorded) = rt.block_on(async {
        let id = store.resolve(session_id)?;
        let meta = store.load_meta(id)?;
        let recorded = store.load_events(id).await?;
        Ok::<_, swarm::Error>((meta, recorded))
    })?;

    let output = Output::from_flags(events, false);
    if output == Output::Human {
        println!("Session: {}", meta.id);
        println!("Request: {}", meta.request);
        println!("Cwd:     {}", meta.cwd.display());
        println!(
            "Started: {}",
            meta.started_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
        );
        println!();
    }
    for event in &recorded {
        print_event(event, output);
    }
    if output == Output::Human {
        match &meta.outcome {
            Some(o) => println!(
                "\n{} completed, {} failed, {} cancelled, ${:.4} in {:.1}s",
                o.completed,
                o.failed,
                o.cancelled,
                o.total_cost,
                meta.duration_ms as f64 / 1000.0
            ),
            None => println!("\nRun did not finish."),
        }
    }
    Ok(true)
}

/// Load a JSON plan, or extract one from decomposer output.
fn load_plan(path: &Path, model: &str) -> Result<Plan> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let plan = if is_json {
        Plan::load(path)
    } else {
        let request = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        std::fs::read_to_string(path)
            .map_err(swarm::Error::from)
            .and_then(|text| Plan::from_decomposition(&request, model, &text))
    };
    plan.inspect_err(|e| slog_error!("Failed to load plan {}: {}", path.display(), e))
}

fn print_waves(plan: &Plan) {
    println!("Plan: {} tasks", plan.len());
    for (i, wave) in plan.wave_decomposition().iter().enumerate() {
        println!("  Wave {}:", i + 1);
        for id in wave {
            if let Some(task) = plan.get(id) {
                let deps: Vec<&str> = task.dependencies.iter().map(|d| d.as_str()).collect();
                println!(
                    "    {:<10} [{}] {}{}",
                    task.id,
                    task.agent_type,
                    one_line(&task.description, 60),
                    if deps.is_empty() {
                        String::new()
                    } else {
                        format!(" (after {})", deps.join(", "))
                    }
                );
            }
        }
    }
    for issue in plan.diagnose() {
        println!("  warning: {}", issue);
    }
    println!();
}

/// Open a session recorder, or run unrecorded if the store is unusable.
async fn start_recording(plan: &Plan, cwd: &Path) -> Option<SessionRecorder> {
    let request = plan.request.clone();
    let task_count = plan.len();
    let cwd = cwd.to_path_buf();
    let opened = blocking(move || SessionStore::open_default()?.create(&request, &cwd, task_count)).await;
    match opened {
        Ok(recorder) => {
            swarm::log::set_run_context(&recorder.id().short());
            slog!("Recording session in {}", recorder.dir().display());
            Some(recorder)
        }
        Err(e) => {
            slog_warn!("Session recording disabled: {}", e);
            eprintln!("warning: not recording this run ({})", e);
            None
        }
    }
}

/// Run the scheduler with Ctrl-C wired to cooperative shutdown.
async fn execute(
    plan: Plan,
    config: SchedulerConfig,
    executor: Arc<dyn Executor>,
    profiles: ProfileRegistry,
    output_args: &OutputArgs,
    cwd: &Path,
) -> Result<bool> {
    let output = Output::from_flags(output_args.events, output_args.json);
    let recorder = if output_args.no_record {
        None
    } else {
        start_recording(&plan, cwd).await
    };

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nShutting down: waiting for running agents to finish...");
            ctrl_c.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<RunEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event, output);
        }
    });

    let mut sinks: Vec<Box<dyn EventSink>> = vec![Box::new(tx)];
    if let Some(recorder) = &recorder {
        sinks.push(Box::new(recorder.clone()));
    }
    let result: RunResult = Scheduler::new(plan, config, executor)?
        .with_profiles(profiles)
        .with_shutdown(token)
        .with_events(sinks)
        .run()
        .await;
    let _ = printer.await;

    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Output::Events => {}
        Output::Human => {
            println!();
            print!("{}", result);
        }
    }

    if let Some(recorder) = recorder {
        let id = recorder.id();
        let summary = result.clone();
        match blocking(move || recorder.finish(&summary)).await {
            Ok(_) if output == Output::Human => {
                println!();
                println!("Session saved: {}", id.short());
                println!("Replay with:   swarm replay {}", id.short());
            }
            Ok(_) => {}
            Err(e) => slog_warn!("Failed to save session {}: {}", id, e),
        }
        swarm::log::clear_run_context();
    }
    Ok(result.is_success())
}

fn print_event(event: &RunEvent, output: Output) {
    match output {
        Output::Json => {}
        Output::Events => {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{}", line);
            }
        }
        Output::Human => {
            let secs = event.elapsed_ms as f64 / 1000.0;
            let line = match &event.event {
                SchedulerEvent::TaskAdmitted {
                    task_id,
                    worker_id,
                    attempt,
                } => format!("{} started on {} (attempt {})", task_id, worker_id, attempt),
                SchedulerEvent::TaskCompleted {
                    task_id,
                    cost,
                    duration_ms,
                    ..
                } => format!(
                    "{} completed (${:.4}, {:.1}s)",
                    task_id,
                    cost,
                    *duration_ms as f64 / 1000.0
                ),
                SchedulerEvent::TaskFailed {
                    task_id,
                    error,
                    will_retry,
                    ..
                } => format!(
                    "{} failed{}: {}",
                    task_id,
                    if *will_retry { ", retrying" } else { "" },
                    one_line(error, 80)
                ),
                SchedulerEvent::ConflictDetected {
                    task_id,
                    holder,
                    resource,
                } => format!("{} waits for {} ({})", task_id, holder, resource),
                SchedulerEvent::BudgetExceeded { total_cost, budget } => {
                    format!("budget exceeded: ${:.4} of ${:.2}", total_cost, budget)
                }
                SchedulerEvent::ShutdownRequested => "shutdown requested".to_string(),
                SchedulerEvent::RunStalled { task_ids } => format!(
                    "stalled, cancelling {}",
                    task_ids
                        .iter()
                        .map(|t| t.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                SchedulerEvent::TaskStatusChanged { .. }
                | SchedulerEvent::Progress { .. }
                | SchedulerEvent::RunCompleted { .. } => return,
            };
            println!("[{:>7.2}s] {}", secs, line);
        }
    }
}
