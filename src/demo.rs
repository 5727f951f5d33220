//! Built-in demo scenarios.
//!
//! A scenario is a ready-made plan plus simulated timings, so the whole
//! scheduling pipeline can be shown without an API key or any spend.

use crate::core::{Plan, Task};
use crate::orchestration::{SimulatedExecutor, SimulatedStep};
use crate::Result;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Scenario {
    /// Move an auth module from Express middleware to Next.js routes.
    #[default]
    Auth,
    /// Build a user-management REST API.
    Api,
}

struct DemoTask {
    id: &'static str,
    description: &'static str,
    agent_type: &'static str,
    dependencies: &'static [&'static str],
    resources: &'static [&'static str],
    tools: &'static [&'static str],
}

const AUTH_TASKS: &[DemoTask] = &[
    DemoTask {
        id: "task-1",
        description: "Create Next.js API route handlers for login/logout/register",
        agent_type: "coder",
        dependencies: &[],
        resources: &[
            "src/app/api/auth/login/route.ts",
            "src/app/api/auth/register/route.ts",
        ],
        tools: &["Read", "Write", "Edit", "Bash", "Grep", "Glob"],
    },
    DemoTask {
        id: "task-2",
        description: "Migrate session management from Express to NextAuth.js",
        agent_type: "coder",
        dependencies: &[],
        resources: &["src/lib/auth.ts", "src/app/api/auth/[...nextauth]/route.ts"],
        tools: &["Read", "Write", "Edit", "Bash"],
    },
    DemoTask {
        id: "task-3",
        description: "Update middleware for Next.js edge runtime",
        agent_type: "coder",
        dependencies: &["task-1"],
        resources: &["src/middleware.ts"],
        tools: &["Read", "Write", "Edit"],
    },
    DemoTask {
        id: "task-4",
        description: "Write integration tests for auth endpoints",
        agent_type: "tester",
        dependencies: &["task-1", "task-2"],
        resources: &["tests/auth.test.ts"],
        tools: &["Read", "Write", "Edit", "Bash"],
    },
    DemoTask {
        id: "task-5",
        description: "Security review of auth implementation",
        agent_type: "reviewer",
        dependencies: &["task-1", "task-2", "task-3"],
        resources: &[],
        tools: &["Read", "Grep", "Glob"],
    },
];

const API_TASKS: &[DemoTask] = &[
    DemoTask {
        id: "task-1",
        description: "Create user model and database schema",
        agent_type: "coder",
        dependencies: &[],
        resources: &["src/models/user.ts", "prisma/schema.prisma"],
        tools: &["Read", "Write", "Edit", "Bash"],
    },
    DemoTask {
        id: "task-2",
        description: "Implement CRUD API endpoints",
        agent_type: "coder",
        dependencies: &["task-1"],
        resources: &["src/app/api/users/route.ts", "src/app/api/users/[id]/route.ts"],
        tools: &["Read", "Write", "Edit", "Bash"],
    },
    DemoTask {
        id: "task-3",
        description: "Add input validation with Zod schemas",
        agent_type: "coder",
        dependencies: &["task-1"],
        resources: &["src/lib/validators.ts"],
        tools: &["Read", "Write", "Edit"],
    },
    DemoTask {
        id: "task-4",
        description: "Write comprehensive tests for all endpoints",
        agent_type: "tester",
        dependencies: &["task-2", "task-3"],
        resources: &["tests/users.test.ts"],
        tools: &["Read", "Write", "Edit", "Bash"],
    },
];

impl Scenario {
    pub fn request(&self) -> &'static str {
        match self {
            Scenario::Auth => "Refactor auth module from Express middleware to Next.js API routes",
            Scenario::Api => "Build a REST API for user management with CRUD operations",
        }
    }

    fn tasks(&self) -> &'static [DemoTask] {
        match self {
            Scenario::Auth => AUTH_TASKS,
            Scenario::Api => API_TASKS,
        }
    }

    /// The scenario's plan, every task Pending.
    pub fn plan(&self) -> Result<Plan> {
        let tasks = self
            .tasks()
            .iter()
            .map(|t| {
                Task::new(t.id, t.description)
                    .with_agent_type(t.agent_type)
                    .with_dependencies(t.dependencies.iter().copied())
                    .with_resources(t.resources.iter().copied())
                    .with_tools(t.tools.iter().copied())
                    .with_prompt(&format!("Demo prompt for {}", t.description))
            })
            .collect();
        Plan::new(self.request(), tasks)
    }

    /// A simulated executor with per-agent-type timings. `speed` divides
    /// every delay; values at or below zero are treated as 1.0.
    pub fn executor(&self, speed: f64) -> SimulatedExecutor {
        let speed = if speed > 0.0 && speed.is_finite() { speed } else { 1.0 };
        let mut executor = SimulatedExecutor::new(step("coder", speed));
        for task in self.tasks() {
            executor = executor.script(task.id, vec![step(task.agent_type, speed)]);
        }
        executor
    }
}

fn step(agent_type: &str, speed: f64) -> SimulatedStep {
    let (cost, millis) = match agent_type {
        "tester" => (0.031, 900.0),
        "reviewer" => (0.018, 700.0),
        _ => (0.046, 1200.0),
    };
    SimulatedStep::succeed(cost, Duration::from_millis((millis / speed).round() as u64))
}
