//! The plan: every task of one run plus the request that produced it.
//!
//! `Plan` is the task graph model. Admission works off live task status
//! (`ready_tasks`), while `wave_decomposition` is a read-only planning view.
//! Cycles and dangling dependency ids are tolerated here and reported by
//! `diagnose`; the scheduler turns the resulting stall into a run outcome.

use crate::core::task::{Task, TaskId, TaskStatus, DEFAULT_TOOLS};
use crate::error::{Error, Result};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

/// A structural problem in a plan that will keep some tasks from ever
/// becoming ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanIssue {
    /// `task` depends on an id that is not part of the plan.
    DanglingDependency { task: TaskId, missing: TaskId },
    /// The listed tasks depend on each other in a loop.
    Cycle { tasks: Vec<TaskId> },
}

impl std::fmt::Display for PlanIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanIssue::DanglingDependency { task, missing } => {
                write!(f, "task {} depends on unknown task {}", task, missing)
            }
            PlanIssue::Cycle { tasks } => {
                let ids: Vec<&str> = tasks.iter().map(TaskId::as_str).collect();
                write!(f, "dependency cycle: {}", ids.join(" -> "))
            }
        }
    }
}

/// On-disk / wire form of a plan.
#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default, alias = "original_prompt")]
    request: String,
    #[serde(default = "default_model", alias = "model_used")]
    model: String,
    #[serde(default, alias = "estimated_total_cost")]
    estimated_cost: f64,
    tasks: Vec<Task>,
}

fn default_model() -> String {
    "opus".to_string()
}

/// The full set of tasks for one run.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// The natural-language request the plan was decomposed from.
    pub request: String,
    /// Model or profile used for decomposition.
    pub model: String,
    pub estimated_cost: f64,
    tasks: Vec<Task>,
    #[serde(skip)]
    index: HashMap<TaskId, usize>,
}

impl Plan {
    /// Build a plan, validating ids.
    ///
    /// Every task starts Pending: status, worker, result, error, cost,
    /// duration and retry count from the input are discarded.
    ///
    /// # Errors
    /// Returns an error if two tasks share an id or a task depends on itself.
    pub fn new(request: &str, mut tasks: Vec<Task>) -> Result<Self> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter_mut().enumerate() {
            if task.reset() {
                crate::slog_warn!("Task {} carried run state; reset to pending", task.id);
            }
            if index.insert(task.id.clone(), i).is_some() {
                return Err(Error::DuplicateTask(task.id.clone()));
            }
            if task.dependencies.contains(&task.id) {
                return Err(Error::SelfDependency(task.id.clone()));
            }
        }
        Ok(Self {
            request: request.to_string(),
            model: default_model(),
            estimated_cost: 0.0,
            tasks,
            index,
        })
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Parse a JSON plan document: `{ "request", "model"?, "tasks": [...] }`.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawPlan = serde_json::from_str(json)?;
        let mut plan = Self::new(&raw.request, raw.tasks)?.with_model(&raw.model);
        plan.estimated_cost = raw.estimated_cost;
        Ok(plan)
    }

    /// Load a JSON plan file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Build a plan from a decomposer's free-form text output.
    ///
    /// Accepts a fenced ```json block, a bare object or a bare array, with
    /// the task list either top-level or under `"tasks"`. Text with no
    /// parseable JSON becomes a single task carrying the whole text as its
    /// prompt.
    ///
    /// # Errors
    /// Returns an error if JSON was found but its task list is malformed
    /// (not a list, duplicate ids, self-dependencies).
    pub fn from_decomposition(request: &str, model: &str, text: &str) -> Result<Self> {
        let value = match extract_json(text) {
            Some(value) => value,
            None => {
                let fallback = Task::new(
                    format!("task-{}", short_uuid()),
                    "Execute the original task (decomposition failed)",
                )
                .with_prompt(text)
                .with_tools(DEFAULT_TOOLS.iter().copied());
                return Ok(Self::new(request, vec![fallback])?.with_model(model));
            }
        };

        let items = match value {
            serde_json::Value::Object(mut map) => match map.remove("tasks") {
                Some(serde_json::Value::Array(items)) => items,
                _ => return Err(Error::PlanParse("expected a \"tasks\" list".to_string())),
            },
            serde_json::Value::Array(items) => items,
            _ => return Err(Error::PlanParse("expected an object or a list".to_string())),
        };

        let mut tasks = Vec::with_capacity(items.len());
        for mut item in items {
            if let serde_json::Value::Object(map) = &mut item {
                map.entry("id")
                    .or_insert_with(|| format!("task-{}", short_uuid()).into());
            }
            let mut task: Task = serde_json::from_value(item)?;
            if task.tools.is_empty() {
                task.tools = DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect();
            }
            tasks.push(task);
        }

        Ok(Self::new(request, tasks)?.with_model(model))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.index.get(id) {
            Some(&i) => self.tasks.get_mut(i),
            None => None,
        }
    }

    pub fn status_of(&self, id: &TaskId) -> Option<TaskStatus> {
        self.get(id).map(|t| t.status)
    }

    /// Ids of every Completed task.
    pub fn completed_ids(&self) -> HashSet<TaskId> {
        self.tasks_with_status(TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn tasks_with_status(&self, status: TaskStatus) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| t.status == status)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks_with_status(status).count()
    }

    /// Whether every dependency of `task` is Completed.
    pub fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|dep| self.status_of(dep) == Some(TaskStatus::Completed))
    }

    /// Pending tasks whose dependencies are all Completed, in declaration order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let completed = self.completed_ids();
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
            .collect()
    }

    /// True iff every task is Completed, Failed or Cancelled.
    pub fn all_terminal(&self) -> bool {
        self.tasks.iter().all(Task::is_terminal)
    }

    /// Group task ids into waves: wave k holds the tasks whose dependencies
    /// are all in waves 0..k.
    ///
    /// When no remaining task is free, the first remaining task (declaration
    /// order) is forced into a wave of its own. That keeps cyclic or
    /// dangling graphs terminating; it does not make them correct.
    pub fn wave_decomposition(&self) -> Vec<Vec<TaskId>> {
        let mut remaining: Vec<(&TaskId, HashSet<&TaskId>)> = self
            .tasks
            .iter()
            .map(|t| (&t.id, t.dependencies.iter().collect()))
            .collect();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let mut wave: Vec<&TaskId> = remaining
                .iter()
                .filter(|(_, outstanding)| outstanding.is_empty())
                .map(|(id, _)| *id)
                .collect();

            if wave.is_empty() {
                // Degraded mode: cycle or unknown dependency.
                wave.push(remaining[0].0);
            }

            let placed: HashSet<&TaskId> = wave.iter().copied().collect();
            remaining.retain(|(id, _)| !placed.contains(id));
            for (_, outstanding) in remaining.iter_mut() {
                outstanding.retain(|dep| !placed.contains(dep));
            }

            waves.push(wave.into_iter().cloned().collect());
        }

        waves
    }

    /// Report dangling dependencies and dependency cycles.
    pub fn diagnose(&self) -> Vec<PlanIssue> {
        let mut issues = Vec::new();
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<_> = (0..self.tasks.len()).map(|i| graph.add_node(i)).collect();

        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.dependencies {
                match self.index.get(dep) {
                    Some(&d) => {
                        graph.add_edge(nodes[d], nodes[i], ());
                    }
                    None => issues.push(PlanIssue::DanglingDependency {
                        task: task.id.clone(),
                        missing: dep.clone(),
                    }),
                }
            }
        }

        for component in tarjan_scc(&graph) {
            if component.len() > 1 {
                let mut members: Vec<usize> = component.iter().map(|n| graph[*n]).collect();
                members.sort_unstable();
                issues.push(PlanIssue::Cycle {
                    tasks: members
                        .into_iter()
                        .map(|i| self.tasks[i].id.clone())
                        .collect(),
                });
            }
        }

        issues
    }
}

fn short_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// A fenced code block, optionally tagged `json`.
static FENCED_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?[ \t]*\r?\n(.*?)```").unwrap());

/// Find the first JSON document in `text`.
fn extract_json(text: &str) -> Option<serde_json::Value> {
    if let Some(caps) = FENCED_BLOCK_RE.captures(text) {
        if let Ok(value) = serde_json::from_str(caps[1].trim()) {
            return Some(value);
        }
    }

    if let Ok(value) = serde_json::from_str(text.trim()) {
        return Some(value);
    }

    let start = text.find(['{', '['])?;
    balanced_span(&text[start..]).and_then(|span| serde_json::from_str(span).ok())
}

/// The prefix of `text` up to the bracket closing its first character.
fn balanced_span(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
