//! Claude Code headless executor.
//!
//! Runs the `claude` CLI in non-interactive mode (`-p`) with streamed JSON
//! output. Each stdout line is one JSON message: assistant messages carry
//! text and tool-use blocks, and a final `result` message carries the
//! outcome, cost and duration.

use crate::error::{Error, Result};
use crate::orchestration::executor::{
    ExecutionFailure, ExecutionOutput, ExecutionRequest, ExecutionResult, Executor,
    ProgressReporter,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Default number of agent turns per attempt.
pub const DEFAULT_MAX_TURNS: u32 = 20;

/// The result type from a Claude execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultType {
    Success { output: String },
    Error { message: String },
}

/// The final `result` message of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaudeResponse {
    pub session_id: Option<String>,
    pub result: ResultType,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
}

impl ClaudeResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.result, ResultType::Success { .. })
    }

    pub fn output(&self) -> Option<&str> {
        match &self.result {
            ResultType::Success { output } => Some(output),
            ResultType::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.result {
            ResultType::Success { .. } => None,
            ResultType::Error { message } => Some(message),
        }
    }
}

/// One meaningful item extracted from a stream line.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Text(String),
    ToolUse {
        name: String,
        /// `file_path` input of the tool call, if present.
        resource: Option<String>,
    },
    Result(ClaudeResponse),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawLine {
    Assistant {
        message: RawMessage,
    },
    Result(RawResult),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RawResult {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    session_id: Option<String>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    num_turns: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

impl From<RawResult> for ClaudeResponse {
    fn from(raw: RawResult) -> Self {
        let errored = raw.is_error
            || raw
                .subtype
                .as_deref()
                .is_some_and(|s| s.starts_with("error"));
        let result = if errored {
            let message = raw
                .error
                .or(raw.result)
                .or(raw.subtype)
                .unwrap_or_else(|| "Unknown error".to_string());
            ResultType::Error { message }
        } else if let Some(error) = raw.error {
            ResultType::Error { message: error }
        } else {
            ResultType::Success {
                output: raw.result.unwrap_or_default(),
            }
        };
        ClaudeResponse {
            session_id: raw.session_id,
            result,
            cost_usd: raw.total_cost_usd,
            duration_ms: raw.duration_ms,
            num_turns: raw.num_turns,
        }
    }
}

/// Parse one line of `--output-format stream-json` output.
///
/// Unknown message and block types yield nothing.
///
/// # Errors
/// Returns [`Error::Json`] when the line is not valid JSON.
pub fn parse_stream_line(line: &str) -> Result<Vec<StreamItem>> {
    let raw: RawLine = serde_json::from_str(line)?;
    Ok(match raw {
        RawLine::Assistant { message } => message
            .content
            .into_iter()
            .filter_map(|block| match block {
                RawBlock::Text { text } => Some(StreamItem::Text(text)),
                RawBlock::ToolUse { name, input } => Some(StreamItem::ToolUse {
                    name,
                    resource: input
                        .get("file_path")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                }),
                RawBlock::Other => None,
            })
            .collect(),
        RawLine::Result(raw) => vec![StreamItem::Result(raw.into())],
        RawLine::Other => Vec::new(),
    })
}

/// Executes task attempts through the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    binary: PathBuf,
    max_turns: u32,
}

impl ClaudeExecutor {
    /// Locate `claude` on the PATH.
    ///
    /// # Errors
    /// Returns [`Error::ExecutorNotAvailable`] when the binary cannot be found.
    pub fn new() -> Result<Self> {
        Self::from_command("claude")
    }

    /// Locate a configured command (name or path).
    ///
    /// # Errors
    /// Returns [`Error::ExecutorNotAvailable`] when the command cannot be found.
    pub fn from_command(command: &str) -> Result<Self> {
        let binary = which::which(command)
            .map_err(|_| Error::ExecutorNotAvailable(command.to_string()))?;
        Ok(Self::with_binary(binary))
    }

    /// Use a specific binary without looking it up.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    /// Command-line arguments for one attempt.
    pub fn args(&self, request: &ExecutionRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            request.model.clone(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
            "--permission-mode".to_string(),
            "acceptEdits".to_string(),
        ];
        if !request.tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(request.tools.join(","));
        }
        args
    }

    async fn run(&self, request: ExecutionRequest, progress: ProgressReporter) -> ExecutionResult {
        crate::slog_debug!(
            "Spawning {} for task {} (model {})",
            self.binary.display(),
            request.task_id,
            request.model
        );
        let mut child = Command::new(&self.binary)
            .args(self.args(&request))
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutionFailure::new(format!("failed to spawn {}: {}", self.binary.display(), e))
            })?;

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let mut collected = String::new();
        let mut response: Option<ClaudeResponse> = None;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match parse_stream_line(&line) {
                            Ok(items) => {
                                for item in items {
                                    match item {
                                        StreamItem::Text(text) => collected.push_str(&text),
                                        StreamItem::ToolUse { name, resource } => {
                                            progress.report(&name, resource.as_deref())
                                        }
                                        StreamItem::Result(r) => response = Some(r),
                                    }
                                }
                            }
                            Err(e) => crate::slog_trace!(
                                "Skipping unparseable line from task {}: {}",
                                request.task_id,
                                e
                            ),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        crate::slog_warn!("Reading output of task {} failed: {}", request.task_id, e);
                        break;
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| ExecutionFailure::new(format!("failed to wait for claude: {}", e)))?;
        let stderr = match stderr_reader {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        let Some(response) = response else {
            if status.success() {
                return Ok(ExecutionOutput {
                    output: collected,
                    cost: 0.0,
                    duration: Duration::ZERO,
                });
            }
            let message = if stderr.trim().is_empty() {
                format!(
                    "claude exited with code {} without a result",
                    status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(ExecutionFailure::new(message));
        };

        let cost = response.cost_usd.unwrap_or(0.0);
        if cost > request.cost_ceiling {
            crate::slog_warn!(
                "Task {} cost ${:.4}, above its ceiling of ${:.2}",
                request.task_id,
                cost,
                request.cost_ceiling
            );
        }
        let duration = Duration::from_millis(response.duration_ms.unwrap_or(0));

        match response.result {
            ResultType::Success { output } => Ok(ExecutionOutput {
                output: if output.trim().is_empty() {
                    collected
                } else {
                    output
                },
                cost,
                duration,
            }),
            ResultType::Error { message } => Err(ExecutionFailure::new(message).with_cost(cost)),
        }
    }
}

impl Executor for ClaudeExecutor {
    fn name(&self) -> &str {
        "claude"
    }

    fn execute<'a>(
        &'a self,
        request: ExecutionRequest,
        progress: ProgressReporter,
    ) -> BoxFuture<'a, ExecutionResult> {
        self.run(request, progress).boxed()
    }
}
