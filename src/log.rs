//! Leveled file logging for swarm runs.
//!
//! Levels, from most to least severe:
//! - ERROR: a command cannot go on (bad plan file, unusable config)
//! - WARN: a run goes on in a degraded way (task failure, budget hit, stall)
//! - INFO: run milestones (admission, completion, summary)
//! - DEBUG: scheduling decisions (conflicts, unblocking, retries)
//! - TRACE: executor progress and per-poll detail
//!
//! The level is INFO unless `--debug`, `SWARM_DEBUG=1` or `SWARM_LOG=<level>`
//! says otherwise; `SWARM_LOG` wins. While a run is recorded its session id
//! is set as the run context and prefixed to every line, so interleaved runs
//! can be told apart in one log file.
//!
//! Until [`init_with_debug`] or [`init_at`] is called every log call is a
//! no-op, which keeps library users and tests free of file side effects.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{OnceLock, RwLock};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static RUN_CONTEXT: RwLock<Option<String>> = RwLock::new(None);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Default log file location: `~/.swarm/swarm.log`.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".swarm").join("swarm.log"))
}

/// Pick the level from the flag and the two environment variables.
fn resolve_level(debug_flag: bool, swarm_debug: Option<&str>, swarm_log: Option<&str>) -> LogLevel {
    if let Some(level) = swarm_log.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = swarm_debug.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    if debug_flag || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Initialize logging to the default location.
pub fn init_with_debug(debug: bool) {
    if let Some(path) = default_log_path() {
        init_at(&path, debug);
    }
}

/// Initialize logging to an explicit file.
///
/// The previous log is kept next to it as `<name>.prev`. Only the first
/// successful initialization in a process decides the path; later calls
/// still update the level.
pub fn init_at(path: &Path, debug: bool) {
    let level = resolve_level(
        debug,
        std::env::var("SWARM_DEBUG").ok().as_deref(),
        std::env::var("SWARM_LOG").ok().as_deref(),
    );
    set_level(level);

    if LOG_PATH.get().is_some() {
        return;
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = std::fs::rename(path, previous_log_path(path));
    }
    let _ = std::fs::write(path, "");
    LOG_PATH.set(path.to_path_buf()).ok();
}

fn previous_log_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".prev");
    path.with_file_name(name)
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Whether a message at `level` would currently be written.
pub fn enabled(level: LogLevel) -> bool {
    LOG_PATH.get().is_some() && level <= self::level()
}

/// Tag following lines with a run (usually a session's short id).
pub fn set_run_context(run: &str) {
    if let Ok(mut ctx) = RUN_CONTEXT.write() {
        *ctx = Some(run.to_string());
    }
}

pub fn clear_run_context() {
    if let Ok(mut ctx) = RUN_CONTEXT.write() {
        *ctx = None;
    }
}

fn format_line(timestamp: &str, level: LogLevel, run: Option<&str>, msg: &str) -> String {
    match run {
        Some(run) => format!("[{}] [{}] [run {}] {}", timestamp, level.as_str(), run, msg),
        None => format!("[{}] [{}] {}", timestamp, level.as_str(), msg),
    }
}

pub fn log_at(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    let run = RUN_CONTEXT.read().ok().and_then(|ctx| ctx.clone());
    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", format_line(&timestamp, level, run.as_deref(), msg));
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// INFO.
#[macro_export]
macro_rules! slog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! slog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! slog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! slog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

/// TRACE. Skips formatting entirely unless tracing is on, since the
/// scheduler traces on every poll.
#[macro_export]
macro_rules! slog_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Trace) {
            $crate::log::trace(&format!($($arg)*))
        }
    };
}
