//! Recorded runs.
//!
//! Every `swarm run` and `swarm demo` is recorded as a session directory
//! under `~/.swarm/sessions/<id>/`:
//!
//! - `events.jsonl`: one [`RunEvent`] per line, appended as the run goes
//! - `metadata.json`: request, working directory, timing and outcome
//!
//! `swarm sessions` lists them and `swarm replay <id>` prints a recorded
//! timeline again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::Config;
use crate::orchestration::{EventSink, RunEvent, RunResult};
use crate::util::blocking;
use crate::{slog_debug, slog_warn, Error, Result};

const EVENTS_FILE: &str = "events.jsonl";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How a recorded run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_cost: f64,
    pub budget_exceeded: bool,
    pub success: bool,
}

impl From<&RunResult> for SessionOutcome {
    fn from(result: &RunResult) -> Self {
        Self {
            completed: result.completed.len(),
            failed: result.failed.len(),
            cancelled: result.cancelled.len(),
            total_cost: result.total_cost,
            budget_exceeded: result.budget_exceeded,
            success: result.is_success(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: SessionId,
    pub request: String,
    pub cwd: PathBuf,
    pub task_count: usize,
    pub started_at: DateTime<Utc>,
    /// Unset while the run is in progress, or if it was killed.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub outcome: Option<SessionOutcome>,
}

impl SessionMeta {
    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }
}

fn write_meta(dir: &Path, meta: &SessionMeta) -> Result<()> {
    let path = dir.join(METADATA_FILE);
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, serde_json::to_string_pretty(meta)?)?;
    fs::rename(&temp_path, &path)?;
    Ok(())
}

/// The directory holding every recorded session.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.swarm/sessions`.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Config::swarm_dir()?.join("sessions")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: SessionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Start recording a new run.
    pub fn create(&self, request: &str, cwd: &Path, task_count: usize) -> Result<SessionRecorder> {
        let meta = SessionMeta {
            id: SessionId::new(),
            request: request.to_string(),
            cwd: cwd.to_path_buf(),
            task_count,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            outcome: None,
        };
        let dir = self.session_dir(meta.id);
        fs::create_dir_all(&dir)?;
        write_meta(&dir, &meta)?;
        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(EVENTS_FILE))?;
        slog_debug!("Recording session {} in {}", meta.id, dir.display());

        Ok(SessionRecorder {
            inner: Arc::new(RecorderInner {
                dir,
                meta: Mutex::new(meta),
                events: Mutex::new(BufWriter::new(events)),
            }),
        })
    }

    /// Resolve a full id or a unique prefix of one (as shown by `short()`).
    pub fn resolve(&self, id: &str) -> Result<SessionId> {
        if let Ok(id) = id.parse::<SessionId>() {
            if self.session_dir(id).is_dir() {
                return Ok(id);
            }
            return Err(Error::SessionNotFound(id.to_string()));
        }
        let mut matches = Vec::new();
        if self.root.is_dir() {
            for entry in fs::read_dir(&self.root)? {
                let name = entry?.file_name().to_string_lossy().to_string();
                if name.starts_with(id) {
                    if let Ok(found) = name.parse::<SessionId>() {
                        matches.push(found);
                    }
                }
            }
        }
        match matches.as_slice() {
            [only] => Ok(*only),
            [] => Err(Error::SessionNotFound(id.to_string())),
            _ => Err(Error::Validation(format!(
                "session prefix {} matches {} sessions",
                id,
                matches.len()
            ))),
        }
    }

    pub fn load_meta(&self, id: SessionId) -> Result<SessionMeta> {
        let path = self.session_dir(id).join(METADATA_FILE);
        if !path.exists() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    /// Recorded sessions, newest first, at most `limit`.
    ///
    /// Directories without readable metadata are skipped.
    pub fn list_sync(&self, limit: usize) -> Result<Vec<SessionMeta>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            let Ok(id) = name.parse::<SessionId>() else {
                continue;
            };
            match self.load_meta(id) {
                Ok(meta) => sessions.push(meta),
                Err(e) => slog_warn!("Skipping session {}: {}", name, e),
            }
        }
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<SessionMeta>> {
        let store = self.clone();
        blocking(move || store.list_sync(limit)).await
    }

    /// Every event recorded for a session, in emission order.
    ///
    /// A torn last line (run killed mid-write) is dropped.
    pub fn load_events_sync(&self, id: SessionId) -> Result<Vec<RunEvent>> {
        let path = self.session_dir(id).join(EVENTS_FILE);
        if !path.exists() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        let mut events = Vec::new();
        for (n, line) in BufReader::new(File::open(&path)?).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(event) => events.push(event),
                Err(e) => slog_warn!("Session {} line {} unreadable: {}", id.short(), n + 1, e),
            }
        }
        Ok(events)
    }

    pub async fn load_events(&self, id: SessionId) -> Result<Vec<RunEvent>> {
        let store = self.clone();
        blocking(move || store.load_events_sync(id)).await
    }
}

#[derive(Debug)]
struct RecorderInner {
    dir: PathBuf,
    meta: Mutex<SessionMeta>,
    events: Mutex<BufWriter<File>>,
}

/// Writes one run to its session directory. Clones share the same files.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    inner: Arc<RecorderInner>,
}

impl SessionRecorder {
    pub fn id(&self) -> SessionId {
        match self.inner.meta.lock() {
            Ok(meta) => meta.id,
            Err(poisoned) => poisoned.into_inner().id,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Flush the event log and store the outcome.
    pub fn finish(&self, result: &RunResult) -> Result<SessionMeta> {
        if let Ok(mut events) = self.inner.events.lock() {
            events.flush()?;
        }
        let mut meta = self
            .inner
            .meta
            .lock()
            .map_err(|_| Error::Validation("session metadata lock poisoned".to_string()))?;
        meta.finished_at = Some(Utc::now());
        meta.duration_ms = result.duration_ms;
        meta.outcome = Some(SessionOutcome::from(result));
        write_meta(&self.inner.dir, &meta)?;
        slog_debug!("Session {} saved", meta.id);
        Ok(meta.clone())
    }
}

impl EventSink for SessionRecorder {
    fn emit(&self, event: RunEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                slog_warn!("Could not encode event for session: {}", e);
                return;
            }
        };
        if let Ok(mut out) = self.inner.events.lock() {
            if let Err(e) = writeln!(out, "{}", line) {
                slog_warn!("Could not record event in {}: {}", self.inner.dir.display(), e);
            }
        }
    }
}
