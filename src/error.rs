use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Plan parse error: {0}")]
    PlanParse(String),

    #[error("Duplicate task id: {0}")]
    DuplicateTask(crate::core::TaskId),

    #[error("Task {0} depends on itself")]
    SelfDependency(crate::core::TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(crate::core::TaskId),

    #[error("Executor not available: {0}")]
    ExecutorNotAvailable(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Worker pool is full (max: {max})")]
    WorkerPoolFull { max: usize },

    #[error("Worker not found: {id}")]
    WorkerNotFound { id: crate::orchestration::WorkerId },

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
