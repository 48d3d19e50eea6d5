use thiserror::Error;

use crate::task::TaskStatus;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("No session for task: {0}")]
    SessionNotFound(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task {task_id} is {status}, expected {expected}")]
    InvalidState {
        task_id: String,
        status: TaskStatus,
        expected: &'static str,
    },

    #[error("Failed to spawn terminal: {0}")]
    SpawnFailed(String),

    #[error("Terminal spawn timed out after {0}s")]
    SpawnTimeout(u64),

    #[error("CLI '{0}' is not installed or not on PATH")]
    CliUnavailable(String),

    #[error("No usable terminal emulator: {0}")]
    TerminalUnavailable(String),

    #[error("Session process died")]
    ProcessDied,

    #[error("Session idle with unfinished tasks ({checked}/{total} checked)")]
    IdleLockup { checked: usize, total: usize },

    #[error("Could not recover session after restart: {0}")]
    RecoveryFailed(String),

    #[error("Project directory does not exist: {0}")]
    ProjectDirMissing(String),

    #[error("Task document does not exist: {0}")]
    DocumentMissing(String),

    #[error("Unknown template: {0}")]
    TemplateNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, WardenError>;
