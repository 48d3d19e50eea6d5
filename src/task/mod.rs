pub mod progress;
pub mod store;

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cli::CliKind;

pub use progress::{DocProgress, ProgressInspector};
pub use store::{MemoryTaskStore, SqliteTaskStore, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    InReviewing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn allowed_transitions(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Pending => &[InProgress],
            InProgress => &[Pending, InReviewing, Completed, Failed],
            InReviewing => &[Completed, Failed],
            Completed => &[],
            Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// States that must be backed by exactly one live session.
    pub fn has_session(&self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::InReviewing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::InReviewing => "in_reviewing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-task review override. `Inherit` defers to the global setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewMode {
    #[default]
    Inherit,
    Enabled,
    Disabled,
}

impl ReviewMode {
    pub fn resolve(&self, global: bool) -> bool {
        match self {
            ReviewMode::Inherit => global,
            ReviewMode::Enabled => true,
            ReviewMode::Disabled => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Absolute path of the project the CLI works in.
    pub project_dir: PathBuf,
    /// Checkbox document, relative to `project_dir`.
    pub doc_path: PathBuf,
    pub status: TaskStatus,
    /// Overrides the default CLI for this task.
    pub cli_kind: Option<CliKind>,
    pub review: ReviewMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last recorded failure or log pointer, if any.
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(project_dir: impl Into<PathBuf>, doc_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_dir: project_dir.into(),
            doc_path: doc_path.into(),
            status: TaskStatus::Pending,
            cli_kind: None,
            review: ReviewMode::Inherit,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_error: None,
        }
    }

    pub fn with_cli(mut self, kind: CliKind) -> Self {
        self.cli_kind = Some(kind);
        self
    }

    pub fn with_review(mut self, review: ReviewMode) -> Self {
        self.review = review;
        self
    }

    /// Absolute path of the checkbox document.
    pub fn full_doc_path(&self) -> PathBuf {
        self.project_dir.join(&self.doc_path)
    }

    pub fn project_name(&self) -> String {
        self.project_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.project_dir.display().to_string())
    }
}
