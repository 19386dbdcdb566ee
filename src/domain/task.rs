//! Queue tasks and their lifecycle.
//!
//! A task is created `queued`, claimed exactly once by `fetch_and_lock`
//! (`queued` → `processing`), and finishes as `completed` or `failed`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Canonical task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    Queued,

    /// Claimed by a worker
    Processing,

    /// Finished successfully
    Completed,

    /// Finished with an error
    Failed,
}

/// Returned when a status string matches neither a canonical nor a legacy spelling
#[derive(Debug, Clone, Error)]
#[error("Unknown task status: {0}")]
pub struct UnknownStatus(pub String);

impl TaskStatus {
    /// All canonical statuses
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Queued,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Spelling stored in the database and sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Historical spellings written by older producers
    pub fn legacy_spellings(&self) -> &'static [&'static str] {
        match self {
            Self::Queued => &["處理中", "pending"],
            Self::Processing => &[],
            Self::Completed => &["已完成", "done"],
            Self::Failed => &["error"],
        }
    }

    /// Whether the task still counts as outstanding work
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Processing)
    }

    /// Whether the task reached its final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    /// Parse a canonical or legacy spelling
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let lower = trimmed.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| {
                lower == status.as_str()
                    || status.legacy_spellings().contains(&trimmed)
                    || status.legacy_spellings().contains(&lower.as_str())
            })
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of queued, possibly dependent work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique opaque id
    pub task_id: String,

    /// Routing tag (e.g. "download", "transcribe")
    #[serde(rename = "type")]
    pub task_type: String,

    /// Current status
    pub status: TaskStatus,

    /// Progress percentage (0-100)
    pub progress: u8,

    /// Opaque task input
    pub payload: serde_json::Value,

    /// Opaque task output (or partial output while processing)
    pub result: Option<serde_json::Value>,

    /// Task that must complete before this one becomes eligible
    pub depends_on: Option<String>,

    /// When the task was created
    pub created_at: DateTime<Utc>,

    /// When the task was last written
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub task_id: String,

    #[serde(rename = "task_type", alias = "type", default = "default_task_type")]
    pub task_type: String,

    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default)]
    pub depends_on: Option<String>,
}

fn default_task_type() -> String {
    "transcribe".to_string()
}

impl NewTask {
    /// Create a task with a fresh uuid v4 id
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id: new_task_id(),
            task_type: task_type.into(),
            payload,
            depends_on: None,
        }
    }

    /// Use an explicit id
    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    /// Make this task wait for another one
    pub fn depends_on(mut self, parent: impl Into<String>) -> Self {
        self.depends_on = Some(parent.into());
        self
    }
}

/// Generate a new opaque task id
pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}
