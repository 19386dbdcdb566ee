//! Two-stage AI analysis records.
//!
//! One record per source file. Stage 1 extracts structured JSON, stage 2
//! renders a report from it. Each stage runs its own
//! pending → processing → completed | failed machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::UnknownStatus;

/// Which analysis stage an update targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[serde(alias = "1", alias = "stage1")]
    One,
    #[serde(alias = "2", alias = "stage2")]
    Two,
}

impl Stage {
    /// Column prefix for this stage
    pub(crate) fn column_prefix(&self) -> &'static str {
        match self {
            Self::One => "stage1",
            Self::Two => "stage2",
        }
    }
}

/// Status of a single analysis stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for StageStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Analysis state for one source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub id: i64,
    pub source_file_id: i64,
    pub source_filename: Option<String>,
    pub stage1_status: StageStatus,
    pub stage1_output_path: Option<String>,
    pub stage1_error: Option<String>,
    pub stage2_status: StageStatus,
    pub stage2_output_path: Option<String>,
    pub stage2_error: Option<String>,
    pub model_used: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisTask {
    /// Status of the given stage
    pub fn stage_status(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::One => self.stage1_status,
            Stage::Two => self.stage2_status,
        }
    }

    /// Stage 2 may only start from a completed stage 1
    pub fn ready_for_stage2(&self) -> bool {
        self.stage1_status == StageStatus::Completed && self.stage1_output_path.is_some()
    }
}

/// A stage transition. Output path and error overwrite the stage's
/// previous values (absent means cleared).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageUpdate {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub model_used: Option<String>,
}

impl StageUpdate {
    pub fn processing(stage: Stage, model: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Processing,
            output_path: None,
            error: None,
            model_used: Some(model.into()),
        }
    }

    pub fn completed(stage: Stage, output_path: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Completed,
            output_path: Some(output_path.into()),
            error: None,
            model_used: None,
        }
    }

    pub fn failed(stage: Stage, error: impl Into<String>) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            output_path: None,
            error: Some(error.into()),
            model_used: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_aliases() {
        let one: Stage = serde_json::from_str("\"stage1\"").unwrap();
        let two: Stage = serde_json::from_str("\"two\"").unwrap();
        assert_eq!(one, Stage::One);
        assert_eq!(two, Stage::Two);
    }

    #[test]
    fn test_stage_update_constructors() {
        let update = StageUpdate::failed(Stage::Two, "model refused");
        assert_eq!(update.status, StageStatus::Failed);
        assert_eq!(update.error.as_deref(), Some("model refused"));
        assert!(update.output_path.is_none());
    }
}
