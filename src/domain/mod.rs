//! Domain types for the coordination layer.
//!
//! This module contains the record kinds held by the Task Store:
//! - Task: Queued, possibly dependent work
//! - AnalysisTask: Two-stage AI analysis per source file
//! - LogRecord: Append-only system logs

pub mod analysis;
pub mod log;
pub mod task;

// Re-export commonly used types
pub use analysis::{AnalysisTask, Stage, StageStatus, StageUpdate};
pub use log::{LogFilter, LogRecord, NewLogRecord};
pub use task::{new_task_id, NewTask, Task, TaskStatus, UnknownStatus};
