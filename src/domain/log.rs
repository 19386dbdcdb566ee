//! System log records persisted by the Coordination Service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An append-only log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub level: String,
    pub message: String,
}

/// A log line on its way into the store (timestamp assigned on insert
/// unless the producer recorded one)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLogRecord {
    pub source: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewLogRecord {
    pub fn new(source: impl Into<String>, level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            level: level.into(),
            message: message.into(),
            timestamp: None,
        }
    }
}

/// Optional filters for log queries; empty lists match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub levels: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}
