//! Action dispatch: maps a request's `action` onto a Task Store call.
//!
//! Every failure (unknown action, bad params, store error) becomes an
//! error response for this request only; nothing here can take the
//! service down.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::domain::{LogFilter, NewLogRecord, NewTask, StageUpdate, TaskStatus, UnknownStatus};
use crate::store::{StoreError, TaskStore};

use super::protocol::{Request, Response};

/// Every action the service understands
pub const ACTIONS: &[&str] = &[
    "ping",
    "initialize_database",
    "add_task",
    "fetch_and_lock_task",
    "update_task_status",
    "update_task_progress",
    "get_task_status",
    "get_all_tasks",
    "find_dependent_task",
    "are_tasks_active",
    "clear_all_tasks",
    "get_app_state",
    "set_app_state",
    "get_all_app_states",
    "add_system_log",
    "add_system_logs",
    "get_system_logs",
    "create_or_get_analysis_task",
    "get_analysis_task",
    "get_analysis_task_by_file",
    "get_all_analysis_tasks",
    "update_analysis_task",
    "reset_analysis_task",
];

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid params: {0}")]
    InvalidParams(#[source] serde_json::Error),

    #[error(transparent)]
    Status(#[from] UnknownStatus),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to encode result: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Deserialize)]
struct TaskIdParams {
    task_id: String,
}

#[derive(Deserialize)]
struct UpdateStatusParams {
    task_id: String,
    status: String,
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Deserialize)]
struct UpdateProgressParams {
    task_id: String,
    progress: i64,
    #[serde(default)]
    partial_result: Value,
}

#[derive(Deserialize)]
struct ParentParams {
    parent_task_id: String,
}

#[derive(Deserialize)]
struct KeyParams {
    key: String,
}

#[derive(Deserialize)]
struct SetStateParams {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct AddLogsParams {
    records: Vec<NewLogRecord>,
}

#[derive(Deserialize)]
struct CreateAnalysisParams {
    #[serde(alias = "file_id")]
    source_file_id: i64,
    #[serde(default, alias = "filename")]
    source_filename: Option<String>,
}

#[derive(Deserialize)]
struct AnalysisIdParams {
    #[serde(alias = "task_id")]
    id: i64,
}

#[derive(Deserialize)]
struct AnalysisFileParams {
    #[serde(alias = "file_id")]
    source_file_id: i64,
}

#[derive(Deserialize)]
struct UpdateAnalysisParams {
    #[serde(alias = "task_id")]
    id: i64,
    #[serde(flatten)]
    update: StageUpdate,
}

/// Decode params; a missing/null params object counts as `{}`
fn params<T: DeserializeOwned>(value: Value) -> Result<T, DispatchError> {
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value
    };
    serde_json::from_value(value).map_err(DispatchError::InvalidParams)
}

fn encode<T: Serialize>(value: T) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(DispatchError::Encode)
}

/// Execute one request against the store
pub fn dispatch(store: &mut TaskStore, request: Request) -> Response {
    let action = request.action.clone();
    debug!(%action, "Dispatching request");

    match execute(store, request) {
        Ok(data) => Response::success(data),
        Err(DispatchError::UnknownAction(action)) => {
            warn!(%action, "Unknown action");
            Response::error(format!("Unknown action: {action}"))
        }
        Err(e) => {
            error!(%action, error = %e, "Action failed");
            Response::error(format!("Error executing '{action}': {e}"))
        }
    }
}

fn execute(store: &mut TaskStore, request: Request) -> Result<Value, DispatchError> {
    let Request { action, params: raw } = request;

    match action.as_str() {
        "ping" => encode("pong"),
        "initialize_database" => {
            store.initialize()?;
            encode(true)
        }

        "add_task" => {
            let task: NewTask = params(raw)?;
            encode(store.add_task(&task)?)
        }
        "fetch_and_lock_task" => encode(store.fetch_and_lock_task()?),
        "update_task_status" => {
            let p: UpdateStatusParams = params(raw)?;
            let status: TaskStatus = p.status.parse()?;
            encode(store.update_task_status(&p.task_id, status, p.result.as_ref())?)
        }
        "update_task_progress" => {
            let p: UpdateProgressParams = params(raw)?;
            encode(store.update_task_progress(&p.task_id, p.progress, &p.partial_result)?)
        }
        "get_task_status" => {
            let p: TaskIdParams = params(raw)?;
            encode(store.get_task_status(&p.task_id)?)
        }
        "get_all_tasks" => encode(store.get_all_tasks()?),
        "find_dependent_task" => {
            let p: ParentParams = params(raw)?;
            encode(store.find_dependent_task(&p.parent_task_id)?)
        }
        "are_tasks_active" => encode(store.are_tasks_active()?),
        "clear_all_tasks" => {
            store.clear_all_tasks()?;
            encode(true)
        }

        "get_app_state" => {
            let p: KeyParams = params(raw)?;
            encode(store.get_app_state(&p.key)?)
        }
        "set_app_state" => {
            let p: SetStateParams = params(raw)?;
            encode(store.set_app_state(&p.key, &p.value)?)
        }
        "get_all_app_states" => encode(store.get_all_app_states()?),

        "add_system_log" => {
            let record: NewLogRecord = params(raw)?;
            store.add_system_logs(std::slice::from_ref(&record))?;
            encode(true)
        }
        "add_system_logs" => {
            let p: AddLogsParams = params(raw)?;
            encode(store.add_system_logs(&p.records)?)
        }
        "get_system_logs" => {
            let filter: LogFilter = params(raw)?;
            encode(store.get_system_logs(&filter)?)
        }

        "create_or_get_analysis_task" => {
            let p: CreateAnalysisParams = params(raw)?;
            encode(store.create_or_get_analysis_task(p.source_file_id, p.source_filename.as_deref())?)
        }
        "get_analysis_task" => {
            let p: AnalysisIdParams = params(raw)?;
            encode(store.get_analysis_task(p.id)?)
        }
        "get_analysis_task_by_file" => {
            let p: AnalysisFileParams = params(raw)?;
            encode(store.get_analysis_task_by_file(p.source_file_id)?)
        }
        "get_all_analysis_tasks" => encode(store.get_all_analysis_tasks()?),
        "update_analysis_task" => {
            let p: UpdateAnalysisParams = params(raw)?;
            encode(store.update_analysis_task(p.id, &p.update)?)
        }
        "reset_analysis_task" => {
            let p: AnalysisIdParams = params(raw)?;
            encode(store.reset_analysis_task(p.id)?)
        }

        _ => Err(DispatchError::UnknownAction(action)),
    }
}
