//! Coordination Client: Coordination Service operations as async calls.
//!
//! Each call opens its own loopback connection, sends one request frame,
//! reads one response frame and closes. [`Session`] keeps one connection
//! open for a run of sequential calls. There is no automatic retry.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::domain::{
    AnalysisTask, LogFilter, LogRecord, NewLogRecord, NewTask, StageUpdate, Task, TaskStatus,
};
use crate::service::protocol::{recv_message, send_message, ProtocolError, Request, Response};
use crate::service::DEFAULT_MAX_FRAME_BYTES;

/// Environment variable carrying the service port
pub const PORT_ENV: &str = "DB_MANAGER_PORT";

/// Port used when the environment does not name one
pub const FALLBACK_PORT: u16 = 49999;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Cannot connect to coordination service on port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Connection dropped mid-response: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The service answered with `status: error`
    #[error("Coordination service error: {0}")]
    Server(String),

    #[error("Unexpected response data for '{action}': {source}")]
    Decode {
        action: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => Self::Io(io),
            ProtocolError::Truncated { expected, received } => Self::Truncated { expected, received },
            ProtocolError::Closed => Self::Truncated {
                expected: 4,
                received: 0,
            },
            other => Self::Protocol(other.to_string()),
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Handle to a Coordination Service. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CoordinationClient {
    host: String,
    port: u16,
    max_frame_bytes: usize,
}

impl CoordinationClient {
    pub fn new(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Port from `DB_MANAGER_PORT`, else the fallback. Read once here.
    pub fn from_env() -> Self {
        let port = std::env::var(PORT_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(FALLBACK_PORT);
        Self::new(port)
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn connect(&self) -> ClientResult<TcpStream> {
        TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|source| ClientError::Connect {
                port: self.port,
                source,
            })
    }

    /// Open a persistent connection
    pub async fn session(&self) -> ClientResult<Session> {
        Ok(Session {
            stream: self.connect().await?,
            max_frame_bytes: self.max_frame_bytes,
        })
    }

    /// Untyped call on a fresh connection; returns the response `data`
    pub async fn call(&self, action: &str, params: Value) -> ClientResult<Value> {
        let mut session = self.session().await?;
        session.call(action, params).await
    }

    async fn call_as<T: DeserializeOwned>(&self, action: &str, params: Value) -> ClientResult<T> {
        let data = self.call(action, params).await?;
        decode(action, data)
    }

    pub async fn ping(&self) -> ClientResult<bool> {
        let data: String = self.call_as("ping", json!({})).await?;
        Ok(data == "pong")
    }

    pub async fn initialize_database(&self) -> ClientResult<bool> {
        self.call_as("initialize_database", json!({})).await
    }

    pub async fn add_task(&self, task: &NewTask) -> ClientResult<bool> {
        let params = serde_json::to_value(task).map_err(|source| ClientError::Decode {
            action: "add_task".to_string(),
            source,
        })?;
        self.call_as("add_task", params).await
    }

    pub async fn fetch_and_lock_task(&self) -> ClientResult<Option<Task>> {
        self.call_as("fetch_and_lock_task", json!({})).await
    }

    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&Value>,
    ) -> ClientResult<bool> {
        self.call_as(
            "update_task_status",
            json!({"task_id": task_id, "status": status.as_str(), "result": result}),
        )
        .await
    }

    pub async fn update_task_progress(
        &self,
        task_id: &str,
        progress: i64,
        partial_result: &Value,
    ) -> ClientResult<bool> {
        self.call_as(
            "update_task_progress",
            json!({"task_id": task_id, "progress": progress, "partial_result": partial_result}),
        )
        .await
    }

    pub async fn get_task_status(&self, task_id: &str) -> ClientResult<Option<Task>> {
        self.call_as("get_task_status", json!({"task_id": task_id})).await
    }

    pub async fn get_all_tasks(&self) -> ClientResult<Vec<Task>> {
        self.call_as("get_all_tasks", json!({})).await
    }

    pub async fn find_dependent_task(&self, parent_task_id: &str) -> ClientResult<Option<String>> {
        self.call_as("find_dependent_task", json!({"parent_task_id": parent_task_id}))
            .await
    }

    pub async fn are_tasks_active(&self) -> ClientResult<bool> {
        self.call_as("are_tasks_active", json!({})).await
    }

    pub async fn clear_all_tasks(&self) -> ClientResult<bool> {
        self.call_as("clear_all_tasks", json!({})).await
    }

    pub async fn get_app_state(&self, key: &str) -> ClientResult<Option<String>> {
        self.call_as("get_app_state", json!({"key": key})).await
    }

    pub async fn set_app_state(&self, key: &str, value: &str) -> ClientResult<bool> {
        self.call_as("set_app_state", json!({"key": key, "value": value}))
            .await
    }

    pub async fn get_all_app_states(&self) -> ClientResult<BTreeMap<String, String>> {
        self.call_as("get_all_app_states", json!({})).await
    }

    pub async fn add_system_logs(&self, records: &[NewLogRecord]) -> ClientResult<usize> {
        self.call_as("add_system_logs", json!({"records": records}))
            .await
    }

    pub async fn get_system_logs(&self, filter: &LogFilter) -> ClientResult<Vec<LogRecord>> {
        self.call_as(
            "get_system_logs",
            json!({"levels": filter.levels, "sources": filter.sources}),
        )
        .await
    }

    pub async fn create_or_get_analysis_task(
        &self,
        source_file_id: i64,
        source_filename: Option<&str>,
    ) -> ClientResult<AnalysisTask> {
        self.call_as(
            "create_or_get_analysis_task",
            json!({"source_file_id": source_file_id, "source_filename": source_filename}),
        )
        .await
    }

    pub async fn get_analysis_task(&self, id: i64) -> ClientResult<Option<AnalysisTask>> {
        self.call_as("get_analysis_task", json!({"id": id})).await
    }

    pub async fn get_analysis_task_by_file(
        &self,
        source_file_id: i64,
    ) -> ClientResult<Option<AnalysisTask>> {
        self.call_as(
            "get_analysis_task_by_file",
            json!({"source_file_id": source_file_id}),
        )
        .await
    }

    pub async fn get_all_analysis_tasks(&self) -> ClientResult<Vec<AnalysisTask>> {
        self.call_as("get_all_analysis_tasks", json!({})).await
    }

    pub async fn update_analysis_task(&self, id: i64, update: &StageUpdate) -> ClientResult<bool> {
        let mut params = serde_json::to_value(update).map_err(|source| ClientError::Decode {
            action: "update_analysis_task".to_string(),
            source,
        })?;
        if let Value::Object(map) = &mut params {
            map.insert("id".to_string(), json!(id));
        }
        self.call_as("update_analysis_task", params).await
    }

    pub async fn reset_analysis_task(&self, id: i64) -> ClientResult<bool> {
        self.call_as("reset_analysis_task", json!({"id": id})).await
    }
}

/// One open connection carrying sequential calls
pub struct Session {
    stream: TcpStream,
    max_frame_bytes: usize,
}

impl Session {
    pub async fn call(&mut self, action: &str, params: Value) -> ClientResult<Value> {
        debug!(action, "Coordination call");
        send_message(&mut self.stream, &Request::new(action, params)).await?;
        match recv_message::<_, Response>(&mut self.stream, self.max_frame_bytes).await? {
            Response::Success { data } => Ok(data),
            Response::Error { message } => Err(ClientError::Server(message)),
        }
    }

    pub async fn call_as<T: DeserializeOwned>(&mut self, action: &str, params: Value) -> ClientResult<T> {
        let data = self.call(action, params).await?;
        decode(action, data)
    }
}

fn decode<T: DeserializeOwned>(action: &str, data: Value) -> ClientResult<T> {
    serde_json::from_value(data).map_err(|source| ClientError::Decode {
        action: action.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_map_to_connection_errors() {
        let truncated: ClientError = ProtocolError::Truncated {
            expected: 10,
            received: 3,
        }
        .into();
        assert!(matches!(
            truncated,
            ClientError::Truncated {
                expected: 10,
                received: 3
            }
        ));

        let closed: ClientError = ProtocolError::Closed.into();
        assert!(matches!(closed, ClientError::Truncated { received: 0, .. }));
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        // bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let err = CoordinationClient::new(port).ping().await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
