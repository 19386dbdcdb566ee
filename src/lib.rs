//! lectern - coordination layer for a multi-process research pipeline
//!
//! A single Coordination Service owns the SQLite Task Store and answers
//! length-prefixed JSON requests over loopback TCP. Everything else
//! (workers, the HTTP front end, the orchestrator itself) talks to the
//! store only through it.
//!
//! # Modules
//!
//! - `domain`: Record kinds (Task, AnalysisTask, LogRecord)
//! - `store`: SQLite-backed Task Store
//! - `service`: Wire protocol, dispatch, and the TCP server
//! - `client`: Typed client for the Coordination Service
//! - `orchestrator`: Child process supervision and port discovery
//! - `gateway`: Multi-credential gateway to a generative AI API
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Supervise the service tree
//! lectern orchestrate --http-program uvicorn --http-arg app:app --http-arg --port={port}
//!
//! # Queue and inspect work
//! DB_MANAGER_PORT=50123 lectern enqueue download --payload '{"url": "..."}'
//! DB_MANAGER_PORT=50123 lectern tasks
//! ```

pub mod cli;
pub mod client;
pub mod config;
pub mod domain;
pub mod gateway;
pub mod logging;
pub mod orchestrator;
pub mod service;
pub mod store;

// Re-export main types at crate root for convenience
pub use client::{ClientError, CoordinationClient};
pub use domain::{AnalysisTask, LogRecord, NewLogRecord, NewTask, Task, TaskStatus};
pub use gateway::{ApiGateway, GatewayError};
pub use orchestrator::{Supervisor, SupervisorConfig};
pub use service::{CoordinationService, Request, Response};
pub use store::{StoreError, TaskStore};
