//! Coordination Service: the only process holding a Task Store handle.
//!
//! Speaks length-prefixed JSON over loopback TCP and announces its port
//! on stdout so a supervising parent can find it.

pub mod dispatch;
pub mod protocol;
pub mod server;

pub use dispatch::{dispatch, ACTIONS};
pub use protocol::{Request, Response, DEFAULT_MAX_FRAME_BYTES};
pub use server::{shutdown_signal, CoordinationService, ServiceConfig, ServiceError};

/// Stdout line prefix carrying the bound port
pub const PORT_SENTINEL: &str = "DB_MANAGER_PORT:";

/// Bare stdout token printed once the service accepts connections
pub const READY_SENTINEL: &str = "DB_MANAGER_READY";
