//! Process orchestrator: boots the Coordination Service and the HTTP
//! service as children, discovers ports from their output, supervises
//! them and tears everything down on the way out.

pub mod child;
pub mod supervisor;

use std::path::PathBuf;

use thiserror::Error;

pub use child::{find_free_port, ChildSpec, DiscoveryBoard, LineWatch, ManagedChild};
pub use supervisor::{HttpChild, Phase, Started, Supervisor, SupervisorConfig};

/// Environment variable through which the HTTP child learns its own port
pub const HTTP_PORT_ENV: &str = "LECTERN_HTTP_PORT";

/// Stdout prefix announcing the HTTP service URL
pub const PROXY_URL_SENTINEL: &str = "PROXY_URL:";

/// Supervision failures; all are fatal to the orchestrator
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to start {name} ({}): {source}", program.display())]
    Spawn {
        name: String,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} exited unexpectedly ({status})")]
    ChildExited { name: String, status: String },

    #[error("{name} did not announce a port within {waited_secs}s")]
    PortTimeout { name: String, waited_secs: u64 },

    #[error("Invalid output pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
