//! TCP front end of the Coordination Service.

use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServiceSettings;
use crate::store::TaskStore;

use super::dispatch::dispatch;
use super::protocol::{read_frame, send_message, ProtocolError, Request, Response};
use super::{PORT_SENTINEL, READY_SENTINEL};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listener options
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    /// 0 lets the OS pick
    pub port: u16,
    pub idle_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceSettings::default().into()
    }
}

impl From<ServiceSettings> for ServiceConfig {
    fn from(settings: ServiceSettings) -> Self {
        Self {
            host: settings.host,
            port: settings.port,
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            max_frame_bytes: settings.max_frame_bytes,
        }
    }
}

/// The sole owner of a `TaskStore`, serving it over framed JSON
pub struct CoordinationService {
    listener: TcpListener,
    store: Arc<Mutex<TaskStore>>,
    config: ServiceConfig,
}

impl CoordinationService {
    pub async fn bind(store: TaskStore, config: ServiceConfig) -> Result<Self, ServiceError> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServiceError::Bind { addr, source })?;

        Ok(Self {
            listener,
            store: Arc::new(Mutex::new(store)),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServiceError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn port(&self) -> Result<u16, ServiceError> {
        Ok(self.local_addr()?.port())
    }

    /// Print the discovery sentinels. Nothing else may go to this writer.
    pub fn announce<W: Write>(&self, out: &mut W) -> Result<(), ServiceError> {
        let port = self.port()?;
        writeln!(out, "{PORT_SENTINEL} {port}")?;
        writeln!(out, "{READY_SENTINEL}")?;
        out.flush()?;
        Ok(())
    }

    /// Serve until SIGINT or SIGTERM
    pub async fn run(self) -> Result<(), ServiceError> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then wait for open connections
    /// to finish their current request.
    #[instrument(skip_all, fields(addr = ?self.listener.local_addr().ok()))]
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServiceError>
    where
        F: Future<Output = ()>,
    {
        info!("Coordination service listening");
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, closing listener");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "Connection accepted");
                    let store = Arc::clone(&self.store);
                    let config = self.config.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, store, &config).await {
                            debug!(%peer, error = %e, "Connection ended with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(self.listener);
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            warn!("Connections still open after shutdown grace, aborting them");
        }
        info!("Coordination service stopped");
        Ok(())
    }
}

/// Sequential request/response pairs until the peer closes, goes idle,
/// or sends something that cannot be framed.
async fn serve_connection(
    mut stream: TcpStream,
    store: Arc<Mutex<TaskStore>>,
    config: &ServiceConfig,
) -> Result<(), ProtocolError> {
    loop {
        let read = tokio::time::timeout(config.idle_timeout, read_frame(&mut stream, config.max_frame_bytes));
        let body = match read.await {
            Err(_) => {
                debug!("Idle connection closed");
                return Ok(());
            }
            Ok(Err(ProtocolError::Closed)) => return Ok(()),
            Ok(Err(e @ ProtocolError::TooLarge { .. })) => {
                // the oversized body is still in the socket; answer then hang up
                warn!(error = %e, "Rejecting frame");
                send_message(&mut stream, &Response::error(e.to_string())).await?;
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(body)) => body,
        };

        let response = match serde_json::from_slice::<Request>(&body) {
            Ok(request) => execute(&store, request).await,
            Err(e) => {
                warn!(error = %e, "Malformed request");
                Response::error(format!("Malformed request: {e}"))
            }
        };

        send_message(&mut stream, &response).await?;
    }
}

/// Run one dispatch on the blocking pool, holding the store lock for the
/// duration of that single operation.
async fn execute(store: &Arc<Mutex<TaskStore>>, request: Request) -> Response {
    let store = Arc::clone(store);
    let joined = tokio::task::spawn_blocking(move || match store.lock() {
        Ok(mut guard) => dispatch(&mut guard, request),
        Err(_) => Response::error("Task store unavailable: lock poisoned"),
    })
    .await;

    joined.unwrap_or_else(|e| {
        error!(error = %e, "Dispatch task panicked");
        Response::error(format!("Internal error: {e}"))
    })
}

/// Resolves on Ctrl-C, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::protocol::{recv_message, write_frame, DEFAULT_MAX_FRAME_BYTES};
    use serde_json::json;
    use tokio::sync::oneshot;

    async fn start() -> (u16, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let store = TaskStore::open_in_memory().unwrap();
        let service = CoordinationService::bind(store, ServiceConfig::default())
            .await
            .unwrap();
        let port = service.port().unwrap();
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            service
                .run_until(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });
        (port, tx, handle)
    }

    #[tokio::test]
    async fn test_announce_writes_exact_sentinels() {
        let store = TaskStore::open_in_memory().unwrap();
        let service = CoordinationService::bind(store, ServiceConfig::default())
            .await
            .unwrap();
        let port = service.port().unwrap();
        assert_ne!(port, 0);

        let mut out = Vec::new();
        service.announce(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!("DB_MANAGER_PORT: {port}\nDB_MANAGER_READY\n")
        );
    }

    #[tokio::test]
    async fn test_connection_carries_sequential_requests() {
        let (port, stop, handle) = start().await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        send_message(&mut stream, &Request::new("ping", json!({}))).await.unwrap();
        let first: Response = recv_message(&mut stream, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        assert_eq!(first, Response::success(json!("pong")));

        send_message(&mut stream, &Request::new("are_tasks_active", json!({})))
            .await
            .unwrap();
        let second: Response = recv_message(&mut stream, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        assert_eq!(second, Response::success(json!(false)));

        drop(stream);
        stop.send(()).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_json_gets_error_and_connection_survives() {
        let (port, stop, handle) = start().await;
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        write_frame(&mut stream, b"{not json").await.unwrap();
        let response: Response = recv_message(&mut stream, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        assert!(matches!(response, Response::Error { .. }));

        send_message(&mut stream, &Request::new("ping", json!(null))).await.unwrap();
        let response: Response = recv_message(&mut stream, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        assert_eq!(response, Response::success(json!("pong")));

        drop(stream);
        stop.send(()).unwrap();
        handle.await.unwrap();
    }
}
