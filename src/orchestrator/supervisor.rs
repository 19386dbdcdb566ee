//! Supervisor state machine.
//!
//! INIT → START_DB_SERVICE → WAIT_FOR_DB_PORT → START_HTTP_SERVICE →
//! MONITOR → SHUTDOWN. SHUTDOWN always runs, whatever ended the earlier
//! phases.

use std::future::Future;
use std::io::Write;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::client::{CoordinationClient, PORT_ENV};
use crate::config::OrchestratorSettings;
use crate::logging::{spawn_shipper, LogReceiver};
use crate::service::{PORT_SENTINEL, READY_SENTINEL};

use super::child::{ChildSpec, DiscoveryBoard, LineWatch, ManagedChild};
use super::{SupervisorError, HTTP_PORT_ENV, PROXY_URL_SENTINEL};

/// App-state key under which the HTTP port is published
pub const HTTP_PORT_KEY: &str = "http_port";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    StartDbService,
    WaitForDbPort,
    StartHttpService,
    Monitor,
    Shutdown,
}

/// The sibling HTTP process
#[derive(Debug, Clone)]
pub struct HttpChild {
    /// `{port}` in args is replaced with `port`
    pub spec: ChildSpec,
    pub port: u16,
    pub ready_marker: String,
}

impl HttpChild {
    fn resolved(&self, db_port: u16) -> ChildSpec {
        let port = self.port.to_string();
        let mut spec = self.spec.clone();
        spec.args = spec.args.iter().map(|a| a.replace("{port}", &port)).collect();
        spec.env(PORT_ENV, db_port.to_string()).env(HTTP_PORT_ENV, port)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub db: ChildSpec,
    pub http: Option<HttpChild>,
    pub port_timeout: Duration,
    pub heartbeat: Duration,
    pub poll_interval: Duration,
    pub discovery_poll: Duration,
    pub grace: Duration,
    pub reader_join: Duration,
}

impl SupervisorConfig {
    pub fn new(db: ChildSpec, http: Option<HttpChild>, settings: &OrchestratorSettings) -> Self {
        Self {
            db,
            http,
            port_timeout: Duration::from_secs(settings.port_timeout_secs),
            heartbeat: Duration::from_secs(settings.heartbeat_secs),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            discovery_poll: Duration::from_millis(settings.discovery_poll_ms),
            grace: Duration::from_secs(settings.grace_secs),
            reader_join: Duration::from_secs(settings.reader_join_secs),
        }
    }
}

/// What the startup phases produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub db_port: u16,
    pub http_port: Option<u16>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    board: DiscoveryBoard,
    children: Vec<ManagedChild>,
    phase: Phase,
    log_receiver: Option<LogReceiver>,
    log_shipper: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            board: DiscoveryBoard::default(),
            children: Vec::new(),
            phase: Phase::Init,
            log_receiver: None,
            log_shipper: None,
        }
    }

    /// Forward buffered log records to the Coordination Service once it is up
    pub fn ship_logs(mut self, receiver: LogReceiver) -> Self {
        self.log_receiver = Some(receiver);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn discovery(&self) -> &DiscoveryBoard {
        &self.board
    }

    /// Children started and not yet torn down
    pub fn running_children(&self) -> usize {
        self.children.len()
    }

    /// Start, monitor, and tear down on `shutdown` or on the first fatal
    /// error. `Ok` means a requested, clean stop.
    #[instrument(skip_all)]
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            result = self.start_and_monitor() => result,
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
        };

        if let Err(e) = &outcome {
            error!(error = %e, phase = ?self.phase, "Supervision failed");
        }
        self.shutdown().await;
        outcome
    }

    async fn start_and_monitor(&mut self) -> Result<(), SupervisorError> {
        let started = self.start().await?;
        self.monitor(CoordinationClient::new(started.db_port)).await
    }

    /// The startup phases, up to but excluding MONITOR
    pub async fn start(&mut self) -> Result<Started, SupervisorError> {
        self.phase = Phase::StartDbService;
        let watch = LineWatch::markers([READY_SENTINEL]).with_port_prefix(PORT_SENTINEL)?;
        let db = ManagedChild::spawn(&self.config.db, watch, self.board.clone())?;
        self.children.push(db);

        self.phase = Phase::WaitForDbPort;
        let db_name = self.config.db.name.clone();
        let db_port = self.wait_for_port(&db_name).await?;
        info!(port = db_port, "Coordination service is up");
        if let Some(receiver) = self.log_receiver.take() {
            self.log_shipper = Some(spawn_shipper(receiver, CoordinationClient::new(db_port)));
        }

        self.phase = Phase::StartHttpService;
        let http_port = match self.config.http.clone() {
            Some(http) => {
                let client = CoordinationClient::new(db_port);
                if let Err(e) = client.set_app_state(HTTP_PORT_KEY, &http.port.to_string()).await {
                    warn!(error = %e, "Could not publish HTTP port to app state");
                }

                let watch = LineWatch::markers([http.ready_marker.clone()]);
                let child = ManagedChild::spawn(&http.resolved(db_port), watch, self.board.clone())?;
                self.children.push(child);
                announce_proxy_url(http.port);
                Some(http.port)
            }
            None => {
                warn!("No HTTP service configured, running coordination service only");
                None
            }
        };

        Ok(Started { db_port, http_port })
    }

    /// Poll the discovery board until the child announces a port, it
    /// exits, or the timeout passes
    async fn wait_for_port(&mut self, name: &str) -> Result<u16, SupervisorError> {
        let deadline = Instant::now() + self.config.port_timeout;
        loop {
            if let Some(port) = self.board.port(name) {
                return Ok(port);
            }
            self.check_children()?;
            if Instant::now() >= deadline {
                return Err(SupervisorError::PortTimeout {
                    name: name.to_string(),
                    waited_secs: self.config.port_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.config.discovery_poll).await;
        }
    }

    /// Fails on the first child found to have exited
    fn check_children(&mut self) -> Result<(), SupervisorError> {
        for child in &mut self.children {
            if let Some(status) = child.try_exit()? {
                return Err(SupervisorError::ChildExited {
                    name: child.name().to_string(),
                    status: status.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Liveness loop with periodic idleness heartbeat. Returns only on error.
    async fn monitor(&mut self, client: CoordinationClient) -> Result<(), SupervisorError> {
        self.phase = Phase::Monitor;
        let ready_marker = self
            .config
            .http
            .as_ref()
            .map(|h| (h.spec.name.clone(), h.ready_marker.clone()));
        let mut ready_logged = false;
        let mut last_heartbeat = Instant::now();

        loop {
            self.check_children()?;

            if let Some((name, marker)) = &ready_marker {
                if !ready_logged && self.board.seen(name, marker) {
                    info!(child = %name, "HTTP service ready");
                    ready_logged = true;
                }
            }

            if last_heartbeat.elapsed() >= self.config.heartbeat {
                last_heartbeat = Instant::now();
                match client.are_tasks_active().await {
                    Ok(active) => info!(active, "Heartbeat"),
                    Err(e) => warn!(error = %e, "Heartbeat failed"),
                }
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Stop children in reverse start order
    pub async fn shutdown(&mut self) {
        self.phase = Phase::Shutdown;
        if let Some(shipper) = self.log_shipper.take() {
            shipper.abort();
        }
        while let Some(mut child) = self.children.pop() {
            debug!(child = child.name(), "Stopping child");
            child.terminate(self.config.grace).await;
            child.join_readers(self.config.reader_join).await;
        }
        info!("All children stopped");
    }
}

fn announce_proxy_url(port: u16) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{PROXY_URL_SENTINEL} http://127.0.0.1:{port}");
    let _ = out.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_child_substitutes_port_and_env() {
        let http = HttpChild {
            spec: ChildSpec::new("http", "uvicorn").args(["app:app", "--port", "{port}"]),
            port: 8123,
            ready_marker: "Uvicorn running on".to_string(),
        };
        let spec = http.resolved(49001);
        assert_eq!(spec.args, vec!["app:app", "--port", "8123"]);
        assert!(spec.env.contains(&("DB_MANAGER_PORT".to_string(), "49001".to_string())));
        assert!(spec.env.contains(&("LECTERN_HTTP_PORT".to_string(), "8123".to_string())));
    }

    #[test]
    fn test_config_from_settings() {
        let config = SupervisorConfig::new(
            ChildSpec::new("db", "lectern"),
            None,
            &OrchestratorSettings::default(),
        );
        assert_eq!(config.port_timeout, Duration::from_secs(30));
        assert_eq!(config.heartbeat, Duration::from_secs(15));
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.grace, Duration::from_secs(5));
    }
}
