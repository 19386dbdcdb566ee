//! Supervised child processes and their stdout/stderr readers.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::SupervisorError;

/// What to launch
#[derive(Debug, Clone, PartialEq)]
pub struct ChildSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ChildSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Prefix `PATH` with `dir` so the child resolves our binaries first
    pub fn prepend_path(self, dir: &Path) -> Self {
        let mut entries = vec![dir.to_path_buf()];
        if let Some(existing) = std::env::var_os("PATH") {
            entries.extend(std::env::split_paths(&existing));
        }
        match std::env::join_paths(entries) {
            Ok(joined) => {
                let joined = joined.to_string_lossy().into_owned();
                self.env("PATH", joined)
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot prepend to PATH");
                self
            }
        }
    }
}

/// Lines a reader looks for on one child's output
#[derive(Debug, Clone)]
pub struct LineWatch {
    port_pattern: Option<Regex>,
    markers: Vec<String>,
}

impl LineWatch {
    pub fn markers<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            port_pattern: None,
            markers: markers.into_iter().map(Into::into).collect(),
        }
    }

    /// Also capture `<prefix> <int>` as an announced port
    pub fn with_port_prefix(mut self, prefix: &str) -> Result<Self, SupervisorError> {
        let pattern = format!(r"{}\s*(\d+)", regex::escape(prefix));
        self.port_pattern = Some(Regex::new(&pattern)?);
        Ok(self)
    }

    fn port_in(&self, line: &str) -> Option<u16> {
        self.port_pattern
            .as_ref()?
            .captures(line)?
            .get(1)?
            .as_str()
            .parse()
            .ok()
    }
}

#[derive(Debug, Default)]
struct Observations {
    ports: Vec<u16>,
    markers: BTreeSet<String>,
}

/// Ports and readiness markers seen on child output, shared between the
/// reader tasks and the supervisor
#[derive(Debug, Clone, Default)]
pub struct DiscoveryBoard {
    inner: Arc<Mutex<BTreeMap<String, Observations>>>,
}

impl DiscoveryBoard {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Observations>> {
        // a panicking reader leaves the map itself consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_port(&self, child: &str, port: u16) {
        self.lock().entry(child.to_string()).or_default().ports.push(port);
    }

    pub fn record_marker(&self, child: &str, marker: &str) {
        self.lock()
            .entry(child.to_string())
            .or_default()
            .markers
            .insert(marker.to_string());
    }

    /// First port the child announced
    pub fn port(&self, child: &str) -> Option<u16> {
        self.lock().get(child).and_then(|o| o.ports.first().copied())
    }

    pub fn seen(&self, child: &str, marker: &str) -> bool {
        self.lock()
            .get(child)
            .map(|o| o.markers.contains(marker))
            .unwrap_or(false)
    }

    /// Apply a watch to one output line
    pub fn observe(&self, child: &str, watch: &LineWatch, line: &str) {
        if let Some(port) = watch.port_in(line) {
            info!(child, port, "Port announced");
            self.record_port(child, port);
        }
        for marker in &watch.markers {
            if line.contains(marker.as_str()) {
                self.record_marker(child, marker);
            }
        }
    }
}

/// A running child plus the tasks draining its output
pub struct ManagedChild {
    name: String,
    child: Child,
    readers: Vec<JoinHandle<()>>,
}

impl ManagedChild {
    pub fn spawn(
        spec: &ChildSpec,
        watch: LineWatch,
        board: DiscoveryBoard,
    ) -> Result<Self, SupervisorError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            name: spec.name.clone(),
            program: spec.program.clone(),
            source,
        })?;
        info!(child = %spec.name, pid = ?child.id(), program = %spec.program.display(), "Child started");

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(spec.name.clone(), stdout, watch.clone(), board.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(spec.name.clone(), stderr, watch, board));
        }

        Ok(Self {
            name: spec.name.clone(),
            child,
            readers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the child has already exited
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>, SupervisorError> {
        Ok(self.child.try_wait()?)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL
    pub async fn terminate(&mut self, grace: Duration) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(child = %self.name, %status, "Child already exited");
            return;
        }

        send_terminate(&self.child);
        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(child = %self.name, %status, "Child stopped"),
            Ok(Err(e)) => warn!(child = %self.name, error = %e, "Waiting for child failed"),
            Err(_) => {
                warn!(child = %self.name, grace_secs = grace.as_secs(), "Child ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(child = %self.name, error = %e, "Kill failed");
                }
            }
        }
    }

    /// Wait briefly for the readers to drain; stragglers are left detached
    pub async fn join_readers(&mut self, limit: Duration) {
        for handle in self.readers.drain(..) {
            if timeout(limit, handle).await.is_err() {
                warn!(child = %self.name, "Output reader still running, abandoning it");
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

fn spawn_reader<R>(name: String, stream: R, watch: LineWatch, board: DiscoveryBoard) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!(child = %name, "{line}");
                    board.observe(&name, &watch, &line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(child = %name, error = %e, "Output stream closed");
                    break;
                }
            }
        }
    })
}

/// Ask the OS for an unused loopback port
pub fn find_free_port() -> Result<u16, SupervisorError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
