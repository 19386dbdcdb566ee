//! Configuration for lectern.
//!
//! Configuration sources (highest priority first):
//! 1. CLI flags (applied by the caller)
//! 2. Environment variables (LECTERN_HOME, DB_MANAGER_PORT, LECTERN_API_KEYS)
//! 3. Config file (.lectern/config.yaml)
//! 4. Defaults (~/.lectern)
//!
//! Config file discovery:
//! - Searches current directory and parents for .lectern/config.yaml
//! - `paths.home` is relative to the .lectern/ directory
//!
//! Loaded once at process start into a [`ResolvedConfig`] and passed down.

pub mod paths;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable overriding the state directory
pub const HOME_ENV: &str = "LECTERN_HOME";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub service: ServiceSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .lectern/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub host: String,
    /// 0 = OS-assigned
    pub port: u16,
    pub idle_timeout_secs: u64,
    pub max_frame_bytes: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            idle_timeout_secs: 300,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub port_timeout_secs: u64,
    pub heartbeat_secs: u64,
    pub poll_interval_ms: u64,
    pub discovery_poll_ms: u64,
    pub grace_secs: u64,
    pub reader_join_secs: u64,
    pub http: HttpChildSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            port_timeout_secs: 30,
            heartbeat_secs: 15,
            poll_interval_ms: 2000,
            discovery_poll_ms: 100,
            grace_secs: 5,
            reader_join_secs: 2,
            http: HttpChildSettings::default(),
        }
    }
}

/// The sibling HTTP process. Without a program the orchestrator runs DB-only.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HttpChildSettings {
    pub program: Option<String>,
    /// `{port}` is replaced with the HTTP port
    pub args: Vec<String>,
    pub port: Option<u16>,
    pub ready_marker: String,
}

impl Default for HttpChildSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            port: None,
            ready_marker: "Uvicorn running on".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub cooldown_secs: u64,
    pub backoff_base_ms: u64,
    pub model: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            timeout_secs: 180,
            max_retries: 3,
            cooldown_secs: 60,
            backoff_base_ms: 2000,
            model: "gemini-2.0-flash".to_string(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory holding the database
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub service: ServiceSettings,
    pub orchestrator: OrchestratorSettings,
    pub gateway: GatewaySettings,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`, ignoring files and environment
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            config_file: None,
            service: ServiceSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            gateway: GatewaySettings::default(),
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".lectern").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources, discovering the file from the cwd
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd, std::env::var(HOME_ENV).ok())
}

/// Load configuration discovering the file from `start`, with an
/// explicit home override standing in for the environment
pub fn load_config_from(start: &Path, env_home: Option<String>) -> Result<ResolvedConfig> {
    let default_home = || -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".lectern"))
    };

    let config_file = find_config_file(start);
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let home = if let Some(env_home) = env_home {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(config_path)) = (&file.paths.home, &config_file) {
        let lectern_dir = config_path.parent().unwrap_or(Path::new("."));
        resolve_path(lectern_dir, home_path)
    } else {
        default_home()?
    };

    Ok(ResolvedConfig {
        home,
        config_file,
        service: file.service,
        orchestrator: file.orchestrator,
        gateway: file.gateway,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let temp = TempDir::new().unwrap();
        let config = load_config_from(temp.path(), Some("/srv/lectern".to_string())).unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/lectern"));
        assert!(config.config_file.is_none());
        assert_eq!(config.service.port, 0);
        assert_eq!(config.orchestrator.port_timeout_secs, 30);
        assert_eq!(config.orchestrator.heartbeat_secs, 15);
        assert_eq!(config.gateway.cooldown_secs, 60);
        assert_eq!(config.gateway.max_retries, 3);
    }

    #[test]
    fn test_config_file_discovered_from_subdirectory() {
        let temp = TempDir::new().unwrap();
        let lectern_dir = temp.path().join(".lectern");
        std::fs::create_dir_all(&lectern_dir).unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let mut file = std::fs::File::create(lectern_dir.join("config.yaml")).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  home: ./state
service:
  idle_timeout_secs: 30
orchestrator:
  heartbeat_secs: 5
  http:
    program: uvicorn
    args: ["app:app", "--port", "{{port}}"]
gateway:
  model: gemini-1.5-pro
"#
        )
        .unwrap();

        let config = load_config_from(&nested, None).unwrap();
        assert_eq!(config.home, lectern_dir.join("state"));
        assert_eq!(config.service.idle_timeout_secs, 30);
        assert_eq!(config.service.host, "127.0.0.1");
        assert_eq!(config.orchestrator.heartbeat_secs, 5);
        assert_eq!(config.orchestrator.port_timeout_secs, 30);
        assert_eq!(config.orchestrator.http.program.as_deref(), Some("uvicorn"));
        assert_eq!(config.orchestrator.http.args[2], "{port}");
        assert_eq!(config.orchestrator.http.ready_marker, "Uvicorn running on");
        assert_eq!(config.gateway.model, "gemini-1.5-pro");
    }

    #[test]
    fn test_env_home_beats_file() {
        let temp = TempDir::new().unwrap();
        let lectern_dir = temp.path().join(".lectern");
        std::fs::create_dir_all(&lectern_dir).unwrap();
        std::fs::write(lectern_dir.join("config.yaml"), "paths:\n  home: ./state\n").unwrap();

        let config = load_config_from(temp.path(), Some("/override".to_string())).unwrap();
        assert_eq!(config.home, PathBuf::from("/override"));
        assert!(config.config_file.is_some());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
