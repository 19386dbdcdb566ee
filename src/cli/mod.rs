//! Command-line interface for lectern.
//!
//! Provides commands for running the supervised process tree, serving
//! the Coordination Service, talking to it, and calling the AI gateway.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, Level};

use crate::client::CoordinationClient;
use crate::config::{self, paths, ResolvedConfig};
use crate::domain::{LogFilter, NewTask};
use crate::gateway::ApiGateway;
use crate::logging::{init_tracing, LogReceiver, StoreLogLayer};
use crate::orchestrator::{find_free_port, ChildSpec, HttpChild, Supervisor, SupervisorConfig};
use crate::service::{shutdown_signal, CoordinationService, ServiceConfig};
use crate::store::{OwnerLock, TaskStore};

/// lectern - coordination layer for a multi-process research pipeline
#[derive(Parser, Debug)]
#[command(name = "lectern")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// State directory (overrides LECTERN_HOME and the config file)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the Coordination Service and HTTP service and supervise them
    Orchestrate {
        /// HTTP service program
        #[arg(long)]
        http_program: Option<String>,

        /// HTTP service argument (repeatable, `{port}` is substituted)
        #[arg(long = "http-arg", allow_hyphen_values = true)]
        http_args: Vec<String>,

        /// HTTP service port (a free port is picked if not set)
        #[arg(long)]
        http_port: Option<u16>,
    },

    /// Run the Coordination Service in the foreground
    Serve {
        /// Port to bind (0 = OS-assigned)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send a raw request to the Coordination Service
    Call {
        /// Action name (e.g. get_all_tasks)
        action: String,

        /// JSON params object
        #[arg(long)]
        params: Option<String>,
    },

    /// Queue a task
    Enqueue {
        /// Task type tag
        task_type: String,

        /// JSON payload
        #[arg(long)]
        payload: Option<String>,

        /// Task that must complete first
        #[arg(long)]
        depends_on: Option<String>,

        /// Explicit task id (uuid v4 if not given)
        #[arg(long)]
        id: Option<String>,
    },

    /// List tasks, newest first
    Tasks,

    /// Show system logs
    Logs {
        /// Level filter (repeatable)
        #[arg(long = "level")]
        levels: Vec<String>,

        /// Source filter (repeatable)
        #[arg(long = "source")]
        sources: Vec<String>,
    },

    /// Send a prompt through the AI gateway
    Prompt {
        /// Prompt text
        prompt: String,

        /// Expect and parse a JSON answer
        #[arg(long)]
        json: bool,

        /// Model override
        #[arg(short, long)]
        model: Option<String>,
    },

    /// List models available through the AI gateway
    Models,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        let log_receiver = if matches!(self.command, Commands::Orchestrate { .. }) {
            let (layer, receiver) = StoreLogLayer::new("orchestrator", Level::INFO);
            init_tracing(Some(layer));
            Some(receiver)
        } else {
            init_tracing(None);
            None
        };

        let mut config = config::load_config()?;
        if let Some(home) = self.home {
            config.home = home;
        }

        match self.command {
            Commands::Orchestrate {
                http_program,
                http_args,
                http_port,
            } => orchestrate(&config, http_program, http_args, http_port, log_receiver).await,
            Commands::Serve { port } => serve(&config, port).await.map(|_| ExitCode::SUCCESS),
            Commands::Call { action, params } => {
                call(&action, params.as_deref()).await.map(|_| ExitCode::SUCCESS)
            }
            Commands::Enqueue {
                task_type,
                payload,
                depends_on,
                id,
            } => enqueue(&task_type, payload.as_deref(), depends_on, id)
                .await
                .map(|_| ExitCode::SUCCESS),
            Commands::Tasks => list_tasks().await.map(|_| ExitCode::SUCCESS),
            Commands::Logs { levels, sources } => {
                show_logs(LogFilter { levels, sources }).await.map(|_| ExitCode::SUCCESS)
            }
            Commands::Prompt {
                prompt,
                json,
                model,
            } => run_prompt(&config, &prompt, json, model.as_deref())
                .await
                .map(|_| ExitCode::SUCCESS),
            Commands::Models => list_models(&config).await.map(|_| ExitCode::SUCCESS),
            Commands::Config => {
                show_config(&config);
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

/// Supervise the process tree until a signal or a fatal error
async fn orchestrate(
    config: &ResolvedConfig,
    http_program: Option<String>,
    http_args: Vec<String>,
    http_port: Option<u16>,
    log_receiver: Option<LogReceiver>,
) -> Result<ExitCode> {
    let exe = std::env::current_exe().context("Failed to locate current executable")?;
    let exe_dir = exe.parent().map(PathBuf::from);

    let mut db = ChildSpec::new("db_manager", &exe)
        .arg("serve")
        .arg("--home")
        .arg(config.home.to_string_lossy());
    if let Some(dir) = &exe_dir {
        db = db.prepend_path(dir);
    }

    let settings = &config.orchestrator;
    let program = http_program.or_else(|| settings.http.program.clone());
    let http = match program {
        Some(program) => {
            let args = if http_args.is_empty() {
                settings.http.args.clone()
            } else {
                http_args
            };
            let port = match http_port.or(settings.http.port) {
                Some(port) => port,
                None => find_free_port()?,
            };
            let mut spec = ChildSpec::new("api_server", program).args(args);
            if let Some(dir) = &exe_dir {
                spec = spec.prepend_path(dir);
            }
            Some(HttpChild {
                spec,
                port,
                ready_marker: settings.http.ready_marker.clone(),
            })
        }
        None => None,
    };

    let mut supervisor = Supervisor::new(SupervisorConfig::new(db, http, settings));
    if let Some(receiver) = log_receiver {
        supervisor = supervisor.ship_logs(receiver);
    }

    match supervisor.run_until(shutdown_signal()).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "Orchestrator stopped on error");
            Ok(ExitCode::from(1))
        }
    }
}

/// Run the Coordination Service over <home>/lectern.db
async fn serve(config: &ResolvedConfig, port: Option<u16>) -> Result<()> {
    let _lock = OwnerLock::acquire(paths::lock_path(&config.home))?;
    let store = TaskStore::open(paths::db_path(&config.home)).with_context(|| {
        format!("Failed to open task store in {}", config.home.display())
    })?;

    let mut settings = config.service.clone();
    if let Some(port) = port {
        settings.port = port;
    }

    let service = CoordinationService::bind(store, ServiceConfig::from(settings)).await?;
    service.announce(&mut std::io::stdout().lock())?;
    service.run().await?;
    Ok(())
}

fn parse_json_arg(name: &str, raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("--{name} is not valid JSON")),
        None => Ok(Value::Object(Default::default())),
    }
}

async fn call(action: &str, params: Option<&str>) -> Result<()> {
    let params = parse_json_arg("params", params)?;
    let data = CoordinationClient::from_env().call(action, params).await?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

async fn enqueue(
    task_type: &str,
    payload: Option<&str>,
    depends_on: Option<String>,
    id: Option<String>,
) -> Result<()> {
    let mut task = NewTask::new(task_type, parse_json_arg("payload", payload)?);
    if let Some(id) = id {
        task = task.with_id(id);
    }
    if let Some(parent) = depends_on {
        task = task.depends_on(parent);
    }

    if !CoordinationClient::from_env().add_task(&task).await? {
        bail!("Task id already exists: {}", task.task_id);
    }
    println!("{}", task.task_id);
    Ok(())
}

async fn list_tasks() -> Result<()> {
    let tasks = CoordinationClient::from_env().get_all_tasks().await?;
    if tasks.is_empty() {
        println!("No tasks");
        return Ok(());
    }

    println!("{:<38} {:<12} {:<11} {:>4}  DEPENDS ON", "TASK ID", "TYPE", "STATUS", "PROG");
    for task in tasks {
        println!(
            "{:<38} {:<12} {:<11} {:>3}%  {}",
            task.task_id,
            task.task_type,
            task.status.as_str(),
            task.progress,
            task.depends_on.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn show_logs(filter: LogFilter) -> Result<()> {
    let logs = CoordinationClient::from_env().get_system_logs(&filter).await?;
    for log in logs {
        println!(
            "{} [{}] {}: {}",
            log.timestamp.format("%Y-%m-%d %H:%M:%S"),
            log.level,
            log.source,
            log.message
        );
    }
    Ok(())
}

async fn run_prompt(config: &ResolvedConfig, prompt: &str, json: bool, model: Option<&str>) -> Result<()> {
    let gateway = ApiGateway::gemini_from_env(&config.gateway)?;
    if json {
        let response = gateway.prompt_for_json(prompt, model).await?;
        println!("{}", serde_json::to_string_pretty(&response.value)?);
        eprintln!("[served by {}, {} tokens]", response.credential, response.tokens_used);
    } else {
        let response = gateway.prompt_for_text(prompt, model).await?;
        println!("{}", response.value);
        eprintln!("[served by {}, {} tokens]", response.credential, response.tokens_used);
    }
    Ok(())
}

async fn list_models(config: &ResolvedConfig) -> Result<()> {
    let gateway = ApiGateway::gemini_from_env(&config.gateway)?;
    for model in gateway.list_models().await? {
        println!("{model}");
    }
    Ok(())
}

fn show_config(config: &ResolvedConfig) {
    println!("Home: {}", config.home.display());
    println!("Database: {}", paths::db_path(&config.home).display());
    match &config.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none)"),
    }
    println!("Service: {:?}", config.service);
    println!("Orchestrator: {:?}", config.orchestrator);
    println!("Gateway: {:?}", config.gateway);
}
