//! lectern CLI entrypoint

use std::process::ExitCode;

use clap::Parser;

use lectern::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    // Tracing is installed by `execute` so the orchestrator can attach its store layer
    let cli = Cli::parse();
    match cli.execute().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
