use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[path = "../api/mod.rs"]
mod api;
#[path = "../controller/mod.rs"]
mod controller;
#[path = "../shared/mod.rs"]
mod shared;

use shared::SandboxConfig;

/// Per-project sandbox containers with terminals, port discovery and file
/// sync.
#[derive(Debug, Parser)]
#[command(name = "codepod-sandboxd", version)]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, env = "CODEPOD_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Directory for rolling log files
    #[arg(long, env = "CODEPOD_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _logs = shared::logging::init_service_logging(&args.log_dir, "codepod_sandboxd")?;

    let (config, loaded_from) = SandboxConfig::load(args.config)?;
    match loaded_from {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    api::rest::api::run_rest_server(config).await
}
