use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::api::rest::create_router;
use crate::api::AppState;
use crate::controller::{DockerRuntime, SandboxServices};
use crate::shared::store::HttpProjectStore;
use crate::shared::SandboxConfig;

pub async fn run_rest_server(config: SandboxConfig) -> Result<()> {
    info!(
        r#"
                 _                       _
   ___ ___   __| | ___ _ __   ___   __| |
  / __/ _ \ / _` |/ _ \ '_ \ / _ \ / _` |
 | (_| (_) | (_| |  __/ |_) | (_) | (_| |
  \___\___/ \__,_|\___| .__/ \___/ \__,_|
                      |_|
Starting sandbox service...
PID: {}
"#,
        std::process::id()
    );

    let runtime = Arc::new(
        DockerRuntime::connect(&config).context("Failed to connect to the Docker daemon")?,
    );
    let store = Arc::new(
        HttpProjectStore::new(&config.store.url, Duration::from_secs(config.store.timeout_secs))
            .context("Failed to build project store client")?,
    );
    info!("Project store: {}", config.store.url);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let services = SandboxServices::new(Arc::new(config), runtime, store);

    info!("Ensuring sandbox image {}...", services.config.docker.image);
    if let Err(e) = services.provisioner.ensure_image().await {
        error!("Sandbox image unavailable: {}", e);
        return Err(anyhow::anyhow!("Sandbox image unavailable: {}", e));
    }

    let state = Arc::new(AppState::new(services));
    let background = state.spawn_background();
    let reaper = state.services.reaper.clone().spawn();

    let app = create_router(state.clone());
    info!("Binding to: {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("REST API Endpoint: http://{}/api/v1", bind_addr);
    info!("Socket Endpoint: ws://{}/ws", bind_addr);
    info!("Ready to accept requests...");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!(
        "Shutting down with {} open socket connections, stopping all sandbox containers...",
        state.connections.len().await
    );
    reaper.abort();
    for task in background {
        task.abort();
    }
    state.services.provisioner.shutdown().await;
    info!("Shutdown complete");

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C");
}
