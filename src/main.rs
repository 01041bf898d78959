use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voxtask_bridge::config::ServerConfig;
use voxtask_bridge::routes::build_router;
use voxtask_bridge::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "voxtask-bridge", about = "Realtime voice-to-task bridge", version)]
struct Cli {
    /// Path to a YAML configuration file. Environment variables fill in
    /// anything the file leaves unset.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::from_env()?,
    };
    let address = config.address();
    let state = AppState::new(config);
    let router = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!(address = %address, tools = state.dispatcher.registry().len(), "bridge listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .context("server error")?;

    info!("bridge stopped");
    Ok(())
}

async fn shutdown_signal(state: voxtask_bridge::SharedState) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(live_sessions = state.sessions.len(), "shutdown requested, cancelling sessions");
        state.sessions.cancel_all();
    }
}
