use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use edge_proxy::{tls, Config, Service};

/// How long graceful shutdown waits for in-flight requests.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "edge-proxy", version, about = "Configurable HTTP/1.1 reverse proxy")]
struct Args {
    /// Path to the proxy configuration file.
    #[arg(short, long, default_value = "./config.yml", env = "CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "edge_proxy=info".parse().unwrap()),
        )
        .init();

    tls::install_default_crypto_provider();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;

    let service = Service::from_config(&config)
        .await
        .context("building service")?;
    info!("proxy started");

    wait_for_signal().await?;
    info!("shutting down");

    if let Err(err) = service.shutdown(Some(SHUTDOWN_GRACE)).await {
        error!(error = %err, "graceful shutdown failed");
        service.close();
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")
}
