//! `herald` binary: load settings, start the broker, serve until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use herald_broker::Broker;
use herald_server::{HeraldServer, metrics, settings, telemetry};
use tracing::info;

/// How long accepted events may take to flush on shutdown.
const BROKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// How long HTTP connections may take to finish on shutdown.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Real-time event distribution broker.
#[derive(Debug, Parser)]
#[command(name = "herald", version, about)]
struct Cli {
    /// Settings file (default `~/.herald/settings.json`).
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,
    /// Override the bind port.
    #[arg(long, short)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = cli.config.unwrap_or_else(settings::settings_path);
    let mut settings = settings::load_settings_from_path(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    telemetry::init(&settings.logging).context("initialising logging")?;
    let prometheus = metrics::install_recorder();

    let broker = Arc::new(Broker::new(settings.broker.clone()).context("building broker")?);
    let broker_handle = broker.start().context("starting broker")?;

    let server = HeraldServer::new(settings.server.clone(), broker).with_metrics(prometheus);
    let (addr, serve) = server.listen().await.context("binding listener")?;
    info!(%addr, channels = settings.broker.channels.len(), "herald ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    info!("shutting down");

    let _ = server
        .shutdown()
        .drain(vec![serve], SERVER_SHUTDOWN_TIMEOUT)
        .await;
    broker_handle.shutdown(BROKER_DRAIN_TIMEOUT).await;
    info!("shutdown complete");
    Ok(())
}
