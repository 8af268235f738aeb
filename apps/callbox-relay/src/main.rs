use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use callbox_relay::{
    app,
    cli::{run_probe, Cli, Commands},
    config::Config,
    telemetry::Telemetry,
    ConnectionRegistry, RelayState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        user_id,
        timeout_secs,
    }) = cli.command
    {
        let report = run_probe(&url, user_id, timeout_secs)
            .await
            .with_context(|| format!("relay at {url} is not reachable"))?;
        println!("relay at {} is running (registered as {})", report.url, report.identity);
        return Ok(());
    }

    let config = Config::from_env().with_port(cli.port);
    let state = RelayState::new(ConnectionRegistry::new()).with_metrics(telemetry.metrics_handle());

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Signaling server running on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!("relay shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
