//! sockstun: forward local TCP ports through a SOCKS proxy.
//!
//! Reads the rule set from a TOML config file, opens one listener per rule,
//! and runs until SIGINT/SIGTERM or until a rule fails.

mod config;
mod duration;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, DEFAULT_CONFIG_PATH};
use sockstun_core::Tunnel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// sockstun: forward local TCP ports through a SOCKS proxy
#[derive(Parser, Debug)]
#[command(name = "sockstun", version, about = "Forward local TCP ports through a SOCKS proxy")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting sockstun");

    if let Err(e) = run(&cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("sockstun stopped");
}

async fn run(cli: &Cli) -> Result<()> {
    let config_path =
        config::expand_home(&cli.config).context("failed to resolve config file path")?;
    let cfg = Config::load(&config_path)?;

    let tunnel = Tunnel::new(&cfg.socks_uri, cfg.rw_timeout).context("failed to create tunnel")?;
    for (name, rule) in &cfg.rules {
        tunnel.add(name, &rule.local_sock, &rule.remote_sock);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => info!("received shutdown signal"),
            Err(e) => error!(error = %e, "failed to install signal handlers, shutting down"),
        }
        on_signal.cancel();
    });

    tunnel.run(cancel).await.context("tunnel stopped")
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
