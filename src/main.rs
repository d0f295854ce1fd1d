//! Passage server daemon.
//!
//! Accepts reverse-tunnel clients on the control port and exposes their
//! registered proxies to external users.

use anyhow::{Context, Result};
use clap::Parser;
use passage_server::{ServerConfig, Service};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Passage - rendezvous server for reverse tunnels
#[derive(Parser, Debug)]
#[command(name = "passaged")]
#[command(about = "Passage - rendezvous server for reverse tunnels")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "PASSAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Control listener address, overrides the config file
    #[arg(long, env = "PASSAGE_BIND_ADDR")]
    bind_addr: Option<String>,

    /// Control listener port, overrides the config file
    #[arg(long, env = "PASSAGE_BIND_PORT")]
    bind_port: Option<u16>,

    /// Shared authentication token, overrides the config file
    #[arg(long, env = "PASSAGE_TOKEN")]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut cfg = match &cli.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(bind_addr) = cli.bind_addr {
        cfg.bind_addr = bind_addr;
    }
    if let Some(bind_port) = cli.bind_port {
        cfg.bind_port = bind_port;
    }
    if let Some(token) = cli.token {
        cfg.token = token;
    }
    if cfg.token.is_empty() {
        warn!("no token configured, any client will be able to log in");
    }

    let service = Service::bind(cfg).await.context("failed to start server")?;
    info!("passage server ready on {}", service.control_addr());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("received ctrl-c, shutting down");
        }
        _ = service.run() => {
            error!("server stopped unexpectedly");
        }
    }

    Ok(())
}
