//! tabsync-server binary entry point.
//!
//! Usage:
//! ```bash
//! TABSYNC_SECRET_KEY=... TABSYNC_AUTH_PHRASE=... tabsync-server --config tabsync.toml
//! tabsync-server --help
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tabsync_core::Credentials;
use tabsync_server::{Config, Listener, TableServer};
use tracing_subscriber::EnvFilter;

/// Host tables for tabsync replication peers.
#[derive(Parser, Debug)]
#[command(name = "tabsync-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "tabsync.toml")]
    config: PathBuf,

    /// Override the configured bind address
    #[arg(long)]
    bind: Option<String>,

    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("tabsync-server v{} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        tracing::warn!(
            "Config file {} not found, using defaults",
            args.config.display()
        );
        Config::default()
    };
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    let credentials = Credentials::from_env().context("Failed to load credentials")?;
    let bind_address = config.server.bind_address.clone();
    let server = Arc::new(TableServer::new(config, credentials));
    let hosted = server.host_configured_tables()?;
    tracing::info!("Hosting {} configured table(s)", hosted);

    let listener = Listener::bind(&bind_address).await?;
    listener
        .serve_with_shutdown(server, shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing(verbosity: u8) {
    // RUST_LOG wins when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        })
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received...");
}
