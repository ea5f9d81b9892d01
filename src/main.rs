//! authgate - Main entry point
//!
//! An authenticating reverse proxy with OAuth2 login and WebSocket tunneling

use anyhow::{Context, Result};
use authgate::{Conf, ProxyServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// authgate - An authenticating reverse proxy
#[derive(Parser, Debug)]
#[command(name = "authgate")]
#[command(version)]
#[command(about = "An authenticating reverse proxy with OAuth2 login and WebSocket tunneling")]
struct Args {
    /// Path to the YAML config file
    #[arg(long, short = 'c', env = "AUTHGATE_CONF", default_value = "config.yml")]
    conf: PathBuf,

    /// Log level, overridden by RUST_LOG when set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting authgate v{}", env!("CARGO_PKG_VERSION"));

    let conf = Conf::parse(&args.conf)
        .with_context(|| format!("failed to load {}", args.conf.display()))?;
    info!("Config loaded from: {}", args.conf.display());

    let server = Arc::new(ProxyServer::from_config(&conf)?);

    server.run().await?;

    Ok(())
}
