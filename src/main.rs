//! EdgeProxy - Main entry point
//!
//! An edge reverse proxy for registries, APIs and GitHub content

use anyhow::{Context, Result};
use clap::Parser;
use edgeproxy::{ProxyConfig, ProxyServer, ServerConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// EdgeProxy - An edge reverse proxy
#[derive(Parser, Debug)]
#[command(name = "edgeproxy")]
#[command(author = "EdgeProxy Contributors")]
#[command(version)]
#[command(about = "An edge reverse proxy for container registries, APIs and GitHub content")]
struct Args {
    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Address to bind
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Route table configuration (TOML)
    #[arg(long, env = "EDGEPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting EdgeProxy v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => {
            let config = ProxyConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            info!("Configuration loaded from: {}", path.display());
            config
        }
        None => {
            warn!("No configuration given, only generic proxying is available");
            ProxyConfig::default()
        }
    };

    let server_config = ServerConfig {
        bind_addr: args.bind,
        http_port: args.http_port,
    };

    let server = Arc::new(ProxyServer::new(server_config, config)?);

    info!("EdgeProxy started successfully");

    server.run().await?;

    Ok(())
}
