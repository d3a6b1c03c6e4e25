//! CLI tool for inspecting route tables
//!
//! Usage:
//!   edgeproxy-routes --config <file> list [--json]
//!   edgeproxy-routes --config <file> resolve <host> <path>

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgeproxy::proxy::host_name;
use edgeproxy::{classify, Dispatch, ProxyConfig};
use std::path::PathBuf;

/// CLI tool for inspecting EdgeProxy route tables
#[derive(Parser, Debug)]
#[command(name = "edgeproxy-routes")]
#[command(author = "EdgeProxy Contributors")]
#[command(version)]
#[command(about = "Inspect EdgeProxy route tables")]
struct Args {
    /// Route table configuration (TOML)
    #[arg(long, env = "EDGEPROXY_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registry and API routes
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show which pipeline would handle a request
    Resolve {
        /// Request hostname (e.g., docker.example.com)
        host: String,

        /// Request path (e.g., /v2/library/alpine/manifests/latest)
        path: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = ProxyConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    match args.command {
        Commands::List { json } => {
            if json {
                let registry: Vec<serde_json::Value> = config
                    .registry
                    .entries()
                    .into_iter()
                    .map(|(host, upstream)| {
                        serde_json::json!({ "host": host, "upstream": upstream.as_str() })
                    })
                    .collect();
                let api: Vec<serde_json::Value> = config
                    .api
                    .entries()
                    .into_iter()
                    .map(|(host, route)| {
                        serde_json::json!({
                            "host": host,
                            "upstream": route.upstream.as_str(),
                            "credential": route.credential.as_ref().map(|c| c.header.as_str()),
                        })
                    })
                    .collect();
                let output = serde_json::json!({ "registry": registry, "api": api });
                println!("{}", serde_json::to_string_pretty(&output)?);
                return Ok(());
            }

            if config.registry.is_empty() && config.api.is_empty() {
                println!("No routes configured");
                return Ok(());
            }

            println!("{:<10} {:<30} {:<45} {:<20}", "KIND", "HOST", "UPSTREAM", "CREDENTIAL");
            println!("{}", "-".repeat(105));

            for (host, upstream) in config.registry.entries() {
                println!("{:<10} {:<30} {:<45} {:<20}", "registry", host, upstream.as_str(), "-");
            }
            for (host, route) in config.api.entries() {
                let credential = route
                    .credential
                    .as_ref()
                    .map(|c| c.header.as_str())
                    .unwrap_or("-");
                println!(
                    "{:<10} {:<30} {:<45} {:<20}",
                    "api",
                    host,
                    route.upstream.as_str(),
                    credential
                );
            }

            println!(
                "\nTotal: {} registry, {} api route(s)",
                config.registry.len(),
                config.api.len()
            );
        }

        Commands::Resolve { host, path } => {
            let path = if path.starts_with('/') { path } else { format!("/{}", path) };
            let hostname = host_name(&host);
            let dispatch = classify(&config, &hostname, &path);
            println!("{} {} -> {}", host, path, dispatch);
            if let Dispatch::Generic = dispatch {
                match edgeproxy::proxy::generic_target(&path[1..], &config.cdn_base) {
                    Ok(url) => println!("  target: {}", url),
                    Err(e) => println!("  target: invalid ({})", e),
                }
            }
        }
    }

    Ok(())
}
