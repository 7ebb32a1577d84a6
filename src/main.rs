// src/main.rs

//! The main entry point for the manager daemon.

use anyhow::Result;
use berylmgr::config::Config;
use berylmgr::server;
use std::env;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("berylmgr version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise "berylmgr.toml", resolved against BERYLMGR_HOME when
    // that is set and the path is relative.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("berylmgr.toml");
    let config_path = match env::var("BERYLMGR_HOME") {
        Ok(home) if !config_path.starts_with('/') => {
            PathBuf::from(home).join(config_path).display().to_string()
        }
        _ => config_path.to_string(),
    };

    let config = match Config::from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            // A missing config file is not fatal; the daemon starts with
            // defaults and an empty catalog.
            eprintln!("warning: {e:#}; using defaults");
            Config::default()
        }
    };

    // Log level resolution: BERYLMGR_LOG_LEVEL, then RUST_LOG, then the
    // config file.
    let initial_log_level = env::var("BERYLMGR_LOG_LEVEL")
        .or_else(|_| env::var("RUST_LOG"))
        .unwrap_or_else(|_| config.log_level.clone());

    // Create a reloadable filter layer so the level can change at runtime.
    let (filter, _reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true),
        )
        .init();

    if let Err(e) = server::run(config).await {
        error!("manager runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
