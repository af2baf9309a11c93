//! strata-server: framed TCP front-end over the foreign-storage subsystem.

mod connection;
mod service;

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_cache::ChunkCache;
use strata_catalog::Catalog;
use strata_common::config::{DiskCacheConfig, SchedulerConfig, ServerConfig};
use strata_foreign::{ForeignStorageMgr, RefreshScheduler};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-server")]
#[command(about = "Foreign-storage chunk service")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/strata/server.toml")]
    config: String,

    /// Listen address for the framed TCP front-end
    #[arg(short, long)]
    listen: Option<String>,

    /// Root directory of the disk cache
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Run without the disk cache
    #[arg(long)]
    no_cache: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default, Deserialize)]
struct Config {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    cache: DiskCacheConfig,
    #[serde(default)]
    scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize)]
struct ServerSection {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default = "default_delimiter")]
    request_delimiter: char,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_delimiter: default_delimiter(),
        }
    }
}

fn default_listen() -> String {
    ServerConfig::default().listen.to_string()
}

fn default_delimiter() -> char {
    ServerConfig::default().request_delimiter as char
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config: Config = if std::path::Path::new(&args.config).exists() {
        let contents = std::fs::read_to_string(&args.config)?;
        toml::from_str(&contents).unwrap_or_else(|e| {
            eprintln!("Warning: failed to parse config file: {e}");
            Config::default()
        })
    } else {
        Config::default()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let listen = args.listen.unwrap_or(config.server.listen);
    let cache_dir = args.cache_dir.unwrap_or(config.cache.path);
    let cache_enabled = config.cache.enabled && !args.no_cache;
    let delimiter = config.server.request_delimiter as u8;

    info!("starting strata-server");
    info!("cache: {} (enabled: {cache_enabled})", cache_dir.display());

    let catalog = Catalog::new(1);
    let cache = if cache_enabled {
        Some(Arc::new(ChunkCache::new(&cache_dir)?))
    } else {
        None
    };
    let mgr = ForeignStorageMgr::new(Arc::clone(&catalog), cache);

    let scheduler = RefreshScheduler::new(Arc::clone(&catalog), Arc::clone(&mgr));
    scheduler.set_wait_duration(config.scheduler.wait_duration_ms);
    let program_running = Arc::new(AtomicBool::new(true));
    scheduler.start(Arc::clone(&program_running));

    let handler = service::StorageService::new(catalog, mgr);
    let listener = TcpListener::bind(&listen).await?;
    info!("listening on {listen}");

    tokio::select! {
        result = connection::serve(listener, handler, delimiter) => {
            if let Err(e) = result {
                error!("accept loop failed: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    program_running.store(false, Ordering::Release);
    let scheduler_for_stop = Arc::clone(&scheduler);
    tokio::task::spawn_blocking(move || scheduler_for_stop.stop()).await?;

    info!("strata-server shut down gracefully");
    Ok(())
}
