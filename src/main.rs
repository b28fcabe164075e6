//! Storehouse - caching proxy for git packs and Debian pools
//!
//! "Bring ye all the tithes into the storehouse" - Malachi 3:10

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storehouse::{
    config::{self, Args, CacheBackend},
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("storehouse={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Storehouse - caching proxy");
    info!("  \"Bring ye all the tithes into the storehouse\"");
    info!("======================================");
    info!("Version: {} ({})", config::banner(), config::GIT_COMMIT_FULL);
    info!("Listen: {}", args.listen);
    match args.cache_backend {
        CacheBackend::Disk => info!("Cache: disk at {}", args.cache_directory.display()),
        CacheBackend::Memory => info!("Cache: memory"),
    }
    info!("Git pack upstreams: {}", args.git_pack_upstreams);
    info!("Deb pool upstreams: {}", args.deb_pool_upstreams);
    if args.clear_cache {
        info!("Clearing cache before serving");
    }
    info!("======================================");

    let state = Arc::new(AppState::new(args).await?);
    server::run(state).await?;

    Ok(())
}
