//! Configuration for Storehouse
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::policy::Upstreams;

/// Short commit hash captured by build.rs
pub const GIT_COMMIT_SHORT: &str = env!("GIT_COMMIT_SHORT");

/// Full commit hash captured by build.rs
pub const GIT_COMMIT_FULL: &str = env!("GIT_COMMIT_FULL");

/// Identifies this proxy to upstreams, e.g. `storehouse/0.1.0 (a1b2c3d)`
pub fn banner() -> String {
    format!(
        "{}/{} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        GIT_COMMIT_SHORT
    )
}

/// Where cache entries are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CacheBackend {
    Disk,
    Memory,
}

/// Storehouse - caching proxy for git packs and Debian pools
///
/// "Bring ye all the tithes into the storehouse" - Malachi 3:10
#[derive(Parser, Debug, Clone)]
#[command(name = "storehouse")]
#[command(about = "Caching HTTP proxy for git upload-pack and Debian pool downloads")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Directory holding cache entries (disk backend)
    #[arg(long, env = "CACHE_DIRECTORY", default_value = "./cache")]
    pub cache_directory: PathBuf,

    /// Cache backend
    #[arg(long, env = "CACHE_BACKEND", value_enum, default_value = "disk")]
    pub cache_backend: CacheBackend,

    /// Comma-separated hosts whose git upload-pack responses may be cached ("*" for any)
    #[arg(long, env = "GIT_PACK_UPSTREAMS", default_value = "github.com,gitlab.com,bitbucket.org")]
    pub git_pack_upstreams: String,

    /// Comma-separated hosts whose Debian pool downloads may be cached ("*" for any)
    #[arg(
        long,
        env = "DEB_POOL_UPSTREAMS",
        default_value = "archive.ubuntu.com,security.ubuntu.com,deb.debian.org,security.debian.org"
    )]
    pub deb_pool_upstreams: String,

    /// Suppress per-request access logging
    #[arg(long, env = "QUIET", default_value = "false")]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Upstream request timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "300000")]
    pub request_timeout_ms: u64,

    /// Remove every cache entry before serving
    #[arg(long, env = "CLEAR_CACHE", default_value = "false")]
    pub clear_cache: bool,
}

impl Args {
    pub fn git_pack_upstreams(&self) -> Upstreams {
        Upstreams::parse(&self.git_pack_upstreams)
    }

    pub fn deb_pool_upstreams(&self) -> Upstreams {
        Upstreams::parse(&self.deb_pool_upstreams)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.cache_backend == CacheBackend::Disk && self.cache_directory.as_os_str().is_empty() {
            return Err("CACHE_DIRECTORY is required for the disk backend".to_string());
        }

        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(format!("LOG_LEVEL must be one of {}", LEVELS.join(", ")));
        }

        Ok(())
    }
}
