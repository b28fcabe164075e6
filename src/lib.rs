//! Storehouse - read-through response cache for package and git proxies
//!
//! "Bring ye all the tithes into the storehouse" - Malachi 3:10
//!
//! Storehouse sits between build machines and their upstreams, storing immutable responses
//! so each one crosses the network once.
//!
//! ## Components
//!
//! - **Fingerprint**: stable SHA-256 key for a request (method, URL, protocol, headers, body)
//! - **Cache**: disk backend with single-flight population and streaming to waiting requests,
//!   plus an in-memory backend
//! - **Policy**: which requests and responses are eligible for caching
//! - **Server**: hyper HTTP/1 proxy that routes eligible requests through the cache

pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod policy;
pub mod server;
pub mod types;

pub use cache::{CacheEntry, CacheError, DiskCache, Lookup, LookupStatus, MemoryCache, ResponseCache};
pub use config::Args;
pub use fingerprint::{fingerprint, CacheKey};
pub use server::{run, AppState};
pub use types::{Result, StorehouseError};
