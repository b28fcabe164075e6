//! Response cache
//!
//! Read-through caching of upstream responses, keyed by request fingerprint.
//!
//! ## Backends
//!
//! - **DiskCache**: one file per key under a root directory. Concurrent misses on a key
//!   share a single upstream fetch, waiting callers stream the body while it is still being
//!   written, and entries are published by an atomic rename.
//! - **MemoryCache**: a plain map for tests and small deployments. No single-flight and no
//!   mid-write streaming.
//!
//! ```text
//!  get(key, fetch)
//!       │
//!       ├── <root>/<key> exists ──────────────► Hit (decode header, stream body)
//!       │
//!       └── missing ──► TrackerRegistry ──┬── first caller: spawn population task
//!                                          │      fetch ─► <key>.temp ─► sync ─► rename
//!                                          └── joiners: attach a SharedFile reader
//! ```

pub mod disk;
pub mod entry;
pub mod memory;
pub mod registry;
pub mod shared_file;

pub use disk::DiskCache;
pub use entry::{decode_entry, EntryHeader, HeaderFields, FORMAT_VERSION};
pub use memory::MemoryCache;
pub use shared_file::{SharedFile, SharedFileHandle, SharedFileReader};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use hyper::StatusCode;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::policy;

/// Chunk size used when streaming stored bodies
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Body of a cached or fetched response
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

// ============================================================================
// Errors
// ============================================================================

/// Error types for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Key cannot be used as a bare file name
    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode entry header: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode entry header: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Unsupported entry format version {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid status code in entry header: {0}")]
    InvalidStatus(u16),

    #[error("Entry header exceeds {0} bytes")]
    HeaderTooLarge(usize),

    /// Stream ended before the entry header was complete
    #[error("Entry truncated before end of header")]
    Truncated,

    /// Upstream body length disagreed with its declared Content-Length
    #[error("Body length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// Upstream fetch failed
    #[error("Fetch failed: {0}")]
    Fetch(String),
}

// ============================================================================
// Entries and lookups
// ============================================================================

/// A response read from, or about to be written to, a cache
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderFields,
    pub content_length: Option<u64>,
    pub body: BodyStream,
}

impl CacheEntry {
    pub fn new(status: StatusCode, headers: HeaderFields, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            content_length: None,
            body,
        }
    }

    /// Entry with a fully buffered body and a matching content length
    pub fn from_bytes(status: StatusCode, headers: HeaderFields, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            headers,
            content_length: Some(body.len() as u64),
            body: full_body(body),
        }
    }

    /// Buffer the whole body
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        collect_body(self.body).await
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// How a `get` was satisfied
#[derive(Debug)]
pub enum LookupStatus {
    /// Served from a published entry
    Hit,
    /// Fetched upstream and streamed while being stored
    Miss,
    /// Fetched upstream but rejected by the cacheability predicate; not stored
    Uncacheable,
    /// Fetched upstream but could not be stored; the response is still usable
    Unpersisted(CacheError),
}

#[derive(Debug)]
pub struct Lookup {
    pub entry: CacheEntry,
    pub status: LookupStatus,
}

impl Lookup {
    pub fn new(entry: CacheEntry, status: LookupStatus) -> Self {
        Self { entry, status }
    }

    pub fn hit(entry: CacheEntry) -> Self {
        Self::new(entry, LookupStatus::Hit)
    }

    pub fn is_hit(&self) -> bool {
        matches!(self.status, LookupStatus::Hit)
    }
}

// ============================================================================
// Collaborator contracts
// ============================================================================

/// Upstream fetch supplied by the caller of [`ResponseCache::get`].
///
/// `fetch` may be called more than once across retries, but at most once per outstanding
/// miss. `cacheable` is evaluated once per fetched response before anything is persisted.
pub trait Fetch: Send + Sync {
    fn fetch(&self) -> BoxFuture<'static, Result<CacheEntry, CacheError>>;

    fn cacheable(&self, status: StatusCode, headers: &HeaderFields) -> bool {
        policy::cacheable_response(status, headers)
    }
}

impl<F, Fut> Fetch for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<CacheEntry, CacheError>> + Send + 'static,
{
    fn fetch(&self) -> BoxFuture<'static, Result<CacheEntry, CacheError>> {
        Box::pin(self())
    }
}

/// Incremental writer for one entry. Only `finish` makes the entry visible.
#[async_trait]
pub trait CacheWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), CacheError>;

    async fn finish(self: Box<Self>) -> Result<(), CacheError>;

    /// Discard everything written so far
    async fn abort(self: Box<Self>) -> Result<(), CacheError>;
}

/// Interface the proxy layer consumes
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Return the entry for `key`, fetching and storing it on a miss
    async fn get(&self, key: &str, fetch: Arc<dyn Fetch>) -> Result<Lookup, CacheError>;

    /// Plain read; `Ok(None)` when the key has no published entry
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn begin_write(
        &self,
        key: &str,
        status: StatusCode,
        headers: &HeaderFields,
    ) -> Result<Box<dyn CacheWriter>, CacheError>;

    /// Remove every entry
    async fn clear(&self) -> Result<(), CacheError>;
}

// ============================================================================
// Body helpers
// ============================================================================

pub fn empty_body() -> BodyStream {
    stream::empty().boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> BodyStream {
    let bytes = bytes.into();
    if bytes.is_empty() {
        return empty_body();
    }
    stream::once(async move { Ok(bytes) }).boxed()
}

pub async fn collect_body(body: BodyStream) -> io::Result<Bytes> {
    let buf = body
        .try_fold(BytesMut::new(), |mut buf, chunk| async move {
            buf.extend_from_slice(&chunk);
            Ok(buf)
        })
        .await?;
    Ok(buf.freeze())
}

/// Stream the remainder of a file in fixed-size chunks
pub(crate) fn file_body(file: File) -> BodyStream {
    stream::try_unfold(file, |mut file| async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        let n = file.read_buf(&mut buf).await?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some((buf.freeze(), file)))
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_body_roundtrip() {
        let body = collect_body(full_body("hello")).await.unwrap();
        assert_eq!(&body[..], b"hello");
        assert!(collect_body(full_body(Bytes::new())).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closure_fetch_uses_default_policy() {
        let fetch = || async {
            Ok::<_, CacheError>(CacheEntry::from_bytes(
                StatusCode::OK,
                HeaderFields::new(),
                "data",
            ))
        };
        assert!(fetch.cacheable(StatusCode::OK, &HeaderFields::new()));
        assert!(!fetch.cacheable(StatusCode::INTERNAL_SERVER_ERROR, &HeaderFields::new()));

        let entry = Fetch::fetch(&fetch).await.unwrap();
        assert_eq!(entry.content_length, Some(4));
        assert_eq!(&entry.into_bytes().await.unwrap()[..], b"data");
    }

    #[tokio::test]
    async fn test_file_body_streams_whole_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("blob");
        let data = vec![7u8; READ_CHUNK_SIZE * 2 + 5];
        tokio::fs::write(&path, &data).await.unwrap();

        let file = File::open(&path).await.unwrap();
        let body = collect_body(file_body(file)).await.unwrap();
        assert_eq!(body.len(), data.len());
    }
}
