//! In-process response cache
//!
//! Entries live in a map behind a read-biased lock. Writers buffer privately and publish in
//! one step on `finish`. Concurrent misses on a key each run their own fetch.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hyper::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::entry::HeaderFields;
use super::{
    collect_body, CacheEntry, CacheError, CacheWriter, Fetch, Lookup, LookupStatus, ResponseCache,
};

#[derive(Debug, Clone)]
struct MemoryEntry {
    status: StatusCode,
    headers: HeaderFields,
    body: Bytes,
}

impl MemoryEntry {
    fn to_entry(&self) -> CacheEntry {
        CacheEntry::from_bytes(self.status, self.headers.clone(), self.body.clone())
    }
}

type EntryMap = Arc<RwLock<HashMap<String, MemoryEntry>>>;

/// Map-backed cache for tests and small deployments
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: EntryMap,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Total stored body bytes
    pub async fn size_bytes(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .map(|entry| entry.body.len())
            .sum()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str, fetch: Arc<dyn Fetch>) -> Result<Lookup, CacheError> {
        if let Some(entry) = self.lookup(key).await? {
            debug!(key = key, "Memory cache hit");
            return Ok(Lookup::hit(entry));
        }

        let entry = fetch.fetch().await?;
        if !fetch.cacheable(entry.status, &entry.headers) {
            return Ok(Lookup::new(entry, LookupStatus::Uncacheable));
        }

        let CacheEntry {
            status,
            headers,
            content_length,
            body,
        } = entry;
        let body = collect_body(body).await?;
        if let Some(expected) = content_length {
            if expected != body.len() as u64 {
                let err = CacheError::LengthMismatch {
                    expected,
                    actual: body.len() as u64,
                };
                warn!(key = key, error = %err, "Not storing response");
                let entry = CacheEntry::from_bytes(status, headers, body);
                return Ok(Lookup::new(entry, LookupStatus::Unpersisted(err)));
            }
        }

        let stored = MemoryEntry {
            status,
            headers,
            body,
        };
        let entry = stored.to_entry();
        self.entries.write().await.insert(key.to_string(), stored);
        debug!(key = key, size = entry.content_length, "Memory cache stored entry");

        Ok(Lookup::new(entry, LookupStatus::Miss))
    }

    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.read().await.get(key).map(MemoryEntry::to_entry))
    }

    async fn begin_write(
        &self,
        key: &str,
        status: StatusCode,
        headers: &HeaderFields,
    ) -> Result<Box<dyn CacheWriter>, CacheError> {
        Ok(Box::new(MemoryWriter {
            entries: Arc::clone(&self.entries),
            key: key.to_string(),
            status,
            headers: headers.clone(),
            buf: BytesMut::new(),
        }))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }
}

struct MemoryWriter {
    entries: EntryMap,
    key: String,
    status: StatusCode,
    headers: HeaderFields,
    buf: BytesMut,
}

#[async_trait]
impl CacheWriter for MemoryWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), CacheError> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), CacheError> {
        let MemoryWriter {
            entries,
            key,
            status,
            headers,
            buf,
        } = *self;
        let entry = MemoryEntry {
            status,
            headers,
            body: buf.freeze(),
        };
        entries.write().await.insert(key, entry);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fetch_counting(calls: Arc<AtomicUsize>, status: StatusCode) -> Arc<dyn Fetch> {
        Arc::new(move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CacheError>(CacheEntry::from_bytes(status, HeaderFields::new(), "body"))
            }
        })
    }

    #[tokio::test]
    async fn test_writer_publishes_only_on_finish() {
        let cache = MemoryCache::new();
        let mut headers = HeaderFields::new();
        headers.add("Content-Type", "text/html");

        let mut writer = cache.begin_write("key", StatusCode::OK, &headers).await.unwrap();
        writer.write(b"hello ").await.unwrap();
        writer.write(b"world").await.unwrap();
        assert!(cache.lookup("key").await.unwrap().is_none());

        writer.finish().await.unwrap();
        let entry = cache.lookup("key").await.unwrap().unwrap();
        assert_eq!(entry.headers, headers);
        assert_eq!(&entry.into_bytes().await.unwrap()[..], b"hello world");
        assert_eq!(cache.size_bytes().await, 11);
    }

    #[tokio::test]
    async fn test_abort_leaves_no_trace() {
        let cache = MemoryCache::new();
        let mut writer = cache
            .begin_write("key", StatusCode::OK, &HeaderFields::new())
            .await
            .unwrap();
        writer.write(b"partial").await.unwrap();
        writer.abort().await.unwrap();

        assert!(cache.lookup("key").await.unwrap().is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_fetches_once_then_hits() {
        let cache = MemoryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = fetch_counting(Arc::clone(&calls), StatusCode::OK);

        let first = cache.get("key", Arc::clone(&fetch)).await.unwrap();
        assert!(matches!(first.status, LookupStatus::Miss));
        let second = cache.get("key", fetch).await.unwrap();
        assert!(second.is_hit());
        assert_eq!(&second.entry.into_bytes().await.unwrap()[..], b"body");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_uncacheable_is_not_stored() {
        let cache = MemoryCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = fetch_counting(Arc::clone(&calls), StatusCode::NOT_FOUND);

        let lookup = cache.get("key", fetch).await.unwrap();
        assert!(matches!(lookup.status, LookupStatus::Uncacheable));
        assert_eq!(lookup.entry.status, StatusCode::NOT_FOUND);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_get_length_mismatch_is_served_but_not_stored() {
        let cache = MemoryCache::new();
        let fetch: Arc<dyn Fetch> = Arc::new(|| async {
            let mut entry = CacheEntry::from_bytes(StatusCode::OK, HeaderFields::new(), "short");
            entry.content_length = Some(100);
            Ok::<_, CacheError>(entry)
        });

        let lookup = cache.get("key", fetch).await.unwrap();
        assert!(matches!(
            lookup.status,
            LookupStatus::Unpersisted(CacheError::LengthMismatch {
                expected: 100,
                actual: 5
            })
        ));
        assert_eq!(&lookup.entry.into_bytes().await.unwrap()[..], b"short");
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = MemoryCache::new();
        let fetch = fetch_counting(Arc::new(AtomicUsize::new(0)), StatusCode::OK);
        cache.get("a", Arc::clone(&fetch)).await.unwrap();
        cache.get("b", fetch).await.unwrap();
        assert_eq!(cache.len().await, 2);

        cache.clear().await.unwrap();
        assert!(cache.is_empty().await);
    }
}
