//! Disk-backed response cache
//!
//! One file per key directly under the cache root. A population writes `<key>.temp` and
//! renames it to `<key>` only after the whole body has been written and synced, so a file at
//! the final path is always complete.
//!
//! Concurrent misses on a key share one population task through the [`TrackerRegistry`].
//! Waiting callers attach [`SharedFile`] readers and stream the body while it is still being
//! written. Hits open the final path directly without taking any lock.
//!
//! Whoever owns the tracker for a path owns its temp file. Writers from `begin_write` claim
//! the tracker too, so at most one writer touches `<key>.temp` at a time.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hyper::StatusCode;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tracing::{debug, info, warn};

use super::entry::{decode_entry, EntryHeader, HeaderFields};
use super::registry::{Claim, Flight, Tracker, TrackerRegistry};
use super::shared_file::SharedFile;
use super::{
    file_body, BodyStream, CacheEntry, CacheError, CacheWriter, Fetch, Lookup, LookupStatus,
    ResponseCache,
};

/// Suffix of in-progress entries
pub const TEMP_SUFFIX: &str = ".temp";

/// Disk cache rooted at one directory
pub struct DiskCache {
    root: PathBuf,
    registry: Arc<TrackerRegistry>,
}

impl DiskCache {
    /// Create a cache over `root` without touching the filesystem
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: TrackerRegistry::new(),
        }
    }

    /// Create a cache over `root`, creating the directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache = Self::new(root);
        fs::create_dir_all(&cache.root).await?;
        info!(path = %cache.root.display(), "Initialized disk cache");
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of populations currently in flight
    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Final path of the entry for `key`
    pub fn entry_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && !key.ends_with(TEMP_SUFFIX)
            && !key.contains(['/', '\\', '\0']);
        if !valid {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Open and decode a published entry; `Ok(None)` if there is none
async fn open_entry(path: &Path) -> Result<Option<CacheEntry>, CacheError> {
    match File::open(path).await {
        Ok(file) => Ok(Some(decode_entry(file_body(file)).await?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Create the temp file and write the entry header into it.
///
/// The caller must own the tracker for the entry. Anything already at `temp` was left by a
/// crashed or dropped writer and is replaced.
async fn begin_entry_file(temp: &Path, header: &EntryHeader) -> Result<SharedFile, CacheError> {
    let encoded = header.encode()?;
    discard_temp(temp).await;
    let mut file = SharedFile::create(temp).await?;
    file.write(Bytes::from(encoded)).await?;
    Ok(file)
}

/// Sync the temp file and rename it over the final path
async fn publish(file: &SharedFile, temp: &Path, path: &Path) -> Result<(), CacheError> {
    file.sync().await?;
    fs::rename(temp, path).await?;
    Ok(())
}

/// Copy the upstream body into the file, returning the body length
async fn copy_body(
    file: &mut SharedFile,
    mut body: BodyStream,
    expected: Option<u64>,
) -> Result<u64, CacheError> {
    let mut copied = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        copied += chunk.len() as u64;
        file.write(chunk).await?;
    }

    match expected {
        Some(expected) if expected != copied => Err(CacheError::LengthMismatch {
            expected,
            actual: copied,
        }),
        _ => Ok(copied),
    }
}

async fn discard_temp(temp: &Path) {
    if let Err(err) = fs::remove_file(temp).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %temp.display(), error = %err, "Failed to remove temp entry");
        }
    }
}

/// Background population for one tracker. Runs to completion even if every waiter leaves.
async fn populate(tracker: Tracker, fetch: Arc<dyn Fetch>) {
    let path = tracker.path().to_path_buf();

    let entry = match fetch.fetch().await {
        Ok(entry) => entry,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Upstream fetch failed");
            tracker.hand_off(Err(err));
            return;
        }
    };

    if !fetch.cacheable(entry.status, &entry.headers) {
        debug!(path = %path.display(), status = %entry.status, "Response not cacheable");
        tracker.hand_off(Ok(Lookup::new(entry, LookupStatus::Uncacheable)));
        return;
    }

    let temp = temp_path(&path);
    let mut file = match begin_entry_file(&temp, &EntryHeader::for_entry(&entry)).await {
        Ok(file) => file,
        Err(err) => {
            warn!(path = %temp.display(), error = %err, "Failed to start cache entry");
            discard_temp(&temp).await;
            tracker.hand_off(Ok(Lookup::new(entry, LookupStatus::Unpersisted(err))));
            return;
        }
    };

    tracker.stream(file.handle());

    let CacheEntry {
        body,
        content_length,
        ..
    } = entry;

    let result = match copy_body(&mut file, body, content_length).await {
        Ok(size) => publish(&file, &temp, &path).await.map(|_| size),
        Err(err) => Err(err),
    };

    match result {
        Ok(size) => {
            file.close();
            info!(path = %path.display(), size = size, "Stored cache entry");
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Abandoning cache entry");
            file.abort(&err);
            tracker.close();
            discard_temp(&temp).await;
        }
    }

    drop(tracker);
}

#[async_trait]
impl ResponseCache for DiskCache {
    async fn get(&self, key: &str, fetch: Arc<dyn Fetch>) -> Result<Lookup, CacheError> {
        let path = self.entry_path(key)?;

        loop {
            if let Some(entry) = open_entry(&path).await? {
                debug!(key = key, "Disk cache hit");
                return Ok(Lookup::hit(entry));
            }

            let mut waiter = self.registry.join_or_start(&path, |tracker| {
                debug!(key = key, "Disk cache miss, starting population");
                tokio::spawn(populate(tracker, Arc::clone(&fetch)));
            });

            match waiter.wait().await {
                Flight::Streaming(handle) => {
                    let entry = decode_entry(handle.spawn_reader().into_stream()).await?;
                    return Ok(Lookup::new(entry, LookupStatus::Miss));
                }
                Flight::Handoff(handoff) => {
                    if let Some(result) = handoff.take() {
                        return result;
                    }
                }
                Flight::Pending | Flight::Closed => {}
            }

            debug!(key = key, "Population closed without a result for us, retrying");
            waiter.finished().await;
        }
    }

    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        open_entry(&self.entry_path(key)?).await
    }

    async fn begin_write(
        &self,
        key: &str,
        status: StatusCode,
        headers: &HeaderFields,
    ) -> Result<Box<dyn CacheWriter>, CacheError> {
        let path = self.entry_path(key)?;
        let tracker = loop {
            match self.registry.claim(&path) {
                Claim::Owner(tracker) => break tracker,
                Claim::Joined(waiter) => {
                    debug!(key = key, "Waiting for in-flight write");
                    waiter.finished().await;
                }
            }
        };

        let temp = temp_path(&path);
        let header = EntryHeader::new(status, headers.clone(), None);
        let file = begin_entry_file(&temp, &header).await?;
        Ok(Box::new(DiskWriter {
            file,
            temp,
            path,
            tracker,
        }))
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut removed = 0usize;

        while let Some(entry) = entries.next_entry().await? {
            // Hidden files in the root belong to the operator
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }

            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        info!(path = %self.root.display(), removed = removed, "Disk cache cleared");
        Ok(())
    }
}

/// Writer for [`ResponseCache::begin_write`]. Holds the tracker until the temp file is
/// published or removed.
struct DiskWriter {
    file: SharedFile,
    temp: PathBuf,
    path: PathBuf,
    tracker: Tracker,
}

#[async_trait]
impl CacheWriter for DiskWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), CacheError> {
        self.file.write(Bytes::copy_from_slice(data)).await?;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), CacheError> {
        let DiskWriter {
            file,
            temp,
            path,
            tracker,
        } = *self;
        let result = match publish(&file, &temp, &path).await {
            Ok(()) => {
                file.close();
                Ok(())
            }
            Err(err) => {
                file.abort(&err);
                discard_temp(&temp).await;
                Err(err)
            }
        };
        drop(tracker);
        result
    }

    async fn abort(self: Box<Self>) -> Result<(), CacheError> {
        let DiskWriter { file, temp, tracker, .. } = *self;
        file.abort(&io::Error::new(io::ErrorKind::Interrupted, "write aborted"));
        discard_temp(&temp).await;
        drop(tracker);
        Ok(())
    }
}
