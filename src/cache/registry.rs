//! In-flight population registry
//!
//! Maps the destination path of every entry currently being populated to a watch channel.
//! The first caller to miss on a path creates the tracker and starts the population task;
//! later callers subscribe to it. The tracker is removed when its owning task drops it, so
//! a panicking population can never strand waiters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

use super::shared_file::SharedFileHandle;
use super::{CacheError, Lookup};

/// What a population has to offer waiting callers
#[derive(Clone)]
pub enum Flight {
    /// Fetch still in progress
    Pending,
    /// Entry is being written; any number of callers may attach readers
    Streaming(SharedFileHandle),
    /// Single result for exactly one caller (uncacheable, unpersisted or failed fetch)
    Handoff(Arc<Handoff>),
    /// Population ended without publishing anything; look on disk again
    Closed,
}

/// Take-once slot
pub struct Handoff(Mutex<Option<Result<Lookup, CacheError>>>);

impl Handoff {
    fn new(result: Result<Lookup, CacheError>) -> Self {
        Self(Mutex::new(Some(result)))
    }

    /// The result, if no other caller took it first
    pub fn take(&self) -> Option<Result<Lookup, CacheError>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Outcome of [`TrackerRegistry::claim`]
pub enum Claim {
    Owner(Tracker),
    Joined(Waiter),
}

#[derive(Default)]
pub struct TrackerRegistry {
    trackers: Mutex<HashMap<PathBuf, watch::Sender<Flight>>>,
}

impl TrackerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the tracker for `path`, or create it and hand it to `start`.
    ///
    /// Lookup and insert happen in one critical section, so at most one `start` runs per
    /// path at a time. `start` runs after the lock is released.
    pub fn join_or_start<F>(self: &Arc<Self>, path: &Path, start: F) -> Waiter
    where
        F: FnOnce(Tracker),
    {
        match self.claim(path) {
            Claim::Owner(tracker) => {
                let waiter = Waiter {
                    receiver: tracker.sender.subscribe(),
                };
                start(tracker);
                waiter
            }
            Claim::Joined(waiter) => {
                debug!(path = %path.display(), "Joining in-flight population");
                waiter
            }
        }
    }

    /// Take exclusive ownership of `path`, or subscribe to whoever holds it
    pub fn claim(self: &Arc<Self>, path: &Path) -> Claim {
        let mut trackers = self.lock();

        if let Some(sender) = trackers.get(path) {
            return Claim::Joined(Waiter {
                receiver: sender.subscribe(),
            });
        }

        let (sender, _) = watch::channel(Flight::Pending);
        trackers.insert(path.to_path_buf(), sender.clone());
        Claim::Owner(Tracker {
            path: path.to_path_buf(),
            sender,
            registry: Arc::clone(self),
        })
    }

    /// Number of populations in flight
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, watch::Sender<Flight>>> {
        self.trackers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Owning end of a tracker, held by the population task
pub struct Tracker {
    path: PathBuf,
    sender: watch::Sender<Flight>,
    registry: Arc<TrackerRegistry>,
}

impl Tracker {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Let every waiter attach to the in-progress file
    pub fn stream(&self, handle: SharedFileHandle) {
        self.sender.send_replace(Flight::Streaming(handle));
    }

    /// Withdraw whatever was published. Waiters arriving from now on retry once the tracker
    /// is gone.
    pub fn close(&self) {
        self.sender.send_replace(Flight::Closed);
    }

    /// Deliver one result to one waiter and close the tracker
    pub fn hand_off(self, result: Result<Lookup, CacheError>) {
        self.sender
            .send_replace(Flight::Handoff(Arc::new(Handoff::new(result))));
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        let mut trackers = self.registry.lock();
        trackers.remove(&self.path);
        // Streams and handoffs stay visible to waiters that subscribed before removal
        self.sender.send_if_modified(|flight| {
            if matches!(flight, Flight::Pending) {
                *flight = Flight::Closed;
                true
            } else {
                false
            }
        });
    }
}

/// Waiting end of a tracker
pub struct Waiter {
    receiver: watch::Receiver<Flight>,
}

impl Waiter {
    /// Wait until the population has something other than `Pending` to offer
    pub async fn wait(&mut self) -> Flight {
        match self
            .receiver
            .wait_for(|flight| !matches!(flight, Flight::Pending))
            .await
        {
            Ok(flight) => flight.clone(),
            Err(_) => Flight::Closed,
        }
    }

    /// Wait until the owning tracker has left the registry
    pub async fn finished(mut self) {
        while self.receiver.changed().await.is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, HeaderFields, LookupStatus};
    use hyper::StatusCode;

    fn entry() -> CacheEntry {
        CacheEntry::from_bytes(StatusCode::OK, HeaderFields::new(), "x")
    }

    #[tokio::test]
    async fn test_second_caller_joins() {
        let registry = TrackerRegistry::new();
        let path = Path::new("/cache/key");
        let mut owner = None;

        let mut first = registry.join_or_start(path, |tracker| owner = Some(tracker));
        let mut second = registry.join_or_start(path, |_| panic!("started twice"));
        assert_eq!(registry.len(), 1);

        drop(owner);
        assert!(registry.is_empty());
        assert!(matches!(first.wait().await, Flight::Closed));
        assert!(matches!(second.wait().await, Flight::Closed));
    }

    #[tokio::test]
    async fn test_handoff_goes_to_one_waiter() {
        let registry = TrackerRegistry::new();
        let path = Path::new("/cache/key");
        let mut owner = None;

        let mut first = registry.join_or_start(path, |tracker| owner = Some(tracker));
        let mut second = registry.join_or_start(path, |_| unreachable!());

        let tracker = owner.take().unwrap();
        tracker.hand_off(Ok(Lookup::new(entry(), LookupStatus::Uncacheable)));
        assert!(registry.is_empty());

        let (Flight::Handoff(a), Flight::Handoff(b)) = (first.wait().await, second.wait().await)
        else {
            panic!("expected handoff for both waiters");
        };
        let taken = [a.take().is_some(), b.take().is_some()];
        assert_eq!(taken.iter().filter(|t| **t).count(), 1);
    }

    #[tokio::test]
    async fn test_new_tracker_after_close() {
        let registry = TrackerRegistry::new();
        let path = Path::new("/cache/key");
        let mut starts = 0;

        let mut owner = None;
        registry.join_or_start(path, |tracker| {
            starts += 1;
            owner = Some(tracker);
        });
        drop(owner);
        registry.join_or_start(path, |_| starts += 1);

        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_dropped() {
        let registry = TrackerRegistry::new();
        let path = Path::new("/cache/key");

        let Claim::Owner(tracker) = registry.claim(path) else {
            panic!("first claim should own the path");
        };
        let Claim::Joined(mut waiter) = registry.claim(path) else {
            panic!("second claim should join");
        };

        drop(tracker);
        assert!(matches!(waiter.wait().await, Flight::Closed));
        waiter.finished().await;
        assert!(matches!(registry.claim(path), Claim::Owner(_)));
    }

    #[tokio::test]
    async fn test_close_withdraws_stream_before_removal() {
        let registry = TrackerRegistry::new();
        let path = Path::new("/cache/key");
        let mut owner = None;
        registry.join_or_start(path, |tracker| owner = Some(tracker));
        let tracker = owner.take().unwrap();

        tracker.close();
        let mut late = registry.join_or_start(path, |_| unreachable!());
        assert!(matches!(late.wait().await, Flight::Closed));
        assert_eq!(registry.len(), 1);

        let finished = tokio::spawn(late.finished());
        drop(tracker);
        finished.await.unwrap();
        assert!(registry.is_empty());
    }
}
