//! Bucket identity bookkeeping.
//!
//! Two concurrent maps:
//! - `routes`: route key -> bucket hash. Many routes may share one hash and
//!   the remote service can reassign a route at any time, so every response
//!   re-validates the entry.
//! - `buckets`: bucket hash (or route key, for unlimited sentinels) -> bucket
//!   state with an expiry instant.
//!
//! Expired entries are never returned by [`BucketStore::resolve`]; they are
//! dropped lazily on lookup, by [`BucketStore::purge_expired`], or by the
//! optional janitor task.

use crate::bucket::Bucket;
use crate::clock::{Clock, SystemClock};
use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use http::HeaderMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Entry {
    bucket: Arc<Bucket>,
    expires_at: u64,
}

/// What [`BucketStore::record`] learned from a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The response carried no usable quota headers; nothing changed.
    NoQuota,
    /// The route reported quota without a bucket id and is now tracked as
    /// unlimited.
    Unlimited,
    /// Bucket state for `hash` was stored.
    Bucket {
        /// Identity the route now points at.
        hash: String,
        /// Identity the route pointed at before, if any.
        previous: Option<String>,
    },
}

impl RecordOutcome {
    /// True when a route moved from one known identity to another.
    pub fn is_remap(&self) -> bool {
        match self {
            RecordOutcome::Bucket { hash, previous: Some(previous) } => previous != hash,
            _ => false,
        }
    }
}

/// Concurrent route -> identity -> bucket store.
#[derive(Debug)]
pub struct BucketStore {
    routes: DashMap<String, String>,
    buckets: DashMap<String, Entry>,
    grace_millis: u64,
    clock: Arc<dyn Clock>,
}

impl BucketStore {
    /// Create a store keeping buckets `grace` past their reset instant.
    pub fn new(grace: Duration) -> Self {
        Self::with_clock(grace, SystemClock)
    }

    /// Create a store reading time from `clock`.
    pub fn with_clock<C: Clock + 'static>(grace: Duration, clock: C) -> Self {
        Self::with_shared_clock(grace, Arc::new(clock))
    }

    pub(crate) fn with_shared_clock(grace: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            routes: DashMap::new(),
            buckets: DashMap::new(),
            grace_millis: u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            clock,
        }
    }

    /// Find the live bucket governing `route`.
    ///
    /// An unmapped route is looked up under its own key. `None` means the
    /// route has never been limited (or its bucket expired) and must be
    /// admitted.
    pub fn resolve(&self, route: &str) -> Option<Arc<Bucket>> {
        let identity = self.identity_or_route(route);
        let now = self.clock.now_millis();

        let expired = match self.buckets.get(&identity) {
            Some(entry) if now < entry.expires_at => return Some(entry.bucket.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.buckets.remove_if(&identity, |_, entry| now >= entry.expires_at);
        }
        None
    }

    /// Learn quota state from a response to `route`.
    pub fn record(&self, route: &str, headers: &HeaderMap) -> RecordOutcome {
        let snapshot = match Bucket::extract(headers) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::trace!(route, error = %err, "response carried no quota");
                return RecordOutcome::NoQuota;
            }
        };
        let expires_at = snapshot.reset_at.saturating_add(self.grace_millis);

        let Some(hash) = snapshot.hash.clone() else {
            self.routes.remove(route);
            self.buckets.insert(
                route.to_string(),
                Entry { bucket: Arc::new(Bucket::unlimited(snapshot.reset_at)), expires_at },
            );
            return RecordOutcome::Unlimited;
        };

        let previous = self.routes.insert(route.to_string(), hash.clone());
        match previous.as_deref() {
            // First identity for this route: its provisional sentinel, if
            // any, is unreachable now.
            None if hash != route => {
                self.buckets.remove_if(route, |_, entry| entry.bucket.is_unlimited());
            }
            Some(old) if old != hash => {
                tracing::debug!(route, from = old, to = %hash, "bucket remapped");
            }
            _ => {}
        }

        // Other routes may still share `previous`; its bucket is left to expire.
        let fresh = Entry { bucket: Arc::new(Bucket::from_snapshot(&snapshot)), expires_at };
        let now = self.clock.now_millis();
        match self.buckets.entry(hash.clone()) {
            Slot::Occupied(mut slot) => {
                let current = slot.get();
                let current_reset = current.bucket.snapshot().reset_at;
                if now < current.expires_at && snapshot.reset_at < current_reset {
                    // Out-of-order response: reset_at never moves backwards.
                    tracing::trace!(
                        route,
                        hash = %hash,
                        current = current_reset,
                        received = snapshot.reset_at,
                        "stale quota ignored"
                    );
                } else {
                    slot.insert(fresh);
                }
            }
            Slot::Vacant(slot) => {
                slot.insert(fresh);
            }
        }
        RecordOutcome::Bucket { hash, previous }
    }

    /// Identity currently mapped for `route`, if any.
    pub fn route_identity(&self, route: &str) -> Option<String> {
        self.routes.get(route).map(|hash| hash.value().clone())
    }

    /// Number of stored bucket entries, expired ones included.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of route -> identity mappings.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Drop every expired bucket entry; returns how many were removed.
    ///
    /// Route mappings are kept: a mapping to an evicted hash simply resolves
    /// to "never limited" until the next response refreshes it.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        self.buckets.retain(|_, entry| {
            let live = now < entry.expires_at;
            if !live {
                removed += 1;
            }
            live
        });
        if removed > 0 {
            tracing::trace!(removed, "purged expired buckets");
        }
        removed
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` on the
    /// current tokio runtime.
    ///
    /// The task stops when the returned handle is dropped or the store is.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) -> JanitorHandle {
        let store: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.purge_expired();
                    }
                    None => break,
                }
            }
        });
        JanitorHandle { task }
    }

    fn identity_or_route(&self, route: &str) -> String {
        self.routes
            .get(route)
            .map(|hash| hash.value().clone())
            .unwrap_or_else(|| route.to_string())
    }
}

/// Owns a running janitor task; aborts it on drop.
#[derive(Debug)]
pub struct JanitorHandle {
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// True once the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for JanitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
