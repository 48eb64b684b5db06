//! Coalesces bursts of low-value change notifications into one refetch per cache key.

use crate::connection::ChannelObserver;
use crate::event::ChangeEvent;
use crate::query_cache::{CacheKey, QueryCache};
use crate::record::Record;
use crate::scope::Scope;
use crate::timer::ScheduledTask;
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::time::Duration;

struct InvalidatorInner {
    cache: Arc<dyn QueryCache>,
    keys: Vec<CacheKey>,
    window: Duration,
    timer: ScheduledTask,
    refetches: AtomicU64,
    closed: AtomicBool,
}

/// Invalidates a fixed set of cache keys once a burst of notifications has settled.
///
/// Every [`notify`](Self::notify) restarts the window, so N notifications arriving less than
/// one window apart produce exactly one invalidation of each key.
#[derive(Clone)]
pub struct DebouncedInvalidator {
    inner: Arc<InvalidatorInner>,
}

impl std::fmt::Debug for DebouncedInvalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedInvalidator")
            .field("keys", &self.inner.keys)
            .field("window", &self.inner.window)
            .finish()
    }
}

impl DebouncedInvalidator {
    /// Creates an invalidator over `keys`.
    pub fn new(cache: Arc<dyn QueryCache>, keys: Vec<CacheKey>, window: Duration) -> Self {
        Self {
            inner: Arc::new(InvalidatorInner {
                cache,
                keys,
                window,
                timer: ScheduledTask::new("invalidator"),
                refetches: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Records a change notification and restarts the window. Does nothing once closed.
    pub fn notify(&self) {
        if self.is_closed() {
            debug!("Invalidator of {:?} is closed, ignoring notification", self.inner.keys);
            return;
        }
        let inner = self.inner.clone();
        self.inner.timer.schedule(self.inner.window, move || async move {
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            inner.refetches.fetch_add(1, Ordering::SeqCst);
            for key in &inner.keys {
                debug!("Invalidating {:?}", key);
                inner.cache.invalidate(key).await;
            }
        });
    }

    /// Drops a pending invalidation. Returns `true` if one was pending.
    pub fn cancel(&self) -> bool {
        self.inner.timer.cancel()
    }

    /// Drops a pending invalidation and ignores every later notification.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.timer.cancel();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether an invalidation is scheduled.
    pub fn is_pending(&self) -> bool {
        self.inner.timer.is_pending()
    }

    /// The keys this invalidator refreshes.
    pub fn keys(&self) -> &[CacheKey] {
        &self.inner.keys
    }

    /// How many times the keys have been invalidated.
    pub fn refetch_count(&self) -> u64 {
        self.inner.refetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelObserver for DebouncedInvalidator {
    async fn on_change(&self, event: &ChangeEvent) {
        if matches!(event.record(), Some(Record::CheckIn(_) | Record::Streak(_))) {
            self.notify();
        }
    }

    async fn on_resubscribed(&self, scope: &Scope) {
        debug!("'{}' resubscribed, scheduling invalidation", scope);
        self.notify();
    }
}
