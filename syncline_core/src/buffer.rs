//! Batches high-frequency change events into grouped cache mutations.

use crate::connection::ChannelObserver;
use crate::event::{ChangeEvent, ChangeKind};
use crate::invalidator::DebouncedInvalidator;
use crate::paged::{InsertSummary, PagedStore};
use crate::query_cache::{CacheKey, QueryCache};
use crate::record::{Message, Participant, Record};
use crate::scope::Scope;
use crate::timer::ScheduledTask;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::Duration;

struct BufferInner {
    scope: Scope,
    store: PagedStore,
    cache: Arc<dyn QueryCache>,
    invalidator: Option<DebouncedInvalidator>,
    flush_window: Duration,
    pending: Mutex<Vec<Message>>,
    timer: ScheduledTask,
    flushes: AtomicU64,
    closed: AtomicBool,
}

impl BufferInner {
    fn pending(&self) -> MutexGuard<'_, Vec<Message>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self) -> InsertSummary {
        let batch = std::mem::take(&mut *self.pending());
        if batch.is_empty() {
            return InsertSummary::default();
        }
        let size = batch.len();
        let summary = self.store.prepend_newest(batch);
        self.flushes.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Flushed {} buffered messages into '{}': {} inserted, {} reconciled, {} duplicates",
            size, self.scope, summary.inserted, summary.reconciled, summary.duplicates
        );
        summary
    }
}

/// Accumulates incoming message inserts and applies them to the [`PagedStore`] in one
/// grouped mutation once no new insert has arrived for the flush window.
///
/// Arrival order is preserved within a batch. Other change kinds are dispatched right away:
/// message updates and deletes refetch the loaded pages, participant changes go to the
/// query cache, and check-in or streak changes are handed to the attached
/// [`DebouncedInvalidator`].
#[derive(Clone)]
pub struct EventBuffer {
    inner: Arc<BufferInner>,
}

impl std::fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBuffer")
            .field("scope", &self.inner.scope)
            .field("flush_window", &self.inner.flush_window)
            .field("pending", &self.pending_len())
            .finish()
    }
}

impl EventBuffer {
    /// Creates a buffer in front of `store`.
    pub fn new(store: PagedStore, cache: Arc<dyn QueryCache>, flush_window: Duration) -> Self {
        Self::build(store, cache, flush_window, None)
    }

    /// Creates a buffer that forwards check-in and streak changes to `invalidator`.
    pub fn with_invalidator(
        store: PagedStore,
        cache: Arc<dyn QueryCache>,
        flush_window: Duration,
        invalidator: DebouncedInvalidator,
    ) -> Self {
        Self::build(store, cache, flush_window, Some(invalidator))
    }

    fn build(
        store: PagedStore,
        cache: Arc<dyn QueryCache>,
        flush_window: Duration,
        invalidator: Option<DebouncedInvalidator>,
    ) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                scope: store.scope().clone(),
                store,
                cache,
                invalidator,
                flush_window,
                pending: Mutex::new(Vec::new()),
                timer: ScheduledTask::new("event-buffer"),
                flushes: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Dispatches one change event.
    pub async fn handle(&self, event: &ChangeEvent) {
        match (event.kind, event.record()) {
            (ChangeKind::Insert, Some(Record::Message(message))) => self.enqueue(message.clone()),
            (_, Some(Record::Message(_))) => {
                self.flush_now();
                if let Err(e) = self.inner.store.refetch_loaded().await {
                    warn!("Refetch of '{}' after a message {:?} failed: {}", self.inner.scope, event.kind, e);
                }
            }
            (ChangeKind::Insert, Some(Record::Participant(participant))) => {
                self.merge_participant(participant.clone()).await;
            }
            (_, Some(Record::Participant(_))) => {
                self.inner
                    .cache
                    .invalidate(&CacheKey::Participants(self.inner.scope.clone()))
                    .await;
            }
            (_, Some(Record::CheckIn(_) | Record::Streak(_))) => match &self.inner.invalidator {
                Some(invalidator) => invalidator.notify(),
                None => debug!("No invalidator on '{}', ignoring {:?}", self.inner.scope, event.kind),
            },
            (_, None) => debug!("Change on '{}' without a record, ignoring", self.inner.scope),
        }
    }

    fn enqueue(&self, message: Message) {
        self.inner.pending().push(message);
        if self.is_closed() {
            debug!("Buffer of '{}' is closed, applying insert directly", self.inner.scope);
            self.inner.flush();
            return;
        }
        let inner = self.inner.clone();
        self.inner.timer.schedule(self.inner.flush_window, move || async move {
            inner.flush();
        });
    }

    async fn merge_participant(&self, participant: Participant) {
        let key = CacheKey::Participants(self.inner.scope.clone());
        self.inner
            .cache
            .write(
                &key,
                Box::new(move |current| {
                    let mut records = current.unwrap_or_default();
                    let known = records.iter().any(
                        |record| matches!(record, Record::Participant(existing) if existing.id == participant.id),
                    );
                    if !known {
                        records.push(Record::Participant(participant));
                    }
                    records
                }),
            )
            .await;
    }

    /// Applies everything buffered right away.
    pub fn flush_now(&self) -> InsertSummary {
        self.inner.timer.cancel();
        self.inner.flush()
    }

    /// Cancels the flush timer and applies what is still buffered. Used on teardown.
    ///
    /// Inserts handled after closing are applied immediately and never arm the timer again.
    pub fn close(&self) -> InsertSummary {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.flush_now()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of buffered inserts.
    pub fn pending_len(&self) -> usize {
        self.inner.pending().len()
    }

    /// Number of non-empty flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::SeqCst)
    }

    /// The store this buffer writes into.
    pub fn store(&self) -> &PagedStore {
        &self.inner.store
    }
}

#[async_trait]
impl ChannelObserver for EventBuffer {
    async fn on_change(&self, event: &ChangeEvent) {
        self.handle(event).await;
    }

    async fn on_resubscribed(&self, scope: &Scope) {
        self.flush_now();
        debug!("'{}' resubscribed, refetching loaded pages", scope);
        if let Err(e) = self.inner.store.refetch_loaded().await {
            warn!("Gap refetch of '{}' failed: {}", scope, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::paged::PageFetcher;
    use crate::query_cache::CacheUpdater;
    use crate::record::EntryId;
    use chrono::{DateTime, Utc};
    use std::collections::HashMap;
    use uuid::Uuid;

    struct EmptyHistory;

    #[async_trait]
    impl PageFetcher for EmptyHistory {
        async fn fetch_page(
            &self,
            _scope: &Scope,
            _cursor: Option<DateTime<Utc>>,
            _limit: u32,
        ) -> Result<Vec<Message>, BoxError> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct MapCache {
        values: Mutex<HashMap<CacheKey, Vec<Record>>>,
        invalidated: Mutex<Vec<CacheKey>>,
    }

    #[async_trait]
    impl QueryCache for MapCache {
        async fn read(&self, key: &CacheKey) -> Option<Vec<Record>> {
            self.values.lock().unwrap().get(key).cloned()
        }

        async fn write(&self, key: &CacheKey, updater: CacheUpdater) {
            let mut values = self.values.lock().unwrap();
            let current = values.remove(key);
            values.insert(key.clone(), updater(current));
        }

        async fn invalidate(&self, key: &CacheKey) {
            self.invalidated.lock().unwrap().push(key.clone());
        }
    }

    fn scope() -> Scope {
        Scope::chat_room("lobby")
    }

    fn buffer(cache: Arc<MapCache>) -> EventBuffer {
        let store = PagedStore::new(scope(), Arc::new(EmptyHistory), 50, Duration::from_secs(10));
        EventBuffer::new(store, cache, Duration::from_millis(100))
    }

    fn insert(content: &str) -> ChangeEvent {
        ChangeEvent::insert(
            scope(),
            Record::Message(Message {
                id: EntryId::Server(Uuid::new_v4()),
                room_id: "lobby".to_string(),
                sender_id: Uuid::new_v4(),
                sender_name: "bob".to_string(),
                content: content.to_string(),
                created_at: Utc::now(),
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_inserts_is_flushed_once_in_arrival_order() {
        let buffer = buffer(Arc::new(MapCache::default()));

        for i in 0..20 {
            buffer.handle(&insert(&format!("m{}", i))).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(buffer.pending_len(), 20);
        assert!(buffer.store().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(buffer.flush_count(), 1);
        assert_eq!(buffer.pending_len(), 0);
        let contents: Vec<String> = buffer.store().messages().into_iter().map(|m| m.content).collect();
        let expected: Vec<String> = (0..20).map(|i| format!("m{}", i)).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_what_is_pending() {
        let buffer = buffer(Arc::new(MapCache::default()));
        buffer.handle(&insert("late")).await;

        let summary = buffer.close();

        assert_eq!(summary.inserted, 1);
        assert_eq!(buffer.store().len(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(buffer.flush_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inserts_after_close_apply_without_a_timer() {
        let buffer = buffer(Arc::new(MapCache::default()));
        buffer.close();

        buffer.handle(&insert("straggler")).await;

        assert!(buffer.is_closed());
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.store().len(), 1);
        assert!(!buffer.inner.timer.is_pending());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(buffer.store().len(), 1);
        assert_eq!(buffer.flush_count(), 1);
    }

    #[tokio::test]
    async fn participant_inserts_merge_into_the_cache_once() {
        let cache = Arc::new(MapCache::default());
        let buffer = buffer(cache.clone());
        let participant = Participant {
            id: Uuid::new_v4(),
            room_id: "lobby".to_string(),
            user_id: Uuid::new_v4(),
            display_name: "ada".to_string(),
            joined_at: Utc::now(),
        };
        let event = ChangeEvent::insert(scope(), Record::Participant(participant.clone()));

        buffer.handle(&event).await;
        buffer.handle(&event).await;

        let participants = cache.read(&CacheKey::Participants(scope())).await.unwrap();
        assert_eq!(participants, vec![Record::Participant(participant.clone())]);

        buffer
            .handle(&ChangeEvent::delete(scope(), Record::Participant(participant)))
            .await;
        assert_eq!(
            *cache.invalidated.lock().unwrap(),
            vec![CacheKey::Participants(scope())]
        );
    }
}
