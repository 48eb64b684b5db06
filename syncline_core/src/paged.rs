//! Cursor-paged local cache of a channel's message history.
//!
//! Pages are kept newest-first, exactly as fetched: `pages[0]` is the newest page and its
//! first entry the newest message. Older pages are appended at the end, new messages are
//! prepended to the newest page, and [`PagedStore::messages`] reverses everything for display.
//!
//! The store never holds two entries with the same server id.

use crate::error::{BoxError, RealtimeError};
use crate::record::{EntryId, Message};
use crate::scope::Scope;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Fetches message history from the persistent store.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Returns at most `limit` messages of `scope` strictly older than `cursor`, newest first.
    /// A `None` cursor fetches the newest page.
    async fn fetch_page(
        &self,
        scope: &Scope,
        cursor: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>, BoxError>;
}

/// One page of messages, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// The messages of this page.
    pub entries: Vec<Message>,
}

/// Result of a page load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// This many new messages were added.
    Loaded(usize),
    /// A fetch for the same cursor is already running; this call did nothing.
    InFlight,
    /// There is no older history left.
    Exhausted,
}

/// What happened to a batch of inserts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertSummary {
    /// Messages added to the newest page.
    pub inserted: usize,
    /// Speculative entries replaced by their server echo.
    pub reconciled: usize,
    /// Messages dropped because their id was already cached.
    pub duplicates: usize,
}

#[derive(Debug)]
struct PagedState {
    pages: Vec<Page>,
    has_more: bool,
    in_flight: HashSet<Option<DateTime<Utc>>>,
}

impl PagedState {
    fn entries(&self) -> impl Iterator<Item = &Message> {
        self.pages.iter().flat_map(|page| page.entries.iter())
    }

    fn contains(&self, id: &EntryId) -> bool {
        self.entries().any(|message| message.id == *id)
    }

    fn newest_page(&mut self) -> &mut Page {
        if self.pages.is_empty() {
            self.pages.push(Page::default());
        }
        &mut self.pages[0]
    }

    fn find_speculative_match(&mut self, echo: &Message, window: Duration) -> Option<&mut Message> {
        self.pages
            .iter_mut()
            .flat_map(|page| page.entries.iter_mut())
            .find(|message| message.matches_echo(echo, window))
    }

    fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries()
            .filter(|message| !message.is_speculative())
            .map(|message| message.created_at)
            .min()
    }

    fn server_len(&self) -> usize {
        self.entries().filter(|message| !message.is_speculative()).count()
    }
}

/// Removes the cursor from the in-flight set when the fetch ends, even if it is cancelled.
struct InFlightGuard<'a> {
    state: &'a Mutex<PagedState>,
    cursor: Option<DateTime<Utc>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .remove(&self.cursor);
    }
}

/// The paged message cache of one chat channel.
///
/// Cloning is cheap and every clone shares the same pages.
#[derive(Clone)]
pub struct PagedStore {
    scope: Scope,
    fetcher: Arc<dyn PageFetcher>,
    page_size: u32,
    echo_window: Duration,
    state: Arc<Mutex<PagedState>>,
}

impl std::fmt::Debug for PagedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagedStore")
            .field("scope", &self.scope)
            .field("page_size", &self.page_size)
            .field("echo_window", &self.echo_window)
            .finish()
    }
}

impl PagedStore {
    /// Creates an empty store.
    pub fn new(scope: Scope, fetcher: Arc<dyn PageFetcher>, page_size: u32, echo_window: Duration) -> Self {
        Self {
            scope,
            fetcher,
            page_size: page_size.max(1),
            echo_window,
            state: Arc::new(Mutex::new(PagedState {
                pages: Vec::new(),
                has_more: true,
                in_flight: HashSet::new(),
            })),
        }
    }

    /// The scope this store caches.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    fn lock(&self) -> MutexGuard<'_, PagedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_fetch(&self, cursor: Option<DateTime<Utc>>) -> Option<InFlightGuard<'_>> {
        if !self.lock().in_flight.insert(cursor) {
            debug!(
                "Fetch of '{}' at cursor {:?} already in flight, suppressing",
                self.scope, cursor
            );
            return None;
        }
        Some(InFlightGuard {
            state: &self.state,
            cursor,
        })
    }

    async fn fetch(&self, cursor: Option<DateTime<Utc>>, limit: u32) -> Result<Vec<Message>, RealtimeError> {
        self.fetcher
            .fetch_page(&self.scope, cursor, limit)
            .await
            .map_err(|e| {
                warn!("Failed fetching page of '{}' at {:?}: {}", self.scope, cursor, e);
                RealtimeError::Fetch(e.to_string())
            })
    }

    /// Loads the newest page, replacing any server entries already loaded.
    pub async fn load_initial(&self) -> Result<LoadOutcome, RealtimeError> {
        self.refetch(None).await
    }

    /// Loads one page strictly older than the oldest loaded message and appends it.
    pub async fn load_older(&self) -> Result<LoadOutcome, RealtimeError> {
        let (cursor, has_more) = {
            let state = self.lock();
            (state.oldest_timestamp(), state.has_more)
        };
        let Some(cursor) = cursor else {
            return self.load_initial().await;
        };
        if !has_more {
            return Ok(LoadOutcome::Exhausted);
        }
        let Some(_guard) = self.begin_fetch(Some(cursor)) else {
            return Ok(LoadOutcome::InFlight);
        };

        let fetched = self.fetch(Some(cursor), self.page_size).await?;

        let mut state = self.lock();
        state.has_more = fetched.len() >= self.page_size as usize;
        let mut page = Page::default();
        for message in fetched {
            if state.contains(&message.id) || page.entries.iter().any(|m| m.id == message.id) {
                continue;
            }
            page.entries.push(message);
        }
        let loaded = page.entries.len();
        if loaded > 0 {
            state.pages.push(page);
        }
        debug!(
            "Loaded {} older messages of '{}' before {}",
            loaded, self.scope, cursor
        );
        Ok(if loaded == 0 && !state.has_more {
            LoadOutcome::Exhausted
        } else {
            LoadOutcome::Loaded(loaded)
        })
    }

    /// Refetches the whole loaded range from the newest message.
    ///
    /// Speculative entries that have a matching server copy in the result are dropped; the
    /// others stay at the head of the newest page, together with any server entry inserted
    /// while the fetch was running.
    pub async fn refetch_loaded(&self) -> Result<LoadOutcome, RealtimeError> {
        let loaded = self.lock().server_len() as u32;
        self.refetch(Some(loaded)).await
    }

    async fn refetch(&self, loaded: Option<u32>) -> Result<LoadOutcome, RealtimeError> {
        let Some(_guard) = self.begin_fetch(None) else {
            return Ok(LoadOutcome::InFlight);
        };
        let limit = loaded.unwrap_or(0).max(self.page_size);
        let known: HashSet<EntryId> = self
            .lock()
            .entries()
            .filter(|message| !message.is_speculative())
            .map(|message| message.id)
            .collect();

        let mut fetched = self.fetch(None, limit).await?;
        let mut seen = HashSet::new();
        fetched.retain(|message| !message.is_speculative() && seen.insert(message.id));

        let mut state = self.lock();
        // Unconfirmed sends without a server copy, and server entries that arrived while
        // the fetch was running, survive in their current order.
        let mut head: Vec<Message> = state
            .entries()
            .filter(|message| {
                if message.is_speculative() {
                    !fetched
                        .iter()
                        .any(|server| message.matches_echo(server, self.echo_window))
                } else {
                    !known.contains(&message.id) && !seen.contains(&message.id)
                }
            })
            .cloned()
            .collect();

        let count = fetched.len();
        state.has_more = count >= limit as usize;
        state.pages = fetched
            .chunks(self.page_size as usize)
            .map(|chunk| Page {
                entries: chunk.to_vec(),
            })
            .collect();
        if !head.is_empty() {
            let newest = state.newest_page();
            head.append(&mut newest.entries);
            newest.entries = head;
        }
        debug!("Refetched {} messages of '{}'", count, self.scope);
        Ok(LoadOutcome::Loaded(count))
    }

    /// Prepends `messages`, in arrival order, to the newest page.
    ///
    /// Messages whose id is already cached are dropped. A server message matching a
    /// speculative entry replaces it in place.
    pub fn prepend_newest(&self, messages: Vec<Message>) -> InsertSummary {
        let mut summary = InsertSummary::default();
        let mut state = self.lock();
        for message in messages {
            if state.contains(&message.id) {
                summary.duplicates += 1;
                continue;
            }
            if !message.is_speculative()
                && let Some(slot) = state.find_speculative_match(&message, self.echo_window)
            {
                debug!("Reconciled {} with its echo {}", slot.id, message.id);
                *slot = message;
                summary.reconciled += 1;
                continue;
            }
            state.newest_page().entries.insert(0, message);
            summary.inserted += 1;
        }
        summary
    }

    /// Puts a speculative entry at the head of the newest page.
    pub fn prepend_speculative(&self, message: Message) {
        let mut state = self.lock();
        if state.contains(&message.id) {
            return;
        }
        state.newest_page().entries.insert(0, message);
    }

    /// Replaces the entry `temporary` with `server`. Returns `false` if it was already gone.
    ///
    /// If `server` is already cached the speculative entry is simply removed.
    pub fn reconcile(&self, temporary: &EntryId, server: Message) -> bool {
        let mut state = self.lock();
        let server_cached = state.contains(&server.id);
        for page in state.pages.iter_mut() {
            if let Some(index) = page.entries.iter().position(|m| m.id == *temporary) {
                if server_cached {
                    page.entries.remove(index);
                } else {
                    page.entries[index] = server;
                }
                return true;
            }
        }
        false
    }

    /// Removes every entry with `id` from all pages. Returns `true` if anything was removed.
    pub fn remove(&self, id: &EntryId) -> bool {
        let mut state = self.lock();
        let mut removed = false;
        for page in state.pages.iter_mut() {
            let before = page.entries.len();
            page.entries.retain(|message| message.id != *id);
            removed |= page.entries.len() != before;
        }
        removed
    }

    /// All loaded messages in display order, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        let state = self.lock();
        state
            .pages
            .iter()
            .rev()
            .flat_map(|page| page.entries.iter().rev())
            .cloned()
            .collect()
    }

    /// A copy of the loaded pages, newest first.
    pub fn pages(&self) -> Vec<Page> {
        self.lock().pages.clone()
    }

    /// Speculative entries currently cached.
    pub fn speculative(&self) -> Vec<Message> {
        self.lock()
            .entries()
            .filter(|message| message.is_speculative())
            .cloned()
            .collect()
    }

    /// Looks up an entry by id.
    pub fn get(&self, id: &EntryId) -> Option<Message> {
        self.lock().entries().find(|message| message.id == *id).cloned()
    }

    /// Whether an entry with `id` is cached.
    pub fn contains(&self, id: &EntryId) -> bool {
        self.lock().contains(id)
    }

    /// Number of cached entries, speculative ones included.
    pub fn len(&self) -> usize {
        self.lock().entries().count()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether older history may still be available.
    pub fn has_more(&self) -> bool {
        self.lock().has_more
    }

    /// The timestamp of the oldest loaded server message.
    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.lock().oldest_timestamp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_stream::Identity;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct FixedHistory {
        messages: Mutex<Vec<Message>>,
        calls: AtomicU32,
        latency: Duration,
    }

    impl FixedHistory {
        fn new(messages: Vec<Message>) -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(messages),
                calls: AtomicU32::new(0),
                latency: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl PageFetcher for FixedHistory {
        async fn fetch_page(
            &self,
            _scope: &Scope,
            cursor: Option<DateTime<Utc>>,
            limit: u32,
        ) -> Result<Vec<Message>, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut page: Vec<Message> = self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| cursor.is_none_or(|c| m.created_at < c))
                .cloned()
                .collect();
            page.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            page.truncate(limit as usize);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            Ok(page)
        }
    }

    fn history(count: usize) -> Vec<Message> {
        let start = Utc::now() - chrono::Duration::hours(1);
        (0..count)
            .map(|i| server_message(&format!("m{}", i), start + chrono::Duration::seconds(i as i64)))
            .collect()
    }

    fn server_message(content: &str, at: DateTime<Utc>) -> Message {
        Message {
            id: EntryId::Server(Uuid::new_v4()),
            room_id: "lobby".to_string(),
            sender_id: Uuid::new_v4(),
            sender_name: "bob".to_string(),
            content: content.to_string(),
            created_at: at,
        }
    }

    fn contents(store: &PagedStore) -> Vec<String> {
        store.messages().into_iter().map(|m| m.content).collect()
    }

    fn store_with(fetcher: Arc<FixedHistory>, page_size: u32) -> PagedStore {
        PagedStore::new(
            Scope::chat_room("lobby"),
            fetcher,
            page_size,
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn initial_load_then_older_pages_in_display_order() {
        let store = store_with(FixedHistory::new(history(5)), 2);

        assert_eq!(store.load_initial().await.unwrap(), LoadOutcome::Loaded(2));
        assert_eq!(contents(&store), vec!["m3", "m4"]);

        assert_eq!(store.load_older().await.unwrap(), LoadOutcome::Loaded(2));
        assert_eq!(store.load_older().await.unwrap(), LoadOutcome::Loaded(1));
        assert_eq!(contents(&store), vec!["m0", "m1", "m2", "m3", "m4"]);
        assert_eq!(store.pages().len(), 3);

        assert!(!store.has_more());
        assert_eq!(store.load_older().await.unwrap(), LoadOutcome::Exhausted);
    }

    #[tokio::test]
    async fn prepend_keeps_arrival_order_after_existing_content() {
        let store = store_with(FixedHistory::new(history(2)), 10);
        store.load_initial().await.unwrap();

        let now = Utc::now();
        let batch = vec![server_message("a", now), server_message("b", now), server_message("c", now)];
        let summary = store.prepend_newest(batch);

        assert_eq!(summary.inserted, 3);
        assert_eq!(contents(&store), vec!["m0", "m1", "a", "b", "c"]);
        assert_eq!(store.pages()[0].entries[0].content, "c");
    }

    #[tokio::test]
    async fn replayed_inserts_are_dropped() {
        let store = store_with(FixedHistory::new(vec![]), 10);
        let message = server_message("once", Utc::now());

        store.prepend_newest(vec![message.clone()]);
        let summary = store.prepend_newest(vec![message.clone(), message]);

        assert_eq!(summary.duplicates, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn echo_replaces_speculative_entry_in_place() {
        let store = store_with(FixedHistory::new(vec![]), 10);
        let identity = Identity::new(Uuid::new_v4(), "ada");
        let speculative = Message::speculative("lobby", &identity, "hello");
        store.prepend_speculative(speculative.clone());

        let echo = Message {
            id: EntryId::Server(Uuid::new_v4()),
            ..speculative.clone()
        };
        let summary = store.prepend_newest(vec![echo.clone()]);

        assert_eq!(summary.reconciled, 1);
        assert_eq!(store.len(), 1);
        assert!(store.contains(&echo.id));
        assert!(!store.contains(&speculative.id));
    }

    #[tokio::test]
    async fn remove_is_idempotent_across_pages() {
        let store = store_with(FixedHistory::new(history(3)), 1);
        store.load_initial().await.unwrap();
        store.load_older().await.unwrap();
        let target = store.messages()[0].id;

        assert!(store.remove(&target));
        assert!(!store.remove(&target));
        assert!(!store.contains(&target));
    }

    #[tokio::test]
    async fn reconcile_replaces_or_drops_speculative_entry() {
        let store = store_with(FixedHistory::new(vec![]), 10);
        let identity = Identity::new(Uuid::new_v4(), "ada");
        let first = Message::speculative("lobby", &identity, "one");
        let second = Message::speculative("lobby", &identity, "two");
        store.prepend_speculative(first.clone());
        store.prepend_speculative(second.clone());

        let server_first = Message {
            id: EntryId::Server(Uuid::new_v4()),
            ..first.clone()
        };
        assert!(store.reconcile(&first.id, server_first.clone()));
        assert!(!store.reconcile(&first.id, server_first.clone()));

        // The server copy is already cached, so the second entry is only removed.
        assert!(store.reconcile(&second.id, server_first));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn refetch_keeps_unmatched_speculative_entries() {
        let fetcher = FixedHistory::new(history(3));
        let store = store_with(fetcher.clone(), 10);
        store.load_initial().await.unwrap();

        let identity = Identity::new(Uuid::new_v4(), "ada");
        let pending = Message::speculative("lobby", &identity, "pending");
        let confirmed = Message::speculative("lobby", &identity, "confirmed");
        store.prepend_speculative(confirmed.clone());
        store.prepend_speculative(pending.clone());

        fetcher.messages.lock().unwrap().push(Message {
            id: EntryId::Server(Uuid::new_v4()),
            ..confirmed.clone()
        });

        store.refetch_loaded().await.unwrap();

        assert!(store.contains(&pending.id));
        assert!(!store.contains(&confirmed.id));
        assert_eq!(store.len(), 5);
        assert_eq!(store.speculative().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inserts_during_a_refetch_survive_it() {
        let fetcher = Arc::new(FixedHistory {
            messages: Mutex::new(history(3)),
            calls: AtomicU32::new(0),
            latency: Duration::from_millis(50),
        });
        let store = store_with(fetcher.clone(), 10);
        store.load_initial().await.unwrap();

        let refetch = tokio::spawn({
            let store = store.clone();
            async move { store.refetch_loaded().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fresh = server_message("fresh", Utc::now());
        fetcher.messages.lock().unwrap().push(fresh.clone());
        assert_eq!(store.prepend_newest(vec![fresh.clone()]).inserted, 1);

        assert_eq!(refetch.await.unwrap().unwrap(), LoadOutcome::Loaded(3));
        assert!(store.contains(&fresh.id));
        assert_eq!(contents(&store), vec!["m0", "m1", "m2", "fresh"]);

        store.refetch_loaded().await.unwrap();
        assert_eq!(contents(&store), vec!["m0", "m1", "m2", "fresh"]);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_of_the_same_cursor_are_suppressed() {
        let fetcher = Arc::new(FixedHistory {
            messages: Mutex::new(history(4)),
            calls: AtomicU32::new(0),
            latency: Duration::from_millis(50),
        });
        let store = store_with(fetcher.clone(), 2);
        store.load_initial().await.unwrap();

        let (first, second) = tokio::join!(store.load_older(), store.load_older());

        assert_eq!(first.unwrap(), LoadOutcome::Loaded(2));
        assert_eq!(second.unwrap(), LoadOutcome::InFlight);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn cursor_is_the_oldest_server_timestamp() {
        let messages = history(3);
        let oldest = messages[0].created_at;
        let store = store_with(FixedHistory::new(messages), 10);
        assert_eq!(store.cursor(), None);

        store.load_initial().await.unwrap();
        let identity = Identity::new(Uuid::new_v4(), "ada");
        store.prepend_speculative(Message::speculative("lobby", &identity, "x"));

        assert_eq!(store.cursor(), Some(oldest));
    }
}
