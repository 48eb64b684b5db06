use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use syncline_core::prelude::*;

#[derive(Debug, Default)]
struct PageData {
    messages: HashMap<Scope, Vec<Message>>,
    fetches: u32,
    failures: u32,
    latency: Duration,
}

/// Errors returned by the [`InMemoryPageStore`].
#[derive(Debug, thiserror::Error)]
pub enum InMemoryPageStoreError {
    /// A failure scripted with [`InMemoryPageStore::fail_next_fetches`].
    #[error("scripted fetch failure")]
    Scripted,
}

/// An in-memory message history, served newest first by cursor.
#[derive(Clone, Debug, Default)]
pub struct InMemoryPageStore(Arc<Mutex<PageData>>);

impl InMemoryPageStore {
    /// Creates an empty history.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryPageStore");
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, PageData> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persists a message of `scope`.
    pub fn insert(&self, scope: &Scope, message: Message) {
        self.data().messages.entry(scope.clone()).or_default().push(message);
    }

    /// Persists many messages of `scope`.
    pub fn extend(&self, scope: &Scope, messages: impl IntoIterator<Item = Message>) {
        self.data()
            .messages
            .entry(scope.clone())
            .or_default()
            .extend(messages);
    }

    /// Replaces the persisted message with the same id. Returns `false` if there is none.
    pub fn update(&self, scope: &Scope, message: Message) -> bool {
        let mut data = self.data();
        let Some(slot) = data
            .messages
            .get_mut(scope)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == message.id))
        else {
            return false;
        };
        *slot = message;
        true
    }

    /// Deletes the persisted message `id`. Returns `false` if there is none.
    pub fn remove(&self, scope: &Scope, id: &EntryId) -> bool {
        let mut data = self.data();
        let Some(messages) = data.messages.get_mut(scope) else {
            return false;
        };
        let before = messages.len();
        messages.retain(|m| m.id != *id);
        messages.len() != before
    }

    /// Every persisted message of `scope`, in insertion order.
    pub fn messages(&self, scope: &Scope) -> Vec<Message> {
        self.data().messages.get(scope).cloned().unwrap_or_default()
    }

    /// Number of pages fetched so far.
    pub fn fetch_count(&self) -> u32 {
        self.data().fetches
    }

    /// Delays every fetch by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.data().latency = latency;
    }

    /// Makes the next `count` fetches fail.
    pub fn fail_next_fetches(&self, count: u32) {
        self.data().failures = count;
    }
}

#[async_trait]
impl PageFetcher for InMemoryPageStore {
    async fn fetch_page(
        &self,
        scope: &Scope,
        cursor: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>, BoxError> {
        let latency = {
            let mut data = self.data();
            data.fetches += 1;
            data.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut data = self.data();
        if data.failures > 0 {
            data.failures -= 1;
            return Err(Box::new(InMemoryPageStoreError::Scripted));
        }
        let mut page: Vec<Message> = data
            .messages
            .get(scope)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|message| cursor.is_none_or(|cursor| message.created_at < cursor))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        page.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        page.truncate(limit as usize);
        log::debug!(
            "InMemoryPageStore: fetched {} messages of '{}' before {:?}",
            page.len(),
            scope,
            cursor
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn message(at: DateTime<Utc>, content: &str) -> Message {
        Message {
            id: EntryId::Server(Uuid::new_v4()),
            room_id: "lobby".to_string(),
            sender_id: Uuid::new_v4(),
            sender_name: "bob".to_string(),
            content: content.to_string(),
            created_at: at,
        }
    }

    #[tokio::test]
    async fn in_memory_page_store_fetches_strictly_older_pages() {
        let scope = Scope::chat_room("lobby");
        let store = InMemoryPageStore::new();
        let start = Utc::now();
        store.extend(
            &scope,
            (0..5).map(|i| message(start + chrono::Duration::seconds(i), &format!("m{}", i))),
        );

        let newest = store.fetch_page(&scope, None, 2).await.unwrap();
        assert_eq!(
            newest.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m4", "m3"]
        );

        let older = store
            .fetch_page(&scope, Some(newest[1].created_at), 10)
            .await
            .unwrap();
        assert_eq!(
            older.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
            vec!["m2", "m1", "m0"]
        );
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test]
    async fn in_memory_page_store_scripted_failures() {
        let scope = Scope::chat_room("lobby");
        let store = InMemoryPageStore::new();
        store.fail_next_fetches(1);

        assert!(store.fetch_page(&scope, None, 10).await.is_err());
        assert!(store.fetch_page(&scope, None, 10).await.unwrap().is_empty());
    }
}
