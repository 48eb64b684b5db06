#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use syncline_core::prelude::*;
use syncline_mem::*;
use tokio::sync::watch;
use uuid::Uuid;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn identity(name: &str) -> Identity {
    Identity::new(Uuid::new_v4(), name)
}

pub fn server_message(room: &str, sender: &Identity, content: &str, at: DateTime<Utc>) -> Message {
    Message {
        id: EntryId::Server(Uuid::new_v4()),
        room_id: room.to_string(),
        sender_id: sender.user_id,
        sender_name: sender.display_name.clone(),
        content: content.to_string(),
        created_at: at,
    }
}

/// `count` messages one second apart, ending an hour ago.
pub fn history(room: &str, count: usize) -> Vec<Message> {
    let bob = identity("bob");
    let start = Utc::now() - chrono::Duration::hours(1);
    (0..count)
        .map(|i| server_message(room, &bob, &format!("m{}", i), start + chrono::Duration::seconds(i as i64)))
        .collect()
}

pub struct Harness {
    pub stream: InMemoryChangeStream,
    pub session: InMemorySessionProvider,
    pub pages: InMemoryPageStore,
    pub cache: InMemoryQueryCache,
    pub ctx: SyncContext,
}

impl Harness {
    pub fn new(user: &Identity, config: RealtimeConfig) -> Self {
        init_logger();
        let stream = InMemoryChangeStream::new();
        let session = InMemorySessionProvider::signed_in(user.user_id);
        let pages = InMemoryPageStore::new();
        let cache = InMemoryQueryCache::new();
        let ctx = SyncContext::new(
            Arc::new(stream.clone()),
            Arc::new(session.clone()),
            Arc::new(pages.clone()),
            Arc::new(cache.clone()),
            config,
        );
        Self {
            stream,
            session,
            pages,
            cache,
            ctx,
        }
    }

    pub fn manager(&self) -> ConnectionManager {
        ConnectionManager::new(
            self.ctx.client.clone(),
            self.ctx.session.clone(),
            self.ctx.config.clone(),
        )
    }
}

pub async fn wait_for_state(receiver: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(120), receiver.wait_for(|current| *current == state))
        .await
        .expect("state not reached in time")
        .expect("channel state dropped");
}
