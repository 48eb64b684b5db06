//! # Syncline memory backends
//!
//! In-memory implementations of every collaborator the synchronization layer consumes,
//! primarily for testing and local development:
//!
//! - [`InMemoryChangeStream`] opens channels, delivers change events and broadcasts, and can
//!   be scripted to fail joins, drop connections, reject or fail sends, and echo messages.
//! - [`InMemoryQueryCache`] stores cache values and counts invalidations.
//! - [`InMemoryPageStore`] serves message history pages by cursor.
//! - [`InMemorySessionProvider`] hands out a credential, optionally only after a few checks.
//!
//! ```ignore
//! use std::sync::Arc;
//! use syncline_core::prelude::*;
//! use syncline_mem::*;
//!
//! let history = InMemoryPageStore::new();
//! let stream = InMemoryChangeStream::new();
//! stream.enable_echo(Some(history.clone()));
//!
//! let ctx = SyncContext::new(
//!     Arc::new(stream.clone()),
//!     Arc::new(InMemorySessionProvider::signed_in(user_id)),
//!     Arc::new(history),
//!     Arc::new(InMemoryQueryCache::new()),
//!     RealtimeConfig::default(),
//! );
//! let room = ChatRoomSync::mount(&ctx, "lobby", identity).await?;
//! room.send_message("hello").await?;
//! ```

#![deny(missing_docs)]

mod change_stream;
mod page_store;
mod query_cache;
mod session;

pub use change_stream::*;
pub use page_store::*;
pub use query_cache::*;
pub use session::*;
