//! The reactive query cache seam.

use crate::record::Record;
use crate::scope::Scope;
use async_trait::async_trait;
use uuid::Uuid;

/// Keys of the reactive query cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Message history of a chat room.
    Messages(Scope),
    /// Participants of a chat room.
    Participants(Scope),
    /// A user's check-ins for today.
    CheckInsToday {
        /// The user.
        user_id: Uuid,
    },
    /// A user's streak aggregates, derived from their check-ins.
    Streaks {
        /// The user.
        user_id: Uuid,
    },
}

/// Computes a new cache value from the current one.
pub type CacheUpdater = Box<dyn FnOnce(Option<Vec<Record>>) -> Vec<Record> + Send>;

/// The substrate that views read from.
///
/// Only the event buffer, the invalidator and the mutation coordinator write into it.
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Reads the current value of `key`.
    async fn read(&self, key: &CacheKey) -> Option<Vec<Record>>;

    /// Replaces the value of `key` with the result of `updater`.
    async fn write(&self, key: &CacheKey, updater: CacheUpdater);

    /// Marks `key` stale so that its next read refetches it.
    async fn invalidate(&self, key: &CacheKey);
}
