//! Optimistic sends: show the write immediately, roll it back if it fails.

use crate::change_stream::{ChangeStreamClient, Identity};
use crate::config::RetryPolicy;
use crate::error::RealtimeError;
use crate::paged::PagedStore;
use crate::record::{EntryId, Message, Record};
use crate::retry::send_with_retry;
use crate::scope::Scope;
use log::{debug, error};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct CoordinatorInner {
    scope: Scope,
    store: PagedStore,
    client: Arc<dyn ChangeStreamClient>,
    policy: RetryPolicy,
    identity: Identity,
    in_flight: Mutex<HashSet<EntryId>>,
}

impl CoordinatorInner {
    fn in_flight(&self) -> MutexGuard<'_, HashSet<EntryId>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rollback(&self, id: &EntryId) -> bool {
        self.in_flight().remove(id);
        let removed = self.store.remove(id);
        if removed {
            debug!("Rolled back speculative entry {} in '{}'", id, self.scope);
        }
        removed
    }
}

/// Rolls a speculative entry back unless the send that created it settles.
///
/// Covers sends whose future is dropped before completing.
struct PendingSend<'a> {
    inner: &'a CoordinatorInner,
    id: EntryId,
    settled: bool,
}

impl PendingSend<'_> {
    fn settle(mut self) {
        self.settled = true;
        self.inner.in_flight().remove(&self.id);
    }
}

impl Drop for PendingSend<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.inner.rollback(&self.id);
        }
    }
}

/// Performs optimistic message sends for one chat channel.
///
/// A send first prepends a speculative entry with a temporary id to the newest page, then
/// persists the message. If persisting fails after the policy's retries, the speculative
/// entry is removed again and the [`RealtimeError::SendFailure`] is returned to the caller.
/// A successful send leaves the speculative entry in place until the server echo replaces it.
#[derive(Clone)]
pub struct MutationCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for MutationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("scope", &self.inner.scope)
            .field("identity", &self.inner.identity)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

impl MutationCoordinator {
    /// Creates a coordinator that sends as `identity` into `store`'s channel.
    pub fn new(
        store: PagedStore,
        client: Arc<dyn ChangeStreamClient>,
        identity: Identity,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                scope: store.scope().clone(),
                store,
                client,
                policy,
                identity,
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Sends a chat message optimistically.
    ///
    /// Returns the speculative entry on success. On failure the entry has already been
    /// removed from the store when the error is returned.
    pub async fn send(&self, content: impl Into<String>) -> Result<Message, RealtimeError> {
        let inner = &self.inner;
        let speculative = Message::speculative(inner.scope.id.clone(), &inner.identity, content);
        let id = speculative.id;

        inner.in_flight().insert(id);
        inner.store.prepend_speculative(speculative.clone());
        let pending = PendingSend {
            inner,
            id,
            settled: false,
        };
        debug!("Sending speculative entry {} to '{}'", id, inner.scope);

        let record = Record::Message(speculative.clone());
        match send_with_retry(inner.client.as_ref(), &inner.scope, &record, &inner.policy).await {
            Ok(()) => {
                pending.settle();
                Ok(speculative)
            }
            Err(e) => {
                drop(pending);
                error!("Send of {} to '{}' failed, rolled back: {}", id, inner.scope, e);
                Err(e)
            }
        }
    }

    /// Removes a speculative entry. Rolling back twice is the same as rolling back once.
    pub fn rollback(&self, id: &EntryId) -> bool {
        self.inner.rollback(id)
    }

    /// Temporary ids of sends that have not settled yet.
    pub fn in_flight(&self) -> Vec<EntryId> {
        self.inner.in_flight().iter().copied().collect()
    }

    /// The identity messages are sent as.
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }
}
