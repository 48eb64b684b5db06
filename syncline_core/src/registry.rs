//! Shared per-scope state with reference counting.
//!
//! Two views mounted on the same chat room share one [`PagedStore`]. The registry creates the
//! store for the first consumer and forgets it when the last one releases its lease.

use crate::paged::PagedStore;
use crate::scope::Scope;
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct RegistryEntry {
    store: PagedStore,
    consumers: usize,
}

/// Registry of the per-scope state shared by every consumer of a channel.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    entries: Mutex<HashMap<Scope, RegistryEntry>>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Scope, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a lease on the state of `scope`, creating it with `create` if this is the first
    /// consumer.
    pub fn acquire(self: &Arc<Self>, scope: &Scope, create: impl FnOnce() -> PagedStore) -> RegistryLease {
        let mut entries = self.entries();
        let entry = entries.entry(scope.clone()).or_insert_with(|| {
            debug!("Registering shared state for '{}'", scope);
            RegistryEntry {
                store: create(),
                consumers: 0,
            }
        });
        entry.consumers += 1;
        RegistryLease {
            registry: self.clone(),
            scope: scope.clone(),
            store: entry.store.clone(),
            released: false,
        }
    }

    fn release(&self, scope: &Scope) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(scope) else {
            return;
        };
        entry.consumers = entry.consumers.saturating_sub(1);
        if entry.consumers == 0 {
            entries.remove(scope);
            debug!("Dropped shared state for '{}'", scope);
        }
    }

    /// Number of scopes with at least one consumer.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no scope has a consumer.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Whether `scope` has at least one consumer.
    pub fn contains(&self, scope: &Scope) -> bool {
        self.entries().contains_key(scope)
    }

    /// Number of consumers holding a lease on `scope`.
    pub fn consumers(&self, scope: &Scope) -> usize {
        self.entries().get(scope).map_or(0, |entry| entry.consumers)
    }
}

/// A consumer's hold on the shared state of one scope. Released on drop.
#[derive(Debug)]
pub struct RegistryLease {
    registry: Arc<ChannelRegistry>,
    scope: Scope,
    store: PagedStore,
    released: bool,
}

impl RegistryLease {
    /// The shared store of the scope.
    pub fn store(&self) -> &PagedStore {
        &self.store
    }

    /// The leased scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Gives the lease back. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if !std::mem::replace(&mut self.released, true) {
            self.registry.release(&self.scope);
        }
    }
}

impl Drop for RegistryLease {
    fn drop(&mut self) {
        self.release();
    }
}
