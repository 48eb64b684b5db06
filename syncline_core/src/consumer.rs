//! Consumer façades wiring the components together for one mounted view.
//!
//! Unmounting always runs in the same order: pending timers are cancelled (the event buffer
//! flushes what it holds), a final "stop typing" goes out if needed, the channel is left, and
//! only then are observers and shared state dropped.

use crate::buffer::EventBuffer;
use crate::change_stream::{ChangeStreamClient, Identity};
use crate::config::RealtimeConfig;
use crate::connection::{ChannelSnapshot, ConnectionManager, ConnectionState, ListenerId};
use crate::error::RealtimeError;
use crate::invalidator::DebouncedInvalidator;
use crate::mutation::MutationCoordinator;
use crate::paged::{LoadOutcome, PageFetcher, PagedStore};
use crate::query_cache::{CacheKey, QueryCache};
use crate::record::Message;
use crate::registry::{ChannelRegistry, RegistryLease};
use crate::scope::Scope;
use crate::session::SessionProvider;
use crate::signal::{RemoteSignals, SignalTracker};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use uuid::Uuid;

/// Everything a consumer needs to mount.
#[derive(Clone)]
pub struct SyncContext {
    /// The change-stream client.
    pub client: Arc<dyn ChangeStreamClient>,
    /// Session lookup, consulted before every subscribe.
    pub session: Arc<dyn SessionProvider>,
    /// History pages of chat rooms.
    pub fetcher: Arc<dyn PageFetcher>,
    /// The reactive query cache.
    pub cache: Arc<dyn QueryCache>,
    /// Per-scope state shared between consumers.
    pub registry: Arc<ChannelRegistry>,
    /// Timings and retry policies.
    pub config: RealtimeConfig,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl SyncContext {
    /// Creates a context with an empty registry.
    pub fn new(
        client: Arc<dyn ChangeStreamClient>,
        session: Arc<dyn SessionProvider>,
        fetcher: Arc<dyn PageFetcher>,
        cache: Arc<dyn QueryCache>,
        config: RealtimeConfig,
    ) -> Self {
        Self {
            client,
            session,
            fetcher,
            cache,
            registry: Arc::new(ChannelRegistry::new()),
            config,
        }
    }

    fn manager(&self) -> ConnectionManager {
        ConnectionManager::new(self.client.clone(), self.session.clone(), self.config.clone())
    }
}

/// A mounted chat room: message history, optimistic sends, typing and presence.
pub struct ChatRoomSync {
    scope: Scope,
    identity: Identity,
    manager: ConnectionManager,
    store: PagedStore,
    buffer: EventBuffer,
    signals: Arc<RemoteSignals>,
    coordinator: MutationCoordinator,
    typing: SignalTracker,
    listeners: Vec<ListenerId>,
    lease: Mutex<Option<RegistryLease>>,
    unmounted: AtomicBool,
}

impl std::fmt::Debug for ChatRoomSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRoomSync")
            .field("scope", &self.scope)
            .field("identity", &self.identity)
            .field("unmounted", &self.unmounted.load(Ordering::SeqCst))
            .finish()
    }
}

impl ChatRoomSync {
    /// Mounts the chat room `room_id` as `identity`.
    ///
    /// Loads the newest page unless another consumer of the room already did, attaches the
    /// observers and starts joining. Returns before the subscription is confirmed; use
    /// [`watch_state`](Self::watch_state) to follow it.
    pub async fn mount(
        ctx: &SyncContext,
        room_id: impl Into<String>,
        identity: Identity,
    ) -> Result<Self, RealtimeError> {
        let scope = Scope::chat_room(room_id);
        let lease = ctx.registry.acquire(&scope, || {
            PagedStore::new(
                scope.clone(),
                ctx.fetcher.clone(),
                ctx.config.page_size,
                ctx.config.echo_match_window,
            )
        });
        let store = lease.store().clone();
        if store.is_empty() {
            store.load_initial().await?;
        }

        let manager = ctx.manager();
        let buffer = EventBuffer::new(store.clone(), ctx.cache.clone(), ctx.config.flush_window);
        let signals = Arc::new(RemoteSignals::new(identity.user_id, ctx.config.signal.remote_expiry));
        let listeners = vec![
            manager.on(&scope, Arc::new(buffer.clone())).await,
            manager.on(&scope, signals.clone()).await,
        ];
        manager.join(scope.clone(), identity.clone()).await;

        let coordinator = MutationCoordinator::new(
            store.clone(),
            ctx.client.clone(),
            identity.clone(),
            ctx.config.send_retry.clone(),
        );
        let typing = SignalTracker::new(
            scope.clone(),
            identity.user_id,
            ctx.client.clone(),
            ctx.config.signal.clone(),
        );
        info!("Mounted chat room '{}' as {}", scope, identity.display_name);

        Ok(Self {
            scope,
            identity,
            manager,
            store,
            buffer,
            signals,
            coordinator,
            typing,
            listeners,
            lease: Mutex::new(Some(lease)),
            unmounted: AtomicBool::new(false),
        })
    }

    fn ensure_mounted(&self) -> Result<(), RealtimeError> {
        if self.unmounted.load(Ordering::SeqCst) {
            return Err(RealtimeError::NotJoined(self.scope.to_string()));
        }
        Ok(())
    }

    /// Sends a message optimistically. See [`MutationCoordinator::send`].
    pub async fn send_message(&self, content: impl Into<String>) -> Result<Message, RealtimeError> {
        self.ensure_mounted()?;
        self.coordinator.send(content).await
    }

    /// Records a keystroke of the local user.
    pub async fn typing(&self) {
        if self.ensure_mounted().is_ok() {
            self.typing.start_signaling().await;
        }
    }

    /// Stops the local typing indicator right away.
    pub async fn stop_typing(&self) -> bool {
        self.typing.stop_signaling().await
    }

    /// Loaded messages, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.store.messages()
    }

    /// Loads one page of older history.
    pub async fn load_older(&self) -> Result<LoadOutcome, RealtimeError> {
        self.store.load_older().await
    }

    /// Remote users currently typing.
    pub fn typing_users(&self) -> Vec<Uuid> {
        self.signals.typing_users()
    }

    /// Users present in the room.
    pub fn online_users(&self) -> Vec<Uuid> {
        self.signals.online_users()
    }

    /// The channel state.
    pub async fn state(&self) -> ConnectionState {
        self.manager.state(&self.scope).await
    }

    /// Watches the channel state.
    pub async fn watch_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.manager.watch_state(&self.scope).await
    }

    /// The channel state with its failure bookkeeping.
    pub async fn snapshot(&self) -> ChannelSnapshot {
        self.manager.snapshot(&self.scope).await
    }

    /// Retries a channel that exhausted its retries.
    pub async fn retry(&self) -> Result<(), RealtimeError> {
        self.ensure_mounted()?;
        self.manager.retry(&self.scope).await
    }

    /// The shared message store of the room.
    pub fn store(&self) -> &PagedStore {
        &self.store
    }

    /// The optimistic send coordinator.
    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    /// The room's scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Tears the room down. Unmounting twice is a no-op.
    pub async fn unmount(&self) {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.buffer.close();
        self.typing.cancel_pending();

        self.typing.close().await;

        self.manager.leave(&self.scope).await;

        for listener in &self.listeners {
            self.manager.off(&self.scope, *listener).await;
        }
        if let Some(mut lease) = self.lease.lock().unwrap_or_else(PoisonError::into_inner).take() {
            lease.release();
        }
        info!("Unmounted chat room '{}'", self.scope);
    }
}

impl Drop for ChatRoomSync {
    fn drop(&mut self) {
        if !self.unmounted.load(Ordering::SeqCst) {
            self.buffer.close();
            self.typing.cancel_pending();
        }
    }
}

/// A mounted check-in view: today's check-ins and streaks of one user.
pub struct CheckInSync {
    scope: Scope,
    manager: ConnectionManager,
    invalidator: DebouncedInvalidator,
    listener: ListenerId,
    unmounted: AtomicBool,
}

impl std::fmt::Debug for CheckInSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckInSync")
            .field("scope", &self.scope)
            .field("invalidator", &self.invalidator)
            .finish()
    }
}

impl CheckInSync {
    /// Mounts the check-in view of `identity`.
    pub async fn mount(ctx: &SyncContext, identity: Identity) -> Self {
        let user_id = identity.user_id;
        let scope = Scope::user_check_ins(user_id);
        let invalidator = DebouncedInvalidator::new(
            ctx.cache.clone(),
            vec![CacheKey::CheckInsToday { user_id }, CacheKey::Streaks { user_id }],
            ctx.config.invalidation_window,
        );

        let manager = ctx.manager();
        let listener = manager.on(&scope, Arc::new(invalidator.clone())).await;
        manager.join(scope.clone(), identity).await;
        info!("Mounted check-ins '{}'", scope);

        Self {
            scope,
            manager,
            invalidator,
            listener,
            unmounted: AtomicBool::new(false),
        }
    }

    /// The channel state.
    pub async fn state(&self) -> ConnectionState {
        self.manager.state(&self.scope).await
    }

    /// Watches the channel state.
    pub async fn watch_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.manager.watch_state(&self.scope).await
    }

    /// The channel state with its failure bookkeeping.
    pub async fn snapshot(&self) -> ChannelSnapshot {
        self.manager.snapshot(&self.scope).await
    }

    /// Retries a channel that exhausted its retries.
    pub async fn retry(&self) -> Result<(), RealtimeError> {
        if self.unmounted.load(Ordering::SeqCst) {
            return Err(RealtimeError::NotJoined(self.scope.to_string()));
        }
        self.manager.retry(&self.scope).await
    }

    /// The invalidator refreshing today's check-ins and streaks.
    pub fn invalidator(&self) -> &DebouncedInvalidator {
        &self.invalidator
    }

    /// The view's scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Tears the view down. Unmounting twice is a no-op.
    pub async fn unmount(&self) {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.invalidator.close();
        self.manager.leave(&self.scope).await;
        self.manager.off(&self.scope, self.listener).await;
        info!("Unmounted check-ins '{}'", self.scope);
    }
}

impl Drop for CheckInSync {
    fn drop(&mut self) {
        if !self.unmounted.load(Ordering::SeqCst) {
            self.invalidator.close();
        }
    }
}
