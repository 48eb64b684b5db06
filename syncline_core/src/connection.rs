//! The connection manager: one subscription state machine per channel scope.
//!
//! Each joined scope is driven by a spawned task that walks the channel through
//! `AuthPending → Connecting → Subscribed`, retrying authentication and transport failures
//! with the configured backoff until the retry budget is spent. Retry sleeps race a shutdown
//! signal so that [`ConnectionManager::leave`] cancels them before the channel is removed.
//!
//! Events delivered on a joined channel are dispatched to the [`ChannelObserver`]s attached
//! with [`ConnectionManager::on`].

use crate::change_stream::{ChangeStreamClient, Identity, JoinedChannel};
use crate::config::{ExhaustionInfo, RealtimeConfig};
use crate::error::{ChannelFault, RealtimeError};
use crate::event::{ChangeEvent, ChannelMessage, ChannelStatus, EphemeralSignal};
use crate::scope::Scope;
use crate::session::SessionProvider;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use uuid::Uuid;

/// Lifecycle state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not joined, or left.
    Disconnected,
    /// Waiting for a valid session before subscribing.
    AuthPending,
    /// The channel is being opened.
    Connecting,
    /// The subscription is confirmed and events are flowing.
    Subscribed,
    /// The channel failed and a reconnect is scheduled.
    Erroring,
    /// Retries are spent. Nothing happens until a manual retry.
    Exhausted,
}

impl ConnectionState {
    /// Whether the channel is recovering from a failure. Views show this as "reconnecting…".
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, ConnectionState::Erroring)
    }

    /// Whether the channel gave up.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Exhausted)
    }
}

/// A state change of one channel, published on [`ConnectionManager::transitions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    /// The channel.
    pub scope: Scope,
    /// The previous state.
    pub from: ConnectionState,
    /// The new state.
    pub to: ConnectionState,
}

/// Point-in-time view of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    /// The channel.
    pub scope: Scope,
    /// Its current state.
    pub state: ConnectionState,
    /// Consecutive failures since the last successful subscribe.
    pub retry_count: u32,
    /// The most recent failure, cleared on subscribe.
    pub last_error: Option<RealtimeError>,
}

/// Identifies an observer attached with [`ConnectionManager::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Receives what a joined channel delivers.
///
/// Every method has an empty default, so observers only implement what they care about.
#[async_trait]
pub trait ChannelObserver: Send + Sync {
    /// A record of the channel changed.
    async fn on_change(&self, _event: &ChangeEvent) {}

    /// Another participant broadcast an ephemeral signal.
    async fn on_signal(&self, _signal: &EphemeralSignal) {}

    /// The channel subscribed again after a failure. Events may have been missed meanwhile.
    async fn on_resubscribed(&self, _scope: &Scope) {}
}

type ObserverList = Vec<(ListenerId, Arc<dyn ChannelObserver>)>;

#[derive(Debug, Default)]
struct ChannelMeta {
    retry_count: u32,
    last_error: Option<RealtimeError>,
}

/// State shared between the manager and a channel's driver task.
struct ChannelShared {
    scope: Scope,
    observers: RwLock<ObserverList>,
    status: watch::Sender<ConnectionState>,
    meta: Mutex<ChannelMeta>,
}

impl ChannelShared {
    fn new(scope: Scope) -> Self {
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            scope,
            observers: RwLock::new(Vec::new()),
            status,
            meta: Mutex::new(ChannelMeta::default()),
        }
    }

    fn meta(&self) -> std::sync::MutexGuard<'_, ChannelMeta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn observers(&self) -> Vec<Arc<dyn ChannelObserver>> {
        self.observers
            .read()
            .await
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect()
    }
}

struct Driver {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Driver {
    async fn stop(self, scope: &Scope) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            error!("Driver of channel '{}' panicked: {}", scope, e);
        }
    }
}

struct ChannelEntry {
    shared: Arc<ChannelShared>,
    identity: Option<Identity>,
    driver: Option<Driver>,
}

struct ManagerInner {
    client: Arc<dyn ChangeStreamClient>,
    session: Arc<dyn SessionProvider>,
    config: RealtimeConfig,
    channels: AsyncMutex<HashMap<Scope, ChannelEntry>>,
    transitions: broadcast::Sender<StateTransition>,
}

/// Owns the subscription lifecycle of every channel scope.
///
/// Cloning is cheap; clones share all channels.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl ConnectionManager {
    /// Creates a manager without any channel.
    pub fn new(
        client: Arc<dyn ChangeStreamClient>,
        session: Arc<dyn SessionProvider>,
        config: RealtimeConfig,
    ) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                client,
                session,
                config,
                channels: AsyncMutex::new(HashMap::new()),
                transitions,
            }),
        }
    }

    /// Joins `scope` as `identity`.
    ///
    /// Returns immediately; the subscription proceeds in the background. Joining a scope that
    /// is already joined tears the previous subscription down first, so at most one channel
    /// per scope is ever open. Observers attached to the scope are kept.
    pub async fn join(&self, scope: Scope, identity: Identity) {
        let previous = {
            let mut channels = self.inner.channels.lock().await;
            let entry = channels
                .entry(scope.clone())
                .or_insert_with(|| Self::new_entry(&scope));
            entry.identity = Some(identity);
            entry.driver.take()
        };
        if let Some(driver) = previous {
            info!("Rejoining channel '{}', stopping the previous subscription", scope);
            driver.stop(&scope).await;
        }

        let mut channels = self.inner.channels.lock().await;
        if let Some(entry) = channels.get_mut(&scope) {
            self.start_driver(entry);
        }
    }

    /// Leaves `scope`: cancels any pending retry, closes the channel and detaches all
    /// observers. Leaving a scope that is not joined is a no-op.
    pub async fn leave(&self, scope: &Scope) {
        let Some(entry) = self.inner.channels.lock().await.remove(scope) else {
            debug!("Leave of unknown channel '{}' ignored", scope);
            return;
        };
        if let Some(driver) = entry.driver {
            driver.stop(scope).await;
        }
        entry.shared.observers.write().await.clear();
        self.set_disconnected(&entry.shared);
        info!("Left channel '{}'", scope);
    }

    /// Restarts a channel that exhausted its retries.
    ///
    /// Runs the full join again, authentication check included. Retrying a channel that is
    /// still live does nothing.
    pub async fn retry(&self, scope: &Scope) -> Result<(), RealtimeError> {
        let mut channels = self.inner.channels.lock().await;
        let entry = channels
            .get_mut(scope)
            .filter(|entry| entry.identity.is_some())
            .ok_or_else(|| RealtimeError::NotJoined(scope.to_string()))?;

        let running = entry
            .driver
            .as_ref()
            .is_some_and(|driver| !driver.handle.is_finished());
        if running {
            debug!("Channel '{}' is still live, manual retry ignored", scope);
            return Ok(());
        }
        info!("Manual retry of channel '{}'", scope);
        self.start_driver(entry);
        Ok(())
    }

    /// Attaches an observer to `scope`. Observers may be attached before joining.
    pub async fn on(&self, scope: &Scope, observer: Arc<dyn ChannelObserver>) -> ListenerId {
        let shared = {
            let mut channels = self.inner.channels.lock().await;
            channels
                .entry(scope.clone())
                .or_insert_with(|| Self::new_entry(scope))
                .shared
                .clone()
        };
        let id = ListenerId::new();
        shared.observers.write().await.push((id, observer));
        id
    }

    /// Detaches an observer. Returns `false` if it was not attached.
    pub async fn off(&self, scope: &Scope, id: ListenerId) -> bool {
        let Some(shared) = self.shared(scope).await else {
            return false;
        };
        let mut observers = shared.observers.write().await;
        let before = observers.len();
        observers.retain(|(listener, _)| *listener != id);
        observers.len() != before
    }

    /// The current state of `scope`. Unknown scopes are `Disconnected`.
    pub async fn state(&self, scope: &Scope) -> ConnectionState {
        match self.shared(scope).await {
            Some(shared) => *shared.status.borrow(),
            None => ConnectionState::Disconnected,
        }
    }

    /// The current state of `scope` along with its failure bookkeeping.
    pub async fn snapshot(&self, scope: &Scope) -> ChannelSnapshot {
        let Some(shared) = self.shared(scope).await else {
            return ChannelSnapshot {
                scope: scope.clone(),
                state: ConnectionState::Disconnected,
                retry_count: 0,
                last_error: None,
            };
        };
        let state = *shared.status.borrow();
        let meta = shared.meta();
        ChannelSnapshot {
            scope: scope.clone(),
            state,
            retry_count: meta.retry_count,
            last_error: meta.last_error.clone(),
        }
    }

    /// Watches the state of `scope`, or `None` if the scope is unknown.
    pub async fn watch_state(&self, scope: &Scope) -> Option<watch::Receiver<ConnectionState>> {
        self.shared(scope).await.map(|shared| shared.status.subscribe())
    }

    /// Subscribes to the state transitions of every channel.
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.inner.transitions.subscribe()
    }

    /// Scopes currently known to the manager.
    pub async fn scopes(&self) -> Vec<Scope> {
        self.inner.channels.lock().await.keys().cloned().collect()
    }

    async fn shared(&self, scope: &Scope) -> Option<Arc<ChannelShared>> {
        self.inner
            .channels
            .lock()
            .await
            .get(scope)
            .map(|entry| entry.shared.clone())
    }

    fn new_entry(scope: &Scope) -> ChannelEntry {
        ChannelEntry {
            shared: Arc::new(ChannelShared::new(scope.clone())),
            identity: None,
            driver: None,
        }
    }

    fn start_driver(&self, entry: &mut ChannelEntry) {
        let Some(identity) = entry.identity.clone() else {
            return;
        };
        {
            let mut meta = entry.shared.meta();
            meta.retry_count = 0;
            meta.last_error = None;
        }
        let context = DriverContext {
            scope: entry.shared.scope.clone(),
            identity,
            client: self.inner.client.clone(),
            session: self.inner.session.clone(),
            config: self.inner.config.clone(),
            shared: entry.shared.clone(),
            transitions: self.inner.transitions.clone(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(context.run(shutdown_rx));
        entry.driver = Some(Driver { handle, shutdown_tx });
    }

    fn set_disconnected(&self, shared: &ChannelShared) {
        apply_transition(&self.inner.transitions, shared, ConnectionState::Disconnected);
    }
}

fn apply_transition(
    transitions: &broadcast::Sender<StateTransition>,
    shared: &ChannelShared,
    to: ConnectionState,
) {
    let mut from = to;
    let changed = shared.status.send_if_modified(|state| {
        if *state == to {
            return false;
        }
        from = *state;
        *state = to;
        true
    });
    if changed {
        debug!("Channel '{}': {:?} -> {:?}", shared.scope, from, to);
        let _ = transitions.send(StateTransition {
            scope: shared.scope.clone(),
            from,
            to,
        });
    }
}

/// Resolves once shutdown is requested or the manager side is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

enum DriverExit {
    Shutdown,
    Exhausted(RealtimeError),
}

enum PumpEnd {
    Shutdown,
    Fault(ChannelFault),
}

/// Everything a driver task owns. The driver never touches the manager's channel map.
struct DriverContext {
    scope: Scope,
    identity: Identity,
    client: Arc<dyn ChangeStreamClient>,
    session: Arc<dyn SessionProvider>,
    config: RealtimeConfig,
    shared: Arc<ChannelShared>,
    transitions: broadcast::Sender<StateTransition>,
}

impl DriverContext {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self.drive(&mut shutdown).await {
            DriverExit::Shutdown => {
                debug!("Driver of channel '{}' shut down", self.scope);
                self.set_state(ConnectionState::Disconnected);
            }
            DriverExit::Exhausted(error) => {
                error!("Channel '{}' gave up: {}", self.scope, error);
                self.shared.meta().last_error = Some(error.clone());
                self.set_state(ConnectionState::Exhausted);
                if let Some(callback) = &self.config.on_exhausted {
                    callback
                        .on_exhausted(ExhaustionInfo {
                            scope: self.scope.clone(),
                            error,
                        })
                        .await;
                }
            }
        }
    }

    async fn drive(&self, shutdown: &mut watch::Receiver<bool>) -> DriverExit {
        let policy = &self.config.reconnect;

        let mut auth_failures = 0u32;
        loop {
            self.set_state(ConnectionState::AuthPending);
            let Some(credential) = race_shutdown(self.session.get_session(), shutdown).await else {
                return DriverExit::Shutdown;
            };
            if credential.is_some() {
                break;
            }
            auth_failures += 1;
            self.record_failure(auth_failures, RealtimeError::AuthUnavailable);
            if auth_failures > policy.max_auth_retries {
                return DriverExit::Exhausted(RealtimeError::RetriesExhausted {
                    attempts: auth_failures,
                    last_error: Box::new(RealtimeError::AuthUnavailable),
                });
            }
            warn!(
                "No session for channel '{}' (check {}), retrying in {:?}",
                self.scope, auth_failures, policy.auth_retry_delay
            );
            if self.pause(policy.auth_retry_delay, shutdown).await {
                return DriverExit::Shutdown;
            }
        }

        let mut failures = 0u32;
        let mut recovering = false;
        loop {
            self.set_state(ConnectionState::Connecting);
            let mut join = self.start_join();
            let joined = race_shutdown(&mut join, shutdown).await;
            let fault = match joined {
                None => {
                    self.abandon_join(join);
                    return DriverExit::Shutdown;
                }
                Some(Err(fault)) => fault,
                Some(Ok(mut channel)) => {
                    let end = self
                        .pump(&mut channel.events, &mut failures, &mut recovering, shutdown)
                        .await;
                    self.client.leave(&channel.handle).await;
                    match end {
                        PumpEnd::Shutdown => return DriverExit::Shutdown,
                        PumpEnd::Fault(fault) => fault,
                    }
                }
            };

            failures += 1;
            recovering = true;
            let error = RealtimeError::from(fault);
            self.record_failure(failures, error.clone());
            self.set_state(ConnectionState::Erroring);
            if failures >= policy.max_attempts {
                return DriverExit::Exhausted(RealtimeError::RetriesExhausted {
                    attempts: failures,
                    last_error: Box::new(error),
                });
            }

            let delay = policy.delay_for(failures);
            warn!(
                "Channel '{}' failed (attempt {}/{}): {}. Reconnecting in {:?}",
                self.scope, failures, policy.max_attempts, error, delay
            );
            if self.pause(delay, shutdown).await {
                return DriverExit::Shutdown;
            }
        }
    }

    async fn pump(
        &self,
        events: &mut mpsc::UnboundedReceiver<ChannelMessage>,
        failures: &mut u32,
        recovering: &mut bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpEnd {
        loop {
            let message = tokio::select! {
                _ = shutdown_requested(shutdown) => return PumpEnd::Shutdown,
                message = events.recv() => message,
            };
            match message {
                None => return PumpEnd::Fault(ChannelFault::ForcedClose),
                Some(ChannelMessage::Status(ChannelStatus::Subscribed)) => {
                    if *self.shared.status.borrow() == ConnectionState::Subscribed {
                        continue;
                    }
                    *failures = 0;
                    {
                        let mut meta = self.shared.meta();
                        meta.retry_count = 0;
                        meta.last_error = None;
                    }
                    self.set_state(ConnectionState::Subscribed);
                    info!("Channel '{}' subscribed", self.scope);
                    if std::mem::take(recovering) {
                        for observer in self.shared.observers().await {
                            observer.on_resubscribed(&self.scope).await;
                        }
                    }
                }
                Some(ChannelMessage::Status(ChannelStatus::ChannelError(reason))) => {
                    return PumpEnd::Fault(ChannelFault::ChannelError(reason));
                }
                Some(ChannelMessage::Status(ChannelStatus::TimedOut)) => {
                    return PumpEnd::Fault(ChannelFault::Timeout);
                }
                Some(ChannelMessage::Status(ChannelStatus::Closed)) => {
                    return PumpEnd::Fault(ChannelFault::ForcedClose);
                }
                Some(ChannelMessage::Change(event)) => {
                    debug!(
                        "Channel '{}' received {:?} of {}",
                        self.scope,
                        event.kind,
                        event.record().map_or("nothing", |record| record.kind_name())
                    );
                    for observer in self.shared.observers().await {
                        observer.on_change(&event).await;
                    }
                }
                Some(ChannelMessage::Broadcast(signal)) => {
                    for observer in self.shared.observers().await {
                        observer.on_signal(&signal).await;
                    }
                }
            }
        }
    }

    /// Sleeps for `delay`. Returns `true` if shutdown was requested meanwhile.
    async fn pause(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = sleep(delay) => false,
            _ = shutdown_requested(shutdown) => true,
        }
    }

    fn record_failure(&self, count: u32, error: RealtimeError) {
        let mut meta = self.shared.meta();
        meta.retry_count = count;
        meta.last_error = Some(error);
    }

    fn set_state(&self, to: ConnectionState) {
        apply_transition(&self.transitions, &self.shared, to);
    }
}

type PendingJoin = Pin<Box<dyn Future<Output = Result<JoinedChannel, ChannelFault>> + Send>>;

impl DriverContext {
    fn start_join(&self) -> PendingJoin {
        let client = self.client.clone();
        let scope = self.scope.clone();
        let identity = self.identity.clone();
        Box::pin(async move { client.join(&scope, &identity).await })
    }

    /// Lets a join interrupted by shutdown complete in the background and closes whatever
    /// channel it opened.
    fn abandon_join(&self, join: PendingJoin) {
        let client = self.client.clone();
        let scope = self.scope.clone();
        tokio::spawn(async move {
            if let Ok(channel) = join.await {
                debug!("Closing channel '{}' opened after shutdown", scope);
                client.leave(&channel.handle).await;
            }
        });
    }
}

/// Runs `future` unless shutdown is requested first.
async fn race_shutdown<F: Future>(future: F, shutdown: &mut watch::Receiver<bool>) -> Option<F::Output> {
    tokio::select! {
        output = future => Some(output),
        _ = shutdown_requested(shutdown) => None,
    }
}
