//! Typing and presence signals.
//!
//! Outgoing signals are rate limited by the [`SignalTracker`]. Incoming signals are collected
//! by [`RemoteSignals`], which expires typing indicators on its own so a peer that vanished
//! without sending "stop" does not stay "typing" forever.

use crate::change_stream::ChangeStreamClient;
use crate::config::SignalConfig;
use crate::connection::ChannelObserver;
use crate::event::EphemeralSignal;
use crate::scope::Scope;
use crate::timer::ScheduledTask;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Default)]
struct TrackerState {
    active: bool,
    last_start_sent: Option<Instant>,
    closed: bool,
}

struct TrackerInner {
    scope: Scope,
    user_id: Uuid,
    client: Arc<dyn ChangeStreamClient>,
    config: SignalConfig,
    state: Mutex<TrackerState>,
    stop_timer: ScheduledTask,
}

impl TrackerInner {
    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn broadcast(&self, signal: EphemeralSignal) {
        if let Err(e) = self.client.broadcast_ephemeral(&self.scope, signal.clone()).await {
            warn!("Broadcast of {:?} on '{}' failed: {}", signal, self.scope, e);
        }
    }

    /// Sends "stop" if a "start" is outstanding. Sends at most once per "start".
    async fn stop(&self) -> bool {
        let was_active = std::mem::replace(&mut self.state().active, false);
        if was_active {
            debug!("User {} stopped typing on '{}'", self.user_id, self.scope);
            self.broadcast(EphemeralSignal::TypingStopped { user_id: self.user_id }).await;
        }
        was_active
    }
}

/// Propagates the local user's typing state without flooding the channel.
///
/// [`start_signaling`](Self::start_signaling) is meant to be called on every keystroke. It
/// broadcasts "start" only when the user is not already typing and the cool-down since the
/// previous "start" has elapsed, and re-arms an idle timer that broadcasts "stop".
#[derive(Clone)]
pub struct SignalTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for SignalTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalTracker")
            .field("scope", &self.inner.scope)
            .field("user_id", &self.inner.user_id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl SignalTracker {
    /// Creates an idle tracker for `user_id` on `scope`.
    pub fn new(scope: Scope, user_id: Uuid, client: Arc<dyn ChangeStreamClient>, config: SignalConfig) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                scope,
                user_id,
                client,
                config,
                state: Mutex::new(TrackerState::default()),
                stop_timer: ScheduledTask::new("typing-stop"),
            }),
        }
    }

    /// Records local activity.
    pub async fn start_signaling(&self) {
        let send_start = {
            let mut state = self.inner.state();
            if state.closed {
                return;
            }
            let cooled_down = state
                .last_start_sent
                .is_none_or(|sent| sent.elapsed() >= self.inner.config.cooldown);
            let send = !state.active && cooled_down;
            if send {
                state.active = true;
                state.last_start_sent = Some(Instant::now());
            }
            send
        };

        let inner = self.inner.clone();
        self.inner.stop_timer.schedule(self.inner.config.idle_timeout, move || async move {
            inner.stop().await;
        });

        if send_start {
            debug!("User {} started typing on '{}'", self.inner.user_id, self.inner.scope);
            self.inner
                .broadcast(EphemeralSignal::TypingStarted {
                    user_id: self.inner.user_id,
                })
                .await;
        }
    }

    /// Stops signalling right away. Returns `true` if a "stop" was broadcast.
    pub async fn stop_signaling(&self) -> bool {
        self.inner.stop_timer.cancel();
        self.inner.stop().await
    }

    /// Cancels the idle timer without broadcasting anything.
    pub fn cancel_pending(&self) -> bool {
        self.inner.stop_timer.cancel()
    }

    /// Tears the tracker down: cancels the idle timer and broadcasts "stop" if the user is
    /// still typing. Later activity is ignored. Closing twice is a no-op.
    pub async fn close(&self) {
        if std::mem::replace(&mut self.inner.state().closed, true) {
            return;
        }
        self.inner.stop_timer.cancel();
        self.inner.stop().await;
    }

    /// Whether a "start" is outstanding.
    pub fn is_active(&self) -> bool {
        self.inner.state().active
    }
}

/// Typing and presence state of the remote participants of one channel.
#[derive(Debug, Clone)]
pub struct EphemeralSignalSet {
    typing: HashMap<Uuid, Instant>,
    online: HashSet<Uuid>,
    expiry: Duration,
}

impl EphemeralSignalSet {
    /// Creates an empty set whose typing indicators expire after `expiry` without renewal.
    pub fn new(expiry: Duration) -> Self {
        Self {
            typing: HashMap::new(),
            online: HashSet::new(),
            expiry,
        }
    }

    /// Applies one incoming signal.
    pub fn apply(&mut self, signal: &EphemeralSignal) {
        match signal {
            EphemeralSignal::TypingStarted { user_id } => {
                self.typing.insert(*user_id, Instant::now());
            }
            EphemeralSignal::TypingStopped { user_id } => {
                self.typing.remove(user_id);
            }
            EphemeralSignal::PresenceSync { user_ids } => {
                self.online = user_ids.iter().copied().collect();
            }
        }
    }

    /// Users currently typing, sorted. Expired indicators are dropped.
    pub fn typing(&mut self) -> Vec<Uuid> {
        let expiry = self.expiry;
        self.typing.retain(|_, since| since.elapsed() < expiry);
        let mut users: Vec<Uuid> = self.typing.keys().copied().collect();
        users.sort();
        users
    }

    /// Users present on the channel according to the latest presence sync, sorted.
    pub fn online(&self) -> Vec<Uuid> {
        let mut users: Vec<Uuid> = self.online.iter().copied().collect();
        users.sort();
        users
    }
}

/// Collects the ephemeral signals of a channel, ignoring the local user's own.
#[derive(Debug)]
pub struct RemoteSignals {
    local_user: Uuid,
    set: Mutex<EphemeralSignalSet>,
}

impl RemoteSignals {
    /// Creates an empty collector.
    pub fn new(local_user: Uuid, expiry: Duration) -> Self {
        Self {
            local_user,
            set: Mutex::new(EphemeralSignalSet::new(expiry)),
        }
    }

    fn set(&self) -> MutexGuard<'_, EphemeralSignalSet> {
        self.set.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remote users currently typing.
    pub fn typing_users(&self) -> Vec<Uuid> {
        self.set().typing()
    }

    /// Users present on the channel.
    pub fn online_users(&self) -> Vec<Uuid> {
        self.set().online()
    }

    /// Applies one signal unless it is the local user's own typing signal.
    pub fn apply(&self, signal: &EphemeralSignal) {
        if signal.typing_user() == Some(self.local_user) {
            return;
        }
        self.set().apply(signal);
    }
}

#[async_trait]
impl ChannelObserver for RemoteSignals {
    async fn on_signal(&self, signal: &EphemeralSignal) {
        self.apply(signal);
    }
}
