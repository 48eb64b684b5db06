use async_trait::async_trait;
use chrono::Utc;
use futures_core::Stream;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use syncline_core::prelude::*;

use crate::page_store::InMemoryPageStore;

#[derive(Debug)]
struct OpenChannel {
    scope: Scope,
    user_id: Uuid,
    sender: mpsc::UnboundedSender<ChannelMessage>,
}

#[derive(Debug)]
struct StreamState {
    channels: HashMap<Uuid, OpenChannel>,
    join_failures: VecDeque<ChannelFault>,
    auto_subscribe: bool,
    online: bool,
    send_failures: u32,
    send_latency: Duration,
    join_latency: Duration,
    echo: bool,
    history: Option<InMemoryPageStore>,
    join_attempts: u32,
    leaves: u32,
    sent: Vec<(Scope, Record)>,
    broadcasts: Vec<(Scope, EphemeralSignal)>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            channels: HashMap::new(),
            join_failures: VecDeque::new(),
            auto_subscribe: true,
            online: true,
            send_failures: 0,
            send_latency: Duration::ZERO,
            join_latency: Duration::ZERO,
            echo: false,
            history: None,
            join_attempts: 0,
            leaves: 0,
            sent: Vec::new(),
            broadcasts: Vec::new(),
        }
    }
}

impl StreamState {
    fn deliver(&self, scope: &Scope, message: &ChannelMessage, skip_user: Option<Uuid>) -> usize {
        self.channels
            .values()
            .filter(|channel| channel.scope == *scope && Some(channel.user_id) != skip_user)
            .filter(|channel| channel.sender.send(message.clone()).is_ok())
            .count()
    }
}

/// Errors returned by the [`InMemoryChangeStream`].
#[derive(Debug, thiserror::Error)]
pub enum InMemoryChangeStreamError {
    /// A transport failure scripted with [`InMemoryChangeStream::fail_next_sends`].
    #[error("connection reset during send")]
    ConnectionReset,
}

/// An in-memory change-stream.
///
/// Every joined channel gets its own delivery queue. By default joins succeed and are
/// confirmed right away, sends are accepted, and nothing is echoed back. The scripting
/// methods change that for tests.
#[derive(Clone, Debug)]
pub struct InMemoryChangeStream {
    state: Arc<Mutex<StreamState>>,
    signals: broadcast::Sender<(Scope, EphemeralSignal)>,
}

impl Default for InMemoryChangeStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChangeStream {
    /// Creates a change-stream without channels.
    pub fn new() -> Self {
        log::debug!("Creating a new InMemoryChangeStream");
        let (signals, _) = broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(StreamState::default())),
            signals,
        }
    }

    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next joins fail with `faults`, one per join.
    pub fn fail_next_joins(&self, faults: impl IntoIterator<Item = ChannelFault>) {
        self.state().join_failures.extend(faults);
    }

    /// Whether joins are confirmed with `Subscribed` right away.
    pub fn set_auto_subscribe(&self, enabled: bool) {
        self.state().auto_subscribe = enabled;
    }

    /// While offline, every send is rejected.
    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    /// Makes the next `count` sends fail with a transport error.
    pub fn fail_next_sends(&self, count: u32) {
        self.state().send_failures = count;
    }

    /// Delays every send by `latency`.
    pub fn set_send_latency(&self, latency: Duration) {
        self.state().send_latency = latency;
    }

    /// Delays every join by `latency` before the channel opens.
    pub fn set_join_latency(&self, latency: Duration) {
        self.state().join_latency = latency;
    }

    /// Echoes every accepted message back as an insert with a server id, persisting it into
    /// `history` when given.
    pub fn enable_echo(&self, history: Option<InMemoryPageStore>) {
        let mut state = self.state();
        state.echo = true;
        state.history = history;
    }

    /// Stops echoing sends.
    pub fn disable_echo(&self) {
        let mut state = self.state();
        state.echo = false;
        state.history = None;
    }

    /// Delivers `message` to every open channel of `scope`. Returns the number of channels
    /// reached.
    pub fn emit(&self, scope: &Scope, message: ChannelMessage) -> usize {
        self.state().deliver(scope, &message, None)
    }

    /// Delivers a change event to the channels of its scope.
    pub fn emit_change(&self, event: ChangeEvent) -> usize {
        let scope = event.scope.clone();
        self.emit(&scope, ChannelMessage::Change(event))
    }

    /// Reports `fault` on every open channel of `scope`.
    pub fn fail_channel(&self, scope: &Scope, fault: ChannelFault) -> usize {
        let status = match fault {
            ChannelFault::ChannelError(reason) => ChannelStatus::ChannelError(reason),
            ChannelFault::Timeout => ChannelStatus::TimedOut,
            ChannelFault::ForcedClose => ChannelStatus::Closed,
        };
        self.emit(scope, ChannelMessage::Status(status))
    }

    /// Confirms every open channel of `scope`. Used with auto-subscribe disabled.
    pub fn confirm(&self, scope: &Scope) -> usize {
        self.emit(scope, ChannelMessage::Status(ChannelStatus::Subscribed))
    }

    /// Drops the delivery queues of `scope`, as if the connection vanished.
    pub fn drop_connection(&self, scope: &Scope) -> usize {
        let mut state = self.state();
        let before = state.channels.len();
        state.channels.retain(|_, channel| channel.scope != *scope);
        before - state.channels.len()
    }

    /// Number of join attempts so far, failed ones included.
    pub fn join_attempts(&self) -> u32 {
        self.state().join_attempts
    }

    /// Number of channels left so far.
    pub fn leave_count(&self) -> u32 {
        self.state().leaves
    }

    /// Number of open channels of `scope`.
    pub fn active_channels(&self, scope: &Scope) -> usize {
        self.state()
            .channels
            .values()
            .filter(|channel| channel.scope == *scope)
            .count()
    }

    /// Every accepted send, in order.
    pub fn sent(&self) -> Vec<(Scope, Record)> {
        self.state().sent.clone()
    }

    /// Every ephemeral broadcast, in order.
    pub fn broadcasts(&self) -> Vec<(Scope, EphemeralSignal)> {
        self.state().broadcasts.clone()
    }

    /// A live stream of the ephemeral broadcasts made from now on.
    pub fn broadcast_stream(&self) -> impl Stream<Item = (Scope, EphemeralSignal)> + Send + Unpin + 'static {
        BroadcastStream::new(self.signals.subscribe()).filter_map(|signal| signal.ok())
    }

    fn echo_of(record: &Record) -> Record {
        match record {
            Record::Message(message) if message.is_speculative() => Record::Message(Message {
                id: EntryId::Server(Uuid::new_v4()),
                created_at: Utc::now(),
                ..message.clone()
            }),
            other => other.clone(),
        }
    }
}

#[async_trait]
impl ChangeStreamClient for InMemoryChangeStream {
    async fn join(&self, scope: &Scope, identity: &Identity) -> Result<JoinedChannel, ChannelFault> {
        let latency = self.state().join_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        state.join_attempts += 1;
        if let Some(fault) = state.join_failures.pop_front() {
            log::debug!("InMemoryChangeStream: join of '{}' fails with {}", scope, fault);
            return Err(fault);
        }

        let (sender, events) = mpsc::unbounded_channel();
        if state.auto_subscribe {
            let _ = sender.send(ChannelMessage::Status(ChannelStatus::Subscribed));
        }
        let handle = ChannelHandle {
            id: Uuid::new_v4(),
            scope: scope.clone(),
        };
        state.channels.insert(
            handle.id,
            OpenChannel {
                scope: scope.clone(),
                user_id: identity.user_id,
                sender,
            },
        );
        log::debug!("InMemoryChangeStream: '{}' joined as {}", scope, handle.id);
        Ok(JoinedChannel { handle, events })
    }

    async fn leave(&self, handle: &ChannelHandle) {
        let mut state = self.state();
        if state.channels.remove(&handle.id).is_some() {
            state.leaves += 1;
            log::debug!("InMemoryChangeStream: left {} of '{}'", handle.id, handle.scope);
        }
    }

    async fn send(&self, scope: &Scope, payload: Record) -> Result<bool, BoxError> {
        let latency = self.state().send_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if !state.online {
            log::debug!("InMemoryChangeStream: offline, rejecting {}", payload.kind_name());
            return Ok(false);
        }
        if state.send_failures > 0 {
            state.send_failures -= 1;
            return Err(Box::new(InMemoryChangeStreamError::ConnectionReset));
        }
        state.sent.push((scope.clone(), payload.clone()));

        if state.echo {
            let echo = Self::echo_of(&payload);
            if let (Some(history), Record::Message(message)) = (&state.history, &echo) {
                history.insert(scope, message.clone());
            }
            state.deliver(scope, &ChannelMessage::Change(ChangeEvent::insert(scope.clone(), echo)), None);
        }
        Ok(true)
    }

    async fn broadcast_ephemeral(&self, scope: &Scope, signal: EphemeralSignal) -> Result<(), BoxError> {
        let mut state = self.state();
        state.broadcasts.push((scope.clone(), signal.clone()));
        state.deliver(scope, &ChannelMessage::Broadcast(signal.clone()), signal.typing_user());
        let _ = self.signals.send((scope.clone(), signal));
        Ok(())
    }
}
