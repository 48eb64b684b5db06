mod common;

use async_trait::async_trait;
use common::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use syncline_core::prelude::*;
use tokio::sync::mpsc;
use tokio::time::Instant;

struct CountingCallback(AtomicU32);

#[async_trait]
impl ExhaustionCallback for CountingCallback {
    async fn on_exhausted(&self, info: ExhaustionInfo) {
        assert!(info.error.is_terminal());
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, PartialEq)]
enum Seen {
    Change(ChangeKind),
    Signal(EphemeralSignal),
    Resubscribed,
}

struct Recorder(mpsc::UnboundedSender<Seen>);

#[async_trait]
impl ChannelObserver for Recorder {
    async fn on_change(&self, event: &ChangeEvent) {
        let _ = self.0.send(Seen::Change(event.kind));
    }

    async fn on_signal(&self, signal: &EphemeralSignal) {
        let _ = self.0.send(Seen::Signal(signal.clone()));
    }

    async fn on_resubscribed(&self, _scope: &Scope) {
        let _ = self.0.send(Seen::Resubscribed);
    }
}

fn lobby() -> Scope {
    Scope::chat_room("lobby")
}

#[tokio::test(start_paused = true)]
async fn subscribe_recovers_after_three_failures_with_backoff() {
    let ada = identity("ada");
    let harness = Harness::new(&ada, RealtimeConfig::default());
    harness.stream.fail_next_joins([
        ChannelFault::Timeout,
        ChannelFault::ChannelError("boom".to_string()),
        ChannelFault::ForcedClose,
    ]);
    let manager = harness.manager();
    let mut transitions = manager.transitions();

    let started = Instant::now();
    manager.join(lobby(), ada).await;

    let mut states = Vec::new();
    loop {
        let transition = transitions.recv().await.unwrap();
        assert_eq!(transition.scope, lobby());
        states.push(transition.to);
        if transition.to == ConnectionState::Subscribed {
            break;
        }
    }
    let elapsed = started.elapsed();

    use ConnectionState::*;
    assert_eq!(
        states,
        vec![
            AuthPending, Connecting, Erroring, Connecting, Erroring, Connecting, Erroring, Connecting,
            Subscribed
        ]
    );
    assert!(elapsed >= Duration::from_secs(9), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "elapsed {:?}", elapsed);
    assert_eq!(harness.stream.join_attempts(), 4);

    let snapshot = manager.snapshot(&lobby()).await;
    assert_eq!(snapshot.retry_count, 0);
    assert_eq!(snapshot.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn exhausted_channel_stops_joining_until_manual_retry() {
    let ada = identity("ada");
    let callback = Arc::new(CountingCallback(AtomicU32::new(0)));
    let config = RealtimeConfig {
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            ..Default::default()
        },
        on_exhausted: Some(callback.clone() as Arc<dyn ExhaustionCallback>),
        ..Default::default()
    };
    let harness = Harness::new(&ada, config);
    harness
        .stream
        .fail_next_joins(std::iter::repeat_n(ChannelFault::Timeout, 3));
    let manager = harness.manager();

    manager.join(lobby(), ada).await;
    let mut state = manager.watch_state(&lobby()).await.unwrap();
    wait_for_state(&mut state, ConnectionState::Exhausted).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.stream.join_attempts(), 3);
    assert_eq!(callback.0.load(Ordering::SeqCst), 1);

    let snapshot = manager.snapshot(&lobby()).await;
    assert_eq!(snapshot.state, ConnectionState::Exhausted);
    assert_eq!(snapshot.retry_count, 3);
    assert_eq!(
        snapshot.last_error,
        Some(RealtimeError::RetriesExhausted {
            attempts: 3,
            last_error: Box::new(RealtimeError::Channel(ChannelFault::Timeout)),
        })
    );

    manager.retry(&lobby()).await.unwrap();
    wait_for_state(&mut state, ConnectionState::Subscribed).await;
    assert_eq!(harness.stream.join_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn missing_session_is_retried_then_exhausted() {
    let ada = identity("ada");
    let harness = Harness::new(&ada, RealtimeConfig::default());
    harness.session.sign_out();
    let manager = harness.manager();

    let started = Instant::now();
    manager.join(lobby(), ada).await;
    let mut state = manager.watch_state(&lobby()).await.unwrap();
    wait_for_state(&mut state, ConnectionState::Exhausted).await;

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    assert_eq!(harness.session.calls(), 4);
    assert_eq!(harness.stream.join_attempts(), 0);
    assert_eq!(
        manager.snapshot(&lobby()).await.last_error,
        Some(RealtimeError::RetriesExhausted {
            attempts: 4,
            last_error: Box::new(RealtimeError::AuthUnavailable),
        })
    );
}

#[tokio::test(start_paused = true)]
async fn session_that_appears_late_still_subscribes() {
    let ada = identity("ada");
    let mut harness = Harness::new(&ada, RealtimeConfig::default());
    harness.session = harness.session.clone().with_unavailable_checks(2);
    let manager = harness.manager();

    manager.join(lobby(), ada).await;
    let mut state = manager.watch_state(&lobby()).await.unwrap();
    wait_for_state(&mut state, ConnectionState::Subscribed).await;

    assert_eq!(harness.session.calls(), 3);
    assert_eq!(harness.stream.join_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn leave_cancels_a_pending_reconnect() {
    let ada = identity("ada");
    let harness = Harness::new(&ada, RealtimeConfig::default());
    harness.stream.fail_next_joins([ChannelFault::Timeout]);
    let manager = harness.manager();

    manager.join(lobby(), ada).await;
    let mut state = manager.watch_state(&lobby()).await.unwrap();
    wait_for_state(&mut state, ConnectionState::Erroring).await;

    manager.leave(&lobby()).await;
    assert_eq!(manager.state(&lobby()).await, ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.stream.join_attempts(), 1);
    assert_eq!(harness.stream.active_channels(&lobby()), 0);
}

#[tokio::test(start_paused = true)]
async fn leave_during_a_slow_join_closes_the_channel_it_opens() {
    let ada = identity("ada");
    let harness = Harness::new(&ada, RealtimeConfig::default());
    harness.stream.set_join_latency(Duration::from_millis(500));
    let manager = harness.manager();

    manager.join(lobby(), ada).await;
    let mut state = manager.watch_state(&lobby()).await.unwrap();
    wait_for_state(&mut state, ConnectionState::Connecting).await;

    manager.leave(&lobby()).await;
    assert_eq!(harness.stream.active_channels(&lobby()), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.stream.join_attempts(), 1);
    assert_eq!(harness.stream.leave_count(), 1);
    assert_eq!(harness.stream.active_channels(&lobby()), 0);
}

#[tokio::test(start_paused = true)]
async fn leaving_twice_is_a_no_op() {
    let ada = identity("ada");
    let harness = Harness::new(&ada, RealtimeConfig::default());
    let manager = harness.manager();

    manager.join(lobby(), ada).await;
    let mut state = manager.watch_state(&lobby()).await.unwrap();
    wait_for_state(&mut state, ConnectionState::Subscribed).await;

    manager.leave(&lobby()).await;
    manager.leave(&lobby()).await;

    assert_eq!(harness.stream.leave_count(), 1);
    assert_eq!(harness.stream.active_channels(&lobby()), 0);
    assert!(manager.scopes().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejoining_keeps_a_single_channel_per_scope() {
    let ada = identity("ada");
    let harness = Harness::new(&ada, RealtimeConfig::default());
    let manager = harness.manager();

    manager.join(lobby(), ada.clone()).await;
    let mut state = manager.watch_state(&lobby()).await.unwrap();
    wait_for_state(&mut state, ConnectionState::Subscribed).await;

    manager.join(lobby(), ada).await;
    wait_for_state(&mut state, ConnectionState::Subscribed).await;

    assert_eq!(harness.stream.active_channels(&lobby()), 1);
    assert_eq!(harness.stream.leave_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn events_reach_observers_and_gaps_are_reported() {
    let ada = identity("ada");
    let bob = identity("bob");
    let harness = Harness::new(&ada, RealtimeConfig::default());
    let manager = harness.manager();
    let (sender, mut seen) = mpsc::unbounded_channel();
    let listener = manager.on(&lobby(), Arc::new(Recorder(sender))).await;

    manager.join(lobby(), ada).await;
    let mut state = manager.watch_state(&lobby()).await.unwrap();
    wait_for_state(&mut state, ConnectionState::Subscribed).await;

    let message = server_message("lobby", &bob, "hi", chrono::Utc::now());
    harness
        .stream
        .emit_change(ChangeEvent::insert(lobby(), Record::Message(message)));
    assert_eq!(seen.recv().await, Some(Seen::Change(ChangeKind::Insert)));

    let typing = EphemeralSignal::TypingStarted { user_id: bob.user_id };
    harness.stream.emit(&lobby(), ChannelMessage::Broadcast(typing.clone()));
    assert_eq!(seen.recv().await, Some(Seen::Signal(typing)));

    harness
        .stream
        .fail_channel(&lobby(), ChannelFault::ChannelError("network".to_string()));
    wait_for_state(&mut state, ConnectionState::Erroring).await;
    assert!(state.borrow().is_reconnecting());
    assert_eq!(seen.recv().await, Some(Seen::Resubscribed));
    assert_eq!(*state.borrow(), ConnectionState::Subscribed);
    assert_eq!(harness.stream.join_attempts(), 2);

    assert!(manager.off(&lobby(), listener).await);
    assert!(!manager.off(&lobby(), listener).await);
}

#[tokio::test(start_paused = true)]
async fn vanished_connection_is_treated_as_a_forced_close() {
    let ada = identity("ada");
    let harness = Harness::new(&ada, RealtimeConfig::default());
    let manager = harness.manager();
    let mut transitions = manager.transitions();

    manager.join(lobby(), ada).await;
    let mut state = manager.watch_state(&lobby()).await.unwrap();
    wait_for_state(&mut state, ConnectionState::Subscribed).await;

    assert_eq!(harness.stream.drop_connection(&lobby()), 1);
    wait_for_state(&mut state, ConnectionState::Erroring).await;
    assert_eq!(
        manager.snapshot(&lobby()).await.last_error,
        Some(RealtimeError::Channel(ChannelFault::ForcedClose))
    );
    wait_for_state(&mut state, ConnectionState::Subscribed).await;

    let mut to_states = Vec::new();
    while let Ok(transition) = transitions.try_recv() {
        to_states.push(transition.to);
    }
    assert!(to_states.ends_with(&[
        ConnectionState::Subscribed,
        ConnectionState::Erroring,
        ConnectionState::Connecting,
        ConnectionState::Subscribed,
    ]));
}
