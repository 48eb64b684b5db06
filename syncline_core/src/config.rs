//! Configuration of the synchronization layer.

use crate::error::RealtimeError;
use crate::scope::Scope;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Information about a channel that exhausted its retries, passed to the [`ExhaustionCallback`].
#[derive(Debug, Clone)]
pub struct ExhaustionInfo {
    /// The channel that gave up.
    pub scope: Scope,
    /// The terminal error, always [`RealtimeError::RetriesExhausted`].
    pub error: RealtimeError,
}

/// Callback invoked when a channel enters the `Exhausted` state.
///
/// Implementations should be lightweight: the callback runs on the channel's driver task right
/// before it exits.
///
/// # Example
///
/// ```rust,ignore
/// use syncline_core::config::{ExhaustionCallback, ExhaustionInfo};
/// use async_trait::async_trait;
///
/// struct Alert;
///
/// #[async_trait]
/// impl ExhaustionCallback for Alert {
///     async fn on_exhausted(&self, info: ExhaustionInfo) {
///         log::error!("{} is offline: {}", info.scope, info.error);
///     }
/// }
/// ```
#[async_trait]
pub trait ExhaustionCallback: Send + Sync {
    /// Called once per exhaustion.
    async fn on_exhausted(&self, info: ExhaustionInfo);
}

/// Retry behaviour of the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before each reconnect attempt. The last step repeats once the schedule runs out.
    pub backoff: Vec<Duration>,
    /// Failed subscribe attempts after which the channel is `Exhausted`.
    pub max_attempts: u32,
    /// Delay between session checks while no credential is available.
    pub auth_retry_delay: Duration,
    /// Session re-checks allowed before the channel is `Exhausted`.
    pub max_auth_retries: u32,
}

impl ReconnectPolicy {
    /// The delay after the `failure`-th consecutive failure (1-based).
    pub fn delay_for(&self, failure: u32) -> Duration {
        let index = failure.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(1))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ],
            max_attempts: 5,
            auth_retry_delay: Duration::from_secs(1),
            max_auth_retries: 3,
        }
    }
}

/// Retry behaviour of sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry. Subsequent retries double it.
    pub initial_delay: Duration,
    /// Cap of the exponential delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Timing of typing and presence signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalConfig {
    /// Minimum time between two "start" broadcasts.
    pub cooldown: Duration,
    /// Inactivity after which a "stop" broadcast is sent.
    pub idle_timeout: Duration,
    /// How long a remote typing indicator stays visible without renewal.
    pub remote_expiry: Duration,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(2),
            remote_expiry: Duration::from_secs(5),
        }
    }
}

/// Configuration of the synchronization layer.
#[derive(Clone)]
pub struct RealtimeConfig {
    /// Subscribe and session retry behaviour.
    pub reconnect: ReconnectPolicy,

    /// Send retry behaviour of the mutation coordinator.
    pub send_retry: RetryPolicy,

    /// Typing and presence timings.
    pub signal: SignalConfig,

    /// Trailing debounce of the event buffer. Each new insert restarts the window.
    pub flush_window: Duration,

    /// Trailing debounce of the invalidator.
    pub invalidation_window: Duration,

    /// Number of messages fetched per page.
    pub page_size: u32,

    /// Maximum distance between a speculative entry's timestamp and its server echo.
    pub echo_match_window: Duration,

    /// Optional callback invoked when a channel exhausts its retries.
    ///
    /// Default: `None`
    pub on_exhausted: Option<Arc<dyn ExhaustionCallback>>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            send_retry: RetryPolicy::default(),
            signal: SignalConfig::default(),
            flush_window: Duration::from_millis(100),
            invalidation_window: Duration::from_millis(500),
            page_size: 50,
            echo_match_window: Duration::from_secs(10),
            on_exhausted: None,
        }
    }
}

impl std::fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("reconnect", &self.reconnect)
            .field("send_retry", &self.send_retry)
            .field("signal", &self.signal)
            .field("flush_window", &self.flush_window)
            .field("invalidation_window", &self.invalidation_window)
            .field("page_size", &self.page_size)
            .field("echo_match_window", &self.echo_match_window)
            .field(
                "on_exhausted",
                &self.on_exhausted.as_ref().map(|_| "Some(<callback>)"),
            )
            .finish()
    }
}
