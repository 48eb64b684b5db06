//! Error taxonomy of the synchronization layer.

/// Boxed errors returned by external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Transport-level channel failures. All of them are retried with backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelFault {
    /// The channel reported an error.
    #[error("channel error: {0}")]
    ChannelError(String),
    /// The subscription timed out.
    #[error("channel subscription timed out")]
    Timeout,
    /// The channel was closed by the remote side.
    #[error("channel closed by the remote side")]
    ForcedClose,
}

/// Errors surfaced by the synchronization layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RealtimeError {
    /// No session is available yet.
    #[error("no session available")]
    AuthUnavailable,
    /// A transport-level channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelFault),
    /// A send was rejected or failed on the network. The speculative entry was rolled back.
    #[error("send failed: {0}")]
    SendFailure(String),
    /// Automatic retries were exhausted; no further automatic action is taken.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error of the final attempt.
        last_error: Box<RealtimeError>,
    },
    /// A page could not be fetched.
    #[error("page fetch failed: {0}")]
    Fetch(String),
    /// The operation needs a joined channel.
    #[error("channel '{0}' is not joined")]
    NotJoined(String),
}

impl RealtimeError {
    /// Whether the error is retried automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RealtimeError::AuthUnavailable | RealtimeError::Channel(_))
    }

    /// Whether the error is a terminal state the consumer must act on.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RealtimeError::RetriesExhausted { .. })
    }
}
