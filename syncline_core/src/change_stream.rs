//! The change-stream client seam.
//!
//! The change-stream opens one logical channel per [`Scope`], delivers change events and
//! ephemeral broadcasts over it, and accepts sends. Its internals are external to this crate;
//! see `syncline_mem` for an in-memory implementation.

use crate::error::{BoxError, ChannelFault};
use crate::event::{ChannelMessage, EphemeralSignal};
use crate::record::Record;
use crate::scope::Scope;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Who is joining a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// The user id.
    pub user_id: Uuid,
    /// The name shown to other participants.
    pub display_name: String,
}

impl Identity {
    /// Creates a new identity.
    pub fn new(user_id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
        }
    }
}

/// A reference to one subscription of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    /// Unique id of this subscription.
    pub id: Uuid,
    /// The subscribed scope.
    pub scope: Scope,
}

/// A channel returned by [`ChangeStreamClient::join`].
#[derive(Debug)]
pub struct JoinedChannel {
    /// Handle used to leave the channel.
    pub handle: ChannelHandle,
    /// Everything the channel delivers, starting with its subscription status.
    pub events: mpsc::UnboundedReceiver<ChannelMessage>,
}

/// A client for the remote change-stream.
#[async_trait]
pub trait ChangeStreamClient: Send + Sync {
    /// Opens a channel for `scope`. Confirmation arrives as
    /// [`ChannelStatus::Subscribed`](crate::event::ChannelStatus::Subscribed) on `events`.
    ///
    /// A join interrupted by a leave is still awaited to completion in the background, and a
    /// channel it opens is left right away.
    async fn join(&self, scope: &Scope, identity: &Identity) -> Result<JoinedChannel, ChannelFault>;

    /// Removes a channel. Leaving an unknown handle is a no-op.
    async fn leave(&self, handle: &ChannelHandle);

    /// Persists `payload`. `Ok(false)` means the write was rejected.
    async fn send(&self, scope: &Scope, payload: Record) -> Result<bool, BoxError>;

    /// Broadcasts a non-persisted signal to the other participants of `scope`.
    async fn broadcast_ephemeral(&self, scope: &Scope, signal: EphemeralSignal) -> Result<(), BoxError>;
}
