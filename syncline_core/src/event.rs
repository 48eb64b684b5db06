//! Change events, ephemeral signals and the messages a joined channel delivers.

use crate::record::Record;
use crate::scope::Scope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A record was inserted.
    Insert,
    /// A record was updated.
    Update,
    /// A record was deleted.
    Delete,
}

/// A notification that a record was inserted, updated or deleted.
///
/// Events are immutable once received. No ordering is guaranteed across reconnects, so
/// consumers must tolerate replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// What happened.
    pub kind: ChangeKind,
    /// The channel scope the event was received on.
    pub scope: Scope,
    /// The record after the change. `None` for deletes.
    pub new: Option<Record>,
    /// The record before the change, when the stream provides it.
    pub old: Option<Record>,
    /// When the event was received locally.
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// An insert of `record`.
    pub fn insert(scope: Scope, record: Record) -> Self {
        Self {
            kind: ChangeKind::Insert,
            scope,
            new: Some(record),
            old: None,
            received_at: Utc::now(),
        }
    }

    /// An update from `old` to `new`.
    pub fn update(scope: Scope, old: Option<Record>, new: Record) -> Self {
        Self {
            kind: ChangeKind::Update,
            scope,
            new: Some(new),
            old,
            received_at: Utc::now(),
        }
    }

    /// A delete of `old`.
    pub fn delete(scope: Scope, old: Record) -> Self {
        Self {
            kind: ChangeKind::Delete,
            scope,
            new: None,
            old: Some(old),
            received_at: Utc::now(),
        }
    }

    /// The most relevant record of the event: the new one, or the old one for deletes.
    pub fn record(&self) -> Option<&Record> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// Transient, non-persisted broadcast state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum EphemeralSignal {
    /// A user started typing.
    TypingStarted {
        /// The typing user.
        user_id: Uuid,
    },
    /// A user stopped typing.
    TypingStopped {
        /// The user that stopped typing.
        user_id: Uuid,
    },
    /// The full set of users currently present on the channel.
    PresenceSync {
        /// Online users.
        user_ids: Vec<Uuid>,
    },
}

impl EphemeralSignal {
    /// The user a typing signal refers to.
    pub fn typing_user(&self) -> Option<Uuid> {
        match self {
            EphemeralSignal::TypingStarted { user_id } | EphemeralSignal::TypingStopped { user_id } => {
                Some(*user_id)
            }
            EphemeralSignal::PresenceSync { .. } => None,
        }
    }
}

/// Subscription status reported by the change-stream for a joined channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// The subscription was confirmed.
    Subscribed,
    /// The channel reported an error.
    ChannelError(String),
    /// The subscription timed out on the transport.
    TimedOut,
    /// The channel was closed by the remote side.
    Closed,
}

/// A message delivered on a joined channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    /// Subscription status changed.
    Status(ChannelStatus),
    /// A record changed.
    Change(ChangeEvent),
    /// An ephemeral signal was broadcast.
    Broadcast(EphemeralSignal),
}
