//! Records carried by change events.
//!
//! Change payloads are a closed set of tagged variants so that the buffer and the invalidator
//! can dispatch on the resource kind instead of inspecting loosely-typed fields.

use crate::change_stream::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Identifier of an entry in the local cache.
///
/// Speculative entries carry a `Temporary` id that can never collide with a server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EntryId {
    /// An id assigned by the server.
    Server(Uuid),
    /// A locally-generated id for a speculative entry.
    Temporary(Uuid),
}

impl EntryId {
    /// Generates a fresh temporary id.
    pub fn temporary() -> Self {
        EntryId::Temporary(Uuid::new_v4())
    }

    /// Returns `true` for locally-generated ids.
    pub fn is_temporary(&self) -> bool {
        matches!(self, EntryId::Temporary(_))
    }

    /// Returns the server id, if this is one.
    pub fn server_id(&self) -> Option<Uuid> {
        match self {
            EntryId::Server(id) => Some(*id),
            EntryId::Temporary(_) => None,
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Server(id) => write!(f, "{}", id),
            EntryId::Temporary(id) => write!(f, "temp-{}", id),
        }
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The message id.
    pub id: EntryId,
    /// The room this message belongs to.
    pub room_id: String,
    /// The author of the message.
    pub sender_id: Uuid,
    /// The author's display name at the time of sending.
    pub sender_name: String,
    /// The message body.
    pub content: String,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Builds a speculative message authored by `identity`, timestamped now.
    pub fn speculative(room_id: impl Into<String>, identity: &Identity, content: impl Into<String>) -> Self {
        Self {
            id: EntryId::temporary(),
            room_id: room_id.into(),
            sender_id: identity.user_id,
            sender_name: identity.display_name.clone(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    /// Returns `true` if this message has not been confirmed by the server.
    pub fn is_speculative(&self) -> bool {
        self.id.is_temporary()
    }

    /// Returns `true` if `echo` is the server's copy of this speculative message.
    ///
    /// The temporary id never matches the server id, so the echo is matched on author and
    /// content, with creation timestamps no further apart than `window`.
    pub fn matches_echo(&self, echo: &Message, window: Duration) -> bool {
        if !self.is_speculative() || echo.is_speculative() {
            return false;
        }
        let delta_ms = (self.created_at - echo.created_at).num_milliseconds().unsigned_abs();
        self.sender_id == echo.sender_id
            && self.content == echo.content
            && u128::from(delta_ms) <= window.as_millis()
    }
}

/// A member of a chat room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// The participant row id.
    pub id: Uuid,
    /// The room the user joined.
    pub room_id: String,
    /// The user.
    pub user_id: Uuid,
    /// The user's display name.
    pub display_name: String,
    /// When the user joined the room.
    pub joined_at: DateTime<Utc>,
}

/// A daily habit check-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckIn {
    /// The check-in id.
    pub id: Uuid,
    /// The user who checked in.
    pub user_id: Uuid,
    /// The habit that was checked.
    pub habit: String,
    /// When the check-in happened.
    pub completed_at: DateTime<Utc>,
    /// Free-form metadata attached by the client.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Derived streak aggregate for one habit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Streak {
    /// The user owning the streak.
    pub user_id: Uuid,
    /// The habit this streak counts.
    pub habit: String,
    /// Consecutive days up to today.
    pub current: u32,
    /// Longest run ever recorded.
    pub longest: u32,
    /// Last recomputation time.
    pub updated_at: DateTime<Utc>,
}

/// A change payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    /// A chat message.
    Message(Message),
    /// A chat room participant.
    Participant(Participant),
    /// A habit check-in.
    CheckIn(CheckIn),
    /// A streak aggregate.
    Streak(Streak),
}

impl Record {
    /// A short name of the record kind, for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Record::Message(_) => "message",
            Record::Participant(_) => "participant",
            Record::CheckIn(_) => "check_in",
            Record::Streak(_) => "streak",
        }
    }

    /// Returns the inner message, if this is one.
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Record::Message(message) => Some(message),
            _ => None,
        }
    }
}
