//! Channel scopes.
//!
//! A [`Scope`] names one resource instance's change-stream, rendered as
//! `resource_kind:resource_id` (for example `chat_room:lobby`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The kind of resource a channel subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Messages, participants and typing signals of one chat room.
    ChatRoom,
    /// Daily check-ins and streak aggregates of one user.
    UserCheckIns,
}

impl ScopeKind {
    /// The prefix used when rendering a scope key.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::ChatRoom => "chat_room",
            ScopeKind::UserCheckIns => "check_ins",
        }
    }
}

impl FromStr for ScopeKind {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat_room" => Ok(ScopeKind::ChatRoom),
            "check_ins" => Ok(ScopeKind::UserCheckIns),
            other => Err(ScopeParseError::UnknownKind(other.to_string())),
        }
    }
}

/// Identifies a subscription scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// What kind of resource this scope covers.
    pub kind: ScopeKind,
    /// The id of the resource instance.
    pub id: String,
}

impl Scope {
    /// Creates a new scope.
    pub fn new(kind: ScopeKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// The scope of a chat room.
    pub fn chat_room(room_id: impl Into<String>) -> Self {
        Self::new(ScopeKind::ChatRoom, room_id)
    }

    /// The scope of a user's check-ins and streaks.
    pub fn user_check_ins(user_id: Uuid) -> Self {
        Self::new(ScopeKind::UserCheckIns, user_id.to_string())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Errors returned when parsing a scope key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeParseError {
    /// The key has no `:` separator.
    #[error("scope '{0}' is missing the ':' separator")]
    MissingSeparator(String),
    /// The resource kind is not known.
    #[error("unknown resource kind '{0}'")]
    UnknownKind(String),
    /// The resource id is empty.
    #[error("scope '{0}' has an empty resource id")]
    EmptyId(String),
}

impl FromStr for Scope {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| ScopeParseError::MissingSeparator(s.to_string()))?;
        if id.is_empty() {
            return Err(ScopeParseError::EmptyId(s.to_string()));
        }
        Ok(Scope::new(kind.parse()?, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_renders_kind_and_id() {
        assert_eq!(Scope::chat_room("lobby").to_string(), "chat_room:lobby");
        let user = Uuid::new_v4();
        assert_eq!(
            Scope::user_check_ins(user).to_string(),
            format!("check_ins:{}", user)
        );
    }

    #[test]
    fn scope_parses_its_own_rendering() {
        let scope: Scope = "chat_room:room-42".parse().unwrap();
        assert_eq!(scope, Scope::chat_room("room-42"));
    }

    #[test]
    fn scope_id_may_contain_separators() {
        let scope: Scope = "chat_room:a:b".parse().unwrap();
        assert_eq!(scope.id, "a:b");
    }

    #[test]
    fn scope_parse_rejects_malformed_keys() {
        assert_eq!(
            "lobby".parse::<Scope>(),
            Err(ScopeParseError::MissingSeparator("lobby".to_string()))
        );
        assert_eq!(
            "forum:lobby".parse::<Scope>(),
            Err(ScopeParseError::UnknownKind("forum".to_string()))
        );
        assert_eq!(
            "chat_room:".parse::<Scope>(),
            Err(ScopeParseError::EmptyId("chat_room:".to_string()))
        );
    }
}
