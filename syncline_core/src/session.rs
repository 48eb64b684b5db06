//! Session and credential lookup.

use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

/// A session credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// The authenticated user.
    pub user_id: Uuid,
    /// The access token.
    pub token: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Provides the current session, consulted before every subscribe.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Returns the current credential, or `None` if no session exists yet.
    async fn get_session(&self) -> Option<Credential>;
}
