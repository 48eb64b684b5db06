use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use syncline_core::prelude::*;

#[derive(Debug, Default)]
struct SessionData {
    credential: Option<Credential>,
    unavailable_checks: u32,
    calls: u32,
}

/// An in-memory session provider.
#[derive(Clone, Debug, Default)]
pub struct InMemorySessionProvider(Arc<Mutex<SessionData>>);

impl InMemorySessionProvider {
    /// A provider with a valid credential for `user_id`.
    pub fn signed_in(user_id: Uuid) -> Self {
        let provider = Self::default();
        provider.sign_in(Credential {
            user_id,
            token: format!("token-{}", Uuid::new_v4()),
        });
        provider
    }

    /// A provider without any session.
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Reports no session for the next `checks` lookups, even when signed in.
    pub fn with_unavailable_checks(self, checks: u32) -> Self {
        self.data().unavailable_checks = checks;
        self
    }

    fn data(&self) -> MutexGuard<'_, SessionData> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs `credential`.
    pub fn sign_in(&self, credential: Credential) {
        self.data().credential = Some(credential);
    }

    /// Removes the credential.
    pub fn sign_out(&self) {
        self.data().credential = None;
    }

    /// Number of session lookups so far.
    pub fn calls(&self) -> u32 {
        self.data().calls
    }
}

#[async_trait]
impl SessionProvider for InMemorySessionProvider {
    async fn get_session(&self) -> Option<Credential> {
        let mut data = self.data();
        data.calls += 1;
        if data.unavailable_checks > 0 {
            data.unavailable_checks -= 1;
            log::debug!("InMemorySessionProvider: session not available yet");
            return None;
        }
        data.credential.clone()
    }
}
