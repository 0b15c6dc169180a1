//! Authentication and session management.
//!
//! All authentication failures surface uniformly as "access denied" so that
//! callers cannot probe which users exist or why a login failed.

use uuid::Uuid;

use crate::error::{CResult, Error};
use crate::util::now_micros;

use super::Instance;

/// An authenticated client context.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub uuid: Uuid,
    pub user_id: u32,
    pub started_at: u64,
}

/// Outcome of a successful challenge authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationResult {
    pub user_id: u32,
    pub session_uuid: Uuid,
}

fn access_denied() -> Error {
    Error::Unauthenticated("access denied".into())
}

impl Instance {
    /// First authentication phase: the user must exist, be active and have
    /// at least one active access key.
    pub fn begin_user_authentication(&self, user_name: &str) -> CResult<()> {
        let ok = self
            .with_user(user_name, |user| user.active && user.active_access_key_count() > 0)
            .unwrap_or(false);
        if ok {
            Ok(())
        } else {
            Err(access_denied())
        }
    }

    /// Verifies `signature` over `challenge` against the user's active
    /// access keys; opens a session on success.
    pub fn authenticate_user(
        &self,
        user_name: &str,
        signature: &[u8],
        challenge: &[u8],
    ) -> CResult<AuthenticationResult> {
        let verified = self
            .with_user(user_name, |user| {
                (user.id, user.active && user.authenticate_signature(signature, challenge))
            })
            .unwrap_or((0, false));
        let (user_id, ok) = verified;
        if !ok {
            return Err(access_denied());
        }
        let session_uuid = self.begin_session(user_id)?;
        log::info!("user '{}' authenticated, session {}", user_name, session_uuid);
        Ok(AuthenticationResult { user_id, session_uuid })
    }

    /// Matches a raw token value against the user's active, unexpired
    /// tokens. Token authentication does not open a session.
    pub fn authenticate_user_with_token(&self, user_name: &str, token: &[u8]) -> CResult<u32> {
        let verified = self
            .with_user(user_name, |user| {
                (user.id, user.active && user.authenticate_token(token))
            })
            .unwrap_or((0, false));
        let (user_id, ok) = verified;
        if !ok {
            return Err(access_denied());
        }
        log::info!("user '{}' authenticated via token", user_name);
        Ok(user_id)
    }

    /// Opens a session with a UUID unique among the currently open ones.
    pub fn begin_session(&self, user_id: u32) -> CResult<Uuid> {
        let mut sessions = self.sessions.lock().unwrap();
        let mut session_uuid = Uuid::new_v4();
        while sessions.contains_key(&session_uuid) {
            session_uuid = Uuid::new_v4();
        }
        sessions.insert(
            session_uuid,
            ClientSession { uuid: session_uuid, user_id, started_at: now_micros() },
        );
        log::info!("session {} started", session_uuid);
        Ok(session_uuid)
    }

    /// Closes a session; unknown UUIDs are an error.
    pub fn end_session(&self, session_uuid: &Uuid) -> CResult<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.remove(session_uuid).is_none() {
            return Err(Error::NotFound(format!("session {} does not exist", session_uuid)));
        }
        log::info!("session {} finished", session_uuid);
        Ok(())
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn session_user_id(&self, session_uuid: &Uuid) -> CResult<u32> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(session_uuid)
            .map(|s| s.user_id)
            .ok_or_else(|| Error::NotFound(format!("session {} does not exist", session_uuid)))
    }
}
