//! Second-factor session state and principal resolution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{Clock, MfaError};
use crate::models::{Principal, SessionContext, SessionState};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, anyhow::Error>;

    /// Persist the elevated flag durably; errors if the session is gone.
    async fn mark_verified(
        &self,
        session_id: &str,
        verified_utc: DateTime<Utc>,
    ) -> Result<(), anyhow::Error>;

    async fn clear_verified(&self, session_id: &str) -> Result<(), anyhow::Error>;
}

/// Resolves the principal that owns the ambient session.
#[async_trait]
pub trait PrincipalResolver: Send + Sync {
    async fn resolve_principal(
        &self,
        ctx: &SessionContext,
    ) -> Result<Option<Principal>, anyhow::Error>;
}

/// Reads the principal straight off the stored session.
pub struct SessionPrincipalResolver {
    store: Arc<dyn SessionStore>,
}

impl SessionPrincipalResolver {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PrincipalResolver for SessionPrincipalResolver {
    async fn resolve_principal(
        &self,
        ctx: &SessionContext,
    ) -> Result<Option<Principal>, anyhow::Error> {
        let Some(session_id) = ctx.session_id.as_deref() else {
            return Ok(None);
        };
        Ok(self.store.load(session_id).await?.map(|s| s.principal))
    }
}

#[derive(Clone)]
pub struct SecondFactorSession {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
}

impl SecondFactorSession {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Mark the session second-factor verified for `principal`. Idempotent.
    ///
    /// Store failures propagate: a caller must never report success for an
    /// elevation that was not recorded. A session now owned by someone else
    /// is refused.
    pub async fn grant_access(
        &self,
        session_id: &str,
        principal: &Principal,
    ) -> Result<(), MfaError> {
        let state = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Session {} no longer exists", session_id))?;

        if state.principal.principal_id != principal.principal_id {
            tracing::warn!(
                session_id = %session_id,
                principal_id = %principal.principal_id,
                owner_id = %state.principal.principal_id,
                "Session changed owner during verification, refusing elevation"
            );
            return Err(MfaError::AuthorizationDenied);
        }

        if state.second_factor_verified {
            tracing::debug!(session_id = %session_id, "Session already verified");
            return Ok(());
        }

        self.store
            .mark_verified(session_id, self.clock.now())
            .await?;

        tracing::info!(
            session_id = %session_id,
            principal_id = %state.principal.principal_id,
            "Session elevated to second-factor verified"
        );
        Ok(())
    }

    pub async fn is_verified(&self, session_id: &str) -> Result<bool, MfaError> {
        Ok(self
            .store
            .load(session_id)
            .await?
            .map(|s| s.second_factor_verified)
            .unwrap_or(false))
    }

    pub async fn revoke(&self, session_id: &str) -> Result<(), MfaError> {
        self.store.clear_verified(session_id).await?;
        tracing::info!(session_id = %session_id, "Second-factor verification revoked");
        Ok(())
    }
}

/// In-memory session store. `set_unavailable(true)` makes writes fail.
#[derive(Default)]
pub struct MockSessionStore {
    sessions: Mutex<HashMap<String, SessionState>>,
    unavailable: AtomicBool,
}

impl MockSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a primary-factor session, as the login flow would.
    pub fn open(&self, session_id: &str, principal: Principal) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(
                session_id.to_string(),
                SessionState::new(session_id, principal, Utc::now()),
            );
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionState> {
        self.sessions
            .lock()
            .ok()
            .and_then(|s| s.get(session_id).cloned())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for MockSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, anyhow::Error> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock session mutex poisoned: {}", e))?;
        Ok(sessions.get(session_id).cloned())
    }

    async fn mark_verified(
        &self,
        session_id: &str,
        verified_utc: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Session store unavailable"));
        }
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock session mutex poisoned: {}", e))?;
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow::anyhow!("Session {} not found", session_id))?;
        state.elevate(verified_utc);
        Ok(())
    }

    async fn clear_verified(&self, session_id: &str) -> Result<(), anyhow::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Session store unavailable"));
        }
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock session mutex poisoned: {}", e))?;
        if let Some(state) = sessions.get_mut(session_id) {
            state.clear_verification();
        }
        Ok(())
    }
}
