//! Verification orchestrator: the single "attempt second-factor
//! verification" operation and its gating predicate.
//!
//! Flow per attempt: resolve principal -> gate -> verify -> on success
//! remember the device (best effort) and elevate the session (authoritative),
//! on failure raise a warning alert. Attempts on one session run one at a
//! time; different sessions never contend.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::metrics::{self, OUTCOME_DENIED};
use super::{
    MfaError, PrincipalResolver, ProviderRegistry, SecondFactorSession, SecurityAlertSink,
    TrustGrant, TrustedDeviceManager,
};
use crate::models::{
    Principal, ProviderCode, SessionContext, Severity, VerificationOutcome, VerificationRequest,
};

/// Module name attached to alerts raised here.
pub const ALERT_MODULE: &str = "mfa-service";

/// Result of one attempt. `trust` is set when the device was remembered.
#[derive(Debug, Clone)]
pub struct VerificationAttempt {
    pub outcome: VerificationOutcome,
    pub trust: Option<TrustGrant>,
}

pub struct VerificationOrchestrator {
    resolver: Arc<dyn PrincipalResolver>,
    registry: ProviderRegistry,
    trusted_devices: TrustedDeviceManager,
    session: SecondFactorSession,
    alerts: SecurityAlertSink,
    side_effect_timeout: Duration,
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl VerificationOrchestrator {
    pub fn new(
        resolver: Arc<dyn PrincipalResolver>,
        registry: ProviderRegistry,
        trusted_devices: TrustedDeviceManager,
        session: SecondFactorSession,
        alerts: SecurityAlertSink,
        side_effect_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            registry,
            trusted_devices,
            session,
            alerts,
            side_effect_timeout,
            session_locks: DashMap::new(),
        }
    }

    pub fn trusted_devices(&self) -> &TrustedDeviceManager {
        &self.trusted_devices
    }

    /// May the caller reach the verification operation for `provider` at all?
    ///
    /// Refusal is `Ok(false)`; an unknown provider or an unreachable store
    /// is an error.
    pub async fn is_operation_allowed(
        &self,
        ctx: &SessionContext,
        provider: &ProviderCode,
    ) -> Result<bool, MfaError> {
        match self.authorize(ctx, provider).await {
            Ok(_) => Ok(true),
            Err(MfaError::AuthorizationDenied) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Providers the session's principal can verify with.
    pub async fn enabled_providers(
        &self,
        ctx: &SessionContext,
    ) -> Result<Vec<ProviderCode>, MfaError> {
        let principal = self.resolve_principal(ctx).await?;
        self.registry.enabled_providers(&principal).await
    }

    /// Attempt second-factor verification for the ambient session.
    ///
    /// Gating runs first on every call; a refused caller never reaches the
    /// engine and gets `AuthorizationDenied`, not a failed outcome.
    #[tracing::instrument(
        skip(self, ctx, params),
        fields(provider = %provider, session_id = ctx.session_id.as_deref().unwrap_or("-"))
    )]
    pub async fn attempt_verification(
        &self,
        ctx: &SessionContext,
        provider: &ProviderCode,
        params: HashMap<String, String>,
    ) -> Result<VerificationAttempt, MfaError> {
        let Some(session_id) = ctx.session_id.clone() else {
            metrics::record_attempt(provider.as_str(), OUTCOME_DENIED);
            return Err(MfaError::AuthorizationDenied);
        };

        let lease = self.lock_session(&session_id).await;
        let result = self.run_attempt(ctx, &session_id, provider, params).await;
        drop(lease);

        match &result {
            Ok(attempt) => metrics::record_attempt(provider.as_str(), attempt.outcome.as_label()),
            Err(MfaError::AuthorizationDenied) => {
                metrics::record_attempt(provider.as_str(), OUTCOME_DENIED)
            }
            Err(_) => {}
        }

        result
    }

    async fn run_attempt(
        &self,
        ctx: &SessionContext,
        session_id: &str,
        provider: &ProviderCode,
        params: HashMap<String, String>,
    ) -> Result<VerificationAttempt, MfaError> {
        let principal = self.authorize(ctx, provider).await?;
        let engine = self.registry.resolve_engine(provider)?;
        let request = VerificationRequest::from_params(params);

        if !engine.verify(&principal, &request).await {
            tracing::info!(
                principal_id = %principal.principal_id,
                "Second-factor verification failed"
            );
            self.alerts.event(
                ALERT_MODULE,
                &format!("{} auth invalid token", provider),
                Severity::Warning,
                &principal.user_name,
            );
            return Ok(VerificationAttempt {
                outcome: VerificationOutcome::invalid_code(),
                trust: None,
            });
        }

        // Both side effects are attempted; only elevation decides the outcome.
        let trust = if request.remember_device() {
            self.grant_trust_best_effort(provider, &principal, ctx).await
        } else {
            None
        };

        self.session.grant_access(session_id, &principal).await?;

        tracing::info!(
            principal_id = %principal.principal_id,
            device_trusted = trust.is_some(),
            "Second-factor verification succeeded"
        );

        Ok(VerificationAttempt {
            outcome: VerificationOutcome::Success,
            trust,
        })
    }

    async fn resolve_principal(&self, ctx: &SessionContext) -> Result<Principal, MfaError> {
        self.resolver
            .resolve_principal(ctx)
            .await?
            .ok_or(MfaError::AuthorizationDenied)
    }

    async fn authorize(
        &self,
        ctx: &SessionContext,
        provider: &ProviderCode,
    ) -> Result<Principal, MfaError> {
        let principal = self.resolve_principal(ctx).await?;
        if !self.registry.is_allowed(&principal, provider).await? {
            tracing::info!(
                principal_id = %principal.principal_id,
                provider = %provider,
                "Provider not enabled or not activated for principal"
            );
            return Err(MfaError::AuthorizationDenied);
        }
        Ok(principal)
    }

    async fn grant_trust_best_effort(
        &self,
        provider: &ProviderCode,
        principal: &Principal,
        ctx: &SessionContext,
    ) -> Option<TrustGrant> {
        let grant = self
            .trusted_devices
            .grant_trust(provider, principal, &ctx.request);

        match tokio::time::timeout(self.side_effect_timeout, grant).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(e)) => {
                tracing::warn!(
                    error = %e,
                    principal_id = %principal.principal_id,
                    "Failed to remember trusted device, continuing"
                );
                None
            }
            Err(_) => {
                tracing::warn!(
                    principal_id = %principal.principal_id,
                    timeout_ms = self.side_effect_timeout.as_millis() as u64,
                    "Remembering trusted device timed out, continuing"
                );
                None
            }
        }
    }

    /// Wait for exclusive use of the session. The lease is released on
    /// drop, including when the attempt future is cancelled mid-flight.
    async fn lock_session(&self, session_id: &str) -> SessionLease<'_> {
        let lock = self
            .session_locks
            .entry(session_id.to_string())
            .or_default()
            .clone();

        let mut lease = SessionLease {
            locks: &self.session_locks,
            session_id: session_id.to_string(),
            lock: Some(lock.clone()),
            guard: None,
        };
        lease.guard = Some(lock.lock_owned().await);
        lease
    }
}

struct SessionLease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    session_id: String,
    lock: Option<Arc<Mutex<()>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.lock.take();
        // Only the map's own reference left: nobody holds or waits on it.
        self.locks
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
