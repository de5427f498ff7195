//! Provider registry and access gating.
//!
//! Engines are registered by code; adding a provider is one `register` call.
//! Whether a principal may use a provider is decided fresh on every call.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::{MfaError, VerificationEngine};
use crate::models::{Principal, ProviderCode};

/// Per-principal factor state, owned by the enrollment flow.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Providers an administrator enabled for this principal.
    async fn enabled_providers(&self, principal_id: &str)
        -> Result<Vec<ProviderCode>, anyhow::Error>;

    /// Whether the principal finished setting the provider up.
    async fn is_activated(
        &self,
        principal_id: &str,
        provider: &ProviderCode,
    ) -> Result<bool, anyhow::Error>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    engines: HashMap<ProviderCode, Arc<dyn VerificationEngine>>,
    /// Service-wide allow-list; empty means every registered provider.
    allowed: HashSet<ProviderCode>,
    enrollments: Arc<dyn EnrollmentStore>,
}

impl ProviderRegistry {
    pub fn new(enrollments: Arc<dyn EnrollmentStore>) -> Self {
        Self {
            engines: HashMap::new(),
            allowed: HashSet::new(),
            enrollments,
        }
    }

    pub fn with_allowed<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = ProviderCode>,
    {
        self.allowed = codes.into_iter().collect();
        self
    }

    pub fn register(
        &mut self,
        code: ProviderCode,
        engine: Arc<dyn VerificationEngine>,
    ) -> &mut Self {
        if self.engines.insert(code.clone(), engine).is_some() {
            tracing::warn!(provider = %code, "Replacing registered verification engine");
        }
        self
    }

    pub fn is_registered(&self, code: &ProviderCode) -> bool {
        self.engines.contains_key(code)
    }

    pub fn resolve_engine(
        &self,
        code: &ProviderCode,
    ) -> Result<Arc<dyn VerificationEngine>, MfaError> {
        self.engines
            .get(code)
            .cloned()
            .ok_or_else(|| MfaError::UnknownProvider(code.clone()))
    }

    fn globally_allowed(&self, code: &ProviderCode) -> bool {
        self.allowed.is_empty() || self.allowed.contains(code)
    }

    /// True iff the provider is enabled for the principal and activated by it.
    ///
    /// An unregistered code is a configuration fault and is returned as
    /// `UnknownProvider`, not as `false`.
    pub async fn is_allowed(
        &self,
        principal: &Principal,
        code: &ProviderCode,
    ) -> Result<bool, MfaError> {
        if !self.is_registered(code) {
            return Err(MfaError::UnknownProvider(code.clone()));
        }

        if !self.globally_allowed(code) {
            return Ok(false);
        }

        let enabled = self
            .enrollments
            .enabled_providers(&principal.principal_id)
            .await?;
        if !enabled.contains(code) {
            return Ok(false);
        }

        Ok(self
            .enrollments
            .is_activated(&principal.principal_id, code)
            .await?)
    }

    /// Registered providers the principal may use right now, sorted by code.
    pub async fn enabled_providers(
        &self,
        principal: &Principal,
    ) -> Result<Vec<ProviderCode>, MfaError> {
        let mut result = Vec::new();
        for code in self
            .enrollments
            .enabled_providers(&principal.principal_id)
            .await?
        {
            if self.is_registered(&code)
                && self.globally_allowed(&code)
                && self
                    .enrollments
                    .is_activated(&principal.principal_id, &code)
                    .await?
            {
                result.push(code);
            }
        }
        result.sort();
        result.dedup();
        Ok(result)
    }
}

/// In-memory enrollment store: provider -> activated flag, per principal.
#[derive(Default)]
pub struct MockEnrollmentStore {
    enrollments: Mutex<HashMap<String, BTreeMap<ProviderCode, bool>>>,
}

impl MockEnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, principal_id: &str, provider: &str) {
        if let Ok(mut map) = self.enrollments.lock() {
            map.entry(principal_id.to_string())
                .or_default()
                .entry(ProviderCode::new(provider))
                .or_insert(false);
        }
    }

    pub fn activate(&self, principal_id: &str, provider: &str) {
        if let Ok(mut map) = self.enrollments.lock() {
            map.entry(principal_id.to_string())
                .or_default()
                .insert(ProviderCode::new(provider), true);
        }
    }
}

#[async_trait]
impl EnrollmentStore for MockEnrollmentStore {
    async fn enabled_providers(
        &self,
        principal_id: &str,
    ) -> Result<Vec<ProviderCode>, anyhow::Error> {
        let map = self
            .enrollments
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock enrollment mutex poisoned: {}", e))?;
        Ok(map
            .get(principal_id)
            .map(|providers| providers.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn is_activated(
        &self,
        principal_id: &str,
        provider: &ProviderCode,
    ) -> Result<bool, anyhow::Error> {
        let map = self
            .enrollments
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock enrollment mutex poisoned: {}", e))?;
        Ok(map
            .get(principal_id)
            .and_then(|providers| providers.get(provider))
            .copied()
            .unwrap_or(false))
    }
}
