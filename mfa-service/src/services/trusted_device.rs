//! Trusted-device manager.
//!
//! After a successful verification with "remember this device", the device
//! is recorded for a bounded period so later logins from it can skip the
//! second factor. Remembering is a convenience: callers treat every error
//! from here as non-fatal.

use async_trait::async_trait;
use chrono::Duration;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;

use super::{Clock, MfaError};
use crate::models::{Principal, ProviderCode, RequestContext, TrustRecord};

const DEVICE_TOKEN_BYTES: usize = 32;

#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn find(
        &self,
        principal_id: &str,
        provider: &ProviderCode,
        device_fingerprint: &str,
    ) -> Result<Option<TrustRecord>, anyhow::Error>;

    /// Store `record` unless a live record exists for the same triple.
    /// Returns whether it was stored.
    async fn insert_if_absent(
        &self,
        record: &TrustRecord,
        ttl_seconds: i64,
    ) -> Result<bool, anyhow::Error>;

    /// Store `record`, overwriting any record for the same triple.
    async fn replace(&self, record: &TrustRecord, ttl_seconds: i64) -> Result<(), anyhow::Error>;

    async fn remove_all(
        &self,
        principal_id: &str,
        provider: &ProviderCode,
    ) -> Result<u64, anyhow::Error>;
}

/// Result of a grant. `device_token` is only set when a token was issued;
/// the transport hands it to the client as a long-lived cookie.
#[derive(Debug, Clone)]
pub struct TrustGrant {
    pub record: TrustRecord,
    pub device_token: Option<String>,
}

#[derive(Clone)]
pub struct TrustedDeviceManager {
    store: Arc<dyn TrustStore>,
    clock: Arc<dyn Clock>,
    enabled: bool,
    lifetime: Duration,
}

impl TrustedDeviceManager {
    pub fn new(
        store: Arc<dyn TrustStore>,
        clock: Arc<dyn Clock>,
        enabled: bool,
        lifetime: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            enabled,
            lifetime,
        }
    }

    /// Remember the requesting device for `provider`.
    ///
    /// Idempotent within the validity window: a live record whose token the
    /// caller presents is returned as-is. A live record the caller cannot
    /// prove (lost or stale cookie) is replaced with a freshly issued token,
    /// so there is still one record per device. Returns `None` when trusted
    /// devices are disabled or the request carries no device fingerprint.
    #[tracing::instrument(skip(self, principal, ctx), fields(provider = %provider, principal_id = %principal.principal_id))]
    pub async fn grant_trust(
        &self,
        provider: &ProviderCode,
        principal: &Principal,
        ctx: &RequestContext,
    ) -> Result<Option<TrustGrant>, MfaError> {
        if !self.enabled {
            tracing::debug!("Trusted devices disabled, not remembering device");
            return Ok(None);
        }

        let Some(fingerprint) = ctx
            .device_fingerprint
            .as_deref()
            .filter(|fp| !fp.trim().is_empty())
        else {
            tracing::debug!("No device fingerprint on request, not remembering device");
            return Ok(None);
        };

        let now = self.clock.now();

        let live = self
            .store
            .find(&principal.principal_id, provider, fingerprint)
            .await?
            .filter(|existing| existing.is_valid_at(now));

        let token = generate_device_token();
        let record = TrustRecord::new(
            principal.principal_id.clone(),
            provider.clone(),
            fingerprint,
            hash_device_token(&token),
            now,
            self.lifetime,
        );

        if let Some(existing) = live {
            if token_matches(ctx.device_token.as_deref(), &existing.token_hash) {
                return Ok(Some(TrustGrant {
                    record: existing,
                    device_token: None,
                }));
            }

            self.store
                .replace(&record, record.remaining_seconds(now))
                .await?;
            tracing::info!(
                record_id = %record.record_id,
                replaced_record_id = %existing.record_id,
                expiry_utc = %record.expiry_utc,
                "Device token reissued"
            );
            return Ok(Some(TrustGrant {
                record,
                device_token: Some(token),
            }));
        }

        if self
            .store
            .insert_if_absent(&record, record.remaining_seconds(now))
            .await?
        {
            tracing::info!(
                record_id = %record.record_id,
                expiry_utc = %record.expiry_utc,
                "Device trusted"
            );
            return Ok(Some(TrustGrant {
                record,
                device_token: Some(token),
            }));
        }

        // A concurrent grant for the same device won; hand back its record.
        let existing = self
            .store
            .find(&principal.principal_id, provider, fingerprint)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Trust record missing after conflicting insert"))?;

        Ok(Some(TrustGrant {
            record: existing,
            device_token: None,
        }))
    }

    /// Whether the device presenting `ctx` holds a live trust record.
    pub async fn is_trusted(
        &self,
        provider: &ProviderCode,
        principal_id: &str,
        ctx: &RequestContext,
    ) -> Result<bool, MfaError> {
        let (Some(fingerprint), Some(token)) =
            (ctx.device_fingerprint.as_deref(), ctx.device_token.as_deref())
        else {
            return Ok(false);
        };

        let Some(record) = self.store.find(principal_id, provider, fingerprint).await? else {
            return Ok(false);
        };

        Ok(token_matches(Some(token), &record.token_hash) && record.is_valid_at(self.clock.now()))
    }

    /// Forget every trusted device of the principal for `provider`.
    pub async fn revoke(&self, principal_id: &str, provider: &ProviderCode) -> Result<u64, MfaError> {
        let removed = self.store.remove_all(principal_id, provider).await?;
        tracing::info!(
            principal_id = %principal_id,
            provider = %provider,
            removed,
            "Trusted devices revoked"
        );
        Ok(removed)
    }
}

/// Constant-time check of a presented clear token against a stored hash.
fn token_matches(presented: Option<&str>, token_hash: &str) -> bool {
    let Some(token) = presented else {
        return false;
    };
    hash_device_token(token)
        .as_bytes()
        .ct_eq(token_hash.as_bytes())
        .into()
}

fn generate_device_token() -> String {
    let mut bytes = [0u8; DEVICE_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a device token for storage.
pub fn hash_device_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

type TrustKey = (String, ProviderCode, String);

/// In-memory trust store. `set_unavailable(true)` makes every call fail.
#[derive(Default)]
pub struct MockTrustStore {
    records: Mutex<HashMap<TrustKey, TrustRecord>>,
    unavailable: AtomicBool,
}

impl MockTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), anyhow::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Trust store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl TrustStore for MockTrustStore {
    async fn find(
        &self,
        principal_id: &str,
        provider: &ProviderCode,
        device_fingerprint: &str,
    ) -> Result<Option<TrustRecord>, anyhow::Error> {
        self.check_available()?;
        let records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock trust store mutex poisoned: {}", e))?;
        Ok(records
            .get(&(
                principal_id.to_string(),
                provider.clone(),
                device_fingerprint.to_string(),
            ))
            .cloned())
    }

    async fn insert_if_absent(
        &self,
        record: &TrustRecord,
        _ttl_seconds: i64,
    ) -> Result<bool, anyhow::Error> {
        self.check_available()?;
        let mut records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock trust store mutex poisoned: {}", e))?;
        let key = (
            record.principal_id.clone(),
            record.provider_code.clone(),
            record.device_fingerprint.clone(),
        );
        match records.get(&key) {
            Some(existing) if existing.is_valid_at(record.created_utc) => Ok(false),
            _ => {
                records.insert(key, record.clone());
                Ok(true)
            }
        }
    }

    async fn replace(&self, record: &TrustRecord, _ttl_seconds: i64) -> Result<(), anyhow::Error> {
        self.check_available()?;
        let mut records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock trust store mutex poisoned: {}", e))?;
        records.insert(
            (
                record.principal_id.clone(),
                record.provider_code.clone(),
                record.device_fingerprint.clone(),
            ),
            record.clone(),
        );
        Ok(())
    }

    async fn remove_all(
        &self,
        principal_id: &str,
        provider: &ProviderCode,
    ) -> Result<u64, anyhow::Error> {
        self.check_available()?;
        let mut records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock trust store mutex poisoned: {}", e))?;
        let before = records.len();
        records.retain(|(p, code, _), _| !(p == principal_id && code == provider));
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MockClock;

    fn setup(enabled: bool) -> (TrustedDeviceManager, Arc<MockTrustStore>, Arc<MockClock>) {
        let store = Arc::new(MockTrustStore::new());
        let clock = Arc::new(MockClock::default());
        let manager = TrustedDeviceManager::new(store.clone(), clock.clone(), enabled, Duration::days(30));
        (manager, store, clock)
    }

    fn device(fingerprint: &str) -> RequestContext {
        RequestContext {
            device_fingerprint: Some(fingerprint.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_grant_creates_record_and_token() {
        let (manager, store, _) = setup(true);
        let principal = Principal::new("p1", "alice");
        let provider = ProviderCode::from("google");

        let grant = manager
            .grant_trust(&provider, &principal, &device("laptop"))
            .await
            .unwrap()
            .expect("grant");

        let token = grant.device_token.expect("new token");
        assert_eq!(grant.record.token_hash, hash_device_token(&token));
        assert_eq!(store.len(), 1);

        let ctx = RequestContext {
            device_token: Some(token),
            ..device("laptop")
        };
        assert!(manager.is_trusted(&provider, "p1", &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_grant_is_idempotent_within_window() {
        let (manager, store, _) = setup(true);
        let principal = Principal::new("p1", "alice");
        let provider = ProviderCode::from("google");

        let first = manager
            .grant_trust(&provider, &principal, &device("laptop"))
            .await
            .unwrap()
            .unwrap();
        let returning = RequestContext {
            device_token: first.device_token.clone(),
            ..device("laptop")
        };
        let second = manager
            .grant_trust(&provider, &principal, &returning)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.record.record_id, second.record.record_id);
        assert!(second.device_token.is_none());
        assert_eq!(store.len(), 1);
        assert!(manager.is_trusted(&provider, "p1", &returning).await.unwrap());
    }

    #[tokio::test]
    async fn test_regrant_without_cookie_reissues_token() {
        let (manager, store, _) = setup(true);
        let principal = Principal::new("p1", "alice");
        let provider = ProviderCode::from("google");

        let first = manager
            .grant_trust(&provider, &principal, &device("laptop"))
            .await
            .unwrap()
            .unwrap();
        let old_token = first.device_token.clone().expect("first token");

        // Cookie lost: same device asks to be remembered again.
        let second = manager
            .grant_trust(&provider, &principal, &device("laptop"))
            .await
            .unwrap()
            .unwrap();
        let new_token = second.device_token.clone().expect("reissued token");

        assert_ne!(first.record.record_id, second.record.record_id);
        assert_ne!(old_token, new_token);
        assert_eq!(store.len(), 1);

        let with_new = RequestContext {
            device_token: Some(new_token),
            ..device("laptop")
        };
        let with_old = RequestContext {
            device_token: Some(old_token),
            ..device("laptop")
        };
        assert!(manager.is_trusted(&provider, "p1", &with_new).await.unwrap());
        assert!(!manager.is_trusted(&provider, "p1", &with_old).await.unwrap());
    }

    #[tokio::test]
    async fn test_regrant_with_stale_token_reissues_token() {
        let (manager, _, _) = setup(true);
        let principal = Principal::new("p1", "alice");
        let provider = ProviderCode::from("google");

        manager
            .grant_trust(&provider, &principal, &device("laptop"))
            .await
            .unwrap();

        let stale = RequestContext {
            device_token: Some("stale-cookie".to_string()),
            ..device("laptop")
        };
        let grant = manager
            .grant_trust(&provider, &principal, &stale)
            .await
            .unwrap()
            .unwrap();
        assert!(grant.device_token.is_some());
    }

    #[tokio::test]
    async fn test_expired_record_is_replaced() {
        let (manager, store, clock) = setup(true);
        let principal = Principal::new("p1", "alice");
        let provider = ProviderCode::from("google");

        let first = manager
            .grant_trust(&provider, &principal, &device("laptop"))
            .await
            .unwrap()
            .unwrap();
        clock.advance(Duration::days(31));
        let second = manager
            .grant_trust(&provider, &principal, &device("laptop"))
            .await
            .unwrap()
            .unwrap();

        assert_ne!(first.record.record_id, second.record.record_id);
        assert!(second.device_token.is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_or_missing_fingerprint_is_noop() {
        let (manager, store, _) = setup(false);
        let principal = Principal::new("p1", "alice");
        let provider = ProviderCode::from("google");
        assert!(manager
            .grant_trust(&provider, &principal, &device("laptop"))
            .await
            .unwrap()
            .is_none());

        let (manager, _, _) = setup(true);
        assert!(manager
            .grant_trust(&provider, &principal, &RequestContext::default())
            .await
            .unwrap()
            .is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_token_or_expiry_is_not_trusted() {
        let (manager, _, clock) = setup(true);
        let principal = Principal::new("p1", "alice");
        let provider = ProviderCode::from("google");
        let grant = manager
            .grant_trust(&provider, &principal, &device("laptop"))
            .await
            .unwrap()
            .unwrap();

        let forged = RequestContext {
            device_token: Some("not-the-token".to_string()),
            ..device("laptop")
        };
        assert!(!manager.is_trusted(&provider, "p1", &forged).await.unwrap());

        let genuine = RequestContext {
            device_token: grant.device_token,
            ..device("laptop")
        };
        clock.advance(Duration::days(30));
        assert!(!manager.is_trusted(&provider, "p1", &genuine).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_removes_provider_records() {
        let (manager, store, _) = setup(true);
        let principal = Principal::new("p1", "alice");
        let google = ProviderCode::from("google");
        let totp = ProviderCode::from("totp");
        manager.grant_trust(&google, &principal, &device("a")).await.unwrap();
        manager.grant_trust(&google, &principal, &device("b")).await.unwrap();
        manager.grant_trust(&totp, &principal, &device("a")).await.unwrap();

        assert_eq!(manager.revoke("p1", &google).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_collaborator_error() {
        let (manager, store, _) = setup(true);
        store.set_unavailable(true);
        let result = manager
            .grant_trust(
                &ProviderCode::from("google"),
                &Principal::new("p1", "alice"),
                &device("laptop"),
            )
            .await;
        assert!(matches!(result, Err(MfaError::CollaboratorUnavailable(_))));
    }
}
