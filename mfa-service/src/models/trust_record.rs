//! Trusted-device record model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ProviderCode;

/// Binds a (principal, provider, device) triple for a bounded period.
/// Never mutated: a record is created once and then lapses or is revoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub record_id: Uuid,
    pub principal_id: String,
    pub provider_code: ProviderCode,
    pub device_fingerprint: String,
    /// SHA-256 of the device token; the clear token only lives in the cookie.
    pub token_hash: String,
    pub created_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
}

impl TrustRecord {
    pub fn new(
        principal_id: impl Into<String>,
        provider_code: ProviderCode,
        device_fingerprint: impl Into<String>,
        token_hash: String,
        now: DateTime<Utc>,
        lifetime: Duration,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            principal_id: principal_id.into(),
            provider_code,
            device_fingerprint: device_fingerprint.into(),
            token_hash,
            created_utc: now,
            expiry_utc: now + lifetime,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_utc > now
    }

    /// Seconds left before expiry, clamped to zero.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expiry_utc - now).num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_expires_after_lifetime() {
        let now = Utc::now();
        let record = TrustRecord::new(
            "p1",
            ProviderCode::from("google"),
            "device-a",
            "hash".to_string(),
            now,
            Duration::days(30),
        );
        assert!(record.is_valid_at(now + Duration::days(29)));
        assert!(!record.is_valid_at(now + Duration::days(30)));
        assert_eq!(record.remaining_seconds(now + Duration::days(31)), 0);
    }
}
