//! Redis bindings for the session, trust, enrollment and alert interfaces.
//!
//! Sessions and enrollments are written by other flows (login, factor
//! setup); this service only reads them and flips the verified flag.
//!
//! A session is a hash (`principal_id`, `user_name`, `created_utc`,
//! `second_factor_verified`, `verified_utc`). Only the two verification
//! fields are ever written here, so fields the login flow writes
//! concurrently are never overwritten.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, Client, Script};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use super::{AlertWriter, EnrollmentStore, SessionStore, TrustStore};
use crate::models::{AlertEvent, Principal, ProviderCode, SessionState, TrustRecord};

const SESSION_PREFIX: &str = "mfa:session";
const TRUST_PREFIX: &str = "mfa:trust";
const ENROLLMENT_PREFIX: &str = "mfa:enrollment";
const ALERTS_KEY: &str = "mfa:security_alerts";
const ALERTS_MAX_LEN: isize = 10_000;
const SCAN_BATCH: usize = 100;

const ENROLLMENT_ACTIVE: &str = "active";

const FIELD_PRINCIPAL_ID: &str = "principal_id";
const FIELD_USER_NAME: &str = "user_name";
const FIELD_CREATED_UTC: &str = "created_utc";
const FIELD_VERIFIED: &str = "second_factor_verified";
const FIELD_VERIFIED_UTC: &str = "verified_utc";

/// Check-and-set in one step: missing session -> 0, otherwise elevate once
/// (keeping the first verification time) and return 1.
const MARK_VERIFIED_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
if redis.call('HGET', KEYS[1], ARGV[1]) ~= '1' then
    redis.call('HSET', KEYS[1], ARGV[1], '1', ARGV[2], ARGV[3])
end
return 1
"#;

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

fn session_key(session_id: &str) -> String {
    format!("{}:{}", SESSION_PREFIX, session_id)
}

/// Fingerprints are client-supplied; hashing keeps keys bounded and free of
/// separators.
fn trust_key(principal_id: &str, provider: &ProviderCode, device_fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(device_fingerprint.as_bytes());
    format!(
        "{}:{}:{}:{}",
        TRUST_PREFIX,
        principal_id,
        provider,
        hex::encode(hasher.finalize())
    )
}

fn enrollment_key(principal_id: &str) -> String {
    format!("{}:{}", ENROLLMENT_PREFIX, principal_id)
}

fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl HealthCheck for RedisService {
    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

#[async_trait]
impl SessionStore for RedisService {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(session_key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load session: {}", e))?;

        session_from_fields(session_id, &fields)
    }

    async fn mark_verified(
        &self,
        session_id: &str,
        verified_utc: DateTime<Utc>,
    ) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let found: i64 = Script::new(MARK_VERIFIED_LUA)
            .key(session_key(session_id))
            .arg(FIELD_VERIFIED)
            .arg(FIELD_VERIFIED_UTC)
            .arg(verified_utc.to_rfc3339())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to mark session verified: {}", e))?;

        if found == 0 {
            return Err(anyhow::anyhow!("Session {} not found", session_id));
        }
        Ok(())
    }

    async fn clear_verified(&self, session_id: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = session_key(session_id);
        // HSET on a missing key would create a bare session; skip those.
        let exists: bool = redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read session: {}", e))?;
        if !exists {
            return Ok(());
        }

        redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&key)
            .arg(FIELD_VERIFIED)
            .arg("0")
            .ignore()
            .cmd("HDEL")
            .arg(&key)
            .arg(FIELD_VERIFIED_UTC)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to clear session verification: {}", e))
    }
}

fn parse_utc(session_id: &str, field: &str, raw: &str) -> Result<DateTime<Utc>, anyhow::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| anyhow::anyhow!("Corrupt session {} field {}: {}", session_id, field, e))
}

fn session_from_fields(
    session_id: &str,
    fields: &HashMap<String, String>,
) -> Result<Option<SessionState>, anyhow::Error> {
    if fields.is_empty() {
        return Ok(None);
    }

    let required = |field: &str| {
        fields
            .get(field)
            .ok_or_else(|| anyhow::anyhow!("Corrupt session {}: missing {}", session_id, field))
    };

    let principal = Principal::new(
        required(FIELD_PRINCIPAL_ID)?.as_str(),
        required(FIELD_USER_NAME)?.as_str(),
    );
    let created_utc = parse_utc(session_id, FIELD_CREATED_UTC, required(FIELD_CREATED_UTC)?)?;
    let verified_utc = fields
        .get(FIELD_VERIFIED_UTC)
        .map(|raw| parse_utc(session_id, FIELD_VERIFIED_UTC, raw))
        .transpose()?;

    Ok(Some(SessionState {
        session_id: session_id.to_string(),
        principal,
        second_factor_verified: fields.get(FIELD_VERIFIED).map(String::as_str) == Some("1"),
        verified_utc,
        created_utc,
    }))
}

#[async_trait]
impl TrustStore for RedisService {
    async fn find(
        &self,
        principal_id: &str,
        provider: &ProviderCode,
        device_fingerprint: &str,
    ) -> Result<Option<TrustRecord>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(trust_key(principal_id, provider, device_fingerprint))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read trust record: {}", e))?;

        raw.map(|json| {
            serde_json::from_str(&json)
                .map_err(|e| anyhow::anyhow!("Corrupt trust record: {}", e))
        })
        .transpose()
    }

    async fn insert_if_absent(
        &self,
        record: &TrustRecord,
        ttl_seconds: i64,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(record)?;
        // Expiry is enforced by the key TTL, so "absent" already means "no live record".
        let stored: Option<String> = redis::cmd("SET")
            .arg(trust_key(
                &record.principal_id,
                &record.provider_code,
                &record.device_fingerprint,
            ))
            .arg(json)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to store trust record: {}", e))?;

        Ok(stored.is_some())
    }

    async fn replace(&self, record: &TrustRecord, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(record)?;
        redis::cmd("SET")
            .arg(trust_key(
                &record.principal_id,
                &record.provider_code,
                &record.device_fingerprint,
            ))
            .arg(json)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to replace trust record: {}", e))
    }

    async fn remove_all(
        &self,
        principal_id: &str,
        provider: &ProviderCode,
    ) -> Result<u64, anyhow::Error> {
        let mut conn = self.manager.clone();
        let pattern = format!(
            "{}:{}:{}:*",
            TRUST_PREFIX,
            escape_glob(principal_id),
            escape_glob(provider.as_str())
        );

        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to scan trust records: {}", e))?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to delete trust records: {}", e))?;
                removed += deleted;
            }

            if next == 0 {
                return Ok(removed);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl EnrollmentStore for RedisService {
    async fn enabled_providers(
        &self,
        principal_id: &str,
    ) -> Result<Vec<ProviderCode>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let codes: Vec<String> = redis::cmd("HKEYS")
            .arg(enrollment_key(principal_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read enrollments: {}", e))?;
        Ok(codes.into_iter().map(ProviderCode::from).collect())
    }

    async fn is_activated(
        &self,
        principal_id: &str,
        provider: &ProviderCode,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let state: Option<String> = redis::cmd("HGET")
            .arg(enrollment_key(principal_id))
            .arg(provider.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read enrollment: {}", e))?;
        Ok(state.as_deref() == Some(ENROLLMENT_ACTIVE))
    }
}

#[async_trait]
impl AlertWriter for RedisService {
    async fn write(&self, event: &AlertEvent) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(event)?;
        redis::pipe()
            .cmd("LPUSH")
            .arg(ALERTS_KEY)
            .arg(json)
            .ignore()
            .cmd("LTRIM")
            .arg(ALERTS_KEY)
            .arg(0)
            .arg(ALERTS_MAX_LEN - 1)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to push security alert: {}", e))
    }
}

/// Health check for in-memory wiring.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockHealth;

#[async_trait]
impl HealthCheck for MockHealth {
    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_key_hashes_fingerprint() {
        let key = trust_key("42", &ProviderCode::from("google"), "device:with:colons");
        assert!(key.starts_with("mfa:trust:42:google:"));
        assert_eq!(key.matches(':').count(), 4);
    }

    fn session_fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_session_from_fields() {
        assert!(session_from_fields("s1", &HashMap::new()).unwrap().is_none());

        let fields = session_fields(&[
            ("principal_id", "p1"),
            ("user_name", "alice"),
            ("created_utc", "2024-05-01T10:00:00Z"),
            ("login_ip", "10.0.0.1"),
        ]);
        let state = session_from_fields("s1", &fields).unwrap().unwrap();
        assert_eq!(state.principal, Principal::new("p1", "alice"));
        assert!(!state.second_factor_verified);
        assert!(state.verified_utc.is_none());

        let mut fields = fields;
        fields.insert("second_factor_verified".to_string(), "1".to_string());
        fields.insert("verified_utc".to_string(), "2024-05-01T10:01:00Z".to_string());
        let state = session_from_fields("s1", &fields).unwrap().unwrap();
        assert!(state.second_factor_verified);
        assert!(state.verified_utc.is_some());

        let broken = session_fields(&[("principal_id", "p1")]);
        assert!(session_from_fields("s1", &broken).is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_mark_verified_keeps_concurrent_session_writes() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let redis = RedisService::new(&crate::config::RedisConfig { url })
            .await
            .expect("Failed to connect to Redis");
        let session_id = format!("test-{}", uuid::Uuid::new_v4());
        let key = session_key(&session_id);
        let mut conn = redis.manager.clone();

        let _: () = redis::cmd("HSET")
            .arg(&key)
            .arg("principal_id")
            .arg("p1")
            .arg("user_name")
            .arg("alice")
            .arg("created_utc")
            .arg(Utc::now().to_rfc3339())
            .query_async(&mut conn)
            .await
            .unwrap();

        // The login flow writes its own field while elevation runs.
        let login_write = async {
            let mut conn = redis.manager.clone();
            let _: () = redis::cmd("HSET")
                .arg(&key)
                .arg("login_ip")
                .arg("10.0.0.1")
                .query_async(&mut conn)
                .await
                .unwrap();
        };
        let (elevated, _) = tokio::join!(redis.mark_verified(&session_id, Utc::now()), login_write);
        elevated.unwrap();

        let login_ip: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg("login_ip")
            .query_async(&mut conn)
            .await
            .unwrap();
        assert_eq!(login_ip.as_deref(), Some("10.0.0.1"));
        assert!(redis.load(&session_id).await.unwrap().unwrap().second_factor_verified);

        assert!(redis.mark_verified("missing-session", Utc::now()).await.is_err());

        let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await.unwrap();
    }

    #[test]
    fn test_escape_glob() {
        assert_eq!(escape_glob("a*b?[c]"), "a\\*b\\?\\[c\\]");
        assert_eq!(escape_glob("plain-id"), "plain-id");
    }
}
