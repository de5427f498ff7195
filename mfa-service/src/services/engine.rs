//! Verification engines: the per-provider capability that checks a code.
//!
//! Engines never fail outward. A missing enrollment, a malformed secret or an
//! unreachable verifier all read as `false`, so callers cannot tell "wrong
//! code" from "nothing to check against". The cause is logged here instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::models::{Principal, ProviderCode, VerificationRequest};

#[async_trait]
pub trait VerificationEngine: Send + Sync {
    /// Whether the submitted code is currently valid for the principal's
    /// enrolled secret. Side-effect free.
    async fn verify(&self, principal: &Principal, request: &VerificationRequest) -> bool;
}

#[derive(Serialize)]
struct RemoteVerifyRequest<'a> {
    provider: &'a str,
    principal_id: &'a str,
    code: &'a str,
}

#[derive(Deserialize)]
struct RemoteVerifyResponse {
    valid: bool,
}

/// Delegates code checking to a remote verifier that holds the enrolled
/// secrets and the one-time-code math.
#[derive(Clone)]
pub struct HttpVerificationEngine {
    client: reqwest::Client,
    endpoint: String,
    provider: ProviderCode,
}

impl HttpVerificationEngine {
    pub fn new(
        endpoint: &str,
        provider: ProviderCode,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build verifier HTTP client: {}", e))?;

        tracing::info!(
            endpoint = %endpoint,
            provider = %provider,
            "Remote verification engine configured"
        );

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            provider,
        })
    }
}

#[async_trait]
impl VerificationEngine for HttpVerificationEngine {
    async fn verify(&self, principal: &Principal, request: &VerificationRequest) -> bool {
        let Some(code) = request.code() else {
            tracing::debug!(provider = %self.provider, "No code submitted");
            return false;
        };

        let url = format!("{}/v1/verify", self.endpoint);
        let body = RemoteVerifyRequest {
            provider: self.provider.as_str(),
            principal_id: &principal.principal_id,
            code: &code,
        };

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    provider = %self.provider,
                    principal_id = %principal.principal_id,
                    "Verifier unreachable, treating code as invalid"
                );
                return false;
            }
        };

        if !response.status().is_success() {
            tracing::warn!(
                status = %response.status(),
                provider = %self.provider,
                principal_id = %principal.principal_id,
                "Verifier rejected the request, treating code as invalid"
            );
            return false;
        }

        match response.json::<RemoteVerifyResponse>().await {
            Ok(result) => result.valid,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    provider = %self.provider,
                    "Malformed verifier response, treating code as invalid"
                );
                false
            }
        }
    }
}

/// In-memory engine: one accepted code per principal.
pub struct MockVerificationEngine {
    codes: Mutex<HashMap<String, String>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockVerificationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVerificationEngine {
    pub fn new() -> Self {
        Self {
            codes: Mutex::new(HashMap::new()),
            delay: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Simulate a slow secret lookup.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_code(self, principal_id: &str, code: &str) -> Self {
        self.set_code(principal_id, code);
        self
    }

    pub fn set_code(&self, principal_id: &str, code: &str) {
        if let Ok(mut codes) = self.codes.lock() {
            codes.insert(principal_id.to_string(), code.to_string());
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VerificationEngine for MockVerificationEngine {
    async fn verify(&self, principal: &Principal, request: &VerificationRequest) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let expected = self
            .codes
            .lock()
            .ok()
            .and_then(|codes| codes.get(&principal.principal_id).cloned());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match (expected, request.code()) {
            (Some(expected), Some(submitted)) => expected == submitted,
            _ => false,
        }
    }
}
