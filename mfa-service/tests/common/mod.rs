//! Shared setup for mfa-service router tests.
//!
//! Wires the real router to in-memory collaborators so every test runs
//! without Redis or a remote verifier.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use mfa_service::{
    build_router,
    config::{Environment, MfaConfig, MfaSettings, RedisConfig},
    models::{Principal, ProviderCode},
    services::{
        MockAlertWriter, MockClock, MockEnrollmentStore, MockHealth, MockSessionStore,
        MockTrustStore, MockVerificationEngine, ProviderRegistry, SecondFactorSession,
        SecurityAlertSink, SessionPrincipalResolver, TrustedDeviceManager,
        VerificationOrchestrator,
    },
    AppState,
};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

pub const SESSION_ID: &str = "session-alice";
pub const PRINCIPAL_ID: &str = "principal-alice";
pub const USER_NAME: &str = "alice";
pub const VALID_CODE: &str = "492039";
pub const FINGERPRINT: &str = "device-fp-1";

pub fn test_config() -> MfaConfig {
    MfaConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "mfa-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        redis: RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
        },
        mfa: MfaSettings {
            allowed_providers: vec!["google".to_string(), "totp".to_string()],
            verifier_url: "http://localhost:8091".to_string(),
            verifier_timeout_ms: 2000,
            trust_devices_enabled: true,
            trust_lifetime_days: 30,
            side_effect_timeout_ms: 500,
            alert_queue_capacity: 16,
            cookie_secure: true,
        },
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub engine: Arc<MockVerificationEngine>,
    pub sessions: Arc<MockSessionStore>,
    pub enrollments: Arc<MockEnrollmentStore>,
    pub trust: Arc<MockTrustStore>,
    pub alerts: Arc<MockAlertWriter>,
}

impl TestApp {
    /// Alice has an open session and an active `totp` enrollment.
    /// `google` is registered but not activated for her.
    pub async fn spawn() -> Self {
        let config = test_config();
        let clock = Arc::new(MockClock::default());
        let engine = Arc::new(MockVerificationEngine::new().with_code(PRINCIPAL_ID, VALID_CODE));

        let sessions = Arc::new(MockSessionStore::new());
        sessions.open(SESSION_ID, Principal::new(PRINCIPAL_ID, USER_NAME));

        let enrollments = Arc::new(MockEnrollmentStore::new());
        enrollments.enable(PRINCIPAL_ID, "totp");
        enrollments.activate(PRINCIPAL_ID, "totp");
        enrollments.enable(PRINCIPAL_ID, "google");

        let trust = Arc::new(MockTrustStore::new());
        let alerts = Arc::new(MockAlertWriter::new());

        let mut registry = ProviderRegistry::new(enrollments.clone()).with_allowed(
            config
                .mfa
                .allowed_providers
                .iter()
                .map(|code| ProviderCode::new(code.as_str())),
        );
        registry.register(ProviderCode::from("totp"), engine.clone());
        registry.register(ProviderCode::from("google"), engine.clone());

        let orchestrator = VerificationOrchestrator::new(
            Arc::new(SessionPrincipalResolver::new(sessions.clone())),
            registry,
            TrustedDeviceManager::new(
                trust.clone(),
                clock.clone(),
                config.mfa.trust_devices_enabled,
                config.mfa.trust_lifetime(),
            ),
            SecondFactorSession::new(sessions.clone(), clock),
            SecurityAlertSink::spawn(
                alerts.clone(),
                config.mfa.alert_queue_capacity,
                Duration::from_secs(1),
            ),
            config.mfa.side_effect_timeout(),
        );

        let state = AppState {
            config,
            orchestrator: Arc::new(orchestrator),
            health: Arc::new(MockHealth),
        };

        let router = build_router(state.clone())
            .await
            .expect("Failed to build router");

        Self {
            router,
            state,
            engine,
            sessions,
            enrollments,
            trust,
            alerts,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed to respond")
    }
}

pub fn verify_request(provider: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/mfa/{}/verify", provider))
        .header("content-type", "application/json")
        .header("x-session-id", SESSION_ID)
        .header("x-device-fingerprint", FINGERPRINT)
        .extension(axum::extract::ConnectInfo(std::net::SocketAddr::from((
            [127, 0, 0, 1],
            8080,
        ))))
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
