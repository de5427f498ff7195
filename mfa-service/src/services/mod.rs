//! Services layer for mfa-service.
//!
//! The verification core and the collaborator interfaces it drives, with
//! Redis and in-memory bindings for each.

mod alert;
mod clock;
mod engine;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod redis;
mod registry;
mod session;
mod trusted_device;

pub use alert::{AlertWriter, MockAlertWriter, SecurityAlertSink};
pub use clock::{Clock, MockClock, SystemClock};
pub use engine::{HttpVerificationEngine, MockVerificationEngine, VerificationEngine};
pub use error::MfaError;
pub use orchestrator::{VerificationAttempt, VerificationOrchestrator, ALERT_MODULE};
pub use self::redis::{HealthCheck, MockHealth, RedisService};
pub use registry::{EnrollmentStore, MockEnrollmentStore, ProviderRegistry};
pub use session::{
    MockSessionStore, PrincipalResolver, SecondFactorSession, SessionPrincipalResolver,
    SessionStore,
};
pub use trusted_device::{
    hash_device_token, MockTrustStore, TrustGrant, TrustStore, TrustedDeviceManager,
};
