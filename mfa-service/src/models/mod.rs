//! Domain models for mfa-service.

mod alert_event;
mod context;
mod principal;
mod provider;
mod session_state;
mod trust_record;
mod verification;

pub use alert_event::{AlertEvent, Severity};
pub use context::{RequestContext, SessionContext};
pub use principal::Principal;
pub use provider::ProviderCode;
pub use session_state::SessionState;
pub use trust_record::TrustRecord;
pub use verification::{
    VerificationOutcome, VerificationRequest, VerificationResponse, CODE_PARAM,
    FALLBACK_CODE_PARAM, INVALID_CODE_MESSAGE, TRUST_DEVICE_PARAM,
};
