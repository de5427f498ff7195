use service_core::error::AppError;
use thiserror::Error;

use crate::models::ProviderCode;

#[derive(Error, Debug)]
pub enum MfaError {
    /// No principal behind the session, or the provider is not enabled and
    /// activated for it. Raised before any verification logic runs.
    #[error("Second-factor verification is not allowed for this session")]
    AuthorizationDenied,

    /// A provider code the registry has never heard of: misconfiguration.
    #[error("Unknown MFA provider: {0}")]
    UnknownProvider(ProviderCode),

    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(#[from] anyhow::Error),
}

impl From<MfaError> for AppError {
    fn from(err: MfaError) -> Self {
        match err {
            MfaError::AuthorizationDenied => {
                AppError::Forbidden(anyhow::anyhow!("Not allowed to use this second factor"))
            }
            MfaError::UnknownProvider(code) => {
                tracing::error!(provider = %code, "Request for unregistered MFA provider");
                AppError::NotFound(anyhow::anyhow!("Unknown MFA provider: {}", code))
            }
            MfaError::CollaboratorUnavailable(e) => AppError::InternalError(e),
        }
    }
}
