//! Verification request/outcome models.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Submitted one-time code.
pub const CODE_PARAM: &str = "tfa_code";
/// Accepted when clients post a bare `code` field.
pub const FALLBACK_CODE_PARAM: &str = "code";
/// "Remember this device" flag.
pub const TRUST_DEVICE_PARAM: &str = "tfa_trust_device";

/// The only failure message ever returned; it never says why a code failed.
pub const INVALID_CODE_MESSAGE: &str = "Invalid code";

/// Raw parameters of one verification attempt. Built from untrusted input
/// and never persisted.
#[derive(Clone, Default)]
pub struct VerificationRequest {
    params: HashMap<String, String>,
}

impl VerificationRequest {
    pub fn from_params(params: HashMap<String, String>) -> Self {
        Self { params }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The submitted code, with surrounding and inner whitespace removed.
    pub fn code(&self) -> Option<String> {
        self.get(CODE_PARAM)
            .or_else(|| self.get(FALLBACK_CODE_PARAM))
            .map(|c| c.chars().filter(|ch| !ch.is_whitespace()).collect::<String>())
            .filter(|c| !c.is_empty())
    }

    pub fn remember_device(&self) -> bool {
        matches!(
            self.get(TRUST_DEVICE_PARAM)
                .map(|v| v.trim().to_ascii_lowercase())
                .as_deref(),
            Some("1" | "true" | "on" | "yes")
        )
    }
}

// Values are credentials; only keys are printed.
impl fmt::Debug for VerificationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.params.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("VerificationRequest")
            .field("keys", &keys)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Success,
    Failure { reason: String },
}

impl VerificationOutcome {
    pub fn invalid_code() -> Self {
        VerificationOutcome::Failure {
            reason: INVALID_CODE_MESSAGE.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, VerificationOutcome::Success)
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            VerificationOutcome::Success => "success",
            VerificationOutcome::Failure { .. } => "failure",
        }
    }
}

/// Wire shape of a verification result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&VerificationOutcome> for VerificationResponse {
    fn from(outcome: &VerificationOutcome) -> Self {
        match outcome {
            VerificationOutcome::Success => Self {
                success: true,
                message: None,
            },
            VerificationOutcome::Failure { reason } => Self {
                success: false,
                message: Some(reason.clone()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pairs: &[(&str, &str)]) -> VerificationRequest {
        VerificationRequest::from_params(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_code_prefers_tfa_code_and_strips_whitespace() {
        let req = request(&[("tfa_code", " 123 456 "), ("code", "999999")]);
        assert_eq!(req.code().as_deref(), Some("123456"));

        let req = request(&[("code", "654321")]);
        assert_eq!(req.code().as_deref(), Some("654321"));

        let req = request(&[("tfa_code", "   ")]);
        assert_eq!(req.code(), None);
    }

    #[test]
    fn test_remember_device_flag() {
        assert!(request(&[("tfa_trust_device", "1")]).remember_device());
        assert!(request(&[("tfa_trust_device", "True")]).remember_device());
        assert!(!request(&[("tfa_trust_device", "0")]).remember_device());
        assert!(!request(&[]).remember_device());
    }

    #[test]
    fn test_debug_does_not_print_code() {
        let req = request(&[("tfa_code", "123456")]);
        let printed = format!("{:?}", req);
        assert!(printed.contains("tfa_code"));
        assert!(!printed.contains("123456"));
    }

    #[test]
    fn test_response_shape() {
        let ok = serde_json::to_value(VerificationResponse::from(&VerificationOutcome::Success))
            .unwrap();
        assert_eq!(ok, serde_json::json!({ "success": true }));

        let failed =
            serde_json::to_value(VerificationResponse::from(&VerificationOutcome::invalid_code()))
                .unwrap();
        assert_eq!(
            failed,
            serde_json::json!({ "success": false, "message": "Invalid code" })
        );
    }
}
