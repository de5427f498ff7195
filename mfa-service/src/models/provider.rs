//! Provider codes identify one MFA mechanism (e.g. "google").

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderCode(String);

impl ProviderCode {
    pub const GOOGLE: &'static str = "google";

    /// Codes are matched case-insensitively and stored lowercase.
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderCode {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

impl From<String> for ProviderCode {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_code_is_normalized() {
        assert_eq!(ProviderCode::new(" Google "), ProviderCode::from(ProviderCode::GOOGLE));
        assert_eq!(ProviderCode::new("TOTP").to_string(), "totp");
    }
}
