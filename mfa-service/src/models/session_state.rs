//! Session state model - the second-factor flag of a primary-factor session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Principal;

/// Created when a primary-factor login begins (outside this service);
/// elevated here only by a successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub principal: Principal,
    pub second_factor_verified: bool,
    pub verified_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, principal: Principal, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            principal,
            second_factor_verified: false,
            verified_utc: None,
            created_utc: now,
        }
    }

    /// Mark as verified. A second call keeps the first verification time.
    pub fn elevate(&mut self, now: DateTime<Utc>) {
        if !self.second_factor_verified {
            self.second_factor_verified = true;
            self.verified_utc = Some(now);
        }
    }

    pub fn clear_verification(&mut self) {
        self.second_factor_verified = false;
        self.verified_utc = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_elevate_is_idempotent() {
        let t0 = Utc::now();
        let mut state = SessionState::new("s1", Principal::new("p1", "alice"), t0);
        state.elevate(t0);
        let once = state.clone();
        state.elevate(t0 + Duration::seconds(30));
        assert_eq!(state, once);
    }
}
