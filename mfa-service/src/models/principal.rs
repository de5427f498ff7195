//! Principal model - the authenticated actor behind a session.

use serde::{Deserialize, Serialize};

/// An authenticated principal. Owned by the identity subsystem; read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub principal_id: String,
    /// Used for alert attribution only.
    pub user_name: String,
}

impl Principal {
    pub fn new(principal_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            user_name: user_name.into(),
        }
    }
}
