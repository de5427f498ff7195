//! Security alert event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// A structured security event, forwarded to the alert sink and never kept
/// by the verification core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub module: String,
    pub message: String,
    pub severity: Severity,
    /// Display name of the principal the event is about.
    pub subject: String,
    pub created_utc: DateTime<Utc>,
}

impl AlertEvent {
    pub fn new(
        module: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            module: module.into(),
            message: message.into(),
            severity,
            subject: subject.into(),
            created_utc: Utc::now(),
        }
    }
}
