//! Ambient request context threaded explicitly through every core call.

/// Client-side details used to bind a trusted-device record.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub device_fingerprint: Option<String>,
    /// Clear device token previously handed out, read back from the cookie.
    pub device_token: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// The ambient session a verification attempt runs in.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// `None` when the caller presented no primary-factor session.
    pub session_id: Option<String>,
    pub request: RequestContext,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            request: RequestContext::default(),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, fingerprint: impl Into<String>) -> Self {
        self.request.device_fingerprint = Some(fingerprint.into());
        self
    }
}
