//! Ambient session extraction and provider gating for HTTP requests.

use axum::{
    extract::{ConnectInfo, FromRequestParts, Path, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use service_core::error::AppError;
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::models::{ProviderCode, RequestContext, SessionContext};
use crate::services::metrics::{self, OUTCOME_DENIED};
use crate::AppState;

/// Primary-factor session id, set by the login flow.
pub const SESSION_HEADER: &str = "x-session-id";
pub const SESSION_COOKIE: &str = "mfa_session";
pub const DEVICE_HEADER: &str = "x-device-fingerprint";
/// Carries the device token handed out when a device is trusted.
pub const DEVICE_COOKIE: &str = "mfa_trusted_device";

fn header_value(parts: &Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for SessionContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);

        let session_id = header_value(parts, SESSION_HEADER)
            .or_else(|| jar.get(SESSION_COOKIE).map(|c| c.value().to_string()))
            .filter(|v| !v.is_empty());

        let request = RequestContext {
            device_fingerprint: header_value(parts, DEVICE_HEADER),
            device_token: jar.get(DEVICE_COOKIE).map(|c| c.value().to_string()),
            client_ip: parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string()),
            user_agent: header_value(parts, header::USER_AGENT.as_str()),
        };

        Ok(SessionContext {
            session_id,
            request,
        })
    }
}

/// Refuse the request with 403 before dispatch unless the session's
/// principal may use the provider in the path.
pub async fn require_provider_access(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    ctx: SessionContext,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provider = ProviderCode::new(provider);

    if !state
        .orchestrator
        .is_operation_allowed(&ctx, &provider)
        .await?
    {
        tracing::info!(
            provider = %provider,
            client_ip = ctx.request.client_ip.as_deref().unwrap_or("-"),
            "Second-factor operation refused"
        );
        metrics::record_attempt(provider.as_str(), OUTCOME_DENIED);
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Not allowed to use this second factor"
        )));
    }

    Ok(next.run(req).await)
}
