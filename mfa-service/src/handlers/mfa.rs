//! Second-factor HTTP handlers.
//!
//! Thin mapping between the transport and the orchestrator: parameters in,
//! `{success, message?}` out. Refusals come back as 403, never as
//! `success=false`.

use axum::{
    extract::{FromRequest, Path, Request, State},
    http::header::CONTENT_TYPE,
    Form, Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Serialize;
use service_core::error::AppError;
use std::collections::HashMap;

use crate::config::MfaSettings;
use crate::middleware::DEVICE_COOKIE;
use crate::models::{ProviderCode, SessionContext, VerificationResponse};
use crate::AppState;

/// Submitted parameters, from a form post or a flat JSON object.
pub struct SubmittedParams(pub HashMap<String, String>);

fn scalar_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Bool(b) => Some(if b { "1" } else { "0" }.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[axum::async_trait]
impl<S> FromRequest<S> for SubmittedParams
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);

        if is_form {
            let Form(params) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.body_text())))?;
            return Ok(Self(params));
        }

        let Json(values) = Json::<HashMap<String, serde_json::Value>>::from_request(req, state)
            .await
            .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e.body_text())))?;

        Ok(Self(
            values
                .into_iter()
                .filter_map(|(k, v)| scalar_to_string(v).map(|v| (k, v)))
                .collect(),
        ))
    }
}

fn trusted_device_cookie(token: String, settings: &MfaSettings) -> Cookie<'static> {
    Cookie::build((DEVICE_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(settings.cookie_secure)
        .same_site(SameSite::Strict)
        .max_age(time::Duration::days(settings.trust_lifetime_days))
        .build()
}

/// Attempt second-factor verification.
///
/// POST /mfa/:provider/verify
pub async fn verify(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    ctx: SessionContext,
    jar: CookieJar,
    SubmittedParams(params): SubmittedParams,
) -> Result<(CookieJar, Json<VerificationResponse>), AppError> {
    let provider = ProviderCode::new(provider);
    let attempt = state
        .orchestrator
        .attempt_verification(&ctx, &provider, params)
        .await?;

    let jar = match attempt.trust.and_then(|grant| grant.device_token) {
        Some(token) => jar.add(trusted_device_cookie(token, &state.config.mfa)),
        None => jar,
    };

    Ok((jar, Json(VerificationResponse::from(&attempt.outcome))))
}

#[derive(Debug, Serialize)]
pub struct AllowedResponse {
    pub provider: ProviderCode,
    pub allowed: bool,
}

/// Whether the session may use the provider.
///
/// GET /mfa/:provider/allowed
pub async fn allowed(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    ctx: SessionContext,
) -> Result<Json<AllowedResponse>, AppError> {
    let provider = ProviderCode::new(provider);
    let allowed = state
        .orchestrator
        .is_operation_allowed(&ctx, &provider)
        .await?;
    Ok(Json(AllowedResponse { provider, allowed }))
}

#[derive(Debug, Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderCode>,
}

/// Providers the session's principal can verify with.
///
/// GET /mfa/providers
pub async fn providers(
    State(state): State<AppState>,
    ctx: SessionContext,
) -> Result<Json<ProvidersResponse>, AppError> {
    let providers = state.orchestrator.enabled_providers(&ctx).await?;
    Ok(Json(ProvidersResponse { providers }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_to_string() {
        assert_eq!(
            scalar_to_string(serde_json::json!("123456")).as_deref(),
            Some("123456")
        );
        assert_eq!(scalar_to_string(serde_json::json!(true)).as_deref(), Some("1"));
        assert_eq!(scalar_to_string(serde_json::json!(42)).as_deref(), Some("42"));
        assert_eq!(scalar_to_string(serde_json::json!({ "a": 1 })), None);
    }
}
