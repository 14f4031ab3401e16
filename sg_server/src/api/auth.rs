//! Authentication API handlers.
//!
//! This module provides HTTP REST endpoints for:
//! - Password login with optional remember-me
//! - Remember-token refresh for a fresh session
//! - Logout of the current session or of every session
//! - Listing and revoking the caller's sessions
//!
//! Every failure is returned as an [`ErrorResponse`] carrying a stable
//! reason code next to the English and Spanish messages.
//!
//! # Examples
//!
//! Login:
//! ```bash
//! curl -X POST http://localhost:8080/api/v1/auth/login \
//!   -H "Content-Type: application/json" \
//!   -d '{"identifier": "alice@example.com", "password": "hunter2", "remember_me": true}'
//! ```
//!
//! Refresh:
//! ```bash
//! curl -X POST http://localhost:8080/api/v1/auth/refresh \
//!   -H "Content-Type: application/json" \
//!   -d '{"remember_token": "9f2c..."}'
//! ```

use axum::{
    Json,
    extract::{Extension, Path, State},
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use session_guard::{
    AuthError, Principal,
    auth::{LoginRequest, LoginResponse},
};

use super::{AppState, middleware::Client};
use crate::logging::{SecurityEvent, log_security_event};
use crate::metrics;

#[derive(Debug, Deserialize)]
pub struct RefreshPayload {
    pub remember_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub message_es: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub requires_captcha: bool,
}

#[derive(Debug, Serialize)]
pub struct RevokedResponse {
    pub revoked: u64,
}

/// Public view of one session; the device fingerprint stays server-side
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remember_me: bool,
    pub current: bool,
}

/// [`AuthError`] rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub AuthError);

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self(err)
    }
}

/// HTTP status for an auth failure
pub fn status_for(err: &AuthError) -> StatusCode {
    match err {
        AuthError::RateLimited { .. } | AuthError::CaptchaRequired { .. } => StatusCode::TOO_MANY_REQUESTS,
        AuthError::VerificationRequired(_) => StatusCode::FORBIDDEN,
        AuthError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        AuthError::InvalidCredentials
        | AuthError::TokenInvalid
        | AuthError::TokenExpired
        | AuthError::SessionRevoked
        | AuthError::SessionExpired
        | AuthError::SessionFingerprintMismatch
        | AuthError::RememberTokenInvalid => StatusCode::UNAUTHORIZED,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_for(&err);
        let body = ErrorResponse {
            code: err.reason_code().to_string(),
            message: err.client_message(),
            message_es: err.client_message_es().to_string(),
            retry_after: err.retry_after(),
            requires_captcha: err.requires_captcha(),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = err.retry_after() {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Authenticate with identifier and password.
///
/// # Request Body
///
/// ```json
/// {
///   "identifier": "alice@example.com",
///   "password": "hunter2",
///   "remember_me": true,
///   "captcha_token": null  // Required once the guard asks for it
/// }
/// ```
///
/// # Errors
///
/// - `401 Unauthorized`: `invalid_credentials`, identical for unknown users,
///   wrong passwords and disabled accounts
/// - `403 Forbidden`: `email_verification_required` / `phone_verification_required`
/// - `429 Too Many Requests`: `rate_limited` or `captcha_required`, with `Retry-After`
pub async fn login(
    State(state): State<AppState>,
    Client(context): Client,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    match state.gateway.login(request, &context).await {
        Ok(response) => {
            metrics::login_attempt("success");
            tracing::info!(user_id = response.user_id, ip = %context.ip, "Login succeeded");
            Ok(Json(response))
        }
        Err(err) => {
            metrics::login_attempt(err.reason_code());
            match &err {
                AuthError::RateLimited {
                    requires_captcha, ..
                } => {
                    metrics::login_rate_limited(*requires_captcha);
                    log_security_event(
                        SecurityEvent::LoginThrottled,
                        None,
                        Some(&context.ip),
                        err.reason_code(),
                    );
                }
                AuthError::InvalidCredentials | AuthError::CaptchaRequired { .. } => {
                    log_security_event(
                        SecurityEvent::LoginFailed,
                        None,
                        Some(&context.ip),
                        err.reason_code(),
                    );
                }
                _ => {}
            }
            Err(ApiError(err))
        }
    }
}

/// Exchange a remember token for a new session and a rotated remember token.
///
/// The presented token is burned whether or not the exchange succeeds.
pub async fn refresh(
    State(state): State<AppState>,
    Client(context): Client,
    Json(payload): Json<RefreshPayload>,
) -> Result<Json<LoginResponse>, ApiError> {
    let result = state
        .gateway
        .refresh_from_remember_token(&payload.remember_token, &context)
        .await;
    metrics::remember_refresh(result.is_ok());

    result.map(Json).map_err(|err| {
        if err == AuthError::RememberTokenInvalid {
            log_security_event(
                SecurityEvent::RememberTokenRejected,
                None,
                Some(&context.ip),
                err.reason_code(),
            );
        }
        ApiError(err)
    })
}

/// End the current session. Returns `204 No Content`.
pub async fn logout(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<StatusCode, ApiError> {
    state.gateway.logout(&principal).await?;
    metrics::sessions_revoked("single", 1);
    Ok(StatusCode::NO_CONTENT)
}

/// End every session of the caller, including the current one.
pub async fn logout_all(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<RevokedResponse>, ApiError> {
    let revoked = state.gateway.logout_everywhere(&principal).await?;
    metrics::sessions_revoked("all", revoked);
    log_security_event(
        SecurityEvent::LogoutEverywhere,
        Some(principal.user_id),
        None,
        &format!("{revoked} sessions revoked"),
    );
    Ok(Json(RevokedResponse { revoked }))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    let sessions = state.gateway.list_sessions(&principal).await?;
    let views = sessions
        .into_iter()
        .map(|session| SessionView {
            current: session.session_id == principal.session_id,
            session_id: session.session_id,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            expires_at: session.expires_at,
            remember_me: session.remember_me,
        })
        .collect();
    Ok(Json(views))
}

/// Revoke one of the caller's sessions.
///
/// Returns `404 Not Found` for sessions the caller does not own, so other
/// users' session ids cannot be discovered.
pub async fn revoke_session(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !state.gateway.revoke_session(&principal, &session_id).await? {
        return Ok(StatusCode::NOT_FOUND);
    }

    metrics::sessions_revoked("single", 1);
    log_security_event(
        SecurityEvent::SessionRevoked,
        Some(principal.user_id),
        None,
        &session_id,
    );
    Ok(StatusCode::NO_CONTENT)
}
