//! Request authentication and client identification.
//!
//! [`auth_middleware`] resolves the bearer token through the gateway and
//! injects the resulting [`Principal`] into request extensions:
//!
//! ```rust,no_run
//! use axum::extract::Extension;
//! use session_guard::Principal;
//!
//! async fn protected_handler(Extension(principal): Extension<Principal>) -> String {
//!     format!("Authenticated as user {}", principal.user_id)
//! }
//! # let _ = protected_handler;
//! ```

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, header::USER_AGENT, request::Parts},
    middleware::Next,
    response::Response,
};
use session_guard::{AuthError, ClientContext};
use std::convert::Infallible;
use std::net::SocketAddr;

use super::{AppState, auth::ApiError};
use crate::config::TrustedProxies;
use crate::logging::{SecurityEvent, log_security_event};

/// Client IP as seen by the login guard.
///
/// Forwarding headers (first `X-Forwarded-For` hop, then `X-Real-IP`) are
/// honoured only when the TCP peer is a trusted proxy. Otherwise the peer
/// address is the client.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trusted: &TrustedProxies) -> String {
    let Some(peer) = peer else {
        return "unknown".to_string();
    };
    if !trusted.trusts(peer.ip()) {
        return peer.ip().to_string();
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    header("x-forwarded-for")
        .or_else(|| header("x-real-ip"))
        .unwrap_or_else(|| peer.ip().to_string())
}

fn client_context(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted: &TrustedProxies,
) -> ClientContext {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    ClientContext::new(client_ip(headers, peer, trusted), user_agent)
}

/// Extractor for the caller's [`ClientContext`]
pub struct Client(pub ClientContext);

impl FromRequestParts<AppState> for Client {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Client(client_context(
            &parts.headers,
            peer,
            &state.trusted_proxies,
        )))
    }
}

/// Authentication middleware that validates the bearer token and its session.
///
/// # Behavior
///
/// - **Success**: injects `Principal` into request extensions and calls the next handler
/// - **Missing or malformed header**: `401` with `token_invalid`
/// - **Rejected token or session**: `401` with the specific reason code
/// - **Session store unavailable**: `500` (fails closed)
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let context = client_context(request.headers(), peer, &state.trusted_proxies);

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(ApiError(AuthError::TokenInvalid))?;

    match state.gateway.authenticate(token, &context).await {
        Ok(principal) => {
            if principal.fingerprint_mismatch {
                log_security_event(
                    SecurityEvent::SessionRejected,
                    Some(principal.user_id),
                    Some(&context.ip),
                    "fingerprint mismatch accepted in lenient mode",
                );
            }
            request.extensions_mut().insert(principal);
            Ok(next.run(request).await)
        }
        Err(err) => {
            crate::metrics::auth_failure(err.reason_code());
            let event = match err {
                AuthError::TokenInvalid | AuthError::TokenExpired => SecurityEvent::TokenRejected,
                _ => SecurityEvent::SessionRejected,
            };
            log_security_event(event, None, Some(&context.ip), err.reason_code());
            Err(ApiError(err))
        }
    }
}
