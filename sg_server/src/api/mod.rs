//! HTTP API for the session guard.
//!
//! # Endpoints
//!
//! ## Public
//! - `POST /api/v1/auth/login` - Password login
//! - `POST /api/v1/auth/refresh` - Exchange a remember token for a new session
//! - `GET /health` - Server health status
//!
//! ## Bearer token required
//! - `POST /api/v1/auth/logout` - End the current session
//! - `POST /api/v1/auth/logout-all` - End every session of the caller
//! - `GET /api/v1/auth/sessions` - List the caller's live sessions
//! - `DELETE /api/v1/auth/sessions/{id}` - Revoke one of the caller's sessions
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use sg_server::api::{AppState, create_router};
//! use session_guard::AuthGateway;
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//! # async fn example(gateway: AuthGateway) -> Result<(), Box<dyn std::error::Error>> {
//! let app = create_router(AppState {
//!     gateway: Arc::new(gateway),
//!     trusted_proxies: Arc::default(),
//! });
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(
//!     listener,
//!     app.into_make_service_with_connect_info::<SocketAddr>(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # CORS
//!
//! CORS is configured permissively. In production, configure appropriate
//! origins, methods, and headers.

pub mod auth;
pub mod middleware;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
};
use serde_json::json;
use session_guard::AuthGateway;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::TrustedProxies;

/// Application state shared across all HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<AuthGateway>,
    /// Peers whose forwarding headers name the client IP
    pub trusted_proxies: Arc<TrustedProxies>,
}

/// Create the API router with all endpoints and middleware.
pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh));

    let protected_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/logout-all", post(auth::logout_all))
        .route("/auth/sessions", get(auth::list_sessions))
        .route("/auth/sessions/{session_id}", delete(auth::revoke_session))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", public_routes.merge(protected_routes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint for monitoring and load balancers.
///
/// A degraded login guard still serves requests on in-process counters, so
/// it is reported with `200 OK`. An unreachable session store answers
/// `503` because no request can be authenticated without it.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let degraded = state.gateway.guard().is_degraded();
    crate::metrics::guard_degraded(degraded);
    let store_reachable = state.gateway.sessions().store_reachable().await;

    let (code, status) = match (store_reachable, degraded) {
        (false, _) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        (true, true) => (StatusCode::OK, "degraded"),
        (true, false) => (StatusCode::OK, "healthy"),
    };

    let response = json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "login_guard": {
            "degraded": degraded,
        },
        "session_store": {
            "reachable": store_reachable,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    (code, Json(response))
}
