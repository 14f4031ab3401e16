//! Prometheus metrics for the auth endpoints.
//!
//! Counters are recorded through the `metrics` facade and are no-ops until
//! [`init_metrics`] installs the exporter.
//!
//! # Metrics
//!
//! - `login_attempts_total{outcome}`: every login, by outcome reason code
//! - `login_rate_limited_total{captcha}`: logins refused by the guard
//! - `auth_failures_total{reason}`: rejected bearer tokens and sessions
//! - `remember_refresh_total{success}`: remember-token exchanges
//! - `sessions_revoked_total{scope}`: explicit revocations
//! - `login_guard_degraded`: 1 while the guard runs on in-process counters

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Initialize Prometheus metrics exporter.
///
/// Metrics will be available at `http://<addr>/metrics`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {}", e))
}

/// Record a login outcome (`success` or an error reason code)
pub fn login_attempt(outcome: &'static str) {
    metrics::counter!("login_attempts_total", "outcome" => outcome).increment(1);
}

pub fn login_rate_limited(requires_captcha: bool) {
    metrics::counter!("login_rate_limited_total",
        "captcha" => requires_captcha.to_string()
    )
    .increment(1);
}

/// Record a rejected bearer token or session
pub fn auth_failure(reason: &'static str) {
    metrics::counter!("auth_failures_total", "reason" => reason).increment(1);
}

pub fn remember_refresh(success: bool) {
    metrics::counter!("remember_refresh_total", "success" => success.to_string()).increment(1);
}

/// Record revoked sessions; `scope` is `single` or `all`
pub fn sessions_revoked(scope: &'static str, count: u64) {
    metrics::counter!("sessions_revoked_total", "scope" => scope).increment(count);
}

pub fn guard_degraded(degraded: bool) {
    metrics::gauge!("login_guard_degraded").set(if degraded { 1.0 } else { 0.0 });
}
