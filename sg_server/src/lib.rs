//! HTTP front end for the session guard library.
//!
//! Exposes login, remember-token refresh and session management over a JSON
//! API, with configuration from the environment, structured logging and
//! Prometheus metrics.

pub mod api;
pub mod config;
pub mod logging;
pub mod metrics;
