//! Structured logging setup and security event helpers.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging
///
/// Levels come from `RUST_LOG`. Records emitted by the library through the
/// `log` facade are captured as well.
///
/// # Example
///
/// ```no_run
/// use sg_server::logging;
///
/// logging::init();
/// tracing::info!("Server starting");
/// ```
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,hyper=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Structured logging initialized");
}

/// Security-relevant outcomes of the auth endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEvent {
    LoginFailed,
    LoginThrottled,
    TokenRejected,
    SessionRejected,
    RememberTokenRejected,
    LogoutEverywhere,
    SessionRevoked,
}

impl SecurityEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginFailed => "login_failed",
            Self::LoginThrottled => "login_throttled",
            Self::TokenRejected => "token_rejected",
            Self::SessionRejected => "session_rejected",
            Self::RememberTokenRejected => "remember_token_rejected",
            Self::LogoutEverywhere => "logout_everywhere",
            Self::SessionRevoked => "session_revoked",
        }
    }
}

/// Log security event with structured data
///
/// # Arguments
///
/// * `event` - Kind of security event
/// * `user_id` - User, when known
/// * `ip_address` - Client IP, when known
/// * `message` - Event message
///
/// # Example
///
/// ```
/// use sg_server::logging::{SecurityEvent, log_security_event};
///
/// log_security_event(
///     SecurityEvent::LoginFailed,
///     None,
///     Some("192.168.1.1"),
///     "invalid_credentials",
/// );
/// ```
pub fn log_security_event(
    event: SecurityEvent,
    user_id: Option<i64>,
    ip_address: Option<&str>,
    message: &str,
) {
    tracing::warn!(
        event_type = event.as_str(),
        user_id = user_id,
        ip_address = ip_address,
        "SECURITY: {}",
        message
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_security_event() {
        log_security_event(SecurityEvent::LoginFailed, Some(1), Some("127.0.0.1"), "Test message");
        log_security_event(SecurityEvent::TokenRejected, None, None, "token_invalid");
    }

    #[test]
    fn test_event_names() {
        assert_eq!(SecurityEvent::LoginThrottled.as_str(), "login_throttled");
        assert_eq!(SecurityEvent::RememberTokenRejected.as_str(), "remember_token_rejected");
    }
}
