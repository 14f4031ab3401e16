//! Session data models.

use crate::auth::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Where a request comes from. Hashed into the session fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientContext {
    pub ip: String,
    pub user_agent: String,
}

impl ClientContext {
    pub fn new(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
        }
    }
}

/// Server-side session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// SHA-256 of IP and client string
    pub device_fingerprint: String,
    pub remember_me: bool,
    /// User generation at creation time
    pub generation: u64,
    pub revoked: bool,
    pub revoked_reason: Option<DestroyReason>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Not revoked, not expired and not older than the user's generation
    pub fn is_active(&self, now: DateTime<Utc>, current_generation: u64) -> bool {
        !self.revoked && !self.is_expired(now) && self.generation >= current_generation
    }
}

/// Long-lived rotating credential used to mint fresh sessions.
///
/// Only the SHA-256 of the raw value is stored; it doubles as the token id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberToken {
    pub token_id: String,
    pub user_id: UserId,
    pub originating_session_id: String,
    pub device_fingerprint: String,
    pub expires_at: DateTime<Utc>,
    pub rotation_count: u32,
    /// User generation when minted. Stale tokens only survive through a
    /// session restamped by a sweep.
    pub generation: u64,
}

/// Raw remember token handed to the client exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedRememberToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of creating a session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: String,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub remember_token: Option<IssuedRememberToken>,
}

/// Options for [`SessionManager::create_session`](super::SessionManager::create_session)
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub remember_me: bool,
    /// Overrides the configured lifetime
    pub ttl: Option<Duration>,
}

/// Why a session was destroyed. Kept for audit only; callers see the same
/// outcome for every reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyReason {
    Logout,
    /// Password change, log out everywhere, suspicious activity
    Security,
    Admin,
}

impl DestroyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logout => "logout",
            Self::Security => "security",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for DestroyReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "logout" => Ok(Self::Logout),
            "security" => Ok(Self::Security),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown destroy reason '{other}'")),
        }
    }
}

/// How a fingerprint mismatch is handled at validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FingerprintMode {
    /// Reject the session
    #[default]
    Strict,
    /// Accept but flag the session
    Lenient,
}

impl FromStr for FingerprintMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(format!("unknown fingerprint mode '{other}'")),
        }
    }
}

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime of an ordinary session
    pub session_ttl: Duration,
    /// Lifetime of remember tokens and remember-me sessions
    pub remember_ttl: Duration,
    pub fingerprint_mode: FingerprintMode,
    /// Budget for each store call
    pub store_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(30 * 60),
            remember_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            fingerprint_mode: FingerprintMode::Strict,
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// Outcome of session validation
#[derive(Debug, Clone)]
pub enum SessionValidation {
    Valid {
        session: Session,
        /// Set in lenient mode when the request comes from another device
        fingerprint_mismatch: bool,
    },
    Invalid(InvalidReason),
}

impl SessionValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    pub fn reason(&self) -> Option<InvalidReason> {
        match self {
            Self::Valid { .. } => None,
            Self::Invalid(reason) => Some(*reason),
        }
    }
}

/// Why a session failed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    Expired,
    /// Explicitly destroyed, swept by a generation bump, or unknown
    Revoked,
    FingerprintMismatch,
    /// The store could not answer in time. Fail closed.
    Unavailable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn session(generation: u64) -> Session {
        let now = Utc::now();
        Session {
            session_id: "s1".to_string(),
            user_id: 7,
            created_at: now,
            expires_at: now + ChronoDuration::minutes(5),
            last_activity_at: now,
            device_fingerprint: "fp".to_string(),
            remember_me: false,
            generation,
            revoked: false,
            revoked_reason: None,
        }
    }

    #[test]
    fn test_session_active_checks_generation() {
        let now = Utc::now();
        let s = session(2);
        assert!(s.is_active(now, 2));
        assert!(s.is_active(now, 1));
        assert!(!s.is_active(now, 3));
    }

    #[test]
    fn test_revoked_session_never_active() {
        let mut s = session(0);
        s.revoked = true;
        assert!(!s.is_active(Utc::now(), 0));
    }

    #[test]
    fn test_expired_session_not_active() {
        let s = session(0);
        assert!(!s.is_active(s.expires_at, 0));
    }

    #[test]
    fn test_destroy_reason_round_trip_names() {
        for reason in [DestroyReason::Logout, DestroyReason::Security, DestroyReason::Admin] {
            assert_eq!(reason.as_str().parse::<DestroyReason>(), Ok(reason));
        }
    }
}
