//! Authentication data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// User ID type
pub type UserId = i64;

/// Authorization role carried in bearer tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Verification channel an account still has to confirm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationChannel {
    Email,
    Phone,
}

/// User login request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Username or email
    pub identifier: String,
    pub password: String,
    #[serde(default)]
    pub remember_me: bool,
    /// Required once the guard escalates to CAPTCHA
    #[serde(default)]
    pub captcha_token: Option<String>,
}

/// Successful login or remember-token refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub token_expires_at: DateTime<Utc>,
    pub session_id: String,
    pub session_expires_at: DateTime<Utc>,
    pub user_id: UserId,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remember_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remember_expires_at: Option<DateTime<Utc>>,
}

/// Authenticated caller attached to a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub role: Role,
    pub session_id: String,
    /// Lenient fingerprint mode let a different device through
    pub fingerprint_mismatch: bool,
}
