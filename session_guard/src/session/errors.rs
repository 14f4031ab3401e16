//! Session error types.

use super::models::InvalidReason;
use crate::store::StoreError;
use thiserror::Error;

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Session management errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Session exists no more, or never did
    #[error("Session is not valid: {0:?}")]
    Invalid(InvalidReason),

    /// Remember token unknown, already rotated, expired or bound to another device
    #[error("Invalid remember token")]
    RememberTokenInvalid,

    /// Requested lifetime is zero
    #[error("Session lifetime must be positive")]
    InvalidTtl,

    /// Backing store failed or timed out
    #[error("Session store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    /// True when the failure came from infrastructure rather than the caller
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Invalid(InvalidReason::Unavailable))
    }
}
