//! Authentication error types.

use super::models::VerificationChannel;
use super::token::TokenError;
use crate::session::InvalidReason;
use thiserror::Error;

/// Client-facing authentication errors.
///
/// Display strings are safe to return as-is; none of them reveals whether an
/// identifier exists or any internal detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Unknown identifier, wrong password or disabled account
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Soft delay or hard lock in effect
    #[error("Too many attempts, please try again later")]
    RateLimited {
        retry_after: u64,
        requires_captcha: bool,
    },

    /// CAPTCHA missing or rejected; escalation ends after `retry_after` seconds
    #[error("CAPTCHA verification required")]
    CaptchaRequired { retry_after: u64 },

    /// Bad signature, issuer or audience mismatch, or malformed token
    #[error("Invalid token")]
    TokenInvalid,

    #[error("Token expired")]
    TokenExpired,

    #[error("Session revoked")]
    SessionRevoked,

    #[error("Session expired")]
    SessionExpired,

    #[error("Session used from another device")]
    SessionFingerprintMismatch,

    /// Unknown, rotated, expired or swept remember token
    #[error("Invalid remember token")]
    RememberTokenInvalid,

    /// Correct password but an unconfirmed contact channel
    #[error("Account verification required")]
    VerificationRequired(VerificationChannel),

    /// Infrastructure failure; details go to the log only
    #[error("Internal server error")]
    Internal,
}

impl AuthError {
    /// Machine-readable reason code
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::RateLimited { .. } => "rate_limited",
            Self::CaptchaRequired { .. } => "captcha_required",
            Self::TokenInvalid => "token_invalid",
            Self::TokenExpired => "token_expired",
            Self::SessionRevoked => "session_revoked",
            Self::SessionExpired => "session_expired",
            Self::SessionFingerprintMismatch => "session_fingerprint_mismatch",
            Self::RememberTokenInvalid => "remember_token_invalid",
            Self::VerificationRequired(VerificationChannel::Email) => "email_verification_required",
            Self::VerificationRequired(VerificationChannel::Phone) => "phone_verification_required",
            Self::Internal => "internal_error",
        }
    }

    /// Get a client-safe error message
    pub fn client_message(&self) -> String {
        self.to_string()
    }

    /// Spanish counterpart of [`client_message`](Self::client_message)
    pub fn client_message_es(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "Credenciales inválidas",
            Self::RateLimited { .. } => "Demasiados intentos, inténtelo de nuevo más tarde",
            Self::CaptchaRequired { .. } => "Se requiere verificación CAPTCHA",
            Self::TokenInvalid => "Token inválido",
            Self::TokenExpired => "Token expirado",
            Self::SessionRevoked => "Sesión revocada",
            Self::SessionExpired => "Sesión expirada",
            Self::SessionFingerprintMismatch => "Sesión usada desde otro dispositivo",
            Self::RememberTokenInvalid => "Token de recordatorio inválido",
            Self::VerificationRequired(_) => "Se requiere verificar la cuenta",
            Self::Internal => "Error interno del servidor",
        }
    }

    /// Seconds the client should wait, when rate limited
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::CaptchaRequired { retry_after } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    pub fn requires_captcha(&self) -> bool {
        matches!(
            self,
            Self::CaptchaRequired { .. }
                | Self::RateLimited {
                    requires_captcha: true,
                    ..
                }
        )
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => Self::TokenExpired,
            TokenError::Signing => Self::Internal,
            _ => Self::TokenInvalid,
        }
    }
}

impl From<InvalidReason> for AuthError {
    fn from(reason: InvalidReason) -> Self {
        match reason {
            InvalidReason::Expired => Self::SessionExpired,
            InvalidReason::Revoked => Self::SessionRevoked,
            InvalidReason::FingerprintMismatch => Self::SessionFingerprintMismatch,
            InvalidReason::Unavailable => Self::Internal,
        }
    }
}

/// Result type for authentication operations
pub type AuthResult<T> = Result<T, AuthError>;
