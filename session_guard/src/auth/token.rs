//! Bearer token issuance and verification.
//!
//! Tokens are HS256-signed JWTs. Issuer and audience are always written on
//! issuance and always checked on verification; a token lacking either is
//! rejected as malformed. Token expiry is a coarse upper bound only, the
//! referenced session remains the source of truth for revocation.

use super::models::{Role, UserId};
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Token verification failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Token signature is invalid")]
    InvalidSignature,

    #[error("Token has expired")]
    Expired,

    #[error("Token audience does not match")]
    AudienceMismatch,

    #[error("Token issuer does not match")]
    IssuerMismatch,

    /// Undecodable, or a required claim is missing
    #[error("Token is malformed")]
    Malformed,

    #[error("Token could not be signed")]
    Signing,
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidAudience => Self::AudienceMismatch,
            ErrorKind::InvalidIssuer => Self::IssuerMismatch,
            _ => Self::Malformed,
        }
    }
}

/// Claims carried by every bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id, as a string per JWT convention
    pub sub: String,
    /// Session the token is bound to
    pub sid: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

impl TokenClaims {
    pub fn user_id(&self) -> Option<UserId> {
        self.sub.parse().ok()
    }
}

/// Who a token is issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSubject {
    pub user_id: UserId,
    pub session_id: String,
    pub role: Role,
}

/// A freshly signed token
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Token codec configuration
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// HMAC secret
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    /// Default lifetime; never shorter than the session it accompanies
    pub ttl: Duration,
}

/// Signs and verifies bearer tokens
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl TokenCodec {
    pub fn new(config: &TokenConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            ttl: config.ttl,
        }
    }

    /// Configured default lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign a token for `subject` valid for `ttl`
    ///
    /// # Arguments
    ///
    /// * `subject` - User, session and role to embed
    /// * `ttl` - Token lifetime
    ///
    /// # Returns
    ///
    /// * `Result<IssuedToken, TokenError>` - Signed token and its expiry
    pub fn issue(&self, subject: &TokenSubject, ttl: Duration) -> Result<IssuedToken, TokenError> {
        let now = Utc::now();
        let deadline = now
            .checked_add_signed(crate::store::to_chrono(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        // `exp` has whole-second precision; round up so the token never
        // lapses before the deadline it was asked to cover.
        let exp = deadline.timestamp() + i64::from(deadline.timestamp_subsec_nanos() > 0);
        let expires_at = DateTime::from_timestamp(exp, 0).unwrap_or(deadline);

        let claims = TokenClaims {
            sub: subject.user_id.to_string(),
            sid: subject.session_id.clone(),
            role: subject.role,
            iat: now.timestamp(),
            exp,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| {
                log::error!("Failed to sign token: {}", e);
                TokenError::Signing
            })?;

        Ok(IssuedToken { token, expires_at })
    }

    /// Verify signature, expiry, issuer and audience
    ///
    /// # Errors
    ///
    /// * `TokenError::InvalidSignature` - Signed with another key
    /// * `TokenError::Expired` - Past its `exp`
    /// * `TokenError::AudienceMismatch` / `TokenError::IssuerMismatch` - Minted for another party
    /// * `TokenError::Malformed` - Undecodable or missing a required claim
    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation)?;
        if data.claims.user_id().is_none() || data.claims.sid.is_empty() {
            return Err(TokenError::Malformed);
        }
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &str = "test_secret_that_is_at_least_32_characters_long";

    fn config() -> TokenConfig {
        TokenConfig {
            secret: SECRET.to_string(),
            issuer: "session-guard".to_string(),
            audience: "web".to_string(),
            ttl: Duration::from_secs(3600),
        }
    }

    fn subject() -> TokenSubject {
        TokenSubject {
            user_id: 42,
            session_id: "sess-1".to_string(),
            role: Role::User,
        }
    }

    fn sign_raw(value: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &value,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_issue_and_verify() {
        let codec = TokenCodec::new(&config());
        let issued = codec.issue(&subject(), Duration::from_secs(60)).unwrap();

        let claims = codec.verify(&issued.token).unwrap();
        assert_eq!(claims.user_id(), Some(42));
        assert_eq!(claims.sid, "sess-1");
        assert_eq!(claims.iss, "session-guard");
        assert_eq!(claims.aud, "web");
        assert_eq!(claims.exp, issued.expires_at.timestamp());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let codec = TokenCodec::new(&config());
        let other = TokenCodec::new(&TokenConfig {
            secret: "another_secret_that_is_also_32_characters".to_string(),
            ..config()
        });

        let issued = other.issue(&subject(), Duration::from_secs(60)).unwrap();
        assert_eq!(codec.verify(&issued.token), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn test_audience_and_issuer_mismatch_rejected() {
        let codec = TokenCodec::new(&config());
        let foreign_audience = TokenCodec::new(&TokenConfig {
            audience: "mobile".to_string(),
            ..config()
        });
        let foreign_issuer = TokenCodec::new(&TokenConfig {
            issuer: "someone-else".to_string(),
            ..config()
        });

        let token = foreign_audience.issue(&subject(), Duration::from_secs(60)).unwrap();
        assert_eq!(codec.verify(&token.token), Err(TokenError::AudienceMismatch));

        let token = foreign_issuer.issue(&subject(), Duration::from_secs(60)).unwrap();
        assert_eq!(codec.verify(&token.token), Err(TokenError::IssuerMismatch));
    }

    #[test]
    fn test_token_without_issuer_or_audience_rejected() {
        let codec = TokenCodec::new(&config());
        let exp = Utc::now().timestamp() + 600;

        let no_claims = sign_raw(json!({ "sub": "42", "sid": "s", "role": "user", "iat": 0, "exp": exp }));
        assert_eq!(codec.verify(&no_claims), Err(TokenError::Malformed));

        let no_audience = sign_raw(json!({
            "sub": "42", "sid": "s", "role": "user", "iat": 0, "exp": exp, "iss": "session-guard"
        }));
        assert_eq!(codec.verify(&no_audience), Err(TokenError::Malformed));
    }

    #[test]
    fn test_expired_token_rejected() {
        let codec = TokenCodec::new(&config());
        let past = Utc::now().timestamp() - 10;
        let token = sign_raw(json!({
            "sub": "42", "sid": "s", "role": "user", "iat": past - 60, "exp": past,
            "iss": "session-guard", "aud": "web"
        }));
        assert_eq!(codec.verify(&token), Err(TokenError::Expired));
    }

    #[test]
    fn test_non_numeric_subject_rejected() {
        let codec = TokenCodec::new(&config());
        let token = sign_raw(json!({
            "sub": "alice", "sid": "s", "role": "user", "iat": 0,
            "exp": Utc::now().timestamp() + 600, "iss": "session-guard", "aud": "web"
        }));
        assert_eq!(codec.verify(&token), Err(TokenError::Malformed));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let codec = TokenCodec::new(&config());
        assert_eq!(codec.verify("not.a.jwt"), Err(TokenError::Malformed));
        assert_eq!(codec.verify(""), Err(TokenError::Malformed));
    }
}
