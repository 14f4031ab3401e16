//! Authentication gateway: login, per-request authentication and
//! remember-token refresh.

use super::{
    credentials::{AccountStatus, CredentialRecord, CredentialStore},
    errors::{AuthError, AuthResult},
    models::{LoginRequest, LoginResponse, Principal, Role, UserId},
    policy::{CaptchaVerifier, DisabledCaptcha, VerificationPolicy},
    token::{TokenCodec, TokenSubject},
};
use crate::security::LoginSecurityGuard;
use crate::session::{
    ClientContext, DestroyReason, NewSession, Session, SessionError, SessionManager,
    SessionOptions, SessionValidation,
};
use chrono::Utc;
use std::sync::Arc;

/// Log an infrastructure failure and hide it behind a generic error
fn internal(context: &str, err: impl std::fmt::Display) -> AuthError {
    log::error!("{}: {}", context, err);
    AuthError::Internal
}

fn session_failure(context: &str, err: SessionError) -> AuthError {
    match err {
        err if err.is_unavailable() => internal(context, err),
        SessionError::Invalid(reason) => reason.into(),
        SessionError::RememberTokenInvalid => AuthError::RememberTokenInvalid,
        other => internal(context, other),
    }
}

/// Orchestrates credential checks, login throttling, sessions and tokens
pub struct AuthGateway {
    credentials: Arc<dyn CredentialStore>,
    guard: Arc<LoginSecurityGuard>,
    sessions: SessionManager,
    tokens: TokenCodec,
    verification: VerificationPolicy,
    captcha: Arc<dyn CaptchaVerifier>,
}

impl AuthGateway {
    /// Create a new gateway with `EnforceAll` verification and no CAPTCHA provider
    ///
    /// # Arguments
    ///
    /// * `credentials` - External credential store
    /// * `guard` - Login attempt guard
    /// * `sessions` - Session manager
    /// * `tokens` - Bearer token codec
    ///
    /// # Returns
    ///
    /// * `AuthGateway` - New gateway instance
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        guard: Arc<LoginSecurityGuard>,
        sessions: SessionManager,
        tokens: TokenCodec,
    ) -> Self {
        Self {
            credentials,
            guard,
            sessions,
            tokens,
            verification: VerificationPolicy::default(),
            captcha: Arc::new(DisabledCaptcha),
        }
    }

    pub fn with_verification_policy(mut self, policy: VerificationPolicy) -> Self {
        self.verification = policy;
        self
    }

    pub fn with_captcha(mut self, captcha: Arc<dyn CaptchaVerifier>) -> Self {
        self.captcha = captcha;
        self
    }

    /// Session manager, for account-settings features
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn guard(&self) -> &LoginSecurityGuard {
        &self.guard
    }

    /// Authenticate with identifier and password
    ///
    /// # Arguments
    ///
    /// * `request` - Identifier, password, remember-me flag and optional CAPTCHA response
    /// * `context` - Client IP and client string
    ///
    /// # Returns
    ///
    /// * `AuthResult<LoginResponse>` - Token, session id and, with remember-me, a remember token
    ///
    /// # Errors
    ///
    /// * `AuthError::RateLimited` - Delay or lock in effect for the identifier or IP
    /// * `AuthError::CaptchaRequired` - CAPTCHA escalation with a configured
    ///   provider and no valid response
    /// * `AuthError::InvalidCredentials` - Unknown identifier, wrong password or disabled account
    /// * `AuthError::VerificationRequired` - Correct password, unverified contact channel
    /// * `AuthError::Internal` - Credential or session store failure
    pub async fn login(
        &self,
        request: LoginRequest,
        context: &ClientContext,
    ) -> AuthResult<LoginResponse> {
        let check = self
            .guard
            .check_allowed(&request.identifier, &context.ip)
            .await;
        let captcha_gate = check.requires_captcha && self.captcha.is_enabled();
        if !check.allowed {
            return Err(AuthError::RateLimited {
                retry_after: check.retry_after.unwrap_or(1),
                requires_captcha: captcha_gate,
            });
        }

        if captcha_gate {
            let solved = match request.captcha_token.as_deref() {
                Some(token) => self.captcha.verify(token, &context.ip).await,
                None => false,
            };
            if !solved {
                return Err(AuthError::CaptchaRequired {
                    retry_after: check.captcha_retry_after.unwrap_or(1),
                });
            }
        }

        let record = self
            .credentials
            .find_by_identifier(&request.identifier)
            .await
            .map_err(|e| internal("Credential lookup failed", e))?;

        let record = match record {
            Some(record) if self.credentials.verify_password(&request.password, &record.password_hash) => {
                record
            }
            Some(_) => {
                self.guard
                    .record_failure(&request.identifier, &context.ip)
                    .await;
                return Err(AuthError::InvalidCredentials);
            }
            None => {
                self.credentials.equalize_timing(&request.password);
                self.guard
                    .record_failure(&request.identifier, &context.ip)
                    .await;
                return Err(AuthError::InvalidCredentials);
            }
        };

        if record.status == AccountStatus::Disabled {
            log::warn!("Login attempt for disabled account {}", record.user_id);
            return Err(AuthError::InvalidCredentials);
        }

        self.guard
            .record_success(&request.identifier, &context.ip)
            .await;

        if let Some(channel) = self.verification.missing(&record) {
            log::info!("Login of user {} pending {:?} verification", record.user_id, channel);
            return Err(AuthError::VerificationRequired(channel));
        }

        let session = self
            .sessions
            .create_session(
                record.user_id,
                context,
                SessionOptions {
                    remember_me: request.remember_me,
                    ttl: None,
                },
            )
            .await
            .map_err(|e| session_failure("Session creation failed", e))?;

        log::info!("User {} logged in from {}", record.user_id, context.ip);
        self.respond(session, record.role)
    }

    /// Authenticate a request carrying a bearer token
    ///
    /// The token only proves who minted it; the referenced session decides
    /// whether the caller is still logged in.
    ///
    /// # Errors
    ///
    /// * `AuthError::TokenInvalid` / `AuthError::TokenExpired` - Token rejected
    /// * `AuthError::SessionRevoked` / `AuthError::SessionExpired` /
    ///   `AuthError::SessionFingerprintMismatch` - Session rejected
    /// * `AuthError::Internal` - Session store unavailable (fails closed)
    pub async fn authenticate(
        &self,
        token: &str,
        context: &ClientContext,
    ) -> AuthResult<Principal> {
        let claims = self.tokens.verify(token)?;
        let user_id = claims.user_id().ok_or(AuthError::TokenInvalid)?;

        match self.sessions.validate_session(&claims.sid, context).await {
            SessionValidation::Valid {
                session,
                fingerprint_mismatch,
            } => {
                if session.user_id != user_id {
                    log::warn!(
                        "Token for user {} referenced a session of user {}",
                        user_id,
                        session.user_id
                    );
                    return Err(AuthError::TokenInvalid);
                }
                Ok(Principal {
                    user_id,
                    role: claims.role,
                    session_id: session.session_id,
                    fingerprint_mismatch,
                })
            }
            SessionValidation::Invalid(reason) => Err(reason.into()),
        }
    }

    /// Exchange a remember token for a fresh session and token
    ///
    /// The presented token is consumed; the response carries its replacement.
    ///
    /// # Errors
    ///
    /// * `AuthError::RememberTokenInvalid` - Unknown, rotated, expired, swept,
    ///   foreign-device token, or a disabled account
    /// * `AuthError::Internal` - Store failure
    pub async fn refresh_from_remember_token(
        &self,
        remember_token: &str,
        context: &ClientContext,
    ) -> AuthResult<LoginResponse> {
        let session = self
            .sessions
            .redeem_remember_token(remember_token, context)
            .await
            .map_err(|e| session_failure("Remember token redemption failed", e))?;

        let record = self
            .credentials
            .find_by_user_id(session.user_id)
            .await
            .map_err(|e| internal("Credential lookup failed", e));

        let role = match record {
            Ok(Some(CredentialRecord {
                status: AccountStatus::Active,
                role,
                ..
            })) => role,
            other => {
                // Do not leave a live session behind for a vanished account.
                self.sessions
                    .destroy_session(&session.session_id, DestroyReason::Security)
                    .await
                    .map_err(|e| session_failure("Session cleanup failed", e))?;
                return match other {
                    Err(e) => Err(e),
                    _ => Err(AuthError::RememberTokenInvalid),
                };
            }
        };

        log::info!("User {} refreshed from remember token", session.user_id);
        self.respond(session, role)
    }

    /// Destroy the caller's session and its remember token
    pub async fn logout(&self, principal: &Principal) -> AuthResult<()> {
        self.sessions
            .destroy_session(&principal.session_id, DestroyReason::Logout)
            .await
            .map_err(|e| session_failure("Logout failed", e))?;
        Ok(())
    }

    /// Revoke every session and remember token of the caller, including this one
    pub async fn logout_everywhere(&self, principal: &Principal) -> AuthResult<u64> {
        self.sessions
            .destroy_all_for_user(principal.user_id, None)
            .await
            .map_err(|e| session_failure("Logout everywhere failed", e))
    }

    /// Invalidate all other sessions after a password change
    ///
    /// # Arguments
    ///
    /// * `user_id` - User whose password changed
    /// * `keep_session` - Session that performed the change, kept alive
    pub async fn password_changed(
        &self,
        user_id: UserId,
        keep_session: Option<&str>,
    ) -> AuthResult<u64> {
        self.sessions
            .destroy_all_for_user(user_id, keep_session)
            .await
            .map_err(|e| session_failure("Session sweep after password change failed", e))
    }

    /// Live sessions of the caller
    pub async fn list_sessions(&self, principal: &Principal) -> AuthResult<Vec<Session>> {
        self.sessions
            .list_user_sessions(principal.user_id)
            .await
            .map_err(|e| session_failure("Session listing failed", e))
    }

    /// Revoke one of the caller's own sessions
    ///
    /// # Returns
    ///
    /// * `AuthResult<bool>` - `false` when no live session with that id belongs to the caller
    pub async fn revoke_session(&self, principal: &Principal, session_id: &str) -> AuthResult<bool> {
        let owned = self
            .list_sessions(principal)
            .await?
            .iter()
            .any(|s| s.session_id == session_id);
        if !owned {
            return Ok(false);
        }

        self.sessions
            .destroy_session(session_id, DestroyReason::Logout)
            .await
            .map_err(|e| session_failure("Session revocation failed", e))
    }

    fn respond(&self, session: NewSession, role: Role) -> AuthResult<LoginResponse> {
        // Never let the token expire before the session it accompanies.
        let remaining = (session.expires_at - Utc::now())
            .to_std()
            .unwrap_or_default();
        let ttl = self.tokens.ttl().max(remaining);

        let issued = self.tokens.issue(
            &TokenSubject {
                user_id: session.user_id,
                session_id: session.session_id.clone(),
                role,
            },
            ttl,
        )?;

        let (remember_token, remember_expires_at) = match session.remember_token {
            Some(token) => (Some(token.value), Some(token.expires_at)),
            None => (None, None),
        };

        Ok(LoginResponse {
            token: issued.token,
            token_expires_at: issued.expires_at,
            session_id: session.session_id,
            session_expires_at: session.expires_at,
            user_id: session.user_id,
            role,
            remember_token,
            remember_expires_at,
        })
    }
}
