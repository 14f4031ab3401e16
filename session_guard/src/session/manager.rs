//! Session manager implementation.

use super::{
    errors::{SessionError, SessionResult},
    fingerprint::{device_fingerprint, fingerprints_match, generate_remember_token, hash_token},
    models::{
        ClientContext, DestroyReason, FingerprintMode, InvalidReason, IssuedRememberToken,
        NewSession, RememberToken, Session, SessionConfig, SessionOptions, SessionValidation,
    },
};
use crate::auth::UserId;
use crate::store::timeouts::{MAINTENANCE_TIMEOUT, with_timeout};
use crate::store::{RememberTokenFilter, SessionStore, StoreResult, to_chrono};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Expiry and rotation carried into a freshly minted remember token
struct RememberSeed {
    expires_at: DateTime<Utc>,
    rotation_count: u32,
}

/// Server-side session manager.
///
/// Sessions are validated lazily: expiry is compared at validation time and
/// no background sweep is needed for correctness. Revocation of every session
/// of a user is a single generation bump; sessions recorded under an older
/// generation never validate again.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl SessionManager {
    /// Create a new session manager
    ///
    /// # Arguments
    ///
    /// * `store` - Session store selected at startup
    /// * `config` - Lifetimes, fingerprint mode and store timeout
    ///
    /// # Returns
    ///
    /// * `SessionManager` - New session manager instance
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn call<T>(&self, future: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        with_timeout(self.config.store_timeout, future).await
    }

    fn deadline(from: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        from.checked_add_signed(to_chrono(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn lifetime(&self, remember_me: bool) -> Duration {
        if remember_me {
            self.config.remember_ttl
        } else {
            self.config.session_ttl
        }
    }

    /// Create a session for an authenticated user
    ///
    /// # Arguments
    ///
    /// * `user_id` - Authenticated user
    /// * `context` - Client IP and client string, hashed into the fingerprint
    /// * `options` - Remember-me flag and optional lifetime override
    ///
    /// # Returns
    ///
    /// * `SessionResult<NewSession>` - Session id, expiry and, with remember-me,
    ///   the raw remember token (returned only here)
    ///
    /// # Errors
    ///
    /// * `SessionError::InvalidTtl` - Lifetime override is zero
    /// * `SessionError::Store` - Store failed or timed out
    pub async fn create_session(
        &self,
        user_id: UserId,
        context: &ClientContext,
        options: SessionOptions,
    ) -> SessionResult<NewSession> {
        let ttl = options
            .ttl
            .unwrap_or_else(|| self.lifetime(options.remember_me));
        if ttl.is_zero() {
            return Err(SessionError::InvalidTtl);
        }

        let now = Utc::now();
        let remember = options.remember_me.then(|| RememberSeed {
            expires_at: Self::deadline(now, self.config.remember_ttl),
            rotation_count: 0,
        });

        // Read before insert: a concurrent sweep either sees this session or
        // leaves it behind an older generation.
        let generation = self.call(self.store.current_generation(user_id)).await?;

        self.open_session(
            user_id,
            generation,
            device_fingerprint(context),
            now,
            Self::deadline(now, ttl),
            remember,
        )
        .await
    }

    /// Insert a session stamped with `generation`, which the caller must have
    /// read or verified before this call.
    async fn open_session(
        &self,
        user_id: UserId,
        generation: u64,
        fingerprint: String,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        remember: Option<RememberSeed>,
    ) -> SessionResult<NewSession> {

        let session = Session {
            session_id: Uuid::new_v4().to_string(),
            user_id,
            created_at: now,
            expires_at,
            last_activity_at: now,
            device_fingerprint: fingerprint,
            remember_me: remember.is_some(),
            generation,
            revoked: false,
            revoked_reason: None,
        };
        self.call(self.store.insert_session(&session)).await?;

        let remember_token = match remember {
            Some(seed) => Some(self.issue_remember_token(&session, seed).await?),
            None => None,
        };

        log::info!(
            "Session created for user {} (remember_me: {}, generation: {})",
            user_id,
            session.remember_me,
            generation
        );

        Ok(NewSession {
            session_id: session.session_id,
            user_id,
            expires_at,
            remember_token,
        })
    }

    async fn issue_remember_token(
        &self,
        session: &Session,
        seed: RememberSeed,
    ) -> SessionResult<IssuedRememberToken> {
        let value = generate_remember_token();
        let token = RememberToken {
            token_id: hash_token(&value),
            user_id: session.user_id,
            originating_session_id: session.session_id.clone(),
            device_fingerprint: session.device_fingerprint.clone(),
            expires_at: seed.expires_at,
            rotation_count: seed.rotation_count,
            generation: session.generation,
        };
        self.call(self.store.insert_remember_token(&token)).await?;

        Ok(IssuedRememberToken {
            value,
            expires_at: seed.expires_at,
        })
    }

    fn inactive_reason(
        session: &Session,
        now: DateTime<Utc>,
        current_generation: u64,
    ) -> Option<InvalidReason> {
        if session.revoked || session.generation < current_generation {
            Some(InvalidReason::Revoked)
        } else if session.is_expired(now) {
            Some(InvalidReason::Expired)
        } else {
            None
        }
    }

    /// Validate a session for the request's client context
    ///
    /// Records activity on success. Any store failure or timeout yields
    /// `Invalid(Unavailable)`: validation fails closed.
    ///
    /// # Arguments
    ///
    /// * `session_id` - Session referenced by the bearer token
    /// * `context` - Client context of the current request
    ///
    /// # Returns
    ///
    /// * `SessionValidation` - `Valid` with the session, or `Invalid` with a reason
    pub async fn validate_session(
        &self,
        session_id: &str,
        context: &ClientContext,
    ) -> SessionValidation {
        match self.check_session(session_id, context).await {
            Ok(validation) => validation,
            Err(e) => {
                log::error!("Session validation failed closed: {}", e);
                SessionValidation::Invalid(InvalidReason::Unavailable)
            }
        }
    }

    async fn check_session(
        &self,
        session_id: &str,
        context: &ClientContext,
    ) -> StoreResult<SessionValidation> {
        let now = Utc::now();
        let Some(mut session) = self.call(self.store.get_session(session_id)).await? else {
            return Ok(SessionValidation::Invalid(InvalidReason::Revoked));
        };

        let generation = self
            .call(self.store.current_generation(session.user_id))
            .await?;
        if let Some(reason) = Self::inactive_reason(&session, now, generation) {
            log::debug!(
                "Rejected session of user {}: {:?} (revoked_reason: {:?})",
                session.user_id,
                reason,
                session.revoked_reason
            );
            return Ok(SessionValidation::Invalid(reason));
        }

        let fingerprint_mismatch =
            !fingerprints_match(&session.device_fingerprint, &device_fingerprint(context));
        if fingerprint_mismatch {
            match self.config.fingerprint_mode {
                FingerprintMode::Strict => {
                    log::warn!(
                        "Fingerprint mismatch for user {} from {}, session rejected",
                        session.user_id,
                        context.ip
                    );
                    return Ok(SessionValidation::Invalid(InvalidReason::FingerprintMismatch));
                }
                FingerprintMode::Lenient => {
                    log::warn!(
                        "Fingerprint mismatch for user {} from {}, session flagged",
                        session.user_id,
                        context.ip
                    );
                }
            }
        }

        if !self
            .call(self.store.touch_session(session_id, now, None))
            .await?
        {
            // Revoked between read and touch.
            return Ok(SessionValidation::Invalid(InvalidReason::Revoked));
        }
        session.last_activity_at = now;

        Ok(SessionValidation::Valid {
            session,
            fingerprint_mismatch,
        })
    }

    /// Extend a live session by its configured lifetime
    ///
    /// # Returns
    ///
    /// * `SessionResult<DateTime<Utc>>` - New expiry
    ///
    /// # Errors
    ///
    /// * `SessionError::Invalid` - Session revoked, expired or unknown
    /// * `SessionError::Store` - Store failed or timed out
    pub async fn refresh_session(&self, session_id: &str) -> SessionResult<DateTime<Utc>> {
        let now = Utc::now();
        let session = self
            .call(self.store.get_session(session_id))
            .await?
            .ok_or(SessionError::Invalid(InvalidReason::Revoked))?;

        let generation = self
            .call(self.store.current_generation(session.user_id))
            .await?;
        if let Some(reason) = Self::inactive_reason(&session, now, generation) {
            return Err(SessionError::Invalid(reason));
        }

        let expires_at = Self::deadline(now, self.lifetime(session.remember_me));
        if !self
            .call(self.store.touch_session(session_id, now, Some(expires_at)))
            .await?
        {
            return Err(SessionError::Invalid(InvalidReason::Revoked));
        }

        Ok(expires_at)
    }

    /// Destroy one session and the remember tokens minted from it
    ///
    /// # Arguments
    ///
    /// * `session_id` - Session to destroy
    /// * `reason` - Audit reason
    ///
    /// # Returns
    ///
    /// * `SessionResult<bool>` - `true` if a live session was revoked
    pub async fn destroy_session(
        &self,
        session_id: &str,
        reason: DestroyReason,
    ) -> SessionResult<bool> {
        let Some(session) = self.call(self.store.get_session(session_id)).await? else {
            return Ok(false);
        };

        let revoked = self
            .call(self.store.revoke_session(session_id, reason))
            .await?;
        let tokens = self
            .call(self.store.delete_remember_tokens(
                session.user_id,
                RememberTokenFilter::OriginatingFrom(session_id.to_string()),
            ))
            .await?;

        log::info!(
            "Session of user {} destroyed ({}), {} remember token(s) removed",
            session.user_id,
            reason.as_str(),
            tokens
        );
        Ok(revoked)
    }

    /// Live sessions of a user, oldest first
    pub async fn list_user_sessions(&self, user_id: UserId) -> SessionResult<Vec<Session>> {
        let now = Utc::now();
        let generation = self.call(self.store.current_generation(user_id)).await?;
        let sessions = self.call(self.store.list_user_sessions(user_id)).await?;

        Ok(sessions
            .into_iter()
            .filter(|s| s.is_active(now, generation))
            .collect())
    }

    /// Revoke every session of a user, optionally keeping one
    ///
    /// Safe against a concurrent `create_session`: the generation bump catches
    /// any session created under the old generation, whether or not the sweep
    /// below sees it.
    ///
    /// # Arguments
    ///
    /// * `user_id` - User whose sessions are revoked
    /// * `except` - Session to keep (typically the caller's own)
    ///
    /// # Returns
    ///
    /// * `SessionResult<u64>` - Number of sessions marked revoked
    pub async fn destroy_all_for_user(
        &self,
        user_id: UserId,
        except: Option<&str>,
    ) -> SessionResult<u64> {
        let keep = match except {
            Some(id) => self
                .call(self.store.get_session(id))
                .await?
                .filter(|s| s.user_id == user_id && !s.revoked)
                .map(|s| s.session_id),
            None => None,
        };

        let filter = match &keep {
            Some(id) => RememberTokenFilter::AllExcept(id.clone()),
            None => RememberTokenFilter::All,
        };
        let tokens = self
            .call(self.store.delete_remember_tokens(user_id, filter))
            .await?;

        // The kept session is stamped ahead of the bump so it stays valid
        // throughout the sweep.
        let mut stamped = None;
        if let Some(id) = &keep {
            let next = self
                .call(self.store.current_generation(user_id))
                .await?
                .saturating_add(1);
            if self.call(self.store.set_session_generation(id, next)).await? {
                stamped = Some(next);
            } else {
                log::debug!("Kept session of user {} vanished during sweep", user_id);
            }
        }

        let generation = self.call(self.store.bump_generation(user_id)).await?;

        if let Some(id) = &keep {
            // A concurrent sweep moved the generation further than expected.
            if stamped.is_some_and(|next| next < generation) {
                self.call(self.store.set_session_generation(id, generation))
                    .await?;
            }
        }

        // Audit marking only; the generation bump already invalidated them.
        let mut revoked = 0;
        for session in self.call(self.store.list_user_sessions(user_id)).await? {
            if session.revoked || keep.as_deref() == Some(session.session_id.as_str()) {
                continue;
            }
            if self
                .call(
                    self.store
                        .revoke_session(&session.session_id, DestroyReason::Security),
                )
                .await?
            {
                revoked += 1;
            }
        }

        log::warn!(
            "Revoked {} session(s) and {} remember token(s) of user {} (generation {})",
            revoked,
            tokens,
            user_id,
            generation
        );
        Ok(revoked)
    }

    /// Redeem a remember token for a fresh session
    ///
    /// The token is consumed atomically; the replacement keeps the original
    /// absolute expiry, so rotation never extends its lifetime.
    ///
    /// # Arguments
    ///
    /// * `value` - Raw remember token presented by the client
    /// * `context` - Client context of the current request
    ///
    /// # Returns
    ///
    /// * `SessionResult<NewSession>` - New remember-me session with its rotated token
    ///
    /// # Errors
    ///
    /// * `SessionError::RememberTokenInvalid` - Unknown, rotated, expired,
    ///   swept or (strict mode) presented from another device
    /// * `SessionError::Store` - Store failed or timed out
    pub async fn redeem_remember_token(
        &self,
        value: &str,
        context: &ClientContext,
    ) -> SessionResult<NewSession> {
        let now = Utc::now();
        let Some(token) = self
            .call(self.store.take_remember_token(&hash_token(value)))
            .await?
        else {
            log::warn!("Unknown or already rotated remember token presented from {}", context.ip);
            return Err(SessionError::RememberTokenInvalid);
        };

        if token.expires_at <= now {
            log::debug!("Expired remember token of user {}", token.user_id);
            return Err(SessionError::RememberTokenInvalid);
        }

        let fingerprint = device_fingerprint(context);
        if !fingerprints_match(&token.device_fingerprint, &fingerprint) {
            log::warn!(
                "Remember token of user {} presented from another device ({})",
                token.user_id,
                context.ip
            );
            if self.config.fingerprint_mode == FingerprintMode::Strict {
                return Err(SessionError::RememberTokenInvalid);
            }
        }

        let Some(generation) = self.remember_token_generation(&token).await? else {
            log::warn!("Swept remember token of user {} presented", token.user_id);
            return Err(SessionError::RememberTokenInvalid);
        };

        let expires_at = Self::deadline(now, self.config.remember_ttl).min(token.expires_at);
        let seed = RememberSeed {
            expires_at: token.expires_at,
            rotation_count: token.rotation_count.saturating_add(1),
        };

        // Stamped with the generation the token was checked against, so a
        // sweep landing after the check still revokes the new session.
        self.open_session(token.user_id, generation, fingerprint, now, expires_at, Some(seed))
            .await
    }

    /// Generation a remember token is valid under, or `None` if swept.
    ///
    /// A token minted under an older generation survives only through a
    /// session restamped by `destroy_all_for_user`.
    async fn remember_token_generation(&self, token: &RememberToken) -> SessionResult<Option<u64>> {
        let generation = self
            .call(self.store.current_generation(token.user_id))
            .await?;
        if token.generation >= generation {
            return Ok(Some(generation));
        }

        let origin = self
            .call(self.store.get_session(&token.originating_session_id))
            .await?;
        Ok(origin
            .is_some_and(|s| !s.revoked && s.generation >= generation)
            .then_some(generation))
    }

    /// Delete every remember token of a user
    pub async fn disable_remember_me(&self, user_id: UserId) -> SessionResult<u64> {
        let deleted = self
            .call(
                self.store
                    .delete_remember_tokens(user_id, RememberTokenFilter::All),
            )
            .await?;
        log::info!("Remember-me disabled for user {} ({} token(s))", user_id, deleted);
        Ok(deleted)
    }

    /// Reclaim storage held by expired sessions and tokens
    pub async fn purge_expired(&self) -> SessionResult<u64> {
        Ok(with_timeout(MAINTENANCE_TIMEOUT, self.store.purge_expired(Utc::now())).await?)
    }

    /// Whether the session store answers within the store timeout.
    ///
    /// Validation fails closed, so an unreachable store means no request can
    /// be authenticated.
    pub async fn store_reachable(&self) -> bool {
        match self.call(self.store.health_check()).await {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Session store health check failed: {}", err);
                false
            }
        }
    }
}
