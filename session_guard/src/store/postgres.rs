//! PostgreSQL-backed durable store.
//!
//! Attempts are stored one row per event so concurrent inserts can never
//! overwrite each other; counting is a plain aggregate over the window.

use super::{AttemptCounter, CounterStore, RememberTokenFilter, SessionStore, StoreError, StoreResult};
use crate::auth::UserId;
use crate::session::{DestroyReason, RememberToken, Session};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Row};
use std::sync::Arc;

/// Schema applied by [`PgStore::ensure_schema`]
pub const SCHEMA: &str = include_str!("../../migrations/0001_session_guard.sql");

/// PostgreSQL implementation of both store traits
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Create the tables this store needs if they do not exist yet
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(self.pool.as_ref()).await?;
        Ok(())
    }

    async fn load_counter<'e, E>(
        executor: E,
        key: &str,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<AttemptCounter>
    where
        E: PgExecutor<'e>,
    {
        let row = sqlx::query(
            r#"
            SELECT COUNT(e.id) AS count,
                   MIN(e.attempted_at) AS window_start,
                   MAX(e.attempted_at) AS last_attempt,
                   (SELECT locked_until FROM login_attempt_locks WHERE key = $1) AS locked_until
            FROM login_attempt_events e
            WHERE e.key = $1 AND e.attempted_at > $2
            "#,
        )
        .bind(key)
        .bind(cutoff)
        .fetch_one(executor)
        .await?;

        let count: i64 = row.try_get("count")?;
        Ok(AttemptCounter {
            key: key.to_string(),
            window_start: row.try_get("window_start")?,
            last_attempt: row.try_get("last_attempt")?,
            count: u32::try_from(count).unwrap_or(u32::MAX),
            locked_until: row.try_get("locked_until")?,
        })
    }
}

fn window_cutoff(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[async_trait]
impl CounterStore for PgStore {
    async fn record_attempt(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<AttemptCounter> {
        let cutoff = window_cutoff(at, window);
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO login_attempt_events (key, attempted_at) VALUES ($1, $2)")
            .bind(key)
            .bind(at)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM login_attempt_events WHERE key = $1 AND attempted_at <= $2")
            .bind(key)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        let counter = Self::load_counter(&mut *tx, key, cutoff).await?;
        tx.commit().await?;
        Ok(counter)
    }

    async fn snapshot(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<AttemptCounter> {
        Self::load_counter(self.pool.as_ref(), key, window_cutoff(at, window)).await
    }

    async fn clear(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM login_attempt_events WHERE key = $1")
            .bind(key)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn lock_until(&self, key: &str, until: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO login_attempt_locks (key, locked_until)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE
            SET locked_until = GREATEST(login_attempt_locks.locked_until, EXCLUDED.locked_until)
            "#,
        )
        .bind(key)
        .bind(until)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn purge_expired(&self, at: DateTime<Utc>, window: Duration) -> StoreResult<u64> {
        let events = sqlx::query("DELETE FROM login_attempt_events WHERE attempted_at <= $1")
            .bind(window_cutoff(at, window))
            .execute(self.pool.as_ref())
            .await?;

        let locks = sqlx::query("DELETE FROM login_attempt_locks WHERE locked_until <= $1")
            .bind(at)
            .execute(self.pool.as_ref())
            .await?;

        Ok(events.rows_affected() + locks.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_sessions
                (session_id, user_id, created_at, expires_at, last_activity_at,
                 device_fingerprint, remember_me, generation, revoked, revoked_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&session.session_id)
        .bind(session.user_id)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.last_activity_at)
        .bind(&session.device_fingerprint)
        .bind(session.remember_me)
        .bind(generation_to_db(session.generation))
        .bind(session.revoked)
        .bind(session.revoked_reason.map(|r| r.as_str()))
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM auth_sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(self.pool.as_ref())
            .await?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn touch_session(
        &self,
        session_id: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE auth_sessions
            SET last_activity_at = $2, expires_at = COALESCE($3, expires_at)
            WHERE session_id = $1 AND NOT revoked
            "#,
        )
        .bind(session_id)
        .bind(last_activity_at)
        .bind(expires_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn revoke_session(&self, session_id: &str, reason: DestroyReason) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE auth_sessions
            SET revoked = TRUE, revoked_reason = $2
            WHERE session_id = $1 AND NOT revoked
            "#,
        )
        .bind(session_id)
        .bind(reason.as_str())
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_session_generation(
        &self,
        session_id: &str,
        generation: u64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE auth_sessions SET generation = $2 WHERE session_id = $1 AND NOT revoked",
        )
        .bind(session_id)
        .bind(generation_to_db(generation))
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_user_sessions(&self, user_id: UserId) -> StoreResult<Vec<Session>> {
        let rows = sqlx::query("SELECT * FROM auth_sessions WHERE user_id = $1 ORDER BY created_at")
            .bind(user_id)
            .fetch_all(self.pool.as_ref())
            .await?;

        rows.iter().map(session_from_row).collect()
    }

    async fn current_generation(&self, user_id: UserId) -> StoreResult<u64> {
        let generation: Option<i64> =
            sqlx::query_scalar("SELECT generation FROM user_session_generations WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(self.pool.as_ref())
                .await?;

        Ok(generation.map(generation_from_db).unwrap_or(0))
    }

    async fn bump_generation(&self, user_id: UserId) -> StoreResult<u64> {
        let generation: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO user_session_generations (user_id, generation)
            VALUES ($1, 1)
            ON CONFLICT (user_id) DO UPDATE
            SET generation = user_session_generations.generation + 1
            RETURNING generation
            "#,
        )
        .bind(user_id)
        .fetch_one(self.pool.as_ref())
        .await?;

        Ok(generation_from_db(generation))
    }

    async fn insert_remember_token(&self, token: &RememberToken) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO remember_tokens
                (token_id, user_id, originating_session_id, device_fingerprint,
                 expires_at, rotation_count, generation)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&token.token_id)
        .bind(token.user_id)
        .bind(&token.originating_session_id)
        .bind(&token.device_fingerprint)
        .bind(token.expires_at)
        .bind(i32::try_from(token.rotation_count).unwrap_or(i32::MAX))
        .bind(generation_to_db(token.generation))
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn take_remember_token(&self, token_id: &str) -> StoreResult<Option<RememberToken>> {
        let row = sqlx::query("DELETE FROM remember_tokens WHERE token_id = $1 RETURNING *")
            .bind(token_id)
            .fetch_optional(self.pool.as_ref())
            .await?;

        row.as_ref().map(remember_token_from_row).transpose()
    }

    async fn delete_remember_tokens(
        &self,
        user_id: UserId,
        filter: RememberTokenFilter,
    ) -> StoreResult<u64> {
        let result = match filter {
            RememberTokenFilter::All => {
                sqlx::query("DELETE FROM remember_tokens WHERE user_id = $1")
                    .bind(user_id)
                    .execute(self.pool.as_ref())
                    .await?
            }
            RememberTokenFilter::OriginatingFrom(session_id) => {
                sqlx::query(
                    "DELETE FROM remember_tokens WHERE user_id = $1 AND originating_session_id = $2",
                )
                .bind(user_id)
                .bind(session_id)
                .execute(self.pool.as_ref())
                .await?
            }
            RememberTokenFilter::AllExcept(session_id) => {
                sqlx::query(
                    "DELETE FROM remember_tokens WHERE user_id = $1 AND originating_session_id <> $2",
                )
                .bind(user_id)
                .bind(session_id)
                .execute(self.pool.as_ref())
                .await?
            }
        };

        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, at: DateTime<Utc>) -> StoreResult<u64> {
        let sessions = sqlx::query("DELETE FROM auth_sessions WHERE expires_at <= $1")
            .bind(at)
            .execute(self.pool.as_ref())
            .await?;

        let tokens = sqlx::query("DELETE FROM remember_tokens WHERE expires_at <= $1")
            .bind(at)
            .execute(self.pool.as_ref())
            .await?;

        Ok(sessions.rows_affected() + tokens.rows_affected())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(self.pool.as_ref()).await?;
        Ok(())
    }
}

fn generation_to_db(generation: u64) -> i64 {
    i64::try_from(generation).unwrap_or(i64::MAX)
}

fn generation_from_db(generation: i64) -> u64 {
    u64::try_from(generation).unwrap_or(0)
}

fn session_from_row(row: &PgRow) -> StoreResult<Session> {
    let revoked_reason = row
        .try_get::<Option<String>, _>("revoked_reason")?
        .map(|reason| reason.parse::<DestroyReason>().map_err(StoreError::Corrupt))
        .transpose()?;

    Ok(Session {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        device_fingerprint: row.try_get("device_fingerprint")?,
        remember_me: row.try_get("remember_me")?,
        generation: generation_from_db(row.try_get("generation")?),
        revoked: row.try_get("revoked")?,
        revoked_reason,
    })
}

fn remember_token_from_row(row: &PgRow) -> StoreResult<RememberToken> {
    let rotation_count: i32 = row.try_get("rotation_count")?;
    Ok(RememberToken {
        token_id: row.try_get("token_id")?,
        user_id: row.try_get("user_id")?,
        originating_session_id: row.try_get("originating_session_id")?,
        device_fingerprint: row.try_get("device_fingerprint")?,
        expires_at: row.try_get("expires_at")?,
        rotation_count: u32::try_from(rotation_count).unwrap_or(0),
        generation: generation_from_db(row.try_get("generation")?),
    })
}
