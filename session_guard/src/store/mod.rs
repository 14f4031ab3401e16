//! Storage abstractions backing attempt counters and sessions.
//!
//! Two small traits decouple the guard and the session manager from the
//! concrete backend:
//!
//! - [`CounterStore`]: sliding-window attempt counters with lock markers
//! - [`SessionStore`]: sessions, per-user generations and remember tokens
//!
//! Three implementations exist and one is picked at startup through an
//! explicit [`StoreStrategy`]:
//!
//! - [`MemoryStore`]: in-process maps, also the guard's fail-open fallback
//! - [`RedisStore`]: the fast shared store, atomic Lua scripts
//! - [`PgStore`]: the durable PostgreSQL store
//!
//! ## Example
//!
//! ```no_run
//! use session_guard::store::{CounterStore, MemoryStore};
//! use chrono::{Duration, Utc};
//!
//! # async fn example() -> Result<(), session_guard::store::StoreError> {
//! let store = MemoryStore::new();
//! let counter = store
//!     .record_attempt("login:id:alice", Utc::now(), Duration::minutes(15))
//!     .await?;
//! assert_eq!(counter.count, 1);
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod postgres;
pub mod redis;
pub mod timeouts;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use self::redis::RedisStore;

use crate::auth::UserId;
use crate::session::{DestroyReason, RememberToken, Session};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::str::FromStr;
use thiserror::Error;

/// Internal storage errors. Never surfaced past the guard or the manager.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Store call exceeded its time budget
    #[error("Store operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored data could not be decoded
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Snapshot of a sliding-window attempt counter.
///
/// `count` only includes events inside the trailing window. A lock marker is
/// kept apart from the events so clearing the window never lifts a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptCounter {
    pub key: String,
    /// Oldest event still inside the window
    pub window_start: Option<DateTime<Utc>>,
    /// Most recent event inside the window
    pub last_attempt: Option<DateTime<Utc>>,
    pub count: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

impl AttemptCounter {
    /// Counter with no events and no lock
    pub fn empty(key: &str) -> Self {
        Self {
            key: key.to_string(),
            window_start: None,
            last_attempt: None,
            count: 0,
            locked_until: None,
        }
    }

    /// Active lock expiry at `now`, if any
    pub fn active_lock(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.locked_until.filter(|until| *until > now)
    }
}

/// Which remember tokens of a user a deletion applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RememberTokenFilter {
    /// Every token of the user
    All,
    /// Only tokens minted from this session
    OriginatingFrom(String),
    /// Every token except those minted from this session
    AllExcept(String),
}

impl RememberTokenFilter {
    /// Whether a token minted from `originating_session_id` is selected
    pub fn matches(&self, originating_session_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::OriginatingFrom(id) => id == originating_session_id,
            Self::AllExcept(id) => id != originating_session_id,
        }
    }
}

/// Sliding-window attempt counters
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Append one event at `at`, drop events older than `window` and return
    /// the resulting counter. Must be a single atomic step.
    async fn record_attempt(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<AttemptCounter>;

    /// Read the counter without recording anything
    async fn snapshot(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<AttemptCounter>;

    /// Drop every window event for `key`. Locks are left untouched.
    async fn clear(&self, key: &str) -> StoreResult<()>;

    /// Lock `key` until `until`. An existing later lock is kept.
    async fn lock_until(&self, key: &str, until: DateTime<Utc>) -> StoreResult<()>;

    /// Remove stale events and elapsed locks, returning how many records went away
    async fn purge_expired(&self, at: DateTime<Utc>, window: Duration) -> StoreResult<u64>;
}

/// Server-side sessions, user generations and remember tokens
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> StoreResult<()>;

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>>;

    /// Update last activity and optionally the expiry. Returns `false` when the
    /// session does not exist or is already revoked.
    async fn touch_session(
        &self,
        session_id: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool>;

    /// Mark a session revoked. Returns `false` when it was unknown or already revoked.
    async fn revoke_session(&self, session_id: &str, reason: DestroyReason) -> StoreResult<bool>;

    /// Restamp the generation of a live session
    async fn set_session_generation(&self, session_id: &str, generation: u64)
    -> StoreResult<bool>;

    /// Every stored session of a user, revoked or not
    async fn list_user_sessions(&self, user_id: UserId) -> StoreResult<Vec<Session>>;

    /// Current generation of a user (0 when never bumped)
    async fn current_generation(&self, user_id: UserId) -> StoreResult<u64>;

    /// Atomically increment the user's generation, returning the new value
    async fn bump_generation(&self, user_id: UserId) -> StoreResult<u64>;

    async fn insert_remember_token(&self, token: &RememberToken) -> StoreResult<()>;

    /// Atomically fetch and delete a remember token. Of two concurrent calls
    /// for the same token at most one gets `Some`.
    async fn take_remember_token(&self, token_id: &str) -> StoreResult<Option<RememberToken>>;

    async fn delete_remember_tokens(
        &self,
        user_id: UserId,
        filter: RememberTokenFilter,
    ) -> StoreResult<u64>;

    /// Remove expired sessions and remember tokens
    async fn purge_expired(&self, at: DateTime<Utc>) -> StoreResult<u64>;

    /// One round trip to the backend; in-process stores are always reachable
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Backend selected at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreStrategy {
    /// In-process only (single node, tests)
    #[default]
    Memory,
    /// Redis fast store
    Redis,
    /// PostgreSQL durable store
    Postgres,
}

impl FromStr for StoreStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("unknown store strategy '{other}'")),
        }
    }
}

/// Convert a std duration to a chrono one, saturating on overflow
pub(crate) fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}
