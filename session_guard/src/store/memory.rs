//! In-process store.
//!
//! Backs single-node deployments and tests, and is always kept as the
//! guard's fail-open fallback. Each operation takes one write lock, which
//! makes every call atomic with respect to the others.

use super::{
    AttemptCounter, CounterStore, RememberTokenFilter, SessionStore, StoreResult,
};
use crate::auth::UserId;
use crate::session::{DestroyReason, RememberToken, Session};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct CounterEntry {
    events: VecDeque<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
}

impl CounterEntry {
    fn trim(&mut self, at: DateTime<Utc>, window: Duration) {
        let cutoff = at.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.events.retain(|event| *event > cutoff);
    }

    fn to_counter(&self, key: &str) -> AttemptCounter {
        AttemptCounter {
            key: key.to_string(),
            window_start: self.events.iter().min().copied(),
            last_attempt: self.events.iter().max().copied(),
            count: self.events.len() as u32,
            locked_until: self.locked_until,
        }
    }

    fn is_stale(&self, at: DateTime<Utc>) -> bool {
        self.events.is_empty() && self.locked_until.is_none_or(|until| until <= at)
    }
}

#[derive(Debug, Default)]
struct SessionTables {
    sessions: HashMap<String, Session>,
    generations: HashMap<UserId, u64>,
    remember_tokens: HashMap<String, RememberToken>,
}

/// In-memory implementation of both store traits
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    counters: Arc<RwLock<HashMap<String, CounterEntry>>>,
    sessions: Arc<RwLock<SessionTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn record_attempt(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<AttemptCounter> {
        let mut counters = self.counters.write().await;
        let entry = counters.entry(key.to_string()).or_default();
        entry.trim(at, window);
        entry.events.push_back(at);
        Ok(entry.to_counter(key))
    }

    async fn snapshot(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<AttemptCounter> {
        let mut counters = self.counters.write().await;
        match counters.get_mut(key) {
            Some(entry) => {
                entry.trim(at, window);
                let counter = entry.to_counter(key);
                if entry.is_stale(at) {
                    counters.remove(key);
                }
                Ok(counter)
            }
            None => Ok(AttemptCounter::empty(key)),
        }
    }

    async fn clear(&self, key: &str) -> StoreResult<()> {
        let mut counters = self.counters.write().await;
        if let Some(entry) = counters.get_mut(key) {
            entry.events.clear();
            if entry.locked_until.is_none() {
                counters.remove(key);
            }
        }
        Ok(())
    }

    async fn lock_until(&self, key: &str, until: DateTime<Utc>) -> StoreResult<()> {
        let mut counters = self.counters.write().await;
        let entry = counters.entry(key.to_string()).or_default();
        entry.locked_until = Some(entry.locked_until.map_or(until, |current| current.max(until)));
        Ok(())
    }

    async fn purge_expired(&self, at: DateTime<Utc>, window: Duration) -> StoreResult<u64> {
        let mut counters = self.counters.write().await;
        let before = counters.len();
        counters.retain(|_, entry| {
            entry.trim(at, window);
            if entry.locked_until.is_some_and(|until| until <= at) {
                entry.locked_until = None;
            }
            !entry.is_stale(at)
        });
        Ok((before - counters.len()) as u64)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        self.sessions
            .write()
            .await
            .sessions
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        Ok(self.sessions.read().await.sessions.get(session_id).cloned())
    }

    async fn touch_session(
        &self,
        session_id: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let mut tables = self.sessions.write().await;
        match tables.sessions.get_mut(session_id) {
            Some(session) if !session.revoked => {
                session.last_activity_at = last_activity_at;
                if let Some(expires_at) = expires_at {
                    session.expires_at = expires_at;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_session(&self, session_id: &str, reason: DestroyReason) -> StoreResult<bool> {
        let mut tables = self.sessions.write().await;
        match tables.sessions.get_mut(session_id) {
            Some(session) if !session.revoked => {
                session.revoked = true;
                session.revoked_reason = Some(reason);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_session_generation(
        &self,
        session_id: &str,
        generation: u64,
    ) -> StoreResult<bool> {
        let mut tables = self.sessions.write().await;
        match tables.sessions.get_mut(session_id) {
            Some(session) if !session.revoked => {
                session.generation = generation;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_user_sessions(&self, user_id: UserId) -> StoreResult<Vec<Session>> {
        let tables = self.sessions.read().await;
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn current_generation(&self, user_id: UserId) -> StoreResult<u64> {
        Ok(self
            .sessions
            .read()
            .await
            .generations
            .get(&user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn bump_generation(&self, user_id: UserId) -> StoreResult<u64> {
        let mut tables = self.sessions.write().await;
        let generation = tables.generations.entry(user_id).or_insert(0);
        *generation += 1;
        Ok(*generation)
    }

    async fn insert_remember_token(&self, token: &RememberToken) -> StoreResult<()> {
        self.sessions
            .write()
            .await
            .remember_tokens
            .insert(token.token_id.clone(), token.clone());
        Ok(())
    }

    async fn take_remember_token(&self, token_id: &str) -> StoreResult<Option<RememberToken>> {
        Ok(self.sessions.write().await.remember_tokens.remove(token_id))
    }

    async fn delete_remember_tokens(
        &self,
        user_id: UserId,
        filter: RememberTokenFilter,
    ) -> StoreResult<u64> {
        let mut tables = self.sessions.write().await;
        let before = tables.remember_tokens.len();
        tables.remember_tokens.retain(|_, token| {
            !(token.user_id == user_id && filter.matches(&token.originating_session_id))
        });
        Ok((before - tables.remember_tokens.len()) as u64)
    }

    async fn purge_expired(&self, at: DateTime<Utc>) -> StoreResult<u64> {
        let mut tables = self.sessions.write().await;
        let before = tables.sessions.len() + tables.remember_tokens.len();
        tables.sessions.retain(|_, s| !s.is_expired(at));
        tables.remember_tokens.retain(|_, t| t.expires_at > at);
        let after = tables.sessions.len() + tables.remember_tokens.len();
        Ok((before - after) as u64)
    }
}
