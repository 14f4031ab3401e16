//! Redis-backed fast store.
//!
//! Attempt windows are sorted sets scored by epoch milliseconds, trimmed and
//! counted inside one Lua script so concurrent failures are never lost.
//! Sessions and remember tokens are hashes expiring with the record. The
//! per-user index sets expire with their longest-lived member; user
//! generations are plain `INCR` counters.

use super::{AttemptCounter, CounterStore, RememberTokenFilter, SessionStore, StoreError, StoreResult};
use crate::auth::UserId;
use crate::session::{DestroyReason, RememberToken, Session};
use ::redis::{AsyncCommands, Script, aio::ConnectionManager};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

const RECORD_SCRIPT: &str = r#"
local events = KEYS[1]
local lock = KEYS[2]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

redis.call('ZREMRANGEBYSCORE', events, '-inf', now - window)
redis.call('ZADD', events, now, ARGV[3])
redis.call('PEXPIRE', events, window)

local count = redis.call('ZCARD', events)
local first = redis.call('ZRANGE', events, 0, 0, 'WITHSCORES')
local last = redis.call('ZRANGE', events, -1, -1, 'WITHSCORES')
local locked = redis.call('GET', lock)
return {count, first[2] or '', last[2] or '', locked or ''}
"#;

const SNAPSHOT_SCRIPT: &str = r#"
local events = KEYS[1]
local lock = KEYS[2]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

redis.call('ZREMRANGEBYSCORE', events, '-inf', now - window)

local count = redis.call('ZCARD', events)
local first = redis.call('ZRANGE', events, 0, 0, 'WITHSCORES')
local last = redis.call('ZRANGE', events, -1, -1, 'WITHSCORES')
local locked = redis.call('GET', lock)
return {count, first[2] or '', last[2] or '', locked or ''}
"#;

const LOCK_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local until_ms = tonumber(ARGV[1])
if until_ms > current then
    redis.call('SET', KEYS[1], ARGV[1])
    redis.call('PEXPIREAT', KEYS[1], until_ms)
end
return 1
"#;

const INSERT_INDEXED_SCRIPT: &str = r#"
local record = KEYS[1]
local index = KEYS[2]
local remaining = tonumber(ARGV[2])

redis.call('HSET', record, unpack(ARGV, 4))
redis.call('PEXPIREAT', record, tonumber(ARGV[1]))
redis.call('SADD', index, ARGV[3])
if redis.call('PTTL', index) < remaining then
    redis.call('PEXPIRE', index, remaining)
end
return 1
"#;

const TOUCH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
if redis.call('HGET', KEYS[1], 'revoked') == '1' then return 0 end
redis.call('HSET', KEYS[1], 'last_activity_at', ARGV[1])
if ARGV[2] ~= '' then
    redis.call('HSET', KEYS[1], 'expires_at', ARGV[2])
    redis.call('PEXPIREAT', KEYS[1], tonumber(ARGV[2]))
    local remaining = tonumber(ARGV[3])
    if redis.call('PTTL', KEYS[2]) < remaining then
        redis.call('PEXPIRE', KEYS[2], remaining)
    end
end
return 1
"#;

const REVOKE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
if redis.call('HGET', KEYS[1], 'revoked') == '1' then return 0 end
redis.call('HSET', KEYS[1], 'revoked', '1', 'revoked_reason', ARGV[1])
return 1
"#;

const RESTAMP_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
if redis.call('HGET', KEYS[1], 'revoked') == '1' then return 0 end
redis.call('HSET', KEYS[1], 'generation', ARGV[1])
return 1
"#;

const TAKE_SCRIPT: &str = r#"
local fields = redis.call('HGETALL', KEYS[1])
if #fields > 0 then
    redis.call('DEL', KEYS[1])
end
return fields
"#;

/// Redis implementation of both store traits
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to Redis with an auto-reconnecting connection manager
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: "sg".to_string(),
        }
    }

    /// Namespace every key, e.g. per environment
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, kind: &str, id: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, kind, id)
    }

    /// Write a record hash and add it to a user index in one script.
    ///
    /// The index expiry is only ever extended, never shortened.
    async fn insert_indexed(
        &self,
        record: String,
        index: String,
        member: &str,
        expires_at: DateTime<Utc>,
        fields: &[(&'static str, String)],
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let script = Script::new(INSERT_INDEXED_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(record)
            .key(index)
            .arg(expires_at.timestamp_millis())
            .arg(remaining_millis(expires_at))
            .arg(member);
        for (name, value) in fields {
            invocation.arg(*name).arg(value);
        }
        let _: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn run_window_script(
        &self,
        script: &str,
        key: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<AttemptCounter> {
        let mut conn = self.conn.clone();
        let now_ms = at.timestamp_millis();
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        let (count, first, last, locked): (u32, String, String, String) = Script::new(script)
            .key(self.key("attempts", key))
            .key(self.key("lock", key))
            .arg(now_ms)
            .arg(window.num_milliseconds().max(1))
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(AttemptCounter {
            key: key.to_string(),
            window_start: parse_optional_millis(&first)?,
            last_attempt: parse_optional_millis(&last)?,
            count,
            locked_until: parse_optional_millis(&locked)?,
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn record_attempt(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<AttemptCounter> {
        self.run_window_script(RECORD_SCRIPT, key, at, window).await
    }

    async fn snapshot(
        &self,
        key: &str,
        at: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<AttemptCounter> {
        self.run_window_script(SNAPSHOT_SCRIPT, key, at, window).await
    }

    async fn clear(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(self.key("attempts", key)).await?;
        Ok(())
    }

    async fn lock_until(&self, key: &str, until: DateTime<Utc>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(LOCK_SCRIPT)
            .key(self.key("lock", key))
            .arg(until.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, _at: DateTime<Utc>, _window: Duration) -> StoreResult<u64> {
        // Windows and locks carry their own expiry.
        Ok(0)
    }
}

#[async_trait]
impl SessionStore for RedisStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        self.insert_indexed(
            self.key("session", &session.session_id),
            self.key("user_sessions", &session.user_id.to_string()),
            &session.session_id,
            session.expires_at,
            &session_fields(session),
        )
        .await
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(self.key("session", session_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }
        parse_session(&map).map(Some)
    }

    async fn touch_session(
        &self,
        session_id: &str,
        last_activity_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        // The owner is only known from the hash itself.
        let owner: Option<String> = conn.hget(self.key("session", session_id), "user_id").await?;
        let Some(owner) = owner else {
            return Ok(false);
        };

        let touched: i64 = Script::new(TOUCH_SCRIPT)
            .key(self.key("session", session_id))
            .key(self.key("user_sessions", &owner))
            .arg(last_activity_at.timestamp_millis())
            .arg(
                expires_at
                    .map(|e| e.timestamp_millis().to_string())
                    .unwrap_or_default(),
            )
            .arg(expires_at.map(remaining_millis).unwrap_or(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(touched == 1)
    }

    async fn revoke_session(&self, session_id: &str, reason: DestroyReason) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let revoked: i64 = Script::new(REVOKE_SCRIPT)
            .key(self.key("session", session_id))
            .arg(reason.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(revoked == 1)
    }

    async fn set_session_generation(
        &self,
        session_id: &str,
        generation: u64,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let stamped: i64 = Script::new(RESTAMP_SCRIPT)
            .key(self.key("session", session_id))
            .arg(generation)
            .invoke_async(&mut conn)
            .await?;
        Ok(stamped == 1)
    }

    async fn list_user_sessions(&self, user_id: UserId) -> StoreResult<Vec<Session>> {
        let mut conn = self.conn.clone();
        let index = self.key("user_sessions", &user_id.to_string());
        let ids: Vec<String> = conn.smembers(&index).await?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            let map: HashMap<String, String> = conn.hgetall(self.key("session", &id)).await?;
            if map.is_empty() {
                // Expired out of Redis; drop the dangling index entry.
                let _: i64 = conn.srem(&index, &id).await?;
                continue;
            }
            sessions.push(parse_session(&map)?);
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn current_generation(&self, user_id: UserId) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let generation: Option<u64> = conn
            .get(self.key("generation", &user_id.to_string()))
            .await?;
        Ok(generation.unwrap_or(0))
    }

    async fn bump_generation(&self, user_id: UserId) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let generation: u64 = conn
            .incr(self.key("generation", &user_id.to_string()), 1)
            .await?;
        Ok(generation)
    }

    async fn insert_remember_token(&self, token: &RememberToken) -> StoreResult<()> {
        let fields = [
            ("token_id", token.token_id.clone()),
            ("user_id", token.user_id.to_string()),
            ("originating_session_id", token.originating_session_id.clone()),
            ("device_fingerprint", token.device_fingerprint.clone()),
            ("expires_at", token.expires_at.timestamp_millis().to_string()),
            ("rotation_count", token.rotation_count.to_string()),
            ("generation", token.generation.to_string()),
        ];

        self.insert_indexed(
            self.key("remember", &token.token_id),
            self.key("user_remember", &token.user_id.to_string()),
            &token.token_id,
            token.expires_at,
            &fields,
        )
        .await
    }

    async fn take_remember_token(&self, token_id: &str) -> StoreResult<Option<RememberToken>> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = Script::new(TAKE_SCRIPT)
            .key(self.key("remember", token_id))
            .invoke_async(&mut conn)
            .await?;
        if flat.is_empty() {
            return Ok(None);
        }

        let map: HashMap<String, String> = flat
            .chunks(2)
            .filter_map(|pair| match pair {
                [k, v] => Some((k.clone(), v.clone())),
                _ => None,
            })
            .collect();
        let token = parse_remember_token(&map)?;

        let _: i64 = conn
            .srem(
                self.key("user_remember", &token.user_id.to_string()),
                token_id,
            )
            .await?;
        Ok(Some(token))
    }

    async fn delete_remember_tokens(
        &self,
        user_id: UserId,
        filter: RememberTokenFilter,
    ) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        let index = self.key("user_remember", &user_id.to_string());
        let ids: Vec<String> = conn.smembers(&index).await?;

        let mut deleted = 0;
        for id in ids {
            let key = self.key("remember", &id);
            let origin: Option<String> = conn.hget(&key, "originating_session_id").await?;
            match origin {
                None => {
                    let _: i64 = conn.srem(&index, &id).await?;
                }
                Some(origin) if filter.matches(&origin) => {
                    let removed: i64 = conn.del(&key).await?;
                    let _: i64 = conn.srem(&index, &id).await?;
                    deleted += removed as u64;
                }
                Some(_) => {}
            }
        }
        Ok(deleted)
    }

    async fn purge_expired(&self, _at: DateTime<Utc>) -> StoreResult<u64> {
        // Session and remember-token hashes expire natively.
        Ok(0)
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn session_fields(session: &Session) -> Vec<(&'static str, String)> {
    vec![
        ("session_id", session.session_id.clone()),
        ("user_id", session.user_id.to_string()),
        ("created_at", session.created_at.timestamp_millis().to_string()),
        ("expires_at", session.expires_at.timestamp_millis().to_string()),
        (
            "last_activity_at",
            session.last_activity_at.timestamp_millis().to_string(),
        ),
        ("device_fingerprint", session.device_fingerprint.clone()),
        ("remember_me", if session.remember_me { "1" } else { "0" }.to_string()),
        ("generation", session.generation.to_string()),
        ("revoked", if session.revoked { "1" } else { "0" }.to_string()),
        (
            "revoked_reason",
            session
                .revoked_reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
        ),
    ]
}

fn parse_session(map: &HashMap<String, String>) -> StoreResult<Session> {
    let revoked_reason = match map.get("revoked_reason").map(String::as_str) {
        None | Some("") => None,
        Some(reason) => Some(DestroyReason::from_str(reason).map_err(StoreError::Corrupt)?),
    };

    Ok(Session {
        session_id: field(map, "session_id")?,
        user_id: field(map, "user_id")?,
        created_at: millis_field(map, "created_at")?,
        expires_at: millis_field(map, "expires_at")?,
        last_activity_at: millis_field(map, "last_activity_at")?,
        device_fingerprint: field(map, "device_fingerprint")?,
        remember_me: field::<String>(map, "remember_me")? == "1",
        generation: field(map, "generation")?,
        revoked: field::<String>(map, "revoked")? == "1",
        revoked_reason,
    })
}

fn parse_remember_token(map: &HashMap<String, String>) -> StoreResult<RememberToken> {
    Ok(RememberToken {
        token_id: field(map, "token_id")?,
        user_id: field(map, "user_id")?,
        originating_session_id: field(map, "originating_session_id")?,
        device_fingerprint: field(map, "device_fingerprint")?,
        expires_at: millis_field(map, "expires_at")?,
        rotation_count: field(map, "rotation_count")?,
        generation: field(map, "generation")?,
    })
}

/// Milliseconds until `expires_at`, at least one so PEXPIRE stays valid
fn remaining_millis(expires_at: DateTime<Utc>) -> i64 {
    (expires_at - Utc::now()).num_milliseconds().max(1)
}

fn field<T: FromStr>(map: &HashMap<String, String>, name: &str) -> StoreResult<T> {
    map.get(name)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| StoreError::Corrupt(format!("missing or invalid field '{name}'")))
}

fn millis_field(map: &HashMap<String, String>, name: &str) -> StoreResult<DateTime<Utc>> {
    let millis: i64 = field(map, name)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range in '{name}'")))
}

/// Scores come back as strings, possibly in float notation
fn parse_optional_millis(raw: &str) -> StoreResult<Option<DateTime<Utc>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let millis = raw
        .parse::<f64>()
        .map_err(|_| StoreError::Corrupt(format!("invalid timestamp '{raw}'")))?
        as i64;
    Ok(DateTime::from_timestamp_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_store() -> RedisStore {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisStore::connect(&url)
            .await
            .expect("Failed to connect to test Redis")
            .with_key_prefix(format!("sg_test_{}", Uuid::new_v4()))
    }

    #[test]
    fn test_parse_optional_millis() {
        assert_eq!(parse_optional_millis("").unwrap(), None);
        let parsed = parse_optional_millis("1700000000000").unwrap().unwrap();
        assert_eq!(parsed.timestamp_millis(), 1_700_000_000_000);
        assert!(parse_optional_millis("nope").is_err());
    }

    #[test]
    fn test_session_fields_parse_back() {
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        let session = Session {
            session_id: "abc".to_string(),
            user_id: 42,
            created_at: now,
            expires_at: now + Duration::minutes(30),
            last_activity_at: now,
            device_fingerprint: "fp".to_string(),
            remember_me: true,
            generation: 3,
            revoked: true,
            revoked_reason: Some(DestroyReason::Security),
        };

        let map: HashMap<String, String> = session_fields(&session)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(parse_session(&map).unwrap(), session);
    }

    #[test]
    fn test_parse_session_rejects_missing_fields() {
        let map = HashMap::from([("session_id".to_string(), "abc".to_string())]);
        assert!(matches!(parse_session(&map), Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_redis_health_check() {
        let store = create_test_store().await;
        SessionStore::health_check(&store).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_redis_concurrent_attempts_all_counted() {
        let store = create_test_store().await;
        let mut handles = Vec::new();
        for _ in 0..2 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .record_attempt("login:id:u2", Utc::now(), Duration::seconds(60))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let counter = store
            .snapshot("login:id:u2", Utc::now(), Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(counter.count, 2);
    }

    #[test]
    fn test_remaining_millis_never_below_one() {
        assert_eq!(remaining_millis(Utc::now() - Duration::minutes(1)), 1);
        let ahead = remaining_millis(Utc::now() + Duration::minutes(1));
        assert!(ahead > 59_000 && ahead <= 60_000);
    }

    async fn index_ttl(store: &RedisStore, kind: &str, user_id: UserId) -> i64 {
        let mut conn = store.conn.clone();
        conn.pttl(store.key(kind, &user_id.to_string())).await.unwrap()
    }

    fn test_session(id: &str, user_id: UserId, ttl: Duration) -> Session {
        let now = Utc::now();
        Session {
            session_id: id.to_string(),
            user_id,
            created_at: now,
            expires_at: now + ttl,
            last_activity_at: now,
            device_fingerprint: "fp".to_string(),
            remember_me: false,
            generation: 0,
            revoked: false,
            revoked_reason: None,
        }
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_redis_user_indexes_expire_with_longest_member() {
        let store = create_test_store().await;

        store
            .insert_session(&test_session("long", 9, Duration::hours(2)))
            .await
            .unwrap();
        store
            .insert_session(&test_session("short", 9, Duration::minutes(5)))
            .await
            .unwrap();
        let ttl = index_ttl(&store, "user_sessions", 9).await;
        assert!(
            ttl > Duration::minutes(100).num_milliseconds(),
            "A shorter member must not shorten the index, got {ttl}ms"
        );

        assert!(
            store
                .touch_session("short", Utc::now(), Some(Utc::now() + Duration::hours(3)))
                .await
                .unwrap()
        );
        let ttl = index_ttl(&store, "user_sessions", 9).await;
        assert!(ttl > Duration::minutes(170).num_milliseconds());

        let token = RememberToken {
            token_id: "tok-ttl".to_string(),
            user_id: 9,
            originating_session_id: "long".to_string(),
            device_fingerprint: "fp".to_string(),
            expires_at: Utc::now() + Duration::days(1),
            rotation_count: 0,
            generation: 0,
        };
        store.insert_remember_token(&token).await.unwrap();
        let ttl = index_ttl(&store, "user_remember", 9).await;
        assert!(ttl > Duration::hours(23).num_milliseconds() && ttl <= Duration::days(1).num_milliseconds());
    }

    #[tokio::test]
    #[ignore = "Requires Redis"]
    async fn test_redis_remember_token_taken_once() {
        let store = create_test_store().await;
        let token = RememberToken {
            token_id: "tok".to_string(),
            user_id: 5,
            originating_session_id: "s".to_string(),
            device_fingerprint: "fp".to_string(),
            expires_at: Utc::now() + Duration::days(1),
            rotation_count: 0,
            generation: 0,
        };
        store.insert_remember_token(&token).await.unwrap();

        assert!(store.take_remember_token("tok").await.unwrap().is_some());
        assert!(store.take_remember_token("tok").await.unwrap().is_none());
    }
}
