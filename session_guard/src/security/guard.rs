//! Login attempt tracking with progressive delay, CAPTCHA escalation and lockout.

use crate::store::timeouts::{MAINTENANCE_TIMEOUT, with_timeout};
use crate::store::{AttemptCounter, CounterStore, MemoryStore, StoreError, to_chrono};
use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Login guard configuration
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Sliding window length for both counters
    pub window: Duration,

    /// Failures per identifier before a hard lock
    pub max_attempts: u32,

    /// Identifier lock duration
    pub lockout: Duration,

    /// Failures per IP, across all identifiers, before the IP is blocked
    pub ip_max_attempts: u32,

    /// IP block duration
    pub ip_lockout: Duration,

    /// Failures per identifier before delays start
    pub soft_threshold: u32,

    /// First delay; doubles with every further failure
    pub base_delay: Duration,

    /// Delay cap
    pub max_delay: Duration,

    /// Failures per identifier before CAPTCHA is required
    pub captcha_threshold: u32,

    /// Budget for each store call before failing open
    pub store_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_attempts: 5,
            lockout: Duration::from_secs(15 * 60),
            ip_max_attempts: 50,
            ip_lockout: Duration::from_secs(60 * 60),
            soft_threshold: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            captcha_threshold: 4,
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl GuardConfig {
    /// Delay imposed after `failures` failures, if any
    ///
    /// `base_delay * 2^(failures - soft_threshold)`, capped at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures < self.soft_threshold {
            return None;
        }
        let exponent = (failures - self.soft_threshold).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

/// Outcome of a login pre-check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginCheck {
    pub allowed: bool,
    /// Seconds until the next attempt may proceed, set when not allowed
    pub retry_after: Option<u64>,
    pub requires_captcha: bool,
    /// Seconds until the identifier drops out of CAPTCHA escalation
    pub captcha_retry_after: Option<u64>,
}

impl LoginCheck {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
            requires_captcha: false,
            captcha_retry_after: None,
        }
    }

    fn blocked(until: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_secs(until, now)),
            requires_captcha: false,
            captcha_retry_after: None,
        }
    }

    /// The more restrictive of two checks wins
    fn combine(self, other: Self) -> Self {
        Self {
            allowed: self.allowed && other.allowed,
            retry_after: self.retry_after.max(other.retry_after),
            requires_captcha: self.requires_captcha || other.requires_captcha,
            captcha_retry_after: self.captcha_retry_after.max(other.captcha_retry_after),
        }
    }
}

/// Whole seconds until `until`, rounded up, at least 1
fn retry_secs(until: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (until - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

fn deadline(from: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    from.checked_add_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Normalize IP address to canonical form
///
/// IPv4-mapped IPv6 addresses collapse to their IPv4 form so one client
/// cannot spread attempts over two counters.
///
/// # Example
///
/// ```
/// use session_guard::security::normalize_ip;
///
/// assert_eq!(normalize_ip("::ffff:192.168.1.1"), "192.168.1.1");
/// assert_eq!(normalize_ip("2001:db8::1"), "2001:db8::1");
/// assert_eq!(normalize_ip("unknown"), "unknown");
/// ```
pub fn normalize_ip(ip: &str) -> String {
    match ip.trim().parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(IpAddr::V4(v4)) => v4.to_string(),
        Err(_) => ip.trim().to_string(),
    }
}

/// Counter key for a login identifier (case-insensitive)
pub fn identifier_key(identifier: &str) -> String {
    format!("login:id:{}", identifier.trim().to_lowercase())
}

/// Counter key for a client IP
pub fn ip_key(ip: &str) -> String {
    format!("login:ip:{}", normalize_ip(ip))
}

/// Guards the login surface against credential guessing.
///
/// Two independent sliding windows are kept per attempt: one per identifier
/// (soft delay, CAPTCHA, hard lock) and one per IP (hard block only, catches
/// stuffing spread across many identifiers). When the shared store fails or
/// times out the guard fails open to an in-process fallback; store errors
/// never reach callers.
pub struct LoginSecurityGuard {
    primary: Arc<dyn CounterStore>,
    fallback: MemoryStore,
    degraded: AtomicBool,
    config: GuardConfig,
}

impl LoginSecurityGuard {
    /// Create a new login guard
    ///
    /// # Arguments
    ///
    /// * `primary` - Shared counter store selected at startup
    /// * `config` - Thresholds, durations and store timeout
    ///
    /// # Returns
    ///
    /// * `LoginSecurityGuard` - New guard with an empty in-process fallback
    pub fn new(primary: Arc<dyn CounterStore>, config: GuardConfig) -> Self {
        Self {
            primary,
            fallback: MemoryStore::new(),
            degraded: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Whether the last store call fell back to in-process counters
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            log::info!("Attempt store recovered, leaving degraded mode");
        }
    }

    fn mark_degraded(&self, error: &StoreError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            log::warn!(
                "Attempt store unavailable, failing open to in-process counters: {}",
                error
            );
        }
    }

    async fn record(&self, key: &str, now: DateTime<Utc>) -> AttemptCounter {
        let window = to_chrono(self.config.window);
        let primary = with_timeout(
            self.config.store_timeout,
            self.primary.record_attempt(key, now, window),
        )
        .await;

        match primary {
            Ok(counter) => {
                self.mark_healthy();
                counter
            }
            Err(e) => {
                self.mark_degraded(&e);
                self.fallback
                    .record_attempt(key, now, window)
                    .await
                    .unwrap_or_else(|_| AttemptCounter::empty(key))
            }
        }
    }

    async fn snapshot(&self, key: &str, now: DateTime<Utc>) -> AttemptCounter {
        let window = to_chrono(self.config.window);
        let primary = with_timeout(
            self.config.store_timeout,
            self.primary.snapshot(key, now, window),
        )
        .await;

        match primary {
            Ok(counter) => {
                self.mark_healthy();
                counter
            }
            Err(e) => {
                self.mark_degraded(&e);
                self.fallback
                    .snapshot(key, now, window)
                    .await
                    .unwrap_or_else(|_| AttemptCounter::empty(key))
            }
        }
    }

    async fn lock(&self, key: &str, until: DateTime<Utc>) {
        let primary = with_timeout(self.config.store_timeout, self.primary.lock_until(key, until)).await;
        match primary {
            Ok(()) => self.mark_healthy(),
            Err(e) => {
                self.mark_degraded(&e);
                let _ = self.fallback.lock_until(key, until).await;
            }
        }
    }

    async fn clear(&self, key: &str) {
        // The fallback may hold counts from a degraded period.
        let _ = self.fallback.clear(key).await;
        match with_timeout(self.config.store_timeout, self.primary.clear(key)).await {
            Ok(()) => self.mark_healthy(),
            Err(e) => self.mark_degraded(&e),
        }
    }

    fn evaluate_identifier(&self, counter: &AttemptCounter, now: DateTime<Utc>) -> LoginCheck {
        let requires_captcha = counter.count >= self.config.captcha_threshold;
        // Events slide out oldest first; the oldest one leaving is the earliest
        // moment the count can fall below the threshold.
        let captcha_retry_after = requires_captcha.then(|| {
            let oldest = counter.window_start.unwrap_or(now);
            retry_secs(deadline(oldest, self.config.window), now)
        });

        let blocked_until = counter.active_lock(now).or_else(|| {
            let last = counter.last_attempt?;
            let until = if counter.count >= self.config.max_attempts {
                // Threshold reached but the lock write was lost
                Some(deadline(last, self.config.lockout))
            } else {
                self.config
                    .delay_for(counter.count)
                    .map(|delay| deadline(last, delay))
            };
            until.filter(|until| *until > now)
        });

        let check = match blocked_until {
            Some(until) => LoginCheck::blocked(until, now),
            None => LoginCheck::allow(),
        };
        LoginCheck {
            requires_captcha,
            captcha_retry_after,
            ..check
        }
    }

    fn evaluate_ip(&self, counter: &AttemptCounter, now: DateTime<Utc>) -> LoginCheck {
        let blocked_until = counter.active_lock(now).or_else(|| {
            let last = counter.last_attempt?;
            (counter.count >= self.config.ip_max_attempts)
                .then(|| deadline(last, self.config.ip_lockout))
                .filter(|until| *until > now)
        });

        match blocked_until {
            Some(until) => LoginCheck::blocked(until, now),
            None => LoginCheck::allow(),
        }
    }

    /// Decide whether a login attempt may proceed
    ///
    /// # Arguments
    ///
    /// * `identifier` - Username or email as typed
    /// * `ip` - Client IP
    ///
    /// # Returns
    ///
    /// * `LoginCheck` - Allowed flag, retry hint and CAPTCHA requirement; when
    ///   both counters block, the larger retry hint wins
    pub async fn check_allowed(&self, identifier: &str, ip: &str) -> LoginCheck {
        let now = Utc::now();
        let id_counter = self.snapshot(&identifier_key(identifier), now).await;
        let ip_counter = self.snapshot(&ip_key(ip), now).await;

        let check = self
            .evaluate_identifier(&id_counter, now)
            .combine(self.evaluate_ip(&ip_counter, now));

        if !check.allowed {
            log::debug!(
                "Login attempt for '{}' from {} held back {:?}s",
                identifier,
                ip,
                check.retry_after
            );
        }
        check
    }

    /// Count a failed login against both the identifier and the IP
    ///
    /// Locks each key whose count reaches its hard threshold.
    pub async fn record_failure(&self, identifier: &str, ip: &str) {
        let now = Utc::now();

        let id_key = identifier_key(identifier);
        let id_counter = self.record(&id_key, now).await;
        if id_counter.count >= self.config.max_attempts {
            self.lock(&id_key, deadline(now, self.config.lockout)).await;
            log::warn!(
                "Identifier '{}' locked after {} failed attempts (last from {})",
                identifier,
                id_counter.count,
                ip
            );
        }

        let ip_key = ip_key(ip);
        let ip_counter = self.record(&ip_key, now).await;
        if ip_counter.count >= self.config.ip_max_attempts {
            self.lock(&ip_key, deadline(now, self.config.ip_lockout)).await;
            log::warn!(
                "IP {} blocked after {} failed attempts",
                ip,
                ip_counter.count
            );
        }
    }

    /// Reset the identifier counter after a successful login
    ///
    /// The IP counter is left untouched, and so is any active lock.
    pub async fn record_success(&self, identifier: &str, _ip: &str) {
        self.clear(&identifier_key(identifier)).await;
    }

    /// Reclaim storage held by stale counters
    pub async fn purge_expired(&self) -> u64 {
        let now = Utc::now();
        let window = to_chrono(self.config.window);

        let fallback = CounterStore::purge_expired(&self.fallback, now, window)
            .await
            .unwrap_or(0);
        match with_timeout(MAINTENANCE_TIMEOUT, self.primary.purge_expired(now, window)).await {
            Ok(purged) => purged + fallback,
            Err(e) => {
                log::warn!("Attempt counter purge failed: {}", e);
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreResult;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    fn create_test_guard(config: GuardConfig) -> LoginSecurityGuard {
        LoginSecurityGuard::new(Arc::new(MemoryStore::new()), config)
    }

    fn counter(count: u32, last: DateTime<Utc>) -> AttemptCounter {
        AttemptCounter {
            count,
            last_attempt: Some(last),
            window_start: Some(last),
            ..AttemptCounter::empty("k")
        }
    }

    #[test]
    fn test_default_config() {
        let config = GuardConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.window.as_secs(), 900);
        assert_eq!(config.ip_max_attempts, 50);
        assert!(config.soft_threshold < config.max_attempts);
    }

    #[test]
    fn test_delay_schedule() {
        let config = GuardConfig::default();
        assert_eq!(config.delay_for(2), None);
        assert_eq!(config.delay_for(3), Some(Duration::from_secs(1)));
        assert_eq!(config.delay_for(4), Some(Duration::from_secs(2)));
        assert_eq!(config.delay_for(5), Some(Duration::from_secs(4)));
        assert_eq!(config.delay_for(100), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_retry_secs_rounds_up() {
        let now = Utc::now();
        assert_eq!(retry_secs(now + ChronoDuration::milliseconds(1), now), 1);
        assert_eq!(retry_secs(now + ChronoDuration::milliseconds(1001), now), 2);
        assert_eq!(retry_secs(now, now), 1);
    }

    #[test]
    fn test_keys_are_normalized() {
        assert_eq!(identifier_key("  Alice@Example.com "), "login:id:alice@example.com");
        assert_eq!(ip_key("::ffff:10.0.0.1"), "login:ip:10.0.0.1");
    }

    #[test]
    fn test_combine_prefers_more_restrictive() {
        let now = Utc::now();
        let short = LoginCheck::blocked(now + ChronoDuration::seconds(5), now);
        let long = LoginCheck::blocked(now + ChronoDuration::seconds(60), now);

        assert_eq!(short.combine(long).retry_after, Some(60));
        assert_eq!(LoginCheck::allow().combine(short).retry_after, Some(5));
        assert!(!LoginCheck::allow().combine(short).allowed);
    }

    #[test]
    fn test_evaluate_identifier_delay_zone() {
        let guard = create_test_guard(GuardConfig::default());
        let now = Utc::now();

        let check = guard.evaluate_identifier(&counter(3, now), now);
        assert!(!check.allowed);
        assert_eq!(check.retry_after, Some(1));
        assert!(!check.requires_captcha);

        let check = guard.evaluate_identifier(&counter(4, now - ChronoDuration::seconds(10)), now);
        assert!(check.allowed, "Delay already elapsed");
        assert!(check.requires_captcha);
        assert_eq!(
            check.captcha_retry_after,
            Some(15 * 60 - 10),
            "Escalation ends when the oldest failure leaves the window"
        );
    }

    #[tokio::test]
    async fn test_lock_after_max_attempts() {
        let guard = create_test_guard(GuardConfig {
            soft_threshold: 10,
            captcha_threshold: 10,
            ..GuardConfig::default()
        });

        for _ in 0..4 {
            guard.record_failure("u1", "10.0.0.1").await;
            assert!(guard.check_allowed("u1", "10.0.0.1").await.allowed);
        }
        guard.record_failure("u1", "10.0.0.1").await;

        let check = guard.check_allowed("u1", "10.0.0.1").await;
        assert!(!check.allowed);
        assert!(check.retry_after.unwrap() > 14 * 60);
    }

    #[tokio::test]
    async fn test_success_keeps_lock() {
        let guard = create_test_guard(GuardConfig {
            max_attempts: 1,
            ..GuardConfig::default()
        });

        guard.record_failure("u1", "10.0.0.1").await;
        guard.record_success("u1", "10.0.0.1").await;

        assert!(!guard.check_allowed("u1", "10.0.0.1").await.allowed);
    }

    #[tokio::test]
    async fn test_ip_block_spans_identifiers() {
        let guard = create_test_guard(GuardConfig {
            ip_max_attempts: 3,
            ..GuardConfig::default()
        });

        for user in ["a", "b", "c"] {
            guard.record_failure(user, "10.0.0.9").await;
        }

        let check = guard.check_allowed("fresh", "10.0.0.9").await;
        assert!(!check.allowed);
        assert!(check.retry_after.unwrap() > 59 * 60);
        assert!(guard.check_allowed("fresh", "10.0.0.10").await.allowed);
    }

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        async fn record_attempt(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: ChronoDuration,
        ) -> StoreResult<AttemptCounter> {
            Err(StoreError::Corrupt("down".into()))
        }
        async fn snapshot(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: ChronoDuration,
        ) -> StoreResult<AttemptCounter> {
            Err(StoreError::Corrupt("down".into()))
        }
        async fn clear(&self, _: &str) -> StoreResult<()> {
            Err(StoreError::Corrupt("down".into()))
        }
        async fn lock_until(&self, _: &str, _: DateTime<Utc>) -> StoreResult<()> {
            Err(StoreError::Corrupt("down".into()))
        }
        async fn purge_expired(&self, _: DateTime<Utc>, _: ChronoDuration) -> StoreResult<u64> {
            Err(StoreError::Corrupt("down".into()))
        }
    }

    #[tokio::test]
    async fn test_fails_open_to_fallback() {
        let guard = LoginSecurityGuard::new(
            Arc::new(FailingStore),
            GuardConfig {
                max_attempts: 2,
                soft_threshold: 10,
                captcha_threshold: 10,
                ..GuardConfig::default()
            },
        );

        assert!(guard.check_allowed("u1", "10.0.0.1").await.allowed);
        assert!(guard.is_degraded());

        // Fallback still enforces limits.
        guard.record_failure("u1", "10.0.0.1").await;
        guard.record_failure("u1", "10.0.0.1").await;
        assert!(!guard.check_allowed("u1", "10.0.0.1").await.allowed);
        assert_eq!(guard.purge_expired().await, 0);
    }

    proptest! {
        #[test]
        fn prop_delay_is_monotonic_and_capped(failures in 0u32..200) {
            let config = GuardConfig::default();
            let current = config.delay_for(failures).unwrap_or(Duration::ZERO);
            let next = config.delay_for(failures + 1).unwrap_or(Duration::ZERO);

            prop_assert!(current <= next);
            prop_assert!(next <= config.max_delay);
        }

        #[test]
        fn prop_no_delay_below_soft_threshold(soft in 1u32..20, failures in 0u32..20) {
            let config = GuardConfig { soft_threshold: soft, ..GuardConfig::default() };
            prop_assert_eq!(config.delay_for(failures).is_some(), failures >= soft);
        }
    }
}
