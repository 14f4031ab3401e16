//! Server configuration management.
//!
//! Consolidates all environment variable reads and provides validated configuration.

use session_guard::auth::{TokenConfig, VerificationPolicy};
use session_guard::db::DatabaseConfig;
use session_guard::security::GuardConfig;
use session_guard::session::{FingerprintMode, SessionConfig};
use session_guard::store::StoreStrategy;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "postgres://postgres@localhost/session_guard";

/// Values given on the command line, taking precedence over the environment
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<SocketAddr>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub store: Option<StoreStrategy>,
}

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind address
    pub bind: SocketAddr,
    /// Prometheus exporter address; disabled when unset
    pub metrics_bind: Option<SocketAddr>,
    /// Backend for attempt counters and sessions
    pub store: StoreStrategy,
    /// Credentials always live in PostgreSQL
    pub database: DatabaseConfig,
    pub redis_url: Option<String>,
    pub security: SecurityConfig,
    pub session: SessionConfig,
    pub guard: GuardConfig,
    pub verification: VerificationPolicy,
    /// Period of the purge task; `None` disables it
    pub cleanup_interval: Option<Duration>,
    /// Peers allowed to set `X-Forwarded-For` / `X-Real-IP`
    pub trusted_proxies: TrustedProxies,
}

/// Reverse proxies whose forwarding headers name the real client.
///
/// Empty by default: the TCP peer is the client and forwarding headers are
/// ignored, so a caller cannot pick its own IP counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedProxies(Vec<IpAddr>);

impl TrustedProxies {
    pub fn new(proxies: impl IntoIterator<Item = IpAddr>) -> Self {
        Self(proxies.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn trusts(&self, peer: IpAddr) -> bool {
        let peer = peer.to_canonical();
        self.0.iter().any(|proxy| proxy.to_canonical() == peer)
    }
}

impl FromStr for TrustedProxies {
    type Err = String;

    /// Comma-separated IP addresses
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<IpAddr>()
                    .map_err(|_| format!("'{entry}' is not an IP address"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// Secrets and token settings
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// JWT signing secret (required)
    pub jwt_secret: String,
    /// Password hashing pepper (required)
    pub password_pepper: String,
    pub token_issuer: String,
    pub token_audience: String,
    pub token_ttl: Duration,
}

impl SecurityConfig {
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            secret: self.jwt_secret.clone(),
            issuer: self.token_issuer.clone(),
            audience: self.token_audience.clone(),
            ttl: self.token_ttl,
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}\nHint: {hint}")]
    MissingRequired { var: String, hint: String },

    #[error("Invalid configuration for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

impl ConfigError {
    fn invalid(var: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var: var.to_string(),
            reason: reason.into(),
        }
    }
}

/// Typed access to a variable source
struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str, hint: &str) -> Result<String, ConfigError> {
        self.raw(key).ok_or_else(|| ConfigError::MissingRequired {
            var: key.to_string(),
            hint: hint.to_string(),
        })
    }

    /// Parse `key`, falling back to `default` when unset
    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.raw(key) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid(key, format!("cannot parse '{value}'"))),
            None => Ok(default),
        }
    }

    fn secs_or(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse_or(key, default).map(Duration::from_secs)
    }

    fn millis_or(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse_or(key, default).map(Duration::from_millis)
    }

    /// For enums whose `FromStr` error is a message
    fn choice_or<T: FromStr<Err = String>>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.raw(key) {
            Some(value) => value.parse().map_err(|e: String| ConfigError::invalid(key, e)),
            None => Ok(default),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    ///
    /// # Arguments
    ///
    /// * `overrides` - Values given on the command line
    ///
    /// # Errors
    ///
    /// Returns error if required variables are missing or unparsable
    pub fn from_env(overrides: CliOverrides) -> Result<Self, ConfigError> {
        Self::from_lookup(overrides, |key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup(
        overrides: CliOverrides,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let bind = match overrides.bind {
            Some(bind) => bind,
            None => env.parse_or("SERVER_BIND", default_bind())?,
        };
        let metrics_bind = match env.raw("METRICS_BIND") {
            Some(_) => Some(env.parse_or("METRICS_BIND", default_bind())?),
            None => None,
        };

        let store = match overrides.store {
            Some(store) => store,
            None => env.choice_or("STORE_STRATEGY", StoreStrategy::Memory)?,
        };

        let database_url = overrides
            .database_url
            .or_else(|| env.raw("DATABASE_URL"))
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let database = DatabaseConfig::from_env(database_url)
            .map_err(|reason| ConfigError::invalid("DB_*", reason))?;
        let redis_url = overrides.redis_url.or_else(|| env.raw("REDIS_URL"));

        let jwt_secret = env.required("JWT_SECRET", "Generate with: openssl rand -hex 32")?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::invalid(
                "JWT_SECRET",
                "Must be at least 32 characters",
            ));
        }
        let password_pepper =
            env.required("PASSWORD_PEPPER", "Generate with: openssl rand -hex 16")?;
        if password_pepper.len() < 16 {
            return Err(ConfigError::invalid(
                "PASSWORD_PEPPER",
                "Must be at least 16 characters",
            ));
        }

        let security = SecurityConfig {
            jwt_secret,
            password_pepper,
            token_issuer: env.parse_or("TOKEN_ISSUER", "session-guard".to_string())?,
            token_audience: env.parse_or("TOKEN_AUDIENCE", "session-guard-clients".to_string())?,
            token_ttl: env.secs_or("TOKEN_TTL_SECS", 60 * 60)?,
        };

        let store_timeout = env.millis_or("STORE_TIMEOUT_MS", 2000)?;

        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            session_ttl: env.secs_or("SESSION_TTL_SECS", session_defaults.session_ttl.as_secs())?,
            remember_ttl: env.secs_or(
                "REMEMBER_TTL_SECS",
                session_defaults.remember_ttl.as_secs(),
            )?,
            fingerprint_mode: env.choice_or("FINGERPRINT_MODE", FingerprintMode::Strict)?,
            store_timeout,
        };

        let g = GuardConfig::default();
        let guard = GuardConfig {
            window: env.secs_or("LOGIN_WINDOW_SECS", g.window.as_secs())?,
            max_attempts: env.parse_or("LOGIN_MAX_ATTEMPTS", g.max_attempts)?,
            lockout: env.secs_or("LOGIN_LOCKOUT_SECS", g.lockout.as_secs())?,
            ip_max_attempts: env.parse_or("LOGIN_IP_MAX_ATTEMPTS", g.ip_max_attempts)?,
            ip_lockout: env.secs_or("LOGIN_IP_LOCKOUT_SECS", g.ip_lockout.as_secs())?,
            soft_threshold: env.parse_or("LOGIN_SOFT_THRESHOLD", g.soft_threshold)?,
            base_delay: env.millis_or("LOGIN_BASE_DELAY_MS", g.base_delay.as_millis() as u64)?,
            max_delay: env.secs_or("LOGIN_MAX_DELAY_SECS", g.max_delay.as_secs())?,
            captcha_threshold: env.parse_or("LOGIN_CAPTCHA_THRESHOLD", g.captcha_threshold)?,
            store_timeout,
        };

        let cleanup_secs: u64 = env.parse_or("CLEANUP_INTERVAL_SECS", 300)?;

        Ok(ServerConfig {
            bind,
            metrics_bind,
            store,
            database,
            redis_url,
            security,
            session,
            guard,
            verification: env.choice_or("VERIFICATION_POLICY", VerificationPolicy::EnforceAll)?,
            cleanup_interval: (cleanup_secs > 0).then(|| Duration::from_secs(cleanup_secs)),
            trusted_proxies: env.choice_or("TRUSTED_PROXIES", TrustedProxies::default())?,
        })
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.security.token_ttl < self.session.session_ttl {
            return Err(ConfigError::invalid(
                "TOKEN_TTL_SECS",
                format!(
                    "Must not be shorter than the session lifetime ({}s)",
                    self.session.session_ttl.as_secs()
                ),
            ));
        }

        if self.session.session_ttl.is_zero() {
            return Err(ConfigError::invalid("SESSION_TTL_SECS", "Must be greater than 0"));
        }

        if self.session.remember_ttl < self.session.session_ttl {
            return Err(ConfigError::invalid(
                "REMEMBER_TTL_SECS",
                "Must not be shorter than the session lifetime",
            ));
        }

        if self.guard.max_attempts == 0 || self.guard.ip_max_attempts == 0 {
            return Err(ConfigError::invalid(
                "LOGIN_MAX_ATTEMPTS",
                "Attempt thresholds must be greater than 0",
            ));
        }

        if self.guard.soft_threshold > self.guard.max_attempts {
            return Err(ConfigError::invalid(
                "LOGIN_SOFT_THRESHOLD",
                format!(
                    "Must not exceed LOGIN_MAX_ATTEMPTS ({})",
                    self.guard.max_attempts
                ),
            ));
        }

        if self.guard.base_delay > self.guard.max_delay {
            return Err(ConfigError::invalid(
                "LOGIN_BASE_DELAY_MS",
                "Must not exceed LOGIN_MAX_DELAY_SECS",
            ));
        }

        if self.guard.window.is_zero() {
            return Err(ConfigError::invalid("LOGIN_WINDOW_SECS", "Must be greater than 0"));
        }

        if self.guard.store_timeout.is_zero() {
            return Err(ConfigError::invalid("STORE_TIMEOUT_MS", "Must be greater than 0"));
        }

        if self.store == StoreStrategy::Redis && self.redis_url.is_none() {
            return Err(ConfigError::MissingRequired {
                var: "REDIS_URL".to_string(),
                hint: "Required with the redis store, e.g. redis://127.0.0.1:6379".to_string(),
            });
        }

        Ok(())
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}
