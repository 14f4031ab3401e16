//! Database pool configuration.

use std::env;
use std::str::FromStr;

/// PostgreSQL pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    pub connection_timeout_secs: u64,

    pub idle_timeout_secs: u64,

    pub max_lifetime_secs: u64,
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{name} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl DatabaseConfig {
    /// Pool settings for `database_url` with the remaining values read from
    /// the environment
    ///
    /// Recognised variables (all optional):
    /// - `DB_MAX_CONNECTIONS` (default: 10)
    /// - `DB_MIN_CONNECTIONS` (default: 1)
    /// - `DB_CONNECTION_TIMEOUT` seconds (default: 5)
    /// - `DB_IDLE_TIMEOUT` seconds (default: 600)
    /// - `DB_MAX_LIFETIME` seconds (default: 1800)
    ///
    /// # Errors
    ///
    /// Returns a description of the first variable that fails to parse.
    pub fn from_env(database_url: impl Into<String>) -> Result<Self, String> {
        let defaults = Self::with_url(database_url);
        Ok(Self {
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections)?,
            connection_timeout_secs: env_or("DB_CONNECTION_TIMEOUT", defaults.connection_timeout_secs)?,
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT", defaults.idle_timeout_secs)?,
            max_lifetime_secs: env_or("DB_MAX_LIFETIME", defaults.max_lifetime_secs)?,
            database_url: defaults.database_url,
        })
    }

    /// Default pool settings for `database_url`
    pub fn with_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_secs: 5,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::with_url("postgres://postgres@localhost/session_guard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_url_defaults() {
        let config = DatabaseConfig::with_url("postgres://u@h/db");
        assert_eq!(config.database_url, "postgres://u@h/db");
        assert_eq!(config.max_connections, 10);
        assert!(config.min_connections <= config.max_connections);
    }

    #[test]
    fn test_env_or_falls_back() {
        assert_eq!(env_or("SG_TEST_SURELY_UNSET_VARIABLE", 7u32), Ok(7));
    }
}
