//! Session guard HTTP server.
//!
//! Serves the auth API over axum, backed by PostgreSQL credentials and the
//! configured counter and session store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use pico_args::Arguments;
use session_guard::{
    AuthGateway, LoginSecurityGuard, MemoryStore, PgStore, RedisStore, SessionManager,
    StoreStrategy,
    auth::{PasswordHasher, PgCredentialStore, TokenCodec},
    db::Database,
    store::{CounterStore, SessionStore},
};
use sg_server::{
    api,
    config::{CliOverrides, ServerConfig},
    logging, metrics,
};
use tracing::{error, info, warn};

const HELP: &str = "\
Run the session guard HTTP server

USAGE:
  sg_server [OPTIONS]

OPTIONS:
  --bind       IP:PORT     Server socket bind address  [default: env SERVER_BIND or 127.0.0.1:8080]
  --db-url     URL         Database connection string  [default: env DATABASE_URL]
  --redis-url  URL         Redis connection string     [default: env REDIS_URL]
  --store      STRATEGY    memory, redis or postgres   [default: env STORE_STRATEGY or memory]

FLAGS:
  -h, --help               Print help information

ENVIRONMENT:
  JWT_SECRET               Token signing secret (at least 32 characters)
  PASSWORD_PEPPER          Password hashing pepper (at least 16 characters)
  SESSION_TTL_SECS         Session lifetime
  REMEMBER_TTL_SECS        Remember token lifetime
  LOGIN_MAX_ATTEMPTS       Failures before an identifier is locked
  METRICS_BIND             Prometheus exporter address (disabled when unset)
  TRUSTED_PROXIES          Comma-separated proxy IPs allowed to set X-Forwarded-For
  (See README.md for all configuration options)
";

fn parse_args() -> Result<CliOverrides, Error> {
    let mut pargs = Arguments::from_env();

    // Help has a higher priority and should be handled separately.
    if pargs.contains(["-h", "--help"]) {
        print!("{HELP}");
        std::process::exit(0);
    }

    Ok(CliOverrides {
        bind: pargs.opt_value_from_str("--bind")?,
        database_url: pargs.opt_value_from_str("--db-url")?,
        redis_url: pargs.opt_value_from_str("--redis-url")?,
        store: pargs.opt_value_from_str("--store")?,
    })
}

type Stores = (Arc<dyn CounterStore>, Arc<dyn SessionStore>);

async fn build_stores(config: &ServerConfig, postgres: PgStore) -> Result<Stores, Error> {
    match config.store {
        StoreStrategy::Memory => {
            warn!("Using in-memory stores; counters and sessions are not shared across instances");
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone(), store))
        }
        StoreStrategy::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("REDIS_URL is required for the redis store")?;
            let store = Arc::new(
                RedisStore::connect(url)
                    .await
                    .context("Failed to connect to Redis")?,
            );
            info!("Redis store connected");
            Ok((store.clone(), store))
        }
        StoreStrategy::Postgres => {
            let store = Arc::new(postgres);
            Ok((store.clone(), store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();

    let overrides = parse_args()?;
    logging::init();

    let config = ServerConfig::from_env(overrides)?;
    config.validate()?;
    info!("Starting session guard server at {}", config.bind);

    let db = Database::new(&config.database)
        .await
        .context("Failed to connect to database")?;
    let postgres = PgStore::new(db.pool());
    postgres
        .ensure_schema()
        .await
        .context("Failed to prepare database schema")?;
    info!("Database connected successfully");

    let (counters, sessions) = build_stores(&config, postgres).await?;

    let guard = Arc::new(LoginSecurityGuard::new(counters, config.guard.clone()));
    let session_manager = SessionManager::new(sessions, config.session.clone());
    let credentials = Arc::new(PgCredentialStore::new(
        db.pool(),
        PasswordHasher::new(config.security.password_pepper.clone()),
    ));
    let tokens = TokenCodec::new(&config.security.token_config());

    let gateway = Arc::new(
        AuthGateway::new(credentials, guard, session_manager, tokens)
            .with_verification_policy(config.verification),
    );

    if let Some(addr) = config.metrics_bind {
        metrics::init_metrics(addr).map_err(Error::msg)?;
        info!("Prometheus metrics available at http://{}/metrics", addr);
    }

    if let Some(interval) = config.cleanup_interval {
        tokio::spawn(cleanup_task(Arc::clone(&gateway), interval));
    }

    if config.trusted_proxies.is_empty() {
        info!("No TRUSTED_PROXIES configured; forwarding headers are ignored");
    }
    let app = api::create_router(api::AppState {
        gateway,
        trusted_proxies: Arc::new(config.trusted_proxies.clone()),
    });

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind))?;

    info!("Server is running at http://{}. Press Ctrl+C to stop.", config.bind);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("Shutting down server...");
    db.close().await;

    Ok(())
}

/// Periodically drop expired counters, sessions and remember tokens
async fn cleanup_task(gateway: Arc<AuthGateway>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let counters = gateway.guard().purge_expired().await;
        match gateway.sessions().purge_expired().await {
            Ok(sessions) => info!(counters, sessions, "Expired auth state purged"),
            Err(e) => error!("Session purge failed: {}", e),
        }
        metrics::guard_degraded(gateway.guard().is_degraded());
    }
}

/// Graceful shutdown signal
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
