//! # Session Guard
//!
//! Session lifecycle and login protection for services that authenticate
//! users with a password and then hand out bearer tokens.
//!
//! Two concerns are covered:
//!
//! - **Login throttling**: failed attempts are counted per identifier and per
//!   client IP over a sliding window. Repeated failures first slow the caller
//!   down, then demand a CAPTCHA, then lock the key out entirely.
//! - **Sessions**: every bearer token references a server-side session that is
//!   checked on each request. Sessions can be revoked individually or swept
//!   for a whole user through a per-user generation counter, and optionally
//!   renewed through rotating single-use remember tokens.
//!
//! ## Core Modules
//!
//! - [`auth`]: Gateway, bearer tokens, credential lookup and login policies
//! - [`security`]: Login attempt guard
//! - [`session`]: Session manager and remember tokens
//! - [`store`]: Counter and session storage (memory, Redis, PostgreSQL)
//! - [`db`]: PostgreSQL pool
//!
//! ## Failure behaviour
//!
//! The guard fails open: when the shared store is unreachable it keeps
//! counting in process memory. Session validation fails closed: a session that
//! cannot be read is never accepted.

/// Authentication gateway, bearer tokens and credentials.
pub mod auth;

/// PostgreSQL connection pooling.
pub mod db;

/// Login attempt throttling.
pub mod security;

/// Server-side sessions and remember tokens.
pub mod session;

/// Storage backends.
pub mod store;

pub use auth::{AuthError, AuthGateway, AuthResult, ClientContext, Principal};
pub use security::{GuardConfig, LoginCheck, LoginSecurityGuard};
pub use session::{SessionConfig, SessionManager};
pub use store::{MemoryStore, PgStore, RedisStore, StoreStrategy};
