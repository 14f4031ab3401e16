//! Login-surface protection.
//!
//! [`LoginSecurityGuard`] keeps two sliding-window counters per login attempt:
//!
//! - **Identifier**: progressive delay from the soft threshold, CAPTCHA from the
//!   CAPTCHA threshold, hard lock at `max_attempts`
//! - **IP**: hard block at `ip_max_attempts`, catching credential stuffing
//!   spread across many identifiers
//!
//! A successful login clears the identifier window only. Locks always run
//! their full course.
//!
//! ## Example
//!
//! ```no_run
//! use session_guard::security::{GuardConfig, LoginSecurityGuard};
//! use session_guard::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let guard = LoginSecurityGuard::new(Arc::new(MemoryStore::new()), GuardConfig::default());
//!
//! let check = guard.check_allowed("alice", "192.168.1.1").await;
//! if check.allowed {
//!     // verify the password, then:
//!     guard.record_failure("alice", "192.168.1.1").await;
//! } else {
//!     println!("Retry in {:?} seconds", check.retry_after);
//! }
//! # }
//! ```

pub mod guard;

pub use guard::{GuardConfig, LoginCheck, LoginSecurityGuard, identifier_key, ip_key, normalize_ip};
