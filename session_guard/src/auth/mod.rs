//! Authentication front door: credential checks, bearer tokens and the
//! gateway tying them to login throttling and server-side sessions.
//!
//! A bearer token is never sufficient on its own. Every request is checked
//! against the session it references, so revoking a session takes effect
//! immediately even though the token is still cryptographically valid.
//!
//! ## Example
//!
//! ```no_run
//! use session_guard::auth::{
//!     AuthGateway, LoginRequest, MemoryCredentialStore, PasswordHasher, Role, TokenCodec,
//!     TokenConfig,
//! };
//! use session_guard::security::{GuardConfig, LoginSecurityGuard};
//! use session_guard::session::{ClientContext, SessionConfig, SessionManager};
//! use session_guard::store::MemoryStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let credentials = Arc::new(MemoryCredentialStore::new(PasswordHasher::new("pepper")));
//!     credentials.add_account("alice", None, "Secret123!", Role::User).await?;
//!
//!     let store = Arc::new(MemoryStore::new());
//!     let gateway = AuthGateway::new(
//!         credentials,
//!         Arc::new(LoginSecurityGuard::new(store.clone(), GuardConfig::default())),
//!         SessionManager::new(store, SessionConfig::default()),
//!         TokenCodec::new(&TokenConfig {
//!             secret: "a-secret-of-at-least-32-bytes-long".to_string(),
//!             issuer: "session-guard".to_string(),
//!             audience: "session-guard-clients".to_string(),
//!             ttl: Duration::from_secs(900),
//!         }),
//!     );
//!
//!     let ctx = ClientContext::new("203.0.113.7", "curl/8.0");
//!     let login = gateway
//!         .login(
//!             LoginRequest {
//!                 identifier: "alice".to_string(),
//!                 password: "Secret123!".to_string(),
//!                 remember_me: false,
//!                 captcha_token: None,
//!             },
//!             &ctx,
//!         )
//!         .await?;
//!
//!     let principal = gateway.authenticate(&login.token, &ctx).await?;
//!     println!("Authenticated user {}", principal.user_id);
//!     Ok(())
//! }
//! ```

pub mod credentials;
pub mod errors;
pub mod gateway;
pub mod models;
pub mod policy;
pub mod token;

pub use crate::session::ClientContext;
pub use credentials::{
    AccountStatus, CredentialError, CredentialRecord, CredentialResult, CredentialStore,
    MemoryCredentialStore, PasswordHasher, PgCredentialStore,
};
pub use errors::{AuthError, AuthResult};
pub use gateway::AuthGateway;
pub use models::{LoginRequest, LoginResponse, Principal, Role, UserId, VerificationChannel};
pub use policy::{CaptchaVerifier, DisabledCaptcha, VerificationPolicy};
pub use token::{IssuedToken, TokenClaims, TokenCodec, TokenConfig, TokenError, TokenSubject};
