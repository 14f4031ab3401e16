//! Server-side sessions and remember-me tokens.
//!
//! A session id is an opaque random identifier distinct from any bearer
//! token, so revoking a session needs no token blacklist.

pub mod errors;
pub mod fingerprint;
pub mod manager;
pub mod models;

pub use errors::{SessionError, SessionResult};
pub use fingerprint::device_fingerprint;
pub use manager::SessionManager;
pub use models::{
    ClientContext, DestroyReason, FingerprintMode, InvalidReason, IssuedRememberToken, NewSession,
    RememberToken, Session, SessionConfig, SessionOptions, SessionValidation,
};
