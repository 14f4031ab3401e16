//! Integration tests for the authentication gateway.
//!
//! Tests login, throttling, bearer-token authentication, remember-token
//! refresh and revocation flows end to end over the in-memory store.

use async_trait::async_trait;
use session_guard::auth::{
    AccountStatus, AuthError, AuthGateway, CaptchaVerifier, CredentialRecord, CredentialResult,
    CredentialStore, LoginRequest, MemoryCredentialStore, PasswordHasher, Role, TokenCodec,
    TokenConfig, TokenSubject, UserId, VerificationChannel, VerificationPolicy,
};
use session_guard::security::{GuardConfig, LoginSecurityGuard, identifier_key};
use session_guard::session::{ClientContext, SessionConfig, SessionManager};
use session_guard::store::{CounterStore, MemoryStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SECRET: &str = "integration-test-secret-0123456789abcdef";
const ISSUER: &str = "session-guard";
const AUDIENCE: &str = "session-guard-clients";

/// Plain-text credentials so timing-sensitive tests are not slowed by Argon2
#[derive(Default)]
struct PlainCredentials {
    accounts: Mutex<HashMap<String, CredentialRecord>>,
}

impl PlainCredentials {
    fn with_user(self, username: &str, user_id: UserId, password: &str) -> Self {
        self.accounts.lock().unwrap().insert(
            username.to_string(),
            CredentialRecord {
                user_id,
                password_hash: password.to_string(),
                status: AccountStatus::Active,
                role: Role::User,
                email_verified: true,
                phone_verified: None,
            },
        );
        self
    }

    fn update(&self, username: &str, f: impl FnOnce(&mut CredentialRecord)) {
        if let Some(record) = self.accounts.lock().unwrap().get_mut(username) {
            f(record);
        }
    }
}

#[async_trait]
impl CredentialStore for PlainCredentials {
    async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> CredentialResult<Option<CredentialRecord>> {
        Ok(self.accounts.lock().unwrap().get(identifier).cloned())
    }

    async fn find_by_user_id(&self, user_id: UserId) -> CredentialResult<Option<CredentialRecord>> {
        Ok(self
            .accounts
            .lock()
            .unwrap()
            .values()
            .find(|r| r.user_id == user_id)
            .cloned())
    }

    fn verify_password(&self, plain: &str, hash: &str) -> bool {
        plain == hash
    }
}

struct AcceptingCaptcha;

#[async_trait]
impl CaptchaVerifier for AcceptingCaptcha {
    async fn verify(&self, token: &str, _ip: &str) -> bool {
        token == "solved"
    }
}

fn token_config() -> TokenConfig {
    TokenConfig {
        secret: SECRET.to_string(),
        issuer: ISSUER.to_string(),
        audience: AUDIENCE.to_string(),
        ttl: Duration::from_secs(60),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    credentials: Arc<PlainCredentials>,
    gateway: AuthGateway,
}

fn setup_with(guard_config: GuardConfig, session_config: SessionConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let credentials = Arc::new(
        PlainCredentials::default()
            .with_user("u1", 1, "correct-horse")
            .with_user("u2", 2, "battery-staple"),
    );
    let gateway = AuthGateway::new(
        credentials.clone(),
        Arc::new(LoginSecurityGuard::new(store.clone(), guard_config)),
        SessionManager::new(store.clone(), session_config),
        TokenCodec::new(&token_config()),
    );
    Harness {
        store,
        credentials,
        gateway,
    }
}

fn setup() -> Harness {
    setup_with(
        GuardConfig {
            soft_threshold: 100,
            captcha_threshold: 100,
            ..GuardConfig::default()
        },
        SessionConfig::default(),
    )
}

fn ctx() -> ClientContext {
    ClientContext::new("203.0.113.5", "integration-tests/1.0")
}

fn request(identifier: &str, password: &str, remember_me: bool) -> LoginRequest {
    LoginRequest {
        identifier: identifier.to_string(),
        password: password.to_string(),
        remember_me,
        captcha_token: None,
    }
}

// === Login ===

#[tokio::test]
async fn test_login_and_authenticate() {
    let h = setup();
    let login = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .expect("Login should succeed");

    assert_eq!(login.user_id, 1);
    assert!(login.remember_token.is_none());
    assert!(
        login.token_expires_at >= login.session_expires_at,
        "Token must not expire before its session"
    );

    let principal = h.gateway.authenticate(&login.token, &ctx()).await.unwrap();
    assert_eq!(principal.user_id, 1);
    assert_eq!(principal.session_id, login.session_id);
    assert!(!principal.fingerprint_mismatch);
}

#[tokio::test]
async fn test_unknown_and_wrong_password_look_alike() {
    let h = setup();
    let unknown = h.gateway.login(request("nobody", "x", false), &ctx()).await;
    let wrong = h.gateway.login(request("u1", "x", false), &ctx()).await;

    assert_eq!(unknown.unwrap_err(), AuthError::InvalidCredentials);
    assert_eq!(wrong.unwrap_err(), AuthError::InvalidCredentials);
}

#[tokio::test]
async fn test_lockout_then_recovery_after_window() {
    let h = setup_with(
        GuardConfig {
            window: Duration::from_millis(500),
            lockout: Duration::from_millis(500),
            soft_threshold: 100,
            captcha_threshold: 100,
            ..GuardConfig::default()
        },
        SessionConfig::default(),
    );

    for _ in 0..5 {
        assert_eq!(
            h.gateway.login(request("u1", "wrong", false), &ctx()).await.unwrap_err(),
            AuthError::InvalidCredentials
        );
    }

    match h.gateway.login(request("u1", "correct-horse", false), &ctx()).await {
        Err(AuthError::RateLimited { retry_after, .. }) => assert!(retry_after > 0),
        other => panic!("6th attempt should be rate limited, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(650)).await;

    let login = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .expect("Login should succeed once the window has elapsed");
    assert!(!login.session_id.is_empty());
    assert!(!login.token.is_empty());
}

#[tokio::test]
async fn test_concurrent_failed_logins_counted_exactly() {
    let h = setup();
    let ctx = ctx();

    let (a, b) = tokio::join!(
        h.gateway.login(request("u2", "nope", false), &ctx),
        h.gateway.login(request("u2", "nope", false), &ctx),
    );
    assert!(a.is_err() && b.is_err());

    let counter = h
        .store
        .snapshot(&identifier_key("u2"), chrono::Utc::now(), chrono::Duration::minutes(15))
        .await
        .unwrap();
    assert_eq!(counter.count, 2);
}

#[tokio::test]
async fn test_captcha_escalation() {
    let store = Arc::new(MemoryStore::new());
    let credentials = Arc::new(PlainCredentials::default().with_user("u1", 1, "correct-horse"));
    let gateway = AuthGateway::new(
        credentials,
        Arc::new(LoginSecurityGuard::new(
            store.clone(),
            GuardConfig {
                soft_threshold: 100,
                captcha_threshold: 2,
                ..GuardConfig::default()
            },
        )),
        SessionManager::new(store, SessionConfig::default()),
        TokenCodec::new(&token_config()),
    )
    .with_captcha(Arc::new(AcceptingCaptcha));

    for _ in 0..2 {
        let _ = gateway.login(request("u1", "wrong", false), &ctx()).await;
    }

    let err = gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap_err();
    match err {
        AuthError::CaptchaRequired { retry_after } => assert!(
            retry_after > 0 && retry_after <= 15 * 60,
            "CAPTCHA demand should say when escalation ends, got {}",
            retry_after
        ),
        other => panic!("Expected CaptchaRequired, got {:?}", other),
    }
    assert!(err.requires_captcha());

    let mut solved = request("u1", "correct-horse", false);
    solved.captcha_token = Some("solved".to_string());
    assert!(gateway.login(solved, &ctx()).await.is_ok());
}

#[tokio::test]
async fn test_no_captcha_provider_never_demands_captcha() {
    // Default thresholds put CAPTCHA escalation below the hard lock.
    let h = setup_with(
        GuardConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            ..GuardConfig::default()
        },
        SessionConfig::default(),
    );

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let err = h
            .gateway
            .login(request("u1", "wrong", false), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidCredentials);
    }

    let err = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            AuthError::RateLimited {
                requires_captcha: false,
                ..
            }
        ),
        "Delay still applies but never asks for a CAPTCHA, got {:?}",
        err
    );
    assert!(err.retry_after().is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        h.gateway
            .login(request("u1", "correct-horse", false), &ctx())
            .await
            .is_ok(),
        "Correct password must get through once the delay has passed"
    );
}

#[tokio::test]
async fn test_disabled_account_rejected_as_invalid_credentials() {
    let h = setup();
    h.credentials
        .update("u1", |r| r.status = AccountStatus::Disabled);

    assert_eq!(
        h.gateway
            .login(request("u1", "correct-horse", false), &ctx())
            .await
            .unwrap_err(),
        AuthError::InvalidCredentials
    );
}

#[tokio::test]
async fn test_verification_policy() {
    let h = setup();
    h.credentials.update("u1", |r| {
        r.email_verified = false;
        r.phone_verified = Some(false);
    });

    assert_eq!(
        h.gateway
            .login(request("u1", "correct-horse", false), &ctx())
            .await
            .unwrap_err(),
        AuthError::VerificationRequired(VerificationChannel::Email)
    );

    let gateway = h.gateway.with_verification_policy(VerificationPolicy::SkipEmail);
    assert_eq!(
        gateway
            .login(request("u1", "correct-horse", false), &ctx())
            .await
            .unwrap_err(),
        AuthError::VerificationRequired(VerificationChannel::Phone)
    );

    let gateway = gateway.with_verification_policy(VerificationPolicy::SkipAll);
    assert!(
        gateway
            .login(request("u1", "correct-horse", false), &ctx())
            .await
            .is_ok()
    );
}

// === Tokens ===

#[tokio::test]
async fn test_issuer_and_audience_enforced() {
    let h = setup();
    let login = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap();

    for (issuer, audience) in [("someone-else", AUDIENCE), (ISSUER, "other-clients")] {
        let foreign = TokenCodec::new(&TokenConfig {
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            ..token_config()
        });
        let forged = foreign
            .issue(
                &TokenSubject {
                    user_id: 1,
                    session_id: login.session_id.clone(),
                    role: Role::User,
                },
                Duration::from_secs(60),
            )
            .unwrap();

        assert_eq!(
            h.gateway.authenticate(&forged.token, &ctx()).await.unwrap_err(),
            AuthError::TokenInvalid,
            "Same secret but issuer {} / audience {} must be rejected",
            issuer,
            audience
        );
    }
}

#[tokio::test]
async fn test_token_for_another_users_session_rejected() {
    let h = setup();
    let login = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap();

    let forged = TokenCodec::new(&token_config())
        .issue(
            &TokenSubject {
                user_id: 2,
                session_id: login.session_id,
                role: Role::Admin,
            },
            Duration::from_secs(60),
        )
        .unwrap();

    assert_eq!(
        h.gateway.authenticate(&forged.token, &ctx()).await.unwrap_err(),
        AuthError::TokenInvalid
    );
}

#[tokio::test]
async fn test_fingerprint_mismatch_rejected() {
    let h = setup();
    let login = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap();

    let elsewhere = ClientContext::new("192.0.2.99", "curl/8.0");
    assert_eq!(
        h.gateway.authenticate(&login.token, &elsewhere).await.unwrap_err(),
        AuthError::SessionFingerprintMismatch
    );
}

// === Remember tokens ===

#[tokio::test]
async fn test_remember_me_refresh_rotates() {
    let h = setup();
    let login = h
        .gateway
        .login(request("u1", "correct-horse", true), &ctx())
        .await
        .unwrap();
    let original = login.remember_token.expect("Remember token should be issued");

    let refreshed = h
        .gateway
        .refresh_from_remember_token(&original, &ctx())
        .await
        .expect("Refresh should succeed");
    assert_ne!(refreshed.session_id, login.session_id);
    assert_ne!(refreshed.token, login.token);
    let rotated = refreshed.remember_token.expect("Refresh should rotate the remember token");
    assert_ne!(rotated, original);

    assert!(h.gateway.authenticate(&refreshed.token, &ctx()).await.is_ok());
    assert_eq!(
        h.gateway
            .refresh_from_remember_token(&original, &ctx())
            .await
            .unwrap_err(),
        AuthError::RememberTokenInvalid
    );
}

#[tokio::test]
async fn test_refresh_for_disabled_account() {
    let h = setup();
    let login = h
        .gateway
        .login(request("u1", "correct-horse", true), &ctx())
        .await
        .unwrap();
    h.credentials
        .update("u1", |r| r.status = AccountStatus::Disabled);

    assert_eq!(
        h.gateway
            .refresh_from_remember_token(&login.remember_token.unwrap(), &ctx())
            .await
            .unwrap_err(),
        AuthError::RememberTokenInvalid
    );
    assert_eq!(h.gateway.sessions().list_user_sessions(1).await.unwrap().len(), 1);
}

// === Revocation ===

#[tokio::test]
async fn test_destroy_all_revokes_unexpired_tokens() {
    let h = setup();
    let first = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap();
    let second = h
        .gateway
        .login(request("u1", "correct-horse", true), &ctx())
        .await
        .unwrap();

    h.gateway.sessions().destroy_all_for_user(1, None).await.unwrap();

    for token in [&first.token, &second.token] {
        assert_eq!(
            h.gateway.authenticate(token, &ctx()).await.unwrap_err(),
            AuthError::SessionRevoked
        );
    }
    assert_eq!(
        h.gateway
            .refresh_from_remember_token(&second.remember_token.unwrap(), &ctx())
            .await
            .unwrap_err(),
        AuthError::RememberTokenInvalid
    );
}

#[tokio::test]
async fn test_password_change_keeps_current_session() {
    let h = setup();
    let current = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap();
    let other = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap();

    let revoked = h
        .gateway
        .password_changed(1, Some(&current.session_id))
        .await
        .unwrap();
    assert_eq!(revoked, 1);

    assert!(h.gateway.authenticate(&current.token, &ctx()).await.is_ok());
    assert_eq!(
        h.gateway.authenticate(&other.token, &ctx()).await.unwrap_err(),
        AuthError::SessionRevoked
    );
}

#[tokio::test]
async fn test_logout_and_session_listing() {
    let h = setup();
    let a = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap();
    let b = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap();
    let stranger = h
        .gateway
        .login(request("u2", "battery-staple", false), &ctx())
        .await
        .unwrap();

    let principal = h.gateway.authenticate(&a.token, &ctx()).await.unwrap();
    assert_eq!(h.gateway.list_sessions(&principal).await.unwrap().len(), 2);

    assert!(
        !h.gateway
            .revoke_session(&principal, &stranger.session_id)
            .await
            .unwrap(),
        "Another user's session must not be revocable"
    );
    assert!(h.gateway.revoke_session(&principal, &b.session_id).await.unwrap());
    assert_eq!(h.gateway.list_sessions(&principal).await.unwrap().len(), 1);

    h.gateway.logout(&principal).await.unwrap();
    assert_eq!(
        h.gateway.authenticate(&a.token, &ctx()).await.unwrap_err(),
        AuthError::SessionRevoked
    );
    assert!(h.gateway.authenticate(&stranger.token, &ctx()).await.is_ok());
}

#[tokio::test]
async fn test_logout_everywhere() {
    let h = setup();
    let a = h
        .gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap();
    h.gateway
        .login(request("u1", "correct-horse", false), &ctx())
        .await
        .unwrap();

    let principal = h.gateway.authenticate(&a.token, &ctx()).await.unwrap();
    assert_eq!(h.gateway.logout_everywhere(&principal).await.unwrap(), 2);
    assert!(h.gateway.authenticate(&a.token, &ctx()).await.is_err());
}

// === Argon2-backed credentials ===

#[tokio::test]
async fn test_memory_credential_store_end_to_end() {
    let store = Arc::new(MemoryStore::new());
    let credentials = Arc::new(MemoryCredentialStore::new(PasswordHasher::new(
        "integration-pepper-16",
    )));
    let user_id = credentials
        .add_account("Alice", Some("alice@example.com"), "Secret123!", Role::Admin)
        .await
        .unwrap();

    let gateway = AuthGateway::new(
        credentials,
        Arc::new(LoginSecurityGuard::new(store.clone(), GuardConfig::default())),
        SessionManager::new(store, SessionConfig::default()),
        TokenCodec::new(&token_config()),
    );

    let login = gateway
        .login(request("ALICE@example.com", "Secret123!", false), &ctx())
        .await
        .unwrap();
    assert_eq!(login.user_id, user_id);
    assert_eq!(login.role, Role::Admin);

    let principal = gateway.authenticate(&login.token, &ctx()).await.unwrap();
    assert_eq!(principal.role, Role::Admin);
}
