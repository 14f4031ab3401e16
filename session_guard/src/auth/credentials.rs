//! Credential lookup and password verification.
//!
//! Accounts are owned by an external account service; this module only reads
//! them. Passwords are hashed with Argon2id plus a server-side pepper.

use super::models::{Role, UserId};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::sync::RwLock;

/// Credential lookup errors
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Password hashing failed
    #[error("Password hashing failed")]
    HashingFailed,

    /// Stored account row could not be decoded
    #[error("Corrupt account record: {0}")]
    Corrupt(String),
}

/// Result type for credential operations
pub type CredentialResult<T> = Result<T, CredentialError>;

/// Account status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Disabled,
}

/// What the gateway needs to know about an account
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub user_id: UserId,
    pub password_hash: String,
    pub status: AccountStatus,
    pub role: Role,
    pub email_verified: bool,
    /// `None` when no phone number is on file
    pub phone_verified: Option<bool>,
}

/// Source of account credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up an account by username or email (case-insensitive)
    async fn find_by_identifier(&self, identifier: &str)
    -> CredentialResult<Option<CredentialRecord>>;

    async fn find_by_user_id(&self, user_id: UserId) -> CredentialResult<Option<CredentialRecord>>;

    fn verify_password(&self, plain: &str, hash: &str) -> bool;

    /// Spend the cost of one verification so unknown identifiers answer no faster
    fn equalize_timing(&self, _plain: &str) {}
}

/// Argon2id with a server-side pepper
pub struct PasswordHasher {
    pepper: String,
    dummy_hash: OnceLock<String>,
}

impl PasswordHasher {
    pub fn new(pepper: impl Into<String>) -> Self {
        Self {
            pepper: pepper.into(),
            dummy_hash: OnceLock::new(),
        }
    }

    /// Hash password with Argon2id + pepper
    pub fn hash(&self, password: &str) -> CredentialResult<String> {
        let peppered = format!("{}{}", password, self.pepper);
        let salt = SaltString::generate(&mut OsRng);

        Ok(Argon2::default()
            .hash_password(peppered.as_bytes(), &salt)
            .map_err(|_| CredentialError::HashingFailed)?
            .to_string())
    }

    /// Verify password against hash
    pub fn verify(&self, password: &str, hash: &str) -> bool {
        let peppered = format!("{}{}", password, self.pepper);
        let Ok(parsed_hash) = PasswordHash::new(hash) else {
            return false;
        };

        Argon2::default()
            .verify_password(peppered.as_bytes(), &parsed_hash)
            .is_ok()
    }

    /// Run one verification against a throwaway hash
    pub fn verify_dummy(&self, password: &str) {
        let dummy = self
            .dummy_hash
            .get_or_init(|| self.hash("timing-equalizer").unwrap_or_default());
        let _ = self.verify(password, dummy);
    }
}

/// Credentials from the `users` table
pub struct PgCredentialStore {
    pool: Arc<PgPool>,
    hasher: PasswordHasher,
}

impl PgCredentialStore {
    pub fn new(pool: Arc<PgPool>, hasher: PasswordHasher) -> Self {
        Self { pool, hasher }
    }

    fn record_from_row(row: &PgRow) -> CredentialResult<CredentialRecord> {
        let role: String = row.try_get("role")?;
        let phone: Option<String> = row.try_get("phone")?;
        let phone_verified: bool = row.try_get("phone_verified")?;
        let is_active: bool = row.try_get("is_active")?;

        Ok(CredentialRecord {
            user_id: row.try_get("id")?,
            password_hash: row.try_get("password_hash")?,
            status: if is_active {
                AccountStatus::Active
            } else {
                AccountStatus::Disabled
            },
            role: role.parse().map_err(CredentialError::Corrupt)?,
            email_verified: row.try_get("email_verified")?,
            phone_verified: phone.map(|_| phone_verified),
        })
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> CredentialResult<Option<CredentialRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, password_hash, role, is_active, email_verified, phone, phone_verified
            FROM users
            WHERE LOWER(username) = LOWER($1) OR LOWER(email) = LOWER($1)
            LIMIT 1
            "#,
        )
        .bind(identifier.trim())
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn find_by_user_id(&self, user_id: UserId) -> CredentialResult<Option<CredentialRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, password_hash, role, is_active, email_verified, phone, phone_verified
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.pool.as_ref())
        .await?;

        row.as_ref().map(Self::record_from_row).transpose()
    }

    fn verify_password(&self, plain: &str, hash: &str) -> bool {
        self.hasher.verify(plain, hash)
    }

    fn equalize_timing(&self, plain: &str) {
        self.hasher.verify_dummy(plain);
    }
}

#[derive(Debug, Clone)]
struct MemoryAccount {
    username: String,
    email: Option<String>,
    record: CredentialRecord,
}

/// In-process credentials for tests and single-node demos
pub struct MemoryCredentialStore {
    hasher: PasswordHasher,
    accounts: RwLock<HashMap<UserId, MemoryAccount>>,
}

impl MemoryCredentialStore {
    pub fn new(hasher: PasswordHasher) -> Self {
        Self {
            hasher,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Add an active, fully verified account and return its id
    pub async fn add_account(
        &self,
        username: &str,
        email: Option<&str>,
        password: &str,
        role: Role,
    ) -> CredentialResult<UserId> {
        let password_hash = self.hasher.hash(password)?;
        let mut accounts = self.accounts.write().await;
        let user_id = accounts.keys().max().copied().unwrap_or(0) + 1;

        accounts.insert(
            user_id,
            MemoryAccount {
                username: username.to_lowercase(),
                email: email.map(str::to_lowercase),
                record: CredentialRecord {
                    user_id,
                    password_hash,
                    status: AccountStatus::Active,
                    role,
                    email_verified: true,
                    phone_verified: None,
                },
            },
        );
        Ok(user_id)
    }

    pub async fn set_status(&self, user_id: UserId, status: AccountStatus) {
        if let Some(account) = self.accounts.write().await.get_mut(&user_id) {
            account.record.status = status;
        }
    }

    pub async fn set_verification(
        &self,
        user_id: UserId,
        email_verified: bool,
        phone_verified: Option<bool>,
    ) {
        if let Some(account) = self.accounts.write().await.get_mut(&user_id) {
            account.record.email_verified = email_verified;
            account.record.phone_verified = phone_verified;
        }
    }

    pub async fn set_password(&self, user_id: UserId, password: &str) -> CredentialResult<()> {
        let password_hash = self.hasher.hash(password)?;
        if let Some(account) = self.accounts.write().await.get_mut(&user_id) {
            account.record.password_hash = password_hash;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_identifier(
        &self,
        identifier: &str,
    ) -> CredentialResult<Option<CredentialRecord>> {
        let wanted = identifier.trim().to_lowercase();
        Ok(self
            .accounts
            .read()
            .await
            .values()
            .find(|a| a.username == wanted || a.email.as_deref() == Some(wanted.as_str()))
            .map(|a| a.record.clone()))
    }

    async fn find_by_user_id(&self, user_id: UserId) -> CredentialResult<Option<CredentialRecord>> {
        Ok(self
            .accounts
            .read()
            .await
            .get(&user_id)
            .map(|a| a.record.clone()))
    }

    fn verify_password(&self, plain: &str, hash: &str) -> bool {
        self.hasher.verify(plain, hash)
    }

    fn equalize_timing(&self, plain: &str) {
        self.hasher.verify_dummy(plain);
    }
}
