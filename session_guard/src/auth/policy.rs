//! Pluggable login policies: account verification and CAPTCHA.

use super::credentials::CredentialRecord;
use super::models::VerificationChannel;
use async_trait::async_trait;
use std::str::FromStr;

/// Which contact channels must be verified before a login succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationPolicy {
    /// Email, and phone when one is on file
    #[default]
    EnforceAll,
    /// Phone only
    SkipEmail,
    /// Nothing (development and test environments)
    SkipAll,
}

impl VerificationPolicy {
    /// First channel the account still has to verify, if any
    pub fn missing(&self, record: &CredentialRecord) -> Option<VerificationChannel> {
        let email_pending = !record.email_verified;
        let phone_pending = record.phone_verified == Some(false);

        match self {
            Self::EnforceAll if email_pending => Some(VerificationChannel::Email),
            Self::EnforceAll | Self::SkipEmail if phone_pending => Some(VerificationChannel::Phone),
            _ => None,
        }
    }
}

impl FromStr for VerificationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "enforce_all" => Ok(Self::EnforceAll),
            "skip_email" => Ok(Self::SkipEmail),
            "skip_all" => Ok(Self::SkipAll),
            other => Err(format!("unknown verification policy '{other}'")),
        }
    }
}

/// Verifies CAPTCHA responses once the guard escalates
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, token: &str, ip: &str) -> bool;

    /// Whether a provider backs this verifier. Logins skip CAPTCHA
    /// escalation without one; delays and hard locks still apply.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// No CAPTCHA provider configured.
///
/// Rejects every response and reports itself disabled, so the gateway never
/// demands a CAPTCHA the client has no way to solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCaptcha;

#[async_trait]
impl CaptchaVerifier for DisabledCaptcha {
    async fn verify(&self, _token: &str, _ip: &str) -> bool {
        false
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::AccountStatus;
    use crate::auth::models::Role;

    fn record(email_verified: bool, phone_verified: Option<bool>) -> CredentialRecord {
        CredentialRecord {
            user_id: 1,
            password_hash: String::new(),
            status: AccountStatus::Active,
            role: Role::User,
            email_verified,
            phone_verified,
        }
    }

    #[test]
    fn test_enforce_all() {
        let policy = VerificationPolicy::EnforceAll;
        assert_eq!(policy.missing(&record(true, None)), None);
        assert_eq!(policy.missing(&record(false, None)), Some(VerificationChannel::Email));
        assert_eq!(
            policy.missing(&record(true, Some(false))),
            Some(VerificationChannel::Phone)
        );
    }

    #[test]
    fn test_skip_email() {
        let policy = VerificationPolicy::SkipEmail;
        assert_eq!(policy.missing(&record(false, None)), None);
        assert_eq!(
            policy.missing(&record(false, Some(false))),
            Some(VerificationChannel::Phone)
        );
    }

    #[test]
    fn test_skip_all() {
        assert_eq!(VerificationPolicy::SkipAll.missing(&record(false, Some(false))), None);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("skip-email".parse::<VerificationPolicy>(), Ok(VerificationPolicy::SkipEmail));
        assert_eq!("ENFORCE_ALL".parse::<VerificationPolicy>(), Ok(VerificationPolicy::EnforceAll));
        assert!("sometimes".parse::<VerificationPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_disabled_captcha_rejects() {
        assert!(!DisabledCaptcha.verify("anything", "10.0.0.1").await);
        assert!(!DisabledCaptcha.is_enabled());
    }
}
