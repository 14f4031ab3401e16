//! Device fingerprints and opaque token material.

use super::models::ClientContext;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Raw remember tokens carry 256 bits of entropy
const REMEMBER_TOKEN_BYTES: usize = 32;

/// Hash the client's IP and client string into a stable fingerprint
pub fn device_fingerprint(context: &ClientContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(context.ip.as_bytes());
    hasher.update(b"|");
    hasher.update(context.user_agent.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time fingerprint comparison
pub fn fingerprints_match(stored: &str, presented: &str) -> bool {
    stored.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Fresh random remember token value (hex)
pub fn generate_remember_token() -> String {
    let mut bytes = [0u8; REMEMBER_TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Storage id of a remember token. Only this hash is ever persisted.
pub fn hash_token(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_and_device_specific() {
        let laptop = ClientContext::new("10.0.0.1", "Firefox");
        let phone = ClientContext::new("10.0.0.1", "Safari");

        assert_eq!(device_fingerprint(&laptop), device_fingerprint(&laptop.clone()));
        assert_ne!(device_fingerprint(&laptop), device_fingerprint(&phone));
        assert_eq!(device_fingerprint(&laptop).len(), 64);
    }

    #[test]
    fn test_separator_prevents_ambiguous_concatenation() {
        let a = ClientContext::new("1.2.3.4", "5agent");
        let b = ClientContext::new("1.2.3.45", "agent");
        assert_ne!(device_fingerprint(&a), device_fingerprint(&b));
    }

    #[test]
    fn test_fingerprints_match() {
        assert!(fingerprints_match("abc", "abc"));
        assert!(!fingerprints_match("abc", "abd"));
        assert!(!fingerprints_match("abc", "abcd"));
    }

    #[test]
    fn test_remember_tokens_are_unique_hex() {
        let a = generate_remember_token();
        let b = generate_remember_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), REMEMBER_TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_token_hides_value() {
        let value = generate_remember_token();
        let hashed = hash_token(&value);
        assert_ne!(hashed, value);
        assert_eq!(hashed, hash_token(&value));
    }
}
