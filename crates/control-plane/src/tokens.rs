use rand::Rng;
use subtle::ConstantTimeEq;

use crate::Result;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use sha2::{Digest, Sha256};

/// Length of the indexed API-key prefix stored next to the argon2 hash.
pub const API_KEY_PREFIX_LEN: usize = 8;

/// Generate a random bearer token.
pub fn generate_token() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..48)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Deterministic lookup digest for session and app tokens.
///
/// Tokens are looked up by this value, so it must not be salted.
pub fn digest_token(token: &str, pepper: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pepper.as_bytes());
    hasher.update(b":");
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Prefix used to narrow API-key candidates before argon2 verification.
pub fn api_key_prefix(key: &str) -> Option<&str> {
    key.get(..API_KEY_PREFIX_LEN)
}

/// Hash a user API key using argon2id and a pepper.
pub fn hash_api_key(key: &str, pepper: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let password = format!("{key}{pepper}");
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("failed to hash api key: {}", err))?
        .to_string())
}

pub fn verify_api_key(key: &str, stored_hash: &str, pepper: &str) -> bool {
    let password = format!("{key}{pepper}");
    let Ok(password_hash) = PasswordHash::new(stored_hash) else {
        return false;
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &password_hash)
        .is_ok()
}

/// Constant-time string comparison for static tokens.
pub fn tokens_equal(expected: &str, candidate: &str) -> bool {
    expected.len() == candidate.len() && expected.as_bytes().ct_eq(candidate.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_depends_on_pepper() {
        let a = digest_token("token", "pepper-a");
        let b = digest_token("token", "pepper-b");
        assert_ne!(a, b);
        assert_eq!(a, digest_token("token", "pepper-a"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn api_keys_verify_with_matching_pepper() {
        let key = generate_token();
        let hash = hash_api_key(&key, "pepper").expect("hash");
        assert!(verify_api_key(&key, &hash, "pepper"));
        assert!(!verify_api_key(&key, &hash, "other"));
        assert!(!verify_api_key(&key, "not-a-phc-string", "pepper"));
    }

    #[test]
    fn prefix_needs_enough_characters() {
        assert_eq!(api_key_prefix("abcdefghijk"), Some("abcdefgh"));
        assert_eq!(api_key_prefix("short"), None);
    }

    #[test]
    fn static_tokens_compare_exactly() {
        assert!(tokens_equal("secret-token", "secret-token"));
        assert!(!tokens_equal("secret-token", "secret-token-2"));
        assert!(!tokens_equal("secret-token", "SECRET-TOKEN"));
    }
}
