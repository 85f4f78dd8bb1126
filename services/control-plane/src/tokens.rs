//! Credential generation and hashing.
//!
//! Token formats:
//! - Node connection key: `<32 random bytes base64>`, stored as issued
//! - Server validation token: `wvt_<32 random bytes base64>`
//! - API key: `wak_<12 alphanumerics>.<32 random bytes base64>`
//!
//! Validation tokens and API key secrets are stored hashed (SHA-256).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};

pub const VALIDATION_TOKEN_PREFIX: &str = "wvt_";
pub const API_KEY_PREFIX: &str = "wak_";

/// Token bytes (32 bytes = 256 bits of entropy).
const TOKEN_BYTES: usize = 32;

const IDENTIFIER_LEN: usize = 12;
const IDENTIFIER_CHARS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";

fn random_secret() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Key a node daemon presents when talking to the control plane.
pub fn generate_connection_key() -> String {
    random_secret()
}

/// One-time token handed to the deployment executor with a new server.
pub fn generate_validation_token() -> String {
    format!("{VALIDATION_TOKEN_PREFIX}{}", random_secret())
}

/// A new API key as `(identifier, full token)`.
///
/// The identifier is the lookup handle and is safe to display; only the
/// full token authenticates.
pub fn generate_api_key() -> (String, String) {
    let mut rng = rand::rng();
    let tail: String = (0..IDENTIFIER_LEN)
        .map(|_| IDENTIFIER_CHARS[rng.random_range(0..IDENTIFIER_CHARS.len())] as char)
        .collect();
    let identifier = format!("{API_KEY_PREFIX}{tail}");
    let token = format!("{identifier}.{}", random_secret());
    (identifier, token)
}

/// Split an API key into its identifier and secret parts.
pub fn split_api_key(token: &str) -> Option<(&str, &str)> {
    let (identifier, secret) = token.split_once('.')?;
    if !identifier.starts_with(API_KEY_PREFIX) || secret.is_empty() {
        return None;
    }
    Some((identifier, secret))
}

/// Hash a token for storage using SHA-256.
/// The hash is returned as a hex string.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Compare a presented token with a stored hash without an early exit.
pub fn verify_token(token: &str, stored_hash: &str) -> bool {
    let presented = hash_token(token);
    if presented.len() != stored_hash.len() {
        return false;
    }
    presented
        .bytes()
        .zip(stored_hash.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_token_format() {
        let token = generate_validation_token();
        assert!(token.starts_with(VALIDATION_TOKEN_PREFIX));
        assert_eq!(token.len(), VALIDATION_TOKEN_PREFIX.len() + 43);
        assert_ne!(token, generate_validation_token());
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let hash = hash_token("hello");
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_verify_token() {
        let token = generate_validation_token();
        let hash = hash_token(&token);
        assert!(verify_token(&token, &hash));
        assert!(!verify_token("wvt_other", &hash));
        assert!(!verify_token(&token, "short"));
    }

    #[test]
    fn test_api_key_split() {
        let (identifier, token) = generate_api_key();
        assert_eq!(identifier.len(), API_KEY_PREFIX.len() + IDENTIFIER_LEN);
        let (id, secret) = split_api_key(&token).unwrap();
        assert_eq!(id, identifier);
        assert_eq!(secret.len(), 43);
        assert!(split_api_key("no-dot").is_none());
        assert!(split_api_key("xyz_abc.secret").is_none());
        assert!(split_api_key("wak_abc.").is_none());
    }
}
