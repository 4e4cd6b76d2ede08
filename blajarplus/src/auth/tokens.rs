//! Bearer secrets for sessions and magic links.
//!
//! A token is `<uuid>.<secret>`: the UUID names the stored row, the secret is
//! 32 random bytes in base64url. Only the SHA-256 of the secret is stored.

use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A freshly minted token and the hash to store for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// Row id
    pub id: Uuid,
    /// `<id>.<secret>`, handed to the client once
    pub token: String,
    /// Hex SHA-256 of the secret half
    pub secret_hash: String,
}

/// Mint a new token.
#[must_use]
pub fn issue() -> IssuedToken {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    let secret = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(secret);
    let id = Uuid::new_v4();
    IssuedToken {
        id,
        token: format!("{id}.{secret}"),
        secret_hash: hash_secret(&secret),
    }
}

/// Split a presented token into its id and secret.
#[must_use]
pub fn parse(token: &str) -> Option<(Uuid, &str)> {
    let (id, secret) = token.trim().split_once('.')?;
    if secret.is_empty() {
        return None;
    }
    Some((Uuid::parse_str(id).ok()?, secret))
}

/// Hex SHA-256 of a secret.
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    Sha256::digest(secret.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Constant-time check of a presented secret against a stored hash.
#[must_use]
pub fn secret_matches(secret: &str, stored_hash: &str) -> bool {
    constant_time_eq::constant_time_eq(hash_secret(secret).as_bytes(), stored_hash.as_bytes())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let issued = issue();
        let (id, secret) = parse(&issued.token).unwrap();
        assert_eq!(id, issued.id);
        assert_eq!(secret.len(), 43);
        assert!(secret_matches(secret, &issued.secret_hash));
        assert!(!secret_matches("forged", &issued.secret_hash));
        assert_ne!(issue().token, issued.token);
    }

    #[test]
    fn test_malformed_tokens() {
        assert!(parse("no-dot").is_none());
        assert!(parse("not-a-uuid.secret").is_none());
        assert!(parse(&format!("{}.", Uuid::new_v4())).is_none());
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        assert_eq!(
            hash_secret("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
