// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Argon2 password hashing for directory records.

use argon2::{Argon2, PasswordVerifier};
use password_hash::{PasswordHash, PasswordHasher, SaltString};
use rand::rngs::OsRng;
use std::sync::LazyLock;
use thiserror::Error;

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

/// Hash verified when there is no stored hash to check against.
static DUMMY_HASH: LazyLock<Option<String>> =
    LazyLock::new(|| hash_password("atlas-placeholder-credential").ok());

#[cfg(test)]
static DUMMY_VERIFICATIONS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("password hashing failed")]
    HashFailed,

    #[error("stored password hash is malformed")]
    MalformedHash,
}

/// Hash a password with a fresh random salt. The result is a PHC string
/// (`$argon2id$v=19$...`) suitable for the directory's `password_hash`.
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| PasswordError::HashFailed)
}

/// Check `password` against a stored PHC hash. Parameters are taken from the
/// hash itself.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed = PasswordHash::new(hash).map_err(|_| PasswordError::MalformedHash)?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Run a full verification against a fixed hash and report no match. Used
/// for unknown users and rows without a hash, which then cost as much as a
/// wrong password for a known user.
pub fn verify_dummy(password: &str) -> bool {
    #[cfg(test)]
    DUMMY_VERIFICATIONS.fetch_add(1, Ordering::SeqCst);

    if let Some(hash) = DUMMY_HASH.as_deref() {
        let _ = verify_password(password, hash);
    }
    false
}

#[cfg(test)]
pub(crate) fn dummy_verifications() -> usize {
    DUMMY_VERIFICATIONS.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("correct-pass").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("correct-pass", &hash).unwrap());
        assert!(!verify_password("wrong-pass", &hash).unwrap());
    }

    #[test]
    fn test_salts_differ() {
        let a = hash_password("same").unwrap();
        let b = hash_password("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_dummy_never_matches() {
        let before = dummy_verifications();
        assert!(!verify_dummy("atlas-placeholder-credential"));
        assert!(DUMMY_HASH.as_deref().is_some_and(|h| h.starts_with("$argon2")));
        assert!(dummy_verifications() > before);
    }

    #[test]
    fn test_malformed_hash() {
        assert!(matches!(
            verify_password("x", "plaintext"),
            Err(PasswordError::MalformedHash)
        ));
    }
}
