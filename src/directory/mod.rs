// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! User directory.
//!
//! The directory answers one question: do these credentials belong to a
//! known user? It returns at most one [`UserRecord`] and never the stored
//! credential. Password hashes are Argon2 PHC strings checked on the
//! blocking pool.
//!
//! Implementations:
//! - [`StaticDirectory`] - users listed in the config file
//! - [`PostgrestDirectory`] - the hosted database's REST interface

pub mod postgrest;

pub use postgrest::{PostgrestConfig, PostgrestDirectory};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::password::{verify_dummy, verify_password, PasswordError};

/// Public part of a user: what a session may carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
}

impl UserRecord {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory unreachable: {0}")]
    Unavailable(String),

    #[error("directory returned an unexpected response: {0}")]
    BadResponse(String),

    #[error("stored credential for '{username}' is unusable: {source}")]
    Credential {
        username: String,
        #[source]
        source: PasswordError,
    },
}

/// Credential lookup. `username` arrives trimmed and lowercased.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserRecord>, DirectoryError>;
}

/// A user entry with its password hash, as held in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUser {
    pub id: String,
    pub username: String,
    pub password_hash: String,
}

/// Directory backed by a fixed list of users.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    users: Vec<StoredUser>,
}

impl StaticDirectory {
    pub fn new(users: Vec<StoredUser>) -> Self {
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserRecord>, DirectoryError> {
        let Some(user) = self
            .users
            .iter()
            .find(|u| u.username.trim().eq_ignore_ascii_case(username))
        else {
            check_dummy(password).await?;
            return Ok(None);
        };

        let matched = check_hash(username, password, &user.password_hash).await?;
        Ok(matched.then(|| UserRecord::new(&user.id, &user.username)))
    }
}

/// Verify on the blocking pool; Argon2 is deliberately slow.
pub(crate) async fn check_hash(
    username: &str,
    password: &str,
    hash: &str,
) -> Result<bool, DirectoryError> {
    let password = password.to_string();
    let hash = hash.to_string();
    let result = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| DirectoryError::Unavailable(format!("verification task failed: {}", e)))?;

    result.map_err(|source| DirectoryError::Credential {
        username: username.to_string(),
        source,
    })
}

/// Same cost as [`check_hash`], never a match.
pub(crate) async fn check_dummy(password: &str) -> Result<(), DirectoryError> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || verify_dummy(&password))
        .await
        .map_err(|e| DirectoryError::Unavailable(format!("verification task failed: {}", e)))?;
    Ok(())
}
