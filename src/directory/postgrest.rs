// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! PostgREST-backed user directory.
//!
//! Looks the user up by exact username in the configured table
//! (`GET {url}/rest/v1/{table}?select=id,username,password_hash&username=eq.{name}`)
//! and checks the password hash locally. The password never leaves the
//! process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{check_dummy, check_hash, DirectoryError, UserDirectory, UserRecord};

/// Default timeout for directory requests (in seconds).
const REQUEST_TIMEOUT_SECS: u64 = 10;

fn default_table() -> String {
    "usuarios".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgrestConfig {
    /// Project base URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    /// Service key sent as `apikey` and bearer token.
    pub api_key: String,
    #[serde(default = "default_table")]
    pub table: String,
}

#[derive(Debug, Deserialize)]
struct UserRow {
    id: serde_json::Value,
    username: String,
    password_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PostgrestDirectory {
    config: PostgrestConfig,
    client: reqwest::Client,
    timeout: Duration,
}

impl PostgrestDirectory {
    pub fn new(config: PostgrestConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn lookup_url(&self, username: &str) -> Result<reqwest::Url, DirectoryError> {
        let base = format!(
            "{}/rest/v1/{}",
            self.config.url.trim_end_matches('/'),
            self.config.table
        );
        reqwest::Url::parse_with_params(
            &base,
            &[
                ("select", "id,username,password_hash".to_string()),
                ("username", format!("eq.{}", username)),
                ("limit", "1".to_string()),
            ],
        )
        .map_err(|e| DirectoryError::Unavailable(format!("invalid directory URL: {}", e)))
    }
}

#[async_trait]
impl UserDirectory for PostgrestDirectory {
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserRecord>, DirectoryError> {
        let url = self.lookup_url(username)?;

        let response = self
            .client
            .get(url)
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Accept", "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DirectoryError::Unavailable("request timed out".to_string())
                } else {
                    DirectoryError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::BadResponse(format!("HTTP {} - {}", status, body)));
        }

        let rows: Vec<UserRow> = response
            .json()
            .await
            .map_err(|e| DirectoryError::BadResponse(e.to_string()))?;

        let Some(row) = rows.into_iter().next() else {
            check_dummy(password).await?;
            return Ok(None);
        };
        let Some(hash) = row.password_hash else {
            tracing::warn!(
                target: "atlas::directory",
                user = %row.username,
                "Directory row has no password hash"
            );
            check_dummy(password).await?;
            return Ok(None);
        };

        if !check_hash(username, password, &hash).await? {
            return Ok(None);
        }

        let id = match row.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(Some(UserRecord::new(id, row.username)))
    }
}
