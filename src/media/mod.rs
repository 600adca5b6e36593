// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Media host client.
//!
//! Plate images live on Cloudinary. The editor only ever needs one
//! server-side operation from it: deleting an asset by public id, which
//! requires the API secret and therefore cannot happen in the browser.
//!
//! Signed destroy request:
//! `POST {api_base}/v1_1/{cloud}/image/destroy` with form fields
//! `public_id`, `timestamp`, `api_key`, `signature_algorithm=sha256` and
//! `signature = hex(sha256("public_id=..&timestamp=.." + api_secret))`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_API_BASE: &str = "https://api.cloudinary.com";

/// Default timeout for media API requests (in seconds).
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
    /// Override for the API origin (tests, proxies).
    #[serde(default)]
    pub api_base: Option<String>,
}

impl fmt::Debug for CloudinaryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudinaryConfig")
            .field("cloud_name", &self.cloud_name)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestroyOutcome {
    Deleted,
    /// Already gone. Treated as success by callers.
    NotFound,
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media host not configured")]
    NotConfigured,

    #[error("media host unreachable: {0}")]
    Network(String),

    #[error("media host rejected the request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait MediaHost: Send + Sync {
    async fn destroy(&self, public_id: &str) -> Result<DestroyOutcome, MediaError>;
}

#[derive(Debug, Deserialize)]
struct DestroyResponse {
    result: Option<String>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Clone)]
pub struct CloudinaryClient {
    config: CloudinaryConfig,
    client: reqwest::Client,
    timeout: Duration,
}

impl CloudinaryClient {
    pub fn new(config: CloudinaryConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    fn destroy_url(&self) -> String {
        let base = self
            .config
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/');
        format!("{}/v1_1/{}/image/destroy", base, self.config.cloud_name)
    }
}

/// Parameters sorted by name, joined as `k=v&k=v`, secret appended.
pub(crate) fn sign(params: &[(&str, &str)], api_secret: &str) -> String {
    let mut sorted: Vec<_> = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[async_trait]
impl MediaHost for CloudinaryClient {
    async fn destroy(&self, public_id: &str) -> Result<DestroyOutcome, MediaError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = sign(
            &[("public_id", public_id), ("timestamp", timestamp.as_str())],
            &self.config.api_secret,
        );

        tracing::info!(target: "atlas::media", public_id = %public_id, "Deleting image");

        let form = [
            ("public_id", public_id),
            ("timestamp", timestamp.as_str()),
            ("api_key", self.config.api_key.as_str()),
            ("signature", signature.as_str()),
            ("signature_algorithm", "sha256"),
        ];

        let response = self
            .client
            .post(self.destroy_url())
            .form(&form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| MediaError::Network(e.to_string()))?;

        let status = response.status();
        let body: DestroyResponse = response
            .json()
            .await
            .map_err(|e| MediaError::Rejected(format!("HTTP {} with unreadable body: {}", status, e)))?;

        if let Some(error) = body.error {
            return Err(MediaError::Rejected(error.message));
        }

        match body.result.as_deref() {
            Some("ok") => Ok(DestroyOutcome::Deleted),
            Some("not found") => Ok(DestroyOutcome::NotFound),
            Some(other) => Err(MediaError::Rejected(other.to_string())),
            None => Err(MediaError::Rejected(format!("HTTP {} without result", status))),
        }
    }
}
