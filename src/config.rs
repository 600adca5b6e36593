// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Configuration.
//!
//! Read from `~/.atlas/config.json` (or an explicit path). Every field has a
//! default, so an empty `{}` file is a valid configuration. A handful of
//! environment variables override the file:
//!
//! | variable                 | field                          |
//! |--------------------------|--------------------------------|
//! | `ATLAS_PORT`             | `server.port`                  |
//! | `ATLAS_SESSION_SECRET`   | `security.session_secret`      |
//! | `SUPABASE_URL`           | `directory.postgrest.url`      |
//! | `SUPABASE_KEY`           | `directory.postgrest.api_key`  |
//! | `CLOUDINARY_CLOUD_NAME`  | `media.cloud_name`             |
//! | `CLOUDINARY_API_KEY`     | `media.api_key`                |
//! | `CLOUDINARY_API_SECRET`  | `media.api_secret`             |

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::directory::{PostgrestConfig, StoredUser};
use crate::media::CloudinaryConfig;
use crate::security::auth::{CredentialPolicy, DEFAULT_MIN_PASSWORD_LEN, DEFAULT_MIN_USERNAME_LEN};
use crate::security::event_log::{EventLogLimits, DEFAULT_LOG_CAPACITY, DEFAULT_RETENTION_DAYS};
use crate::security::guard::{
    SuspicionPolicy, DEFAULT_NAVIGATION_THRESHOLD, DEFAULT_SUSPICION_WINDOW_SECS,
    DEFAULT_UNAUTHORIZED_THRESHOLD,
};
use crate::security::lockout::{
    LockoutPolicy, DEFAULT_LOCKOUT_DURATION_SECS, DEFAULT_MAX_LOGIN_ATTEMPTS,
};
use crate::security::routes::RouteTable;
use crate::security::session_store::{SessionSecret, DEFAULT_SESSION_TIMEOUT_SECS};

/// Default port of the media backend.
pub const DEFAULT_PORT: u16 = 3001;

pub const CONFIG_FILE: &str = "config.json";

/// Upper bound for any configured span: 100 years.
const MAX_SPAN_SECS: u64 = 100 * 365 * 24 * 60 * 60;
pub const STATE_FILE: &str = "state.json";
pub const SECRET_FILE: &str = "session.key";

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_session_timeout() -> u64 {
    DEFAULT_SESSION_TIMEOUT_SECS
}

fn default_revalidation_interval() -> u64 {
    5 * 60
}

fn default_guard_interval() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_LOGIN_ATTEMPTS
}

fn default_lockout_duration() -> u64 {
    DEFAULT_LOCKOUT_DURATION_SECS
}

fn default_min_username() -> usize {
    DEFAULT_MIN_USERNAME_LEN
}

fn default_min_password() -> usize {
    DEFAULT_MIN_PASSWORD_LEN
}

fn default_true() -> bool {
    true
}

fn default_window() -> u64 {
    DEFAULT_SUSPICION_WINDOW_SECS as u64
}

fn default_unauthorized_threshold() -> usize {
    DEFAULT_UNAUTHORIZED_THRESHOLD
}

fn default_navigation_threshold() -> usize {
    DEFAULT_NAVIGATION_THRESHOLD
}

fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

fn default_retention_days() -> u64 {
    DEFAULT_RETENTION_DAYS as u64
}

fn default_prune_interval() -> u64 {
    24 * 60 * 60
}

fn default_requests_per_second() -> u64 {
    5
}

fn default_burst() -> u32 {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Per-IP request rate (tower_governor).
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u64,
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityConfig {
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_revalidation_interval")]
    pub revalidation_interval_secs: u64,
    #[serde(default = "default_guard_interval")]
    pub guard_check_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_login_attempts: u32,
    #[serde(default = "default_lockout_duration")]
    pub lockout_duration_secs: u64,
    #[serde(default = "default_min_username")]
    pub min_username_len: usize,
    #[serde(default = "default_min_password")]
    pub min_password_len: usize,
    #[serde(default = "default_true")]
    pub count_invalid_input: bool,
    #[serde(default = "default_window")]
    pub suspicious_window_secs: u64,
    #[serde(default = "default_unauthorized_threshold")]
    pub unauthorized_threshold: usize,
    #[serde(default = "default_navigation_threshold")]
    pub navigation_threshold: usize,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_log_capacity")]
    pub persisted_log_capacity: usize,
    #[serde(default = "default_retention_days")]
    pub log_retention_days: u64,
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
    /// Bound into the session integrity tag. Defaults to the host name.
    #[serde(default)]
    pub client_fingerprint: Option<String>,
    /// HMAC key. When absent a random key is kept in `session.key`.
    #[serde(default)]
    pub session_secret: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: default_session_timeout(),
            revalidation_interval_secs: default_revalidation_interval(),
            guard_check_interval_secs: default_guard_interval(),
            max_login_attempts: default_max_attempts(),
            lockout_duration_secs: default_lockout_duration(),
            min_username_len: default_min_username(),
            min_password_len: default_min_password(),
            count_invalid_input: true,
            suspicious_window_secs: default_window(),
            unauthorized_threshold: default_unauthorized_threshold(),
            navigation_threshold: default_navigation_threshold(),
            log_capacity: default_log_capacity(),
            persisted_log_capacity: default_log_capacity(),
            log_retention_days: default_retention_days(),
            prune_interval_secs: default_prune_interval(),
            client_fingerprint: None,
            session_secret: None,
        }
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("session_timeout_secs", &self.session_timeout_secs)
            .field("max_login_attempts", &self.max_login_attempts)
            .field("lockout_duration_secs", &self.lockout_duration_secs)
            .field("client_fingerprint", &self.client_fingerprint)
            .field(
                "session_secret",
                &self.session_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

impl SecurityConfig {
    pub fn session_timeout(&self) -> ChronoDuration {
        span_secs(self.session_timeout_secs)
    }

    pub fn revalidation_interval(&self) -> Duration {
        Duration::from_secs(self.revalidation_interval_secs.max(1))
    }

    pub fn guard_check_interval(&self) -> Duration {
        Duration::from_secs(self.guard_check_interval_secs.max(1))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }

    pub fn log_retention(&self) -> ChronoDuration {
        span_days(self.log_retention_days)
    }

    pub fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy {
            max_attempts: self.max_login_attempts.max(1),
            duration: span_secs(self.lockout_duration_secs),
        }
    }

    pub fn credential_policy(&self) -> CredentialPolicy {
        CredentialPolicy {
            min_username_len: self.min_username_len,
            min_password_len: self.min_password_len,
            count_invalid_input: self.count_invalid_input,
        }
    }

    pub fn suspicion_policy(&self) -> SuspicionPolicy {
        SuspicionPolicy {
            window: span_secs(self.suspicious_window_secs),
            unauthorized_threshold: self.unauthorized_threshold.max(1),
            navigation_threshold: self.navigation_threshold.max(1),
        }
    }

    pub fn event_log_limits(&self) -> EventLogLimits {
        EventLogLimits {
            memory_capacity: self.log_capacity.max(1),
            persisted_capacity: self.persisted_log_capacity.max(1),
        }
    }

    /// Configured fingerprint, else the host name.
    pub fn fingerprint(&self) -> String {
        if let Some(fp) = &self.client_fingerprint {
            return fp.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "atlas-host".to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub users: Vec<StoredUser>,
    #[serde(default)]
    pub postgrest: Option<PostgrestConfig>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtlasConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub routes: RouteTable,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub media: Option<CloudinaryConfig>,
    #[serde(default)]
    pub storage: StorageBackend,
    /// State directory; defaults to the config directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl AtlasConfig {
    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get("ATLAS_PORT") {
            match port.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("Ignoring invalid ATLAS_PORT value: {}", port),
            }
        }
        if let Some(secret) = get("ATLAS_SESSION_SECRET") {
            self.security.session_secret = Some(secret);
        }

        match (get("SUPABASE_URL"), get("SUPABASE_KEY")) {
            (Some(url), Some(api_key)) => {
                let table = self
                    .directory
                    .postgrest
                    .as_ref()
                    .map(|p| p.table.clone())
                    .unwrap_or_else(|| "usuarios".to_string());
                self.directory.postgrest = Some(PostgrestConfig { url, api_key, table });
            }
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!("SUPABASE_URL and SUPABASE_KEY must be set together; ignoring");
            }
            (None, None) => {}
        }

        if let (Some(cloud_name), Some(api_key), Some(api_secret)) = (
            get("CLOUDINARY_CLOUD_NAME"),
            get("CLOUDINARY_API_KEY"),
            get("CLOUDINARY_API_SECRET"),
        ) {
            let api_base = self.media.as_ref().and_then(|m| m.api_base.clone());
            self.media = Some(CloudinaryConfig {
                cloud_name,
                api_key,
                api_secret,
                api_base,
            });
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => config_dir(),
        }
    }
}

/// Configured seconds as a span, capped at [`MAX_SPAN_SECS`].
pub fn span_secs(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(secs.min(MAX_SPAN_SECS)).unwrap_or(i64::MAX / 1000))
}

pub fn span_days(days: u64) -> ChronoDuration {
    span_secs(days.saturating_mul(24 * 60 * 60))
}

/// `~/.atlas`, created on first use.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let dir = home.join(".atlas");
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(dir)
}

/// Load the config file (default location when `path` is `None`) and apply
/// environment overrides. A missing file yields the defaults.
pub fn load_config(path: Option<&Path>) -> Result<AtlasConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_dir()?.join(CONFIG_FILE),
    };

    let mut config = if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?
    } else {
        AtlasConfig::default()
    };

    config.apply_env();
    Ok(config)
}

pub fn save_config(config: &AtlasConfig, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// The configured secret, else the one kept in `<dir>/session.key`,
/// generating it on first use.
pub fn load_or_create_secret(config: &SecurityConfig, dir: &Path) -> Result<SessionSecret> {
    if let Some(secret) = &config.session_secret {
        return Ok(SessionSecret::new(secret.as_bytes().to_vec()));
    }

    let path = dir.join(SECRET_FILE);
    if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let bytes = hex::decode(content.trim())
            .with_context(|| format!("{} is not valid hex", path.display()))?;
        anyhow::ensure!(bytes.len() >= 16, "{} holds too short a key", path.display());
        return Ok(SessionSecret::new(bytes));
    }

    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let secret = SessionSecret::generate();
    fs::write(&path, hex::encode(secret.as_bytes()))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    restrict_permissions(&path)?;
    tracing::info!("Generated new session secret at {}", path.display());
    Ok(secret)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
