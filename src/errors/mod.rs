// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! HTTP-facing error handling.
//!
//! Core errors (`AuthError`, `StorageError`, `MediaError`) are converted to
//! [`UserError`] at the HTTP edge. A `UserError`:
//! - carries a generic, actionable message
//! - carries a reference code (`ERR-YYYYMMDD-XXXXXX`) that also appears in
//!   the operator log next to the sanitized internal details
//! - never includes paths, addresses, tokens or whether a username exists

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::media::MediaError;
use crate::security::auth::AuthError;
use crate::storage::StorageError;

/// Generate a unique error reference code.
/// Format: ERR-YYYYMMDD-XXXXXX (e.g., ERR-20250115-A3F8K2)
pub fn generate_reference_code() -> String {
    let date = Utc::now().format("%Y%m%d");
    let mut rng = rand::thread_rng();
    let chars: Vec<char> = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect();
    let random: String = (0..6)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    format!("ERR-{}-{}", date, random)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "error_type", rename_all = "snake_case")]
pub enum UserError {
    /// 400
    InvalidRequest {
        message: String,
        reference: String,
        field: Option<String>,
    },

    /// 401, bad credentials or no session
    AuthenticationRequired { message: String, reference: String },

    /// 401, session expired or failed its integrity check
    SessionExpired { message: String, reference: String },

    /// 409, a login is already being processed
    Conflict { message: String, reference: String },

    /// 429, lockout active. No retry hint.
    TooManyAttempts { message: String, reference: String },

    /// 500 from the image delete proxy: `{message, error}`
    ImageDeleteFailed {
        message: String,
        error: String,
        reference: String,
    },

    /// 503
    ServiceUnavailable {
        message: String,
        reference: String,
        retry_after_secs: Option<u64>,
    },
}

impl UserError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            UserError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            UserError::AuthenticationRequired { .. } => StatusCode::UNAUTHORIZED,
            UserError::SessionExpired { .. } => StatusCode::UNAUTHORIZED,
            UserError::Conflict { .. } => StatusCode::CONFLICT,
            UserError::TooManyAttempts { .. } => StatusCode::TOO_MANY_REQUESTS,
            UserError::ImageDeleteFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            UserError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            UserError::InvalidRequest { reference, .. }
            | UserError::AuthenticationRequired { reference, .. }
            | UserError::SessionExpired { reference, .. }
            | UserError::Conflict { reference, .. }
            | UserError::TooManyAttempts { reference, .. }
            | UserError::ImageDeleteFailed { reference, .. }
            | UserError::ServiceUnavailable { reference, .. } => reference,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            UserError::InvalidRequest { message, .. }
            | UserError::AuthenticationRequired { message, .. }
            | UserError::SessionExpired { message, .. }
            | UserError::Conflict { message, .. }
            | UserError::TooManyAttempts { message, .. }
            | UserError::ImageDeleteFailed { message, .. }
            | UserError::ServiceUnavailable { message, .. } => message,
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: UserError,
    pub status: u16,
}

impl IntoResponse for UserError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = match &self {
            UserError::ServiceUnavailable {
                retry_after_secs: Some(secs),
                ..
            } => Some(secs.to_string()),
            _ => None,
        };
        let response = ErrorResponse {
            status: status.as_u16(),
            error: self,
        };

        let body = serde_json::to_string(&response).unwrap_or_else(|_| {
            r#"{"error":{"error_type":"internal_error","message":"An unexpected error occurred","reference":"ERR-FALLBACK"},"status":500}"#.to_string()
        });

        let mut response = (status, [(header::CONTENT_TYPE, "application/json")], body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl UserError {
    pub fn invalid_request(user_message: &str, field: Option<&str>) -> Self {
        let reference = generate_reference_code();
        tracing::warn!(reference = %reference, field = ?field, "Invalid request");
        Self::InvalidRequest {
            message: user_message.to_string(),
            reference,
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn authentication_required(user_message: &str, internal_reason: Option<&str>) -> Self {
        let reference = generate_reference_code();
        if let Some(reason) = internal_reason {
            tracing::warn!(
                reference = %reference,
                internal_reason = %sanitize_error_details(reason),
                "Authentication required"
            );
        }
        Self::AuthenticationRequired {
            message: user_message.to_string(),
            reference,
        }
    }

    pub fn session_expired(user_message: &str) -> Self {
        let reference = generate_reference_code();
        tracing::info!(reference = %reference, "Session expired");
        Self::SessionExpired {
            message: user_message.to_string(),
            reference,
        }
    }

    pub fn conflict(user_message: &str) -> Self {
        Self::Conflict {
            message: user_message.to_string(),
            reference: generate_reference_code(),
        }
    }

    pub fn too_many_attempts(user_message: &str) -> Self {
        let reference = generate_reference_code();
        tracing::warn!(reference = %reference, "Login refused during lockout");
        Self::TooManyAttempts {
            message: user_message.to_string(),
            reference,
        }
    }

    /// The image host refused or failed the deletion. The host's own error
    /// text is passed through after sanitization.
    pub fn image_delete_failed(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        let sanitized = sanitize_error_details(internal_error);
        tracing::error!(
            reference = %reference,
            internal_error = %sanitized,
            "Image deletion failed"
        );
        Self::ImageDeleteFailed {
            message: "Error deleting the image.".to_string(),
            error: sanitized,
            reference,
        }
    }

    pub fn service_unavailable(internal_error: &str) -> Self {
        let reference = generate_reference_code();
        tracing::error!(
            reference = %reference,
            internal_error = %sanitize_error_details(internal_error),
            "Service unavailable"
        );
        Self::ServiceUnavailable {
            message: "Service temporarily unavailable. Please try again later.".to_string(),
            reference,
            retry_after_secs: Some(30),
        }
    }
}

impl From<AuthError> for UserError {
    fn from(error: AuthError) -> Self {
        let message = error.user_message();
        match error {
            AuthError::InputInvalid => UserError::invalid_request(message, Some("credentials")),
            AuthError::LockedOut => UserError::too_many_attempts(message),
            AuthError::CredentialMismatch
            | AuthError::CollaboratorUnavailable
            | AuthError::StorageUnavailable => {
                UserError::authentication_required(message, Some(&error.to_string()))
            }
            AuthError::SessionInvalid(_) => UserError::session_expired(message),
            AuthError::LoginInFlight => UserError::conflict(message),
        }
    }
}

impl From<StorageError> for UserError {
    fn from(error: StorageError) -> Self {
        UserError::service_unavailable(&error.to_string())
    }
}

impl From<MediaError> for UserError {
    fn from(error: MediaError) -> Self {
        UserError::image_delete_failed(&error.to_string())
    }
}

/// Compiled once; see [`sanitize_error_details`].
static SANITIZE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // File paths
        (Regex::new(r"[A-Za-z]:\\[^\s]+").expect("Windows path regex"), "[PATH_REDACTED]"),
        (Regex::new(r"/(?:home|usr|var|etc|opt|tmp|root)/[^\s]+").expect("Unix path regex"), "[PATH_REDACTED]"),

        // URLs carry hosts and sometimes keys in the query string
        (Regex::new(r"(?i)https?://[^\s]+").expect("URL regex"), "[URL_REDACTED]"),

        // IP addresses
        (Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(?::\d+)?\b").expect("IPv4 regex"), "[IP_REDACTED]"),

        // Credentials and tokens
        (Regex::new(r"(?i)password=[^\s;&]+").expect("Password regex"), "password=[REDACTED]"),
        (Regex::new(r"(?i)apikey=[^\s;&]+").expect("API key regex"), "apikey=[REDACTED]"),
        (Regex::new(r"Bearer [a-zA-Z0-9\-._~+/]+=*").expect("Bearer token regex"), "Bearer [TOKEN_REDACTED]"),
        (Regex::new(r"sess_[0-9a-fA-F]{8,}").expect("Session token regex"), "[SESSION_REDACTED]"),
        (Regex::new(r"\$argon2[a-z]*\$[^\s]+").expect("Password hash regex"), "[HASH_REDACTED]"),

        // Stack traces
        (Regex::new(r"at [^\s]+\.rs:\d+:\d+").expect("Rust location regex"), "[LOCATION_REDACTED]"),
        (Regex::new(r"thread '[^']+' panicked at").expect("Panic regex"), "[PANIC_REDACTED]"),

        // PII
        (Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("Email regex"), "[EMAIL_REDACTED]"),

        // Long opaque strings (keys, secrets)
        (Regex::new(r"\b[A-Za-z0-9]{40,}\b").expect("Long secret regex"), "[SECRET_REDACTED]"),
    ]
});

/// Strip paths, addresses, credentials and PII from error text.
pub fn sanitize_error_details(error: &str) -> String {
    let mut result = error.to_string();
    for (pattern, replacement) in SANITIZE_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}
