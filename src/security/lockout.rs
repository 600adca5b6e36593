// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Login lockout tracking.
//!
//! A failed-attempt counter and an absolute lockout deadline, both kept in
//! persistent storage so a restart does not reset an active lockout.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::storage::{KeyValueStore, StorageError};

pub const FAILED_ATTEMPTS_KEY: &str = "atlas_failed_attempts";
pub const LOCKOUT_UNTIL_KEY: &str = "atlas_lockout_time";

pub const DEFAULT_MAX_LOGIN_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOCKOUT_DURATION_SECS: u64 = 15 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_LOGIN_ATTEMPTS,
            duration: Duration::seconds(DEFAULT_LOCKOUT_DURATION_SECS as i64),
        }
    }
}

enum StoredDeadline {
    Absent,
    At(DateTime<Utc>),
    Unparsable(String),
}

pub struct LockoutTracker {
    store: Arc<dyn KeyValueStore>,
    policy: LockoutPolicy,
}

impl LockoutTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, policy: LockoutPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> LockoutPolicy {
        self.policy
    }

    /// True while a stored deadline lies in the future. A passed deadline is
    /// cleared together with the counter, as is a stored value that is not a
    /// timestamp. Any storage read error counts as locked.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        match self.deadline() {
            Ok(StoredDeadline::At(deadline)) if now < deadline => true,
            Ok(StoredDeadline::At(_)) => {
                tracing::info!(
                    target: "atlas::security",
                    event = "LOCKOUT_EXPIRED",
                    "Lockout period elapsed; counter reset"
                );
                self.reset();
                false
            }
            Ok(StoredDeadline::Absent) => false,
            Ok(StoredDeadline::Unparsable(raw)) => {
                tracing::warn!(
                    target: "atlas::security",
                    event = "LOCKOUT_STATE_CORRUPT",
                    value = %raw,
                    "Discarding unreadable lockout deadline"
                );
                self.reset();
                false
            }
            Err(e) => {
                tracing::warn!(
                    target: "atlas::security",
                    event = "LOCKOUT_STORAGE_ERROR",
                    error = %e,
                    "Lockout state unreadable; refusing login"
                );
                true
            }
        }
    }

    /// Count one failure. Reaching the maximum sets the deadline; the
    /// counter itself is kept.
    pub fn record_failure(&self, now: DateTime<Utc>) {
        let attempts = self.failed_attempts().saturating_add(1);
        if let Err(e) = self
            .store
            .set(FAILED_ATTEMPTS_KEY, &attempts.to_string())
        {
            tracing::warn!(target: "atlas::security", error = %e, "Failed to persist attempt counter");
        }

        tracing::warn!(
            target: "atlas::security",
            event = "LOGIN_FAILURE_COUNTED",
            attempts = attempts,
            max_attempts = self.policy.max_attempts,
            "Failed login attempt recorded"
        );

        if attempts >= self.policy.max_attempts {
            let deadline = now + self.policy.duration;
            if let Err(e) = self
                .store
                .set(LOCKOUT_UNTIL_KEY, &deadline.timestamp_millis().to_string())
            {
                tracing::warn!(target: "atlas::security", error = %e, "Failed to persist lockout deadline");
            }
            tracing::warn!(
                target: "atlas::security",
                event = "LOCKOUT_STARTED",
                until = %deadline.to_rfc3339(),
                "Login locked after repeated failures"
            );
        }
    }

    pub fn record_success(&self) {
        self.reset();
    }

    /// Time left on the current lockout. Operator use only; never shown to
    /// the person logging in.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self.deadline() {
            Ok(StoredDeadline::At(deadline)) if now < deadline => Some(deadline - now),
            _ => None,
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.store
            .get(FAILED_ATTEMPTS_KEY)
            .ok()
            .flatten()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    fn deadline(&self) -> Result<StoredDeadline, StorageError> {
        let Some(raw) = self.store.get(LOCKOUT_UNTIL_KEY)? else {
            return Ok(StoredDeadline::Absent);
        };
        let parsed = raw
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        Ok(match parsed {
            Some(deadline) => StoredDeadline::At(deadline),
            None => StoredDeadline::Unparsable(raw),
        })
    }

    fn reset(&self) {
        for key in [FAILED_ATTEMPTS_KEY, LOCKOUT_UNTIL_KEY] {
            if let Err(e) = self.store.remove(key) {
                tracing::warn!(target: "atlas::security", key = key, error = %e, "Failed to clear lockout state");
            }
        }
    }
}
