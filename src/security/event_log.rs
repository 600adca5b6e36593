// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Security Event Log
//!
//! Observational record of access decisions and anomalies. Events go to two
//! independently bounded lists:
//!
//! - an in-memory ring (most recent N) read by the guard's escalation
//!   heuristic
//! - a persisted JSON array under `atlas_security_log` for operator review
//!
//! Appending never fails. Storage problems are reported through `tracing`
//! and the event is still kept in memory and broadcast.
//!
//! Log line format:
//! `2025-03-02 10:23:45 | UNAUTHORIZED_ATTEMPT | /placas | protected route without session`

use chrono::{DateTime, Duration, Local, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::security::locks::{resilient_lock, resilient_read, resilient_write};
use crate::storage::{KeyValueStore, StorageError};

pub const SECURITY_LOG_KEY: &str = "atlas_security_log";
pub const LAST_CLEANUP_KEY: &str = "atlas_last_cleanup";

pub const DEFAULT_LOG_CAPACITY: usize = 50;
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const ID_SUFFIX_LEN: usize = 9;
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Session tokens or bearer credentials must never reach the log.
/// JUSTIFICATION for .expect(): static patterns, validated by the tests below.
static REDACTION_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"sess_[0-9a-fA-F]{8,}").expect("session token regex is valid"),
            "sess_[REDACTED]",
        ),
        (
            Regex::new(r"Bearer [a-zA-Z0-9\-._~+/]+=*").expect("bearer regex is valid"),
            "Bearer [REDACTED]",
        ),
        (
            Regex::new(r"(?i)password[=:]\s*\S+").expect("password regex is valid"),
            "password=[REDACTED]",
        ),
    ]
});

fn redact(text: &str) -> String {
    let mut result = text.to_string();
    for (pattern, replacement) in REDACTION_PATTERNS.iter() {
        result = pattern.replace_all(&result, *replacement).to_string();
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    PageAccess,
    UnauthorizedAttempt,
    SuspiciousActivity,
    SessionAnomaly,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::PageAccess => "PAGE_ACCESS",
            SecurityEventKind::UnauthorizedAttempt => "UNAUTHORIZED_ATTEMPT",
            SecurityEventKind::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
            SecurityEventKind::SessionAnomaly => "SESSION_ANOMALY",
        }
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub kind: SecurityEventKind,
    pub timestamp: DateTime<Utc>,
    pub path: String,
    pub detail: String,
}

impl SecurityEvent {
    pub fn new(
        kind: SecurityEventKind,
        timestamp: DateTime<Utc>,
        path: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: event_id(timestamp),
            kind,
            timestamp,
            path: path.into(),
            detail: redact(&detail.into()),
        }
    }

    pub fn to_log_line(&self) -> String {
        let local: DateTime<Local> = self.timestamp.into();
        format!(
            "{} | {} | {} | {}",
            local.format("%Y-%m-%d %H:%M:%S"),
            self.kind,
            self.path,
            self.detail
        )
    }
}

fn event_id(timestamp: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}_{}", timestamp.timestamp_millis(), suffix)
}

/// Counts over the persisted log, for the operator panel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStats {
    pub total: usize,
    pub page_accesses: usize,
    pub unauthorized_attempts: usize,
    pub suspicious_activities: usize,
    pub session_anomalies: usize,
    pub last_cleanup: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct EventLogLimits {
    pub memory_capacity: usize,
    pub persisted_capacity: usize,
}

impl Default for EventLogLimits {
    fn default() -> Self {
        Self {
            memory_capacity: DEFAULT_LOG_CAPACITY,
            persisted_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

pub struct SecurityEventLog {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    limits: EventLogLimits,
    recent: RwLock<VecDeque<SecurityEvent>>,
    /// Held across every read-modify-write of the persisted list.
    persist_lock: Mutex<()>,
    events: broadcast::Sender<SecurityEvent>,
}

impl SecurityEventLog {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, limits: EventLogLimits) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            clock,
            limits,
            recent: RwLock::new(VecDeque::with_capacity(limits.memory_capacity)),
            persist_lock: Mutex::new(()),
            events,
        }
    }

    /// Build an event stamped with the current time and append it.
    pub fn record(
        &self,
        kind: SecurityEventKind,
        path: &str,
        detail: impl Into<String>,
    ) -> SecurityEvent {
        let event = SecurityEvent::new(kind, self.clock.now(), path, detail);
        self.append(event.clone());
        event
    }

    pub fn append(&self, event: SecurityEvent) {
        match event.kind {
            SecurityEventKind::PageAccess => {
                tracing::debug!(target: "atlas::events", "{}", event.to_log_line())
            }
            _ => tracing::warn!(target: "atlas::events", "{}", event.to_log_line()),
        }

        {
            let mut recent = resilient_write(&self.recent);
            recent.push_back(event.clone());
            while recent.len() > self.limits.memory_capacity {
                recent.pop_front();
            }
        }

        if let Err(e) = self.persist(&event) {
            tracing::warn!(
                target: "atlas::events",
                error = %e,
                "Failed to persist security event"
            );
        }

        let _ = self.events.send(event);
    }

    /// Most recent first.
    pub fn recent(&self, n: usize) -> Vec<SecurityEvent> {
        resilient_read(&self.recent)
            .iter()
            .rev()
            .take(n)
            .cloned()
            .collect()
    }

    /// In-memory events of `kind` at or after `since`.
    pub fn count_since(&self, kind: SecurityEventKind, since: DateTime<Utc>) -> usize {
        resilient_read(&self.recent)
            .iter()
            .filter(|e| e.kind == kind && e.timestamp >= since)
            .count()
    }

    /// Drop entries older than `max_age` from both lists. Returns how many
    /// were removed in total.
    pub fn prune(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let cutoff = now - max_age;

        let mut removed = {
            let mut recent = resilient_write(&self.recent);
            let before = recent.len();
            recent.retain(|e| e.timestamp >= cutoff);
            before - recent.len()
        };

        let _persisting = resilient_lock(&self.persist_lock);
        match self.persisted() {
            Ok(mut events) => {
                let before = events.len();
                events.retain(|e| e.timestamp >= cutoff);
                if events.len() != before {
                    removed += before - events.len();
                    if let Err(e) = self.write_persisted(&events) {
                        tracing::warn!(target: "atlas::events", error = %e, "Failed to write pruned log");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(target: "atlas::events", error = %e, "Persisted log unreadable during prune");
            }
        }

        if removed > 0 {
            tracing::info!(
                target: "atlas::events",
                removed = removed,
                "Pruned security events older than {} days",
                max_age.num_days()
            );
        }
        removed
    }

    /// The persisted log, oldest first. A missing key is an empty log.
    pub fn persisted(&self) -> Result<Vec<SecurityEvent>, StorageError> {
        match self.store.get(SECURITY_LOG_KEY)? {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| StorageError::Corrupt(e.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Pretty JSON of the persisted log.
    pub fn export(&self) -> Result<String, StorageError> {
        let events = self.persisted()?;
        serde_json::to_string_pretty(&events).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    pub fn stats(&self) -> EventStats {
        let events = self.persisted().unwrap_or_else(|_| {
            resilient_read(&self.recent).iter().cloned().collect()
        });

        let count = |kind: SecurityEventKind| events.iter().filter(|e| e.kind == kind).count();
        let last_cleanup = self
            .store
            .get(LAST_CLEANUP_KEY)
            .ok()
            .flatten()
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        EventStats {
            total: events.len(),
            page_accesses: count(SecurityEventKind::PageAccess),
            unauthorized_attempts: count(SecurityEventKind::UnauthorizedAttempt),
            suspicious_activities: count(SecurityEventKind::SuspiciousActivity),
            session_anomalies: count(SecurityEventKind::SessionAnomaly),
            last_cleanup,
        }
    }

    /// Empty both lists and record when it happened.
    pub fn clear(&self) -> Result<(), StorageError> {
        let _persisting = resilient_lock(&self.persist_lock);
        resilient_write(&self.recent).clear();
        self.store.remove(SECURITY_LOG_KEY)?;
        self.store.set(
            LAST_CLEANUP_KEY,
            &self.clock.now().timestamp_millis().to_string(),
        )?;
        tracing::info!(target: "atlas::events", "Security log cleared");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events.subscribe()
    }

    fn persist(&self, event: &SecurityEvent) -> Result<(), StorageError> {
        let _persisting = resilient_lock(&self.persist_lock);
        let mut events = match self.persisted() {
            Ok(events) => events,
            Err(StorageError::Corrupt(detail)) => {
                tracing::warn!(target: "atlas::events", detail = %detail, "Resetting corrupt persisted log");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        events.push(event.clone());
        if events.len() > self.limits.persisted_capacity {
            let excess = events.len() - self.limits.persisted_capacity;
            events.drain(..excess);
        }
        self.write_persisted(&events)
    }

    fn write_persisted(&self, events: &[SecurityEvent]) -> Result<(), StorageError> {
        let raw = serde_json::to_string(events).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        self.store.set(SECURITY_LOG_KEY, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;

    fn log_with(limits: EventLogLimits) -> (MemoryStore, ManualClock, SecurityEventLog) {
        let memory = MemoryStore::new();
        let clock = ManualClock::default();
        let log = SecurityEventLog::new(Arc::new(memory.clone()), Arc::new(clock.clone()), limits);
        (memory, clock, log)
    }

    #[test]
    fn test_event_id_format() {
        let ts = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap();
        let event = SecurityEvent::new(SecurityEventKind::PageAccess, ts, "/", "");
        let (millis, suffix) = event.id.split_once('_').unwrap();
        assert_eq!(millis, "1700000000123");
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_recent_is_most_recent_first() {
        let (_, clock, log) = log_with(EventLogLimits::default());
        log.record(SecurityEventKind::PageAccess, "/", "");
        clock.advance(Duration::seconds(1));
        log.record(SecurityEventKind::UnauthorizedAttempt, "/placas", "");

        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].path, "/placas");
        assert_eq!(log.recent(1).len(), 1);
    }

    #[test]
    fn test_capacities_are_independent() {
        let (_, _, log) = log_with(EventLogLimits {
            memory_capacity: 3,
            persisted_capacity: 5,
        });
        for i in 0..8 {
            log.record(SecurityEventKind::PageAccess, &format!("/p{}", i), "");
        }

        let recent = log.recent(100);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].path, "/p7");

        let persisted = log.persisted().unwrap();
        assert_eq!(persisted.len(), 5);
        assert_eq!(persisted[0].path, "/p3");
    }

    #[test]
    fn test_concurrent_records_all_persist() {
        let (_, _, log) = log_with(EventLogLimits {
            memory_capacity: 400,
            persisted_capacity: 400,
        });

        std::thread::scope(|scope| {
            for t in 0..8 {
                let log = &log;
                scope.spawn(move || {
                    for i in 0..50 {
                        log.record(SecurityEventKind::PageAccess, &format!("/t{}/{}", t, i), "");
                    }
                });
            }
        });

        assert_eq!(log.recent(usize::MAX).len(), 400);
        assert_eq!(log.persisted().unwrap().len(), 400);
    }

    #[test]
    fn test_append_survives_storage_failure() {
        let (memory, _, log) = log_with(EventLogLimits::default());
        let mut rx = log.subscribe();
        memory.set_unavailable(true);

        log.record(SecurityEventKind::SessionAnomaly, "/edicion", "tampered");

        assert_eq!(log.recent(1)[0].kind, SecurityEventKind::SessionAnomaly);
        assert_eq!(rx.try_recv().unwrap().path, "/edicion");
    }

    #[test]
    fn test_prune_drops_old_entries() {
        let (_, clock, log) = log_with(EventLogLimits::default());
        log.record(SecurityEventKind::PageAccess, "/old", "");
        clock.advance(Duration::days(8));
        log.record(SecurityEventKind::PageAccess, "/new", "");

        let removed = log.prune(clock.now(), Duration::days(7));
        assert_eq!(removed, 2);
        assert_eq!(log.recent(10).len(), 1);
        assert_eq!(log.persisted().unwrap()[0].path, "/new");
    }

    #[test]
    fn test_count_since() {
        let (_, clock, log) = log_with(EventLogLimits::default());
        log.record(SecurityEventKind::UnauthorizedAttempt, "/placas", "");
        clock.advance(Duration::seconds(61));
        let window_start = clock.now() - Duration::seconds(60);
        log.record(SecurityEventKind::UnauthorizedAttempt, "/placas", "");
        log.record(SecurityEventKind::PageAccess, "/", "");

        assert_eq!(
            log.count_since(SecurityEventKind::UnauthorizedAttempt, window_start),
            1
        );
    }

    #[test]
    fn test_export_and_stats() {
        let (_, _, log) = log_with(EventLogLimits::default());
        log.record(SecurityEventKind::PageAccess, "/", "");
        log.record(SecurityEventKind::UnauthorizedAttempt, "/temario", "");

        let exported: Vec<SecurityEvent> = serde_json::from_str(&log.export().unwrap()).unwrap();
        assert_eq!(exported.len(), 2);

        let stats = log.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unauthorized_attempts, 1);
        assert_eq!(stats.last_cleanup, None);
    }

    #[test]
    fn test_clear_records_cleanup_time() {
        let (memory, _, log) = log_with(EventLogLimits::default());
        log.record(SecurityEventKind::PageAccess, "/", "");
        log.clear().unwrap();

        assert!(log.recent(10).is_empty());
        assert!(memory.get(SECURITY_LOG_KEY).unwrap().is_none());
        assert!(log.stats().last_cleanup.is_some());
    }

    #[test]
    fn test_detail_is_redacted() {
        let event = SecurityEvent::new(
            SecurityEventKind::SessionAnomaly,
            Utc::now(),
            "/edicion",
            "presented sess_0123456789abcdef with Bearer abc.def",
        );
        assert!(!event.detail.contains("0123456789abcdef"));
        assert!(event.detail.contains("sess_[REDACTED]"));
        assert!(event.detail.contains("Bearer [REDACTED]"));
    }

    #[test]
    fn test_log_line_format() {
        let event = SecurityEvent::new(
            SecurityEventKind::UnauthorizedAttempt,
            Utc::now(),
            "/placas",
            "no session",
        );
        let line = event.to_log_line();
        assert!(line.contains(" | UNAUTHORIZED_ATTEMPT | /placas | no session"));
    }
}
