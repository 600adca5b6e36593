// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Session Store
//!
//! Persists the single session record under four fixed keys and decides
//! whether it is still valid.
//!
//! ## Record layout
//!
//! | key                       | value                                   |
//! |---------------------------|-----------------------------------------|
//! | `atlas_auth_session`      | `sess_` + 64 hex chars (256 random bits)|
//! | `atlas_auth_timestamp`    | creation time, Unix milliseconds        |
//! | `atlas_auth_user`         | `{"id":..,"username":..}`               |
//! | `atlas_session_integrity` | hex HMAC-SHA256 integrity tag           |
//!
//! The integrity tag covers the token, the timestamp text, the user JSON and
//! the client fingerprint, keyed by a server-side secret. It is recomputed on every
//! check, so editing any of those values (or replaying the record on another
//! client) makes the session invalid.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::directory::UserRecord;
use crate::storage::{KeyValueStore, StorageError};

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_KEY: &str = "atlas_auth_session";
pub const TIMESTAMP_KEY: &str = "atlas_auth_timestamp";
pub const USER_KEY: &str = "atlas_auth_user";
pub const INTEGRITY_KEY: &str = "atlas_session_integrity";

/// Every key that makes up the session record.
pub const SESSION_KEYS: [&str; 4] = [SESSION_KEY, TIMESTAMP_KEY, USER_KEY, INTEGRITY_KEY];

/// Default absolute session lifetime: 8 hours.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 8 * 60 * 60;

const TOKEN_PREFIX: &str = "sess_";
const TOKEN_BYTES: usize = 32;

/// True for keys owned by the session record.
pub fn is_session_key(key: &str) -> bool {
    SESSION_KEYS.contains(&key)
}

/// HMAC key for session integrity tags. Never printed.
#[derive(Clone)]
pub struct SessionSecret(Arc<Vec<u8>>);

impl SessionSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::new(bytes.into()))
    }

    /// 32 fresh bytes from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionSecret([REDACTED])")
    }
}

/// A loaded session record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub integrity_tag: String,
    pub user: UserRecord,
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("token", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .field("user", &self.user)
            .finish()
    }
}

/// Outcome of a validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionVerdict {
    Valid,
    Absent,
    Expired,
    Tampered,
    StorageUnavailable,
}

impl SessionVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, SessionVerdict::Valid)
    }
}

impl fmt::Display for SessionVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionVerdict::Valid => "VALID",
            SessionVerdict::Absent => "ABSENT",
            SessionVerdict::Expired => "EXPIRED",
            SessionVerdict::Tampered => "TAMPERED",
            SessionVerdict::StorageUnavailable => "STORAGE_UNAVAILABLE",
        };
        write!(f, "{}", s)
    }
}

/// Raw stored strings, before any parsing.
struct StoredSession {
    token: String,
    timestamp: String,
    user: String,
    tag: String,
}

pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    secret: SessionSecret,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>, secret: SessionSecret, timeout: Duration) -> Self {
        Self {
            store,
            secret,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issue a new session for `user`, replacing any existing one.
    pub fn create(
        &self,
        user: &UserRecord,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionRecord, StorageError> {
        let token = generate_token();
        let timestamp = now.timestamp_millis().to_string();
        let user_json =
            serde_json::to_string(user).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let integrity_tag = self.compute_tag(&token, &timestamp, &user_json, fingerprint);

        let written = self
            .store
            .set(TIMESTAMP_KEY, &timestamp)
            .and_then(|_| self.store.set(USER_KEY, &user_json))
            .and_then(|_| self.store.set(INTEGRITY_KEY, &integrity_tag))
            .and_then(|_| self.store.set(SESSION_KEY, &token));

        if let Err(e) = written {
            // A half-written record must not linger.
            let _ = self.clear();
            return Err(e);
        }

        tracing::info!(
            target: "atlas::security",
            event = "SESSION_CREATED",
            user = %user.username,
            "Session issued"
        );

        let created_at = DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis())
            .unwrap_or(now);

        Ok(SessionRecord {
            token,
            created_at,
            integrity_tag,
            user: user.clone(),
        })
    }

    /// The stored record, or `None` when any part is missing or unparseable.
    /// Does not check validity.
    pub fn load(&self) -> Result<Option<SessionRecord>, StorageError> {
        let Some(raw) = self.read_raw()? else {
            return Ok(None);
        };
        Ok(parse_record(raw))
    }

    pub fn is_valid(&self, now: DateTime<Utc>, fingerprint: &str) -> bool {
        self.verdict(now, fingerprint).is_valid()
    }

    /// Classify the stored session. Integrity is checked before expiry.
    pub fn verdict(&self, now: DateTime<Utc>, fingerprint: &str) -> SessionVerdict {
        let raw = match self.read_raw() {
            Ok(Some(raw)) => raw,
            Ok(None) => return SessionVerdict::Absent,
            Err(e) => {
                tracing::warn!(
                    target: "atlas::security",
                    event = "SESSION_STORAGE_ERROR",
                    error = %e,
                    "Session storage unreadable; treating as logged out"
                );
                return SessionVerdict::StorageUnavailable;
            }
        };

        if !self.verify_tag(&raw.token, &raw.timestamp, &raw.user, fingerprint, &raw.tag) {
            return SessionVerdict::Tampered;
        }

        let Some(record) = parse_record(raw) else {
            return SessionVerdict::Tampered;
        };

        // A creation time in the future still satisfies elapsed < timeout.
        if now.signed_duration_since(record.created_at) < self.timeout {
            SessionVerdict::Valid
        } else {
            SessionVerdict::Expired
        }
    }

    /// Remove every session key. Safe to call when nothing is stored.
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut first_error = None;
        for key in SESSION_KEYS {
            if let Err(e) = self.store.remove(key) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Constant-time comparison of a presented token with the stored one.
    pub fn holds_token(&self, presented: &str) -> bool {
        match self.store.get(SESSION_KEY) {
            Ok(Some(stored)) => stored.as_bytes().ct_eq(presented.as_bytes()).into(),
            _ => false,
        }
    }

    fn read_raw(&self) -> Result<Option<StoredSession>, StorageError> {
        let token = self.store.get(SESSION_KEY)?;
        let timestamp = self.store.get(TIMESTAMP_KEY)?;
        let user = self.store.get(USER_KEY)?;
        let tag = self.store.get(INTEGRITY_KEY)?;

        match (token, timestamp, user, tag) {
            (Some(token), Some(timestamp), Some(user), Some(tag)) => Ok(Some(StoredSession {
                token,
                timestamp,
                user,
                tag,
            })),
            _ => Ok(None),
        }
    }

    fn mac(&self, token: &str, timestamp: &str, user: &str, fingerprint: &str) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).ok()?;
        for (i, part) in [token, timestamp, user, fingerprint].into_iter().enumerate() {
            if i > 0 {
                mac.update(b"\n");
            }
            mac.update(part.as_bytes());
        }
        Some(mac)
    }

    fn compute_tag(&self, token: &str, timestamp: &str, user: &str, fingerprint: &str) -> String {
        self.mac(token, timestamp, user, fingerprint)
            .map(|mac| hex::encode(mac.finalize().into_bytes()))
            .unwrap_or_default()
    }

    fn verify_tag(
        &self,
        token: &str,
        timestamp: &str,
        user: &str,
        fingerprint: &str,
        tag: &str,
    ) -> bool {
        let Ok(expected) = hex::decode(tag) else {
            return false;
        };
        match self.mac(token, timestamp, user, fingerprint) {
            Some(mac) => mac.verify_slice(&expected).is_ok(),
            None => false,
        }
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("{}{}", TOKEN_PREFIX, hex::encode(bytes))
}

fn parse_record(raw: StoredSession) -> Option<SessionRecord> {
    let millis: i64 = raw.timestamp.parse().ok()?;
    let created_at = DateTime::<Utc>::from_timestamp_millis(millis)?;
    let user: UserRecord = serde_json::from_str(&raw.user).ok()?;
    Some(SessionRecord {
        token: raw.token,
        created_at,
        integrity_tag: raw.tag,
        user,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    const FP: &str = "lab-workstation-01";

    fn admin() -> UserRecord {
        UserRecord::new("1", "admin")
    }

    fn setup() -> (MemoryStore, SessionStore) {
        let memory = MemoryStore::new();
        let store = SessionStore::new(
            Arc::new(memory.clone()),
            SessionSecret::new(b"test-secret".to_vec()),
            Duration::hours(8),
        );
        (memory, store)
    }

    fn start() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_create_then_load_is_valid_at_creation() {
        let (_, store) = setup();
        let created = store.create(&admin(), FP, start()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, created);
        assert!(store.is_valid(loaded.created_at, FP));
    }

    #[test]
    fn test_token_shape() {
        let (_, store) = setup();
        let record = store.create(&admin(), FP, start()).unwrap();
        assert!(record.token.starts_with("sess_"));
        assert_eq!(record.token.len(), 5 + 64);

        let other = store.create(&admin(), FP, start()).unwrap();
        assert_ne!(record.token, other.token);
    }

    #[test]
    fn test_expiry_boundary() {
        let (_, store) = setup();
        store.create(&admin(), FP, start()).unwrap();

        let just_before = start() + Duration::hours(8) - Duration::milliseconds(1);
        assert_eq!(store.verdict(just_before, FP), SessionVerdict::Valid);
        assert_eq!(
            store.verdict(start() + Duration::hours(8), FP),
            SessionVerdict::Expired
        );
        assert!(!store.is_valid(start() + Duration::hours(9), FP));
    }

    #[test]
    fn test_absent_when_any_key_missing() {
        for key in SESSION_KEYS {
            let (memory, store) = setup();
            store.create(&admin(), FP, start()).unwrap();
            memory.remove(key).unwrap();
            assert!(store.load().unwrap().is_none());
            assert_eq!(store.verdict(start(), FP), SessionVerdict::Absent);
        }
    }

    #[test]
    fn test_single_character_flip_is_tampering() {
        let (memory, store) = setup();
        store.create(&admin(), FP, start()).unwrap();
        let token = memory.get(SESSION_KEY).unwrap().unwrap();
        let timestamp = memory.get(TIMESTAMP_KEY).unwrap().unwrap();

        for (key, original) in [(SESSION_KEY, &token), (TIMESTAMP_KEY, &timestamp)] {
            for i in 0..original.len() {
                let mut chars: Vec<char> = original.chars().collect();
                chars[i] = if chars[i] == '1' { '2' } else { '1' };
                let flipped: String = chars.into_iter().collect();

                memory.set(key, &flipped).unwrap();
                assert!(
                    !store.is_valid(start(), FP),
                    "flip at {} of {} went unnoticed",
                    i,
                    key
                );
            }
            memory.set(key, original).unwrap();
            assert!(store.is_valid(start(), FP));
        }
    }

    #[test]
    fn test_swapped_user_is_tampering() {
        let (memory, store) = setup();
        store.create(&admin(), FP, start()).unwrap();
        let other = serde_json::to_string(&UserRecord::new("2", "intruso")).unwrap();
        memory.set(USER_KEY, &other).unwrap();

        assert_eq!(store.verdict(start(), FP), SessionVerdict::Tampered);
    }

    #[test]
    fn test_backdated_timestamp_is_rejected() {
        let (memory, store) = setup();
        store.create(&admin(), FP, start()).unwrap();
        let backdated = (start() - Duration::hours(9)).timestamp_millis().to_string();
        memory.set(TIMESTAMP_KEY, &backdated).unwrap();
        assert!(!store.is_valid(start(), FP));
    }

    #[test]
    fn test_other_fingerprint_is_rejected() {
        let (_, store) = setup();
        store.create(&admin(), FP, start()).unwrap();
        assert_eq!(store.verdict(start(), "other-host"), SessionVerdict::Tampered);
    }

    #[test]
    fn test_other_secret_is_rejected() {
        let (memory, store) = setup();
        store.create(&admin(), FP, start()).unwrap();
        let rotated = SessionStore::new(
            Arc::new(memory),
            SessionSecret::new(b"rotated".to_vec()),
            Duration::hours(8),
        );
        assert!(!rotated.is_valid(start(), FP));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (memory, store) = setup();
        store.create(&admin(), FP, start()).unwrap();

        store.clear().unwrap();
        assert!(memory.is_empty());
        store.clear().unwrap();
        assert!(memory.is_empty());
        assert_eq!(store.verdict(start(), FP), SessionVerdict::Absent);
    }

    #[test]
    fn test_storage_failure_fails_closed() {
        let (memory, store) = setup();
        store.create(&admin(), FP, start()).unwrap();
        memory.set_unavailable(true);
        assert_eq!(store.verdict(start(), FP), SessionVerdict::StorageUnavailable);
        assert!(!store.holds_token("anything"));
    }

    #[test]
    fn test_holds_token() {
        let (_, store) = setup();
        let record = store.create(&admin(), FP, start()).unwrap();
        assert!(store.holds_token(&record.token));
        assert!(!store.holds_token("sess_00"));
        assert!(!store.holds_token(""));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let (_, store) = setup();
        let record = store.create(&admin(), FP, start()).unwrap();
        assert!(!format!("{:?}", record).contains(&record.token));
        assert_eq!(
            format!("{:?}", SessionSecret::new(b"xyz".to_vec())),
            "SessionSecret([REDACTED])"
        );
    }

    #[test]
    fn test_is_session_key() {
        assert!(is_session_key("atlas_session_integrity"));
        assert!(!is_session_key("atlas_failed_attempts"));
    }
}
