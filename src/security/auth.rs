// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Authenticator
//!
//! Owns the authentication state machine:
//!
//! ```text
//!   Authenticating --initialize()--> Authenticated | Unauthenticated
//!   Unauthenticated --login() ok--> Authenticated
//!   Authenticated --logout() / failed check--> Unauthenticated
//! ```
//!
//! The state lives in a `watch` channel so pages, the route guard and the
//! HTTP layer observe transitions without polling. Only one login may be in
//! flight at a time; a second attempt is rejected with
//! [`AuthError::LoginInFlight`] rather than queued.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::directory::{UserDirectory, UserRecord};
use crate::security::lockout::LockoutTracker;
use crate::security::locks::{resilient_read, resilient_write};
use crate::security::session_store::{SessionRecord, SessionStore, SessionVerdict};

pub const DEFAULT_MIN_USERNAME_LEN: usize = 3;
pub const DEFAULT_MIN_PASSWORD_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unauthenticated,
    /// Startup check still pending.
    Authenticating,
    Authenticated,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthState::Unauthenticated => write!(f, "UNAUTHENTICATED"),
            AuthState::Authenticating => write!(f, "AUTHENTICATING"),
            AuthState::Authenticated => write!(f, "AUTHENTICATED"),
        }
    }
}

/// Shape rules applied before the directory is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialPolicy {
    pub min_username_len: usize,
    pub min_password_len: usize,
    /// Malformed input counts as a failed attempt.
    pub count_invalid_input: bool,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            min_username_len: DEFAULT_MIN_USERNAME_LEN,
            min_password_len: DEFAULT_MIN_PASSWORD_LEN,
            count_invalid_input: true,
        }
    }
}

impl CredentialPolicy {
    fn accepts(&self, username: &str, password: &str) -> bool {
        let username = username.trim();
        !username.is_empty()
            && !password.is_empty()
            && username.chars().count() >= self.min_username_len
            && password.chars().count() >= self.min_password_len
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credentials are empty or malformed")]
    InputInvalid,

    #[error("login temporarily locked")]
    LockedOut,

    #[error("credentials did not match")]
    CredentialMismatch,

    #[error("user directory unavailable")]
    CollaboratorUnavailable,

    #[error("session invalid ({0})")]
    SessionInvalid(SessionVerdict),

    #[error("session storage unavailable")]
    StorageUnavailable,

    #[error("another login is already in progress")]
    LoginInFlight,
}

impl AuthError {
    /// Message safe to show to the person at the login form. Never says
    /// whether the username exists or how long a lockout lasts.
    pub fn user_message(&self) -> &'static str {
        match self {
            AuthError::InputInvalid => "Please enter a valid username and password.",
            AuthError::LockedOut => "Too many failed attempts. Please try again later.",
            AuthError::CredentialMismatch
            | AuthError::CollaboratorUnavailable
            | AuthError::StorageUnavailable => "Incorrect username or password.",
            AuthError::SessionInvalid(_) => "Your session has ended. Please sign in again.",
            AuthError::LoginInFlight => "A sign-in is already in progress.",
        }
    }
}

/// Releases the in-flight flag on every exit path.
struct LoginGuard<'a>(&'a AtomicBool);

impl<'a> LoginGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LoginGuard(flag))
    }
}

impl Drop for LoginGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Authenticator {
    sessions: SessionStore,
    lockout: LockoutTracker,
    directory: Arc<dyn UserDirectory>,
    clock: Arc<dyn Clock>,
    fingerprint: String,
    policy: CredentialPolicy,
    state: watch::Sender<AuthState>,
    user: RwLock<Option<UserRecord>>,
    login_in_flight: AtomicBool,
}

impl Authenticator {
    pub fn new(
        sessions: SessionStore,
        lockout: LockoutTracker,
        directory: Arc<dyn UserDirectory>,
        clock: Arc<dyn Clock>,
        fingerprint: impl Into<String>,
        policy: CredentialPolicy,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::Authenticating);
        Self {
            sessions,
            lockout,
            directory,
            clock,
            fingerprint: fingerprint.into(),
            policy,
            state,
            user: RwLock::new(None),
            login_in_flight: AtomicBool::new(false),
        }
    }

    /// Resolve the startup state from storage. A valid stored session is
    /// adopted without contacting the directory; anything else is cleared.
    pub fn initialize(&self) -> AuthState {
        let verdict = self.sessions.verdict(self.clock.now(), &self.fingerprint);
        let state = if self.adopt_if_valid(verdict) {
            AuthState::Authenticated
        } else {
            if verdict != SessionVerdict::Absent {
                tracing::info!(
                    target: "atlas::security",
                    event = "STALE_SESSION_CLEARED",
                    verdict = %verdict,
                    "Discarding stored session at startup"
                );
            }
            self.clear_stored();
            self.set_user(None);
            AuthState::Unauthenticated
        };
        self.state.send_replace(state);
        state
    }

    /// Validate credentials and issue a session.
    pub async fn try_login(&self, username: &str, password: &str) -> Result<SessionRecord, AuthError> {
        let Some(_in_flight) = LoginGuard::acquire(&self.login_in_flight) else {
            tracing::warn!(
                target: "atlas::security",
                event = "LOGIN_REJECTED_IN_FLIGHT",
                "Concurrent login attempt rejected"
            );
            return Err(AuthError::LoginInFlight);
        };

        let now = self.clock.now();
        if self.lockout.is_locked(now) {
            tracing::warn!(
                target: "atlas::security",
                event = "LOGIN_REJECTED_LOCKED",
                "Login refused during lockout"
            );
            return Err(AuthError::LockedOut);
        }

        if !self.policy.accepts(username, password) {
            if self.policy.count_invalid_input {
                self.lockout.record_failure(now);
            }
            return Err(AuthError::InputInvalid);
        }

        let normalized = username.trim().to_lowercase();
        tracing::info!(
            target: "atlas::security",
            event = "LOGIN_ATTEMPT",
            user = %normalized,
            "Login attempt"
        );

        let found = match self.directory.verify(&normalized, password).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(
                    target: "atlas::security",
                    event = "DIRECTORY_ERROR",
                    user = %normalized,
                    error = %e,
                    "User directory failed during login"
                );
                self.lockout.record_failure(self.clock.now());
                return Err(AuthError::CollaboratorUnavailable);
            }
        };

        let Some(user) = found else {
            tracing::warn!(
                target: "atlas::security",
                event = "LOGIN_FAILED",
                user = %normalized,
                "Credentials did not match"
            );
            self.lockout.record_failure(self.clock.now());
            return Err(AuthError::CredentialMismatch);
        };

        // A session that cannot be stored fails exactly like a mismatch.
        let record = match self.sessions.create(&user, &self.fingerprint, self.clock.now()) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    target: "atlas::security",
                    event = "SESSION_WRITE_FAILED",
                    user = %normalized,
                    error = %e,
                    "Could not persist session"
                );
                self.lockout.record_failure(self.clock.now());
                return Err(AuthError::StorageUnavailable);
            }
        };
        self.lockout.record_success();

        self.set_user(Some(user));
        self.state.send_replace(AuthState::Authenticated);
        Ok(record)
    }

    pub async fn login(&self, username: &str, password: &str) -> bool {
        self.try_login(username, password).await.is_ok()
    }

    pub fn logout(&self) {
        self.clear_stored();
        self.set_user(None);
        let previous = self.state.send_replace(AuthState::Unauthenticated);
        if previous == AuthState::Authenticated {
            tracing::info!(
                target: "atlas::security",
                event = "SESSION_TERMINATED",
                "Logged out"
            );
        }
    }

    /// Check the stored session now. A failing check clears it and drops an
    /// authenticated state to unauthenticated.
    pub fn check_session(&self) -> SessionVerdict {
        let verdict = self.sessions.verdict(self.clock.now(), &self.fingerprint);
        if !verdict.is_valid() {
            if verdict != SessionVerdict::Absent {
                self.clear_stored();
            }
            if self.state() == AuthState::Authenticated {
                tracing::warn!(
                    target: "atlas::security",
                    event = "SESSION_INVALIDATED",
                    verdict = %verdict,
                    "Session failed validation"
                );
                self.set_user(None);
                self.state.send_replace(AuthState::Unauthenticated);
            }
        }
        verdict
    }

    pub fn check_auth_status(&self) -> bool {
        self.check_session().is_valid()
    }

    /// Background revalidation. Returns the failing verdict when an
    /// authenticated session had to be logged out.
    pub fn revalidate(&self) -> Option<SessionVerdict> {
        if self.state() != AuthState::Authenticated {
            return None;
        }
        let verdict = self.sessions.verdict(self.clock.now(), &self.fingerprint);
        if verdict.is_valid() {
            return None;
        }
        tracing::warn!(
            target: "atlas::security",
            event = "SESSION_REVALIDATION_FAILED",
            verdict = %verdict,
            "Forcing logout"
        );
        self.logout();
        Some(verdict)
    }

    /// Re-derive state after another context changed the session keys.
    pub fn resync(&self) -> AuthState {
        let verdict = self.sessions.verdict(self.clock.now(), &self.fingerprint);
        if self.adopt_if_valid(verdict) {
            self.state.send_replace(AuthState::Authenticated);
            return AuthState::Authenticated;
        }
        match self.state() {
            AuthState::Authenticated => self.logout(),
            AuthState::Authenticating => {
                self.state.send_replace(AuthState::Unauthenticated);
            }
            AuthState::Unauthenticated => {}
        }
        AuthState::Unauthenticated
    }

    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == AuthState::Authenticated
    }

    pub fn is_loading(&self) -> bool {
        self.state() == AuthState::Authenticating
    }

    pub fn login_in_progress(&self) -> bool {
        self.login_in_flight.load(Ordering::Acquire)
    }

    pub fn current_user(&self) -> Option<UserRecord> {
        resilient_read(&self.user).clone()
    }

    /// Whether `token` is the token of the stored session.
    pub fn holds_token(&self, token: &str) -> bool {
        self.sessions.holds_token(token)
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn lockout(&self) -> &LockoutTracker {
        &self.lockout
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn adopt_if_valid(&self, verdict: SessionVerdict) -> bool {
        if !verdict.is_valid() {
            return false;
        }
        match self.sessions.load() {
            Ok(Some(record)) => {
                self.set_user(Some(record.user));
                true
            }
            _ => false,
        }
    }

    fn set_user(&self, user: Option<UserRecord>) {
        *resilient_write(&self.user) = user;
    }

    fn clear_stored(&self) {
        if let Err(e) = self.sessions.clear() {
            tracing::warn!(
                target: "atlas::security",
                error = %e,
                "Failed to clear session storage"
            );
        }
    }
}
