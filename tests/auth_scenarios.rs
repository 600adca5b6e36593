// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! End-to-end auth flows over an in-memory store and a manual clock.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

use atlas_guard::directory::DirectoryError;
use atlas_guard::security::password::hash_password;
use atlas_guard::security::session_store::{SESSION_KEY, TIMESTAMP_KEY};
use atlas_guard::security::{AuthError, GuardDecision, RedirectReason, SessionSecret};
use atlas_guard::storage::{ContextId, StorageChange};
use atlas_guard::{
    AtlasConfig, AtlasContext, Clock, FileStore, KeyValueStore, ManualClock, MemoryStore,
    SecurityEventKind, StaticDirectory, StorageError, StoredUser, UserDirectory, UserError,
    UserRecord,
};

/// Static directory that counts how often it is asked.
struct CountingDirectory {
    inner: StaticDirectory,
    calls: AtomicUsize,
}

impl CountingDirectory {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserDirectory for CountingDirectory {
    async fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserRecord>, DirectoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.verify(username, password).await
    }
}

struct Harness {
    ctx: AtlasContext,
    memory: MemoryStore,
    clock: ManualClock,
    directory: Arc<CountingDirectory>,
}

fn start_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_740_819_600, 0).unwrap()
}

fn counting_directory() -> Arc<CountingDirectory> {
    Arc::new(CountingDirectory {
        inner: StaticDirectory::new(vec![StoredUser {
            id: "1".to_string(),
            username: "admin".to_string(),
            password_hash: hash_password("correct-pass").unwrap(),
        }]),
        calls: AtomicUsize::new(0),
    })
}

fn context_over(store: Arc<dyn KeyValueStore>, directory: Arc<dyn UserDirectory>) -> AtlasContext {
    let ctx = AtlasContext::with_parts(
        AtlasConfig::default(),
        store,
        Arc::new(ManualClock::new(start_time())),
        directory,
        SessionSecret::new(b"scenario-secret".to_vec()),
    );
    ctx.initialize();
    ctx
}

fn harness() -> Harness {
    let memory = MemoryStore::new();
    let clock = ManualClock::new(start_time());
    let directory = counting_directory();

    let ctx = AtlasContext::with_parts(
        AtlasConfig::default(),
        Arc::new(memory.clone()),
        Arc::new(clock.clone()),
        Arc::clone(&directory) as Arc<dyn UserDirectory>,
        SessionSecret::new(b"scenario-secret".to_vec()),
    );
    ctx.initialize();

    Harness {
        ctx,
        memory,
        clock,
        directory,
    }
}

fn count(ctx: &AtlasContext, kind: SecurityEventKind) -> usize {
    ctx.events
        .recent(usize::MAX)
        .iter()
        .filter(|e| e.kind == kind)
        .count()
}

#[tokio::test]
async fn test_login_then_protected_page_renders() {
    let h = harness();

    assert!(h.ctx.auth.login("admin", "correct-pass").await);
    assert!(h.ctx.auth.is_authenticated());

    let decision = h.ctx.guard.navigate("/edicion");
    assert_eq!(
        decision,
        GuardDecision::Allow {
            path: "/edicion".to_string()
        }
    );
    assert_eq!(h.ctx.guard.current_path(), "/edicion");
}

#[tokio::test]
async fn test_direct_navigation_without_login_redirects() {
    let h = harness();

    let decision = h.ctx.guard.navigate("/placas");
    match decision {
        GuardDecision::Redirect {
            to,
            reason,
            attempted_path,
            ..
        } => {
            assert_eq!(to, "/");
            assert_eq!(reason, RedirectReason::LoginRequired);
            assert_eq!(attempted_path, "/placas");
        }
        other => panic!("expected redirect, got {:?}", other),
    }

    let attempts: Vec<_> = h
        .ctx
        .events
        .recent(10)
        .into_iter()
        .filter(|e| e.kind == SecurityEventKind::UnauthorizedAttempt)
        .collect();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].path, "/placas");
    assert_eq!(h.ctx.guard.current_path(), "/");
}

#[tokio::test]
async fn test_lockout_rejects_correct_password_without_directory_call() {
    let h = harness();

    for _ in 0..5 {
        assert!(!h.ctx.auth.login("admin", "wrong-pass").await);
    }
    assert_eq!(h.directory.calls(), 5);

    let err = h
        .ctx
        .auth
        .try_login("admin", "correct-pass")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::LockedOut));
    assert_eq!(h.directory.calls(), 5);
    assert!(!h.ctx.auth.is_authenticated());
}

#[tokio::test]
async fn test_lockout_lifts_after_duration() {
    let h = harness();

    for _ in 0..5 {
        h.ctx.auth.login("admin", "wrong-pass").await;
    }
    h.clock.advance(Duration::minutes(14));
    assert!(!h.ctx.auth.login("admin", "correct-pass").await);

    h.clock.advance(Duration::minutes(1));
    assert!(h.ctx.auth.login("admin", "correct-pass").await);
    assert_eq!(h.ctx.auth.lockout().failed_attempts(), 0);
}

#[tokio::test]
async fn test_backdated_session_is_logged_out_with_anomaly() {
    let h = harness();
    assert!(h.ctx.auth.login("admin", "correct-pass").await);
    assert!(h.ctx.guard.navigate("/edicion").is_allow());

    let backdated = h.clock.now() - Duration::hours(9);
    h.memory
        .fork()
        .set(TIMESTAMP_KEY, &backdated.timestamp_millis().to_string())
        .unwrap();

    assert!(!h.ctx.check_auth_status());
    assert!(!h.ctx.auth.is_authenticated());
    assert_eq!(count(&h.ctx, SecurityEventKind::SessionAnomaly), 1);
    assert_eq!(h.ctx.guard.current_path(), "/");
}

#[tokio::test]
async fn test_repeated_unauthorized_attempts_escalate_once() {
    let h = harness();

    for path in ["/placas", "/edicion", "/temario"] {
        h.ctx.guard.navigate(path);
        h.clock.advance(Duration::seconds(10));
    }
    assert_eq!(count(&h.ctx, SecurityEventKind::UnauthorizedAttempt), 3);
    assert_eq!(count(&h.ctx, SecurityEventKind::SuspiciousActivity), 1);

    h.ctx.guard.navigate("/placas/7");
    assert_eq!(count(&h.ctx, SecurityEventKind::SuspiciousActivity), 1);
}

#[tokio::test]
async fn test_logout_then_protected_route_redirects() {
    let h = harness();
    assert!(h.ctx.auth.login("admin", "correct-pass").await);

    h.ctx.auth.logout();
    assert!(!h.ctx.check_auth_status());
    assert!(h.ctx.guard.evaluate("/temario").is_redirect());
}

#[tokio::test]
async fn test_session_valid_until_timeout_boundary() {
    let h = harness();
    assert!(h.ctx.auth.login("admin", "correct-pass").await);

    h.clock.advance(Duration::hours(8) - Duration::milliseconds(1));
    assert!(h.ctx.check_auth_status());

    h.clock.advance(Duration::milliseconds(1));
    assert!(!h.ctx.check_auth_status());
}

#[tokio::test]
async fn test_startup_adopts_stored_session_without_directory() {
    let h = harness();
    assert!(h.ctx.auth.login("admin", "correct-pass").await);
    let calls = h.directory.calls();

    let restarted = AtlasContext::with_parts(
        AtlasConfig::default(),
        Arc::new(h.memory.clone()),
        Arc::new(h.clock.clone()),
        Arc::clone(&h.directory) as Arc<dyn UserDirectory>,
        SessionSecret::new(b"scenario-secret".to_vec()),
    );
    assert!(restarted.auth.is_loading());
    assert!(matches!(
        restarted.guard.evaluate("/edicion"),
        GuardDecision::Pending { .. }
    ));

    restarted.initialize();
    assert!(restarted.auth.is_authenticated());
    assert_eq!(restarted.auth.current_user().unwrap().username, "admin");
    assert_eq!(h.directory.calls(), calls);
}

#[tokio::test]
async fn test_foreign_session_write_forces_logout() {
    let h = harness();
    assert!(h.ctx.auth.login("admin", "correct-pass").await);
    assert!(h.ctx.guard.navigate("/placas").is_allow());
    let tasks = h.ctx.start_background_tasks();

    let token = h.memory.get(SESSION_KEY).unwrap().unwrap();
    let mut flipped: Vec<char> = token.chars().collect();
    let last = flipped.len() - 1;
    flipped[last] = if flipped[last] == '0' { '1' } else { '0' };
    let flipped: String = flipped.into_iter().collect();
    h.memory.fork().set(SESSION_KEY, &flipped).unwrap();

    let mut waited = 0;
    while h.ctx.auth.is_authenticated() && waited < 200 {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        waited += 1;
    }

    assert!(!h.ctx.auth.is_authenticated());
    assert_eq!(count(&h.ctx, SecurityEventKind::SessionAnomaly), 1);
    assert_eq!(h.ctx.guard.current_path(), "/");
    tasks.shutdown().await;
}

#[tokio::test]
async fn test_navigation_burst_escalates_once_per_window() {
    let h = harness();

    for _ in 0..12 {
        assert!(h.ctx.guard.navigate("/home").is_allow());
        h.clock.advance(Duration::seconds(1));
    }
    assert_eq!(count(&h.ctx, SecurityEventKind::PageAccess), 12);
    assert_eq!(count(&h.ctx, SecurityEventKind::SuspiciousActivity), 1);

    h.clock.advance(Duration::seconds(61));
    for _ in 0..10 {
        h.ctx.guard.navigate("/home");
    }
    assert_eq!(count(&h.ctx, SecurityEventKind::SuspiciousActivity), 2);
}

#[tokio::test]
async fn test_corrupt_state_file_keeps_login_locked() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{not json").unwrap();
    let directory = counting_directory();
    let ctx = context_over(
        Arc::new(FileStore::open(&path).unwrap()),
        Arc::clone(&directory) as Arc<dyn UserDirectory>,
    );

    for password in ["wrong-pass", "wrong-pass", "correct-pass"] {
        let err = ctx.auth.try_login("admin", password).await.unwrap_err();
        assert!(matches!(err, AuthError::LockedOut));
    }
    assert_eq!(directory.calls(), 0);
    assert!(!ctx.auth.is_authenticated());
}

/// Memory store whose session token key refuses writes.
struct SessionWritesFail(MemoryStore);

impl KeyValueStore for SessionWritesFail {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.0.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if key == SESSION_KEY {
            return Err(StorageError::Unavailable("read-only".to_string()));
        }
        self.0.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.0.remove(key)
    }

    fn context_id(&self) -> ContextId {
        self.0.context_id()
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.0.subscribe()
    }
}

#[tokio::test]
async fn test_unstorable_session_looks_like_wrong_password() {
    let ctx = context_over(
        Arc::new(SessionWritesFail(MemoryStore::new())),
        counting_directory(),
    );

    let correct = ctx.auth.try_login("admin", "correct-pass").await.unwrap_err();
    let wrong = ctx.auth.try_login("admin", "wrong-pass").await.unwrap_err();
    assert!(matches!(correct, AuthError::StorageUnavailable));
    assert!(matches!(wrong, AuthError::CredentialMismatch));

    let correct = UserError::from(correct);
    let wrong = UserError::from(wrong);
    assert_eq!(correct.status_code(), wrong.status_code());
    assert_eq!(correct.message(), wrong.message());
    assert_eq!(ctx.auth.lockout().failed_attempts(), 2);
    assert!(!ctx.auth.is_authenticated());
}

/// Directory that holds every lookup until released.
struct GateDirectory {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl UserDirectory for GateDirectory {
    async fn verify(
        &self,
        username: &str,
        _password: &str,
    ) -> Result<Option<UserRecord>, DirectoryError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Some(UserRecord::new("1", username)))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_login_rejected_while_first_in_flight() {
    let directory = Arc::new(GateDirectory {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let ctx = Arc::new(context_over(
        Arc::new(MemoryStore::new()),
        Arc::clone(&directory) as Arc<dyn UserDirectory>,
    ));

    let first = {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move { ctx.auth.try_login("admin", "correct-pass").await })
    };
    directory.entered.notified().await;
    assert!(ctx.auth.login_in_progress());

    let second = ctx.auth.try_login("admin", "correct-pass").await;
    assert!(matches!(second, Err(AuthError::LoginInFlight)));

    directory.release.notify_one();
    assert!(first.await.unwrap().is_ok());
    assert!(!ctx.auth.login_in_progress());
    assert!(ctx.auth.is_authenticated());
    assert_eq!(ctx.auth.lockout().failed_attempts(), 0);
}
