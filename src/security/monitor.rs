// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Background security tasks.
//!
//! Four recurring jobs keep the auth state honest without user interaction:
//!
//! - session revalidation (default every 5 minutes)
//! - guard tick on the current location (default every 30 seconds)
//! - security log pruning (default daily, first run at startup)
//! - storage watcher reacting to session keys changed by other contexts
//!
//! All of them are owned by a [`BackgroundTasks`] set that aborts every task
//! when dropped.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use crate::clock::Clock;
use crate::security::auth::Authenticator;
use crate::security::event_log::{SecurityEventKind, SecurityEventLog};
use crate::security::guard::{RedirectReason, RouteGuard};
use crate::storage::StorageChange;

/// Scoped set of spawned tasks. Dropping it cancels them all.
#[derive(Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every task and wait for them to finish unwinding.
    pub async fn shutdown(mut self) {
        let handles = std::mem::take(&mut self.handles);
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        tracing::debug!(target: "atlas::monitor", "Background tasks stopped");
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn delayed_interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Periodically re-check the session; a failure forces logout and records a
/// `session_anomaly` against the current location.
pub fn spawn_revalidation(
    auth: Arc<Authenticator>,
    guard: Arc<RouteGuard>,
    events: Arc<SecurityEventLog>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = delayed_interval(period);
        loop {
            ticker.tick().await;
            if let Some(verdict) = auth.revalidate() {
                events.record(
                    SecurityEventKind::SessionAnomaly,
                    &guard.current_path(),
                    format!("background revalidation failed: {}", verdict),
                );
                guard.retreat(RedirectReason::SessionInvalid);
            }
        }
    })
}

/// Re-enforce the guard on the current location.
pub fn spawn_guard_tick(guard: Arc<RouteGuard>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = delayed_interval(period);
        loop {
            ticker.tick().await;
            guard.enforce_current();
        }
    })
}

/// Prune the security log now and then every `period`.
pub fn spawn_log_pruning(
    events: Arc<SecurityEventLog>,
    clock: Arc<dyn Clock>,
    period: Duration,
    max_age: ChronoDuration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            events.prune(clock.now(), max_age);
        }
    })
}

/// Forward storage changes to the guard. Changes already queued are folded
/// into one reaction so a foreign login (four key writes) yields a single
/// anomaly.
pub fn spawn_storage_watcher(
    mut changes: broadcast::Receiver<StorageChange>,
    guard: Arc<RouteGuard>,
    auth: Arc<Authenticator>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let first = match changes.recv().await {
                Ok(change) => change,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target: "atlas::monitor",
                        skipped = skipped,
                        "Storage notifications dropped; re-deriving auth state"
                    );
                    auth.resync();
                    guard.enforce_current();
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let mut relevant = relevant_change(&first, &guard);
            while let Ok(next) = changes.try_recv() {
                if relevant.is_none() {
                    relevant = relevant_change(&next, &guard);
                }
            }

            if let Some(change) = relevant {
                guard.on_storage_change(&change);
            }
        }
    })
}

fn relevant_change(change: &StorageChange, guard: &RouteGuard) -> Option<StorageChange> {
    guard
        .is_foreign_session_change(change)
        .then(|| change.clone())
}
