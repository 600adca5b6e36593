// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Route Guard
//!
//! Decides, per navigation and on a periodic tick, whether the current path
//! may render.
//!
//! | path      | auth state        | session check | outcome                                  |
//! |-----------|-------------------|---------------|------------------------------------------|
//! | any       | authenticating    | -             | `Pending`, no event                      |
//! | protected | not authenticated | -             | `unauthorized_attempt`, redirect         |
//! | protected | authenticated     | fails         | `session_anomaly`, logout, redirect      |
//! | protected | authenticated     | passes        | `page_access`, allow                     |
//! | public    | any               | -             | `page_access`, allow                     |
//!
//! Escalation: repeated unauthorized attempts (or a burst of navigation)
//! inside the rolling window produce a single `suspicious_activity` event per
//! window.
//!
//! The current location lives in a `watch` channel. Every decision re-reads
//! it, so a decision computed for a path the user already left is never
//! applied to the new one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::clock::Clock;
use crate::security::auth::{AuthState, Authenticator};
use crate::security::event_log::{SecurityEventKind, SecurityEventLog};
use crate::security::locks::resilient_lock;
use crate::security::routes::RouteTable;
use crate::security::session_store::is_session_key;
use crate::storage::{ContextId, StorageChange};

pub const DEFAULT_SUSPICION_WINDOW_SECS: i64 = 60;
pub const DEFAULT_UNAUTHORIZED_THRESHOLD: usize = 3;
pub const DEFAULT_NAVIGATION_THRESHOLD: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspicionPolicy {
    pub window: Duration,
    pub unauthorized_threshold: usize,
    pub navigation_threshold: usize,
}

impl Default for SuspicionPolicy {
    fn default() -> Self {
        Self {
            window: Duration::seconds(DEFAULT_SUSPICION_WINDOW_SECS),
            unauthorized_threshold: DEFAULT_UNAUTHORIZED_THRESHOLD,
            navigation_threshold: DEFAULT_NAVIGATION_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectReason {
    LoginRequired,
    SessionInvalid,
}

impl RedirectReason {
    pub fn message(&self) -> &'static str {
        match self {
            RedirectReason::LoginRequired => "Please sign in to access this page.",
            RedirectReason::SessionInvalid => "Your session has ended. Please sign in again.",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectReason::LoginRequired => "login_required",
            RedirectReason::SessionInvalid => "session_invalid",
        }
    }
}

impl fmt::Display for RedirectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GuardDecision {
    Allow {
        path: String,
    },
    Redirect {
        to: String,
        reason: RedirectReason,
        message: String,
        attempted_path: String,
    },
    /// Startup session check still running; render a neutral loading state.
    Pending {
        path: String,
    },
}

impl GuardDecision {
    pub fn is_allow(&self) -> bool {
        matches!(self, GuardDecision::Allow { .. })
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, GuardDecision::Redirect { .. })
    }
}

/// Whose credentials a decision is made for.
#[derive(Debug, Clone, Copy)]
enum Caller<'a> {
    /// The context that owns the authenticator.
    Owner,
    /// An HTTP request, trusted only if it presents the session token.
    Request(Option<&'a str>),
}

#[derive(Debug, Default)]
struct Escalation {
    last_unauthorized_alert: Option<DateTime<Utc>>,
    last_navigation_alert: Option<DateTime<Utc>>,
}

pub struct RouteGuard {
    auth: Arc<Authenticator>,
    events: Arc<SecurityEventLog>,
    clock: Arc<dyn Clock>,
    routes: RouteTable,
    policy: SuspicionPolicy,
    own_context: ContextId,
    location: watch::Sender<String>,
    escalation: Mutex<Escalation>,
}

impl RouteGuard {
    pub fn new(
        auth: Arc<Authenticator>,
        events: Arc<SecurityEventLog>,
        clock: Arc<dyn Clock>,
        routes: RouteTable,
        policy: SuspicionPolicy,
        own_context: ContextId,
    ) -> Self {
        let (location, _) = watch::channel(routes.landing().to_string());
        Self {
            auth,
            events,
            clock,
            routes,
            policy,
            own_context,
            location,
            escalation: Mutex::new(Escalation::default()),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn current_path(&self) -> String {
        self.location.borrow().clone()
    }

    pub fn subscribe_location(&self) -> watch::Receiver<String> {
        self.location.subscribe()
    }

    /// Move to `path` and decide whether it renders. A redirect moves the
    /// location to the landing route.
    pub fn navigate(&self, path: &str) -> GuardDecision {
        self.location.send_replace(path.to_string());
        let current = self.current_path();
        let decision = self.decide(&current, Caller::Owner, true);
        self.apply(&current, &decision);
        decision
    }

    /// Decide for `path` without moving the location.
    pub fn evaluate(&self, path: &str) -> GuardDecision {
        self.decide(path, Caller::Owner, true)
    }

    /// Decide for an HTTP request. The owner's authenticated state only
    /// counts when the request presents the stored session token.
    pub fn evaluate_request(&self, path: &str, presented_token: Option<&str>) -> GuardDecision {
        self.decide(path, Caller::Request(presented_token), true)
    }

    /// Periodic re-check of the current location. Emits no `page_access`.
    pub fn enforce_current(&self) -> GuardDecision {
        let current = self.current_path();
        let decision = self.decide(&current, Caller::Owner, false);
        self.apply(&current, &decision);
        decision
    }

    /// React to a storage change. Session keys written by another context
    /// are untrusted: log an anomaly, re-derive auth state and re-enforce.
    pub fn on_storage_change(&self, change: &StorageChange) -> Option<GuardDecision> {
        if !self.is_foreign_session_change(change) {
            return None;
        }

        let current = self.current_path();
        self.events.record(
            SecurityEventKind::SessionAnomaly,
            &current,
            format!("session key {} changed by another context", change.key),
        );
        let state = self.auth.resync();
        tracing::warn!(
            target: "atlas::security",
            event = "EXTERNAL_SESSION_CHANGE",
            key = %change.key,
            state = %state,
            "Session storage modified externally"
        );
        let decision = match state {
            AuthState::Authenticated => self.enforce_current(),
            _ => self
                .retreat(RedirectReason::SessionInvalid)
                .unwrap_or(GuardDecision::Allow { path: current }),
        };
        Some(decision)
    }

    /// Leave a protected location after the session ended elsewhere (forced
    /// logout, external change). Records no further event.
    pub fn retreat(&self, reason: RedirectReason) -> Option<GuardDecision> {
        let current = self.current_path();
        if !self.routes.is_protected(&current) {
            return None;
        }
        let decision = self.redirect(&current, reason);
        self.apply(&current, &decision);
        Some(decision)
    }

    /// A session key written through a handle other than ours.
    pub fn is_foreign_session_change(&self, change: &StorageChange) -> bool {
        is_session_key(&change.key) && change.is_foreign(self.own_context)
    }

    fn decide(&self, path: &str, caller: Caller<'_>, emit_access: bool) -> GuardDecision {
        if self.auth.is_loading() {
            return GuardDecision::Pending {
                path: path.to_string(),
            };
        }

        if self.routes.is_protected(path) {
            let authenticated = match caller {
                Caller::Owner => self.auth.is_authenticated(),
                Caller::Request(token) => {
                    self.auth.is_authenticated()
                        && token.is_some_and(|t| self.auth.holds_token(t))
                }
            };

            if !authenticated {
                self.events.record(
                    SecurityEventKind::UnauthorizedAttempt,
                    path,
                    "protected route without a session",
                );
                self.escalate_unauthorized();
                return self.redirect(path, RedirectReason::LoginRequired);
            }

            let verdict = self.auth.check_session();
            if !verdict.is_valid() {
                self.events.record(
                    SecurityEventKind::SessionAnomaly,
                    path,
                    format!("session check failed: {}", verdict),
                );
                self.auth.logout();
                return self.redirect(path, RedirectReason::SessionInvalid);
            }
        }

        if emit_access {
            self.events.record(SecurityEventKind::PageAccess, path, "");
            self.escalate_navigation();
        }
        GuardDecision::Allow {
            path: path.to_string(),
        }
    }

    fn redirect(&self, path: &str, reason: RedirectReason) -> GuardDecision {
        tracing::info!(
            target: "atlas::security",
            event = "ROUTE_REDIRECT",
            path = %path,
            reason = %reason,
            "Redirecting to landing route"
        );
        GuardDecision::Redirect {
            to: self.routes.landing().to_string(),
            reason,
            message: reason.message().to_string(),
            attempted_path: path.to_string(),
        }
    }

    /// Land on the landing route, unless the location moved on meanwhile.
    fn apply(&self, decided_for: &str, decision: &GuardDecision) {
        if let GuardDecision::Redirect { to, .. } = decision {
            self.location.send_if_modified(|location| {
                if location == decided_for {
                    *location = to.clone();
                    true
                } else {
                    false
                }
            });
        }
    }

    fn escalate_unauthorized(&self) {
        let now = self.clock.now();
        let recent = self
            .events
            .count_since(SecurityEventKind::UnauthorizedAttempt, now - self.policy.window);
        if recent < self.policy.unauthorized_threshold {
            return;
        }
        let due = {
            let mut escalation = resilient_lock(&self.escalation);
            take_alert(&mut escalation.last_unauthorized_alert, now, self.policy.window)
        };
        if due {
            self.events.record(
                SecurityEventKind::SuspiciousActivity,
                &self.current_path(),
                format!(
                    "{} unauthorized attempts within {}s",
                    recent,
                    self.policy.window.num_seconds()
                ),
            );
        }
    }

    fn escalate_navigation(&self) {
        let now = self.clock.now();
        let recent = self
            .events
            .count_since(SecurityEventKind::PageAccess, now - self.policy.window);
        if recent < self.policy.navigation_threshold {
            return;
        }
        let due = {
            let mut escalation = resilient_lock(&self.escalation);
            take_alert(&mut escalation.last_navigation_alert, now, self.policy.window)
        };
        if due {
            self.events.record(
                SecurityEventKind::SuspiciousActivity,
                &self.current_path(),
                format!(
                    "{} page accesses within {}s",
                    recent,
                    self.policy.window.num_seconds()
                ),
            );
        }
    }
}

/// At most one alert per window.
fn take_alert(last: &mut Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    match *last {
        Some(at) if now - at < window => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}
