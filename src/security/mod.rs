// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Security core for the atlas editor.
//!
//! ## Components
//!
//! - **Session Store**: persists the single session record and decides validity
//!   (absolute 8 h timeout, HMAC-SHA256 integrity tag)
//! - **Lockout Tracker**: 5 failed logins lock login for 15 minutes
//! - **Authenticator**: login/logout and the auth state machine
//! - **Route Guard**: allow, redirect or hold each navigation
//! - **Security Event Log**: bounded, persisted record of access decisions
//!
//! ## Usage
//!
//! ```no_run
//! use atlas_guard::{AtlasConfig, AtlasContext};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let ctx = AtlasContext::from_config(AtlasConfig::default())?;
//! ctx.initialize();
//! let _tasks = ctx.start_background_tasks();
//!
//! if ctx.auth.login("admin", "correct-pass").await {
//!     assert!(ctx.guard.navigate("/edicion").is_allow());
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod event_log;
pub mod guard;
pub mod lockout;
pub mod locks;
pub mod monitor;
pub mod password;
pub mod routes;
pub mod session_store;

pub use auth::{AuthError, AuthState, Authenticator, CredentialPolicy};
pub use event_log::{EventLogLimits, EventStats, SecurityEvent, SecurityEventKind, SecurityEventLog};
pub use guard::{GuardDecision, RedirectReason, RouteGuard, SuspicionPolicy};
pub use lockout::{LockoutPolicy, LockoutTracker};
pub use locks::{resilient_lock, resilient_read, resilient_write};
pub use monitor::BackgroundTasks;
pub use routes::RouteTable;
pub use session_store::{SessionRecord, SessionSecret, SessionStore, SessionVerdict};
