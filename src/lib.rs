// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! atlas-guard - session and access core for the histology atlas editor
//!
//! Keeps the editor pages (`/edicion`, `/temario`, `/placas`) behind a
//! short-lived, tamper-evident session, locks login after repeated failures
//! and records every access decision.
//!
//! # Core Modules
//!
//! - [`security`] - Session store, lockout, authenticator, route guard, event log
//! - [`storage`] - Key-value storage with change notifications
//! - [`directory`] - User directories (static, PostgREST)
//! - [`media`] - Image delete proxy for the media host
//! - [`context`] - Process-wide context and background tasks
//! - [`server`] - HTTP service
//! - [`config`] - Configuration file and environment overrides
//! - [`errors`] - HTTP-facing errors with reference codes

pub mod clock;
pub mod config;
pub mod context;
pub mod directory;
pub mod errors;
pub mod media;
pub mod security;
pub mod server;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{load_config, AtlasConfig};
pub use context::AtlasContext;
pub use directory::{StaticDirectory, StoredUser, UserDirectory, UserRecord};
pub use errors::UserError;
pub use security::{
    AuthError, AuthState, Authenticator, GuardDecision, RouteGuard, SecurityEvent,
    SecurityEventKind, SecurityEventLog, SessionVerdict,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore, StorageError};
