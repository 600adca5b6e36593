// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Process-wide auth context.
//!
//! Built once at startup and passed explicitly to whatever needs it (HTTP
//! handlers, CLI commands). Lifecycle:
//!
//! 1. [`AtlasContext::from_config`] wires storage, directory and components
//! 2. [`AtlasContext::initialize`] resolves the stored session
//! 3. [`AtlasContext::start_background_tasks`] starts the timers; dropping
//!    the returned set stops them

use anyhow::{Context as _, Result};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{load_or_create_secret, AtlasConfig, StorageBackend, STATE_FILE};
use crate::directory::{PostgrestDirectory, StaticDirectory, UserDirectory};
use crate::security::monitor::{self, BackgroundTasks};
use crate::security::{
    AuthState, Authenticator, LockoutTracker, RedirectReason, RouteGuard, SecurityEventKind,
    SecurityEventLog, SessionSecret, SessionStore, SessionVerdict,
};
use crate::storage::{FileStore, KeyValueStore, MemoryStore};

pub struct AtlasContext {
    pub config: Arc<AtlasConfig>,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<SecurityEventLog>,
    pub auth: Arc<Authenticator>,
    pub guard: Arc<RouteGuard>,
}

impl AtlasContext {
    /// Wire everything from configuration: storage backend, session secret,
    /// user directory, system clock.
    pub fn from_config(config: AtlasConfig) -> Result<Self> {
        let data_dir = config.data_dir()?;

        let store: Arc<dyn KeyValueStore> = match config.storage {
            StorageBackend::File => {
                let path = data_dir.join(STATE_FILE);
                Arc::new(
                    FileStore::open(&path)
                        .with_context(|| format!("Failed to open state file {}", path.display()))?,
                )
            }
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };

        let secret = load_or_create_secret(&config.security, &data_dir)?;

        let directory: Arc<dyn UserDirectory> = match &config.directory.postgrest {
            Some(postgrest) => {
                tracing::info!("Using PostgREST user directory at {}", postgrest.url);
                Arc::new(PostgrestDirectory::new(postgrest.clone()))
            }
            None => {
                if config.directory.users.is_empty() {
                    tracing::warn!("No users configured; every login will fail");
                }
                Arc::new(StaticDirectory::new(config.directory.users.clone()))
            }
        };

        Ok(Self::with_parts(
            config,
            store,
            Arc::new(SystemClock),
            directory,
            secret,
        ))
    }

    /// Wire the components over explicit collaborators.
    pub fn with_parts(
        config: AtlasConfig,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn UserDirectory>,
        secret: SessionSecret,
    ) -> Self {
        let security = &config.security;

        let sessions = SessionStore::new(Arc::clone(&store), secret, security.session_timeout());
        let lockout = LockoutTracker::new(Arc::clone(&store), security.lockout_policy());
        let auth = Arc::new(Authenticator::new(
            sessions,
            lockout,
            directory,
            Arc::clone(&clock),
            security.fingerprint(),
            security.credential_policy(),
        ));
        let events = Arc::new(SecurityEventLog::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            security.event_log_limits(),
        ));
        let guard = Arc::new(RouteGuard::new(
            Arc::clone(&auth),
            Arc::clone(&events),
            Arc::clone(&clock),
            config.routes.clone(),
            security.suspicion_policy(),
            store.context_id(),
        ));

        Self {
            config: Arc::new(config),
            store,
            clock,
            events,
            auth,
            guard,
        }
    }

    /// Resolve the startup auth state.
    pub fn initialize(&self) -> AuthState {
        let state = self.auth.initialize();
        tracing::info!(target: "atlas::security", state = %state, "Auth state resolved");
        state
    }

    /// Session check on behalf of the application. An authenticated session
    /// that fails it is logged out, recorded as a `session_anomaly`, and the
    /// guard leaves any protected location.
    pub fn verify_session(&self) -> SessionVerdict {
        let was_authenticated = self.auth.is_authenticated();
        let verdict = self.auth.check_session();
        if !verdict.is_valid() && was_authenticated {
            self.events.record(
                SecurityEventKind::SessionAnomaly,
                &self.guard.current_path(),
                format!("session check failed: {}", verdict),
            );
            self.guard.retreat(RedirectReason::SessionInvalid);
        }
        verdict
    }

    pub fn check_auth_status(&self) -> bool {
        self.verify_session().is_valid()
    }

    /// Start revalidation, guard tick, log pruning and the storage watcher.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let security = &self.config.security;
        let mut tasks = BackgroundTasks::new();

        tasks.push(monitor::spawn_storage_watcher(
            self.store.subscribe(),
            Arc::clone(&self.guard),
            Arc::clone(&self.auth),
        ));
        tasks.push(monitor::spawn_revalidation(
            Arc::clone(&self.auth),
            Arc::clone(&self.guard),
            Arc::clone(&self.events),
            security.revalidation_interval(),
        ));
        tasks.push(monitor::spawn_guard_tick(
            Arc::clone(&self.guard),
            security.guard_check_interval(),
        ));
        tasks.push(monitor::spawn_log_pruning(
            Arc::clone(&self.events),
            Arc::clone(&self.clock),
            security.prune_interval(),
            security.log_retention(),
        ));

        tracing::debug!(
            target: "atlas::monitor",
            tasks = tasks.len(),
            "Background tasks started"
        );
        tasks
    }
}
