// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Persistent key-value storage.
//!
//! The auth core keeps every piece of state (session record, lockout counter,
//! persisted event log) as string values under fixed keys. Several execution
//! contexts may share one backing store; every write is published as a
//! [`StorageChange`] tagged with the writer's [`ContextId`] so that readers can
//! tell their own writes from foreign ones.
//!
//! ## Implementations
//!
//! - [`MemoryStore`] - process-local map, used by tests and ephemeral servers
//! - [`FileStore`] - JSON file guarded by an advisory file lock

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;

/// Identifies one execution context (one handle) of a shared store.
pub type ContextId = u64;

/// Capacity of the change notification channel per backing store.
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 128;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_context_id() -> ContextId {
    NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)
}

/// Storage failures. Callers in the auth core treat all of them as
/// "absent / not authenticated".
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage contents corrupt: {0}")]
    Corrupt(String),
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Set,
    Removed,
}

/// A single key mutation, published to every subscriber of the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub kind: ChangeKind,
    pub origin: ContextId,
}

impl StorageChange {
    /// True when the change was made through a different handle than `own`.
    pub fn is_foreign(&self, own: ContextId) -> bool {
        self.origin != own
    }
}

/// Synchronous key-value storage with change notifications.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// The context this handle writes as.
    fn context_id(&self) -> ContextId;

    /// Subscribe to changes made through any handle of the backing store.
    fn subscribe(&self) -> broadcast::Receiver<StorageChange>;
}

pub(crate) fn publish(
    sender: &broadcast::Sender<StorageChange>,
    key: &str,
    kind: ChangeKind,
    origin: ContextId,
) {
    // No subscribers is fine.
    let _ = sender.send(StorageChange {
        key: key.to_string(),
        kind,
        origin,
    });
}
