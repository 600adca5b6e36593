// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! In-memory key-value store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use super::{
    next_context_id, publish, ChangeKind, ContextId, KeyValueStore, StorageChange, StorageError,
    CHANGE_CHANNEL_CAPACITY,
};
use crate::security::locks::{resilient_read, resilient_write};

struct Shared {
    entries: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
    unavailable: AtomicBool,
}

/// Process-local store. [`MemoryStore::fork`] yields another context over
/// the same entries, the way two browser tabs share one origin's storage.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    context: ContextId,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                changes,
                unavailable: AtomicBool::new(false),
            }),
            context: next_context_id(),
        }
    }

    /// A new handle with its own context id over the same data.
    pub fn fork(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            context: next_context_id(),
        }
    }

    /// Make every operation fail, for exercising fail-closed paths.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.shared.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store disabled".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check_available()?;
        Ok(resilient_read(&self.shared.entries).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check_available()?;
        resilient_write(&self.shared.entries).insert(key.to_string(), value.to_string());
        publish(&self.shared.changes, key, ChangeKind::Set, self.context);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check_available()?;
        let removed = resilient_write(&self.shared.entries).remove(key).is_some();
        if removed {
            publish(&self.shared.changes, key, ChangeKind::Removed, self.context);
        }
        Ok(())
    }

    fn context_id(&self) -> ContextId {
        self.context
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.shared.changes.subscribe()
    }
}
