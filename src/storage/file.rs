// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! JSON-file key-value store.
//!
//! The whole map lives in one pretty-printed JSON object. Reads take a shared
//! advisory lock on a sibling `.lock` file and writes an exclusive one (fs2),
//! so two `atlas` processes pointed at the same data directory never
//! interleave a read-modify-write. A write goes to a `.tmp` sibling that is
//! then renamed over the store, so a crash leaves either the old or the new
//! map on disk.
//! Change notifications cover handles forked from the same `FileStore` in
//! this process; writes from other processes are not observed.

use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::{
    next_context_id, publish, ChangeKind, ContextId, KeyValueStore, StorageChange, StorageError,
    CHANGE_CHANNEL_CAPACITY,
};
use crate::security::locks::resilient_lock;

struct Shared {
    path: PathBuf,
    lock_path: PathBuf,
    tmp_path: PathBuf,
    write_lock: Mutex<()>,
    changes: broadcast::Sender<StorageChange>,
}

#[derive(Clone)]
pub struct FileStore {
    shared: Arc<Shared>,
    context: ContextId,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`. Parent directories are
    /// created immediately.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                lock_path: sibling(&path, ".lock"),
                tmp_path: sibling(&path, ".tmp"),
                path,
                write_lock: Mutex::new(()),
                changes,
            }),
            context: next_context_id(),
        })
    }

    pub fn fork(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            context: next_context_id(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    fn parse(content: &str) -> Result<BTreeMap<String, String>, StorageError> {
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(content).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    fn open_lock(&self) -> Result<File, StorageError> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.shared.lock_path)?)
    }

    fn read_content(&self) -> Result<String, StorageError> {
        let mut file = match File::open(&self.shared.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        Ok(content)
    }

    fn read_map(&self) -> Result<BTreeMap<String, String>, StorageError> {
        let lock = self.open_lock()?;
        FileExt::lock_shared(&lock)?;
        Self::parse(&self.read_content()?)
    }

    /// Read-modify-write under an exclusive lock. `mutate` returns whether
    /// the map changed; unchanged maps are not rewritten.
    fn update<F>(&self, mutate: F) -> Result<bool, StorageError>
    where
        F: FnOnce(&mut BTreeMap<String, String>) -> bool,
    {
        let _guard = resilient_lock(&self.shared.write_lock);
        let lock = self.open_lock()?;
        FileExt::lock_exclusive(&lock)?;

        let mut map = Self::parse(&self.read_content()?)?;
        let changed = mutate(&mut map);
        if changed {
            let serialized = serde_json::to_string_pretty(&map)
                .map_err(|e| StorageError::Corrupt(e.to_string()))?;
            let mut tmp = File::create(&self.shared.tmp_path)?;
            tmp.write_all(serialized.as_bytes())?;
            tmp.sync_all()?;
            drop(tmp);
            fs::rename(&self.shared.tmp_path, &self.shared.path)?;
        }
        Ok(changed)
    }
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read_map()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.update(|map| {
            map.insert(key.to_string(), value.to_string());
            true
        })?;
        publish(&self.shared.changes, key, ChangeKind::Set, self.context);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        if self.update(|map| map.remove(key).is_some())? {
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
