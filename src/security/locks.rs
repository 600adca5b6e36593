// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Poison-tolerant lock helpers.
//!
//! Auth state, the event ring buffer and the guard's escalation window all sit
//! behind std locks. A panic while one of them is held must not turn every
//! later request into a panic, so acquisition recovers the inner data and
//! records the incident instead.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "atlas::locks",
            event = "LOCK_POISONED_READ",
            "RwLock poisoned during read; continuing with recovered state"
        );
        poisoned.into_inner()
    })
}

/// Acquire a write lock, recovering from poisoning.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "atlas::locks",
            event = "LOCK_POISONED_WRITE",
            "RwLock poisoned during write; continuing with recovered state"
        );
        poisoned.into_inner()
    })
}

/// Acquire a mutex, recovering from poisoning.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        tracing::error!(
            target: "atlas::locks",
            event = "LOCK_POISONED_MUTEX",
            "Mutex poisoned; continuing with recovered state"
        );
        poisoned.into_inner()
    })
}
