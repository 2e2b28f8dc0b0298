// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Poison-tolerant mutex locking.
//!
//! A panicking user callback unwinds through the loop thread and poisons any
//! mutex it happened to hold. The loop's own bookkeeping structures stay
//! consistent across such a panic (every lock scope either completes its update
//! or leaves the previous state), so recovery via
//! [`PoisonError::into_inner`] is sound and keeps the loop serviceable.
//!
//! [`PoisonError::into_inner`]: std::sync::PoisonError::into_inner

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Extension trait: lock a [`Mutex`], shrugging off poisoning.
pub(crate) trait LockUnpoisoned<T> {
    /// Like [`Mutex::lock()`] but recovers the guard from a poisoned lock.
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T>;
}

impl<T> LockUnpoisoned<T> for Mutex<T> {
    fn lock_unpoisoned(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
