// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The process-wide default loop.
//!
//! Embedders that pass loops around explicitly never need this; it exists for
//! the common single-loop process, where library code wants "the" loop without
//! threading a handle through every call site. The slot holds a strong handle:
//! clear it (or replace it) at shutdown to let the loop drop.

use crate::event_loop::EventLoop;
use std::{io,
          sync::{Mutex, PoisonError}};

static DEFAULT_LOOP: Mutex<Option<EventLoop>> = Mutex::new(None);

fn slot() -> std::sync::MutexGuard<'static, Option<EventLoop>> {
    DEFAULT_LOOP.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Installs `event_loop` as the process default, replacing (and releasing) any
/// previous one.
pub fn set_default(event_loop: &EventLoop) { *slot() = Some(event_loop.clone()); }

/// Clears the default slot, releasing its reference.
pub fn clear_default() { *slot() = None; }

/// The current default loop, if one is set.
#[must_use]
pub fn get_default() -> Option<EventLoop> { slot().clone() }

/// The default loop, lazily created with the default backend on first use.
///
/// # Errors
///
/// Fails if a loop has to be created and the OS polling primitive cannot be.
pub fn get_or_create_default() -> io::Result<EventLoop> {
    let mut guard = slot();
    if let Some(existing) = guard.as_ref() {
        return Ok(existing.clone());
    }
    let created = EventLoop::with_default_backend()?;
    *guard = Some(created.clone());
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(default_loop)]
    fn set_get_clear_round_trip() {
        clear_default();
        assert!(get_default().is_none());

        let event_loop = EventLoop::with_default_backend().expect("loop");
        set_default(&event_loop);
        let fetched = get_default().expect("default set");
        assert_eq!(fetched.id(), event_loop.id());

        clear_default();
        assert!(get_default().is_none());
    }

    #[test]
    #[serial(default_loop)]
    fn lazy_creation_is_idempotent() {
        clear_default();
        let first = get_or_create_default().expect("create");
        let second = get_or_create_default().expect("reuse");
        assert_eq!(first.id(), second.id());
        clear_default();
    }
}
