// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Process-wide id registry for weak object lookup.
//!
//! Every source and every loop gets a stable 64-bit [`ObjectId`] at creation.
//! Ids are allocated from one monotonic counter and are never reused. The
//! registry maps live ids to [`Weak`] pointers, so [`SourceHandle::try_ref()`]
//! and [`EventLoop::try_ref()`] can resolve an id to a strong handle if - and
//! only if - the object is still alive at that instant.
//!
//! This is the mechanism that breaks ownership cycles: the loop owns started
//! sources, and a callback that needs to reach its loop (or another source)
//! holds the *id*, not a strong handle, and resolves it late.
//!
//! # Locking
//!
//! One process-wide mutex guards the map. It is taken briefly for register,
//! unregister (from `Drop` impls), and lookup; no callback ever runs under it.
//!
//! [`EventLoop::try_ref()`]: crate::EventLoop::try_ref
//! [`SourceHandle::try_ref()`]: crate::SourceHandle::try_ref

use crate::{event_loop::LoopInner, locking::LockUnpoisoned,
            source::handle::SourceInner};
use std::{collections::HashMap,
          sync::{Arc, Mutex, OnceLock, Weak,
                 atomic::{AtomicU64, Ordering}}};

/// Stable, process-unique object id. See the [module docs](self).
pub type ObjectId = u64;

/// A registry slot: sources and loops share the same id space.
enum RegistryEntry {
    Source(Weak<SourceInner>),
    Loop(Weak<LoopInner>),
}

/// Monotonic id counter. Starts at 1 so 0 can never name a live object.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next object id. Never reused for the lifetime of the process.
pub(crate) fn next_object_id() -> ObjectId { NEXT_ID.fetch_add(1, Ordering::Relaxed) }

fn registry() -> &'static Mutex<HashMap<ObjectId, RegistryEntry>> {
    static REGISTRY: OnceLock<Mutex<HashMap<ObjectId, RegistryEntry>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) fn register_source(id: ObjectId, inner: &Arc<SourceInner>) {
    registry()
        .lock_unpoisoned()
        .insert(id, RegistryEntry::Source(Arc::downgrade(inner)));
}

pub(crate) fn register_loop(id: ObjectId, inner: &Arc<LoopInner>) {
    registry()
        .lock_unpoisoned()
        .insert(id, RegistryEntry::Loop(Arc::downgrade(inner)));
}

/// Removes an id. Called from the owning object's `Drop` impl.
pub(crate) fn unregister(id: ObjectId) { registry().lock_unpoisoned().remove(&id); }

/// Resolves an id to a live source, or absence.
pub(crate) fn lookup_source(id: ObjectId) -> Option<Arc<SourceInner>> {
    match registry().lock_unpoisoned().get(&id) {
        Some(RegistryEntry::Source(weak)) => weak.upgrade(),
        _ => None,
    }
}

/// Resolves an id to a live loop, or absence.
pub(crate) fn lookup_loop(id: ObjectId) -> Option<Arc<LoopInner>> {
    match registry().lock_unpoisoned().get(&id) {
        Some(RegistryEntry::Loop(weak)) => weak.upgrade(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SourceHandle;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = next_object_id();
        let b = next_object_id();
        assert!(b > a);
    }

    #[test]
    fn distinct_sources_have_distinct_ids() {
        let one = SourceHandle::idle(|_, _| {});
        let two = SourceHandle::idle(|_, _| {});
        assert_ne!(one.id(), two.id());
    }

    #[test]
    fn lookup_after_final_release_reports_absence() {
        let source = SourceHandle::idle(|_, _| {});
        let id = source.id();
        assert!(lookup_source(id).is_some());
        drop(source);
        assert!(lookup_source(id).is_none());
        // The id is retired, never recycled: a fresh source gets a new one.
        let fresh = SourceHandle::idle(|_, _| {});
        assert_ne!(fresh.id(), id);
    }

    #[test]
    fn source_ids_do_not_resolve_as_loops() {
        let source = SourceHandle::idle(|_, _| {});
        assert!(lookup_loop(source.id()).is_none());
    }

    #[test]
    fn try_ref_races_with_release_without_dangling() {
        // A resolver thread hammers try_ref while this thread drops the
        // source; every successful resolution must be a valid strong handle.
        let source = SourceHandle::idle(|_, _| {});
        let id = source.id();

        let resolver = std::thread::spawn(move || {
            let mut hits = 0_u32;
            loop {
                match SourceHandle::try_ref(id) {
                    Some(handle) => {
                        assert_eq!(handle.id(), id);
                        hits += 1;
                    }
                    None => return hits,
                }
            }
        });

        std::thread::sleep(std::time::Duration::from_millis(5));
        drop(source);

        // The thread observes absence and exits; any hit it made was sound.
        let _hits = resolver.join().expect("resolver thread");
        assert!(SourceHandle::try_ref(id).is_none());
    }
}
