// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words signo signos sigaction eventfd SIGKILL SIGSTOP

//! Async-signal-safe path from OS signal delivery to loop wakeup.
//!
//! The classic two-stage design: the OS-level handler does nothing but flip a
//! per-signo [`AtomicBool`] and wake the backend's poll; everything else - the
//! handler lists, registration order, invoking callbacks - happens later on
//! the loop thread during dispatch.
//!
//! ```text
//! OS delivers SIGx ──► low-level hook: flags[x] = true; waker.wake()
//!                                               │
//!                poll() returns ◄───────────────┘
//!                      │
//!            dispatch: flags[x].swap(false) ──► fire every started
//!                                               handler for x, in
//!                                               registration order
//! ```
//!
//! Rapid repeated deliveries before the next cycle coalesce into one flag and
//! therefore one dispatch round - every handler for that signo fires the same
//! number of times.
//!
//! The low-level hook is installed through [`signal_hook`] once per distinct
//! signo, when the first handler for it starts, and removed when the last one
//! stops; [`signal_hook`] preserves the chain of previously installed
//! dispositions. If the backend claimed delivery for a signo itself
//! ([`Backend::add_signal()`] returned `Done`), handlers are tracked here for
//! ordering but no OS hook is installed - the backend reports deliveries via
//! [`EventLoop::emit()`], which sets the very same flags.
//!
//! [`Backend::add_signal()`]: crate::backend::Backend::add_signal
//! [`EventLoop::emit()`]: crate::EventLoop::emit

use crate::{backend::BackendWaker,
            error::StartError,
            locking::LockUnpoisoned,
            source::SourceHandle};
use smallvec::SmallVec;
use std::{collections::BTreeMap,
          sync::{Arc, Mutex,
                 atomic::{AtomicBool, Ordering}}};

/// Size of the per-signo flag table; covers every real-time and classic signal
/// number on the supported platforms.
const SIGNO_SLOTS: usize = 64;

/// Largest signal number the bridge can track (exclusive).
pub(crate) const MAX_SIGNO: i32 = SIGNO_SLOTS as i32;

/// The only state the OS-level handler touches: flags plus the waker. Both
/// operations are async-signal-safe (an atomic store and an eventfd/pipe
/// write). Shared via [`Arc`] with the installed hooks so a hook that fires
/// while the loop is being torn down still touches valid memory.
pub(crate) struct SignalFlags {
    pending: [AtomicBool; SIGNO_SLOTS],
    waker: Arc<dyn BackendWaker>,
}

impl SignalFlags {
    fn new(waker: Arc<dyn BackendWaker>) -> Self {
        Self {
            pending: [const { AtomicBool::new(false) }; SIGNO_SLOTS],
            waker,
        }
    }

    /// Marks `signo` pending and wakes the loop. Async-signal-safe: no
    /// allocation, no locks, no logging.
    pub(crate) fn raise(&self, signo: i32) {
        if let Some(flag) = usize::try_from(signo).ok().and_then(|it| self.pending.get(it)) {
            flag.store(true, Ordering::SeqCst);
            self.waker.wake();
        }
    }

    /// Consumes the pending flag for `signo`.
    pub(crate) fn take(&self, signo: i32) -> bool {
        usize::try_from(signo)
            .ok()
            .and_then(|it| self.pending.get(it))
            .is_some_and(|flag| flag.swap(false, Ordering::SeqCst))
    }

    fn is_pending(&self, signo: i32) -> bool {
        usize::try_from(signo)
            .ok()
            .and_then(|it| self.pending.get(it))
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

struct SignoEntry {
    /// Installed OS hook, if this bridge (and not the backend) owns delivery
    /// for the signo.
    os_hook: Option<signal_hook::SigId>,
    /// Started handlers in registration order. These clones are the loop-owned
    /// references.
    handlers: Vec<SourceHandle>,
}

/// Per-loop signal bookkeeping. See the [module docs](self).
pub(crate) struct SignalBridge {
    flags: Arc<SignalFlags>,
    entries: Mutex<BTreeMap<i32, SignoEntry>>,
}

impl SignalBridge {
    pub(crate) fn new(waker: Arc<dyn BackendWaker>) -> Self {
        Self {
            flags: Arc::new(SignalFlags::new(waker)),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn flags(&self) -> &Arc<SignalFlags> { &self.flags }

    /// Registers a started signal handler. Installs the OS hook for its signo
    /// if `install_os_hook` and this is the signo's first handler.
    pub(crate) fn add(
        &self,
        signo: i32,
        source: &SourceHandle,
        install_os_hook: bool,
    ) -> Result<(), StartError> {
        if signo <= 0 || signo >= MAX_SIGNO {
            return Err(StartError::InvalidSignal { signo });
        }

        let mut entries = self.entries.lock_unpoisoned();
        let entry = entries
            .entry(signo)
            .or_insert_with(|| SignoEntry { os_hook: None, handlers: Vec::new() });

        if install_os_hook && entry.os_hook.is_none() {
            let flags = Arc::clone(&self.flags);
            // SAFETY: the action only performs an atomic store and the
            // backend waker's wake() (an eventfd/self-pipe write); both are
            // async-signal-safe, and the closure owns its Arc so the memory
            // it touches outlives any in-flight handler invocation.
            let hook = unsafe {
                signal_hook::low_level::register(signo, move || flags.raise(signo))
            }
            .map_err(StartError::SignalInstall)?;
            entry.os_hook = Some(hook);
        }

        entry.handlers.push(source.clone());
        Ok(())
    }

    /// Deregisters a stopped handler, returning the loop-owned reference so
    /// the caller drops it outside the bridge lock. Removes the OS hook when
    /// the signo's last handler goes away (the previous disposition chain is
    /// restored by `signal_hook`).
    pub(crate) fn remove(&self, signo: i32, source: &SourceHandle) -> Option<SourceHandle> {
        let mut entries = self.entries.lock_unpoisoned();
        let entry = entries.get_mut(&signo)?;
        let position = entry.handlers.iter().position(|it| it.id() == source.id())?;
        let removed = entry.handlers.remove(position);

        if entry.handlers.is_empty() {
            if let Some(done) = entries.remove(&signo)
                && let Some(hook) = done.os_hook
            {
                signal_hook::low_level::unregister(hook);
            }
        }
        Some(removed)
    }

    /// Snapshot of every signo's handler list, in signo order. Taken by the
    /// dispatch core so no lock is held while callbacks run.
    pub(crate) fn snapshot(&self) -> Vec<(i32, SmallVec<[SourceHandle; 2]>)> {
        self.entries
            .lock_unpoisoned()
            .iter()
            .map(|(signo, entry)| (*signo, entry.handlers.iter().cloned().collect()))
            .collect()
    }

    /// Number of signos with handlers whose flag is currently set. Feeds the
    /// buffered-event count of `poll()`.
    pub(crate) fn pending_event_count(&self) -> usize {
        self.entries
            .lock_unpoisoned()
            .keys()
            .filter(|signo| self.flags.is_pending(**signo))
            .count()
    }

    /// Tears everything down: unregisters OS hooks and returns the held
    /// references for release. Used when the loop is dropped.
    pub(crate) fn drain(&self) -> Vec<SourceHandle> {
        let mut released = Vec::new();
        for (_, entry) in std::mem::take(&mut *self.entries.lock_unpoisoned()) {
            if let Some(hook) = entry.os_hook {
                signal_hook::low_level::unregister(hook);
            }
            released.extend(entry.handlers);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopWaker;
    impl BackendWaker for NoopWaker {
        fn wake(&self) {}
    }

    fn bridge() -> SignalBridge { SignalBridge::new(Arc::new(NoopWaker)) }

    #[test]
    fn flags_coalesce_and_take_clears() {
        let bridge = bridge();
        bridge.flags().raise(10);
        bridge.flags().raise(10);
        assert!(bridge.flags().take(10));
        assert!(!bridge.flags().take(10));
    }

    #[test]
    fn out_of_range_signos_are_rejected() {
        let bridge = bridge();
        let negative = SourceHandle::signal(-3, |_, _| {});
        let huge = SourceHandle::signal(MAX_SIGNO, |_, _| {});
        assert!(matches!(
            bridge.add(-3, &negative, false),
            Err(StartError::InvalidSignal { signo: -3 })
        ));
        assert!(matches!(
            bridge.add(MAX_SIGNO, &huge, false),
            Err(StartError::InvalidSignal { .. })
        ));
    }

    #[test]
    fn handlers_keep_registration_order_per_signo() {
        let bridge = bridge();
        let first = SourceHandle::signal(10, |_, _| {});
        let second = SourceHandle::signal(10, |_, _| {});
        bridge.add(10, &first, false).expect("add first");
        bridge.add(10, &second, false).expect("add second");

        let snapshot = bridge.snapshot();
        assert_eq!(snapshot.len(), 1);
        let (signo, handlers) = &snapshot[0];
        assert_eq!(*signo, 10);
        assert_eq!(handlers[0].id(), first.id());
        assert_eq!(handlers[1].id(), second.id());
    }

    #[test]
    fn remove_returns_the_held_reference() {
        let bridge = bridge();
        let source = SourceHandle::signal(12, |_, _| {});
        bridge.add(12, &source, false).expect("add");
        assert_eq!(source.ref_count(), 2);

        let removed = bridge.remove(12, &source).expect("held");
        assert_eq!(removed.id(), source.id());
        drop(removed);
        assert_eq!(source.ref_count(), 1);
        assert!(bridge.remove(12, &source).is_none());
    }

    #[test]
    fn pending_event_count_only_counts_tracked_signos() {
        let bridge = bridge();
        let source = SourceHandle::signal(10, |_, _| {});
        bridge.add(10, &source, false).expect("add");

        bridge.flags().raise(10);
        bridge.flags().raise(11); // nothing tracks signo 11
        assert_eq!(bridge.pending_event_count(), 1);
    }
}
