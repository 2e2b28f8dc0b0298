// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue eventfd signalfd

//! The contract between the event loop core and a pluggable readiness backend.
//!
//! A backend wraps one OS multiplexing primitive (epoll, kqueue, poll, ...) and
//! supplies the loop's single blocking point. The core drives it through the
//! [`Backend`] trait and never touches the primitive directly:
//!
//! ```text
//! EventLoop::poll()                         EventLoop::interrupt()
//!       │                                          │ (any thread / OS signal handler)
//!       ▼                                          ▼
//! Backend::poll(timeout, sink) ◄──unblocks── BackendWaker::wake()
//!       │
//!       └── sink.ready(source, revents)  for each ready fd watch
//! ```
//!
//! # Required vs optional operations
//!
//! Fd registration (`add_fd`/`mod_fd`/`del_fd`), `poll`, and `waker` are
//! required. Signal ops and thread-pool ops are optional and degrade
//! gracefully: a backend that declines signal ops gets the core's own
//! [signal bridge]; a backend that declines pool ops makes
//! [`require_workers()`] fail with [`WorkerPoolError::Unsupported`].
//!
//! # Edge-triggered backends
//!
//! A backend that reports each readiness *transition* once (epoll with
//! `EPOLLET`, which is what [`mio`] uses) advertises
//! [`BackendFlags::EDGE_TRIGGERED`]. The core in turn promises embedders that
//! readiness must be drained fully before the next report, and will not issue
//! re-arming `mod_fd` calls between reports.
//!
//! [`WorkerPoolError::Unsupported`]: crate::WorkerPoolError::Unsupported
//! [`require_workers()`]: crate::EventLoop::require_workers
//! [signal bridge]: crate::event_loop::signal_bridge

// Attach sources.
pub mod mio_backend;

// Re-export.
pub use mio_backend::*;

use crate::{locking::LockUnpoisoned,
            source::{Revents, SourceHandle}};
use bitflags::bitflags;
use std::{collections::VecDeque,
          io,
          os::fd::RawFd,
          sync::{Arc, Mutex},
          time::Duration};

bitflags! {
    /// Capability flags a backend advertises to the core.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BackendFlags: u32 {
        /// The backend reports readiness transitions, not levels. See the
        /// [module docs](self).
        const EDGE_TRIGGERED = 1 << 0;
    }
}

/// Outcome of an optional backend operation.
#[derive(Debug)]
pub enum BackendOp {
    /// The backend performed the operation.
    Done,
    /// The backend does not implement this operation; the core falls back (or
    /// reports the capability as missing).
    Declined,
    /// The backend implements the operation but it failed.
    Failed(io::Error),
}

/// Interrupts a blocked [`Backend::poll()`].
///
/// The single waker instance is shared by [`interrupt()`], [`exit()`], the
/// signal bridge's OS-level handlers, and worker threads posting completions,
/// so implementations must be callable from any thread *and* from an OS signal
/// handler: no allocation, no locks, no logging. An eventfd or self-pipe write
/// qualifies.
///
/// [`exit()`]: crate::EventLoop::exit
/// [`interrupt()`]: crate::EventLoop::interrupt
pub trait BackendWaker: Send + Sync + 'static {
    /// Wakes the blocked poll. Best effort: a wake that races a dead or
    /// re-created poll is harmless and must not panic.
    fn wake(&self);
}

/// Receives ready fd watches from [`Backend::poll()`].
pub trait EventSink {
    /// Reports one fd watch as ready with the observed `revents`.
    fn ready(&mut self, source: &SourceHandle, revents: Revents);
}

/// A pluggable readiness multiplexer. See the [module docs](self).
pub trait Backend: Send + 'static {
    /// Capability flags. Defaults to none.
    fn flags(&self) -> BackendFlags { BackendFlags::empty() }

    /// The shared waker bound to this backend's poll mechanism.
    fn waker(&self) -> Arc<dyn BackendWaker>;

    /// A pollable fd that becomes readable when this backend has events, so a
    /// loop can be nested inside another loop. [`None`] if the primitive has
    /// no such fd.
    fn pollable_fd(&self) -> Option<RawFd> { None }

    /// Blocks until readiness, timeout ([`None`] = unbounded), or a wake.
    /// Pushes every ready fd watch into `sink` and returns how many were
    /// pushed; `Ok(0)` covers timeout, interruption, and `EINTR`.
    ///
    /// # Errors
    ///
    /// A backend failure is returned as [`io::Error`]; the core surfaces it
    /// without tearing the loop down.
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        sink: &mut dyn EventSink,
    ) -> io::Result<usize>;

    /// Registers a started fd watch.
    ///
    /// # Errors
    ///
    /// Any [`io::Error`] from the underlying registration syscall.
    fn add_fd(&mut self, source: &SourceHandle) -> io::Result<()>;

    /// Applies a changed event mask to an already-registered fd watch.
    ///
    /// # Errors
    ///
    /// Any [`io::Error`] from the underlying re-registration syscall.
    fn mod_fd(&mut self, source: &SourceHandle) -> io::Result<()>;

    /// Deregisters a stopped fd watch and drops the backend's reference.
    ///
    /// # Errors
    ///
    /// Any [`io::Error`] from the underlying deregistration syscall.
    fn del_fd(&mut self, source: &SourceHandle) -> io::Result<()>;

    /// Optionally takes over delivery for a started signal source (e.g. via
    /// signalfd). Declining routes the signal through the core's bridge.
    fn add_signal(&mut self, _source: &SourceHandle) -> BackendOp { BackendOp::Declined }

    /// Inverse of [`add_signal()`](Self::add_signal).
    fn del_signal(&mut self, _source: &SourceHandle) -> BackendOp { BackendOp::Declined }

    /// Optionally acquires a worker pool with at least `workers` threads that
    /// post finished jobs into `completions`.
    fn pool_acquire(
        &mut self,
        _workers: usize,
        _completions: Arc<CompletionQueue>,
    ) -> BackendOp {
        BackendOp::Declined
    }

    /// Hands a started work source to the pool, transferring the loop-owned
    /// reference with it.
    fn pool_enqueue(&mut self, _job: SourceHandle) -> BackendOp { BackendOp::Declined }

    /// Releases the pool; called when the loop is dropped. Must join or detach
    /// all workers.
    fn pool_release(&mut self) {}
}

/// The channel through which worker threads hand finished (or cancelled) work
/// sources back to the loop thread.
///
/// `post()` transfers the reference that travelled with the job into the
/// queue and wakes the loop, so the handle is only ever dropped on the loop
/// thread during dispatch. This is the cross-thread half of the deferred
/// release design.
#[allow(missing_debug_implementations)]
pub struct CompletionQueue {
    queue: Mutex<VecDeque<SourceHandle>>,
    waker: Arc<dyn BackendWaker>,
}

impl CompletionQueue {
    pub(crate) fn new(waker: Arc<dyn BackendWaker>) -> Self {
        Self { queue: Mutex::new(VecDeque::new()), waker }
    }

    /// Posts a completed job and wakes the loop. Called from pool threads.
    pub fn post(&self, source: SourceHandle) {
        self.queue.lock_unpoisoned().push_back(source);
        self.waker.wake();
    }

    /// Number of completions waiting to be dispatched.
    #[must_use]
    pub fn len(&self) -> usize { self.queue.lock_unpoisoned().len() }

    /// Whether no completions are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Takes every pending completion. Called on the loop thread.
    pub(crate) fn drain(&self) -> VecDeque<SourceHandle> {
        std::mem::take(&mut *self.queue.lock_unpoisoned())
    }
}
