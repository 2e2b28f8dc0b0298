// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words signo revents epoll kqueue

//! The dispatch core: one loop thread multiplexing every source class.
//!
//! # The dispatch cycle
//!
//! One cycle proceeds in fixed order, and embedders may rely on it:
//!
//! ```text
//! 1. compute timeout   next timer expiry, clamped by the caller; 0 if any
//!                      idle source is started
//! 2. poll              Backend::poll() - the only blocking point
//! 3. fd readiness      set revents → callback → clear revents
//! 4. expired timers    re-read clock; tickers re-arm *before* their callback
//! 5. signals           per-signo flags swap-cleared, handlers fire in
//!                      registration order
//! 6. completed work    done callbacks for jobs the pool posted back
//! 7. idles             every started idle source, every cycle
//! 8. deferred releases destructors for references that crossed threads
//! ```
//!
//! [`poll()`] performs steps 1-2 and reports how many events are buffered;
//! [`dispatch()`] performs steps 3-8; [`run()`] alternates them until
//! [`exit()`].
//!
//! # Re-entrancy
//!
//! Callbacks run on the loop thread with no loop lock held, so they may
//! freely `start`, `stop`, create, release, [`emit()`], [`exit()`] or
//! [`interrupt()`] - including on themselves. Dispatch iterates snapshots and
//! re-checks started-ness immediately before each callback: a source stopped
//! mid-cycle will not fire later in the same cycle, and a source started
//! mid-cycle waits for the next cycle (except idles, which fire if started
//! before step 7). The one thing a callback must not do is call
//! [`dispatch()`] recursively.
//!
//! [`dispatch()`]: EventLoop::dispatch
//! [`emit()`]: EventLoop::emit
//! [`exit()`]: EventLoop::exit
//! [`interrupt()`]: EventLoop::interrupt
//! [`poll()`]: EventLoop::poll
//! [`run()`]: EventLoop::run

// Attach sources.
pub mod default_loop;
pub mod signal_bridge;
pub mod timer_heap;

// Re-export.
pub use default_loop::*;

#[cfg(test)]
mod tests;

use crate::{backend::{Backend, BackendFlags, BackendOp, BackendWaker, CompletionQueue,
                      EventSink, MioBackend},
            error::{AccessError, StartError, StopError, WorkerPoolError},
            locking::LockUnpoisoned,
            source::{ObjectId, Revents, SourceHandle,
                     handle::{SourceState, WeakSource},
                     registry}};
use signal_bridge::SignalBridge;
use smallvec::SmallVec;
use std::{collections::VecDeque,
          fmt, io,
          os::fd::RawFd,
          sync::{Arc, Mutex,
                 atomic::{AtomicBool, Ordering}},
          time::{Duration, Instant}};
use timer_heap::TimerHeap;

/// Outcome of one [`EventLoop::poll()`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// This many events are buffered; call [`EventLoop::dispatch()`].
    Ready(usize),
    /// The wait ended - timeout elapsed, or [`EventLoop::interrupt()`] - with
    /// nothing buffered.
    NoEvents,
}

/// How many pool threads [`EventLoop::require_workers()`] should secure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerDemand {
    /// One worker per logical CPU.
    OnePerCpu,
    /// At least this many workers (clamped to a minimum of one).
    AtLeast(usize),
}

/// Loop-private state, shared behind an [`Arc`] so the loop itself can be
/// weak-looked-up by id like any source.
pub(crate) struct LoopInner {
    id: ObjectId,
    backend: Mutex<Box<dyn Backend>>,
    backend_flags: BackendFlags,
    backend_pollable_fd: Option<RawFd>,
    /// Shared, lock-free interrupt path. Kept outside the backend mutex so
    /// `interrupt()` never contends with a blocked `poll()`.
    waker: Arc<dyn BackendWaker>,
    /// Ready fd events the backend buffered between poll and dispatch (step 3
    /// input). Events injected through `emit()` travel flag-style on the
    /// sources themselves instead, so `emit()` never touches this lock.
    pending_fd: Mutex<VecDeque<(SourceHandle, Revents)>>,
    /// Started fd watches in registration order, tracked weakly; scanned at
    /// step 3 for emit flags. The loop-owned strong reference lives in the
    /// backend's registration.
    fd_watches: Mutex<Vec<(ObjectId, WeakSource)>>,
    timers: Mutex<TimerHeap>,
    signals: SignalBridge,
    completions: Arc<CompletionQueue>,
    /// Started idle sources, registration order.
    idles: Mutex<Vec<SourceHandle>>,
    /// References whose release was routed to the loop thread (step 8).
    deferred: Mutex<Vec<SourceHandle>>,
    exit_requested: AtomicBool,
    pool_acquired: AtomicBool,
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        registry::unregister(self.id);
        let loop_id = self.id;

        // Best-effort: mark every source we still hold as stopped so stale
        // handles do not read as started against a dead loop.
        for entry in self.timers.lock_unpoisoned().drain() {
            entry.source.release_if_owned(loop_id);
        }
        for source in self.idles.lock_unpoisoned().drain(..) {
            source.release_if_owned(loop_id);
        }
        for source in self.signals.drain() {
            source.release_if_owned(loop_id);
        }
        for (source, _) in self.pending_fd.lock_unpoisoned().drain(..) {
            drop(source);
        }
        for (_, weak) in self.fd_watches.lock_unpoisoned().drain(..) {
            if let Some(source) = weak.upgrade() {
                source.release_if_owned(loop_id);
            }
        }
        for source in self.completions.drain() {
            source.release_if_owned(loop_id);
        }
        self.deferred.lock_unpoisoned().clear();

        // Joins the pool workers.
        self.backend.lock_unpoisoned().pool_release();
    }
}

/// Forwards backend readiness into the loop's pending-event buffer.
struct PendingSink<'a> {
    pending: &'a Mutex<VecDeque<(SourceHandle, Revents)>>,
}

impl EventSink for PendingSink<'_> {
    fn ready(&mut self, source: &SourceHandle, revents: Revents) {
        self.pending
            .lock_unpoisoned()
            .push_back((source.clone(), revents));
    }
}

/// A reference-counted handle to an event loop. See the [module docs](self).
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

// Construction and identity.
impl EventLoop {
    /// Creates a loop bound to `backend`.
    pub fn new(backend: impl Backend) -> Self {
        let waker = backend.waker();
        let backend_flags = backend.flags();
        let backend_pollable_fd = backend.pollable_fd();
        let id = registry::next_object_id();
        let inner = Arc::new(LoopInner {
            id,
            backend: Mutex::new(Box::new(backend)),
            backend_flags,
            backend_pollable_fd,
            waker: Arc::clone(&waker),
            pending_fd: Mutex::new(VecDeque::new()),
            fd_watches: Mutex::new(Vec::new()),
            timers: Mutex::new(TimerHeap::new()),
            signals: SignalBridge::new(Arc::clone(&waker)),
            completions: Arc::new(CompletionQueue::new(waker)),
            idles: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
            exit_requested: AtomicBool::new(false),
            pool_acquired: AtomicBool::new(false),
        });
        registry::register_loop(id, &inner);
        Self { inner }
    }

    /// Creates a loop bound to a fresh [`MioBackend`].
    ///
    /// # Errors
    ///
    /// Fails if the OS polling primitive cannot be created.
    pub fn with_default_backend() -> io::Result<Self> {
        Ok(Self::new(MioBackend::new()?))
    }

    pub(crate) fn from_inner(inner: Arc<LoopInner>) -> Self { Self { inner } }

    /// The loop's stable, process-unique id, sharing the id space with
    /// sources.
    #[must_use]
    pub fn id(&self) -> ObjectId { self.inner.id }

    /// The current strong reference count of the loop handle.
    #[must_use]
    pub fn ref_count(&self) -> usize { Arc::strong_count(&self.inner) }

    /// Resolves an id to a live loop, taking a new strong reference.
    #[must_use]
    pub fn try_ref(id: ObjectId) -> Option<Self> {
        registry::lookup_loop(id).map(Self::from_inner)
    }

    /// The backend's capability flags.
    #[must_use]
    pub fn backend_flags(&self) -> BackendFlags { self.inner.backend_flags }

    /// The backend's own pollable fd, readable whenever this loop has events.
    /// Register it in an outer loop to nest this one.
    #[must_use]
    pub fn pollable_fd(&self) -> Option<RawFd> { self.inner.backend_pollable_fd }
}

// Controls.
impl EventLoop {
    /// Steps 1-2 of the cycle: computes the effective timeout, blocks in the
    /// backend, and reports how many events (ready fds, expired timers,
    /// pending signals, completed work) are now buffered for [`dispatch()`].
    ///
    /// [`dispatch()`]: Self::dispatch
    ///
    /// # Errors
    ///
    /// A backend poll failure is returned as [`io::Error`]; the loop itself
    /// stays usable.
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<PollStatus> {
        let effective_timeout = self.next_timeout(timeout);
        {
            let mut backend = self.inner.backend.lock_unpoisoned();
            let mut sink = PendingSink { pending: &self.inner.pending_fd };
            backend.poll(effective_timeout, &mut sink)?;
        }
        let buffered = self.buffered_event_count();
        if buffered > 0 {
            Ok(PollStatus::Ready(buffered))
        } else {
            Ok(PollStatus::NoEvents)
        }
    }

    /// Steps 3-8 of the cycle. Safe to call with nothing buffered; idles still
    /// fire.
    pub fn dispatch(&self) {
        self.dispatch_ready_fds();
        self.dispatch_expired_timers();
        self.dispatch_signals();
        self.dispatch_completed_work();
        self.dispatch_idles();
        self.drain_deferred_releases();
    }

    /// Alternates [`poll()`] and [`dispatch()`] until [`exit()`] is called.
    /// The cycle in which `exit()` happens completes before control returns;
    /// pending events beyond that are not drained.
    ///
    /// [`dispatch()`]: Self::dispatch
    /// [`exit()`]: Self::exit
    /// [`poll()`]: Self::poll
    ///
    /// # Errors
    ///
    /// Propagates backend poll failures.
    pub fn run(&self) -> io::Result<()> {
        self.inner.exit_requested.store(false, Ordering::SeqCst);
        loop {
            self.poll(None)?;
            self.dispatch();
            if self.inner.exit_requested.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    /// Asks [`run()`] to return after the current cycle. Safe from any thread
    /// and from callbacks.
    ///
    /// [`run()`]: Self::run
    pub fn exit(&self) {
        self.inner.exit_requested.store(true, Ordering::SeqCst);
        self.interrupt();
    }

    /// Makes an in-progress [`poll()`] return promptly without claiming
    /// events. Safe from any thread and from OS signal handlers.
    ///
    /// [`poll()`]: Self::poll
    pub fn interrupt(&self) { self.inner.waker.wake(); }

    /// The lesser of `cap` and the time until the next timer expiry;
    /// [`Duration::ZERO`] whenever an idle source is started, [`None`] when
    /// nothing bounds the wait.
    #[must_use]
    pub fn next_timeout(&self, cap: Option<Duration>) -> Option<Duration> {
        if !self.inner.idles.lock_unpoisoned().is_empty() {
            return Some(Duration::ZERO);
        }
        let next_expiry = self.inner.timers.lock_unpoisoned().peek_next_expiry();
        let until_timer =
            next_expiry.map(|expiry| expiry.saturating_duration_since(Instant::now()));
        match (cap, until_timer) {
            (None, bound) => bound,
            (bound, None) => bound,
            (Some(a), Some(b)) => Some(a.min(b)),
        }
    }

    /// Schedules a source's callback for the next dispatch cycle, as if the
    /// event had arrived from the outside. `revents` is only meaningful for
    /// fd watches; pass [`Revents::empty()`] otherwise.
    ///
    /// Explicitly safe to call from an OS signal handler: for signal sources
    /// it sets the per-signo atomic flag, for fd watches it sets an emit flag
    /// on the source itself - atomic stores plus the waker's eventfd write,
    /// no allocation, no locks visible to normal code. Other kinds ignore
    /// `emit`.
    pub fn emit(&self, source: &SourceHandle, revents: Revents) {
        match source.state() {
            SourceState::Signal(state) => self.inner.signals.flags().raise(state.signo),
            SourceState::FdWatch(_) => {
                source.fd_emit(revents);
                self.inner.waker.wake();
            }
            _ => {
                tracing::debug!(id = source.id(), "emit ignored for this source kind");
            }
        }
    }

    /// Secures the backend's worker pool. Must be called before any work
    /// source is started; repeated calls may grow the pool but never shrink
    /// it.
    ///
    /// # Errors
    ///
    /// [`WorkerPoolError::Unsupported`] if the backend declines pool
    /// operations, [`WorkerPoolError::Spawn`] if thread creation fails.
    pub fn require_workers(&self, demand: WorkerDemand) -> Result<(), WorkerPoolError> {
        let workers = match demand {
            WorkerDemand::OnePerCpu => std::thread::available_parallelism()
                .map_or(1, std::num::NonZeroUsize::get),
            WorkerDemand::AtLeast(count) => count.max(1),
        };
        let op = self
            .inner
            .backend
            .lock_unpoisoned()
            .pool_acquire(workers, Arc::clone(&self.inner.completions));
        match op {
            BackendOp::Done => {
                self.inner.pool_acquired.store(true, Ordering::SeqCst);
                tracing::debug!(workers, "worker pool acquired");
                Ok(())
            }
            BackendOp::Declined => Err(WorkerPoolError::Unsupported),
            BackendOp::Failed(err) => Err(WorkerPoolError::Spawn(err)),
        }
    }
}

// Starting and stopping.
impl EventLoop {
    /// Registers `source` with this loop and takes the loop-owned reference.
    ///
    /// # Errors
    ///
    /// [`StartError::AlreadyStarted`] if the source is registered anywhere,
    /// plus kind-specific resource errors; see [`StartError`].
    pub fn start(&self, source: &SourceHandle) -> Result<(), StartError> {
        match source.state() {
            SourceState::FdWatch(_) => {
                source.claim(self.inner.id)?;
                let added = self.inner.backend.lock_unpoisoned().add_fd(source);
                if let Err(err) = added {
                    source.force_release();
                    return Err(StartError::Backend(err));
                }
                self.inner
                    .fd_watches
                    .lock_unpoisoned()
                    .push((source.id(), source.downgrade()));
            }
            SourceState::Timer(state) | SourceState::Ticker(state) => {
                source.claim(self.inner.id)?;
                let duration = *state.duration.lock_unpoisoned();
                let expiry = Instant::now() + duration;
                self.inner
                    .timers
                    .lock_unpoisoned()
                    .insert(source.clone(), expiry);
            }
            SourceState::Signal(state) => {
                source.claim(self.inner.id)?;
                let op = self.inner.backend.lock_unpoisoned().add_signal(source);
                let result = match op {
                    // The backend owns delivery; track for ordering only.
                    BackendOp::Done => {
                        self.inner.signals.add(state.signo, source, false)
                    }
                    // The common case: the core's own bridge installs the OS
                    // hook.
                    BackendOp::Declined => {
                        self.inner.signals.add(state.signo, source, true)
                    }
                    BackendOp::Failed(err) => Err(StartError::Backend(err)),
                };
                if let Err(err) = result {
                    source.force_release();
                    return Err(err);
                }
            }
            SourceState::Work(_) => {
                if !self.inner.pool_acquired.load(Ordering::SeqCst) {
                    return Err(StartError::NoWorkerPool);
                }
                source.claim(self.inner.id)?;
                source.work_mark_queued();
                let op = self
                    .inner
                    .backend
                    .lock_unpoisoned()
                    .pool_enqueue(source.clone());
                match op {
                    BackendOp::Done => {}
                    BackendOp::Declined => {
                        source.force_release();
                        return Err(StartError::NoWorkerPool);
                    }
                    BackendOp::Failed(err) => {
                        source.force_release();
                        return Err(StartError::Backend(err));
                    }
                }
            }
            SourceState::Idle => {
                source.claim(self.inner.id)?;
                self.inner.idles.lock_unpoisoned().push(source.clone());
            }
        }
        tracing::debug!(id = source.id(), kind = ?source.kind(), "source started");
        Ok(())
    }

    /// Deregisters `source` and releases the loop-owned reference. For work
    /// sources the release is deferred until the pool hands the in-flight
    /// reference back (step 6/8); everything it would still do is suppressed
    /// immediately.
    ///
    /// # Errors
    ///
    /// [`StopError::NotStarted`] or [`StopError::ForeignLoop`]; both negative
    /// cases fail cleanly without side effects.
    pub fn stop(&self, source: &SourceHandle) -> Result<(), StopError> {
        source.release(self.inner.id)?;
        match source.state() {
            SourceState::FdWatch(_) => {
                self.inner
                    .fd_watches
                    .lock_unpoisoned()
                    .retain(|(id, _)| *id != source.id());
                if let Err(err) = self.inner.backend.lock_unpoisoned().del_fd(source) {
                    tracing::warn!(
                        id = source.id(),
                        %err,
                        "backend del_fd failed for a stopped source"
                    );
                }
            }
            SourceState::Timer(_) | SourceState::Ticker(_) => {
                let removed = self.inner.timers.lock_unpoisoned().remove(source.id());
                drop(removed);
            }
            SourceState::Signal(state) => {
                drop(self.inner.backend.lock_unpoisoned().del_signal(source));
                let removed = self.inner.signals.remove(state.signo, source);
                drop(removed);
            }
            SourceState::Work(_) => {
                source.work_cancel();
            }
            SourceState::Idle => {
                self.inner
                    .idles
                    .lock_unpoisoned()
                    .retain(|it| it.id() != source.id());
            }
        }
        tracing::debug!(id = source.id(), kind = ?source.kind(), "source stopped");
        Ok(())
    }

    /// Pushes a changed event mask to the backend for a started fd watch.
    /// Reached from [`SourceHandle::set_event_mask()`] via weak id lookup.
    pub(crate) fn update_fd_registration(
        &self,
        source: &SourceHandle,
    ) -> Result<(), AccessError> {
        self.inner
            .backend
            .lock_unpoisoned()
            .mod_fd(source)
            .map_err(AccessError::Backend)
    }
}

// The dispatch cycle, steps 3-8. No loop lock is ever held while a callback
// runs; every step snapshots its inputs and re-checks started-ness right
// before invoking.
impl EventLoop {
    fn buffered_event_count(&self) -> usize {
        let now = Instant::now();
        let fd_events = self.inner.pending_fd.lock_unpoisoned().len();
        let emitted_events = self
            .inner
            .fd_watches
            .lock_unpoisoned()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .filter(|source| source.fd_emit_pending())
            .count();
        let timer_events = self.inner.timers.lock_unpoisoned().expired_count(now);
        let signal_events = self.inner.signals.pending_event_count();
        let work_events = self.inner.completions.len();
        fd_events + emitted_events + timer_events + signal_events + work_events
    }

    /// Step 3: fd readiness. Backend-reported events first, then events
    /// injected through `emit()` (consumed flag-style from the sources, in
    /// registration order).
    fn dispatch_ready_fds(&self) {
        let batch: Vec<(SourceHandle, Revents)> = {
            let mut pending = self.inner.pending_fd.lock_unpoisoned();
            pending.drain(..).collect()
        };
        for (source, revents) in batch {
            self.deliver_fd_event(&source, revents);
        }

        let emitted: Vec<(SourceHandle, Revents)> = {
            self.inner
                .fd_watches
                .lock_unpoisoned()
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .filter_map(|source| {
                    source.fd_take_emit().map(|revents| (source, revents))
                })
                .collect()
        };
        for (source, revents) in emitted {
            self.deliver_fd_event(&source, revents);
        }
    }

    fn deliver_fd_event(&self, source: &SourceHandle, revents: Revents) {
        if !source.is_started_in(self.inner.id) {
            return;
        }
        source.set_revents(revents);
        source.invoke(self);
        source.clear_revents();
    }

    /// Step 4: expired timers and tickers.
    fn dispatch_expired_timers(&self) {
        let now = Instant::now();
        // Collect the whole expired batch before invoking anything, so a
        // ticker re-armed into the past fires once per cycle, not in a spin.
        let batch = {
            let mut timers = self.inner.timers.lock_unpoisoned();
            let mut batch = Vec::new();
            while let Some(entry) = timers.pop_expired(now) {
                batch.push(entry);
            }
            batch
        };
        for entry in batch {
            let source = entry.source.clone();
            if !source.is_started_in(self.inner.id) {
                // Stopped by an earlier callback in this same cycle.
                continue;
            }
            match source.state() {
                SourceState::Ticker(state) => {
                    // Re-arm relative to the *scheduled* expiry, before the
                    // callback, so drift stays bounded by dispatch latency.
                    let period = *state.duration.lock_unpoisoned();
                    let next = entry.expiry + period;
                    self.inner
                        .timers
                        .lock_unpoisoned()
                        .insert(source.clone(), next);
                }
                SourceState::Timer(_) => {
                    // One-shot: stops itself before its callback runs.
                    source.force_release();
                }
                _ => {}
            }
            source.invoke(self);
        }
    }

    /// Step 5: signals flagged since the previous cycle.
    fn dispatch_signals(&self) {
        let snapshot = self.inner.signals.snapshot();
        for (signo, handlers) in snapshot {
            if !self.inner.signals.flags().take(signo) {
                continue;
            }
            for source in handlers {
                if source.is_started_in(self.inner.id) {
                    source.invoke(self);
                }
            }
        }
    }

    /// Step 6: work items whose worker posted completion.
    fn dispatch_completed_work(&self) {
        let batch = self.inner.completions.drain();
        for source in batch {
            if source.work_take_completion() {
                // Like one-shot timers: the source stops itself before the
                // done callback runs.
                source.force_release();
                source.invoke(self);
            } else {
                // Cancelled; release the travelling reference in step 8.
                self.inner.deferred.lock_unpoisoned().push(source);
            }
        }
    }

    /// Step 7: idles. The snapshot is taken here, so idles started earlier in
    /// this same cycle do fire.
    fn dispatch_idles(&self) {
        let snapshot: SmallVec<[SourceHandle; 8]> = {
            self.inner.idles.lock_unpoisoned().iter().cloned().collect()
        };
        for source in snapshot {
            if source.is_started_in(self.inner.id) {
                source.invoke(self);
            }
        }
    }

    /// Step 8: run destructors for references that crossed threads.
    fn drain_deferred_releases(&self) {
        let released = std::mem::take(&mut *self.inner.deferred.lock_unpoisoned());
        drop(released);
    }
}
