// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words signo revents unref refcount

//! The event source object model: one reference-counted handle type over a
//! tagged sum of source kinds.
//!
//! # Source kinds
//!
//! | Kind        | Fires when                                    | Notes                                         |
//! | :---------- | :-------------------------------------------- | :-------------------------------------------- |
//! | [`FdWatch`] | The watched fd reports readiness              | The fd is *not* owned; closing it is on you   |
//! | [`Timer`]   | The duration elapses (once)                   | Stops itself before its callback runs         |
//! | [`Ticker`]  | Every period                                  | Re-armed to `expiry + period` before firing   |
//! | [`Signal`]  | The POSIX signal is delivered                 | Many handlers per signo are allowed           |
//! | [`Work`]    | The work fn (pool thread) has returned        | The callback is the *done* fn, on loop thread |
//! | [`Idle`]    | At the end of every dispatch cycle            | For as long as it stays started               |
//!
//! # Ownership model
//!
//! A [`SourceHandle`] is a cheap clone of an [`Arc`]: cloning takes a reference,
//! dropping releases one. While a source is started, the loop subsystem it is
//! registered with holds exactly one clone - that is the loop-owned reference
//! that [`EventLoop::stop()`] releases. A source never owns its loop; while
//! started it records the loop's *id* only, and resolves it late through the
//! [registry] when it must reach back (e.g. [`set_event_mask()`] on a started
//! fd watch).
//!
//! [`EventLoop::stop()`]: crate::EventLoop::stop
//! [`FdWatch`]: SourceKind::FdWatch
//! [`Idle`]: SourceKind::Idle
//! [`Signal`]: SourceKind::Signal
//! [`Ticker`]: SourceKind::Ticker
//! [`Timer`]: SourceKind::Timer
//! [`Work`]: SourceKind::Work
//! [`set_event_mask()`]: SourceHandle::set_event_mask
//! [registry]: super::registry

use crate::{error::{AccessError, StartError, StopError},
            event_loop::EventLoop,
            locking::LockUnpoisoned,
            source::{EventMask, ObjectId, Revents, registry}};
use std::{any::Any,
          fmt,
          os::fd::RawFd,
          sync::{Arc, Mutex, Weak,
                 atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering}},
          time::Duration};

/// Callback invoked on the loop thread when a source fires. For work sources
/// this is the *done* callback.
pub type SourceCallback = Box<dyn FnMut(&EventLoop, &SourceHandle) + Send + 'static>;

/// The blocking part of a work source; runs on a pool thread.
pub type WorkFn = Box<dyn FnMut(&SourceHandle) + Send + 'static>;

/// Discriminant of the source variants. See the [module docs](self).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    FdWatch,
    Timer,
    Ticker,
    Signal,
    Work,
    Idle,
}

/// Kind-specific payload. The common header lives in [`SourceInner`].
pub(crate) enum SourceState {
    FdWatch(FdWatchState),
    Timer(TimerState),
    Ticker(TimerState),
    Signal(SignalState),
    Work(WorkState),
    Idle,
}

impl SourceState {
    pub(crate) fn kind(&self) -> SourceKind {
        match self {
            Self::FdWatch(_) => SourceKind::FdWatch,
            Self::Timer(_) => SourceKind::Timer,
            Self::Ticker(_) => SourceKind::Ticker,
            Self::Signal(_) => SourceKind::Signal,
            Self::Work(_) => SourceKind::Work,
            Self::Idle => SourceKind::Idle,
        }
    }
}

pub(crate) struct FdWatchState {
    /// Borrowed, never closed by the loop.
    pub(crate) fd: RawFd,
    /// Requested readiness ([`EventMask`] bits).
    pub(crate) event_mask: AtomicU32,
    /// Observed readiness ([`Revents`] bits); non-zero only during the source's
    /// own callback.
    pub(crate) revents: AtomicU32,
    /// Set by `emit()`, consumed by dispatch. Atomics only, so `emit()` stays
    /// async-signal-safe for fd watches exactly as it is for signals.
    emit_pending: AtomicBool,
    /// [`Revents`] bits accumulated by `emit()` calls since the last dispatch.
    emitted_revents: AtomicU32,
}

pub(crate) struct TimerState {
    /// Relative duration (timer) or period (ticker). Mutable only while
    /// stopped.
    pub(crate) duration: Mutex<Duration>,
}

pub(crate) struct SignalState {
    pub(crate) signo: i32,
}

pub(crate) struct WorkState {
    pub(crate) work_fn: Mutex<Option<WorkFn>>,
    pub(crate) stage: Mutex<WorkStage>,
}

/// Work source progression. `stop()` moves any in-flight stage to `Cancelled`,
/// which suppresses both the work fn (if not yet picked up) and the done fn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkStage {
    Unscheduled,
    Queued,
    Running,
    Finished,
    Cancelled,
}

/// The common source header: id, kind payload, lifecycle, callback, data slots.
pub(crate) struct SourceInner {
    id: ObjectId,
    state: SourceState,
    /// Owning loop id while started, [`None`] while stopped.
    owner: Mutex<Option<ObjectId>>,
    /// Bumped on every start/stop. Timer-heap entries capture the value at
    /// insertion so stale entries can be detected and skipped.
    arm_seq: AtomicU64,
    callback: Mutex<Option<SourceCallback>>,
    userdata: Mutex<Option<Box<dyn Any + Send>>>,
    /// Reserved to backend implementations; user code must not touch it.
    backend_data: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Drop for SourceInner {
    fn drop(&mut self) { registry::unregister(self.id); }
}

/// A reference-counted handle to an event source. See the [module docs](self).
#[derive(Clone)]
pub struct SourceHandle {
    inner: Arc<SourceInner>,
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

/// A weak counterpart of [`SourceHandle`]: lets the loop track started fd
/// watches for emit scanning without holding a second loop-owned reference
/// (the single strong reference stays with the backend's registration).
pub(crate) struct WeakSource(Weak<SourceInner>);

impl WeakSource {
    pub(crate) fn upgrade(&self) -> Option<SourceHandle> {
        self.0.upgrade().map(SourceHandle::from_inner)
    }
}

// Factories.
impl SourceHandle {
    fn create(state: SourceState, callback: Option<SourceCallback>) -> Self {
        let id = registry::next_object_id();
        let inner = Arc::new(SourceInner {
            id,
            state,
            owner: Mutex::new(None),
            arm_seq: AtomicU64::new(0),
            callback: Mutex::new(callback),
            userdata: Mutex::new(None),
            backend_data: Mutex::new(None),
        });
        registry::register_source(id, &inner);
        Self { inner }
    }

    /// Creates an fd watch source. The fd is borrowed: the loop never closes
    /// it, and you must keep it open for as long as the source is started.
    pub fn fd_watch(
        fd: RawFd,
        event_mask: EventMask,
        callback: impl FnMut(&EventLoop, &SourceHandle) + Send + 'static,
    ) -> Self {
        Self::create(
            SourceState::FdWatch(FdWatchState {
                fd,
                event_mask: AtomicU32::new(event_mask.bits()),
                revents: AtomicU32::new(0),
                emit_pending: AtomicBool::new(false),
                emitted_revents: AtomicU32::new(0),
            }),
            Some(Box::new(callback)),
        )
    }

    /// Creates a one-shot timer. It stops itself immediately before its
    /// callback runs, so the callback may start it again for another shot.
    pub fn timer(
        duration: Duration,
        callback: impl FnMut(&EventLoop, &SourceHandle) + Send + 'static,
    ) -> Self {
        Self::create(
            SourceState::Timer(TimerState { duration: Mutex::new(duration) }),
            Some(Box::new(callback)),
        )
    }

    /// Creates a periodic ticker. It is re-armed to `expiry + period`
    /// immediately before each callback, so drift is bounded by dispatch
    /// latency and does not accumulate.
    pub fn ticker(
        period: Duration,
        callback: impl FnMut(&EventLoop, &SourceHandle) + Send + 'static,
    ) -> Self {
        Self::create(
            SourceState::Ticker(TimerState { duration: Mutex::new(period) }),
            Some(Box::new(callback)),
        )
    }

    /// Creates a signal handler source for `signo`. Multiple handlers for the
    /// same signal number may be started; all of them fire on each delivery.
    pub fn signal(
        signo: i32,
        callback: impl FnMut(&EventLoop, &SourceHandle) + Send + 'static,
    ) -> Self {
        Self::create(
            SourceState::Signal(SignalState { signo }),
            Some(Box::new(callback)),
        )
    }

    /// Creates a work source: `work_fn` runs on a pool thread, `done_fn` runs
    /// on the loop thread after `work_fn` has returned.
    pub fn work(
        work_fn: impl FnMut(&SourceHandle) + Send + 'static,
        done_fn: impl FnMut(&EventLoop, &SourceHandle) + Send + 'static,
    ) -> Self {
        Self::create(
            SourceState::Work(WorkState {
                work_fn: Mutex::new(Some(Box::new(work_fn))),
                stage: Mutex::new(WorkStage::Unscheduled),
            }),
            Some(Box::new(done_fn)),
        )
    }

    /// Creates an idle source, invoked at the end of every dispatch cycle for
    /// as long as it remains started.
    pub fn idle(
        callback: impl FnMut(&EventLoop, &SourceHandle) + Send + 'static,
    ) -> Self {
        Self::create(SourceState::Idle, Some(Box::new(callback)))
    }
}

// Generic accessors.
impl SourceHandle {
    /// The stable, process-unique id of this source. Valid for weak lookup via
    /// [`try_ref()`] until the final handle is dropped; never reused.
    ///
    /// [`try_ref()`]: Self::try_ref
    #[must_use]
    pub fn id(&self) -> ObjectId { self.inner.id }

    /// The kind tag of this source.
    #[must_use]
    pub fn kind(&self) -> SourceKind { self.inner.state.kind() }

    /// The current strong reference count. While started, exactly one of these
    /// is the loop-owned reference.
    #[must_use]
    pub fn ref_count(&self) -> usize { Arc::strong_count(&self.inner) }

    /// Whether this source is currently registered with a loop.
    #[must_use]
    pub fn is_started(&self) -> bool { self.inner.owner.lock_unpoisoned().is_some() }

    /// Resolves an id to a live source, taking a new strong reference.
    /// Returns [`None`] if the source has been released.
    #[must_use]
    pub fn try_ref(id: ObjectId) -> Option<Self> {
        registry::lookup_source(id).map(|inner| Self { inner })
    }

    /// Stores a user data value, replacing (and dropping) any previous one.
    pub fn set_userdata<T: Any + Send>(&self, value: T) {
        *self.inner.userdata.lock_unpoisoned() = Some(Box::new(value));
    }

    /// Borrows the user data as `T` for the duration of `f`. Returns [`None`]
    /// if no user data is set or it is not a `T`.
    pub fn with_userdata<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.inner.userdata.lock_unpoisoned();
        guard.as_ref().and_then(|it| it.downcast_ref::<T>()).map(f)
    }

    /// Removes and returns the user data if it is a `T`; leaves it in place
    /// otherwise.
    pub fn take_userdata<T: Any>(&self) -> Option<T> {
        let mut guard = self.inner.userdata.lock_unpoisoned();
        match guard.take() {
            Some(boxed) => match boxed.downcast::<T>() {
                Ok(value) => Some(*value),
                Err(other) => {
                    *guard = Some(other);
                    None
                }
            },
            None => None,
        }
    }

    /// Stores backend-private data. Reserved to [`Backend`] implementations;
    /// embedders use [`set_userdata()`] instead - the two slots are separate by
    /// contract.
    ///
    /// [`Backend`]: crate::backend::Backend
    /// [`set_userdata()`]: Self::set_userdata
    pub fn set_backend_data<T: Any + Send>(&self, value: T) {
        *self.inner.backend_data.lock_unpoisoned() = Some(Box::new(value));
    }

    /// Borrows the backend-private data as `T` for the duration of `f`.
    pub fn with_backend_data<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.inner.backend_data.lock_unpoisoned();
        guard.as_ref().and_then(|it| it.downcast_ref::<T>()).map(f)
    }

    /// Clears the backend-private data slot.
    pub fn clear_backend_data(&self) {
        *self.inner.backend_data.lock_unpoisoned() = None;
    }
}

// Kind-specific accessors. These check the tag and report misuse as
// [`AccessError::WrongKind`]; the one exception is `fd()`, which panics, per
// its contract.
impl SourceHandle {
    /// The watched file descriptor.
    ///
    /// # Panics
    ///
    /// Panics when called on anything but an fd watch source. Use
    /// [`EventLoop::pollable_fd()`] for the loop's own fd.
    ///
    /// [`EventLoop::pollable_fd()`]: crate::EventLoop::pollable_fd
    #[must_use]
    pub fn fd(&self) -> RawFd {
        match &self.inner.state {
            SourceState::FdWatch(state) => state.fd,
            other => panic!("fd() called on a {:?} source", other.kind()),
        }
    }

    /// The requested event mask of an fd watch source.
    ///
    /// # Errors
    ///
    /// [`AccessError::WrongKind`] for non-fd sources.
    pub fn event_mask(&self) -> Result<EventMask, AccessError> {
        match &self.inner.state {
            SourceState::FdWatch(state) => Ok(EventMask::from_bits_truncate(
                state.event_mask.load(Ordering::Acquire),
            )),
            other => Err(AccessError::WrongKind { actual: other.kind() }),
        }
    }

    /// Changes the requested event mask. If the source is started, the change
    /// is pushed to the owning loop's backend immediately (the loop is resolved
    /// through the id registry, never through a strong reference).
    ///
    /// # Errors
    ///
    /// [`AccessError::WrongKind`] for non-fd sources, [`AccessError::LoopGone`]
    /// if the owning loop has been released, [`AccessError::Backend`] if the
    /// backend rejects the re-registration.
    pub fn set_event_mask(&self, event_mask: EventMask) -> Result<(), AccessError> {
        let SourceState::FdWatch(state) = &self.inner.state else {
            return Err(AccessError::WrongKind { actual: self.kind() });
        };
        state.event_mask.store(event_mask.bits(), Ordering::Release);

        let Some(owner_id) = self.owner_id() else {
            return Ok(());
        };
        let owner =
            EventLoop::try_ref(owner_id).ok_or(AccessError::LoopGone)?;
        owner.update_fd_registration(self)
    }

    /// The readiness observed for this fd watch source. Only meaningful inside
    /// the source's own callback; empty everywhere else (and for other kinds).
    #[must_use]
    pub fn revents(&self) -> Revents {
        match &self.inner.state {
            SourceState::FdWatch(state) => {
                Revents::from_bits_truncate(state.revents.load(Ordering::Acquire))
            }
            _ => Revents::empty(),
        }
    }

    /// The duration of a timer, or the period of a ticker.
    ///
    /// # Errors
    ///
    /// [`AccessError::WrongKind`] for other kinds.
    pub fn duration(&self) -> Result<Duration, AccessError> {
        match &self.inner.state {
            SourceState::Timer(state) | SourceState::Ticker(state) => {
                Ok(*state.duration.lock_unpoisoned())
            }
            other => Err(AccessError::WrongKind { actual: other.kind() }),
        }
    }

    /// Changes the duration of a timer / period of a ticker. Legal only while
    /// stopped; a started timer keeps its computed expiry.
    ///
    /// # Errors
    ///
    /// [`AccessError::WrongKind`] for other kinds, [`AccessError::WhileStarted`]
    /// if the source is currently started.
    pub fn set_duration(&self, duration: Duration) -> Result<(), AccessError> {
        match &self.inner.state {
            SourceState::Timer(state) | SourceState::Ticker(state) => {
                if self.is_started() {
                    return Err(AccessError::WhileStarted);
                }
                *state.duration.lock_unpoisoned() = duration;
                Ok(())
            }
            other => Err(AccessError::WrongKind { actual: other.kind() }),
        }
    }

    /// The signal number of a signal handler source.
    ///
    /// # Errors
    ///
    /// [`AccessError::WrongKind`] for other kinds.
    pub fn signo(&self) -> Result<i32, AccessError> {
        match &self.inner.state {
            SourceState::Signal(state) => Ok(state.signo),
            other => Err(AccessError::WrongKind { actual: other.kind() }),
        }
    }
}

// Crate-internal lifecycle and dispatch plumbing.
impl SourceHandle {
    pub(crate) fn from_inner(inner: Arc<SourceInner>) -> Self { Self { inner } }

    pub(crate) fn state(&self) -> &SourceState { &self.inner.state }

    pub(crate) fn owner_id(&self) -> Option<ObjectId> {
        *self.inner.owner.lock_unpoisoned()
    }

    pub(crate) fn is_started_in(&self, loop_id: ObjectId) -> bool {
        self.owner_id() == Some(loop_id)
    }

    /// Marks the source started in `loop_id`. Fails if already started
    /// (anywhere - a source belongs to at most one loop).
    pub(crate) fn claim(&self, loop_id: ObjectId) -> Result<(), StartError> {
        let mut owner = self.inner.owner.lock_unpoisoned();
        if owner.is_some() {
            return Err(StartError::AlreadyStarted);
        }
        *owner = Some(loop_id);
        self.inner.arm_seq.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Marks the source stopped. Fails cleanly on the negative cases.
    pub(crate) fn release(&self, loop_id: ObjectId) -> Result<(), StopError> {
        let mut owner = self.inner.owner.lock_unpoisoned();
        match *owner {
            None => Err(StopError::NotStarted),
            Some(current) if current != loop_id => Err(StopError::ForeignLoop),
            Some(_) => {
                *owner = None;
                self.inner.arm_seq.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    /// Unconditional stop, for sources that stop themselves (one-shot timers
    /// before their callback, work sources after their done callback).
    pub(crate) fn force_release(&self) {
        *self.inner.owner.lock_unpoisoned() = None;
        self.inner.arm_seq.fetch_add(1, Ordering::SeqCst);
    }

    /// Loop-teardown variant of [`force_release()`](Self::force_release):
    /// only clears the started flag if `loop_id` still owns the source.
    pub(crate) fn release_if_owned(&self, loop_id: ObjectId) {
        let mut owner = self.inner.owner.lock_unpoisoned();
        if *owner == Some(loop_id) {
            *owner = None;
            self.inner.arm_seq.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Current arm sequence; captured by timer-heap entries for staleness
    /// detection.
    pub(crate) fn arm_token(&self) -> u64 { self.inner.arm_seq.load(Ordering::SeqCst) }

    /// Runs the source's callback on the loop thread. Not re-entrant for the
    /// same source: the callback slot is locked for the duration of the call.
    pub(crate) fn invoke(&self, event_loop: &EventLoop) {
        let mut slot = self.inner.callback.lock_unpoisoned();
        if let Some(callback) = slot.as_mut() {
            callback(event_loop, self);
        }
    }

    pub(crate) fn set_revents(&self, revents: Revents) {
        if let SourceState::FdWatch(state) = &self.inner.state {
            state.revents.store(revents.bits(), Ordering::Release);
        }
    }

    pub(crate) fn clear_revents(&self) {
        if let SourceState::FdWatch(state) = &self.inner.state {
            state.revents.store(0, Ordering::Release);
        }
    }

    // The emit flag pair below is the fd-watch twin of the signal bridge's
    // per-signo flags: nothing but atomic stores, so the public emit() keeps
    // its async-signal-safety for fd watches too.

    /// Marks this fd watch as emitted with `revents` folded in. Returns
    /// `false` (and does nothing) for other kinds.
    pub(crate) fn fd_emit(&self, revents: Revents) -> bool {
        let SourceState::FdWatch(state) = &self.inner.state else {
            return false;
        };
        state
            .emitted_revents
            .fetch_or(revents.bits(), Ordering::SeqCst);
        state.emit_pending.store(true, Ordering::SeqCst);
        true
    }

    /// Dispatch side: consumes the emit flag, returning the accumulated
    /// revents if one was pending.
    pub(crate) fn fd_take_emit(&self) -> Option<Revents> {
        let SourceState::FdWatch(state) = &self.inner.state else {
            return None;
        };
        if state.emit_pending.swap(false, Ordering::SeqCst) {
            Some(Revents::from_bits_truncate(
                state.emitted_revents.swap(0, Ordering::SeqCst),
            ))
        } else {
            None
        }
    }

    /// Whether an emitted event is waiting to be dispatched.
    pub(crate) fn fd_emit_pending(&self) -> bool {
        match &self.inner.state {
            SourceState::FdWatch(state) => state.emit_pending.load(Ordering::SeqCst),
            _ => false,
        }
    }

    /// A non-owning view for the loop's emit bookkeeping; never keeps the
    /// source alive.
    pub(crate) fn downgrade(&self) -> WeakSource {
        WeakSource(Arc::downgrade(&self.inner))
    }

    // Work stage machine. All transitions go through these so the cancellation
    // contract (stopped before pickup: nothing runs; stopped while running:
    // work completes, done suppressed) holds under any interleaving.

    pub(crate) fn work_mark_queued(&self) {
        if let SourceState::Work(state) = &self.inner.state {
            *state.stage.lock_unpoisoned() = WorkStage::Queued;
        }
    }

    /// Pool-thread side: atomically claims the job. Returns `false` if the
    /// source was cancelled before pickup, in which case the work fn must not
    /// run.
    pub(crate) fn work_try_begin(&self) -> bool {
        let SourceState::Work(state) = &self.inner.state else {
            return false;
        };
        let mut stage = state.stage.lock_unpoisoned();
        if *stage == WorkStage::Queued {
            *stage = WorkStage::Running;
            true
        } else {
            false
        }
    }

    /// Pool-thread side: records that the work fn returned. A concurrent stop
    /// leaves the stage at `Cancelled`, which suppresses the done fn later.
    pub(crate) fn work_finish(&self) {
        if let SourceState::Work(state) = &self.inner.state {
            let mut stage = state.stage.lock_unpoisoned();
            if *stage == WorkStage::Running {
                *stage = WorkStage::Finished;
            }
        }
    }

    /// Stop side: suppresses whatever has not happened yet.
    pub(crate) fn work_cancel(&self) {
        if let SourceState::Work(state) = &self.inner.state {
            *state.stage.lock_unpoisoned() = WorkStage::Cancelled;
        }
    }

    /// Dispatch side: consumes the completion. Returns `true` if the done fn
    /// should run.
    pub(crate) fn work_take_completion(&self) -> bool {
        let SourceState::Work(state) = &self.inner.state else {
            return false;
        };
        let mut stage = state.stage.lock_unpoisoned();
        match *stage {
            WorkStage::Finished => {
                *stage = WorkStage::Unscheduled;
                true
            }
            WorkStage::Cancelled => {
                *stage = WorkStage::Unscheduled;
                false
            }
            _ => false,
        }
    }

    /// Pool-thread side: runs the work fn.
    pub(crate) fn run_work_fn(&self) {
        if let SourceState::Work(state) = &self.inner.state {
            let mut slot = state.work_fn.lock_unpoisoned();
            if let Some(work_fn) = slot.as_mut() {
                work_fn(self);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn kind_tags_match_factories() {
        assert_eq!(SourceHandle::timer(Duration::ZERO, |_, _| {}).kind(), SourceKind::Timer);
        assert_eq!(SourceHandle::ticker(Duration::ZERO, |_, _| {}).kind(), SourceKind::Ticker);
        assert_eq!(SourceHandle::signal(10, |_, _| {}).kind(), SourceKind::Signal);
        assert_eq!(SourceHandle::idle(|_, _| {}).kind(), SourceKind::Idle);
        assert_eq!(SourceHandle::work(|_| {}, |_, _| {}).kind(), SourceKind::Work);
        assert_eq!(
            SourceHandle::fd_watch(0, EventMask::READABLE, |_, _| {}).kind(),
            SourceKind::FdWatch
        );
    }

    #[test]
    fn clone_and_drop_track_the_reference_count() {
        let source = SourceHandle::idle(|_, _| {});
        assert_eq!(source.ref_count(), 1);
        let extra = source.clone();
        assert_eq!(source.ref_count(), 2);
        drop(extra);
        assert_eq!(source.ref_count(), 1);
    }

    #[test]
    fn try_ref_resolves_live_and_reports_absence_after_release() {
        let source = SourceHandle::signal(12, |_, _| {});
        let id = source.id();

        let resolved = SourceHandle::try_ref(id).expect("source is alive");
        assert_eq!(resolved.id(), id);
        assert_eq!(source.ref_count(), 2);

        drop(resolved);
        drop(source);
        assert!(SourceHandle::try_ref(id).is_none());
    }

    #[test]
    fn userdata_round_trips_and_checks_types() {
        let source = SourceHandle::idle(|_, _| {});
        source.set_userdata(42_u64);
        assert_eq!(source.with_userdata(|it: &u64| *it), Some(42));
        assert_eq!(source.with_userdata(|it: &String| it.clone()), None);
        assert_eq!(source.take_userdata::<u64>(), Some(42));
        assert_eq!(source.take_userdata::<u64>(), None);
    }

    #[test]
    fn backend_data_is_a_separate_slot() {
        let source = SourceHandle::idle(|_, _| {});
        source.set_userdata("user");
        source.set_backend_data(7_usize);
        assert_eq!(source.with_userdata(|it: &&str| *it), Some("user"));
        assert_eq!(source.with_backend_data(|it: &usize| *it), Some(7));
        source.clear_backend_data();
        assert_eq!(source.with_backend_data(|it: &usize| *it), None);
    }

    #[test]
    #[should_panic(expected = "fd() called on a Timer source")]
    fn fd_on_a_timer_panics() {
        let _ = SourceHandle::timer(Duration::ZERO, |_, _| {}).fd();
    }

    #[test]
    fn wrong_kind_accessors_report_misuse() {
        let idle = SourceHandle::idle(|_, _| {});
        assert!(matches!(
            idle.event_mask(),
            Err(AccessError::WrongKind { actual: SourceKind::Idle })
        ));
        assert!(matches!(idle.signo(), Err(AccessError::WrongKind { .. })));
        assert!(matches!(
            idle.set_duration(Duration::from_millis(5)),
            Err(AccessError::WrongKind { .. })
        ));
        assert_eq!(idle.revents(), Revents::empty());
    }

    #[test]
    fn set_duration_applies_while_stopped() {
        let timer = SourceHandle::timer(Duration::from_millis(10), |_, _| {});
        timer.set_duration(Duration::from_millis(25)).expect("stopped");
        assert_eq!(timer.duration().expect("timer"), Duration::from_millis(25));
    }

    #[test]
    fn claim_is_exclusive_and_release_checks_the_owner() {
        let source = SourceHandle::idle(|_, _| {});
        source.claim(7).expect("first claim");
        assert!(matches!(source.claim(8), Err(StartError::AlreadyStarted)));
        assert!(matches!(source.release(8), Err(StopError::ForeignLoop)));
        source.release(7).expect("owner releases");
        assert!(matches!(source.release(7), Err(StopError::NotStarted)));
    }

    #[test]
    fn work_stage_cancellation_before_pickup_suppresses_everything() {
        let work = SourceHandle::work(|_| {}, |_, _| {});
        work.work_mark_queued();
        work.work_cancel();
        assert!(!work.work_try_begin());
        assert!(!work.work_take_completion());
    }

    #[test]
    fn work_stage_cancellation_while_running_suppresses_done() {
        let work = SourceHandle::work(|_| {}, |_, _| {});
        work.work_mark_queued();
        assert!(work.work_try_begin());
        work.work_cancel();
        work.work_finish();
        assert!(!work.work_take_completion());
    }

    #[test]
    fn fd_emit_flags_accumulate_and_consume_once() {
        let watch = SourceHandle::fd_watch(0, EventMask::READABLE, |_, _| {});
        assert!(!watch.fd_emit_pending());

        assert!(watch.fd_emit(Revents::READABLE));
        assert!(watch.fd_emit(Revents::HANGUP));
        assert!(watch.fd_emit_pending());

        assert_eq!(
            watch.fd_take_emit(),
            Some(Revents::READABLE | Revents::HANGUP)
        );
        assert!(!watch.fd_emit_pending());
        assert!(watch.fd_take_emit().is_none());

        let timer = SourceHandle::timer(Duration::ZERO, |_, _| {});
        assert!(!timer.fd_emit(Revents::READABLE));
        assert!(timer.fd_take_emit().is_none());
    }

    #[test]
    fn work_stage_normal_path_runs_done_once() {
        let work = SourceHandle::work(|_| {}, |_, _| {});
        work.work_mark_queued();
        assert!(work.work_try_begin());
        work.work_finish();
        assert!(work.work_take_completion());
        assert!(!work.work_take_completion());
    }
}
