// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words signo evloop

//! Error types for the event loop and its sources.
//!
//! Each operation that can fail has its own error enum, so misuse (double-start,
//! stop-when-stopped, wrong-kind accessor) stays distinguishable from resource
//! failures (backend registration, pool exhaustion). Backend poll failures are
//! surfaced as plain [`std::io::Error`] from [`EventLoop::poll()`] without tearing
//! the loop down.
//!
//! [`EventLoop::poll()`]: crate::EventLoop::poll

use crate::source::SourceKind;

/// Errors from [`EventLoop::start()`].
///
/// | Variant             | Cause                                                  | Recoverable? |
/// | :------------------ | :----------------------------------------------------- | :----------- |
/// | [`AlreadyStarted`]  | The source is already registered with a loop           | Yes (misuse) |
/// | [`InvalidSignal`]   | Signal number outside the range the bridge can track   | Yes (misuse) |
/// | [`NoWorkerPool`]    | Work source started before [`require_workers()`]       | Yes (misuse) |
/// | [`Backend`]         | The backend rejected the fd registration               | Maybe        |
/// | [`SignalInstall`]   | Installing the OS-level signal hook failed             | Maybe        |
///
/// [`AlreadyStarted`]: Self::AlreadyStarted
/// [`Backend`]: Self::Backend
/// [`InvalidSignal`]: Self::InvalidSignal
/// [`NoWorkerPool`]: Self::NoWorkerPool
/// [`SignalInstall`]: Self::SignalInstall
/// [`require_workers()`]: crate::EventLoop::require_workers
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum StartError {
    /// The source is already started; a source can be registered with at most one
    /// loop at a time.
    #[error("source is already started")]
    #[diagnostic(
        code(r3bl_evloop::already_started),
        help(
            "A source can only be registered with one loop at a time. \
             Call stop() before starting it again."
        )
    )]
    AlreadyStarted,

    /// The signal number cannot be tracked by the signal bridge.
    #[error("signal number {signo} cannot be handled")]
    #[diagnostic(
        code(r3bl_evloop::invalid_signal),
        help(
            "Signal numbers must be in the platform range, and SIGKILL/SIGSTOP \
             cannot be caught by any process."
        )
    )]
    InvalidSignal {
        /// The rejected signal number.
        signo: i32,
    },

    /// A work source was started but no worker pool has been acquired.
    #[error("no worker pool has been acquired for this loop")]
    #[diagnostic(
        code(r3bl_evloop::no_worker_pool),
        help("Call require_workers() on the loop before starting work sources.")
    )]
    NoWorkerPool,

    /// The backend rejected the registration (fd add, pool enqueue).
    #[error("backend rejected the registration")]
    #[diagnostic(
        code(r3bl_evloop::backend_rejected),
        help(
            "Check OS resource limits - use `ulimit -n` for file descriptors, \
             and verify the fd is still open."
        )
    )]
    Backend(#[source] std::io::Error),

    /// Installing the process-wide signal hook failed.
    #[error("failed to install the OS signal hook")]
    #[diagnostic(code(r3bl_evloop::signal_install))]
    SignalInstall(#[source] std::io::Error),
}

/// Errors from [`EventLoop::stop()`].
///
/// [`EventLoop::stop()`]: crate::EventLoop::stop
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum StopError {
    /// The source is not started.
    #[error("source is not started")]
    #[diagnostic(
        code(r3bl_evloop::not_started),
        help("stop() on a stopped source fails cleanly; this is a no-op misuse.")
    )]
    NotStarted,

    /// The source is started, but in a different loop than the one asked to stop
    /// it.
    #[error("source is registered with a different loop")]
    #[diagnostic(code(r3bl_evloop::foreign_loop))]
    ForeignLoop,
}

/// Errors from kind-specific accessors ([`set_event_mask()`], [`set_duration()`],
/// [`signo()`], ...).
///
/// [`set_duration()`]: crate::SourceHandle::set_duration
/// [`set_event_mask()`]: crate::SourceHandle::set_event_mask
/// [`signo()`]: crate::SourceHandle::signo
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum AccessError {
    /// The operation does not apply to this source kind.
    #[error("operation does not apply to a {actual:?} source")]
    #[diagnostic(
        code(r3bl_evloop::wrong_kind),
        help("Check SourceHandle::kind() before calling kind-specific accessors.")
    )]
    WrongKind {
        /// The actual kind of the source the accessor was called on.
        actual: SourceKind,
    },

    /// The mutation is only legal while the source is stopped.
    #[error("source must be stopped for this operation")]
    #[diagnostic(
        code(r3bl_evloop::while_started),
        help("Durations can only be changed while the timer/ticker is stopped.")
    )]
    WhileStarted,

    /// The owning loop no longer exists, so the change cannot be pushed to its
    /// backend.
    #[error("the owning loop has been released")]
    #[diagnostic(code(r3bl_evloop::loop_gone))]
    LoopGone,

    /// The backend rejected the re-registration.
    #[error("backend rejected the update")]
    #[diagnostic(code(r3bl_evloop::backend_rejected))]
    Backend(#[source] std::io::Error),
}

/// Errors from [`EventLoop::require_workers()`].
///
/// [`EventLoop::require_workers()`]: crate::EventLoop::require_workers
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum WorkerPoolError {
    /// The backend does not provide thread-pool operations.
    #[error("backend does not provide a worker pool")]
    #[diagnostic(
        code(r3bl_evloop::pool_unsupported),
        help(
            "This backend declined the optional thread-pool operations; \
             work sources cannot be used with it."
        )
    )]
    Unsupported,

    /// Spawning pool threads failed.
    #[error("failed to spawn worker pool threads")]
    #[diagnostic(
        code(r3bl_evloop::pool_spawn),
        help(
            "The system may have reached its thread limit - \
             check `ulimit -u` for the per-user limit."
        )
    )]
    Spawn(#[source] std::io::Error),
}
