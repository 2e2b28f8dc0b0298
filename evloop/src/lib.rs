// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue signo revents evloop

//! # r3bl_evloop
//!
//! An embeddable event-loop runtime: a single dispatch thread multiplexes fd
//! readiness, timers, tickers, POSIX signals, offloaded blocking work, and
//! idle callbacks, behind a pluggable readiness backend.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          EventLoop                               │
//! │                                                                  │
//! │  poll()  ──► Backend::poll() ── the only blocking point          │
//! │                 ▲         │                                      │
//! │    interrupt()──┘         └──► buffered events                   │
//! │    (any thread /                                                 │
//! │     signal handler)                                              │
//! │                                                                  │
//! │  dispatch() ──► fds → timers → signals → work-done → idles       │
//! │                 (fixed inter-class order, callbacks serialized   │
//! │                  on this one thread)                             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Sources and ownership
//!
//! Every event source is a [`SourceHandle`]: a cheap, reference-counted clone
//! with a stable 64-bit id. Starting a source registers it with a loop and
//! takes one loop-owned reference; stopping releases it. The id supports weak
//! lookup via [`SourceHandle::try_ref()`] / [`EventLoop::try_ref()`], which is
//! how callbacks reach the loop (or each other) without ownership cycles: the
//! loop owns started sources, sources never own the loop.
//!
//! # Backends
//!
//! The loop consumes any [`Backend`]; the crate ships [`MioBackend`] (epoll on
//! Linux, kqueue on macOS) with an eventfd-based waker, an optional worker
//! pool, and edge-triggered readiness reporting. Backends may also take over
//! signal delivery and thread-pool duties; where they decline, the core
//! provides its own [signal bridge] and reports pool operations as
//! unsupported.
//!
//! # Example
//!
//! ```no_run
//! use r3bl_evloop::{EventLoop, SourceHandle};
//! use std::time::Duration;
//!
//! # fn main() -> std::io::Result<()> {
//! let event_loop = EventLoop::with_default_backend()?;
//!
//! let timer = SourceHandle::timer(Duration::from_millis(50), |ev, _timer| {
//!     println!("tick");
//!     ev.exit();
//! });
//! event_loop.start(&timer).expect("timer is freshly created");
//!
//! event_loop.run()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Threading model
//!
//! All callbacks - including the done callbacks of work sources - run
//! serialized on the loop thread. The only cross-thread entry points are
//! handle clone/drop, [`EventLoop::interrupt()`], [`EventLoop::emit()`]
//! (async-signal-safe: atomic flags plus a waker write, for signal sources
//! and fd watches alike), the pool's completion posting, and the `try_ref`
//! lookups. Blocking work belongs on a work source, never in a callback.
//!
//! [`Backend`]: crate::backend::Backend
//! [`EventLoop::emit()`]: crate::EventLoop::emit
//! [`EventLoop::interrupt()`]: crate::EventLoop::interrupt
//! [`EventLoop::try_ref()`]: crate::EventLoop::try_ref
//! [`MioBackend`]: crate::backend::MioBackend
//! [`SourceHandle::try_ref()`]: crate::SourceHandle::try_ref
//! [signal bridge]: crate::event_loop::signal_bridge

// Attach sources.
pub mod backend;
pub mod error;
pub mod event_loop;
pub(crate) mod locking;
pub mod source;
pub(crate) mod worker_pool;

// Re-export.
pub use backend::*;
pub use error::*;
pub use event_loop::*;
pub use source::*;
