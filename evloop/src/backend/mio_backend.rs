// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue EINTR eventfd

//! Reference [`Backend`] built on [`mio`] ([`epoll`] on Linux, [`kqueue`] on
//! macOS).
//!
//! The blocking point is [`mio::Poll::poll()`]; [`MioWaker`] wraps a
//! [`mio::Waker`] (an eventfd write on Linux), which is what makes
//! [`interrupt()`] safe to call from any thread and from OS signal handlers.
//! Fd watches are registered as raw [`SourceFd`]s under a [`Token`] derived
//! from the source id; the registration details are stashed in the source's
//! backend-data slot, which is reserved to backends by contract.
//!
//! mio reports readiness edge-triggered, so this backend advertises
//! [`BackendFlags::EDGE_TRIGGERED`]: embedders must drain an fd fully before
//! the next readiness report for it.
//!
//! Signal ops are declined; the core's own [signal bridge] handles signal
//! sources. Pool ops are provided through the default [`WorkerPool`].
//!
//! [`epoll`]: https://man7.org/linux/man-pages/man7/epoll.7.html
//! [`interrupt()`]: crate::EventLoop::interrupt
//! [`kqueue`]: https://man.freebsd.org/cgi/man.cgi?query=kqueue
//! [`mio::Poll::poll()`]: mio::Poll::poll
//! [`SourceFd`]: mio::unix::SourceFd
//! [`WorkerPool`]: crate::worker_pool
//! [signal bridge]: crate::event_loop::signal_bridge

use crate::{backend::{Backend, BackendFlags, BackendOp, BackendWaker, CompletionQueue,
                      EventSink},
            source::{EventMask, Revents, SourceHandle},
            worker_pool::WorkerPool};
use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use std::{collections::HashMap,
          io,
          os::fd::{AsRawFd, RawFd},
          sync::Arc,
          time::Duration};

/// Token reserved for the waker; source tokens are derived from ids, which
/// start at 1 and grow upward, so they can never collide with it.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Registration details the backend stashes in a source's backend-data slot.
///
/// `registered` tracks whether the fd is currently known to the OS primitive:
/// an fd watch with an empty event mask stays added to the backend but is not
/// registered until its mask becomes non-empty again.
#[derive(Debug, Clone, Copy)]
struct FdRegistration {
    token: Token,
    registered: bool,
}

/// Waker for [`MioBackend`]. See [`BackendWaker`] for the safety contract.
pub struct MioWaker(mio::Waker);

impl BackendWaker for MioWaker {
    fn wake(&self) {
        // Best effort, and callable from OS signal handlers: no logging here.
        drop(self.0.wake());
    }
}

impl std::fmt::Debug for MioWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioWaker").finish_non_exhaustive()
    }
}

/// The reference readiness backend. See the [module docs](self).
#[allow(missing_debug_implementations)]
pub struct MioBackend {
    poll: Poll,
    events: Events,
    waker: Arc<MioWaker>,
    fd_sources: HashMap<Token, SourceHandle>,
    pool: Option<WorkerPool>,
}

impl MioBackend {
    /// Creates the backend: one `mio::Poll` plus its coupled waker. Poll and
    /// waker must be created together, since the waker is bound to the poll's
    /// registry.
    ///
    /// # Errors
    ///
    /// Fails if the OS cannot create the polling primitive or the waker
    /// (typically fd exhaustion).
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(MioWaker(mio::Waker::new(poll.registry(), WAKER_TOKEN)?));
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            waker,
            fd_sources: HashMap::new(),
            pool: None,
        })
    }
}

fn interest_of(mask: EventMask) -> Option<Interest> {
    match (
        mask.contains(EventMask::READABLE),
        mask.contains(EventMask::WRITABLE),
    ) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn revents_of(event: &mio::event::Event) -> Revents {
    let mut revents = Revents::empty();
    if event.is_readable() {
        revents |= Revents::READABLE;
    }
    if event.is_writable() {
        revents |= Revents::WRITABLE;
    }
    if event.is_error() {
        revents |= Revents::ERROR;
    }
    if event.is_read_closed() || event.is_write_closed() {
        revents |= Revents::HANGUP;
    }
    revents
}

impl Backend for MioBackend {
    fn flags(&self) -> BackendFlags { BackendFlags::EDGE_TRIGGERED }

    fn waker(&self) -> Arc<dyn BackendWaker> {
        Arc::clone(&self.waker) as Arc<dyn BackendWaker>
    }

    fn pollable_fd(&self) -> Option<RawFd> { Some(self.poll.as_raw_fd()) }

    fn poll(
        &mut self,
        timeout: Option<Duration>,
        sink: &mut dyn EventSink,
    ) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // EINTR: syscall interrupted by a signal; the loop's dispatch will
            // pick the pending signal flags up, so report "no fd events".
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }

        let mut ready_count = 0;
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            // A watch deregistered in a previous cycle can still surface here
            // under edge-triggered coalescing; skip unknown tokens.
            let Some(source) = self.fd_sources.get(&event.token()) else {
                continue;
            };
            sink.ready(source, revents_of(event));
            ready_count += 1;
        }
        Ok(ready_count)
    }

    fn add_fd(&mut self, source: &SourceHandle) -> io::Result<()> {
        let fd = source.fd();
        let token = Token(source.id() as usize);
        let mask = source.event_mask().unwrap_or_default();

        let registered = match interest_of(mask) {
            Some(interest) => {
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), token, interest)?;
                true
            }
            None => false,
        };
        source.set_backend_data(FdRegistration { token, registered });
        self.fd_sources.insert(token, source.clone());
        tracing::debug!(fd, token = token.0, registered, "mio backend: add_fd");
        Ok(())
    }

    fn mod_fd(&mut self, source: &SourceHandle) -> io::Result<()> {
        let fd = source.fd();
        let mask = source.event_mask().unwrap_or_default();
        let Some(registration) =
            source.with_backend_data(|it: &FdRegistration| *it)
        else {
            return Err(io::Error::other("fd watch is not added to this backend"));
        };

        let registered = match (registration.registered, interest_of(mask)) {
            (true, Some(interest)) => {
                self.poll.registry().reregister(
                    &mut SourceFd(&fd),
                    registration.token,
                    interest,
                )?;
                true
            }
            (true, None) => {
                self.poll.registry().deregister(&mut SourceFd(&fd))?;
                false
            }
            (false, Some(interest)) => {
                self.poll.registry().register(
                    &mut SourceFd(&fd),
                    registration.token,
                    interest,
                )?;
                true
            }
            (false, None) => false,
        };
        source.set_backend_data(FdRegistration { registered, ..registration });
        Ok(())
    }

    fn del_fd(&mut self, source: &SourceHandle) -> io::Result<()> {
        let fd = source.fd();
        let Some(registration) =
            source.with_backend_data(|it: &FdRegistration| *it)
        else {
            return Err(io::Error::other("fd watch is not added to this backend"));
        };

        if registration.registered {
            self.poll.registry().deregister(&mut SourceFd(&fd))?;
        }
        self.fd_sources.remove(&registration.token);
        source.clear_backend_data();
        tracing::debug!(fd, token = registration.token.0, "mio backend: del_fd");
        Ok(())
    }

    fn pool_acquire(
        &mut self,
        workers: usize,
        completions: Arc<CompletionQueue>,
    ) -> BackendOp {
        let result = match &mut self.pool {
            Some(pool) => pool.ensure_capacity(workers),
            None => match WorkerPool::spawn(workers, completions) {
                Ok(pool) => {
                    self.pool = Some(pool);
                    Ok(())
                }
                Err(err) => Err(err),
            },
        };
        match result {
            Ok(()) => BackendOp::Done,
            Err(err) => BackendOp::Failed(err),
        }
    }

    fn pool_enqueue(&mut self, job: SourceHandle) -> BackendOp {
        match &self.pool {
            Some(pool) => match pool.enqueue(job) {
                Ok(()) => BackendOp::Done,
                Err(err) => BackendOp::Failed(err),
            },
            None => BackendOp::Declined,
        }
    }

    fn pool_release(&mut self) {
        // Dropping the pool joins every worker.
        self.pool = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    struct CollectingSink(Vec<(u64, Revents)>);

    impl EventSink for CollectingSink {
        fn ready(&mut self, source: &SourceHandle, revents: Revents) {
            self.0.push((source.id(), revents));
        }
    }

    #[test]
    fn pipe_readiness_reaches_the_sink() {
        let mut backend = MioBackend::new().expect("backend");
        let (read_end, write_end) = rustix::pipe::pipe().expect("pipe");

        let watch = SourceHandle::fd_watch(
            read_end.as_fd().as_raw_fd(),
            EventMask::READABLE,
            |_, _| {},
        );
        backend.add_fd(&watch).expect("add_fd");

        rustix::io::write(&write_end, b"x").expect("write");

        let mut sink = CollectingSink(Vec::new());
        let ready = backend
            .poll(Some(Duration::from_secs(2)), &mut sink)
            .expect("poll");
        assert_eq!(ready, 1);
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].0, watch.id());
        assert!(sink.0[0].1.contains(Revents::READABLE));

        backend.del_fd(&watch).expect("del_fd");
    }

    #[test]
    fn waker_unblocks_poll_without_reporting_events() {
        let mut backend = MioBackend::new().expect("backend");
        let waker = backend.waker();

        let waking_thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        let mut sink = CollectingSink(Vec::new());
        let started = std::time::Instant::now();
        let ready = backend
            .poll(Some(Duration::from_secs(5)), &mut sink)
            .expect("poll");
        assert_eq!(ready, 0);
        assert!(started.elapsed() < Duration::from_secs(5));
        waking_thread.join().expect("join");
    }

    #[test]
    fn empty_mask_defers_registration_until_mod_fd() {
        let mut backend = MioBackend::new().expect("backend");
        let (read_end, write_end) = rustix::pipe::pipe().expect("pipe");

        let watch = SourceHandle::fd_watch(
            read_end.as_fd().as_raw_fd(),
            EventMask::empty(),
            |_, _| {},
        );
        backend.add_fd(&watch).expect("add_fd");
        rustix::io::write(&write_end, b"x").expect("write");

        let mut sink = CollectingSink(Vec::new());
        let ready = backend
            .poll(Some(Duration::from_millis(50)), &mut sink)
            .expect("poll");
        assert_eq!(ready, 0, "unregistered fd must not report");

        watch.set_event_mask(EventMask::READABLE).expect("mask");
        backend.mod_fd(&watch).expect("mod_fd");
        let ready = backend
            .poll(Some(Duration::from_secs(2)), &mut sink)
            .expect("poll");
        assert_eq!(ready, 1);

        backend.del_fd(&watch).expect("del_fd");
    }
}
