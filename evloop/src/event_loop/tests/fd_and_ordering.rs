// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words revents SIGUSR

//! Fd readiness and the fixed inter-class dispatch order.

use crate::{EventLoop, EventMask, Revents, SourceHandle};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::{os::fd::AsRawFd,
          sync::{Arc, Mutex},
          time::Duration};

type OrderLog = Arc<Mutex<Vec<&'static str>>>;

fn log(order: &OrderLog, what: &'static str) {
    order.lock().expect("test mutex").push(what);
}

#[test]
fn fd_readiness_beats_a_later_timer() {
    let event_loop = EventLoop::with_default_backend().expect("loop");
    let order: OrderLog = Arc::new(Mutex::new(Vec::new()));

    let (read_end, write_end) = rustix::pipe::pipe().expect("pipe");
    let raw_read = read_end.as_raw_fd();

    let order_in_fd = Arc::clone(&order);
    let seen_revents = Arc::new(Mutex::new(Revents::empty()));
    let seen_in_fd = Arc::clone(&seen_revents);
    let watch = SourceHandle::fd_watch(raw_read, EventMask::READABLE, move |_, source| {
        *seen_in_fd.lock().expect("test mutex") = source.revents();
        let mut buf = [0_u8; 16];
        drop(rustix::io::read(&read_end, &mut buf));
        log(&order_in_fd, "fd");
    });

    let order_in_timer = Arc::clone(&order);
    let timer = SourceHandle::timer(Duration::from_millis(100), move |ev, _| {
        log(&order_in_timer, "timer");
        ev.exit();
    });

    event_loop.start(&watch).expect("start watch");
    event_loop.start(&timer).expect("start timer");

    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        rustix::io::write(&write_end, b"x").expect("write");
    });

    event_loop.run().expect("run");
    writer.join().expect("join");

    assert_eq!(*order.lock().expect("test mutex"), vec!["fd", "timer"]);
    assert!(
        seen_revents
            .lock()
            .expect("test mutex")
            .contains(Revents::READABLE)
    );
    // Revents are only valid during the callback itself.
    assert_eq!(watch.revents(), Revents::empty());

    event_loop.stop(&watch).expect("stop watch");
}

#[test]
#[serial(signals)]
fn one_cycle_dispatches_fd_then_timer_then_signal_then_idle() {
    let event_loop = EventLoop::with_default_backend().expect("loop");
    let order: OrderLog = Arc::new(Mutex::new(Vec::new()));

    let (read_end, write_end) = rustix::pipe::pipe().expect("pipe");
    let raw_read = read_end.as_raw_fd();
    rustix::io::write(&write_end, b"x").expect("write");

    let order_in_fd = Arc::clone(&order);
    let watch = SourceHandle::fd_watch(raw_read, EventMask::READABLE, move |_, _| {
        let mut buf = [0_u8; 16];
        drop(rustix::io::read(&read_end, &mut buf));
        log(&order_in_fd, "fd");
    });

    let order_in_timer = Arc::clone(&order);
    let timer = SourceHandle::timer(Duration::ZERO, move |_, _| {
        log(&order_in_timer, "timer");
    });

    let order_in_signal = Arc::clone(&order);
    let signal = SourceHandle::signal(signal_hook::consts::SIGUSR2, move |_, _| {
        log(&order_in_signal, "signal");
    });

    let order_in_idle = Arc::clone(&order);
    let idle = SourceHandle::idle(move |_, _| {
        log(&order_in_idle, "idle");
    });

    event_loop.start(&watch).expect("start watch");
    event_loop.start(&timer).expect("start timer");
    event_loop.start(&signal).expect("start signal");
    event_loop.start(&idle).expect("start idle");

    // Schedule the signal the way an OS delivery would: flag + wake.
    event_loop.emit(&signal, Revents::empty());

    event_loop
        .poll(Some(Duration::from_millis(500)))
        .expect("poll");
    event_loop.dispatch();

    assert_eq!(
        *order.lock().expect("test mutex"),
        vec!["fd", "timer", "signal", "idle"]
    );

    event_loop.stop(&watch).expect("stop watch");
    event_loop.stop(&signal).expect("stop signal");
    event_loop.stop(&idle).expect("stop idle");
}

#[test]
fn a_watch_stopped_by_an_earlier_callback_does_not_fire_in_the_same_cycle() {
    let event_loop = EventLoop::with_default_backend().expect("loop");
    let order: OrderLog = Arc::new(Mutex::new(Vec::new()));

    // The pipes only provide valid fds to register; readiness is injected
    // through emit() below. Emitted events are consumed in registration
    // order, which makes the A-before-B ordering deterministic.
    let (read_a, _write_a) = rustix::pipe::pipe().expect("pipe a");
    let (read_b, _write_b) = rustix::pipe::pipe().expect("pipe b");

    let order_in_b = Arc::clone(&order);
    let watch_b = SourceHandle::fd_watch(read_b.as_raw_fd(), EventMask::READABLE, move |_, _| {
        log(&order_in_b, "b");
    });

    // A's callback stops B mid-cycle through a weak id lookup.
    let order_in_a = Arc::clone(&order);
    let watch_b_id = watch_b.id();
    let watch_a = SourceHandle::fd_watch(read_a.as_raw_fd(), EventMask::READABLE, move |ev, _| {
        log(&order_in_a, "a");
        let other = SourceHandle::try_ref(watch_b_id).expect("b is alive");
        ev.stop(&other).expect("stop b mid-cycle");
    });

    event_loop.start(&watch_a).expect("start a");
    event_loop.start(&watch_b).expect("start b");

    event_loop.emit(&watch_a, Revents::READABLE);
    event_loop.emit(&watch_b, Revents::READABLE);

    event_loop
        .poll(Some(Duration::from_millis(500)))
        .expect("poll");
    event_loop.dispatch();

    assert_eq!(*order.lock().expect("test mutex"), vec!["a"]);
    assert!(!watch_b.is_started());

    event_loop.stop(&watch_a).expect("stop a");
}

#[test]
fn an_idle_started_mid_cycle_fires_in_that_same_cycle() {
    let event_loop = EventLoop::with_default_backend().expect("loop");
    let order: OrderLog = Arc::new(Mutex::new(Vec::new()));

    let order_in_idle = Arc::clone(&order);
    let idle = SourceHandle::idle(move |ev, source| {
        log(&order_in_idle, "idle");
        ev.stop(source).expect("stop self");
    });

    let order_in_timer = Arc::clone(&order);
    let timer = SourceHandle::timer(Duration::ZERO, move |ev, _| {
        log(&order_in_timer, "timer");
        ev.start(&idle).expect("start idle from timer callback");
    });

    event_loop.start(&timer).expect("start timer");
    event_loop
        .poll(Some(Duration::from_millis(100)))
        .expect("poll");
    event_loop.dispatch();

    assert_eq!(*order.lock().expect("test mutex"), vec!["timer", "idle"]);
}
