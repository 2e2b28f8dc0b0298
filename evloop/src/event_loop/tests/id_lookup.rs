// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Breaking ownership cycles with weak ids: callbacks hold ids, not
//! references, and resolve them late via `try_ref`.

use crate::{EventLoop, SourceHandle};
use pretty_assertions::assert_eq;
use std::{sync::{Arc,
                 atomic::{AtomicUsize, Ordering}},
          time::Duration};

#[test]
fn a_source_holding_its_own_id_does_not_keep_itself_alive() {
    let invoked = Arc::new(AtomicUsize::new(0));
    let invoked_in_callback = Arc::clone(&invoked);

    let source = SourceHandle::idle(move |_, source| {
        // The callback resolves itself by id; the user data holds no
        // reference, so it cannot keep the source alive.
        let my_id = source
            .with_userdata(|id: &u64| *id)
            .expect("id stored as user data");
        assert!(SourceHandle::try_ref(my_id).is_some());
        invoked_in_callback.fetch_add(1, Ordering::SeqCst);
    });
    source.set_userdata(source.id());
    let id = source.id();
    assert_eq!(source.ref_count(), 1);

    // Release the source externally without ever starting it.
    drop(source);

    assert!(SourceHandle::try_ref(id).is_none(), "absence after final release");
    assert_eq!(invoked.load(Ordering::SeqCst), 0, "no callback ever ran");
}

#[test]
fn a_callback_reaches_its_loop_through_a_weak_id() {
    let event_loop = EventLoop::with_default_backend().expect("loop");
    let loop_id = event_loop.id();

    let timer = SourceHandle::timer(Duration::from_millis(5), move |_, _| {
        // Resolve the loop by id instead of capturing a strong handle.
        let resolved = EventLoop::try_ref(loop_id).expect("loop is alive");
        assert_eq!(resolved.id(), loop_id);
        resolved.exit();
    });

    event_loop.start(&timer).expect("start");
    event_loop.run().expect("run");
    assert_eq!(timer.ref_count(), 1);
}

#[test]
fn a_released_loop_reports_absence() {
    let event_loop = EventLoop::with_default_backend().expect("loop");
    let loop_id = event_loop.id();
    assert!(EventLoop::try_ref(loop_id).is_some());

    drop(event_loop);
    assert!(EventLoop::try_ref(loop_id).is_none());
}
