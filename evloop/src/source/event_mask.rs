// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Readiness bit sets for fd watch sources: [`EventMask`] (requested) and
//! [`Revents`] (returned).

use bitflags::bitflags;

bitflags! {
    /// The readiness classes an fd watch source asks its backend to monitor.
    ///
    /// An empty mask is legal: the source stays registered with the loop but the
    /// backend reports nothing for it until the mask becomes non-empty again via
    /// [`set_event_mask()`].
    ///
    /// [`set_event_mask()`]: crate::SourceHandle::set_event_mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventMask: u32 {
        /// The fd has data to read (or a peer to accept).
        const READABLE = 1 << 0;
        /// The fd can be written without blocking.
        const WRITABLE = 1 << 1;
    }
}

bitflags! {
    /// The readiness actually observed for an fd watch source.
    ///
    /// Only valid from inside the source's own callback; outside of it the value
    /// is empty. Error and hangup conditions are always reported, whether or not
    /// they were asked for in the [`EventMask`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Revents: u32 {
        /// The fd has data to read.
        const READABLE = 1 << 0;
        /// The fd can be written without blocking.
        const WRITABLE = 1 << 1;
        /// The fd is in an error state.
        const ERROR = 1 << 2;
        /// The peer closed its end.
        const HANGUP = 1 << 3;
    }
}
