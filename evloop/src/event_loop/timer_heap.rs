// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Min-heap of pending timers and tickers, keyed by absolute expiry.
//!
//! Equal expiries fire in registration order (a monotonic insertion counter
//! breaks ties). Entries are invalidated lazily: each captures the source's
//! arm sequence at insertion, and an entry whose token no longer matches is
//! skipped and dropped during [`peek_next_expiry()`] / [`pop_expired()`].
//! [`remove()`] additionally evicts eagerly so a stop releases the loop-owned
//! reference right away instead of waiting for the next prune.
//!
//! Only [`peek_next_expiry()`] and [`pop_expired()`] are visible to the
//! dispatch core's cycle logic; everything else is lifecycle bookkeeping.
//!
//! [`peek_next_expiry()`]: TimerHeap::peek_next_expiry
//! [`pop_expired()`]: TimerHeap::pop_expired
//! [`remove()`]: TimerHeap::remove

use crate::source::{ObjectId, SourceHandle};
use std::{cmp::Ordering, collections::BinaryHeap, time::Instant};

/// One pending expiry. The held [`SourceHandle`] is the loop-owned reference
/// of the started timer/ticker.
pub(crate) struct TimerEntry {
    pub(crate) expiry: Instant,
    pub(crate) source: SourceHandle,
    insertion: u64,
    arm_token: u64,
}

impl TimerEntry {
    fn is_stale(&self) -> bool { self.arm_token != self.source.arm_token() }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry && self.insertion == other.insertion
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for TimerEntry {
    // Reversed: BinaryHeap is a max-heap, we want the earliest expiry (and,
    // among equals, the earliest insertion) on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .expiry
            .cmp(&self.expiry)
            .then_with(|| other.insertion.cmp(&self.insertion))
    }
}

pub(crate) struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    insertion_counter: u64,
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self { heap: BinaryHeap::new(), insertion_counter: 0 }
    }

    /// Inserts a pending expiry, capturing the source's current arm sequence.
    pub(crate) fn insert(&mut self, source: SourceHandle, expiry: Instant) {
        let insertion = self.insertion_counter;
        self.insertion_counter += 1;
        let arm_token = source.arm_token();
        self.heap.push(TimerEntry { expiry, source, insertion, arm_token });
    }

    /// Earliest live expiry, or [`None`] if the heap is (effectively) empty.
    /// Prunes stale entries from the top as a side effect.
    pub(crate) fn peek_next_expiry(&mut self) -> Option<Instant> {
        while self.heap.peek().is_some_and(TimerEntry::is_stale) {
            drop(self.heap.pop());
        }
        self.heap.peek().map(|entry| entry.expiry)
    }

    /// Pops the earliest live entry whose expiry is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimerEntry> {
        match self.peek_next_expiry() {
            Some(expiry) if expiry <= now => self.heap.pop(),
            _ => None,
        }
    }

    /// Eagerly evicts every entry of `source_id`, returning them so the caller
    /// can drop the held references outside the heap lock.
    pub(crate) fn remove(&mut self, source_id: ObjectId) -> Vec<TimerEntry> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.heap.len());
        for entry in std::mem::take(&mut self.heap) {
            if entry.source.id() == source_id {
                removed.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.heap = kept.into_iter().collect();
        removed
    }

    /// Number of live entries already expired at `now`. Used by `poll()` to
    /// report buffered events.
    pub(crate) fn expired_count(&self, now: Instant) -> usize {
        self.heap
            .iter()
            .filter(|entry| !entry.is_stale() && entry.expiry <= now)
            .count()
    }

    /// Drains everything, for loop teardown.
    pub(crate) fn drain(&mut self) -> Vec<TimerEntry> {
        std::mem::take(&mut self.heap).into_vec()
    }
}
