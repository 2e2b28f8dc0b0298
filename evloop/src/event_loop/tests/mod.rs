// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Scenario tests for the dispatch core, driven through the real
//! [`MioBackend`]: timers, tickers, fd readiness, signals, work offload, idle
//! sources, ordering, and re-entrancy.
//!
//! Signal tests are process-global by nature and run under
//! [`serial_test::serial`].
//!
//! [`MioBackend`]: crate::backend::MioBackend

mod fd_and_ordering;
mod id_lookup;
