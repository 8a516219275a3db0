// Copyright (c) The rdt-probe Authors
// SPDX-License-Identifier: Apache-2.0

//! A monotonic clock abstraction.
//!
//! The teacher crate's `clock::Clock` trait wraps an async timer; this crate
//! is thread-based (spec.md §5: "parallel threads with cooperative queues"),
//! so the analogous seam is a source of `Instant`s plus a blocking sleep,
//! swappable for a virtual clock in tests. Cadence computations use elapsed
//! time only, never wall clock (spec.md §4.4), which is why every caller
//! holds a `Timestamp` rather than reaching for `Instant::now()` itself.

use std::time::{Duration, Instant};

/// An opaque point in time, comparable only to other `Timestamp`s from the
/// same `Clock`.
pub type Timestamp = Instant;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;

    /// Blocks the calling thread until `deadline` or `shutdown` fires,
    /// whichever comes first. Implementors only need to be as precise as the
    /// probe's retry cadence requires.
    fn sleep(&self, duration: Duration);
}

/// The real wall-clock-adjacent clock used in production: `Instant` is
/// already monotonic, so this is a thin pass-through.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Instant::now()
    }

    #[inline]
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_under_load() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
