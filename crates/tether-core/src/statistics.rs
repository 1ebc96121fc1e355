//! Marshalling statistics.

use std::cell::Cell;

/// Per-runtime marshalling counters.
///
/// `boundary_to_native` counts argument slots pulled off the boundary stack,
/// `native_to_boundary` counts return slots pushed back, and `converts` is
/// the running total of both.
#[derive(Debug, Default)]
pub struct Statistics {
    converts: Cell<u64>,
    boundary_to_native: Cell<u64>,
    native_to_boundary: Cell<u64>,
}

/// A point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatisticsSnapshot {
    pub converts: u64,
    pub boundary_to_native: u64,
    pub native_to_boundary: u64,
}

impl Statistics {
    pub fn new() -> Statistics {
        Statistics::default()
    }

    pub fn note_pulls(&self, slots: u64) {
        self.boundary_to_native
            .set(self.boundary_to_native.get() + slots);
        self.converts.set(self.converts.get() + slots);
    }

    pub fn note_pushes(&self, slots: u64) {
        self.native_to_boundary
            .set(self.native_to_boundary.get() + slots);
        self.converts.set(self.converts.get() + slots);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            converts: self.converts.get(),
            boundary_to_native: self.boundary_to_native.get(),
            native_to_boundary: self.native_to_boundary.get(),
        }
    }
}
