//! Logical time for deterministic simulation.
//!
//! Simulated time is a monotonically increasing nanosecond counter that only the
//! scheduler advances. Nothing in the kernel reads the wall clock.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Abstraction over a clock readable by simulation components.
pub trait TimeSource: Clone + 'static {
    /// Returns the current time as nanoseconds since the start of the run.
    fn now_nanos(&self) -> u64;

    /// Returns the current time as a Duration since the start of the run.
    fn now(&self) -> Duration {
        Duration::from_nanos(self.now_nanos())
    }
}

/// Virtual time implementation for deterministic simulation.
///
/// Time only advances when explicitly stepped via `advance()` or `advance_to()`.
/// Clones share the same underlying clock.
#[derive(Clone, Debug)]
pub struct VirtualTime {
    current_nanos: Arc<AtomicU64>,
}

impl Default for VirtualTime {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTime {
    /// Creates a new virtual time starting at 0.
    pub fn new() -> Self {
        Self::with_initial_time(0)
    }

    /// Creates a new virtual time starting at the given nanoseconds.
    pub fn with_initial_time(nanos: u64) -> Self {
        Self {
            current_nanos: Arc::new(AtomicU64::new(nanos)),
        }
    }

    /// Advances time by the given duration.
    pub fn advance(&self, duration: Duration) {
        let delta = duration_to_nanos(duration);
        self.current_nanos.fetch_add(delta, Ordering::SeqCst);
    }

    /// Advances time to the given absolute nanoseconds.
    ///
    /// Never moves the clock backwards; earlier targets are ignored.
    pub fn advance_to(&self, target_nanos: u64) {
        self.current_nanos.fetch_max(target_nanos, Ordering::SeqCst);
    }
}

impl TimeSource for VirtualTime {
    fn now_nanos(&self) -> u64 {
        self.current_nanos.load(Ordering::SeqCst)
    }
}

/// Converts a duration to nanoseconds, saturating at `u64::MAX`.
pub(crate) fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
