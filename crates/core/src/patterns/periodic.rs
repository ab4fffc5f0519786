//! Recurring self-triggered patterns.
//!
//! A periodic pattern fires at `start`, then every `period`, for as long as the
//! trigger time does not pass `stop`.

use std::{fmt, ops::ControlFlow, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};

use crate::{network::Simulation, simulation::duration_to_nanos};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PeriodicId(u64);

impl PeriodicId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PeriodicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "periodic#{}", self.0)
    }
}

/// When a periodic pattern fires, in simulation time.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodicSchedule {
    #[serde(default)]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub start: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub period: Duration,
    /// Last time the pattern may fire. Unbounded when unset.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub stop: Option<Duration>,
}

impl PeriodicSchedule {
    pub fn every(period: Duration) -> Self {
        Self {
            start: Duration::ZERO,
            period,
            stop: None,
        }
    }

    pub fn starting_at(mut self, start: Duration) -> Self {
        self.start = start;
        self
    }

    pub fn until(mut self, stop: Duration) -> Self {
        self.stop = Some(stop);
        self
    }

    fn within(&self, at: u64) -> bool {
        self.stop.map_or(true, |stop| at <= duration_to_nanos(stop))
    }

    /// First trigger for a pattern registered at `now`. A start time in the
    /// past fires immediately.
    pub(crate) fn first_trigger(&self, now: u64) -> Option<u64> {
        let at = duration_to_nanos(self.start).max(now);
        self.within(at).then_some(at)
    }

    /// Trigger following the one that fired at `fired_at`. A zero period only
    /// ever fires once.
    pub(crate) fn next_trigger(&self, fired_at: u64) -> Option<u64> {
        if self.period.is_zero() {
            return None;
        }
        let at = fired_at.saturating_add(duration_to_nanos(self.period));
        self.within(at).then_some(at)
    }
}

pub trait PeriodicPattern {
    fn name(&self) -> &str;

    /// Called on every trigger. Returning `Break` stops the pattern.
    fn trigger(&mut self, sim: &mut Simulation) -> ControlFlow<()>;

    /// Called once when the pattern stops, for whatever reason.
    fn on_stop(&mut self, _sim: &mut Simulation) {}
}
