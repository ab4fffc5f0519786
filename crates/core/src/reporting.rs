//! Run-scoped statistics.
//!
//! Patterns receive an [`Arc<dyn StatisticsObserver>`] when they are built and
//! push [`Datapoint`]s into it. Nothing is global: two simulations never share
//! a recorder unless they are handed the same one.

use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    architecture::{InstanceId, ServiceId},
    network::{DependencyKey, NetworkStats, RootOutcome, Simulation},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Datapoint {
    /// State of one breaker towards one target, after an observation.
    CircuitBreaker {
        instance: InstanceId,
        target: ServiceId,
        open: bool,
        active_connections: u32,
        window_volume: usize,
        failure_percentage: f64,
    },
    /// A retry was scheduled after `delay_nanos`.
    RetryDelay {
        instance: InstanceId,
        dependency: DependencyKey,
        attempt: u32,
        delay_nanos: u64,
    },
    /// A dependency resolved after `attempts` sends.
    RetryResolved {
        instance: InstanceId,
        dependency: DependencyKey,
        attempts: u32,
    },
    /// Retry gave up on a dependency.
    RetryExhausted {
        instance: InstanceId,
        dependency: DependencyKey,
        attempts: u32,
    },
    /// Requests in flight towards a service.
    Utilization { service: ServiceId, in_flight: usize },
    RootOutcome(RootOutcome),
}

pub trait StatisticsObserver: Send + Sync {
    /// Records `datapoint`, observed at virtual time `at` (nanos).
    fn record(&self, at: u64, datapoint: Datapoint);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StatisticsObserver for NoopObserver {
    fn record(&self, _at: u64, _datapoint: Datapoint) {}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub at: u64,
    #[serde(flatten)]
    pub datapoint: Datapoint,
}

/// Keeps every datapoint in arrival order.
#[derive(Debug, Default)]
pub struct StatisticsRecorder {
    samples: Mutex<Vec<Sample>>,
}

impl StatisticsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    /// Samples for which `filter` holds.
    pub fn select(&self, filter: impl Fn(&Datapoint) -> bool) -> Vec<Sample> {
        self.samples
            .lock()
            .iter()
            .filter(|s| filter(&s.datapoint))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

impl StatisticsObserver for StatisticsRecorder {
    fn record(&self, at: u64, datapoint: Datapoint) {
        self.samples.lock().push(Sample { at, datapoint });
    }
}

/// Final statistics of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub seed: u64,
    pub end_time_nanos: u64,
    pub stats: NetworkStats,
    pub outcomes: Vec<RootOutcome>,
    pub samples: Vec<Sample>,
}

impl RunReport {
    pub fn new(sim: &Simulation, recorder: &StatisticsRecorder) -> Self {
        Self {
            seed: sim.config().seed,
            end_time_nanos: sim.now_nanos(),
            stats: sim.stats().clone(),
            outcomes: sim.outcomes().cloned().collect(),
            samples: recorder.snapshot(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let ok = self.outcomes.iter().filter(|o| o.is_success()).count();
        ok as f64 / self.outcomes.len() as f64
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{RequestFailedReason, RequestId, RootResult};
    use crate::architecture::OperationId;

    #[test]
    fn test_recorder_keeps_order() {
        let recorder = StatisticsRecorder::new();
        for (at, in_flight) in [(5, 1), (3, 2)] {
            recorder.record(
                at,
                Datapoint::Utilization {
                    service: ServiceId::new(0),
                    in_flight,
                },
            );
        }
        let ats: Vec<_> = recorder.snapshot().iter().map(|s| s.at).collect();
        assert_eq!(ats, vec![5, 3]);

        recorder.clear();
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_sample_json_shape() {
        let sample = Sample {
            at: 10,
            datapoint: Datapoint::RootOutcome(RootOutcome {
                request: RequestId::new(1),
                operation: OperationId::new(2),
                issued_at: 0,
                finished_at: 10,
                result: RootResult::Failed {
                    reason: RequestFailedReason::Timeout,
                },
            }),
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["at"], 10);
        assert_eq!(json["kind"], "root_outcome");
        assert_eq!(json["result"], "failed");
        assert_eq!(json["reason"], "Timeout");
    }
}
