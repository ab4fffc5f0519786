//! Periodic utilization sampling.

use std::{collections::BTreeMap, ops::ControlFlow, sync::Arc};

use tracing::trace;

use crate::{
    architecture::ServiceId,
    network::Simulation,
    reporting::{Datapoint, StatisticsObserver},
};

use super::periodic::PeriodicPattern;

/// Reports, on every trigger, how many requests are in flight towards each
/// service. Answers are not counted.
pub struct UtilizationMonitor {
    observer: Arc<dyn StatisticsObserver>,
}

impl UtilizationMonitor {
    pub fn new(observer: Arc<dyn StatisticsObserver>) -> Self {
        Self { observer }
    }

    pub fn in_flight(sim: &Simulation) -> BTreeMap<ServiceId, usize> {
        let arch = sim.architecture();
        let mut counts: BTreeMap<ServiceId, usize> =
            arch.services().iter().map(|s| (s.id, 0)).collect();
        for request in sim.requests() {
            if request.is_answer() || !request.state().is_in_flight() {
                continue;
            }
            if let Ok(operation) = arch.operation(request.operation()) {
                *counts.entry(operation.service).or_default() += 1;
            }
        }
        counts
    }
}

impl PeriodicPattern for UtilizationMonitor {
    fn name(&self) -> &str {
        "utilization_monitor"
    }

    fn trigger(&mut self, sim: &mut Simulation) -> ControlFlow<()> {
        let now = sim.now_nanos();
        for (service, in_flight) in Self::in_flight(sim) {
            trace!(%service, in_flight, "Utilization");
            self.observer
                .record(now, Datapoint::Utilization { service, in_flight });
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        architecture::Architecture,
        config::SimulationConfig,
        network::SendTarget,
        patterns::periodic::PeriodicSchedule,
        reporting::StatisticsRecorder,
    };

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_counts_in_flight_per_service() {
        let mut arch = Architecture::new();
        let frontend = arch.add_service_with_instances("frontend", 1);
        let idle = arch.add_service_with_instances("idle", 1);
        let index = arch.add_operation(frontend, "index", 10 * MS).unwrap();
        let recorder = Arc::new(StatisticsRecorder::new());
        let mut sim = Simulation::new(arch, SimulationConfig::default())
            .with_observer(recorder.clone());
        for _ in 0..3 {
            let id = sim.create_user_request(index).unwrap();
            sim.send_request(id, SendTarget::Service(frontend), Duration::ZERO)
                .unwrap();
        }
        sim.register_periodic(
            UtilizationMonitor::new(recorder.clone()),
            PeriodicSchedule::every(5 * MS).until(5 * MS),
        );
        sim.run_until(6 * MS);

        let samples = recorder.select(|d| matches!(d, Datapoint::Utilization { .. }));
        let at_5ms: Vec<_> = samples
            .iter()
            .filter(|s| s.at == 5_000_000)
            .map(|s| s.datapoint.clone())
            .collect();
        assert_eq!(
            at_5ms,
            vec![
                Datapoint::Utilization {
                    service: frontend,
                    in_flight: 3
                },
                Datapoint::Utilization {
                    service: idle,
                    in_flight: 0
                },
            ]
        );
    }
}
