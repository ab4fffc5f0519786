//! Load generation.
//!
//! A load generator is a periodic pattern issuing user requests; how often it
//! fires is up to its [`PeriodicSchedule`](crate::patterns::periodic::PeriodicSchedule).

use std::ops::ControlFlow;

use tracing::{debug, warn};

use crate::{
    architecture::OperationId,
    network::{SendTarget, Simulation},
    patterns::periodic::PeriodicPattern,
};

/// Sends one user request to `operation` per trigger, optionally stopping
/// after `count` requests.
#[derive(Debug)]
pub struct IntervalLoadGenerator {
    operation: OperationId,
    name: String,
    remaining: Option<u64>,
    issued: u64,
}

impl IntervalLoadGenerator {
    pub fn new(operation: OperationId, count: Option<u64>) -> Self {
        Self {
            operation,
            name: format!("load[{operation}]"),
            remaining: count,
            issued: 0,
        }
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }
}

impl PeriodicPattern for IntervalLoadGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn trigger(&mut self, sim: &mut Simulation) -> ControlFlow<()> {
        if self.remaining == Some(0) {
            return ControlFlow::Break(());
        }
        let service = match sim.architecture().operation(self.operation) {
            Ok(operation) => operation.service,
            Err(error) => {
                warn!(%error, "Load generator targets an unknown operation");
                return ControlFlow::Break(());
            }
        };
        let sent = sim.create_user_request(self.operation).and_then(|id| {
            sim.send_request(id, SendTarget::Service(service), std::time::Duration::ZERO)
        });
        if let Err(error) = sent {
            warn!(%error, "Could not issue user request");
            return ControlFlow::Break(());
        }
        self.issued += 1;

        match self.remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                if *remaining == 0 {
                    debug!(operation = %self.operation, issued = self.issued, "Load finished");
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            }
            None => ControlFlow::Continue(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        architecture::Architecture, config::SimulationConfig,
        patterns::periodic::PeriodicSchedule,
    };

    const MS: Duration = Duration::from_millis(1);

    fn sim() -> (Simulation, OperationId) {
        let mut arch = Architecture::new();
        let frontend = arch.add_service_with_instances("frontend", 2);
        let index = arch.add_operation(frontend, "index", MS).unwrap();
        (Simulation::new(arch, SimulationConfig::default()), index)
    }

    #[test]
    fn test_stops_after_count() {
        let (mut sim, index) = sim();
        let id = sim.register_periodic(
            IntervalLoadGenerator::new(index, Some(4)),
            PeriodicSchedule::every(10 * MS),
        );
        sim.run_until(Duration::from_secs(1));

        assert!(!sim.is_periodic_active(id));
        assert_eq!(sim.stats().user_requests, 4);
        assert_eq!(sim.outcomes().filter(|o| o.is_success()).count(), 4);
    }

    #[test]
    fn test_follows_schedule() {
        let (mut sim, index) = sim();
        sim.register_periodic(
            IntervalLoadGenerator::new(index, None),
            PeriodicSchedule::every(10 * MS)
                .starting_at(5 * MS)
                .until(35 * MS),
        );
        sim.run_until(Duration::from_secs(1));

        let issued: Vec<u64> = sim.outcomes().map(|o| o.issued_at).collect();
        assert_eq!(issued, vec![5_000_000, 15_000_000, 25_000_000, 35_000_000]);
    }
}
