//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use meshsim::{
    architecture::{InstanceId, OperationId, ServiceId},
    network::{priority, RequestFailedReason, RequestId, RequestListener, SendTarget, Simulation},
    Architecture, DelayDistribution, DependencyDescription, SimulationConfig,
};
use parking_lot::Mutex;

pub const MS: Duration = Duration::from_millis(1);

/// `frontend.index` (1 instance) calls `backend.work` (`backends` instances).
/// Every operation takes 1ms, every hop 1ms.
pub struct Chain {
    pub frontend: ServiceId,
    pub backend: ServiceId,
    pub index: OperationId,
    pub work: OperationId,
}

impl Chain {
    pub fn architecture(backends: usize) -> (Architecture, Self) {
        let mut arch = Architecture::new();
        let frontend = arch.add_service_with_instances("frontend", 1);
        let backend = arch.add_service_with_instances("backend", backends);
        let index = arch
            .add_operation(frontend, "index", MS)
            .expect("frontend exists");
        let work = arch
            .add_operation(backend, "work", MS)
            .expect("backend exists");
        arch.add_dependency(index, DependencyDescription::new(work))
            .expect("work exists");
        (
            arch,
            Self {
                frontend,
                backend,
                index,
                work,
            },
        )
    }

    pub fn simulation(seed: u64) -> (Simulation, Self) {
        let (arch, chain) = Self::architecture(1);
        let config = SimulationConfig {
            seed,
            network_latency: DelayDistribution::fixed(MS),
            ..Default::default()
        };
        (Simulation::new(arch, config), chain)
    }

    pub fn frontend_instance(&self, sim: &Simulation) -> InstanceId {
        sim.architecture()
            .service(self.frontend)
            .expect("frontend exists")
            .instances[0]
    }

    /// Issues a user request for `frontend.index`.
    pub fn submit(&self, sim: &mut Simulation) -> RequestId {
        let id = sim.create_user_request(self.index).expect("known operation");
        sim.send_request(id, SendTarget::Service(self.frontend), Duration::ZERO)
            .expect("fresh request");
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    Send(RequestId),
    Result(RequestId),
    Failed(RequestId, RequestFailedReason),
}

/// Low priority listener that writes down everything it is told.
#[derive(Clone, Default)]
pub struct RecordingListener {
    log: Arc<Mutex<Vec<Observed>>>,
}

impl RecordingListener {
    pub fn log(&self) -> Vec<Observed> {
        self.log.lock().clone()
    }

    pub fn sends(&self) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|o| matches!(o, Observed::Send(_)))
            .count()
    }

    pub fn failures_with(&self, reason: RequestFailedReason) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|o| matches!(o, Observed::Failed(_, r) if *r == reason))
            .count()
    }
}

impl RequestListener for RecordingListener {
    fn name(&self) -> &str {
        "recorder"
    }

    fn priority(&self) -> i32 {
        priority::VERY_LOW
    }

    fn on_request_send(&mut self, sim: &mut Simulation, request: RequestId) -> bool {
        if sim.request(request).is_ok_and(|r| !r.is_answer()) {
            self.log.lock().push(Observed::Send(request));
        }
        false
    }

    fn on_request_result_arrived_at_requester(
        &mut self,
        _sim: &mut Simulation,
        request: RequestId,
    ) -> bool {
        self.log.lock().push(Observed::Result(request));
        false
    }

    fn on_request_failed(
        &mut self,
        _sim: &mut Simulation,
        request: RequestId,
        reason: RequestFailedReason,
    ) -> bool {
        self.log.lock().push(Observed::Failed(request, reason));
        false
    }
}
