//! Static description of the simulated system: services, their operations and
//! the instances that serve them.
//!
//! The orchestration layer only has to build an [`Architecture`] before the
//! request kernel is used; everything else about an instance (attached patterns,
//! whether it is still alive) is tracked here as well.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};

use crate::{error::KernelError, network::ListenerId, simulation::SimulationRng};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        pub struct $name(u32);

        impl $name {
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            pub fn as_u32(&self) -> u32 {
                self.0
            }

            fn index(&self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

entity_id!(
    /// Identifier of a [`Microservice`].
    ServiceId,
    "service"
);
entity_id!(
    /// Identifier of a [`MicroserviceInstance`].
    InstanceId,
    "instance"
);
entity_id!(
    /// Identifier of an [`Operation`].
    OperationId,
    "operation"
);

/// A delay drawn per request.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DelayDistribution {
    Fixed {
        #[serde_as(as = "DurationSecondsWithFrac<f64>")]
        value: Duration,
    },
    Uniform {
        #[serde_as(as = "DurationSecondsWithFrac<f64>")]
        min: Duration,
        #[serde_as(as = "DurationSecondsWithFrac<f64>")]
        max: Duration,
    },
}

impl DelayDistribution {
    pub fn fixed(value: Duration) -> Self {
        Self::Fixed { value }
    }

    pub fn uniform(min: Duration, max: Duration) -> Self {
        Self::Uniform { min, max }
    }

    pub fn sample(&self, rng: &SimulationRng) -> Duration {
        match self {
            Self::Fixed { value } => *value,
            Self::Uniform { min, max } => rng.gen_duration(*min..*max),
        }
    }
}

impl Default for DelayDistribution {
    fn default() -> Self {
        Self::fixed(Duration::ZERO)
    }
}

/// Reusable template for a dependency of an operation.
///
/// Every request executing the owning operation instantiates it as a
/// [`NetworkDependency`](crate::network::NetworkDependency).
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyDescription {
    pub target: OperationId,
    /// Replaces the network latency of requests for this dependency.
    pub custom_delay: Option<DelayDistribution>,
    /// Added on top of the network latency.
    pub extra_delay: Option<DelayDistribution>,
    /// Chance that a request actually needs this dependency.
    pub probability: f64,
}

impl DependencyDescription {
    pub fn new(target: OperationId) -> Self {
        Self {
            target,
            custom_delay: None,
            extra_delay: None,
            probability: 1.0,
        }
    }

    pub fn with_custom_delay(mut self, delay: DelayDistribution) -> Self {
        self.custom_delay = Some(delay);
        self
    }

    pub fn with_extra_delay(mut self, delay: DelayDistribution) -> Self {
        self.extra_delay = Some(delay);
        self
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn has_custom_delay(&self) -> bool {
        self.custom_delay.is_some()
    }

    pub fn next_custom_delay(&self, rng: &SimulationRng) -> Option<Duration> {
        self.custom_delay.as_ref().map(|d| d.sample(rng))
    }

    pub fn next_extra_delay(&self, rng: &SimulationRng) -> Duration {
        self.extra_delay
            .as_ref()
            .map_or(Duration::ZERO, |d| d.sample(rng))
    }
}

/// An endpoint offered by a microservice.
#[derive(Debug, Clone)]
pub struct Operation {
    pub id: OperationId,
    pub service: ServiceId,
    pub name: String,
    /// Processing time once all dependencies are satisfied.
    pub duration: Duration,
    pub dependencies: Vec<DependencyDescription>,
}

#[derive(Debug, Clone)]
pub struct Microservice {
    pub id: ServiceId,
    pub name: String,
    pub instances: Vec<InstanceId>,
    pub operations: Vec<OperationId>,
    next_instance: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    Running,
    ShutDown,
    Killed,
}

#[derive(Debug, Clone)]
pub struct MicroserviceInstance {
    pub id: InstanceId,
    pub service: ServiceId,
    pub name: String,
    pub state: InstanceState,
    /// Patterns attached to this instance, in attachment order.
    pub patterns: Vec<ListenerId>,
}

impl MicroserviceInstance {
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }
}

/// Services, operations and instances of one simulated system.
#[derive(Debug, Clone, Default)]
pub struct Architecture {
    services: Vec<Microservice>,
    operations: Vec<Operation>,
    instances: Vec<MicroserviceInstance>,
}

impl Architecture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(&mut self, name: impl Into<String>) -> ServiceId {
        let id = ServiceId::new(self.services.len() as u32);
        self.services.push(Microservice {
            id,
            name: name.into(),
            instances: Vec::new(),
            operations: Vec::new(),
            next_instance: 0,
        });
        id
    }

    /// Adds a service together with `instances` running instances.
    pub fn add_service_with_instances(
        &mut self,
        name: impl Into<String>,
        instances: usize,
    ) -> ServiceId {
        let id = self.add_service(name);
        for _ in 0..instances {
            self.push_instance(id);
        }
        id
    }

    pub fn add_instance(&mut self, service: ServiceId) -> Result<InstanceId, KernelError> {
        self.service(service)?;
        Ok(self.push_instance(service))
    }

    fn push_instance(&mut self, service: ServiceId) -> InstanceId {
        let id = InstanceId::new(self.instances.len() as u32);
        let svc = &mut self.services[service.index()];
        let name = format!("{}_{}", svc.name, svc.instances.len());
        svc.instances.push(id);
        self.instances.push(MicroserviceInstance {
            id,
            service,
            name,
            state: InstanceState::Running,
            patterns: Vec::new(),
        });
        id
    }

    pub fn add_operation(
        &mut self,
        service: ServiceId,
        name: impl Into<String>,
        duration: Duration,
    ) -> Result<OperationId, KernelError> {
        self.service(service)?;
        let id = OperationId::new(self.operations.len() as u32);
        self.operations.push(Operation {
            id,
            service,
            name: name.into(),
            duration,
            dependencies: Vec::new(),
        });
        self.services[service.index()].operations.push(id);
        Ok(id)
    }

    pub fn add_dependency(
        &mut self,
        operation: OperationId,
        dependency: DependencyDescription,
    ) -> Result<(), KernelError> {
        self.operation(dependency.target)?;
        self.operation_mut(operation)?.dependencies.push(dependency);
        Ok(())
    }

    pub fn service(&self, id: ServiceId) -> Result<&Microservice, KernelError> {
        self.services
            .get(id.index())
            .ok_or(KernelError::UnknownService(id))
    }

    pub fn services(&self) -> &[Microservice] {
        &self.services
    }

    pub fn service_by_name(&self, name: &str) -> Option<ServiceId> {
        self.services.iter().find(|s| s.name == name).map(|s| s.id)
    }

    pub fn operation(&self, id: OperationId) -> Result<&Operation, KernelError> {
        self.operations
            .get(id.index())
            .ok_or(KernelError::UnknownOperation(id))
    }

    fn operation_mut(&mut self, id: OperationId) -> Result<&mut Operation, KernelError> {
        self.operations
            .get_mut(id.index())
            .ok_or(KernelError::UnknownOperation(id))
    }

    pub fn operation_by_name(&self, service: ServiceId, name: &str) -> Option<OperationId> {
        let svc = self.services.get(service.index())?;
        svc.operations
            .iter()
            .copied()
            .find(|op| self.operations[op.index()].name == name)
    }

    pub fn instance(&self, id: InstanceId) -> Result<&MicroserviceInstance, KernelError> {
        self.instances
            .get(id.index())
            .ok_or(KernelError::UnknownInstance(id))
    }

    pub(crate) fn instance_mut(
        &mut self,
        id: InstanceId,
    ) -> Result<&mut MicroserviceInstance, KernelError> {
        self.instances
            .get_mut(id.index())
            .ok_or(KernelError::UnknownInstance(id))
    }

    pub fn instances(&self) -> &[MicroserviceInstance] {
        &self.instances
    }

    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances.iter().map(|i| i.id).collect()
    }

    pub fn is_instance_running(&self, id: InstanceId) -> bool {
        self.instance(id).is_ok_and(|i| i.is_running())
    }

    /// Picks the next running instance of `service`, round robin.
    pub(crate) fn next_running_instance(&mut self, service: ServiceId) -> Option<InstanceId> {
        let svc = self.services.get_mut(service.index())?;
        let count = svc.instances.len();
        for offset in 0..count {
            let slot = (svc.next_instance + offset) % count;
            let candidate = svc.instances[slot];
            if self.instances[candidate.index()].is_running() {
                svc.next_instance = (slot + 1) % count;
                return Some(candidate);
            }
        }
        None
    }
}
