//! Experiment configuration.
//!
//! Everything is read from TOML. Durations are fractional seconds and keys are
//! camelCase; unset keys take their defaults. Patterns are configured per
//! service name and attached to every instance of that service:
//!
//! ```toml
//! [simulation]
//! seed = 7
//! requestTimeout = 2.0
//! networkLatency = { type = "uniform", min = 0.001, max = 0.003 }
//!
//! [services.frontend.retry]
//! maxTries = 3
//!
//! [services.frontend.circuitBreaker]
//! requestVolumeThreshold = 10
//! errorThresholdPercentage = 50.0
//!
//! [[load]]
//! service = "frontend"
//! operation = "index"
//! interval = 0.1
//! count = 100
//! ```

use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSecondsWithFrac};
use thiserror::Error;

use crate::{
    architecture::{Architecture, DelayDistribution, InstanceId, ServiceId},
    error::KernelError,
    network::Simulation,
    patterns::{
        circuit_breaker::CircuitBreaker, monitor::UtilizationMonitor, periodic::PeriodicSchedule,
        retry::Retry,
    },
    reporting::StatisticsObserver,
    simulation::{duration_to_nanos, FaultConfig, LatencyInjection},
    workload::IntervalLoadGenerator,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown service `{0}`")]
    UnknownService(String),
    #[error("service `{service}` has no operation `{operation}`")]
    UnknownOperation { service: String, operation: String },
    #[error("service `{service}` has no instance #{index}")]
    UnknownInstance { service: String, index: usize },
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// Kernel-wide settings of one run.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Latency of every hop unless a dependency overrides it.
    pub network_latency: DelayDistribution,
    /// Every non-answer request still in flight this long after its send fails.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub request_timeout: Option<Duration>,
    /// Event budget per `run_until`/`run_until_idle` call, 0 for unlimited.
    pub max_events: usize,
    /// Log every processed event at trace level.
    pub trace_events: bool,
    /// Keep processed events for replay comparison.
    pub record_events: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            network_latency: DelayDistribution::default(),
            request_timeout: None,
            max_events: 0,
            trace_events: false,
            record_events: false,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Window volume (and concurrent connections) above which the breaker
    /// may act.
    pub request_volume_threshold: u32,
    /// Failure percentage of the window above which the breaker opens.
    pub error_threshold_percentage: f64,
    /// Number of samples in the rolling window.
    pub rolling_window: usize,
    /// How long the breaker stays open.
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub sleep_window: Duration,
    /// Timeout armed on every request the breaker lets through.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            request_volume_threshold: u32::MAX,
            error_threshold_percentage: f64::INFINITY,
            rolling_window: 20,
            sleep_window: Duration::from_millis(500),
            timeout: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_tries: u32,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub base_backoff: Duration,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_tries: 5,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            jitter: true,
        }
    }
}

/// Patterns attached to every instance of one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ServicePatterns {
    pub retry: Option<RetryConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

/// User requests issued to one operation at a fixed interval.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoadConfig {
    pub service: String,
    pub operation: String,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub interval: Duration,
    #[serde(default)]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub start: Duration,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub stop: Option<Duration>,
    /// Total requests to issue. Unbounded when unset.
    #[serde(default)]
    pub count: Option<u64>,
}

impl LoadConfig {
    pub fn schedule(&self) -> PeriodicSchedule {
        PeriodicSchedule {
            start: self.start,
            period: self.interval,
            stop: self.stop,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LatencyConfig {
    pub service: String,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub extra: Duration,
    #[serde(default)]
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub start: Duration,
    /// Permanent when unset.
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub duration: Option<Duration>,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KillConfig {
    pub service: String,
    /// Index of the instance within its service.
    pub instance: usize,
    #[serde_as(as = "DurationSecondsWithFrac<f64>")]
    pub at: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct FaultsConfig {
    /// Probability that a request arriving at the service fails.
    pub error_rates: BTreeMap<String, f64>,
    pub latency: Vec<LatencyConfig>,
    pub kills: Vec<KillConfig>,
}

impl FaultsConfig {
    pub fn resolve(&self, architecture: &Architecture) -> Result<FaultConfig, ConfigError> {
        let mut builder = FaultConfig::builder();
        for (service, rate) in &self.error_rates {
            builder = builder.error_rate(service_id(architecture, service)?, *rate);
        }
        for latency in &self.latency {
            let mut injection =
                LatencyInjection::new(service_id(architecture, &latency.service)?, latency.extra);
            let start = duration_to_nanos(latency.start);
            injection.start_time = start;
            if let Some(duration) = latency.duration {
                injection = injection.with_duration(start, duration);
            }
            builder = builder.latency_injection(injection);
        }
        for kill in &self.kills {
            let instance = instance_id(architecture, &kill.service, kill.instance)?;
            builder = builder.kill_instance(instance, duration_to_nanos(kill.at));
        }
        Ok(builder.build())
    }
}

/// Everything needed to set up a run on top of an [`Architecture`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ExperimentConfig {
    pub simulation: SimulationConfig,
    pub services: BTreeMap<String, ServicePatterns>,
    pub load: Vec<LoadConfig>,
    pub faults: FaultsConfig,
    /// Utilization monitor schedule. No monitor when unset.
    pub monitor: Option<PeriodicSchedule>,
}

impl ExperimentConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "Loaded experiment configuration");
        Self::from_toml_str(&source)
    }

    /// Creates the simulation and wires patterns, faults, load and monitoring
    /// into it.
    pub fn build(
        &self,
        architecture: Architecture,
        observer: Arc<dyn StatisticsObserver>,
    ) -> Result<Simulation, ConfigError> {
        let faults = self.faults.resolve(&architecture)?;
        let mut sim = Simulation::new(architecture, self.simulation.clone())
            .with_faults(faults)
            .with_observer(observer);

        for (name, patterns) in &self.services {
            let service = service_id(sim.architecture(), name)?;
            let instances = sim.architecture().service(service)?.instances.clone();
            for instance in instances {
                attach_patterns(&mut sim, instance, patterns)?;
            }
        }

        for load in &self.load {
            let service = service_id(sim.architecture(), &load.service)?;
            let operation = sim
                .architecture()
                .operation_by_name(service, &load.operation)
                .ok_or_else(|| ConfigError::UnknownOperation {
                    service: load.service.clone(),
                    operation: load.operation.clone(),
                })?;
            sim.register_periodic(
                IntervalLoadGenerator::new(operation, load.count),
                load.schedule(),
            );
        }

        if let Some(schedule) = self.monitor {
            let monitor = UtilizationMonitor::new(sim.observer());
            sim.register_periodic(monitor, schedule);
        }
        Ok(sim)
    }
}

fn attach_patterns(
    sim: &mut Simulation,
    instance: InstanceId,
    patterns: &ServicePatterns,
) -> Result<(), ConfigError> {
    if let Some(config) = &patterns.retry {
        let rng = sim.rng().child_with_index(u64::from(instance.as_u32()));
        let retry = Retry::from_config(instance, config, rng, sim.observer());
        sim.attach_pattern(instance, retry)?;
    }
    if let Some(config) = &patterns.circuit_breaker {
        let breaker = CircuitBreaker::new(instance, config.clone(), sim.observer());
        sim.attach_pattern(instance, breaker)?;
    }
    Ok(())
}

fn service_id(architecture: &Architecture, name: &str) -> Result<ServiceId, ConfigError> {
    architecture
        .service_by_name(name)
        .ok_or_else(|| ConfigError::UnknownService(name.to_owned()))
}

fn instance_id(
    architecture: &Architecture,
    service: &str,
    index: usize,
) -> Result<InstanceId, ConfigError> {
    let id = service_id(architecture, service)?;
    architecture
        .service(id)?
        .instances
        .get(index)
        .copied()
        .ok_or_else(|| ConfigError::UnknownInstance {
            service: service.to_owned(),
            index,
        })
}
