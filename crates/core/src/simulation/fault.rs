//! Fault injection configuration for simulation testing.
//!
//! This module provides configuration for injecting various faults:
//! - Request failures at a target service (random, by rate)
//! - Extra latency on requests travelling to a service, during a time window
//! - Instance kills at a given logical time

use std::{collections::BTreeMap, time::Duration};

use crate::architecture::{InstanceId, ServiceId};

use super::{rng::SimulationRng, time::duration_to_nanos};

/// Extra latency added to every request sent to a service while active.
#[derive(Debug, Clone)]
pub struct LatencyInjection {
    /// Service whose incoming requests are delayed
    pub service: ServiceId,
    /// Delay added on top of the regular network latency
    pub extra: Duration,
    /// When the injection starts (virtual nanos)
    pub start_time: u64,
    /// When the injection ends (virtual nanos), None for permanent
    pub end_time: Option<u64>,
}

impl LatencyInjection {
    /// Creates a permanent latency injection starting at time zero.
    pub fn new(service: ServiceId, extra: Duration) -> Self {
        Self {
            service,
            extra,
            start_time: 0,
            end_time: None,
        }
    }

    /// Restricts the injection to `[start_time, start_time + duration)`.
    pub fn with_duration(mut self, start_time: u64, duration: Duration) -> Self {
        self.start_time = start_time;
        self.end_time = Some(start_time.saturating_add(duration_to_nanos(duration)));
        self
    }

    /// Checks whether the injection applies to `service` at the given time.
    pub fn applies(&self, service: ServiceId, current_time: u64) -> bool {
        if self.service != service || current_time < self.start_time {
            return false;
        }
        match self.end_time {
            Some(end) => current_time < end,
            None => true,
        }
    }
}

/// A scheduled instance kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceKill {
    pub instance: InstanceId,
    /// When the instance dies (virtual nanos)
    pub at: u64,
}

/// Configuration for fault injection during simulation.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability that a request arriving at a service fails (0.0 to 1.0).
    ///
    /// BTreeMap keeps iteration deterministic when configs are compared or logged.
    pub error_rates: BTreeMap<ServiceId, f64>,
    /// Active latency injections
    pub latency_injections: Vec<LatencyInjection>,
    /// Instances to kill, scheduled when the simulation starts
    pub instance_kills: Vec<InstanceKill>,
}

impl FaultConfig {
    /// Creates a new empty fault configuration (no faults).
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder for fluent configuration.
    pub fn builder() -> FaultConfigBuilder {
        FaultConfigBuilder::new()
    }

    /// Returns true if a request arriving at `service` should fail.
    ///
    /// Draws from the RNG only when a non-zero rate is configured, so adding a
    /// zero-rate entry does not perturb the random stream.
    pub fn should_fail(&self, service: ServiceId, rng: &SimulationRng) -> bool {
        match self.error_rates.get(&service) {
            Some(rate) if *rate > 0.0 => rng.gen_bool(*rate),
            _ => false,
        }
    }

    /// Total injected latency for a request to `service` at the given time.
    pub fn extra_latency(&self, service: ServiceId, current_time: u64) -> Duration {
        self.latency_injections
            .iter()
            .filter(|injection| injection.applies(service, current_time))
            .map(|injection| injection.extra)
            .sum()
    }

    /// Sets the error rate for a service.
    pub fn set_error_rate(&mut self, service: ServiceId, rate: f64) {
        self.error_rates.insert(service, rate.clamp(0.0, 1.0));
    }

    /// Adds a latency injection.
    pub fn add_latency_injection(&mut self, injection: LatencyInjection) {
        self.latency_injections.push(injection);
    }
}

/// Builder for creating FaultConfig with fluent API.
#[derive(Debug, Default)]
pub struct FaultConfigBuilder {
    config: FaultConfig,
}

impl FaultConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the error rate (0.0 to 1.0) for requests arriving at `service`.
    pub fn error_rate(mut self, service: ServiceId, rate: f64) -> Self {
        self.config.set_error_rate(service, rate);
        self
    }

    /// Adds a latency injection.
    pub fn latency_injection(mut self, injection: LatencyInjection) -> Self {
        self.config.latency_injections.push(injection);
        self
    }

    /// Kills `instance` at the given time.
    pub fn kill_instance(mut self, instance: InstanceId, at: u64) -> Self {
        self.config.instance_kills.push(InstanceKill { instance, at });
        self
    }

    /// Builds the FaultConfig.
    pub fn build(self) -> FaultConfig {
        self.config
    }
}
