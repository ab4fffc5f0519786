//! Deterministic request simulation for microservice architectures.
//!
//! An [`Architecture`] describes services, their operations and instances. A
//! [`Simulation`] moves requests through it on virtual time and lets
//! resilience patterns observe and steer every lifecycle step.

/// Services, operations and instances.
pub mod architecture;

/// Experiment configuration loaded from TOML.
pub mod config;

mod error;
pub use error::KernelError;

/// Tracing subscriber setup.
pub mod logging;

/// Requests, dependencies, listener hooks and the event loop driving them.
pub mod network;

/// Retry, circuit breaker and periodic patterns.
pub mod patterns;

/// Datapoints collected during a run.
pub mod reporting;

/// Deterministic simulation primitives: virtual time, RNG, scheduler and faults.
pub mod simulation;

/// User request generation.
pub mod workload;

pub use architecture::{Architecture, DelayDistribution, DependencyDescription};
pub use config::{ExperimentConfig, SimulationConfig};
pub use network::{RequestFailedReason, RequestId, RequestListener, SendTarget, Simulation};
pub use reporting::{RunReport, StatisticsObserver, StatisticsRecorder};
