//! Deterministic simulation primitives.
//!
//! This module provides the infrastructure every simulated run is built on:
//!
//! - **VirtualTime**: logical clock that only advances when the scheduler steps
//! - **SimulationRng**: seeded RNG for all random decisions during simulation
//! - **Scheduler**: deterministic event queue, FIFO among equal timestamps
//! - **FaultConfig**: configuration for fault injection (errors, latency, kills)
//!
//! The request kernel in [`crate::network`] drives a `Scheduler` of its own
//! event type; nothing here knows about requests.

mod fault;
mod rng;
mod scheduler;
mod time;

pub use fault::{FaultConfig, FaultConfigBuilder, InstanceKill, LatencyInjection};
pub use rng::SimulationRng;
pub use scheduler::{Event, EventId, Scheduler, SchedulerConfig};
pub use time::{TimeSource, VirtualTime};

pub(crate) use time::duration_to_nanos;
