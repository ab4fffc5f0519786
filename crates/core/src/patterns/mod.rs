//! Resilience patterns and periodic behaviour attached to the kernel.
//!
//! Request patterns ([`Retry`], [`CircuitBreaker`]) are [`RequestListener`]s
//! attached to one instance and see every request that instance issues.
//! Periodic patterns run on a [`PeriodicSchedule`] independently of requests.
//!
//! [`RequestListener`]: crate::network::RequestListener

pub mod backoff;
pub mod circuit_breaker;
pub mod monitor;
pub mod periodic;
pub mod retry;
pub mod rolling_window;

pub use backoff::{ExponentialBackoff, JitteringExponentialBackoff, RetryStrategy};
pub use circuit_breaker::{CircuitBreaker, TargetState};
pub use monitor::UtilizationMonitor;
pub use periodic::{PeriodicId, PeriodicPattern, PeriodicSchedule};
pub use retry::Retry;
pub use rolling_window::{RollingWindow, Sample};
