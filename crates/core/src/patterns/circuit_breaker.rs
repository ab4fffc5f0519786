//! Per-instance circuit breaker.
//!
//! One breaker watches every outgoing dependency request of its owner and keeps
//! a [`TargetState`] per downstream service. A breaker is either closed or
//! open; once `sleep_window` has passed since opening it is closed again with a
//! fresh window, there is no half-open probing.

use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, info, trace, warn};

use crate::{
    architecture::{InstanceId, ServiceId},
    config::CircuitBreakerConfig,
    network::{
        priority, DependencyKey, RequestFailedReason, RequestId, RequestListener, Requester,
        Simulation,
    },
    reporting::{Datapoint, StatisticsObserver},
    simulation::duration_to_nanos,
};

use super::rolling_window::{RollingWindow, Sample};

/// Breaker state towards one target service.
#[derive(Debug, Clone)]
pub struct TargetState {
    window: RollingWindow,
    active_connections: u32,
    opened_at: Option<u64>,
    sleep_window: u64,
}

impl TargetState {
    fn new(rolling_window: usize, sleep_window: u64) -> Self {
        Self {
            window: RollingWindow::new(rolling_window),
            active_connections: 0,
            opened_at: None,
            sleep_window,
        }
    }

    /// Whether the breaker blocks calls at `now`. The window itself is only
    /// reset on the next send.
    pub fn is_open(&self, now: u64) -> bool {
        self.opened_at
            .is_some_and(|opened| now.saturating_sub(opened) < self.sleep_window)
    }

    /// Virtual time the breaker last opened at, if it has not been closed since.
    pub fn opened_at(&self) -> Option<u64> {
        self.opened_at
    }

    pub fn window(&self) -> &RollingWindow {
        &self.window
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections
    }
}

pub struct CircuitBreaker {
    owner: InstanceId,
    name: String,
    config: CircuitBreakerConfig,
    states: BTreeMap<ServiceId, TargetState>,
    /// Attempt currently counted as connection per dependency.
    active: BTreeMap<DependencyKey, (RequestId, ServiceId)>,
    observer: Arc<dyn StatisticsObserver>,
}

impl CircuitBreaker {
    pub fn new(
        owner: InstanceId,
        config: CircuitBreakerConfig,
        observer: Arc<dyn StatisticsObserver>,
    ) -> Self {
        Self {
            owner,
            name: format!("circuit_breaker[{owner}]"),
            config,
            states: BTreeMap::new(),
            active: BTreeMap::new(),
            observer,
        }
    }

    pub fn state(&self, target: ServiceId) -> Option<&TargetState> {
        self.states.get(&target)
    }

    fn state_mut(&mut self, target: ServiceId) -> &mut TargetState {
        let window = self.config.rolling_window;
        let sleep = duration_to_nanos(self.config.sleep_window);
        self.states
            .entry(target)
            .or_insert_with(|| TargetState::new(window, sleep))
    }

    /// Whether calls to `target` are currently blocked. Closes the breaker
    /// when its sleep window has passed.
    pub fn is_open(&mut self, target: ServiceId, now: u64) -> bool {
        let Some(state) = self.states.get_mut(&target) else {
            return false;
        };
        if state.is_open(now) {
            return true;
        }
        if state.opened_at.take().is_some() {
            state.window.clear();
            info!(instance = %self.owner, %target, "Circuit closed after sleep window");
        }
        false
    }

    /// Adds `sample` to the window towards `target`. The breaker opens once the
    /// volume is strictly above the threshold and so is the failure percentage.
    fn record(&mut self, target: ServiceId, sample: Sample, now: u64) {
        let threshold = self.config.request_volume_threshold as usize;
        let max_failures = self.config.error_threshold_percentage;
        let owner = self.owner;
        let state = self.state_mut(target);
        state.window.record(sample);
        if state.opened_at.is_none()
            && state.window.volume() > threshold
            && state.window.failure_percentage() > max_failures
        {
            state.opened_at = Some(now);
            info!(
                instance = %owner,
                %target,
                volume = state.window.volume(),
                failure_percentage = state.window.failure_percentage(),
                "Circuit opened"
            );
        }
    }

    /// Stops counting the attempt tracked for `key` as active connection.
    fn release(&mut self, key: DependencyKey) -> Option<(RequestId, ServiceId)> {
        let (request, target) = self.active.remove(&key)?;
        if let Some(state) = self.states.get_mut(&target) {
            state.active_connections = state.active_connections.saturating_sub(1);
        }
        Some((request, target))
    }

    fn emit(&self, target: ServiceId, now: u64) {
        let Some(state) = self.states.get(&target) else {
            return;
        };
        self.observer.record(
            now,
            Datapoint::CircuitBreaker {
                instance: self.owner,
                target,
                open: state.is_open(now),
                active_connections: state.active_connections,
                window_volume: state.window.volume(),
                failure_percentage: state.window.failure_percentage(),
            },
        );
    }

    /// Dependency and target of `request` if it is an outgoing request of the
    /// owner.
    fn watched(&self, sim: &Simulation, request: RequestId) -> Option<(DependencyKey, ServiceId)> {
        let req = sim.request(request).ok()?;
        if !req.is_internal() || req.requester() != Requester::Instance(self.owner) {
            return None;
        }
        let dep = sim.related_dependency(request).ok()?;
        Some((dep.key(), dep.target_service()))
    }
}

impl RequestListener for CircuitBreaker {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        priority::HIGH
    }

    fn on_request_send(&mut self, sim: &mut Simulation, request: RequestId) -> bool {
        let Some((key, target)) = self.watched(sim, request) else {
            return false;
        };
        let now = sim.now_nanos();

        // The previous attempt was superseded without this breaker seeing it fail.
        if self.active.get(&key).is_some_and(|(r, _)| *r != request) {
            if let Some((previous, previous_target)) = self.release(key) {
                trace!(%previous, "Retiring superseded attempt");
                self.record(previous_target, Sample::Failure, now);
            }
        }

        if self.is_open(target, now) {
            debug!(%request, %target, "Circuit open, canceling request");
            self.emit(target, now);
            if let Err(error) = sim.cancel_request(request, RequestFailedReason::CircuitIsOpen) {
                warn!(%error, "Could not cancel request");
            }
            return true;
        }

        let threshold = self.config.request_volume_threshold;
        let state = self.state_mut(target);
        state.active_connections += 1;
        let active_connections = state.active_connections;
        self.active.insert(key, (request, target));

        if active_connections > threshold {
            debug!(%request, %target, active_connections, "Connection volume limit reached");
            self.release(key);
            self.record(target, Sample::Failure, now);
            self.emit(target, now);
            if let Err(error) =
                sim.fail_request(request, RequestFailedReason::ConnectionVolumeLimitReached)
            {
                warn!(%error, "Could not fail request");
            }
            return true;
        }

        if let Some(timeout) = self.config.timeout {
            if let Err(error) = sim.arm_timeout(request, timeout) {
                warn!(%error, "Could not arm timeout");
            }
        }
        self.emit(target, now);
        false
    }

    fn on_request_arrival_at_target(&mut self, sim: &mut Simulation, request: RequestId) -> bool {
        if let Some((_, target)) = self.watched(sim, request) {
            self.emit(target, sim.now_nanos());
        }
        false
    }

    fn on_request_result_arrived_at_requester(
        &mut self,
        sim: &mut Simulation,
        request: RequestId,
    ) -> bool {
        let Some((key, target)) = self.watched(sim, request) else {
            return false;
        };
        if self.active.get(&key).is_some_and(|(r, _)| *r == request) {
            self.release(key);
            self.record(target, Sample::Success, sim.now_nanos());
        }
        self.emit(target, sim.now_nanos());
        false
    }

    fn on_request_failed(
        &mut self,
        sim: &mut Simulation,
        request: RequestId,
        reason: RequestFailedReason,
    ) -> bool {
        let Some((key, target)) = self.watched(sim, request) else {
            return false;
        };
        let current = sim
            .related_dependency(request)
            .is_ok_and(|d| d.is_current_child(request));
        if !current {
            return false;
        }
        if self.active.get(&key).is_some_and(|(r, _)| *r == request) {
            trace!(%request, %reason, "Recording failure");
            self.release(key);
            self.record(target, Sample::Failure, sim.now_nanos());
        }
        self.emit(target, sim.now_nanos());
        false
    }

    fn shutdown(&mut self, _sim: &mut Simulation) {
        debug!(instance = %self.owner, targets = self.states.len(), "Clearing circuit breaker");
        self.active.clear();
        self.states.clear();
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .field("states", &self.states)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::reporting::NoopObserver;

    const MS: u64 = 1_000_000;

    fn breaker(threshold: u32, percentage: f64) -> CircuitBreaker {
        CircuitBreaker::new(
            InstanceId::new(0),
            CircuitBreakerConfig {
                request_volume_threshold: threshold,
                error_threshold_percentage: percentage,
                rolling_window: 10,
                sleep_window: Duration::from_millis(500),
                timeout: None,
            },
            Arc::new(NoopObserver),
        )
    }

    #[test]
    fn test_closed_at_or_below_volume_threshold() {
        let mut cb = breaker(3, 50.0);
        let target = ServiceId::new(1);
        for _ in 0..3 {
            cb.record(target, Sample::Failure, 0);
        }
        assert!(!cb.is_open(target, 0));

        cb.record(target, Sample::Failure, MS);
        assert!(cb.is_open(target, MS));
    }

    #[test]
    fn test_error_ratio_must_exceed_threshold() {
        let mut cb = breaker(1, 50.0);
        let target = ServiceId::new(1);
        cb.record(target, Sample::Failure, 0);
        cb.record(target, Sample::Success, 0);
        // 50% is not above 50%
        assert!(!cb.is_open(target, 0));

        cb.record(target, Sample::Failure, 0);
        assert!(cb.is_open(target, 0));
    }

    #[test]
    fn test_closes_after_sleep_window() {
        let mut cb = breaker(0, 0.0);
        let target = ServiceId::new(1);
        cb.record(target, Sample::Failure, 100 * MS);
        assert!(cb.is_open(target, 100 * MS));
        assert!(cb.is_open(target, 599 * MS));

        assert!(!cb.is_open(target, 600 * MS));
        let state = cb.state(target).unwrap();
        assert_eq!(state.window().volume(), 0);
        assert!(!state.is_open(600 * MS));
        assert_eq!(state.opened_at(), None);
    }

    #[test]
    fn test_state_reports_closed_once_sleep_window_passed() {
        let mut cb = breaker(0, 0.0);
        let target = ServiceId::new(1);
        cb.record(target, Sample::Failure, 100 * MS);

        // Nothing was sent since, so the window still holds the failure.
        let state = cb.state(target).unwrap();
        assert!(state.is_open(599 * MS));
        assert!(!state.is_open(600 * MS));
        assert_eq!(state.opened_at(), Some(100 * MS));
        assert_eq!(state.window().volume(), 1);
    }

    #[test]
    fn test_default_config_never_opens() {
        let mut cb = CircuitBreaker::new(
            InstanceId::new(0),
            CircuitBreakerConfig::default(),
            Arc::new(NoopObserver),
        );
        let target = ServiceId::new(1);
        for _ in 0..100 {
            cb.record(target, Sample::Failure, 0);
        }
        assert!(!cb.is_open(target, 0));
    }
}
