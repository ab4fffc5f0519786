//! Retry with pluggable backoff.
//!
//! Attempts are counted per [`DependencyKey`], so every resend of the same
//! dependency shares one counter no matter how many child requests it took.

use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, trace, warn};

use crate::{
    architecture::InstanceId,
    config::RetryConfig,
    network::{
        priority, DependencyKey, RequestFailedReason, RequestId, RequestListener, Requester,
        SendTarget, Simulation,
    },
    reporting::{Datapoint, StatisticsObserver},
    simulation::{duration_to_nanos, SimulationRng},
};

use super::backoff::{JitteringExponentialBackoff, RetryStrategy};

pub struct Retry {
    owner: InstanceId,
    name: String,
    max_tries: u32,
    strategy: Box<dyn RetryStrategy>,
    attempts: BTreeMap<DependencyKey, u32>,
    observer: Arc<dyn StatisticsObserver>,
}

impl Retry {
    pub fn new(
        owner: InstanceId,
        max_tries: u32,
        strategy: impl RetryStrategy + 'static,
        observer: Arc<dyn StatisticsObserver>,
    ) -> Self {
        Self {
            owner,
            name: format!("retry[{owner}]"),
            max_tries,
            strategy: Box::new(strategy),
            attempts: BTreeMap::new(),
            observer,
        }
    }

    /// Retry with full jitter exponential backoff drawing from `rng`.
    pub fn from_config(
        owner: InstanceId,
        config: &RetryConfig,
        rng: SimulationRng,
        observer: Arc<dyn StatisticsObserver>,
    ) -> Self {
        let strategy =
            JitteringExponentialBackoff::new(config.base_backoff, config.max_backoff, rng)
                .with_jitter(config.jitter);
        Self::new(owner, config.max_tries, strategy, observer)
    }

    /// Attempts made so far for `dependency`, if it is being tracked.
    pub fn attempts(&self, dependency: &DependencyKey) -> Option<u32> {
        self.attempts.get(dependency).copied()
    }

    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }

    fn owns(&self, sim: &Simulation, request: RequestId) -> bool {
        sim.request(request)
            .is_ok_and(|r| !r.is_answer() && r.requester() == Requester::Instance(self.owner))
    }

    /// Sends a new attempt for `key`. Returns false if that was impossible.
    fn resend(
        &mut self,
        sim: &mut Simulation,
        failed: RequestId,
        key: DependencyKey,
        tries: u32,
    ) -> bool {
        let Ok(dependency) = sim.related_dependency(failed) else {
            return false;
        };
        let service = dependency.target_service();
        let delay = self.strategy.next_delay(tries);
        let handler = sim.request(failed).ok().and_then(|r| r.handler());
        // The final attempt is load balanced afresh.
        let target = match handler {
            Some(instance) if tries + 1 < self.max_tries => SendTarget::Instance(instance),
            _ => SendTarget::Service(service),
        };

        let sent = sim
            .create_internal_request(key)
            .and_then(|next| sim.send_request(next, target, delay).map(|()| next));
        match sent {
            Ok(next) => {
                debug!(
                    instance = %self.owner,
                    dependency = %key,
                    attempt = tries + 1,
                    ?delay,
                    request = %next,
                    "Retrying dependency"
                );
                self.observer.record(
                    sim.now_nanos(),
                    Datapoint::RetryDelay {
                        instance: self.owner,
                        dependency: key,
                        attempt: tries,
                        delay_nanos: duration_to_nanos(delay),
                    },
                );
                true
            }
            Err(error) => {
                warn!(%error, dependency = %key, "Could not resend dependency request");
                false
            }
        }
    }
}

impl RequestListener for Retry {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        priority::VERY_HIGH
    }

    fn on_request_send(&mut self, sim: &mut Simulation, request: RequestId) -> bool {
        if !self.owns(sim, request) {
            return false;
        }
        let Ok(dependency) = sim.related_dependency(request) else {
            return false;
        };
        let tries = self.attempts.entry(dependency.key()).or_insert(0);
        *tries += 1;
        trace!(%request, dependency = %dependency.key(), tries = *tries, "Counted attempt");
        false
    }

    fn on_request_result_arrived_at_requester(
        &mut self,
        sim: &mut Simulation,
        request: RequestId,
    ) -> bool {
        if !self.owns(sim, request) {
            return false;
        }
        let Ok(dependency) = sim.related_dependency(request) else {
            return false;
        };
        if !dependency.is_current_child(request) {
            return false;
        }
        let key = dependency.key();
        if let Some(attempts) = self.attempts.remove(&key) {
            self.observer.record(
                sim.now_nanos(),
                Datapoint::RetryResolved {
                    instance: self.owner,
                    dependency: key,
                    attempts,
                },
            );
        }
        false
    }

    fn on_request_failed(
        &mut self,
        sim: &mut Simulation,
        request: RequestId,
        reason: RequestFailedReason,
    ) -> bool {
        // Raised by this pattern itself.
        if reason == RequestFailedReason::MaxRetriesReached || !self.owns(sim, request) {
            return false;
        }
        let Ok(dependency) = sim.related_dependency(request) else {
            return false;
        };
        if !dependency.is_current_child(request) {
            return false;
        }
        let key = dependency.key();
        let Some(tries) = self.attempts(&key) else {
            return false;
        };
        if sim.is_terminal(key.parent) {
            self.attempts.remove(&key);
            return false;
        }

        if tries < self.max_tries {
            return self.resend(sim, request, key, tries);
        }

        debug!(instance = %self.owner, dependency = %key, tries, "Max retries reached");
        self.attempts.remove(&key);
        self.observer.record(
            sim.now_nanos(),
            Datapoint::RetryExhausted {
                instance: self.owner,
                dependency: key,
                attempts: tries,
            },
        );
        if let Err(error) = sim.deliver_failure(request, RequestFailedReason::MaxRetriesReached) {
            warn!(%error, "Could not deliver max retries failure");
        }
        true
    }

    fn shutdown(&mut self, _sim: &mut Simulation) {
        debug!(instance = %self.owner, tracked = self.attempts.len(), "Clearing retry");
        self.attempts.clear();
    }
}
