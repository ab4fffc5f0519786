//! The request simulation kernel.
//!
//! [`Simulation`] owns every request of a run, the listeners observing them and
//! the scheduler that moves them through their lifecycle. Resilience patterns
//! are plain [`RequestListener`]s that receive `&mut Simulation` and use the
//! same public API an orchestration layer would.

mod dependency;
mod hooks;
mod lifecycle;
mod request;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::Serialize;

use crate::{
    architecture::{Architecture, InstanceId, InstanceState, OperationId},
    config::SimulationConfig,
    error::KernelError,
    patterns::periodic::{PeriodicId, PeriodicPattern, PeriodicSchedule},
    reporting::{NoopObserver, StatisticsObserver},
    simulation::{
        duration_to_nanos, Event, EventId, FaultConfig, Scheduler, SchedulerConfig, SimulationRng,
    },
};

pub use dependency::{DependencyKey, NetworkDependency};
pub use hooks::{priority, HookRegistry, ListenerId, RequestListener};
pub use lifecycle::KernelEvent;
pub use request::{
    Request, RequestFailedReason, RequestId, RequestKind, RequestState, Requester, SendTarget,
};

/// How a root request ended, as seen by its client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RootResult {
    Completed { response_time_nanos: u64 },
    Failed { reason: RequestFailedReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootOutcome {
    pub request: RequestId,
    pub operation: OperationId,
    pub issued_at: u64,
    pub finished_at: u64,
    #[serde(flatten)]
    pub result: RootResult,
}

impl RootOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.result, RootResult::Completed { .. })
    }
}

/// Request counters of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub user_requests: u64,
    pub internal_requests: u64,
    pub answers: u64,
    pub sent: u64,
    pub arrived: u64,
    /// Completed user and internal requests. Answers are not counted.
    pub completed: u64,
    pub canceled: u64,
    pub failed: BTreeMap<RequestFailedReason, u64>,
    pub events_processed: u64,
}

impl NetworkStats {
    pub fn failed_with(&self, reason: RequestFailedReason) -> u64 {
        self.failed.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_failed(&self) -> u64 {
        self.failed.values().sum()
    }
}

struct PeriodicSlot {
    schedule: PeriodicSchedule,
    /// `None` while the pattern is being triggered.
    pattern: Option<Box<dyn PeriodicPattern>>,
    next_event: Option<EventId>,
}

/// A single simulation run.
pub struct Simulation {
    architecture: Architecture,
    config: SimulationConfig,
    scheduler: Scheduler<KernelEvent>,
    rng: SimulationRng,
    faults: FaultConfig,
    observer: Arc<dyn StatisticsObserver>,
    requests: BTreeMap<RequestId, Request>,
    next_request_id: u64,
    hooks: HookRegistry,
    periodic: BTreeMap<PeriodicId, PeriodicSlot>,
    next_periodic_id: u64,
    outcomes: BTreeMap<RequestId, RootOutcome>,
    stats: NetworkStats,
}

impl Simulation {
    pub fn new(architecture: Architecture, config: SimulationConfig) -> Self {
        let scheduler = Scheduler::with_config(SchedulerConfig {
            max_events_per_step: config.max_events,
            trace_events: config.trace_events,
            record_events: config.record_events,
        });
        tracing::info!(seed = config.seed, "Creating simulation");
        Self {
            architecture,
            rng: SimulationRng::new(config.seed),
            config,
            scheduler,
            faults: FaultConfig::default(),
            observer: Arc::new(NoopObserver),
            requests: BTreeMap::new(),
            next_request_id: 0,
            hooks: HookRegistry::new(),
            periodic: BTreeMap::new(),
            next_periodic_id: 0,
            outcomes: BTreeMap::new(),
            stats: NetworkStats::default(),
        }
    }

    /// Installs fault injection. Instance kills are scheduled right away.
    pub fn with_faults(mut self, faults: FaultConfig) -> Self {
        for kill in &faults.instance_kills {
            self.scheduler
                .schedule_at(kill.at, KernelEvent::KillInstance(kill.instance));
        }
        self.faults = faults;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StatisticsObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn rng(&self) -> &SimulationRng {
        &self.rng
    }

    pub fn faults(&self) -> &FaultConfig {
        &self.faults
    }

    pub fn faults_mut(&mut self) -> &mut FaultConfig {
        &mut self.faults
    }

    pub fn observer(&self) -> Arc<dyn StatisticsObserver> {
        Arc::clone(&self.observer)
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Root request outcomes, in request id order.
    pub fn outcomes(&self) -> impl Iterator<Item = &RootOutcome> {
        self.outcomes.values()
    }

    pub fn outcome(&self, request: RequestId) -> Option<&RootOutcome> {
        self.outcomes.get(&request)
    }

    pub fn event_log(&self) -> &[Event<KernelEvent>] {
        self.scheduler.event_log()
    }

    pub fn now(&self) -> Duration {
        Duration::from_nanos(self.scheduler.now())
    }

    pub fn now_nanos(&self) -> u64 {
        self.scheduler.now()
    }

    pub fn pending_events(&self) -> usize {
        self.scheduler.pending_count()
    }

    pub fn request(&self, id: RequestId) -> Result<&Request, KernelError> {
        self.requests.get(&id).ok_or(KernelError::UnknownRequest(id))
    }

    pub fn requests(&self) -> impl Iterator<Item = &Request> {
        self.requests.values()
    }

    pub fn is_terminal(&self, id: RequestId) -> bool {
        self.requests
            .get(&id)
            .is_some_and(|r| r.state.is_terminal())
    }

    // -- requests --

    /// Creates a root request for `operation`, issued by a client.
    pub fn create_user_request(&mut self, operation: OperationId) -> Result<RequestId, KernelError> {
        self.architecture.operation(operation)?;
        self.stats.user_requests += 1;
        Ok(self.insert_request(RequestKind::User, operation, Requester::Client, Vec::new()))
    }

    /// Creates a new attempt at satisfying `dependency`.
    ///
    /// The request is issued by the parent's handler instance, listens with
    /// that instance's patterns and becomes the dependency's current child.
    pub fn create_internal_request(
        &mut self,
        dependency: DependencyKey,
    ) -> Result<RequestId, KernelError> {
        let parent = self.request(dependency.parent)?;
        if parent.dependency(dependency.operation).is_none() {
            return Err(KernelError::UnknownDependency {
                request: dependency.parent,
                operation: dependency.operation,
            });
        }
        let requester = parent
            .handler
            .map_or(Requester::Client, Requester::Instance);
        let listeners = self.patterns_of(requester);

        self.stats.internal_requests += 1;
        let id = self.insert_request(
            RequestKind::Internal { dependency },
            dependency.operation,
            requester,
            listeners,
        );
        let previous = self
            .requests
            .get_mut(&dependency.parent)
            .and_then(|p| p.dependency_mut(dependency.operation))
            .and_then(|d| d.update_child_request(id));
        if let Some(previous) = previous {
            tracing::trace!(%dependency, %previous, current = %id, "Superseded dependency attempt");
        }
        Ok(id)
    }

    pub(crate) fn insert_request(
        &mut self,
        kind: RequestKind,
        operation: OperationId,
        requester: Requester,
        listeners: Vec<ListenerId>,
    ) -> RequestId {
        let id = RequestId::new(self.next_request_id);
        self.next_request_id += 1;
        let now = self.now_nanos();
        self.requests.insert(
            id,
            Request::new(id, kind, operation, requester, now, listeners),
        );
        id
    }

    /// Schedules the send of a freshly created request after `delay`.
    pub fn send_request(
        &mut self,
        id: RequestId,
        target: SendTarget,
        delay: Duration,
    ) -> Result<(), KernelError> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or(KernelError::UnknownRequest(id))?;
        if request.state != RequestState::Created || request.pending_event.is_some() {
            return Err(KernelError::AlreadySent(id));
        }
        request.target = Some(target);
        request.pending_event = Some(self.scheduler.schedule_after(delay, KernelEvent::Send(id)));
        Ok(())
    }

    /// Fails `id` once a further `after` elapsed, if it is still in flight then.
    pub fn arm_timeout(&mut self, id: RequestId, after: Duration) -> Result<(), KernelError> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or(KernelError::UnknownRequest(id))?;
        if request.state.is_terminal() {
            return Ok(());
        }
        let event = self.scheduler.schedule_after(after, KernelEvent::Timeout(id));
        request.timeouts.push(event);
        Ok(())
    }

    /// The dependency of the parent request that `id` attempts to satisfy.
    pub fn related_dependency(&self, id: RequestId) -> Result<&NetworkDependency, KernelError> {
        let key = self
            .request(id)?
            .dependency_key()
            .ok_or(KernelError::NoParentDependency(id))?;
        self.request(key.parent)?
            .dependency(key.operation)
            .ok_or(KernelError::UnknownDependency {
                request: key.parent,
                operation: key.operation,
            })
    }

    // -- listeners --

    pub fn register_listener(&mut self, listener: impl RequestListener + 'static) -> ListenerId {
        let id = self.hooks.register(Box::new(listener));
        tracing::debug!(listener = %id, name = self.hooks.name(id), "Registered listener");
        id
    }

    /// Registers `listener` as a pattern of `instance`. Requests the instance
    /// issues from now on carry it as update listener.
    pub fn attach_pattern(
        &mut self,
        instance: InstanceId,
        listener: impl RequestListener + 'static,
    ) -> Result<ListenerId, KernelError> {
        self.architecture.instance(instance)?;
        let id = self.register_listener(listener);
        self.architecture.instance_mut(instance)?.patterns.push(id);
        Ok(id)
    }

    pub fn add_request_listener(
        &mut self,
        request: RequestId,
        listener: ListenerId,
    ) -> Result<(), KernelError> {
        if !self.hooks.contains(listener) {
            return Err(KernelError::UnknownListener(listener));
        }
        let request = self
            .requests
            .get_mut(&request)
            .ok_or(KernelError::UnknownRequest(request))?;
        if !request.listeners.contains(&listener) {
            request.listeners.push(listener);
        }
        Ok(())
    }

    /// Removes a listener and runs its shutdown hook.
    pub fn deregister_listener(&mut self, id: ListenerId) -> Result<(), KernelError> {
        let slot = self
            .hooks
            .deregister(id)
            .ok_or(KernelError::UnknownListener(id))?;
        for instance in self.architecture.instance_ids() {
            if let Ok(instance) = self.architecture.instance_mut(instance) {
                instance.patterns.retain(|p| *p != id);
            }
        }
        tracing::debug!(listener = %id, "Deregistered listener");
        // A listener deregistered from inside its own callback is shut down
        // once the dispatch hands it back.
        if let Some(mut listener) = slot {
            listener.shutdown(self);
        }
        Ok(())
    }

    fn patterns_of(&self, requester: Requester) -> Vec<ListenerId> {
        requester
            .instance()
            .and_then(|i| self.architecture.instance(i).ok())
            .map(|i| i.patterns.clone())
            .unwrap_or_default()
    }

    // -- instances --

    /// Stops routing new requests to `instance` and shuts its patterns down.
    /// Requests already at the instance finish normally.
    pub fn shutdown_instance(&mut self, instance: InstanceId) -> Result<(), KernelError> {
        let entry = self.architecture.instance_mut(instance)?;
        if entry.state != InstanceState::Running {
            return Ok(());
        }
        entry.state = InstanceState::ShutDown;
        tracing::info!(%instance, "Shutting down instance");
        self.detach_patterns(instance)
    }

    /// Kills `instance`: every request it is handling fails with
    /// [`RequestFailedReason::HandlingInstanceDied`].
    pub fn kill_instance(&mut self, instance: InstanceId) -> Result<(), KernelError> {
        let entry = self.architecture.instance_mut(instance)?;
        if entry.state == InstanceState::Killed {
            return Ok(());
        }
        entry.state = InstanceState::Killed;
        tracing::warn!(%instance, "Killing instance");

        let victims: Vec<RequestId> = self
            .requests
            .values()
            .filter(|r| {
                !r.is_answer() && r.state == RequestState::Arrived && r.handler == Some(instance)
            })
            .map(|r| r.id)
            .collect();
        for victim in victims {
            self.terminate(
                victim,
                RequestState::Failed,
                RequestFailedReason::HandlingInstanceDied,
            );
        }
        self.detach_patterns(instance)
    }

    pub fn schedule_instance_kill(
        &mut self,
        instance: InstanceId,
        at: Duration,
    ) -> Result<EventId, KernelError> {
        self.architecture.instance(instance)?;
        Ok(self
            .scheduler
            .schedule_at(duration_to_nanos(at), KernelEvent::KillInstance(instance)))
    }

    fn detach_patterns(&mut self, instance: InstanceId) -> Result<(), KernelError> {
        let patterns = std::mem::take(&mut self.architecture.instance_mut(instance)?.patterns);
        for pattern in patterns {
            // Already gone if it deregistered itself.
            if let Err(error) = self.deregister_listener(pattern) {
                tracing::trace!(%error, "Pattern already deregistered");
            }
        }
        Ok(())
    }

    // -- periodic patterns --

    pub fn register_periodic(
        &mut self,
        pattern: impl PeriodicPattern + 'static,
        schedule: PeriodicSchedule,
    ) -> PeriodicId {
        let id = PeriodicId::new(self.next_periodic_id);
        self.next_periodic_id += 1;
        let first = schedule.first_trigger(self.now_nanos());
        tracing::debug!(periodic = %id, name = pattern.name(), ?schedule, "Registered periodic pattern");
        let next_event =
            first.map(|at| self.scheduler.schedule_at(at, KernelEvent::PeriodicTrigger(id)));
        self.periodic.insert(
            id,
            PeriodicSlot {
                schedule,
                pattern: Some(Box::new(pattern)),
                next_event,
            },
        );
        id
    }

    /// Stops a periodic pattern. Returns false if it was not registered.
    pub fn stop_periodic(&mut self, id: PeriodicId) -> bool {
        let Some(slot) = self.periodic.remove(&id) else {
            return false;
        };
        if let Some(event) = slot.next_event {
            self.scheduler.cancel(event);
        }
        tracing::debug!(periodic = %id, "Stopped periodic pattern");
        if let Some(mut pattern) = slot.pattern {
            pattern.on_stop(self);
        }
        true
    }

    pub fn is_periodic_active(&self, id: PeriodicId) -> bool {
        self.periodic.contains_key(&id)
    }

    // -- running --

    /// Processes the next event. Returns false when nothing is pending.
    pub fn step(&mut self) -> bool {
        let Some(event) = self.scheduler.step() else {
            return false;
        };
        self.stats.events_processed += 1;
        self.handle_event(event.id, event.payload);
        true
    }

    /// Processes every event due at or before `deadline`, then moves the clock
    /// to `deadline`. Returns the number of processed events.
    pub fn run_until(&mut self, deadline: Duration) -> usize {
        let deadline = duration_to_nanos(deadline);
        let budget = self.scheduler.max_events_per_step();
        let mut processed = 0;
        while budget == 0 || processed < budget {
            match self.scheduler.next_event_time() {
                Some(at) if at <= deadline => {}
                _ => break,
            }
            if !self.step() {
                break;
            }
            processed += 1;
        }
        if budget == 0 || processed < budget {
            self.scheduler.advance_to(deadline);
        }
        processed
    }

    /// Processes events until none are pending or the configured event budget
    /// is spent. Periodic patterns without a stop time never go idle, so runs
    /// using them want a budget or [`run_until`](Self::run_until).
    pub fn run_until_idle(&mut self) -> usize {
        let budget = self.scheduler.max_events_per_step();
        let mut processed = 0;
        while (budget == 0 || processed < budget) && self.step() {
            processed += 1;
        }
        processed
    }

    /// Processes events until `done` holds, nothing is pending or the event
    /// budget is spent. `done` is checked before every event.
    pub fn run_until_condition(&mut self, mut done: impl FnMut(&Simulation) -> bool) -> usize {
        let budget = self.scheduler.max_events_per_step();
        let mut processed = 0;
        while (budget == 0 || processed < budget) && !done(self) && self.step() {
            processed += 1;
        }
        processed
    }

    /// Tears the run down: every listener and periodic pattern is shut down.
    pub fn shutdown(&mut self) {
        let periodic: Vec<PeriodicId> = self.periodic.keys().copied().collect();
        for id in periodic {
            self.stop_periodic(id);
        }
        for instance in self.architecture.instance_ids() {
            if let Ok(instance) = self.architecture.instance_mut(instance) {
                instance.patterns.clear();
            }
        }
        for (id, mut listener) in self.hooks.drain() {
            tracing::debug!(listener = %id, "Shutting down listener");
            listener.shutdown(self);
        }
        tracing::info!(
            now = self.now_nanos(),
            events = self.stats.events_processed,
            "Simulation shut down"
        );
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("seed", &self.config.seed)
            .field("scheduler", &self.scheduler)
            .field("requests", &self.requests.len())
            .field("hooks", &self.hooks)
            .field("periodic", &self.periodic.len())
            .finish()
    }
}
