//! Event handling: how requests move from `Created` to a terminal state.

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::{
    architecture::{InstanceId, OperationId, ServiceId},
    error::KernelError,
    patterns::periodic::PeriodicId,
    simulation::EventId,
};

use super::{
    dependency::{DependencyKey, NetworkDependency},
    hooks::Notification,
    request::{RequestFailedReason, RequestId, RequestKind, RequestState, Requester, SendTarget},
    RootOutcome, RootResult, Simulation,
};

/// Everything the kernel schedules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    /// The request leaves its requester.
    Send(RequestId),
    /// The request reaches its handler (or, for answers, the requester).
    Arrival(RequestId),
    /// The handler finished processing; the answer is sent back.
    ProcessingComplete(RequestId),
    Timeout(RequestId),
    PeriodicTrigger(PeriodicId),
    KillInstance(InstanceId),
}

impl Simulation {
    pub(super) fn handle_event(&mut self, event_id: EventId, event: KernelEvent) {
        match event {
            KernelEvent::Send(id) => self.on_send(id),
            KernelEvent::Arrival(id) => self.on_arrival(id),
            KernelEvent::ProcessingComplete(id) => self.on_processing_complete(id),
            KernelEvent::Timeout(id) => self.on_timeout(id, event_id),
            KernelEvent::PeriodicTrigger(id) => self.on_periodic_trigger(id),
            KernelEvent::KillInstance(instance) => {
                if let Err(error) = self.kill_instance(instance) {
                    warn!(%error, "Scheduled kill of unknown instance");
                }
            }
        }
    }

    /// Runs `notification` through the request's listeners in priority order,
    /// stopping at the first that handles it.
    pub(crate) fn dispatch(&mut self, request: RequestId, notification: Notification) -> bool {
        let Some(listeners) = self.requests.get(&request).map(|r| r.listeners.clone()) else {
            return false;
        };
        for id in self.hooks.dispatch_order(&listeners) {
            // Lent out further up the stack.
            let Some(mut listener) = self.hooks.take(id) else {
                continue;
            };
            let handled = notification.deliver(listener.as_mut(), self, request);
            if let Err(mut orphan) = self.hooks.restore(id, listener) {
                orphan.shutdown(self);
            }
            if handled {
                trace!(%request, listener = %id, ?notification, "Notification handled");
                return true;
            }
        }
        false
    }

    fn on_send(&mut self, id: RequestId) {
        let now = self.now_nanos();
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        if request.state != RequestState::Created {
            return;
        }
        request.state = RequestState::Sent;
        request.sent_at = Some(now);
        request.pending_event = None;
        let is_answer = request.is_answer();
        if is_answer {
            self.stats.answers += 1;
        }
        self.stats.sent += 1;
        trace!(%id, "Request sent");

        if let Some(timeout) = self.config.request_timeout.filter(|_| !is_answer) {
            let event = self.scheduler.schedule_after(timeout, KernelEvent::Timeout(id));
            request.timeouts.push(event);
        }

        if self.dispatch(id, Notification::Send) || self.is_terminal(id) {
            return;
        }
        self.route(id);
    }

    /// Picks the handler and schedules arrival after the network latency.
    fn route(&mut self, id: RequestId) {
        let Some(request) = self.requests.get(&id) else {
            return;
        };
        let (kind, target) = (request.kind, request.target);
        let handler = match (kind, target) {
            (RequestKind::Answer { .. }, Some(SendTarget::Instance(instance))) => Some(instance),
            (RequestKind::Answer { .. }, _) => None,
            (_, Some(SendTarget::Instance(instance)))
                if self.architecture.is_instance_running(instance) =>
            {
                Some(instance)
            }
            (_, Some(SendTarget::Instance(instance))) => {
                let service = self.architecture.instance(instance).map(|i| i.service);
                service
                    .ok()
                    .and_then(|s| self.architecture.next_running_instance(s))
            }
            (_, Some(SendTarget::Service(service))) => {
                self.architecture.next_running_instance(service)
            }
            (_, Some(SendTarget::Client) | None) => None,
        };
        if handler.is_none() && !matches!(kind, RequestKind::Answer { .. }) {
            debug!(%id, ?target, "No running instance available");
            self.terminate(
                id,
                RequestState::Failed,
                RequestFailedReason::NoInstanceAvailable,
            );
            return;
        }

        let latency = self.network_latency(kind, handler);
        let event = self.scheduler.schedule_after(latency, KernelEvent::Arrival(id));
        if let Some(request) = self.requests.get_mut(&id) {
            request.handler = handler;
            request.pending_event = Some(event);
        }
    }

    fn network_latency(&self, kind: RequestKind, handler: Option<InstanceId>) -> Duration {
        let description = match kind {
            RequestKind::Internal { dependency } => self
                .requests
                .get(&dependency.parent)
                .and_then(|p| p.dependency(dependency.operation))
                .map(|d| d.description().clone()),
            _ => None,
        };
        let mut latency = description
            .as_ref()
            .and_then(|d| d.next_custom_delay(&self.rng))
            .unwrap_or_else(|| self.config.network_latency.sample(&self.rng));
        if let Some(description) = &description {
            latency += description.next_extra_delay(&self.rng);
        }
        if !matches!(kind, RequestKind::Answer { .. }) {
            let service = handler
                .and_then(|h| self.architecture.instance(h).ok())
                .map(|i| i.service);
            if let Some(service) = service {
                latency += self.faults.extra_latency(service, self.now_nanos());
            }
        }
        latency
    }

    fn on_arrival(&mut self, id: RequestId) {
        let now = self.now_nanos();
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        if request.state != RequestState::Sent {
            return;
        }
        request.state = RequestState::Arrived;
        request.arrived_at = Some(now);
        request.pending_event = None;
        let (kind, handler, operation) = (request.kind, request.handler, request.operation);
        self.stats.arrived += 1;
        trace!(%id, ?handler, "Request arrived");

        if let RequestKind::Answer { answered } = kind {
            self.dispatch(id, Notification::ArrivalAtTarget);
            self.finalize_answer(id);
            self.on_result_arrived(answered);
            return;
        }

        if self.dispatch(id, Notification::ArrivalAtTarget) || self.is_terminal(id) {
            return;
        }
        let Some(service) = handler
            .filter(|h| self.architecture.is_instance_running(*h))
            .and_then(|h| self.architecture.instance(h).ok())
            .map(|i| i.service)
        else {
            self.terminate(
                id,
                RequestState::Failed,
                RequestFailedReason::HandlingInstanceDied,
            );
            return;
        };
        if self.faults.should_fail(service, &self.rng) {
            debug!(%id, %service, "Injected failure");
            self.terminate(id, RequestState::Failed, RequestFailedReason::InjectedFault);
            return;
        }
        self.start_processing(id, operation);
    }

    /// Instantiates the operation's dependencies and sends one child request
    /// per dependency. Without dependencies processing starts right away.
    fn start_processing(&mut self, id: RequestId, operation: OperationId) {
        let Ok(op) = self.architecture.operation(operation) else {
            warn!(%id, %operation, "Request for unknown operation");
            return;
        };
        let (descriptions, duration) = (op.dependencies.clone(), op.duration);

        let mut dependencies: Vec<NetworkDependency> = Vec::new();
        for description in descriptions {
            if description.probability < 1.0 && !self.rng.gen_bool(description.probability) {
                continue;
            }
            if dependencies
                .iter()
                .any(|d| d.target_operation() == description.target)
            {
                continue;
            }
            let Ok(target) = self.architecture.operation(description.target) else {
                continue;
            };
            dependencies.push(NetworkDependency::new(id, target.service, description));
        }

        if dependencies.is_empty() {
            self.schedule_processing_complete(id, duration);
            return;
        }

        let plan: Vec<(DependencyKey, ServiceId)> = dependencies
            .iter()
            .map(|d| (d.key(), d.target_service()))
            .collect();
        if let Some(request) = self.requests.get_mut(&id) {
            request.dependencies = dependencies;
        }
        trace!(%id, dependencies = plan.len(), "Sending dependency requests");
        for (key, service) in plan {
            let sent = self
                .create_internal_request(key)
                .and_then(|child| self.send_request(child, SendTarget::Service(service), Duration::ZERO));
            if let Err(error) = sent {
                warn!(%error, %key, "Could not send dependency request");
            }
        }
    }

    fn schedule_processing_complete(&mut self, id: RequestId, after: Duration) {
        let event = self
            .scheduler
            .schedule_after(after, KernelEvent::ProcessingComplete(id));
        if let Some(request) = self.requests.get_mut(&id) {
            request.pending_event = Some(event);
        }
    }

    /// Processing done: send the answer back to the requester.
    fn on_processing_complete(&mut self, id: RequestId) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        if request.state != RequestState::Arrived {
            return;
        }
        request.pending_event = None;
        let (operation, reply_to) = (request.operation, request.requester);
        let responder = request
            .handler
            .map_or(Requester::Client, Requester::Instance);

        let listeners = self.patterns_of(responder);
        let answer = self.insert_request(
            RequestKind::Answer { answered: id },
            operation,
            responder,
            listeners,
        );
        if let Err(error) = self.send_request(answer, SendTarget::from(reply_to), Duration::ZERO) {
            warn!(%error, %id, "Could not send answer");
        }
    }

    fn finalize_answer(&mut self, id: RequestId) {
        let now = self.now_nanos();
        if let Some(answer) = self.requests.get_mut(&id) {
            answer.state = RequestState::Completed;
            answer.finished_at = Some(now);
        }
    }

    /// The result of `id` reached its requester.
    fn on_result_arrived(&mut self, id: RequestId) {
        match self.requests.get(&id) {
            Some(request) if !request.state.is_terminal() => {}
            _ => {
                trace!(%id, "Result for finished request ignored");
                return;
            }
        }
        self.dispatch(id, Notification::ResultArrivedAtRequester);
        // A listener may have failed the request while handling its result.
        if !self.is_terminal(id) {
            self.complete(id);
        }
    }

    fn complete(&mut self, id: RequestId) {
        let now = self.now_nanos();
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        request.state = RequestState::Completed;
        request.finished_at = Some(now);
        let events: Vec<EventId> = request
            .pending_event
            .take()
            .into_iter()
            .chain(request.timeouts.drain(..))
            .collect();
        let (kind, operation, created_at) = (request.kind, request.operation, request.created_at);
        let response_time = request.response_time();
        for event in events {
            self.scheduler.cancel(event);
        }
        self.stats.completed += 1;
        debug!(%id, ?response_time, "Request completed");

        match kind {
            RequestKind::Internal { dependency } => self.complete_dependency(dependency, id),
            RequestKind::User => {
                let response_time_nanos = now.saturating_sub(created_at);
                self.record_outcome(RootOutcome {
                    request: id,
                    operation,
                    issued_at: created_at,
                    finished_at: now,
                    result: RootResult::Completed {
                        response_time_nanos,
                    },
                });
            }
            RequestKind::Answer { .. } => {}
        }
    }

    fn complete_dependency(&mut self, key: DependencyKey, child: RequestId) {
        let Some(parent) = self.requests.get_mut(&key.parent) else {
            return;
        };
        if parent.state != RequestState::Arrived {
            return;
        }
        let Some(dependency) = parent.dependency_mut(key.operation) else {
            return;
        };
        if !dependency.is_current_child(child) {
            trace!(%key, %child, "Superseded attempt completed");
            return;
        }
        if !dependency.set_completed() || !parent.all_dependencies_completed() {
            return;
        }
        let duration = self
            .architecture
            .operation(parent.operation)
            .map_or(Duration::ZERO, |op| op.duration);
        trace!(parent = %key.parent, "All dependencies completed");
        self.schedule_processing_complete(key.parent, duration);
    }

    fn on_timeout(&mut self, id: RequestId, event: EventId) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        request.timeouts.retain(|e| *e != event);
        if request.state.is_in_flight() {
            debug!(%id, "Request timed out");
            self.terminate(id, RequestState::Failed, RequestFailedReason::Timeout);
        }
    }

    fn on_periodic_trigger(&mut self, id: PeriodicId) {
        let Some(mut pattern) = self.periodic.get_mut(&id).and_then(|slot| {
            slot.next_event = None;
            slot.pattern.take()
        }) else {
            return;
        };
        let flow = pattern.trigger(self);
        let now = self.now_nanos();

        let Some(slot) = self.periodic.get_mut(&id) else {
            // Stopped from inside its own trigger.
            pattern.on_stop(self);
            return;
        };
        slot.pattern = Some(pattern);
        match slot.schedule.next_trigger(now) {
            Some(at) if flow.is_continue() => {
                slot.next_event = Some(
                    self.scheduler
                        .schedule_at(at, KernelEvent::PeriodicTrigger(id)),
                );
            }
            _ => {
                self.stop_periodic(id);
            }
        }
    }

    /// Fails a request with `reason`. Requests that already ended are left alone.
    pub fn fail_request(
        &mut self,
        id: RequestId,
        reason: RequestFailedReason,
    ) -> Result<(), KernelError> {
        self.request(id)?;
        self.terminate(id, RequestState::Failed, reason);
        Ok(())
    }

    /// Vetoes a request. Listeners learn about it synchronously through
    /// `on_request_failed`.
    pub fn cancel_request(
        &mut self,
        id: RequestId,
        reason: RequestFailedReason,
    ) -> Result<(), KernelError> {
        self.request(id)?;
        self.terminate(id, RequestState::Canceled, reason);
        Ok(())
    }

    /// Notifies the listeners of `id` about a failure and, unless one of them
    /// handles it, passes it on to the requester.
    ///
    /// Does not touch the request's state; used to report a failure under a
    /// different reason than the one that ended the request.
    pub fn deliver_failure(
        &mut self,
        id: RequestId,
        reason: RequestFailedReason,
    ) -> Result<(), KernelError> {
        self.request(id)?;
        self.notify_failure(id, reason);
        Ok(())
    }

    pub(crate) fn terminate(
        &mut self,
        id: RequestId,
        state: RequestState,
        reason: RequestFailedReason,
    ) -> bool {
        let now = self.now_nanos();
        let Some(request) = self.requests.get_mut(&id) else {
            return false;
        };
        if request.state.is_terminal() {
            trace!(%id, %reason, "Request already finished");
            return false;
        }
        request.state = state;
        request.failure = Some(reason);
        request.finished_at = Some(now);
        let events: Vec<EventId> = request
            .pending_event
            .take()
            .into_iter()
            .chain(request.timeouts.drain(..))
            .collect();
        for event in events {
            self.scheduler.cancel(event);
        }
        match state {
            RequestState::Canceled => self.stats.canceled += 1,
            _ => *self.stats.failed.entry(reason).or_default() += 1,
        }
        debug!(%id, %reason, ?state, "Request ended without result");
        self.notify_failure(id, reason);
        true
    }

    fn notify_failure(&mut self, id: RequestId, reason: RequestFailedReason) {
        if self.dispatch(id, Notification::Failed(reason)) {
            return;
        }
        self.propagate_failure(id, reason);
    }

    /// Unhandled failure: the requester learns about it.
    fn propagate_failure(&mut self, id: RequestId, reason: RequestFailedReason) {
        let Some(request) = self.requests.get(&id) else {
            return;
        };
        match request.kind {
            RequestKind::Internal { dependency } => {
                let current = self
                    .requests
                    .get(&dependency.parent)
                    .and_then(|p| p.dependency(dependency.operation))
                    .is_some_and(|d| d.is_current_child(id));
                if !current {
                    trace!(%id, %dependency, "Superseded attempt failed");
                    return;
                }
                debug!(%id, parent = %dependency.parent, %reason, "Dependency failed");
                self.terminate(
                    dependency.parent,
                    RequestState::Failed,
                    RequestFailedReason::DependencyNotAvailable,
                );
            }
            RequestKind::User => {
                let outcome = RootOutcome {
                    request: id,
                    operation: request.operation,
                    issued_at: request.created_at,
                    finished_at: request.finished_at.unwrap_or_else(|| self.now_nanos()),
                    result: RootResult::Failed { reason },
                };
                self.record_outcome(outcome);
            }
            RequestKind::Answer { .. } => {
                trace!(%id, %reason, "Answer failed");
            }
        }
    }

    fn record_outcome(&mut self, outcome: RootOutcome) {
        if self.outcomes.contains_key(&outcome.request) {
            return;
        }
        debug!(request = %outcome.request, result = ?outcome.result, "Root request finished");
        self.observer.record(
            outcome.finished_at,
            crate::reporting::Datapoint::RootOutcome(outcome.clone()),
        );
        self.outcomes.insert(outcome.request, outcome);
    }
}
