use std::{fmt, time::Duration};

use serde::Serialize;

use crate::{
    architecture::{InstanceId, OperationId, ServiceId},
    simulation::EventId,
};

use super::{
    dependency::{DependencyKey, NetworkDependency},
    hooks::ListenerId,
};

/// Unique identifier of a request within one simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

/// Why a request did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RequestFailedReason {
    /// The requester's circuit breaker for the target is open.
    CircuitIsOpen,
    /// Too many concurrent connections to the target.
    ConnectionVolumeLimitReached,
    /// Retry gave up on the dependency.
    MaxRetriesReached,
    /// The request was still in flight when its timeout fired.
    Timeout,
    /// The target service had no running instance.
    NoInstanceAvailable,
    /// The handling instance died while the request was there.
    HandlingInstanceDied,
    /// Fault injection failed the request at its target.
    InjectedFault,
    /// One of the request's own dependencies failed for good.
    DependencyNotAvailable,
}

impl fmt::Display for RequestFailedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CircuitIsOpen => "circuit is open",
            Self::ConnectionVolumeLimitReached => "connection volume limit reached",
            Self::MaxRetriesReached => "max retries reached",
            Self::Timeout => "timeout",
            Self::NoInstanceAvailable => "no instance available",
            Self::HandlingInstanceDied => "handling instance died",
            Self::InjectedFault => "injected fault",
            Self::DependencyNotAvailable => "dependency not available",
        };
        f.write_str(s)
    }
}

/// Who issued a request and receives its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Requester {
    /// An external client, i.e. a load generator.
    Client,
    Instance(InstanceId),
}

impl Requester {
    pub fn instance(&self) -> Option<InstanceId> {
        match self {
            Self::Client => None,
            Self::Instance(id) => Some(*id),
        }
    }
}

/// Where a request is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SendTarget {
    /// Any running instance of the service, chosen at send time.
    Service(ServiceId),
    Instance(InstanceId),
    Client,
}

impl From<Requester> for SendTarget {
    fn from(requester: Requester) -> Self {
        match requester {
            Requester::Client => Self::Client,
            Requester::Instance(id) => Self::Instance(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestKind {
    /// Root request issued by a client.
    User,
    /// Call issued to satisfy a dependency of another request.
    Internal { dependency: DependencyKey },
    /// Response travelling back to the requester of `answered`.
    Answer { answered: RequestId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    Created,
    Sent,
    Arrived,
    Completed,
    Failed,
    Canceled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Sent | Self::Arrived)
    }
}

/// One logical call in the simulated system.
#[derive(Debug, Clone)]
pub struct Request {
    pub(crate) id: RequestId,
    pub(crate) kind: RequestKind,
    pub(crate) operation: OperationId,
    pub(crate) requester: Requester,
    pub(crate) target: Option<SendTarget>,
    pub(crate) handler: Option<InstanceId>,
    pub(crate) dependencies: Vec<NetworkDependency>,
    pub(crate) state: RequestState,
    pub(crate) failure: Option<RequestFailedReason>,
    pub(crate) created_at: u64,
    pub(crate) sent_at: Option<u64>,
    pub(crate) arrived_at: Option<u64>,
    pub(crate) finished_at: Option<u64>,
    pub(crate) listeners: Vec<ListenerId>,
    /// Next lifecycle event (send, arrival or processing completion).
    pub(crate) pending_event: Option<EventId>,
    pub(crate) timeouts: Vec<EventId>,
}

impl Request {
    pub(crate) fn new(
        id: RequestId,
        kind: RequestKind,
        operation: OperationId,
        requester: Requester,
        created_at: u64,
        listeners: Vec<ListenerId>,
    ) -> Self {
        Self {
            id,
            kind,
            operation,
            requester,
            target: None,
            handler: None,
            dependencies: Vec::new(),
            state: RequestState::Created,
            failure: None,
            created_at,
            sent_at: None,
            arrived_at: None,
            finished_at: None,
            listeners,
            pending_event: None,
            timeouts: Vec::new(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn is_answer(&self) -> bool {
        matches!(self.kind, RequestKind::Answer { .. })
    }

    pub fn is_internal(&self) -> bool {
        matches!(self.kind, RequestKind::Internal { .. })
    }

    /// The dependency this request attempts to satisfy, for internal requests.
    pub fn dependency_key(&self) -> Option<DependencyKey> {
        match self.kind {
            RequestKind::Internal { dependency } => Some(dependency),
            _ => None,
        }
    }

    /// Parent request, i.e. the owner of the originating dependency.
    pub fn parent(&self) -> Option<RequestId> {
        self.dependency_key().map(|key| key.parent)
    }

    pub fn operation(&self) -> OperationId {
        self.operation
    }

    pub fn requester(&self) -> Requester {
        self.requester
    }

    pub fn target(&self) -> Option<SendTarget> {
        self.target
    }

    /// Instance that received (or is receiving) the request.
    pub fn handler(&self) -> Option<InstanceId> {
        self.handler
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn failure(&self) -> Option<RequestFailedReason> {
        self.failure
    }

    pub fn listeners(&self) -> &[ListenerId] {
        &self.listeners
    }

    pub fn dependencies(&self) -> &[NetworkDependency] {
        &self.dependencies
    }

    pub fn dependency(&self, operation: OperationId) -> Option<&NetworkDependency> {
        self.dependencies
            .iter()
            .find(|d| d.target_operation() == operation)
    }

    pub(crate) fn dependency_mut(&mut self, operation: OperationId) -> Option<&mut NetworkDependency> {
        self.dependencies
            .iter_mut()
            .find(|d| d.target_operation() == operation)
    }

    pub fn all_dependencies_completed(&self) -> bool {
        self.dependencies.iter().all(|d| d.is_completed())
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn sent_at(&self) -> Option<u64> {
        self.sent_at
    }

    pub fn arrived_at(&self) -> Option<u64> {
        self.arrived_at
    }

    pub fn finished_at(&self) -> Option<u64> {
        self.finished_at
    }

    /// Time from send to completion, for completed requests.
    pub fn response_time(&self) -> Option<Duration> {
        match (self.state, self.sent_at, self.finished_at) {
            (RequestState::Completed, Some(sent), Some(done)) => {
                Some(Duration::from_nanos(done.saturating_sub(sent)))
            }
            _ => None,
        }
    }
}
