use thiserror::Error;

use crate::{
    architecture::{InstanceId, OperationId, ServiceId},
    network::{ListenerId, RequestId},
};

/// Misuse of the kernel API: unknown ids or lookups that make no sense for the
/// given request. Failures of simulated requests are never reported this way;
/// they travel as [`RequestFailedReason`](crate::network::RequestFailedReason).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),

    #[error("request {0} has no parent dependency (root request or answer)")]
    NoParentDependency(RequestId),

    #[error("request {request} does not declare a dependency on {operation}")]
    UnknownDependency {
        request: RequestId,
        operation: OperationId,
    },

    #[error("unknown service {0}")]
    UnknownService(ServiceId),

    #[error("unknown operation {0}")]
    UnknownOperation(OperationId),

    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),

    #[error("unknown listener {0}")]
    UnknownListener(ListenerId),

    #[error("request {0} was already sent")]
    AlreadySent(RequestId),
}
