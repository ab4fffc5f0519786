use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::architecture::{DependencyDescription, OperationId, ServiceId};

use super::request::RequestId;

/// Identity of a dependency: the parent request plus the targeted operation.
///
/// Every attempt at satisfying the same logical dependency carries the same
/// key, so retries of one dependency share a single bookkeeping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DependencyKey {
    pub parent: RequestId,
    pub operation: OperationId,
}

impl std::fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dependency({})of[{}]", self.operation, self.parent)
    }
}

/// A [`DependencyDescription`] bound to one parent request.
///
/// The dependency points at the child request currently trying to satisfy it.
/// A retry replaces that pointer; older attempts stay in the request table and
/// find out they were superseded by comparing their own id with
/// [`child_request`](Self::child_request).
#[derive(Debug, Clone)]
pub struct NetworkDependency {
    key: DependencyKey,
    target_service: ServiceId,
    description: DependencyDescription,
    completed: bool,
    child: Option<RequestId>,
}

impl NetworkDependency {
    pub(crate) fn new(
        parent: RequestId,
        target_service: ServiceId,
        description: DependencyDescription,
    ) -> Self {
        Self {
            key: DependencyKey {
                parent,
                operation: description.target,
            },
            target_service,
            description,
            completed: false,
            child: None,
        }
    }

    pub fn key(&self) -> DependencyKey {
        self.key
    }

    pub fn parent_request(&self) -> RequestId {
        self.key.parent
    }

    pub fn target_operation(&self) -> OperationId {
        self.key.operation
    }

    pub fn target_service(&self) -> ServiceId {
        self.target_service
    }

    pub fn description(&self) -> &DependencyDescription {
        &self.description
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// The request currently attempting to satisfy this dependency.
    pub fn child_request(&self) -> Option<RequestId> {
        self.child
    }

    /// Whether `request` is the current attempt for this dependency.
    pub fn is_current_child(&self, request: RequestId) -> bool {
        self.child == Some(request)
    }

    /// Marks the dependency completed. Returns false if it already was.
    pub(crate) fn set_completed(&mut self) -> bool {
        !std::mem::replace(&mut self.completed, true)
    }

    /// Points the dependency at a new attempt, superseding the previous one.
    pub(crate) fn update_child_request(&mut self, child: RequestId) -> Option<RequestId> {
        self.child.replace(child)
    }
}

impl PartialEq for NetworkDependency {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for NetworkDependency {}

impl Hash for NetworkDependency {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}
