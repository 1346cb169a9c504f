//! The per-transaction operation log.

use std::sync::Arc;

use crate::resource::{Resource, ResourceId, ResourceOperation};

/// A successfully applied (resource, operation) pair.
///
/// Created only after `execute` succeeds; consumed most-recent-first during
/// rollback.
pub struct LoggedAction {
    resource_id: ResourceId,
    resource: Arc<dyn Resource>,
    operation: Box<dyn ResourceOperation>,
}

impl LoggedAction {
    /// Records an operation that has been applied to a resource.
    pub fn new(resource: Arc<dyn Resource>, operation: Box<dyn ResourceOperation>) -> Self {
        Self {
            resource_id: resource.id(),
            resource,
            operation,
        }
    }

    /// The id of the resource the operation was applied to.
    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    /// Reverses the logged effect.
    pub fn undo(self) {
        self.operation.undo(self.resource.as_ref());
    }
}

/// Ordered record of the operations a transaction has applied.
#[derive(Default)]
pub struct OperationLog {
    actions: Vec<LoggedAction>,
}

impl OperationLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Appends a successfully executed action.
    pub fn push(&mut self, action: LoggedAction) {
        self.actions.push(action);
    }

    /// True iff the log contains an entry for the resource.
    pub fn has_resource(&self, rid: ResourceId) -> bool {
        self.actions.iter().any(|a| a.resource_id == rid)
    }

    /// Number of logged actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// True iff nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Drains the log most-recent-first for rollback.
    pub fn drain_reverse(&mut self) -> impl Iterator<Item = LoggedAction> + '_ {
        self.actions.drain(..).rev()
    }
}
