//! Managed resources and the operations applied to them.

use serde::{Deserialize, Serialize};
use std::any::Any;

use crate::error::ResourceOperationError;

/// A unique identifier for a managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// Creates a new resource ID with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the inner u64 value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// A stateful object placed under the manager's control.
///
/// The manager never inspects a resource's state; it only hands the resource
/// to [`ResourceOperation`]s while holding that resource's lock. State
/// therefore lives behind interior mutability (atomics, cells, or a mutex of
/// the implementor's choosing), and the lock protocol guarantees that at
/// most one transaction applies operations to a resource at any instant.
pub trait Resource: Send + Sync {
    /// The unique id of this resource.
    fn id(&self) -> ResourceId;

    /// Upcast so operations can downcast to their concrete resource type.
    fn as_any(&self) -> &dyn Any;
}

/// An effect that can be applied to a resource and later reversed.
///
/// Operations must not call back into the transaction manager from
/// `execute` or `undo`.
pub trait ResourceOperation: Send + Sync {
    /// Applies the effect. A failed execution is never logged and is never
    /// undone; the error reaches the caller unchanged.
    fn execute(&self, resource: &dyn Resource) -> Result<(), ResourceOperationError>;

    /// Reverses a previously applied effect. Must not fail.
    fn undo(&self, resource: &dyn Resource);
}
