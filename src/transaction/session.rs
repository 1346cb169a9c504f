//! Session identity and per-thread transaction state.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::log::{LoggedAction, OperationLog};
use crate::error::ResourceOperationError;
use crate::resource::{Resource, ResourceId, ResourceOperation};

/// An opaque handle identifying one transaction session.
///
/// Ids are issued in start order, so a larger id always means a later
/// `start_transaction` call; deadlock victim selection relies on this as its
/// timestamp tiebreak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Creates a new session ID with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the inner u64 value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

/// A thread-safe session ID issuer.
pub struct SessionIdGenerator {
    next_id: AtomicU64,
}

impl SessionIdGenerator {
    /// Creates a generator starting from 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Issues the next unique session ID.
    pub fn next(&self) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        SessionId::new(id)
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A single thread's in-flight transaction.
///
/// Owned by the thread that started it; the manager enforces one active
/// transaction per thread and never shares this value across threads. The
/// abort flag is set at most once and never cleared.
pub struct Transaction {
    id: SessionId,
    aborted: AtomicBool,
    cancelled: Arc<AtomicBool>,
    log: OperationLog,
    held: HashSet<ResourceId>,
}

impl Transaction {
    /// Creates a fresh, unaborted transaction.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            aborted: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
            log: OperationLog::new(),
            held: HashSet::new(),
        }
    }

    /// The session handle issued at start.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// True iff the transaction has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Marks the transaction aborted. Idempotent; never cleared.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// The shared flag a [`CancelToken`](crate::manager::CancelToken) sets to
    /// interrupt a pending lock acquisition.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// True iff an operation on the resource has been logged, making further
    /// operations on it reentrant.
    pub fn has_touched(&self, rid: ResourceId) -> bool {
        self.log.has_resource(rid)
    }

    /// Records a granted resource lock.
    pub fn add_held(&mut self, rid: ResourceId) {
        self.held.insert(rid);
    }

    /// True iff this transaction holds the resource's lock.
    pub fn holds(&self, rid: ResourceId) -> bool {
        self.held.contains(&rid)
    }

    /// Number of operations applied so far.
    pub fn operation_count(&self) -> usize {
        self.log.len()
    }

    /// Executes the operation and logs it on success. A failed execution
    /// leaves the log untouched and the error goes back to the caller; the
    /// resource's lock is unaffected either way.
    pub fn apply(
        &mut self,
        resource: Arc<dyn Resource>,
        operation: Box<dyn ResourceOperation>,
    ) -> Result<(), ResourceOperationError> {
        operation.execute(resource.as_ref())?;
        self.log.push(LoggedAction::new(resource, operation));
        Ok(())
    }

    /// Consumes the transaction for commit, returning the resources whose
    /// locks must be released. Effects stay applied.
    pub fn commit(self) -> HashSet<ResourceId> {
        self.held
    }

    /// Consumes the transaction for rollback: undoes every logged action,
    /// most recent first, then returns the resources whose locks must be
    /// released. The caller still holds those locks while the undos run, so
    /// no other transaction can observe a partially rolled back resource.
    pub fn rollback(mut self) -> HashSet<ResourceId> {
        for action in self.log.drain_reverse() {
            action.undo();
        }
        self.held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::any::Any;

    struct Register {
        id: ResourceId,
        trace: Mutex<Vec<String>>,
    }

    impl Register {
        fn new(id: u64) -> Self {
            Self {
                id: ResourceId::new(id),
                trace: Mutex::new(Vec::new()),
            }
        }
    }

    impl Resource for Register {
        fn id(&self) -> ResourceId {
            self.id
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Tag(&'static str);

    impl ResourceOperation for Tag {
        fn execute(&self, resource: &dyn Resource) -> Result<(), ResourceOperationError> {
            let register = resource.as_any().downcast_ref::<Register>().unwrap();
            register.trace.lock().push(format!("do:{}", self.0));
            Ok(())
        }

        fn undo(&self, resource: &dyn Resource) {
            let register = resource.as_any().downcast_ref::<Register>().unwrap();
            register.trace.lock().push(format!("undo:{}", self.0));
        }
    }

    struct Failing;

    impl ResourceOperation for Failing {
        fn execute(&self, _resource: &dyn Resource) -> Result<(), ResourceOperationError> {
            Err(ResourceOperationError::new("refused"))
        }

        fn undo(&self, _resource: &dyn Resource) {
            panic!("a failed operation must never be undone");
        }
    }

    #[test]
    fn test_session_id_generator() {
        let generator = SessionIdGenerator::new();

        assert_eq!(generator.next().value(), 1);
        assert_eq!(generator.next().value(), 2);
        assert_eq!(format!("{}", generator.next()), "S3");
    }

    #[test]
    fn test_abort_is_idempotent() {
        let txn = Transaction::new(SessionId::new(1));

        assert!(!txn.is_aborted());
        txn.abort();
        assert!(txn.is_aborted());
        txn.abort();
        assert!(txn.is_aborted());
    }

    #[test]
    fn test_apply_logs_on_success() {
        let register = Arc::new(Register::new(1));
        let mut txn = Transaction::new(SessionId::new(1));

        txn.apply(register.clone(), Box::new(Tag("a"))).unwrap();
        txn.apply(register.clone(), Box::new(Tag("b"))).unwrap();

        assert!(txn.has_touched(ResourceId::new(1)));
        assert!(!txn.has_touched(ResourceId::new(2)));
        assert_eq!(txn.operation_count(), 2);
    }

    #[test]
    fn test_apply_failure_is_not_logged() {
        let register = Arc::new(Register::new(1));
        let mut txn = Transaction::new(SessionId::new(1));

        let err = txn.apply(register.clone(), Box::new(Failing)).unwrap_err();
        assert_eq!(err.message(), "refused");
        assert!(!txn.has_touched(ResourceId::new(1)));

        // A later rollback must not try to undo the failed operation.
        let released = txn.rollback();
        assert!(released.is_empty());
    }

    #[test]
    fn test_rollback_undoes_in_reverse_order() {
        let register = Arc::new(Register::new(1));
        let mut txn = Transaction::new(SessionId::new(1));
        txn.add_held(ResourceId::new(1));

        txn.apply(register.clone(), Box::new(Tag("a"))).unwrap();
        txn.apply(register.clone(), Box::new(Tag("b"))).unwrap();

        let released = txn.rollback();
        assert!(released.contains(&ResourceId::new(1)));
        assert_eq!(
            *register.trace.lock(),
            vec!["do:a", "do:b", "undo:b", "undo:a"]
        );
    }

    #[test]
    fn test_commit_releases_held_without_undo() {
        let register = Arc::new(Register::new(1));
        let mut txn = Transaction::new(SessionId::new(1));
        txn.add_held(ResourceId::new(1));
        txn.add_held(ResourceId::new(2));

        txn.apply(register.clone(), Box::new(Tag("a"))).unwrap();

        let released = txn.commit();
        assert_eq!(released.len(), 2);
        assert_eq!(*register.trace.lock(), vec!["do:a"]);
    }

    #[test]
    fn test_held_tracks_locks_independently_of_log() {
        let mut txn = Transaction::new(SessionId::new(1));

        // A grant followed by a failed operation holds the lock with no
        // log entry.
        txn.add_held(ResourceId::new(9));
        assert!(txn.holds(ResourceId::new(9)));
        assert!(!txn.has_touched(ResourceId::new(9)));

        let released = txn.commit();
        assert!(released.contains(&ResourceId::new(9)));
    }
}
