//! The transaction manager: the public operation/commit/rollback surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use log::{debug, trace};

use crate::concurrency::table::{AcquireError, LockTable};
use crate::error::{TxnError, TxnResult};
use crate::resource::{Resource, ResourceId, ResourceOperation};
use crate::time::TimeProvider;
use crate::transaction::session::{SessionId, SessionIdGenerator, Transaction};

/// Cancels one transaction's pending lock acquisition from another thread.
///
/// Obtained via [`TransactionManager::cancel_token`] by the transaction's
/// own thread, then handed to whoever should be able to interrupt it.
/// Cancellation observed before or during a grant makes the pending
/// acquisition fail with [`TxnError::Cancelled`] and leaves resource and
/// transaction state untouched; a grant that already happened stands.
#[derive(Clone)]
pub struct CancelToken {
    session: SessionId,
    flag: Arc<AtomicBool>,
    table: Arc<LockTable>,
}

impl CancelToken {
    /// Raises the cancel flag and wakes the session if it is blocked.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.table.wake_session(self.session);
    }
}

/// Coordinates transactions from many threads over a fixed resource pool.
///
/// Each thread runs at most one transaction at a time; the manager pairs
/// the calling thread with its transaction, so the whole surface operates
/// on "the current transaction" implicitly. The resource set is fixed at
/// construction.
pub struct TransactionManager {
    resources: HashMap<ResourceId, Arc<dyn Resource>>,
    table: Arc<LockTable>,
    sessions: DashMap<ThreadId, Transaction>,
    session_ids: SessionIdGenerator,
    time_provider: Arc<dyn TimeProvider>,
}

impl TransactionManager {
    /// Creates a manager taking control of exactly the given resources.
    pub fn new(
        resources: impl IntoIterator<Item = Arc<dyn Resource>>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let resources: HashMap<ResourceId, Arc<dyn Resource>> =
            resources.into_iter().map(|r| (r.id(), r)).collect();
        let table = Arc::new(LockTable::new(resources.keys().copied()));
        Self {
            resources,
            table,
            sessions: DashMap::new(),
            session_ids: SessionIdGenerator::new(),
            time_provider,
        }
    }

    /// Starts a transaction for the calling thread.
    pub fn start_transaction(&self) -> TxnResult<()> {
        let thread = thread::current().id();
        if self.sessions.contains_key(&thread) {
            return Err(TxnError::AnotherTransactionActive);
        }

        let session = self.session_ids.next();
        let start = self.time_provider.current_time();
        self.table.register(session, start);
        self.sessions.insert(thread, Transaction::new(session));

        debug!("{} started at {}", session, start);
        Ok(())
    }

    /// Applies an operation to a resource inside the calling thread's
    /// transaction, acquiring the resource's lock first if this transaction
    /// has not touched it yet.
    ///
    /// Waiting for a contested resource registers the wait-for edge and
    /// runs deadlock detection; if this transaction is chosen as the
    /// victim, it is aborted and the call fails with
    /// [`TxnError::ActiveTransactionAborted`]. A failed operation is
    /// reported unchanged without aborting the transaction or releasing
    /// the lock.
    pub fn operate_on_resource_in_current_transaction(
        &self,
        rid: ResourceId,
        operation: Box<dyn ResourceOperation>,
    ) -> TxnResult<()> {
        let thread = thread::current().id();

        let (session, cancel, touched, resource) = {
            let txn = self
                .sessions
                .get(&thread)
                .ok_or(TxnError::NoActiveTransaction)?;
            let resource = self
                .resources
                .get(&rid)
                .cloned()
                .ok_or(TxnError::UnknownResourceId(rid))?;
            if txn.is_aborted() {
                return Err(TxnError::ActiveTransactionAborted);
            }
            (txn.id(), txn.cancel_flag(), txn.has_touched(rid), resource)
        };

        // The registry guard is dropped above: acquire can block for a long
        // time and must not pin a registry shard while it does.
        if !touched {
            match self.table.acquire(session, rid, &cancel) {
                Ok(()) => {
                    if let Some(mut txn) = self.sessions.get_mut(&thread) {
                        txn.add_held(rid);
                    }
                }
                Err(AcquireError::Deadlock) => {
                    if let Some(txn) = self.sessions.get(&thread) {
                        txn.abort();
                    }
                    debug!("{} aborted as deadlock victim", session);
                    return Err(TxnError::ActiveTransactionAborted);
                }
                Err(AcquireError::Cancelled) => {
                    return Err(TxnError::Cancelled);
                }
            }
        } else {
            trace!("{} re-operates on {} it already touched", session, rid);
        }

        let mut txn = self
            .sessions
            .get_mut(&thread)
            .ok_or(TxnError::NoActiveTransaction)?;
        txn.apply(resource, operation)?;
        Ok(())
    }

    /// Commits the calling thread's transaction, making its effects visible
    /// and releasing every held resource exactly once.
    pub fn commit_current_transaction(&self) -> TxnResult<()> {
        let thread = thread::current().id();
        {
            let txn = self
                .sessions
                .get(&thread)
                .ok_or(TxnError::NoActiveTransaction)?;
            if txn.is_aborted() {
                return Err(TxnError::ActiveTransactionAborted);
            }
        }

        if let Some((_, txn)) = self.sessions.remove(&thread) {
            let session = txn.id();
            let held = txn.commit();
            self.table.release_all(session, held);
            self.table.deregister(session);
            debug!("{} committed", session);
        }
        Ok(())
    }

    /// Rolls back the calling thread's transaction: undoes its logged
    /// operations most-recent-first, then releases every held resource.
    /// A thread without an active transaction is a no-op. Never fails, so
    /// it is always a safe recovery path, including for aborted
    /// transactions.
    pub fn rollback_current_transaction(&self) {
        let thread = thread::current().id();
        match self.sessions.remove(&thread) {
            Some((_, txn)) => {
                let session = txn.id();
                // Undo runs before any lock is released: this transaction
                // still holds every resource in its log, so nobody can
                // observe a partially undone resource.
                let held = txn.rollback();
                self.table.release_all(session, held);
                self.table.deregister(session);
                debug!("{} rolled back", session);
            }
            None => {
                trace!("rollback without an active transaction is a no-op");
            }
        }
    }

    /// True iff the calling thread has an active transaction.
    pub fn is_transaction_active(&self) -> bool {
        self.sessions.contains_key(&thread::current().id())
    }

    /// True iff the calling thread has an active transaction that has been
    /// aborted.
    pub fn is_transaction_aborted(&self) -> bool {
        self.sessions
            .get(&thread::current().id())
            .map(|txn| txn.is_aborted())
            .unwrap_or(false)
    }

    /// A token that can cancel this thread's pending lock acquisitions from
    /// another thread. `None` without an active transaction.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.sessions.get(&thread::current().id()).map(|txn| CancelToken {
            session: txn.id(),
            flag: txn.cancel_flag(),
            table: Arc::clone(&self.table),
        })
    }

    /// Number of transactions currently active across all threads.
    pub fn active_transaction_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of resources under this manager's control.
    pub fn managed_resource_count(&self) -> usize {
        self.resources.len()
    }
}
