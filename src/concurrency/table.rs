//! The resource lock table.
//!
//! One fair lock per managed resource, the busy table recording holders,
//! and the coordination state for deadlock detection. All coordination
//! state sits behind a single mutex held only for short, bounded sections;
//! blocked sessions sleep on a per-resource condition variable, which
//! releases the mutex for the duration of the wait.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use super::graph::{select_victim, WaitForGraph};
use crate::resource::ResourceId;
use crate::time::Timestamp;
use crate::transaction::session::SessionId;

/// Why a lock acquisition came back without the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The requester was chosen as a deadlock victim and must abort.
    Deadlock,
    /// The requester's cancel flag was set before the grant; resource state
    /// is unchanged.
    Cancelled,
}

/// Shared coordination state, guarded by the table's mutex.
#[derive(Default)]
struct CoordState {
    /// Resource -> session currently holding it. Absence means free.
    busy: HashMap<ResourceId, SessionId>,
    /// Resource -> sessions waiting for it, in arrival order.
    queues: HashMap<ResourceId, VecDeque<SessionId>>,
    /// Waiting session -> session it waits on.
    graph: WaitForGraph,
    /// Session -> resource it is currently blocked on.
    blocked_on: HashMap<SessionId, ResourceId>,
    /// Resource -> session that must abort instead of being granted it.
    victims: HashMap<ResourceId, SessionId>,
    /// Session -> start timestamp, for victim selection.
    starts: HashMap<SessionId, Timestamp>,
}

impl CoordState {
    /// Removes a session that is giving up its wait on `rid`.
    fn abandon_wait(&mut self, session: SessionId, rid: ResourceId) {
        if let Some(queue) = self.queues.get_mut(&rid) {
            queue.retain(|&s| s != session);
        }
        self.graph.clear_edge(session);
        self.blocked_on.remove(&session);
    }
}

/// Fair per-resource locking with online deadlock detection.
///
/// The managed resource set is fixed at construction; one condition
/// variable per resource exists for the table's whole lifetime.
pub struct LockTable {
    state: Mutex<CoordState>,
    signals: HashMap<ResourceId, Condvar>,
}

impl LockTable {
    /// Creates a table managing exactly the given resources.
    pub fn new(resources: impl IntoIterator<Item = ResourceId>) -> Self {
        let signals = resources
            .into_iter()
            .map(|rid| (rid, Condvar::new()))
            .collect();
        Self {
            state: Mutex::new(CoordState::default()),
            signals,
        }
    }

    /// True iff the resource is under this table's control.
    pub fn manages(&self, rid: ResourceId) -> bool {
        self.signals.contains_key(&rid)
    }

    /// Number of managed resources.
    pub fn resource_count(&self) -> usize {
        self.signals.len()
    }

    /// Records a session's start time for victim ordering.
    pub fn register(&self, session: SessionId, start: Timestamp) {
        self.state.lock().starts.insert(session, start);
    }

    /// Drops every remaining trace of a finished session.
    pub fn deregister(&self, session: SessionId) {
        let mut state = self.state.lock();
        state.starts.remove(&session);
        state.graph.clear_edge(session);
        state.blocked_on.remove(&session);
    }

    /// The session currently holding the resource, if any.
    pub fn holder_of(&self, rid: ResourceId) -> Option<SessionId> {
        self.state.lock().busy.get(&rid).copied()
    }

    /// Wakes `session` if it is blocked, so it can observe its cancel flag.
    pub fn wake_session(&self, session: SessionId) {
        let state = self.state.lock();
        if let Some(&rid) = state.blocked_on.get(&session) {
            if let Some(signal) = self.signals.get(&rid) {
                signal.notify_all();
            }
        }
    }

    /// Acquires `rid` for `session`.
    ///
    /// A free resource is claimed immediately; re-acquiring a resource this
    /// session already holds succeeds immediately. Otherwise the session
    /// joins the resource's FIFO queue, registers its wait-for edge, runs
    /// deadlock detection, and sleeps until it is at the front of the queue
    /// with the resource free. The wait ends early when the session is
    /// named a deadlock victim or its cancel flag is raised; in both cases
    /// the resource is not acquired and the session's wait bookkeeping is
    /// fully removed.
    pub fn acquire(
        &self,
        session: SessionId,
        rid: ResourceId,
        cancel: &AtomicBool,
    ) -> Result<(), AcquireError> {
        // Callers validate rids against the managed set first.
        let Some(signal) = self.signals.get(&rid) else {
            return Ok(());
        };

        let mut guard = self.state.lock();
        {
            let state = &mut *guard;
            match state.busy.get(&rid).copied() {
                None => {
                    state.busy.insert(rid, session);
                    trace!("{} claimed free {}", session, rid);
                    return Ok(());
                }
                Some(holder) if holder == session => {
                    // A failed operation can leave the lock granted with
                    // nothing logged; the next request re-enters here.
                    trace!("{} already holds {}", session, rid);
                    return Ok(());
                }
                Some(holder) => {
                    state.graph.set_edge(session, holder);
                    if let Some(cycle) = state.graph.cycle_from(session) {
                        if let Some(victim) = select_victim(&cycle, &state.starts) {
                            if victim == session {
                                state.graph.clear_edge(session);
                                debug!(
                                    "deadlock at {}: requester {} is the victim",
                                    rid, session
                                );
                                return Err(AcquireError::Deadlock);
                            }
                            self.signal_victim(state, victim);
                        }
                    }
                    state.blocked_on.insert(session, rid);
                    state.queues.entry(rid).or_default().push_back(session);
                    trace!("{} waits for {} held by {}", session, rid, holder);
                }
            }
        }

        loop {
            {
                let state = &mut *guard;

                if state.victims.get(&rid) == Some(&session) {
                    state.victims.remove(&rid);
                    state.abandon_wait(session, rid);
                    signal.notify_all();
                    debug!("{} aborts instead of acquiring {}", session, rid);
                    return Err(AcquireError::Deadlock);
                }

                if cancel.load(Ordering::SeqCst) {
                    state.abandon_wait(session, rid);
                    signal.notify_all();
                    debug!("{} cancelled while waiting for {}", session, rid);
                    return Err(AcquireError::Cancelled);
                }

                let at_front = state
                    .queues
                    .get(&rid)
                    .and_then(|q| q.front().copied())
                    == Some(session);
                if at_front && state.busy.get(&rid).is_none() {
                    if let Some(queue) = state.queues.get_mut(&rid) {
                        queue.pop_front();
                    }
                    state.busy.insert(rid, session);
                    state.graph.clear_edge(session);
                    state.blocked_on.remove(&session);

                    // Sessions still queued behind us now wait on the new
                    // holder.
                    let followers: Vec<SessionId> = state
                        .queues
                        .get(&rid)
                        .map(|q| q.iter().copied().collect())
                        .unwrap_or_default();
                    for follower in followers {
                        state.graph.set_edge(follower, session);
                    }

                    trace!("{} granted {}", session, rid);
                    return Ok(());
                }
            }

            signal.wait(&mut guard);
        }
    }

    /// Releases every resource in `held` that `session` actually holds,
    /// waking the waiters of each.
    pub fn release_all(&self, session: SessionId, held: impl IntoIterator<Item = ResourceId>) {
        let mut state = self.state.lock();
        for rid in held {
            if state.busy.get(&rid) == Some(&session) {
                state.busy.remove(&rid);
                if let Some(signal) = self.signals.get(&rid) {
                    signal.notify_all();
                }
                trace!("{} released {}", session, rid);
            }
        }
    }

    /// Records a victim in the skip table and wakes it. The victim is
    /// blocked on exactly one resource; when it wakes and finds itself
    /// named there, it aborts instead of taking the lock.
    fn signal_victim(&self, state: &mut CoordState, victim: SessionId) {
        if let Some(&rid) = state.blocked_on.get(&victim) {
            debug!("deadlock: {} blocked on {} chosen as victim", victim, rid);
            state.victims.insert(rid, victim);
            if let Some(signal) = self.signals.get(&rid) {
                signal.notify_all();
            }
        }
    }
}
