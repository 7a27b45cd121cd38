//! Database-wide quiescence lock.
//!
//! The lock guarantees that no add is writing to disk while it is held.
//!
//! - `Normal`: adds run freely. `lock()` is granted immediately when no
//!   add is in flight; otherwise the state becomes `Locking`.
//! - `Locking`: at least one locker waits for in-flight adds to drain. The
//!   last add to finish flips the state to `Locked` and hands the lock to
//!   the head of the queue.
//! - `Locked`: a [`DatabaseLock`] is held. Releasing it hands the lock to
//!   the next queued locker, or returns to `Normal` and releases every add
//!   queued in the meantime.
//!
//! New adds arriving while `Locking` or `Locked` are queued rather than
//! run. Handoffs happen outside the state mutex: a guard dropped on a
//! failed handoff re-enters the lock, which must not already be held.

use crate::error::{Result, ZangetsuError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

/// Lock state of a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// No locker holds or waits for the lock.
    Normal,
    /// A locker waits for in-flight adds to drain.
    Locking,
    /// A locker holds the lock.
    Locked,
}

struct LockState {
    mode: LockMode,
    adds_in_flight: usize,
    lockers: VecDeque<oneshot::Sender<DatabaseLock>>,
    queued_adds: VecDeque<oneshot::Sender<AddPermit>>,
}

enum Handoff {
    Nothing,
    Locker(oneshot::Sender<DatabaseLock>),
    Adds(Vec<oneshot::Sender<AddPermit>>),
}

/// Shared lock state. Cloned into every guard it hands out.
pub(crate) struct QuiescenceLock {
    state: Mutex<LockState>,
}

impl QuiescenceLock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LockState {
                mode: LockMode::Normal,
                adds_in_flight: 0,
                lockers: VecDeque::new(),
                queued_adds: VecDeque::new(),
            }),
        })
    }

    pub(crate) fn mode(&self) -> LockMode {
        self.lock_state().mode
    }

    pub(crate) fn adds_in_flight(&self) -> usize {
        self.lock_state().adds_in_flight
    }

    pub(crate) fn queued_adds(&self) -> usize {
        self.lock_state().queued_adds.len()
    }

    pub(crate) fn queued_lockers(&self) -> usize {
        self.lock_state().lockers.len()
    }

    /// Waits until no add is in flight and the lock is ours.
    pub(crate) async fn lock(self: &Arc<Self>) -> Result<DatabaseLock> {
        let rx = {
            let mut state = self.lock_state();
            if state.mode == LockMode::Normal && state.adds_in_flight == 0 {
                state.mode = LockMode::Locked;
                return Ok(DatabaseLock {
                    owner: Arc::clone(self),
                });
            }
            if state.mode == LockMode::Normal {
                state.mode = LockMode::Locking;
            }
            let (tx, rx) = oneshot::channel();
            state.lockers.push_back(tx);
            rx
        };

        rx.await
            .map_err(|_| ZangetsuError::InvariantViolation("lock handoff dropped".into()))
    }

    /// Waits until an add may write to disk.
    pub(crate) async fn begin_add(self: &Arc<Self>) -> Result<AddPermit> {
        let rx = {
            let mut state = self.lock_state();
            if state.mode == LockMode::Normal {
                state.adds_in_flight += 1;
                return Ok(AddPermit {
                    owner: Arc::clone(self),
                });
            }
            let (tx, rx) = oneshot::channel();
            state.queued_adds.push_back(tx);
            rx
        };

        rx.await
            .map_err(|_| ZangetsuError::InvariantViolation("add handoff dropped".into()))
    }

    fn finish_add(self: &Arc<Self>) {
        let handoff = {
            let mut state = self.lock_state();
            assert!(state.adds_in_flight > 0, "add operation count underflow");
            state.adds_in_flight -= 1;

            if state.adds_in_flight == 0 && state.mode == LockMode::Locking {
                state.mode = LockMode::Locked;
                match state.lockers.pop_front() {
                    Some(tx) => Handoff::Locker(tx),
                    None => panic!("lock is in LOCKING state without queued lockers"),
                }
            } else {
                Handoff::Nothing
            }
        };
        self.dispatch(handoff);
    }

    fn unlock(self: &Arc<Self>) {
        let handoff = {
            let mut state = self.lock_state();
            assert_eq!(state.mode, LockMode::Locked, "unlock without holding the lock");

            if let Some(tx) = state.lockers.pop_front() {
                Handoff::Locker(tx)
            } else {
                state.mode = LockMode::Normal;
                let adds: Vec<_> = state.queued_adds.drain(..).collect();
                state.adds_in_flight += adds.len();
                Handoff::Adds(adds)
            }
        };
        self.dispatch(handoff);
    }

    fn dispatch(self: &Arc<Self>, handoff: Handoff) {
        match handoff {
            Handoff::Nothing => {}
            Handoff::Locker(tx) => {
                // A cancelled locker hands the lock back through Drop.
                let _ = tx.send(DatabaseLock {
                    owner: Arc::clone(self),
                });
            }
            Handoff::Adds(adds) => {
                for tx in adds {
                    // A cancelled add releases its count through Drop.
                    let _ = tx.send(AddPermit {
                        owner: Arc::clone(self),
                    });
                }
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }
}

/// Holds the database quiescence lock. Unlocks when dropped.
pub struct DatabaseLock {
    owner: Arc<QuiescenceLock>,
}

impl DatabaseLock {
    /// Releases the lock.
    pub fn unlock(self) {
        drop(self);
    }
}

impl Drop for DatabaseLock {
    fn drop(&mut self) {
        self.owner.unlock();
    }
}

impl fmt::Debug for DatabaseLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseLock").finish_non_exhaustive()
    }
}

/// Marks one add as in flight. Released when dropped.
pub(crate) struct AddPermit {
    owner: Arc<QuiescenceLock>,
}

impl Drop for AddPermit {
    fn drop(&mut self) {
        self.owner.finish_add();
    }
}
