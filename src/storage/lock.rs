//! Lock manager collaborator seam.
//!
//! The core acquires page and record locks by resource id and releases
//! them by handle; deadlock detection is outside this crate. Conflicts
//! surface as `LockConflict` for the caller to retry; the recovery
//! driver never takes locks because it runs with concurrency disabled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::common::types::{PageId, TxnId};

/// Error type for lock operations
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock conflict on {0:?}: timed out waiting for a compatible mode")]
    LockConflict(ResourceId),
}

/// Result type for lock operations
pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A lockable resource: a page, or a record slot on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Page(PageId),
    Record(PageId, u32),
}

/// Proof of an acquired lock; pass back to `release`.
#[derive(Debug)]
pub struct LockHandle {
    owner: TxnId,
    resource: ResourceId,
    mode: LockMode,
}

#[derive(Default)]
struct LockState {
    sharing: HashSet<TxnId>,
    exclusive: Option<TxnId>,
    /// Threads currently blocked on this slot; a slot with waiters must
    /// stay in the table so they wake on the same state they wait on.
    waiting: usize,
}

impl LockState {
    fn compatible(&self, owner: TxnId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive.is_none_or(|holder| holder == owner),
            LockMode::Exclusive => {
                self.exclusive.is_none_or(|holder| holder == owner)
                    && self.sharing.iter().all(|holder| *holder == owner)
            }
        }
    }

    fn grant(&mut self, owner: TxnId, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.sharing.insert(owner);
            }
            LockMode::Exclusive => self.exclusive = Some(owner),
        }
    }

    fn is_empty(&self) -> bool {
        self.sharing.is_empty() && self.exclusive.is_none() && self.waiting == 0
    }
}

struct WaitSlot {
    state: Mutex<LockState>,
    cond: Condvar,
}

/// Mode-compatibility lock table keyed by resource id.
pub struct LockManager {
    table: Mutex<HashMap<ResourceId, Arc<WaitSlot>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self { table: Mutex::new(HashMap::new()) }
    }

    /// Acquire a lock, waiting up to `timeout` for conflicting holders to
    /// release. A zero timeout is an immediate try-lock.
    pub fn acquire(
        &self,
        owner: TxnId,
        resource: ResourceId,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockHandle> {
        let slot = {
            let mut table = self.table.lock();
            table
                .entry(resource)
                .or_insert_with(|| Arc::new(WaitSlot { state: Mutex::new(LockState::default()), cond: Condvar::new() }))
                .clone()
        };

        let mut state = slot.state.lock();
        if !state.compatible(owner, mode) {
            let deadline = std::time::Instant::now() + timeout;
            state.waiting += 1;
            while !state.compatible(owner, mode) {
                if slot.cond.wait_until(&mut state, deadline).timed_out() {
                    state.waiting -= 1;
                    return Err(LockError::LockConflict(resource));
                }
            }
            state.waiting -= 1;
        }
        state.grant(owner, mode);
        Ok(LockHandle { owner, resource, mode })
    }

    pub fn release(&self, handle: LockHandle) {
        let slot = {
            let table = self.table.lock();
            match table.get(&handle.resource) {
                Some(slot) => slot.clone(),
                None => return,
            }
        };

        {
            let mut state = slot.state.lock();
            match handle.mode {
                LockMode::Shared => {
                    state.sharing.remove(&handle.owner);
                }
                LockMode::Exclusive => {
                    if state.exclusive == Some(handle.owner) {
                        state.exclusive = None;
                    }
                }
            }
            slot.cond.notify_all();
            if state.is_empty() {
                self.table.lock().remove(&handle.resource);
            }
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
