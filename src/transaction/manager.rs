use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::{
    config::WriterWait,
    types::{TransactionId, error::DatabaseError},
};

#[derive(Debug, Default)]
struct ManagerState {
    last_committed: TransactionId,
    /// Snapshot id -> number of open read transactions pinned to it.
    readers: BTreeMap<TransactionId, usize>,
    writer_active: bool,
    /// Held by rekey: no reader may register until it is released.
    exclusive: bool,
}

/// Writer admission, reader registrations and the commit counter.
///
/// Commit ids double as snapshot ids: a transaction that began at snapshot
/// `s` sees exactly the commits with id `<= s`.
#[derive(Debug)]
pub struct TransactionManager {
    state: Mutex<ManagerState>,
    writer_released: Condvar,
    exclusive_released: Condvar,
    writer_wait: WriterWait,
}

impl TransactionManager {
    pub fn new(last_committed: TransactionId, writer_wait: WriterWait) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                last_committed,
                ..ManagerState::default()
            }),
            writer_released: Condvar::new(),
            exclusive_released: Condvar::new(),
            writer_wait,
        }
    }

    pub fn last_committed(&self) -> TransactionId {
        self.state.lock().last_committed
    }

    /// Pin the current snapshot for a reader and return it. Waits while an
    /// exclusive writer holds the database.
    pub fn begin_read(&self) -> TransactionId {
        let mut state = self.state.lock();
        while state.exclusive {
            self.exclusive_released.wait(&mut state);
        }
        let snapshot = state.last_committed;
        *state.readers.entry(snapshot).or_insert(0) += 1;
        trace!(snapshot, "reader registered");
        snapshot
    }

    pub fn end_read(&self, snapshot: TransactionId) {
        let mut state = self.state.lock();
        if let Some(count) = state.readers.get_mut(&snapshot) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&snapshot);
            }
        }
        trace!(snapshot, "reader released");
    }

    /// Take the single writer slot according to the wait policy.
    /// Returns the snapshot the writer starts from.
    pub fn acquire_writer(&self) -> Result<TransactionId, DatabaseError> {
        let mut state = self.state.lock();
        self.wait_for_writer_slot(&mut state)?;
        state.writer_active = true;
        Ok(state.last_committed)
    }

    /// Take the writer slot and shut out readers until
    /// [`TransactionManager::release_exclusive`]. Fails with `Conflict` while
    /// any reader is registered.
    pub fn acquire_exclusive(&self) -> Result<TransactionId, DatabaseError> {
        let mut state = self.state.lock();
        self.wait_for_writer_slot(&mut state)?;
        if !state.readers.is_empty() {
            debug!(readers = state.readers.len(), "exclusive access refused, readers active");
            return Err(DatabaseError::Conflict);
        }
        state.writer_active = true;
        state.exclusive = true;
        Ok(state.last_committed)
    }

    fn wait_for_writer_slot(&self, state: &mut MutexGuard<'_, ManagerState>) -> Result<(), DatabaseError> {
        match self.writer_wait {
            WriterWait::Fail => {
                if state.writer_active {
                    debug!("writer busy, failing immediately");
                    return Err(DatabaseError::Conflict);
                }
            }
            WriterWait::Block => {
                while state.writer_active {
                    self.writer_released.wait(state);
                }
            }
            WriterWait::Timeout { millis } => {
                let deadline = Instant::now() + Duration::from_millis(millis);
                while state.writer_active {
                    if self.writer_released.wait_until(state, deadline).timed_out() && state.writer_active {
                        debug!(millis, "timed out waiting for writer");
                        return Err(DatabaseError::Conflict);
                    }
                }
            }
        }
        Ok(())
    }

    /// Take the writer slot without waiting, whatever the policy.
    pub fn try_acquire_writer(&self) -> Option<TransactionId> {
        let mut state = self.state.lock();
        if state.writer_active {
            return None;
        }
        state.writer_active = true;
        Some(state.last_committed)
    }

    pub fn release_writer(&self) {
        self.state.lock().writer_active = false;
        self.writer_released.notify_one();
    }

    pub fn release_exclusive(&self) {
        {
            let mut state = self.state.lock();
            state.exclusive = false;
            state.writer_active = false;
        }
        self.exclusive_released.notify_all();
        self.writer_released.notify_one();
    }

    /// Make `txn_id` the newest snapshot. Called with the writer slot held.
    pub fn publish_commit(&self, txn_id: TransactionId) {
        let mut state = self.state.lock();
        debug_assert!(txn_id > state.last_committed);
        state.last_committed = txn_id;
    }

    /// Oldest snapshot still pinned by a reader.
    pub fn oldest_snapshot(&self) -> Option<TransactionId> {
        self.state.lock().readers.keys().next().copied()
    }

    pub fn active_readers(&self) -> usize {
        self.state.lock().readers.values().sum()
    }
}
