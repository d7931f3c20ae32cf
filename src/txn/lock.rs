//! # Logical Lock Manager
//!
//! Shared/exclusive locks on database objects (schemas, entities, indexes),
//! identified by their fully-qualified names. Locks are held for the
//! lifetime of a transaction and released in one sweep when it resolves.
//!
//! Acquisition is deadline-based: a waiter parks on a condvar and gives up
//! with `DbError::Timeout` when the deadline passes. Cancellation of the
//! owning transaction is honored at every wake-up. A transaction holding
//! the only shared lock on an object may upgrade it to exclusive in place.
//!
//! Lock order above this manager is fixed (catalogue close-lock → schema
//! close-lock → entity close-lock → entity logical lock → column latch →
//! page pins), which keeps cycles structurally impossible.

use super::{TransactionContext, TransactionId};
use crate::error::DbError;
use eyre::Result;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    NoLock,
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LockState {
    shared: HashSet<TransactionId>,
    exclusive: Option<TransactionId>,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, LockState>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires (or upgrades to) `mode` on `dbo` for the context's
    /// transaction, waiting at most `timeout`.
    pub fn request_lock(
        &self,
        ctx: &TransactionContext,
        dbo: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()> {
        if mode == LockMode::NoLock {
            return Ok(());
        }
        let txn = ctx.id();
        let deadline = Instant::now() + timeout;
        let mut locks = self.locks.lock();
        loop {
            ctx.check_not_cancelled()?;
            let state = locks.entry(dbo.to_string()).or_default();
            let grantable = match mode {
                LockMode::NoLock => true,
                LockMode::Shared => state.exclusive.is_none() || state.exclusive == Some(txn),
                LockMode::Exclusive => {
                    let others_shared = state.shared.iter().any(|t| *t != txn);
                    (state.exclusive.is_none() || state.exclusive == Some(txn)) && !others_shared
                }
            };
            if grantable {
                match mode {
                    LockMode::Shared => {
                        if state.exclusive != Some(txn) {
                            state.shared.insert(txn);
                        }
                    }
                    LockMode::Exclusive => {
                        state.shared.remove(&txn);
                        state.exclusive = Some(txn);
                    }
                    LockMode::NoLock => {}
                }
                return Ok(());
            }

            let wait = deadline.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                return Err(DbError::Timeout(format!(
                    "acquiring {:?} lock on {}",
                    mode, dbo
                ))
                .into());
            }
            self.released.wait_for(&mut locks, wait);
        }
    }

    /// Mode the transaction currently holds on `dbo`.
    pub fn mode_held(&self, txn: TransactionId, dbo: &str) -> LockMode {
        let locks = self.locks.lock();
        match locks.get(dbo) {
            Some(state) if state.exclusive == Some(txn) => LockMode::Exclusive,
            Some(state) if state.shared.contains(&txn) => LockMode::Shared,
            _ => LockMode::NoLock,
        }
    }

    /// Releases every lock the transaction holds.
    pub fn release_all(&self, txn: TransactionId) {
        let mut locks = self.locks.lock();
        locks.retain(|_, state| {
            state.shared.remove(&txn);
            if state.exclusive == Some(txn) {
                state.exclusive = None;
            }
            !state.is_free()
        });
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{TransactionManager, TxMode};
    use std::sync::Arc;

    fn manager() -> (Arc<LockManager>, TransactionManager) {
        let locks = Arc::new(LockManager::new());
        let txns = TransactionManager::new(Arc::clone(&locks));
        (locks, txns)
    }

    #[test]
    fn shared_locks_coexist() {
        let (locks, txns) = manager();
        let a = txns.begin(TxMode::ReadOnly);
        let b = txns.begin(TxMode::ReadOnly);
        locks
            .request_lock(&a, "warren.test", LockMode::Shared, Duration::from_millis(50))
            .unwrap();
        locks
            .request_lock(&b, "warren.test", LockMode::Shared, Duration::from_millis(50))
            .unwrap();
        assert_eq!(locks.mode_held(a.id(), "warren.test"), LockMode::Shared);
        assert_eq!(locks.mode_held(b.id(), "warren.test"), LockMode::Shared);
    }

    #[test]
    fn exclusive_blocks_and_times_out() {
        let (locks, txns) = manager();
        let a = txns.begin(TxMode::ReadWrite);
        let b = txns.begin(TxMode::ReadWrite);
        locks
            .request_lock(&a, "warren.test", LockMode::Exclusive, Duration::from_millis(50))
            .unwrap();
        let err = locks
            .request_lock(&b, "warren.test", LockMode::Shared, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Timeout(_))
        ));
    }

    #[test]
    fn upgrade_when_sole_sharer() {
        let (locks, txns) = manager();
        let a = txns.begin(TxMode::ReadWrite);
        locks
            .request_lock(&a, "warren.test", LockMode::Shared, Duration::from_millis(50))
            .unwrap();
        locks
            .request_lock(&a, "warren.test", LockMode::Exclusive, Duration::from_millis(50))
            .unwrap();
        assert_eq!(locks.mode_held(a.id(), "warren.test"), LockMode::Exclusive);
    }

    #[test]
    fn release_unblocks_waiters() {
        let (locks, txns) = manager();
        let a = txns.begin(TxMode::ReadWrite);
        locks
            .request_lock(&a, "warren.e", LockMode::Exclusive, Duration::from_millis(50))
            .unwrap();

        let locks2 = Arc::clone(&locks);
        let b = txns.begin(TxMode::ReadWrite);
        let handle = std::thread::spawn(move || {
            locks2.request_lock(&b, "warren.e", LockMode::Exclusive, Duration::from_secs(2))
        });
        std::thread::sleep(Duration::from_millis(30));
        locks.release_all(a.id());
        handle.join().unwrap().unwrap();
    }
}
