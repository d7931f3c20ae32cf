//! # Transactions
//!
//! Transaction identifiers are monotonically increasing 64-bit integers
//! allocated from a process-wide counter. Each transaction carries a status
//! in a small state machine:
//!
//! ```text
//! CLEAN → READ → DIRTY → COMMIT → CLOSED
//!    ↘                 ↘ ERROR ↗
//!      ↘ ROLLBACK ──────────────↗
//! ```
//!
//! - `CLEAN → READ` on the first read, `READ → DIRTY` on the first write.
//! - Writes require `ReadWrite` mode; a read-only transaction raises
//!   `TransactionReadOnly` instead of transitioning.
//! - Any unrecoverable storage error moves the transaction to `ERROR`,
//!   from which only rollback is permitted.
//! - Cancellation is cooperative: operators and lock waits check the flag
//!   and surface `DbError::Cancelled`, which also moves the status to
//!   `ERROR` so the transaction must roll back.
//!
//! Isolation is lock-based two-phase locking, not snapshot-based: logical
//! locks acquired through [`LockManager`] are held until the transaction
//! resolves and released in one sweep.

mod lock;

pub use lock::{LockManager, LockMode};

use crate::error::DbError;
use eyre::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Clean,
    Read,
    Dirty,
    Commit,
    Rollback,
    Error,
    Closed,
}

pub struct TransactionContext {
    id: TransactionId,
    mode: TxMode,
    status: Mutex<TxStatus>,
    cancelled: AtomicBool,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
}

impl TransactionContext {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    pub fn status(&self) -> TxStatus {
        *self.status.lock()
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Convenience for acquiring a logical lock under this transaction's
    /// configured deadline.
    pub fn request_lock(&self, dbo: &str, mode: LockMode) -> Result<()> {
        self.locks.request_lock(self, dbo, mode, self.lock_timeout)
    }

    pub fn check_not_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Acquire) {
            *self.status.lock() = TxStatus::Error;
            return Err(DbError::Cancelled(self.id).into());
        }
        Ok(())
    }

    /// Verifies the transaction can still perform work and returns its
    /// current status.
    pub fn check_active(&self) -> Result<TxStatus> {
        self.check_not_cancelled()?;
        let status = *self.status.lock();
        match status {
            TxStatus::Closed | TxStatus::Commit | TxStatus::Rollback => {
                Err(DbError::TransactionClosed(self.id).into())
            }
            TxStatus::Error => Err(DbError::TransactionInError(self.id).into()),
            _ => Ok(status),
        }
    }

    /// First-read transition: `CLEAN → READ`.
    pub fn begin_read(&self) -> Result<()> {
        self.check_active()?;
        let mut status = self.status.lock();
        if *status == TxStatus::Clean {
            *status = TxStatus::Read;
        }
        Ok(())
    }

    /// First-write transition: `CLEAN/READ → DIRTY`. Requires `ReadWrite`.
    pub fn begin_write(&self) -> Result<()> {
        self.check_active()?;
        if self.mode == TxMode::ReadOnly {
            return Err(DbError::TransactionReadOnly(self.id).into());
        }
        let mut status = self.status.lock();
        if matches!(*status, TxStatus::Clean | TxStatus::Read) {
            *status = TxStatus::Dirty;
        }
        Ok(())
    }

    /// Moves the transaction to `ERROR`; only rollback remains possible.
    pub fn fail(&self) {
        let mut status = self.status.lock();
        if !matches!(*status, TxStatus::Closed) {
            *status = TxStatus::Error;
        }
    }

    /// Requests cooperative cancellation; takes effect at the next
    /// operator boundary or lock wait.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Finalizes the transaction as committed and releases its locks.
    pub fn commit(&self) -> Result<()> {
        {
            let mut status = self.status.lock();
            match *status {
                TxStatus::Clean | TxStatus::Read | TxStatus::Dirty => {
                    *status = TxStatus::Commit;
                }
                TxStatus::Error => return Err(DbError::TransactionInError(self.id).into()),
                _ => return Err(DbError::TransactionClosed(self.id).into()),
            }
        }
        self.locks.release_all(self.id);
        *self.status.lock() = TxStatus::Closed;
        Ok(())
    }

    /// Finalizes the transaction as rolled back and releases its locks.
    /// Permitted from every live state, including `ERROR`.
    pub fn rollback(&self) -> Result<()> {
        {
            let mut status = self.status.lock();
            match *status {
                TxStatus::Clean
                | TxStatus::Read
                | TxStatus::Dirty
                | TxStatus::Error => {
                    *status = TxStatus::Rollback;
                }
                _ => return Err(DbError::TransactionClosed(self.id).into()),
            }
        }
        self.locks.release_all(self.id);
        *self.status.lock() = TxStatus::Closed;
        Ok(())
    }
}

/// Allocates transaction ids and wires new contexts to the process-wide
/// lock manager.
pub struct TransactionManager {
    next_id: AtomicU64,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
}

impl TransactionManager {
    pub fn new(locks: Arc<LockManager>) -> Self {
        Self::with_timeout(locks, Duration::from_secs(10))
    }

    pub fn with_timeout(locks: Arc<LockManager>, lock_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            locks,
            lock_timeout,
        }
    }

    pub fn begin(&self, mode: TxMode) -> Arc<TransactionContext> {
        Arc::new(TransactionContext {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            mode,
            status: Mutex::new(TxStatus::Clean),
            cancelled: AtomicBool::new(false),
            locks: Arc::clone(&self.locks),
            lock_timeout: self.lock_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txns() -> TransactionManager {
        TransactionManager::new(Arc::new(LockManager::new()))
    }

    #[test]
    fn ids_are_monotone() {
        let txns = txns();
        let a = txns.begin(TxMode::ReadOnly);
        let b = txns.begin(TxMode::ReadWrite);
        assert!(b.id() > a.id());
    }

    #[test]
    fn status_walk() {
        let txns = txns();
        let tx = txns.begin(TxMode::ReadWrite);
        assert_eq!(tx.status(), TxStatus::Clean);
        tx.begin_read().unwrap();
        assert_eq!(tx.status(), TxStatus::Read);
        tx.begin_write().unwrap();
        assert_eq!(tx.status(), TxStatus::Dirty);
        tx.commit().unwrap();
        assert_eq!(tx.status(), TxStatus::Closed);
        assert!(tx.begin_read().is_err());
    }

    #[test]
    fn readonly_rejects_writes() {
        let txns = txns();
        let tx = txns.begin(TxMode::ReadOnly);
        let err = tx.begin_write().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::TransactionReadOnly(_))
        ));
    }

    #[test]
    fn error_state_only_rolls_back() {
        let txns = txns();
        let tx = txns.begin(TxMode::ReadWrite);
        tx.begin_write().unwrap();
        tx.fail();
        assert!(tx.commit().is_err());
        tx.rollback().unwrap();
        assert_eq!(tx.status(), TxStatus::Closed);
    }

    #[test]
    fn cancellation_moves_to_error() {
        let txns = txns();
        let tx = txns.begin(TxMode::ReadWrite);
        tx.cancel();
        let err = tx.check_active().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Cancelled(_))
        ));
        assert_eq!(tx.status(), TxStatus::Error);
        tx.rollback().unwrap();
    }
}
