//! # Catalogue Hierarchy
//!
//! The database-object tree: a [`Catalogue`] roots named [`Schema`]s, a
//! schema holds [`Entity`]s, an entity holds columns and indexes. Every
//! level exposes a transactional view (`*Tx`) created with `begin_tx`;
//! structural mutations register a forward filesystem action and its
//! reverse in the view's post-commit / post-rollback queues, so a partial
//! failure resolves to a consistent catalogue once the transaction ends.
//!
//! ## On-disk layout
//!
//! ```text
//! root/
//! ├── catalogue.db           (schema name, directory) records
//! └── warren/                one directory per schema
//!     ├── index.db           (entity name, directory) records
//!     └── test/              one directory per entity
//!         ├── index.db       columns, indexes, statistics
//!         ├── id.col         one page file per column
//!         ├── feat.col
//!         └── feat_idx/      one directory per index
//! ```
//!
//! Dropping a schema or entity renames its directory to a shadow name
//! (`~<name>#<txid>`); commit deletes the shadow, rollback restores it.
//!
//! ## Close locks
//!
//! Each DBO carries a [`CloseLock`]: transactions hold it while they use
//! the object, teardown requires it free. A closed DBO refuses new
//! acquisitions with `TransactionDboClosed`.

mod catalogue;
mod column;
mod entity;
mod schema;

pub use catalogue::{Catalogue, CatalogueTx};
pub use column::{ColumnDef, ColumnHandle};
pub use entity::{require_columns, Entity, EntityStatistics, EntityTx, IndexDef};
pub use schema::{Schema, SchemaTx};

use crate::error::DbError;
use crate::txn::TransactionId;
use eyre::Result;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Deferred filesystem / registry action queued on a transactional view.
pub type Action = Box<dyn FnOnce() -> Result<()> + Send>;

/// Blocks teardown of a DBO while transactions use it.
#[derive(Default)]
pub struct CloseLock {
    active: AtomicU32,
    closed: AtomicBool,
}

impl CloseLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a transaction with the DBO; fails once it is closed.
    pub fn acquire(
        self: &Arc<Self>,
        txn: TransactionId,
        fqname: &str,
    ) -> Result<CloseLockGuard> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::TransactionDboClosed(txn, fqname.to_string()).into());
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        // Re-check: close may have won the race before our increment.
        if self.closed.load(Ordering::Acquire) {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(DbError::TransactionDboClosed(txn, fqname.to_string()).into());
        }
        Ok(CloseLockGuard {
            lock: Arc::clone(self),
        })
    }

    /// Marks the DBO closed; fails while transactions still hold it.
    pub fn close(&self, fqname: &str) -> Result<()> {
        let active = self.active.load(Ordering::Acquire);
        eyre::ensure!(
            active == 0,
            "cannot close {}: {} transactions still hold it",
            fqname,
            active
        );
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct CloseLockGuard {
    lock: Arc<CloseLock>,
}

impl std::fmt::Debug for CloseLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseLockGuard").finish()
    }
}

impl Drop for CloseLockGuard {
    fn drop(&mut self) {
        self.lock.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shadow directory name used by the transactional drop protocol.
pub(crate) fn shadow_name(name: &str, txn: TransactionId) -> String {
    format!("~{}#{}", name, txn)
}

/// Runs every queued action, surfacing the first failure after all ran.
pub(crate) fn run_actions(actions: Vec<Action>) -> Result<()> {
    let mut first_error = None;
    for action in actions {
        if let Err(e) = action() {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_lock_blocks_while_held() {
        let lock = CloseLock::new();
        let guard = lock.acquire(1, "warren").unwrap();
        assert!(lock.close("warren").is_err());
        drop(guard);
        lock.close("warren").unwrap();
        assert!(lock.is_closed());
    }

    #[test]
    fn closed_lock_refuses_new_transactions() {
        let lock = CloseLock::new();
        lock.close("warren").unwrap();
        let err = lock.acquire(7, "warren").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::TransactionDboClosed(7, _))
        ));
    }

    #[test]
    fn actions_all_run_despite_failure() {
        use std::sync::atomic::AtomicUsize;
        let counter = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&counter);
        let b = Arc::clone(&counter);
        let actions: Vec<Action> = vec![
            Box::new(move || {
                a.fetch_add(1, Ordering::SeqCst);
                eyre::bail!("first fails")
            }),
            Box::new(move || {
                b.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ];
        assert!(run_actions(actions).is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
