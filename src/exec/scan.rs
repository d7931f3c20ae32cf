//! # Source Operators
//!
//! Leaves of the pipeline: full scans, ranged scans and seeded samples.
//! All three emit records in ascending tuple order, skipping deleted
//! tuples, and observe the transaction's own uncommitted writes (reads go
//! through the entity transaction).

use super::{Operator, Record};
use crate::catalog::EntityTx;
use crate::storage::TupleId;
use eyre::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use smallvec::SmallVec;
use std::sync::Arc;

pub struct EntityScan {
    tx: Arc<EntityTx>,
    columns: Arc<Vec<String>>,
    next_tid: TupleId,
    end: TupleId,
}

impl EntityScan {
    /// `range` bounds the scanned tuple ids; `None` scans everything.
    pub fn new(
        tx: Arc<EntityTx>,
        columns: Vec<String>,
        range: Option<(TupleId, TupleId)>,
    ) -> Result<Self> {
        let end = tx.max_tuple_id()?;
        let (start, end) = match range {
            Some((s, e)) => (s, e.min(end)),
            None => (0, end),
        };
        Ok(Self {
            tx,
            columns: Arc::new(columns),
            next_tid: start,
            end,
        })
    }
}

impl Operator for EntityScan {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        self.tx.ctx().check_not_cancelled()?;
        while self.next_tid < self.end {
            let tid = self.next_tid;
            self.next_tid += 1;
            if let Some(values) = self.tx.read_row(tid, &self.columns)? {
                return Ok(Some(Record::new(
                    tid,
                    Arc::clone(&self.columns),
                    values.into_iter().collect::<SmallVec<_>>(),
                )));
            }
        }
        Ok(None)
    }
}

/// A scan split into contiguous tuple ranges. Emission order matches the
/// plain scan; the partitioning exists so a parallel consumer (the kNN
/// fullscan) can divide the same ranges across workers.
pub struct RangedEntityScan {
    inner: EntityScan,
    #[allow(dead_code)]
    partitions: usize,
}

impl RangedEntityScan {
    pub fn new(tx: Arc<EntityTx>, columns: Vec<String>, partitions: usize) -> Result<Self> {
        Ok(Self {
            inner: EntityScan::new(tx, columns, None)?,
            partitions: partitions.max(1),
        })
    }
}

impl Operator for RangedEntityScan {
    fn columns(&self) -> Arc<Vec<String>> {
        self.inner.columns()
    }

    fn next(&mut self) -> Result<Option<Record>> {
        self.inner.next()
    }
}

/// Deterministic random sample: the same seed over the same committed
/// state yields the same tuples.
pub struct EntitySample {
    tx: Arc<EntityTx>,
    columns: Arc<Vec<String>>,
    picked: std::vec::IntoIter<TupleId>,
}

impl EntitySample {
    pub fn new(tx: Arc<EntityTx>, columns: Vec<String>, size: u64, seed: u64) -> Result<Self> {
        let max = tx.max_tuple_id()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let amount = (size as usize).min(max as usize);
        let mut picked: Vec<TupleId> = rand::seq::index::sample(&mut rng, max as usize, amount)
            .into_iter()
            .map(|i| i as TupleId)
            .collect();
        picked.sort_unstable();
        Ok(Self {
            tx,
            columns: Arc::new(columns),
            picked: picked.into_iter(),
        })
    }
}

impl Operator for EntitySample {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        self.tx.ctx().check_not_cancelled()?;
        for tid in self.picked.by_ref() {
            if let Some(values) = self.tx.read_row(tid, &self.columns)? {
                return Ok(Some(Record::new(
                    tid,
                    Arc::clone(&self.columns),
                    values.into_iter().collect::<SmallVec<_>>(),
                )));
            }
        }
        Ok(None)
    }
}
