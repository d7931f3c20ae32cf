//! # kNN Operators
//!
//! Breakers producing, for each query vector, the k nearest tuples in
//! ascending distance order (ties by ascending tuple id) as records with
//! a `distance` column.
//!
//! [`KnnFullscan`] partitions the tuple range across worker threads
//! (bounded by the configured I/O parallelism), runs one bounded heap per
//! query per worker, and merges the per-worker heaps at the end. An
//! optional Boolean prefilter is applied per tuple before the distance is
//! computed.
//!
//! [`KnnIndexed`] scans a VA-file's signatures instead: signatures whose
//! lower distance bound exceeds the current k-th best distance are skipped
//! without touching the vector column (VA-SSA); survivors get their exact
//! vector read and measured.

use super::{Operator, Record};
use crate::catalog::{Entity, EntityTx};
use crate::error::DbError;
use crate::index::Index;
use crate::math::{distance_f64, kernel_f32, weighted_f32, KnnHeap};
use crate::query::predicate::{BooleanPredicate, KnnPredicate};
use crate::query::DISTANCE_COLUMN;
use crate::storage::TupleId;
use crate::types::Value;
use crate::txn::TransactionContext;
use eyre::Result;
use parking_lot::Mutex;
use smallvec::smallvec;
use std::collections::VecDeque;
use std::sync::Arc;

fn distance_to(
    predicate: &KnnPredicate,
    query_index: usize,
    value: &Value,
) -> Result<f64> {
    let query = &predicate.queries[query_index];
    match value {
        Value::FloatVector(v) => {
            if let Some(weights) = predicate.effective_weights() {
                Ok(weighted_f32(
                    predicate.distance,
                    query,
                    v,
                    &weights[query_index],
                ))
            } else {
                Ok(kernel_f32(predicate.distance)(query, v))
            }
        }
        Value::DoubleVector(v) => {
            let q: Vec<f64> = query.iter().map(|x| *x as f64).collect();
            Ok(distance_f64(predicate.distance, &q, v))
        }
        other => Err(DbError::OperatorExecution(format!(
            "kNN over non-vector value of type {}",
            other.type_of().name()
        ))
        .into()),
    }
}

fn heaps_to_records(heaps: Vec<KnnHeap>, columns: &Arc<Vec<String>>) -> VecDeque<Record> {
    let mut records = VecDeque::new();
    for heap in heaps {
        for neighbor in heap.into_sorted() {
            records.push_back(Record::new(
                neighbor.tid,
                Arc::clone(columns),
                smallvec![Some(Value::Double(neighbor.distance))],
            ));
        }
    }
    records
}

pub struct KnnFullscan {
    tx: Arc<EntityTx>,
    predicate: KnnPredicate,
    prefilter: Option<BooleanPredicate>,
    parallelism: usize,
    columns: Arc<Vec<String>>,
    results: Option<VecDeque<Record>>,
}

impl KnnFullscan {
    pub fn new(
        tx: Arc<EntityTx>,
        predicate: KnnPredicate,
        prefilter: Option<BooleanPredicate>,
        parallelism: usize,
    ) -> Self {
        Self {
            tx,
            predicate,
            prefilter,
            parallelism,
            columns: Arc::new(vec![DISTANCE_COLUMN.to_string()]),
            results: None,
        }
    }

    /// Scans one tuple range with one heap per query vector.
    fn scan_range(
        entity: &Arc<Entity>,
        ctx: &TransactionContext,
        predicate: &KnnPredicate,
        prefilter: &Option<BooleanPredicate>,
        range: (TupleId, TupleId),
    ) -> Result<Vec<KnnHeap>> {
        let mut heaps: Vec<KnnHeap> = (0..predicate.queries.len())
            .map(|_| KnnHeap::new(predicate.k))
            .collect();
        for tid in range.0..range.1 {
            ctx.check_not_cancelled()?;
            if entity.is_deleted(tid)? {
                continue;
            }
            if let Some(filter) = prefilter {
                let lookup =
                    |column: &str| -> Result<Option<Value>> { entity.read_value(column, tid) };
                if !filter.matches(&lookup)? {
                    continue;
                }
            }
            let Some(vector) = entity.read_value(&predicate.column, tid)? else {
                continue;
            };
            for (j, heap) in heaps.iter_mut().enumerate() {
                let distance = distance_to(predicate, j, &vector)?;
                heap.insert(tid, distance);
            }
        }
        Ok(heaps)
    }

    /// Drains the entity: partitions the tuple range across workers and
    /// merges their heaps.
    fn materialize(&self) -> Result<VecDeque<Record>> {
        let max = self.tx.max_tuple_id()?;
        let entity = Arc::clone(self.tx.entity());
        let ctx = Arc::clone(self.tx.ctx());
        // No point spinning up workers for a handful of tuples.
        let workers = self.parallelism.min(((max / 64) + 1) as usize).max(1);

        let merged: Vec<KnnHeap> = if workers <= 1 || max == 0 {
            Self::scan_range(&entity, &ctx, &self.predicate, &self.prefilter, (0, max))?
        } else {
            let chunk = max.div_ceil(workers as u64);
            let ranges: Vec<(TupleId, TupleId)> = (0..workers as u64)
                .map(|w| (w * chunk, ((w + 1) * chunk).min(max)))
                .filter(|(s, e)| s < e)
                .collect();

            let predicate = &self.predicate;
            let prefilter = &self.prefilter;
            let partials: Vec<Result<Vec<KnnHeap>>> = std::thread::scope(|scope| {
                let handles: Vec<_> = ranges
                    .iter()
                    .map(|range| {
                        let entity = Arc::clone(&entity);
                        let ctx = Arc::clone(&ctx);
                        let range = *range;
                        scope.spawn(move || {
                            Self::scan_range(&entity, &ctx, predicate, prefilter, range)
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().expect("kNN worker panicked")).collect()
            });

            let mut merged: Vec<KnnHeap> = (0..self.predicate.queries.len())
                .map(|_| KnnHeap::new(self.predicate.k))
                .collect();
            for partial in partials {
                for (target, heap) in merged.iter_mut().zip(partial?) {
                    target.merge(heap);
                }
            }
            merged
        };

        Ok(heaps_to_records(merged, &self.columns))
    }
}

impl Operator for KnnFullscan {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        self.tx.ctx().check_not_cancelled()?;
        if self.results.is_none() {
            // Breaker: the child range is consumed in full before the
            // first record leaves.
            self.results = Some(self.materialize()?);
        }
        Ok(self.results.as_mut().and_then(|r| r.pop_front()))
    }
}

pub struct KnnIndexed {
    tx: Arc<EntityTx>,
    index: Arc<Mutex<Index>>,
    predicate: KnnPredicate,
    columns: Arc<Vec<String>>,
    results: Option<VecDeque<Record>>,
}

impl KnnIndexed {
    pub fn new(tx: Arc<EntityTx>, index: Arc<Mutex<Index>>, predicate: KnnPredicate) -> Self {
        Self {
            tx,
            index,
            predicate,
            columns: Arc::new(vec![DISTANCE_COLUMN.to_string()]),
            results: None,
        }
    }

    fn materialize(&self) -> Result<VecDeque<Record>> {
        let guard = self.index.lock();
        let vaf = guard.as_vaf().ok_or_else(|| {
            DbError::OperatorSetup(format!("index {} is not a VA-file", guard.name()))
        })?;

        let mut heaps = Vec::with_capacity(self.predicate.queries.len());
        for (j, query) in self.predicate.queries.iter().enumerate() {
            let bounds = vaf.bounds(query, self.predicate.distance)?;
            let mut heap = KnnHeap::new(self.predicate.k);
            for (tid, signature) in vaf.signatures() {
                self.tx.ctx().check_not_cancelled()?;
                // VA-SSA: prune on the lower bound against the running
                // k-th best distance.
                if !bounds.is_candidate(signature, heap.threshold()) {
                    continue;
                }
                let Some(vector) = self.tx.read_value(&self.predicate.column, tid)? else {
                    continue;
                };
                let distance = distance_to(&self.predicate, j, &vector)?;
                heap.insert(tid, distance);
            }
            heaps.push(heap);
        }
        Ok(heaps_to_records(heaps, &self.columns))
    }
}

impl Operator for KnnIndexed {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        self.tx.ctx().check_not_cancelled()?;
        if self.results.is_none() {
            self.results = Some(self.materialize()?);
        }
        Ok(self.results.as_mut().and_then(|r| r.pop_front()))
    }
}
