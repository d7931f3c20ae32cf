//! # Execution Engine
//!
//! Pull-based operator pipelines over an [`EntityTx`]. Every operator
//! exposes `next() → Option<Record>`; breakers (kNN, aggregates) drain
//! their child before emitting. Cancellation of the enclosing transaction
//! is checked at every operator boundary, and a producer failure aborts
//! the pipeline with a typed cause: a failing query yields no records
//! rather than a truncated stream.

pub mod dml;
pub mod filter;
pub mod knn;
pub mod projection;
pub mod scan;

use crate::catalog::EntityTx;
use crate::config::EngineConfig;
use crate::error::DbError;
use crate::index::IndexKind;
use crate::query::physical::PhysicalPlan;
use crate::query::SCORE_COLUMN;
use crate::storage::TupleId;
use crate::types::Value;
use eyre::Result;
use smallvec::SmallVec;
use std::sync::Arc;

/// One tuple flowing through a pipeline: its id plus typed, nullable
/// values under shared column names.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub tid: TupleId,
    columns: Arc<Vec<String>>,
    values: SmallVec<[Option<Value>; 8]>,
}

impl Record {
    pub fn new(
        tid: TupleId,
        columns: Arc<Vec<String>>,
        values: SmallVec<[Option<Value>; 8]>,
    ) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self {
            tid,
            columns,
            values,
        }
    }

    pub fn columns(&self) -> &Arc<Vec<String>> {
        &self.columns
    }

    pub fn values(&self) -> &[Option<Value>] {
        &self.values
    }

    /// Cell by column name.
    pub fn get(&self, column: &str) -> Option<&Option<Value>> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }
}

pub trait Operator: Send {
    /// Output column names, fixed for the operator's lifetime.
    fn columns(&self) -> Arc<Vec<String>>;
    /// Produces the next record; `None` ends the stream.
    fn next(&mut self) -> Result<Option<Record>>;
}

/// Builds the operator pipeline for a physical tree over one entity
/// transaction.
pub fn build(
    plan: &PhysicalPlan,
    tx: &Arc<EntityTx>,
    config: &EngineConfig,
) -> Result<Box<dyn Operator>> {
    Ok(match plan {
        PhysicalPlan::EntityScan { columns, .. } => {
            Box::new(scan::EntityScan::new(Arc::clone(tx), columns.clone(), None)?)
        }
        PhysicalPlan::RangedEntityScan {
            columns,
            partitions,
            ..
        } => Box::new(scan::RangedEntityScan::new(
            Arc::clone(tx),
            columns.clone(),
            *partitions,
        )?),
        PhysicalPlan::EntitySample {
            columns,
            size,
            seed,
            ..
        } => Box::new(scan::EntitySample::new(
            Arc::clone(tx),
            columns.clone(),
            *size,
            *seed,
        )?),
        PhysicalPlan::LinearScanFilter { input, predicate } => {
            let child = build(input, tx, config)?;
            Box::new(filter::LinearScanFilter::new(child, predicate.clone()))
        }
        PhysicalPlan::IndexedFilter {
            index,
            kind,
            predicate,
            ..
        } => {
            let handle = tx.index_for_name(index)?;
            // The hash index reconstructs the key column itself; the text
            // index only contributes a score, the raw value is fetched.
            let columns = match kind {
                IndexKind::UniqueHash => vec![handle.lock().column().to_string()],
                IndexKind::InvertedText => vec![SCORE_COLUMN.to_string()],
                IndexKind::VaFile => {
                    return Err(DbError::OperatorSetup(format!(
                        "index {} cannot serve boolean filters",
                        index
                    ))
                    .into())
                }
            };
            Box::new(filter::IndexedFilter::new(
                Arc::clone(tx),
                handle,
                predicate.clone(),
                columns,
            ))
        }
        PhysicalPlan::FetchColumns { input, columns, .. } => {
            let child = build(input, tx, config)?;
            Box::new(filter::FetchColumns::new(
                Arc::clone(tx),
                child,
                columns.clone(),
            ))
        }
        PhysicalPlan::KnnFullscan {
            predicate,
            prefilter,
            parallelism,
            ..
        } => Box::new(knn::KnnFullscan::new(
            Arc::clone(tx),
            predicate.clone(),
            prefilter.clone(),
            (*parallelism).max(1),
        )),
        PhysicalPlan::KnnIndexed {
            index, predicate, ..
        } => {
            let handle = tx.index_for_name(index)?;
            Box::new(knn::KnnIndexed::new(
                Arc::clone(tx),
                handle,
                predicate.clone(),
            ))
        }
        PhysicalPlan::SelectProjection { input, columns } => {
            let child = build(input, tx, config)?;
            Box::new(projection::SelectProjection::new(child, columns.clone()))
        }
        PhysicalPlan::CountProjection { input } => {
            let child = build(input, tx, config)?;
            Box::new(projection::CountProjection::new(child))
        }
        PhysicalPlan::ExistsProjection { input } => {
            let child = build(input, tx, config)?;
            Box::new(projection::ExistsProjection::new(child))
        }
        PhysicalPlan::AggregateProjection {
            input,
            function,
            columns,
        } => {
            let child = build(input, tx, config)?;
            let (column, alias) = columns
                .first()
                .cloned()
                .ok_or_else(|| DbError::OperatorSetup("aggregate without a column".into()))?;
            Box::new(projection::AggregateProjection::new(
                child, *function, column, alias,
            ))
        }
        PhysicalPlan::Limit { input, limit, skip } => {
            let child = build(input, tx, config)?;
            Box::new(projection::Limit::new(child, *limit, *skip))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_lookup_by_name() {
        let columns = Arc::new(vec!["id".to_string(), "feat".to_string()]);
        let mut values: SmallVec<[Option<Value>; 8]> = SmallVec::new();
        values.push(Some(Value::String("a".into())));
        values.push(None);
        let record = Record::new(7, columns, values);

        assert_eq!(record.tid, 7);
        assert_eq!(record.get("id"), Some(&Some(Value::String("a".into()))));
        assert_eq!(record.get("feat"), Some(&None));
        assert_eq!(record.get("missing"), None);
    }
}
