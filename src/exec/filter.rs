//! # Filter & Fetch Operators
//!
//! [`LinearScanFilter`] evaluates a Boolean predicate over its child's
//! records; [`IndexedFilter`] replaces the scan entirely with an index
//! probe, emitting the partial records the index can reconstruct;
//! [`FetchColumns`] completes partial records with entity columns, the
//! glue between index/kNN access paths and projections.

use super::{Operator, Record};
use crate::catalog::EntityTx;
use crate::error::DbError;
use crate::index::{Index, IndexMatch};
use crate::query::predicate::BooleanPredicate;
use crate::types::Value;
use eyre::Result;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;

pub struct LinearScanFilter {
    child: Box<dyn Operator>,
    predicate: BooleanPredicate,
}

impl LinearScanFilter {
    pub fn new(child: Box<dyn Operator>, predicate: BooleanPredicate) -> Self {
        Self { child, predicate }
    }
}

impl Operator for LinearScanFilter {
    fn columns(&self) -> Arc<Vec<String>> {
        self.child.columns()
    }

    fn next(&mut self) -> Result<Option<Record>> {
        while let Some(record) = self.child.next()? {
            let lookup = |column: &str| -> Result<Option<Value>> {
                record
                    .get(column)
                    .cloned()
                    .ok_or_else(|| {
                        DbError::OperatorExecution(format!(
                            "predicate column {} missing from input record",
                            column
                        ))
                        .into()
                    })
            };
            if self.predicate.matches(&lookup)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

/// Emits the tuples an index produces for a predicate: `(tid, key)` for
/// hash probes, `(tid, score)` for text queries.
pub struct IndexedFilter {
    tx: Arc<EntityTx>,
    index: Arc<Mutex<Index>>,
    predicate: BooleanPredicate,
    columns: Arc<Vec<String>>,
    matches: Option<std::vec::IntoIter<IndexMatch>>,
}

impl IndexedFilter {
    pub fn new(
        tx: Arc<EntityTx>,
        index: Arc<Mutex<Index>>,
        predicate: BooleanPredicate,
        columns: Vec<String>,
    ) -> Self {
        Self {
            tx,
            index,
            predicate,
            columns: Arc::new(columns),
            matches: None,
        }
    }
}

impl Operator for IndexedFilter {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        self.tx.ctx().check_not_cancelled()?;
        if self.matches.is_none() {
            let matches = self.index.lock().filter(&self.predicate)?;
            self.matches = Some(matches.into_iter());
        }
        let Some(matched) = self.matches.as_mut().and_then(|m| m.next()) else {
            return Ok(None);
        };
        let mut values: SmallVec<[Option<Value>; 8]> = SmallVec::new();
        for column in self.columns.iter() {
            if column == crate::query::SCORE_COLUMN {
                values.push(matched.score.map(Value::Double));
            } else {
                values.push(matched.key.clone());
            }
        }
        Ok(Some(Record::new(
            matched.tid,
            Arc::clone(&self.columns),
            values,
        )))
    }
}

/// Completes records with entity columns the child did not carry.
pub struct FetchColumns {
    tx: Arc<EntityTx>,
    child: Box<dyn Operator>,
    columns: Arc<Vec<String>>,
    fetched: Vec<String>,
}

impl FetchColumns {
    pub fn new(tx: Arc<EntityTx>, child: Box<dyn Operator>, requested: Vec<String>) -> Self {
        let child_columns = child.columns();
        let mut columns: Vec<String> = child_columns.as_ref().clone();
        let mut fetched = Vec::new();
        for column in requested {
            if !columns.contains(&column) {
                columns.push(column.clone());
                fetched.push(column);
            }
        }
        Self {
            tx,
            child,
            columns: Arc::new(columns),
            fetched,
        }
    }
}

impl Operator for FetchColumns {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        let Some(record) = self.child.next()? else {
            return Ok(None);
        };
        let mut values: SmallVec<[Option<Value>; 8]> =
            record.values().iter().cloned().collect();
        for column in &self.fetched {
            values.push(self.tx.read_value(column, record.tid)?);
        }
        Ok(Some(Record::new(
            record.tid,
            Arc::clone(&self.columns),
            values,
        )))
    }
}
