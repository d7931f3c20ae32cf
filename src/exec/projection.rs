//! # Projection & Limit Operators
//!
//! [`SelectProjection`] reorders and renames columns; the aggregate
//! projections (count, exists, sum, mean, min, max) are breakers emitting
//! exactly one record; [`Limit`] applies skip/limit accounting.

use super::{Operator, Record};
use crate::error::DbError;
use crate::query::physical::AggregateFunction;
use crate::query::ProjectionColumn;
use crate::types::Value;
use eyre::Result;
use smallvec::{smallvec, SmallVec};
use std::sync::Arc;

pub struct SelectProjection {
    child: Box<dyn Operator>,
    sources: Vec<String>,
    columns: Arc<Vec<String>>,
}

impl SelectProjection {
    pub fn new(child: Box<dyn Operator>, columns: Vec<ProjectionColumn>) -> Self {
        let sources: Vec<String> = columns.iter().map(|(name, _)| name.clone()).collect();
        let output: Vec<String> = columns
            .into_iter()
            .map(|(name, alias)| alias.unwrap_or(name))
            .collect();
        Self {
            child,
            sources,
            columns: Arc::new(output),
        }
    }
}

impl Operator for SelectProjection {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        let Some(record) = self.child.next()? else {
            return Ok(None);
        };
        let mut values: SmallVec<[Option<Value>; 8]> = SmallVec::new();
        for source in &self.sources {
            let value = record.get(source).cloned().ok_or_else(|| {
                DbError::OperatorExecution(format!(
                    "projected column {} missing from input record",
                    source
                ))
            })?;
            values.push(value);
        }
        Ok(Some(Record::new(
            record.tid,
            Arc::clone(&self.columns),
            values,
        )))
    }
}

pub struct CountProjection {
    child: Box<dyn Operator>,
    columns: Arc<Vec<String>>,
    done: bool,
}

impl CountProjection {
    pub fn new(child: Box<dyn Operator>) -> Self {
        Self {
            child,
            columns: Arc::new(vec!["count(*)".to_string()]),
            done: false,
        }
    }
}

impl Operator for CountProjection {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let mut count = 0i64;
        while self.child.next()?.is_some() {
            count += 1;
        }
        Ok(Some(Record::new(
            0,
            Arc::clone(&self.columns),
            smallvec![Some(Value::Long(count))],
        )))
    }
}

pub struct ExistsProjection {
    child: Box<dyn Operator>,
    columns: Arc<Vec<String>>,
    done: bool,
}

impl ExistsProjection {
    pub fn new(child: Box<dyn Operator>) -> Self {
        Self {
            child,
            columns: Arc::new(vec!["exists(*)".to_string()]),
            done: false,
        }
    }
}

impl Operator for ExistsProjection {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let exists = self.child.next()?.is_some();
        Ok(Some(Record::new(
            0,
            Arc::clone(&self.columns),
            smallvec![Some(Value::Boolean(exists))],
        )))
    }
}

/// Sum / mean / min / max over one numeric column; nulls are skipped.
pub struct AggregateProjection {
    child: Box<dyn Operator>,
    function: AggregateFunction,
    source: String,
    columns: Arc<Vec<String>>,
    done: bool,
}

impl AggregateProjection {
    pub fn new(
        child: Box<dyn Operator>,
        function: AggregateFunction,
        source: String,
        alias: Option<String>,
    ) -> Self {
        let label = match function {
            AggregateFunction::Sum => "sum",
            AggregateFunction::Mean => "mean",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        };
        let output = alias.unwrap_or_else(|| format!("{}({})", label, source));
        Self {
            child,
            function,
            source,
            columns: Arc::new(vec![output]),
            done: false,
        }
    }
}

impl Operator for AggregateProjection {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;

        let mut sum = 0.0f64;
        let mut count = 0u64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        while let Some(record) = self.child.next()? {
            let cell = record.get(&self.source).ok_or_else(|| {
                DbError::OperatorExecution(format!(
                    "aggregate column {} missing from input record",
                    self.source
                ))
            })?;
            let Some(value) = cell else { continue };
            let number = value.as_f64().ok_or_else(|| {
                DbError::OperatorExecution(format!(
                    "aggregate over non-numeric value in column {}",
                    self.source
                ))
            })?;
            sum += number;
            count += 1;
            min = min.min(number);
            max = max.max(number);
        }

        let result = match self.function {
            AggregateFunction::Sum => Some(Value::Double(sum)),
            AggregateFunction::Mean if count > 0 => Some(Value::Double(sum / count as f64)),
            AggregateFunction::Min if count > 0 => Some(Value::Double(min)),
            AggregateFunction::Max if count > 0 => Some(Value::Double(max)),
            // No input rows: mean/min/max are null, sum is 0.
            _ => None,
        };
        Ok(Some(Record::new(
            0,
            Arc::clone(&self.columns),
            smallvec![result],
        )))
    }
}

pub struct Limit {
    child: Box<dyn Operator>,
    limit: u64,
    skip: u64,
    skipped: u64,
    emitted: u64,
}

impl Limit {
    pub fn new(child: Box<dyn Operator>, limit: u64, skip: u64) -> Self {
        Self {
            child,
            limit,
            skip,
            skipped: 0,
            emitted: 0,
        }
    }
}

impl Operator for Limit {
    fn columns(&self) -> Arc<Vec<String>> {
        self.child.columns()
    }

    fn next(&mut self) -> Result<Option<Record>> {
        if self.emitted >= self.limit {
            return Ok(None);
        }
        while let Some(record) = self.child.next()? {
            if self.skipped < self.skip {
                self.skipped += 1;
                continue;
            }
            self.emitted += 1;
            return Ok(Some(record));
        }
        Ok(None)
    }
}
