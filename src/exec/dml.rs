//! # DML & Maintenance Operators
//!
//! Writing operators run through the same pull interface: each drains its
//! input (if any), applies the mutation through the entity transaction
//! (which dispatches change events to the indexes) and emits a single
//! record carrying the affected-tuple count.
//!
//! [`OptimizeEntity`] rebuilds the entity's indexes from its live tuples
//! and refreshes statistics. A broken index surfaces as an error rather
//! than being dropped silently; it stays dirty and excluded from planning
//! until a later rebuild succeeds.

use super::{Operator, Record};
use crate::catalog::EntityTx;
use crate::types::Value;
use eyre::Result;
use smallvec::smallvec;
use std::sync::Arc;

pub struct Insert {
    tx: Arc<EntityTx>,
    rows: Vec<Vec<(String, Value)>>,
    columns: Arc<Vec<String>>,
    done: bool,
}

impl Insert {
    pub fn new(tx: Arc<EntityTx>, rows: Vec<Vec<(String, Value)>>) -> Self {
        Self {
            tx,
            rows,
            columns: Arc::new(vec!["inserted".to_string()]),
            done: false,
        }
    }
}

impl Operator for Insert {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let mut count = 0i64;
        for row in self.rows.drain(..) {
            let pairs: Vec<(&str, Value)> =
                row.iter().map(|(n, v)| (n.as_str(), v.clone())).collect();
            self.tx.insert(&pairs)?;
            count += 1;
        }
        Ok(Some(Record::new(
            0,
            Arc::clone(&self.columns),
            smallvec![Some(Value::Long(count))],
        )))
    }
}

/// Updates every tuple its child produces.
pub struct Update {
    tx: Arc<EntityTx>,
    child: Box<dyn Operator>,
    values: Vec<(String, Option<Value>)>,
    columns: Arc<Vec<String>>,
    done: bool,
}

impl Update {
    pub fn new(
        tx: Arc<EntityTx>,
        child: Box<dyn Operator>,
        values: Vec<(String, Option<Value>)>,
    ) -> Self {
        Self {
            tx,
            child,
            values,
            columns: Arc::new(vec!["updated".to_string()]),
            done: false,
        }
    }
}

impl Operator for Update {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let assignments: Vec<(&str, Option<Value>)> = self
            .values
            .iter()
            .map(|(n, v)| (n.as_str(), v.clone()))
            .collect();
        let mut count = 0i64;
        while let Some(record) = self.child.next()? {
            self.tx.update(record.tid, &assignments)?;
            count += 1;
        }
        Ok(Some(Record::new(
            0,
            Arc::clone(&self.columns),
            smallvec![Some(Value::Long(count))],
        )))
    }
}

/// Deletes every tuple its child produces.
pub struct Delete {
    tx: Arc<EntityTx>,
    child: Box<dyn Operator>,
    columns: Arc<Vec<String>>,
    done: bool,
}

impl Delete {
    pub fn new(tx: Arc<EntityTx>, child: Box<dyn Operator>) -> Self {
        Self {
            tx,
            child,
            columns: Arc::new(vec!["deleted".to_string()]),
            done: false,
        }
    }
}

impl Operator for Delete {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let mut count = 0i64;
        while let Some(record) = self.child.next()? {
            self.tx.delete(record.tid)?;
            count += 1;
        }
        Ok(Some(Record::new(
            0,
            Arc::clone(&self.columns),
            smallvec![Some(Value::Long(count))],
        )))
    }
}

/// Rebuilds the entity's indexes and refreshes its statistics.
pub struct OptimizeEntity {
    tx: Arc<EntityTx>,
    columns: Arc<Vec<String>>,
    done: bool,
}

impl OptimizeEntity {
    pub fn new(tx: Arc<EntityTx>) -> Self {
        Self {
            tx,
            columns: Arc::new(vec!["optimized".to_string()]),
            done: false,
        }
    }
}

impl Operator for OptimizeEntity {
    fn columns(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.columns)
    }

    fn next(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        let mut rebuilt = 0i64;
        for def in self.tx.list_indexes()? {
            self.tx.rebuild_index(&def.name)?;
            rebuilt += 1;
        }
        Ok(Some(Record::new(
            0,
            Arc::clone(&self.columns),
            smallvec![Some(Value::Long(rebuilt))],
        )))
    }
}
