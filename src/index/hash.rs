//! # Unique Hash Index
//!
//! A persistent `value → tuple id` map over one scalar column. Serves `=`
//! and `IN` probes; rejects duplicate keys with `TxValidation` both during
//! incremental updates and rebuilds, which is how entity-level uniqueness
//! constraints are enforced.
//!
//! Keys are stored in their self-describing byte encoding (see
//! [`super::encode_value`]), making the in-memory map, the journal and the
//! persisted snapshot share one representation. Commit writes a fresh
//! snapshot beside the old one and renames it into place; rollback replays
//! the inverse-operation journal.

use super::{decode_value, encode_value, value_of, DataChangeEvent, IndexMatch, RebuildSource};
use crate::encoding::{Decoder, Encoder};
use crate::error::DbError;
use crate::query::cost::{Cost, COST_CPU_PER_TUPLE, COST_READ_PAGE};
use crate::query::predicate::{BooleanPredicate, ComparisonOperator};
use crate::storage::TupleId;
use crate::types::Value;
use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use std::path::{Path, PathBuf};

const SNAPSHOT_FILE: &str = "hash.idx";

enum JournalOp {
    /// Key was inserted; rollback removes it.
    Remove(Vec<u8>),
    /// Key was removed or overwritten; rollback restores the mapping.
    Restore(Vec<u8>, TupleId),
}

pub struct UniqueHashIndex {
    name: String,
    column: String,
    path: PathBuf,
    map: HashMap<Vec<u8>, TupleId>,
    journal: Vec<JournalOp>,
    dirty: bool,
}

impl UniqueHashIndex {
    pub fn create(name: &str, column: &str, dir: &Path) -> Result<Self> {
        let index = Self {
            name: name.to_string(),
            column: column.to_string(),
            path: dir.join(SNAPSHOT_FILE),
            map: HashMap::new(),
            journal: Vec::new(),
            dirty: false,
        };
        index.persist()?;
        Ok(index)
    }

    pub fn open(name: &str, column: &str, dir: &Path) -> Result<Self> {
        let path = dir.join(SNAPSHOT_FILE);
        let bytes = std::fs::read(&path)
            .wrap_err_with(|| format!("failed to read hash index snapshot {}", path.display()))?;
        let mut dec = Decoder::new(&bytes);
        let dirty = dec.u8()? != 0;
        let count = dec.u64()? as usize;
        let mut map = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = dec.bytes()?.to_vec();
            let tid = dec.u64()?;
            map.insert(key, tid);
        }
        Ok(Self {
            name: name.to_string(),
            column: column.to_string(),
            path,
            map,
            journal: Vec::new(),
            dirty,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// `=` and `IN` on the keyed column, without negation.
    pub fn can_process(&self, predicate: &BooleanPredicate) -> bool {
        match predicate {
            BooleanPredicate::Atomic(a) => {
                a.column == self.column
                    && !a.not
                    && matches!(a.op, ComparisonOperator::Equal | ComparisonOperator::In)
            }
            BooleanPredicate::Compound { .. } => false,
        }
    }

    pub fn cost(&self, predicate: &BooleanPredicate) -> Cost {
        let probes = match predicate {
            BooleanPredicate::Atomic(a) => a.values.len().max(1),
            BooleanPredicate::Compound { .. } => return Cost::INVALID,
        };
        Cost::new(
            COST_READ_PAGE * probes as f32,
            COST_CPU_PER_TUPLE * probes as f32,
            0.0,
        )
    }

    /// Probes the right-hand-side values and emits `(tid, key)` matches.
    pub fn filter(&self, predicate: &BooleanPredicate) -> Result<Vec<IndexMatch>> {
        ensure!(
            self.can_process(predicate),
            DbError::PredicateNotSupportedByIndex(self.name.clone())
        );
        let BooleanPredicate::Atomic(atom) = predicate else {
            unreachable!("can_process admits atoms only");
        };
        let mut matches = Vec::new();
        for value in &atom.values {
            if let Some(&tid) = self.map.get(&encode_value(value)) {
                matches.push(IndexMatch {
                    tid,
                    key: Some(value.clone()),
                    score: None,
                });
            }
        }
        matches.sort_by_key(|m| m.tid);
        Ok(matches)
    }

    fn insert_key(&mut self, key: Vec<u8>, tid: TupleId) -> Result<()> {
        if let Some(existing) = self.map.get(&key) {
            let display = decode_value(&key)
                .map(|v| v.to_string())
                .unwrap_or_else(|_| "<undecodable>".into());
            return Err(DbError::TxValidation(
                self.name.clone(),
                format!(
                    "duplicate key {} (held by tuple {}, offered by tuple {})",
                    display, existing, tid
                ),
            )
            .into());
        }
        self.map.insert(key.clone(), tid);
        self.journal.push(JournalOp::Remove(key));
        Ok(())
    }

    fn remove_key(&mut self, key: &[u8]) {
        if let Some(tid) = self.map.remove(key) {
            self.journal.push(JournalOp::Restore(key.to_vec(), tid));
        }
    }

    pub fn update(&mut self, event: &DataChangeEvent) -> Result<()> {
        match event {
            DataChangeEvent::Insert { tid, values } => {
                if let Some(Some(value)) = value_of(values, &self.column) {
                    self.insert_key(encode_value(value), *tid)?;
                }
            }
            DataChangeEvent::Update { tid, old, new } => {
                if let Some(Some(value)) = value_of(old, &self.column) {
                    self.remove_key(&encode_value(value));
                }
                if let Some(Some(value)) = value_of(new, &self.column) {
                    self.insert_key(encode_value(value), *tid)?;
                }
            }
            DataChangeEvent::Delete { old, .. } => {
                if let Some(Some(value)) = value_of(old, &self.column) {
                    self.remove_key(&encode_value(value));
                }
            }
        }
        Ok(())
    }

    pub fn rebuild(&mut self, source: RebuildSource) -> Result<()> {
        let mut map = HashMap::new();
        for entry in source {
            let (tid, value) = entry?;
            let Some(value) = value else { continue };
            let key = encode_value(&value);
            if let Some(existing) = map.insert(key, tid) {
                return Err(DbError::TxValidation(
                    self.name.clone(),
                    format!(
                        "duplicate key {} (tuples {} and {})",
                        value, existing, tid
                    ),
                )
                .into());
            }
        }
        self.map = map;
        self.journal.clear();
        self.dirty = false;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.persist()?;
        self.journal.clear();
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        for op in self.journal.drain(..).rev() {
            match op {
                JournalOp::Remove(key) => {
                    self.map.remove(&key);
                }
                JournalOp::Restore(key, tid) => {
                    self.map.insert(key, tid);
                }
            }
        }
        Ok(())
    }

    /// Writes the snapshot to a sibling temp file and renames it in.
    fn persist(&self) -> Result<()> {
        let mut enc = Encoder::new();
        enc.u8(self.dirty as u8);
        enc.u64(self.map.len() as u64);
        for (key, tid) in &self.map {
            enc.bytes(key);
            enc.u64(*tid);
        }
        let tmp = self.path.with_extension("idx.tmp");
        std::fs::write(&tmp, enc.finish())?;
        std::fs::rename(&tmp, &self.path)
            .wrap_err_with(|| format!("failed to install snapshot {}", self.path.display()))
    }
}
