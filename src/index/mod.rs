//! # Secondary Indexes
//!
//! Three index families over single columns of an entity:
//!
//! - [`hash::UniqueHashIndex`]: a persistent `value → tuple id` map
//!   answering `=` and `IN`, rejecting duplicate keys.
//! - [`text::InvertedTextIndex`]: tokenized and raw fields over a string
//!   column answering `=`, `LIKE` and `MATCH` with a score column.
//! - [`vaf::VaFileIndex`]: per-dimension quantization signatures pruning
//!   kNN candidates through lower/upper distance bounds (VA-SSA).
//!
//! Every index exposes the same capability surface (`can_process`, `cost`,
//! `filter`, `update`, `rebuild`, `commit`, `rollback`) behind the tagged
//! [`Index`] dispatch; the planner only ever talks to that surface.
//!
//! ## Incremental maintenance
//!
//! All three kinds support incremental updates: the entity transaction
//! dispatches every [`DataChangeEvent`] to them before its commit returns.
//! An update an index cannot absorb (a vector outside the trained
//! quantization range) marks it *dirty*; dirty indexes are excluded from
//! planning until `OptimizeEntity` rebuilds them.

pub mod hash;
pub mod text;
pub mod vaf;

use crate::encoding::{Decoder, Encoder};
use crate::query::cost::Cost;
use crate::query::predicate::{BooleanPredicate, KnnPredicate};
use crate::storage::TupleId;
use crate::types::{Type, Value};
use eyre::{bail, Result};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    UniqueHash,
    InvertedText,
    VaFile,
}

impl IndexKind {
    pub fn name(&self) -> &'static str {
        match self {
            IndexKind::UniqueHash => "UNIQUE_HASH",
            IndexKind::InvertedText => "INVERTED_TEXT",
            IndexKind::VaFile => "VA_FILE",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "UNIQUE_HASH" => IndexKind::UniqueHash,
            "INVERTED_TEXT" => IndexKind::InvertedText,
            "VA_FILE" => IndexKind::VaFile,
            other => bail!("unknown index kind: {}", other),
        })
    }

    /// Whether the kind consumes change events as they happen. All current
    /// kinds do; a future bulk-only kind would return false and rely on
    /// rebuilds.
    pub fn supports_incremental_update(&self) -> bool {
        true
    }
}

/// A change committed against an entity, dispatched to its indexes. Values
/// carry the full row, keyed by column name; indexes pick their column.
#[derive(Debug, Clone)]
pub enum DataChangeEvent {
    Insert {
        tid: TupleId,
        values: Vec<(String, Option<Value>)>,
    },
    Update {
        tid: TupleId,
        old: Vec<(String, Option<Value>)>,
        new: Vec<(String, Option<Value>)>,
    },
    Delete {
        tid: TupleId,
        old: Vec<(String, Option<Value>)>,
    },
}

impl DataChangeEvent {
    pub fn tid(&self) -> TupleId {
        match self {
            DataChangeEvent::Insert { tid, .. }
            | DataChangeEvent::Update { tid, .. }
            | DataChangeEvent::Delete { tid, .. } => *tid,
        }
    }
}

pub(crate) fn value_of<'a>(
    values: &'a [(String, Option<Value>)],
    column: &str,
) -> Option<&'a Option<Value>> {
    values.iter().find(|(c, _)| c == column).map(|(_, v)| v)
}

/// A tuple produced by an index filter: the id plus whatever the index can
/// reconstruct (the key for hash indexes, a score for text indexes).
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub tid: TupleId,
    pub key: Option<Value>,
    pub score: Option<f64>,
}

/// Rebuild input: the keyed column of every live tuple.
pub type RebuildSource<'a> = &'a mut dyn Iterator<Item = Result<(TupleId, Option<Value>)>>;

pub enum Index {
    UniqueHash(hash::UniqueHashIndex),
    InvertedText(text::InvertedTextIndex),
    VaFile(vaf::VaFileIndex),
}

impl Index {
    pub fn create(
        kind: IndexKind,
        name: &str,
        column: &str,
        column_type: Type,
        dir: &Path,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(match kind {
            IndexKind::UniqueHash => {
                Index::UniqueHash(hash::UniqueHashIndex::create(name, column, dir)?)
            }
            IndexKind::InvertedText => {
                Index::InvertedText(text::InvertedTextIndex::create(name, column, dir)?)
            }
            IndexKind::VaFile => Index::VaFile(vaf::VaFileIndex::create(
                name,
                column,
                column_type,
                dir,
            )?),
        })
    }

    pub fn open(kind: IndexKind, name: &str, column: &str, dir: &Path) -> Result<Self> {
        Ok(match kind {
            IndexKind::UniqueHash => {
                Index::UniqueHash(hash::UniqueHashIndex::open(name, column, dir)?)
            }
            IndexKind::InvertedText => {
                Index::InvertedText(text::InvertedTextIndex::open(name, column, dir)?)
            }
            IndexKind::VaFile => Index::VaFile(vaf::VaFileIndex::open(name, column, dir)?),
        })
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            Index::UniqueHash(_) => IndexKind::UniqueHash,
            Index::InvertedText(_) => IndexKind::InvertedText,
            Index::VaFile(_) => IndexKind::VaFile,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Index::UniqueHash(i) => i.name(),
            Index::InvertedText(i) => i.name(),
            Index::VaFile(i) => i.name(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Index::UniqueHash(i) => i.column(),
            Index::InvertedText(i) => i.column(),
            Index::VaFile(i) => i.column(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        match self {
            Index::UniqueHash(i) => i.is_dirty(),
            Index::InvertedText(i) => i.is_dirty(),
            Index::VaFile(i) => i.is_dirty(),
        }
    }

    /// Whether the index can answer a Boolean predicate. Dirty indexes
    /// refuse everything.
    pub fn can_process(&self, predicate: &BooleanPredicate) -> bool {
        if self.is_dirty() {
            return false;
        }
        match self {
            Index::UniqueHash(i) => i.can_process(predicate),
            Index::InvertedText(i) => i.can_process(predicate),
            Index::VaFile(_) => false,
        }
    }

    /// Whether the index can accelerate a kNN predicate.
    pub fn can_process_knn(&self, predicate: &KnnPredicate) -> bool {
        if self.is_dirty() {
            return false;
        }
        match self {
            Index::VaFile(i) => i.can_process_knn(predicate),
            _ => false,
        }
    }

    pub fn cost(&self, predicate: &BooleanPredicate) -> Cost {
        if !self.can_process(predicate) {
            return Cost::INVALID;
        }
        match self {
            Index::UniqueHash(i) => i.cost(predicate),
            Index::InvertedText(i) => i.cost(predicate),
            Index::VaFile(_) => Cost::INVALID,
        }
    }

    pub fn knn_cost(&self, predicate: &KnnPredicate) -> Cost {
        if !self.can_process_knn(predicate) {
            return Cost::INVALID;
        }
        match self {
            Index::VaFile(i) => i.knn_cost(predicate),
            _ => Cost::INVALID,
        }
    }

    pub fn filter(&mut self, predicate: &BooleanPredicate) -> Result<Vec<IndexMatch>> {
        match self {
            Index::UniqueHash(i) => i.filter(predicate),
            Index::InvertedText(i) => i.filter(predicate),
            Index::VaFile(i) => Err(crate::error::DbError::PredicateNotSupportedByIndex(
                i.name().to_string(),
            )
            .into()),
        }
    }

    pub fn update(&mut self, event: &DataChangeEvent) -> Result<()> {
        match self {
            Index::UniqueHash(i) => i.update(event),
            Index::InvertedText(i) => i.update(event),
            Index::VaFile(i) => i.update(event),
        }
    }

    pub fn rebuild(&mut self, source: RebuildSource) -> Result<()> {
        match self {
            Index::UniqueHash(i) => i.rebuild(source),
            Index::InvertedText(i) => i.rebuild(source),
            Index::VaFile(i) => i.rebuild(source),
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        match self {
            Index::UniqueHash(i) => i.commit(),
            Index::InvertedText(i) => i.commit(),
            Index::VaFile(i) => i.commit(),
        }
    }

    pub fn rollback(&mut self) -> Result<()> {
        match self {
            Index::UniqueHash(i) => i.rollback(),
            Index::InvertedText(i) => i.rollback(),
            Index::VaFile(i) => i.rollback(),
        }
    }

    pub fn as_vaf(&self) -> Option<&vaf::VaFileIndex> {
        match self {
            Index::VaFile(i) => Some(i),
            _ => None,
        }
    }
}

/// Encodes a value for index keys and persisted snapshots. The encoding is
/// self-describing (ordinal + logical size + payload) and byte-comparable
/// for equality.
pub(crate) fn encode_value(value: &Value) -> Vec<u8> {
    let mut enc = Encoder::new();
    let ty = value.type_of();
    enc.u64(ty.ordinal() as u64);
    enc.u64(ty.logical_size() as u64);
    match ty.physical_size() {
        Some(size) => {
            let mut payload = vec![0u8; size];
            value.write_fixed(&mut payload).expect("fixed payload");
            enc.bytes(&payload);
        }
        None => {
            enc.bytes(&value.write_variable().expect("variable payload"));
        }
    }
    enc.finish()
}

pub(crate) fn decode_value(bytes: &[u8]) -> Result<Value> {
    let mut dec = Decoder::new(bytes);
    let ordinal = dec.u64()? as u32;
    let logical = dec.u64()? as u32;
    let ty = Type::from_ordinal(ordinal, logical)?;
    let payload = dec.bytes()?;
    match ty.physical_size() {
        Some(_) => Value::read_fixed(ty, payload),
        None => Value::read_variable(ty, payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_key_roundtrip() {
        let values = [
            Value::String("rabbit".into()),
            Value::Int(-4),
            Value::Long(1 << 50),
            Value::Double(2.75),
            Value::FloatVector(vec![1.0, -2.0]),
        ];
        for v in values {
            let encoded = encode_value(&v);
            assert_eq!(decode_value(&encoded).unwrap(), v);
        }
    }

    #[test]
    fn distinct_values_encode_distinctly() {
        assert_ne!(
            encode_value(&Value::Int(1)),
            encode_value(&Value::Long(1))
        );
        assert_ne!(
            encode_value(&Value::String("a".into())),
            encode_value(&Value::String("b".into()))
        );
    }

    #[test]
    fn event_column_extraction() {
        let event = DataChangeEvent::Insert {
            tid: 3,
            values: vec![
                ("id".into(), Some(Value::String("a".into()))),
                ("feat".into(), None),
            ],
        };
        if let DataChangeEvent::Insert { values, .. } = &event {
            assert_eq!(
                value_of(values, "id"),
                Some(&Some(Value::String("a".into())))
            );
            assert_eq!(value_of(values, "feat"), Some(&None));
            assert_eq!(value_of(values, "missing"), None);
        }
        assert_eq!(event.tid(), 3);
    }
}
