//! # Inverted Text Index
//!
//! Two stored fields per tuple over a string column: a *tokenized* field
//! (lowercased alphanumeric terms with posting lists) answering `MATCH`
//! and a *raw* non-analyzed field answering `=` and `LIKE`.
//!
//! Compound predicates map `AND → MUST` (posting intersection) and
//! `OR → SHOULD` (union). Every match carries a score: for `MATCH` the
//! fraction of query terms found in the tuple, 1.0 for exact and wildcard
//! hits, averaged across MUST branches and maxed across SHOULD branches.
//!
//! ## Writer buffering
//!
//! Change events accumulate in a writer buffer (bounded by
//! `TEXT_WRITER_BUFFER_LIMIT`); a flush folds them into a staged copy of
//! the committed state. Commit force-flushes, persists, and swaps the
//! staged state in atomically; rollback drops buffer and staged state.
//! Filters inside the writing transaction read through the staged state,
//! so a writer observes its own pending documents.

use super::{value_of, DataChangeEvent, IndexMatch, RebuildSource};
use crate::config::TEXT_WRITER_BUFFER_LIMIT;
use crate::encoding::{Decoder, Encoder};
use crate::error::DbError;
use crate::query::cost::{Cost, COST_CPU_PER_TUPLE};
use crate::query::predicate::{
    like_match, tokenize, BooleanPredicate, ComparisonOperator, Connector,
};
use crate::storage::TupleId;
use crate::types::Value;
use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use std::path::{Path, PathBuf};

const SNAPSHOT_FILE: &str = "text.idx";

#[derive(Debug, Clone, Default)]
struct TextState {
    /// Tokenized field: term → sorted posting list.
    terms: HashMap<String, Vec<TupleId>>,
    /// Raw field: exact string → sorted posting list.
    raw: HashMap<String, Vec<TupleId>>,
}

impl TextState {
    fn add_document(&mut self, tid: TupleId, text: &str) {
        posting_insert(self.raw.entry(text.to_string()).or_default(), tid);
        for term in tokenize(text) {
            posting_insert(self.terms.entry(term).or_default(), tid);
        }
    }

    fn remove_document(&mut self, tid: TupleId, text: &str) {
        posting_remove(&mut self.raw, text, tid);
        for term in tokenize(text) {
            posting_remove(&mut self.terms, &term, tid);
        }
    }
}

fn posting_insert(list: &mut Vec<TupleId>, tid: TupleId) {
    if let Err(pos) = list.binary_search(&tid) {
        list.insert(pos, tid);
    }
}

fn posting_remove(map: &mut HashMap<String, Vec<TupleId>>, key: &str, tid: TupleId) {
    if let Some(list) = map.get_mut(key) {
        if let Ok(pos) = list.binary_search(&tid) {
            list.remove(pos);
        }
        if list.is_empty() {
            map.remove(key);
        }
    }
}

enum TextOp {
    Add(TupleId, String),
    Remove(TupleId, String),
}

pub struct InvertedTextIndex {
    name: String,
    column: String,
    path: PathBuf,
    committed: TextState,
    staged: Option<TextState>,
    buffer: Vec<TextOp>,
    dirty: bool,
}

impl InvertedTextIndex {
    pub fn create(name: &str, column: &str, dir: &Path) -> Result<Self> {
        let index = Self {
            name: name.to_string(),
            column: column.to_string(),
            path: dir.join(SNAPSHOT_FILE),
            committed: TextState::default(),
            staged: None,
            buffer: Vec::new(),
            dirty: false,
        };
        index.persist(&index.committed)?;
        Ok(index)
    }

    pub fn open(name: &str, column: &str, dir: &Path) -> Result<Self> {
        let path = dir.join(SNAPSHOT_FILE);
        let bytes = std::fs::read(&path)
            .wrap_err_with(|| format!("failed to read text index snapshot {}", path.display()))?;
        let mut dec = Decoder::new(&bytes);
        let dirty = dec.u8()? != 0;
        let mut state = TextState::default();
        for map in [&mut state.raw, &mut state.terms] {
            let entries = dec.u64()? as usize;
            for _ in 0..entries {
                let key = dec.string()?;
                let n = dec.u64()? as usize;
                let mut list = Vec::with_capacity(n);
                for _ in 0..n {
                    list.push(dec.u64()?);
                }
                map.insert(key, list);
            }
        }
        Ok(Self {
            name: name.to_string(),
            column: column.to_string(),
            path,
            committed: state,
            staged: None,
            buffer: Vec::new(),
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

    /// `=`, `LIKE` and `MATCH` atoms on this column, any AND/OR shape,
    /// no negation.
    pub fn can_process(&self, predicate: &BooleanPredicate) -> bool {
        predicate.atoms().iter().all(|a| {
            a.column == self.column
                && !a.not
                && matches!(
                    a.op,
                    ComparisonOperator::Equal | ComparisonOperator::Like | ComparisonOperator::Match
                )
        })
    }

    pub fn cost(&self, predicate: &BooleanPredicate) -> Cost {
        let atoms = predicate.atoms().len().max(1) as f32;
        let vocabulary = self.committed.terms.len().max(1) as f32;
        Cost::new(
            0.0,
            COST_CPU_PER_TUPLE * atoms * vocabulary.sqrt(),
            vocabulary * 0.01,
        )
    }

    /// Builds a Boolean query over the two fields and emits scored
    /// matches in ascending tuple order.
    pub fn filter(&mut self, predicate: &BooleanPredicate) -> Result<Vec<IndexMatch>> {
        ensure!(
            self.can_process(predicate),
            DbError::PredicateNotSupportedByIndex(self.name.clone())
        );
        self.flush_buffer();
        let state = self.staged.as_ref().unwrap_or(&self.committed);
        let scores = evaluate(predicate, state)?;
        let mut matches: Vec<IndexMatch> = scores
            .into_iter()
            .map(|(tid, score)| IndexMatch {
                tid,
                key: None,
                score: Some(score),
            })
            .collect();
        matches.sort_by_key(|m| m.tid);
        Ok(matches)
    }

    pub fn update(&mut self, event: &DataChangeEvent) -> Result<()> {
        match event {
            DataChangeEvent::Insert { tid, values } => {
                if let Some(Some(Value::String(text))) = value_of(values, &self.column) {
                    self.buffer.push(TextOp::Add(*tid, text.clone()));
                }
            }
            DataChangeEvent::Update { tid, old, new } => {
                if let Some(Some(Value::String(text))) = value_of(old, &self.column) {
                    self.buffer.push(TextOp::Remove(*tid, text.clone()));
                }
                if let Some(Some(Value::String(text))) = value_of(new, &self.column) {
                    self.buffer.push(TextOp::Add(*tid, text.clone()));
                }
            }
            DataChangeEvent::Delete { tid, old } => {
                if let Some(Some(Value::String(text))) = value_of(old, &self.column) {
                    self.buffer.push(TextOp::Remove(*tid, text.clone()));
                }
            }
        }
        if self.buffer.len() >= TEXT_WRITER_BUFFER_LIMIT {
            self.flush_buffer();
        }
        Ok(())
    }

    fn flush_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let staged = self
            .staged
            .get_or_insert_with(|| self.committed.clone());
        for op in self.buffer.drain(..) {
            match op {
                TextOp::Add(tid, text) => staged.add_document(tid, &text),
                TextOp::Remove(tid, text) => staged.remove_document(tid, &text),
            }
        }
    }

    pub fn rebuild(&mut self, source: RebuildSource) -> Result<()> {
        let mut state = TextState::default();
        for entry in source {
            let (tid, value) = entry?;
            if let Some(Value::String(text)) = value {
                state.add_document(tid, &text);
            }
        }
        self.committed = state;
        self.staged = None;
        self.buffer.clear();
        self.dirty = false;
        Ok(())
    }

    /// Forces the writer, persists, and swaps the reader state.
    pub fn commit(&mut self) -> Result<()> {
        self.flush_buffer();
        if let Some(staged) = self.staged.take() {
            self.persist(&staged)?;
            self.committed = staged;
        } else {
            self.persist(&self.committed)?;
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.buffer.clear();
        self.staged = None;
        Ok(())
    }

    fn persist(&self, state: &TextState) -> Result<()> {
        let mut enc = Encoder::new();
        enc.u8(self.dirty as u8);
        for map in [&state.raw, &state.terms] {
            enc.u64(map.len() as u64);
            for (key, list) in map {
                enc.string(key);
                enc.u64(list.len() as u64);
                for tid in list {
                    enc.u64(*tid);
                }
            }
        }
        let tmp = self.path.with_extension("idx.tmp");
        std::fs::write(&tmp, enc.finish())?;
        std::fs::rename(&tmp, &self.path)
            .wrap_err_with(|| format!("failed to install snapshot {}", self.path.display()))
    }
}

/// Scores: `MATCH` gives the matched-term fraction, `=`/`LIKE` give 1.0;
/// AND averages (both branches must hit), OR takes the maximum.
fn evaluate(predicate: &BooleanPredicate, state: &TextState) -> Result<HashMap<TupleId, f64>> {
    match predicate {
        BooleanPredicate::Atomic(atom) => {
            let needle = atom
                .values
                .first()
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    eyre::eyre!("text predicate on {} requires a string operand", atom.column)
                })?;
            let mut scores = HashMap::new();
            match atom.op {
                ComparisonOperator::Equal => {
                    if let Some(list) = state.raw.get(needle) {
                        for tid in list {
                            scores.insert(*tid, 1.0);
                        }
                    }
                }
                ComparisonOperator::Like => {
                    for (text, list) in &state.raw {
                        if like_match(needle, text) {
                            for tid in list {
                                scores.insert(*tid, 1.0);
                            }
                        }
                    }
                }
                ComparisonOperator::Match => {
                    let needles = tokenize(needle);
                    if needles.is_empty() {
                        return Ok(scores);
                    }
                    let mut hits: HashMap<TupleId, usize> = HashMap::new();
                    for term in &needles {
                        if let Some(list) = state.terms.get(term) {
                            for tid in list {
                                *hits.entry(*tid).or_default() += 1;
                            }
                        }
                    }
                    for (tid, count) in hits {
                        scores.insert(tid, count as f64 / needles.len() as f64);
                    }
                }
                _ => unreachable!("can_process admits =, LIKE, MATCH"),
            }
            Ok(scores)
        }
        BooleanPredicate::Compound {
            connector,
            left,
            right,
        } => {
            let l = evaluate(left, state)?;
            let r = evaluate(right, state)?;
            let mut scores = HashMap::new();
            match connector {
                Connector::And => {
                    for (tid, ls) in l {
                        if let Some(rs) = r.get(&tid) {
                            scores.insert(tid, (ls + rs) / 2.0);
                        }
                    }
                }
                Connector::Or => {
                    scores = l;
                    for (tid, rs) in r {
                        let entry = scores.entry(tid).or_insert(rs);
                        if rs > *entry {
                            *entry = rs;
                        }
                    }
                }
            }
            Ok(scores)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::predicate::AtomicPredicate;
    use tempfile::TempDir;

    fn index_with_docs(dir: &TempDir, docs: &[(TupleId, &str)]) -> InvertedTextIndex {
        let mut index =
            InvertedTextIndex::create("warren.test.text_idx", "body", dir.path()).unwrap();
        for (tid, text) in docs {
            index
                .update(&DataChangeEvent::Insert {
                    tid: *tid,
                    values: vec![("body".into(), Some(Value::String((*text).into())))],
                })
                .unwrap();
        }
        index
    }

    fn atom(op: ComparisonOperator, text: &str) -> BooleanPredicate {
        BooleanPredicate::Atomic(AtomicPredicate::new(
            "body",
            op,
            vec![Value::String(text.into())],
        ))
    }

    #[test]
    fn exact_match_uses_raw_field() {
        let dir = TempDir::new().unwrap();
        let mut index = index_with_docs(&dir, &[(0, "brown hare"), (1, "Brown Hare")]);
        let hits = index.filter(&atom(ComparisonOperator::Equal, "brown hare")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tid, 0);
        assert_eq!(hits[0].score, Some(1.0));
    }

    #[test]
    fn match_scores_term_fraction() {
        let dir = TempDir::new().unwrap();
        let mut index = index_with_docs(&dir, &[(0, "quick brown hare"), (1, "brown tortoise")]);
        let hits = index.filter(&atom(ComparisonOperator::Match, "quick brown")).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].tid, 0);
        assert_eq!(hits[0].score, Some(1.0));
        assert_eq!(hits[1].tid, 1);
        assert_eq!(hits[1].score, Some(0.5));
    }

    #[test]
    fn like_scans_raw_keys() {
        let dir = TempDir::new().unwrap();
        let mut index = index_with_docs(&dir, &[(0, "hare"), (1, "hart"), (2, "fox")]);
        let hits = index.filter(&atom(ComparisonOperator::Like, "ha%")).unwrap();
        assert_eq!(hits.iter().map(|m| m.tid).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn compound_and_intersects() {
        let dir = TempDir::new().unwrap();
        let mut index = index_with_docs(&dir, &[(0, "quick brown hare"), (1, "quick fox")]);
        let pred = BooleanPredicate::and(
            atom(ComparisonOperator::Match, "quick"),
            atom(ComparisonOperator::Match, "hare"),
        );
        let hits = index.filter(&pred).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tid, 0);
    }

    #[test]
    fn compound_or_unions() {
        let dir = TempDir::new().unwrap();
        let mut index = index_with_docs(&dir, &[(0, "hare"), (1, "fox")]);
        let pred = BooleanPredicate::or(
            atom(ComparisonOperator::Match, "hare"),
            atom(ComparisonOperator::Match, "fox"),
        );
        let hits = index.filter(&pred).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn writer_sees_own_pending_documents() {
        let dir = TempDir::new().unwrap();
        let mut index = index_with_docs(&dir, &[(0, "pending document")]);
        // No commit yet: the filter must still observe the buffered add.
        let hits = index.filter(&atom(ComparisonOperator::Match, "pending")).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn rollback_discards_staged_state() {
        let dir = TempDir::new().unwrap();
        let mut index = index_with_docs(&dir, &[(0, "kept")]);
        index.commit().unwrap();

        index
            .update(&DataChangeEvent::Insert {
                tid: 1,
                values: vec![("body".into(), Some(Value::String("discarded".into())))],
            })
            .unwrap();
        index.rollback().unwrap();

        assert!(index
            .filter(&atom(ComparisonOperator::Match, "discarded"))
            .unwrap()
            .is_empty());
        assert_eq!(
            index.filter(&atom(ComparisonOperator::Match, "kept")).unwrap().len(),
            1
        );
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut index = index_with_docs(&dir, &[(0, "persisted words")]);
        index.commit().unwrap();
        drop(index);

        let mut index =
            InvertedTextIndex::open("warren.test.text_idx", "body", dir.path()).unwrap();
        let hits = index.filter(&atom(ComparisonOperator::Match, "persisted")).unwrap();
        assert_eq!(hits.len(), 1);
    }
}
