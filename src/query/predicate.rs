//! # Predicates
//!
//! The two predicate families a query can carry: Boolean predicates
//! (atomic comparisons composed with AND/OR) and kNN predicates (query
//! vectors, k, a distance kernel, optional weights).
//!
//! Boolean predicates evaluate against a column lookup so the same code
//! runs during linear scans, index filters and planner constant folding.
//! SQL-style null semantics apply: a comparison with a null cell is false
//! (before the `not` flag), only `ISNULL` observes nulls directly.

use crate::math::{weights_are_unit, Distance};
use crate::types::Value;
use eyre::{ensure, Result};
use std::hash::Hasher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    In,
    Like,
    Match,
    IsNull,
    Between,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connector {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AtomicPredicate {
    pub column: String,
    pub op: ComparisonOperator,
    pub not: bool,
    pub values: Vec<Value>,
}

impl AtomicPredicate {
    pub fn new(column: impl Into<String>, op: ComparisonOperator, values: Vec<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            not: false,
            values,
        }
    }

    pub fn negated(mut self) -> Self {
        self.not = !self.not;
        self
    }

    /// Evaluates against a nullable cell value.
    pub fn matches_value(&self, value: Option<&Value>) -> Result<bool> {
        let raw = match (self.op, value) {
            (ComparisonOperator::IsNull, v) => v.is_none(),
            (_, None) => false,
            (op, Some(v)) => self.compare(op, v)?,
        };
        Ok(raw != self.not)
    }

    fn compare(&self, op: ComparisonOperator, v: &Value) -> Result<bool> {
        use std::cmp::Ordering::*;
        Ok(match op {
            ComparisonOperator::Equal => {
                self.rhs(0)?.compare(v).map(|o| o == Equal).unwrap_or(false)
            }
            ComparisonOperator::NotEqual => {
                self.rhs(0)?.compare(v).map(|o| o != Equal).unwrap_or(true)
            }
            ComparisonOperator::Less => {
                v.compare(self.rhs(0)?).map(|o| o == Less).unwrap_or(false)
            }
            ComparisonOperator::LessEqual => v
                .compare(self.rhs(0)?)
                .map(|o| o != Greater)
                .unwrap_or(false),
            ComparisonOperator::Greater => v
                .compare(self.rhs(0)?)
                .map(|o| o == Greater)
                .unwrap_or(false),
            ComparisonOperator::GreaterEqual => {
                v.compare(self.rhs(0)?).map(|o| o != Less).unwrap_or(false)
            }
            ComparisonOperator::In => self
                .values
                .iter()
                .any(|rhs| rhs.compare(v).map(|o| o == Equal).unwrap_or(false)),
            ComparisonOperator::Like => {
                let pattern = self.rhs(0)?.as_str().ok_or_else(|| {
                    eyre::eyre!("LIKE requires a string pattern on column {}", self.column)
                })?;
                v.as_str().map(|s| like_match(pattern, s)).unwrap_or(false)
            }
            ComparisonOperator::Match => {
                let needle = self.rhs(0)?.as_str().ok_or_else(|| {
                    eyre::eyre!("MATCH requires a string query on column {}", self.column)
                })?;
                v.as_str().map(|s| text_match(needle, s)).unwrap_or(false)
            }
            ComparisonOperator::Between => {
                let low = self.rhs(0)?;
                let high = self.rhs(1)?;
                let ge_low = v.compare(low).map(|o| o != Less).unwrap_or(false);
                let le_high = v.compare(high).map(|o| o != Greater).unwrap_or(false);
                ge_low && le_high
            }
            ComparisonOperator::IsNull => unreachable!("handled by matches_value"),
        })
    }

    fn rhs(&self, idx: usize) -> Result<&Value> {
        self.values.get(idx).ok_or_else(|| {
            eyre::eyre!(
                "predicate on {} is missing operand {}",
                self.column,
                idx
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BooleanPredicate {
    Atomic(AtomicPredicate),
    Compound {
        connector: Connector,
        left: Box<BooleanPredicate>,
        right: Box<BooleanPredicate>,
    },
}

impl BooleanPredicate {
    pub fn and(left: BooleanPredicate, right: BooleanPredicate) -> Self {
        BooleanPredicate::Compound {
            connector: Connector::And,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn or(left: BooleanPredicate, right: BooleanPredicate) -> Self {
        BooleanPredicate::Compound {
            connector: Connector::Or,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Every column the predicate references, deduplicated in order.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            BooleanPredicate::Atomic(a) => {
                if !out.contains(&a.column.as_str()) {
                    out.push(&a.column);
                }
            }
            BooleanPredicate::Compound { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
        }
    }

    /// Evaluates against a column lookup.
    pub fn matches<F>(&self, lookup: &F) -> Result<bool>
    where
        F: Fn(&str) -> Result<Option<Value>>,
    {
        match self {
            BooleanPredicate::Atomic(a) => {
                let value = lookup(&a.column)?;
                a.matches_value(value.as_ref())
            }
            BooleanPredicate::Compound {
                connector,
                left,
                right,
            } => {
                let l = left.matches(lookup)?;
                match connector {
                    Connector::And => {
                        if !l {
                            return Ok(false);
                        }
                        right.matches(lookup)
                    }
                    Connector::Or => {
                        if l {
                            return Ok(true);
                        }
                        right.matches(lookup)
                    }
                }
            }
        }
    }

    pub fn atoms(&self) -> Vec<&AtomicPredicate> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a AtomicPredicate>) {
        match self {
            BooleanPredicate::Atomic(a) => out.push(a),
            BooleanPredicate::Compound { left, right, .. } => {
                left.collect_atoms(out);
                right.collect_atoms(out);
            }
        }
    }
}

/// kNN predicate: find, for each query vector, the k nearest tuples of a
/// vector column under a distance kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct KnnPredicate {
    pub column: String,
    pub k: usize,
    pub queries: Vec<Vec<f32>>,
    pub weights: Option<Vec<Vec<f32>>>,
    pub distance: Distance,
}

impl KnnPredicate {
    pub fn new(
        column: impl Into<String>,
        k: usize,
        distance: Distance,
        queries: Vec<Vec<f32>>,
    ) -> Self {
        Self {
            column: column.into(),
            k,
            queries,
            weights: None,
            distance,
        }
    }

    pub fn with_weights(mut self, weights: Vec<Vec<f32>>) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn dimension(&self) -> usize {
        self.queries.first().map(|q| q.len()).unwrap_or(0)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.k > 0, "kNN requires k >= 1");
        ensure!(!self.queries.is_empty(), "kNN requires at least one query vector");
        let dim = self.dimension();
        ensure!(
            self.queries.iter().all(|q| q.len() == dim),
            "kNN query vectors disagree on dimension"
        );
        if let Some(w) = &self.weights {
            ensure!(
                w.len() == self.queries.len() && w.iter().all(|wi| wi.len() == dim),
                "kNN weights must mirror the query vectors"
            );
        }
        Ok(())
    }

    /// Weights with the all-unit case dropped for efficiency.
    pub fn effective_weights(&self) -> Option<&[Vec<f32>]> {
        match &self.weights {
            Some(w) if w.iter().all(|wi| weights_are_unit(wi)) => None,
            Some(w) => Some(w),
            None => None,
        }
    }
}

/// SQL LIKE with `%` (any run) and `_` (single character).
pub fn like_match(pattern: &str, target: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = target.chars().collect();
    // dp[j]: pattern[..i] matches target[..j]
    let mut dp = vec![false; t.len() + 1];
    dp[0] = true;
    for &pc in &p {
        let mut next = vec![false; t.len() + 1];
        match pc {
            '%' => {
                let mut any = false;
                for j in 0..=t.len() {
                    any |= dp[j];
                    next[j] = any;
                }
            }
            '_' => {
                for j in 1..=t.len() {
                    next[j] = dp[j - 1];
                }
            }
            c => {
                for j in 1..=t.len() {
                    next[j] = dp[j - 1] && t[j - 1] == c;
                }
            }
        }
        dp = next;
    }
    dp[t.len()]
}

/// Splits into lowercased alphanumeric terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Full-text match: every query term occurs in the target's term set.
pub fn text_match(query: &str, target: &str) -> bool {
    let terms = tokenize(target);
    let needles = tokenize(query);
    !needles.is_empty() && needles.iter().all(|n| terms.contains(n))
}

/// Structural hash of a value, usable for plan digests (floats hash by
/// bit pattern).
pub fn hash_value(value: &Value, h: &mut dyn Hasher) {
    let ord = value.type_of().ordinal();
    h.write_u32(ord);
    match value {
        Value::Boolean(v) => h.write_u8(*v as u8),
        Value::Byte(v) => h.write_i8(*v),
        Value::Short(v) => h.write_i16(*v),
        Value::Int(v) => h.write_i32(*v),
        Value::Long(v) | Value::Date(v) => h.write_i64(*v),
        Value::Float(v) => h.write_u32(v.to_bits()),
        Value::Double(v) => h.write_u64(v.to_bits()),
        Value::String(v) => h.write(v.as_bytes()),
        Value::Complex32(c) => {
            h.write_u32(c[0].to_bits());
            h.write_u32(c[1].to_bits());
        }
        Value::Complex64(c) => {
            h.write_u64(c[0].to_bits());
            h.write_u64(c[1].to_bits());
        }
        Value::BooleanVector(v) => {
            for b in v {
                h.write_u8(*b as u8);
            }
        }
        Value::IntVector(v) => {
            for e in v {
                h.write_i32(*e);
            }
        }
        Value::LongVector(v) => {
            for e in v {
                h.write_i64(*e);
            }
        }
        Value::FloatVector(v) => {
            for e in v {
                h.write_u32(e.to_bits());
            }
        }
        Value::DoubleVector(v) => {
            for e in v {
                h.write_u64(e.to_bits());
            }
        }
        Value::Complex32Vector(v) => {
            for c in v {
                h.write_u32(c[0].to_bits());
                h.write_u32(c[1].to_bits());
            }
        }
        Value::Complex64Vector(v) => {
            for c in v {
                h.write_u64(c[0].to_bits());
                h.write_u64(c[1].to_bits());
            }
        }
    }
}

pub fn hash_boolean_predicate(pred: &BooleanPredicate, h: &mut dyn Hasher) {
    match pred {
        BooleanPredicate::Atomic(a) => {
            h.write_u8(0);
            h.write(a.column.as_bytes());
            h.write_u8(a.op as u8);
            h.write_u8(a.not as u8);
            h.write_usize(a.values.len());
            for v in &a.values {
                hash_value(v, h);
            }
        }
        BooleanPredicate::Compound {
            connector,
            left,
            right,
        } => {
            h.write_u8(1);
            h.write_u8(*connector as u8);
            hash_boolean_predicate(left, h);
            hash_boolean_predicate(right, h);
        }
    }
}

pub fn hash_knn_predicate(pred: &KnnPredicate, h: &mut dyn Hasher) {
    h.write(pred.column.as_bytes());
    h.write_usize(pred.k);
    h.write_u8(pred.distance as u8);
    h.write_usize(pred.queries.len());
    for q in &pred.queries {
        for e in q {
            h.write_u32(e.to_bits());
        }
    }
    if let Some(weights) = &pred.weights {
        h.write_u8(1);
        for w in weights {
            for e in w {
                h.write_u32(e.to_bits());
            }
        }
    } else {
        h.write_u8(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(op: ComparisonOperator, values: Vec<Value>) -> AtomicPredicate {
        AtomicPredicate::new("c", op, values)
    }

    #[test]
    fn equality_and_negation() {
        let p = atom(ComparisonOperator::Equal, vec![Value::Int(5)]);
        assert!(p.matches_value(Some(&Value::Int(5))).unwrap());
        assert!(!p.matches_value(Some(&Value::Int(6))).unwrap());
        assert!(!p.matches_value(None).unwrap());

        let n = p.negated();
        assert!(!n.matches_value(Some(&Value::Int(5))).unwrap());
        assert!(n.matches_value(Some(&Value::Int(6))).unwrap());
    }

    #[test]
    fn range_operators() {
        let v = Value::Double(2.5);
        assert!(atom(ComparisonOperator::Less, vec![Value::Int(3)])
            .matches_value(Some(&v))
            .unwrap());
        assert!(atom(ComparisonOperator::GreaterEqual, vec![Value::Double(2.5)])
            .matches_value(Some(&v))
            .unwrap());
        assert!(atom(
            ComparisonOperator::Between,
            vec![Value::Int(2), Value::Int(3)]
        )
        .matches_value(Some(&v))
        .unwrap());
    }

    #[test]
    fn in_list() {
        let p = atom(
            ComparisonOperator::In,
            vec![Value::String("a".into()), Value::String("b".into())],
        );
        assert!(p.matches_value(Some(&Value::String("b".into()))).unwrap());
        assert!(!p.matches_value(Some(&Value::String("c".into()))).unwrap());
    }

    #[test]
    fn is_null_sees_nulls() {
        let p = atom(ComparisonOperator::IsNull, vec![]);
        assert!(p.matches_value(None).unwrap());
        assert!(!p.matches_value(Some(&Value::Int(0))).unwrap());
    }

    #[test]
    fn like_wildcards() {
        assert!(like_match("h%", "hare"));
        assert!(like_match("%are", "hare"));
        assert!(like_match("h_re", "hare"));
        assert!(like_match("%a%", "hare"));
        assert!(!like_match("h_e", "hare"));
        assert!(like_match("%", ""));
        assert!(!like_match("x%", "hare"));
    }

    #[test]
    fn match_requires_all_terms() {
        assert!(text_match("quick fox", "The Quick brown Fox!"));
        assert!(!text_match("quick wolf", "the quick brown fox"));
        assert!(!text_match("", "anything"));
    }

    #[test]
    fn compound_short_circuits() {
        let pred = BooleanPredicate::and(
            BooleanPredicate::Atomic(AtomicPredicate::new(
                "a",
                ComparisonOperator::Equal,
                vec![Value::Int(1)],
            )),
            BooleanPredicate::Atomic(AtomicPredicate::new(
                "b",
                ComparisonOperator::Greater,
                vec![Value::Int(10)],
            )),
        );
        let lookup = |name: &str| -> Result<Option<Value>> {
            Ok(match name {
                "a" => Some(Value::Int(1)),
                "b" => Some(Value::Int(20)),
                _ => None,
            })
        };
        assert!(pred.matches(&lookup).unwrap());
        assert_eq!(pred.columns(), vec!["a", "b"]);
    }

    #[test]
    fn knn_validation() {
        let p = KnnPredicate::new("feat", 2, Distance::L2, vec![vec![1.0, 0.0]]);
        p.validate().unwrap();

        let bad = KnnPredicate::new("feat", 0, Distance::L2, vec![vec![1.0]]);
        assert!(bad.validate().is_err());

        let ragged =
            KnnPredicate::new("feat", 1, Distance::L2, vec![vec![1.0], vec![1.0, 2.0]]);
        assert!(ragged.validate().is_err());
    }

    #[test]
    fn unit_weights_are_dropped() {
        let p = KnnPredicate::new("feat", 1, Distance::L2, vec![vec![1.0, 0.0]])
            .with_weights(vec![vec![1.0, 1.0]]);
        assert!(p.effective_weights().is_none());

        let q = KnnPredicate::new("feat", 1, Distance::L2, vec![vec![1.0, 0.0]])
            .with_weights(vec![vec![2.0, 1.0]]);
        assert!(q.effective_weights().is_some());
    }
}
