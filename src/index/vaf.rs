//! # VA-File Vector Index
//!
//! A vector-approximation file over a float-vector column. Each dimension
//! is quantized into uniform cells between the trained minimum and maximum
//! (boundary *marks*); a tuple's *signature* is one cell index per
//! dimension, a `u8` each.
//!
//! ## VA-SSA scan
//!
//! For a query vector, [`VaBounds`] precomputes, per dimension and cell,
//! the smallest and largest possible contribution to the distance. Summing
//! table lookups over a signature yields a lower and upper bound on the
//! exact distance without touching the vector itself. The kNN operator
//! keeps a threshold equal to the current k-th best distance and skips
//! every signature whose lower bound exceeds it; only survivors get their
//! exact vector read and measured.
//!
//! Supported kernels: L1, L2 and squared L2; the bounds are tight and
//! monotone for those. Weighted queries and other kernels fall back to the
//! fullscan operator.
//!
//! An update outside the trained range would invalidate the bounds, so it
//! marks the index dirty instead of producing a wrong signature; dirty
//! indexes are skipped by the planner until rebuilt.

use super::{value_of, DataChangeEvent, RebuildSource};
use crate::config::VAF_CELLS_PER_DIMENSION;
use crate::encoding::{Decoder, Encoder};
use crate::math::Distance;
use crate::query::cost::{Cost, COST_CPU_PER_DIMENSION, COST_READ_PAGE};
use crate::query::predicate::KnnPredicate;
use crate::storage::TupleId;
use crate::types::{Type, Value};
use eyre::{ensure, Result, WrapErr};
use std::path::{Path, PathBuf};

const SNAPSHOT_FILE: &str = "vaf.idx";

pub struct VaFileIndex {
    name: String,
    column: String,
    path: PathBuf,
    dim: usize,
    cells: usize,
    /// Per dimension: `cells + 1` ascending boundaries.
    marks: Vec<Vec<f32>>,
    signatures: Vec<Option<Box<[u8]>>>,
    committed: Vec<Option<Box<[u8]>>>,
    trained: bool,
    dirty: bool,
}

impl VaFileIndex {
    pub fn create(name: &str, column: &str, column_type: Type, dir: &Path) -> Result<Self> {
        let dim = match column_type {
            Type::FloatVector(n) => n as usize,
            other => eyre::bail!(
                "VA-file requires a float vector column, {} is {}",
                column,
                other.name()
            ),
        };
        // Untrained and therefore dirty: a rebuild must run before the
        // index may serve queries.
        let index = Self {
            name: name.to_string(),
            column: column.to_string(),
            path: dir.join(SNAPSHOT_FILE),
            dim,
            cells: VAF_CELLS_PER_DIMENSION,
            marks: Vec::new(),
            signatures: Vec::new(),
            committed: Vec::new(),
            trained: false,
            dirty: true,
        };
        index.persist()?;
        Ok(index)
    }

    pub fn open(name: &str, column: &str, dir: &Path) -> Result<Self> {
        let path = dir.join(SNAPSHOT_FILE);
        let bytes = std::fs::read(&path)
            .wrap_err_with(|| format!("failed to read VA-file snapshot {}", path.display()))?;
        let mut dec = Decoder::new(&bytes);
        let dirty = dec.u8()? != 0;
        let trained = dec.u8()? != 0;
        let dim = dec.u64()? as usize;
        let cells = dec.u64()? as usize;
        let mut marks = Vec::with_capacity(dim);
        if trained {
            for _ in 0..dim {
                let mut boundaries = Vec::with_capacity(cells + 1);
                for _ in 0..=cells {
                    boundaries.push(dec.f32()?);
                }
                marks.push(boundaries);
            }
        }
        let count = dec.u64()? as usize;
        let mut signatures = Vec::with_capacity(count);
        for _ in 0..count {
            if dec.u8()? != 0 {
                signatures.push(Some(dec.bytes()?.to_vec().into_boxed_slice()));
            } else {
                signatures.push(None);
            }
        }
        Ok(Self {
            name: name.to_string(),
            column: column.to_string(),
            path,
            dim,
            cells,
            marks,
            committed: signatures.clone(),
            signatures,
            trained,
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

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn can_process_knn(&self, predicate: &KnnPredicate) -> bool {
        self.trained
            && !self.dirty
            && predicate.column == self.column
            && predicate.dimension() == self.dim
            && predicate.effective_weights().is_none()
            && matches!(
                predicate.distance,
                Distance::L1 | Distance::L2 | Distance::L2Squared
            )
    }

    pub fn knn_cost(&self, predicate: &KnnPredicate) -> Cost {
        let n = self.signatures.len() as f32;
        let dim = self.dim as f32;
        // Signatures are one byte per dimension versus four for the raw
        // vector, and the lower-bound pruning skips most exact reads.
        Cost::new(
            COST_READ_PAGE * n * dim / 4096.0 * 0.25,
            COST_CPU_PER_DIMENSION * n * dim * predicate.queries.len() as f32 * 0.1,
            (predicate.k * predicate.queries.len()) as f32,
        )
    }

    /// Bounds tables for one query vector.
    pub fn bounds(&self, query: &[f32], distance: Distance) -> Result<VaBounds> {
        ensure!(self.trained, "VA-file {} is not trained", self.name);
        ensure!(
            query.len() == self.dim,
            "query dimension {} does not match index dimension {}",
            query.len(),
            self.dim
        );
        Ok(VaBounds::new(&self.marks, query, distance))
    }

    /// Current signatures, tuple id ascending. Reflects this transaction's
    /// own pending updates.
    pub fn signatures(&self) -> impl Iterator<Item = (TupleId, &[u8])> {
        self.signatures
            .iter()
            .enumerate()
            .filter_map(|(tid, sig)| sig.as_deref().map(|s| (tid as TupleId, s)))
    }

    fn signature_of(&self, vector: &[f32]) -> Option<Box<[u8]>> {
        let mut signature = vec![0u8; self.dim];
        for (d, component) in vector.iter().enumerate() {
            let boundaries = &self.marks[d];
            if *component < boundaries[0] || *component > boundaries[self.cells] {
                return None;
            }
            let cell = boundaries.partition_point(|m| m <= component);
            signature[d] = (cell.saturating_sub(1)).min(self.cells - 1) as u8;
        }
        Some(signature.into_boxed_slice())
    }

    fn store(&mut self, tid: TupleId, signature: Option<Box<[u8]>>) {
        let idx = tid as usize;
        if self.signatures.len() <= idx {
            self.signatures.resize(idx + 1, None);
        }
        self.signatures[idx] = signature;
    }

    pub fn update(&mut self, event: &DataChangeEvent) -> Result<()> {
        if !self.trained {
            self.dirty = true;
            return Ok(());
        }
        match event {
            DataChangeEvent::Insert { tid, values } | DataChangeEvent::Update {
                tid,
                new: values,
                ..
            } => {
                match value_of(values, &self.column) {
                    Some(Some(value)) => {
                        let Some(vector) = value.as_f32_slice() else {
                            self.dirty = true;
                            return Ok(());
                        };
                        match self.signature_of(vector) {
                            Some(signature) => self.store(*tid, Some(signature)),
                            // Out of the trained range: bounds would lie.
                            None => self.dirty = true,
                        }
                    }
                    Some(None) => self.store(*tid, None),
                    None => {}
                }
            }
            DataChangeEvent::Delete { tid, .. } => self.store(*tid, None),
        }
        Ok(())
    }

    /// Retrains marks from the column's min/max and recomputes every
    /// signature.
    pub fn rebuild(&mut self, source: RebuildSource) -> Result<()> {
        let mut rows: Vec<(TupleId, Vec<f32>)> = Vec::new();
        let mut max_tid = 0u64;
        for entry in source {
            let (tid, value) = entry?;
            max_tid = max_tid.max(tid + 1);
            if let Some(value) = value {
                let vector = value.as_f32_slice().ok_or_else(|| {
                    eyre::eyre!(
                        "VA-file {} rebuild saw a non-vector value at tuple {}",
                        self.name,
                        tid
                    )
                })?;
                ensure!(
                    vector.len() == self.dim,
                    "VA-file {} rebuild saw dimension {} (expected {})",
                    self.name,
                    vector.len(),
                    self.dim
                );
                rows.push((tid, vector.to_vec()));
            }
        }

        let mut min = vec![0.0f32; self.dim];
        let mut max = vec![1.0f32; self.dim];
        if !rows.is_empty() {
            min = rows[0].1.clone();
            max = rows[0].1.clone();
            for (_, v) in &rows {
                for d in 0..self.dim {
                    min[d] = min[d].min(v[d]);
                    max[d] = max[d].max(v[d]);
                }
            }
        }

        self.marks = (0..self.dim)
            .map(|d| {
                let lo = min[d];
                let span = (max[d] - lo).max(f32::EPSILON);
                (0..=self.cells)
                    .map(|c| lo + span * c as f32 / self.cells as f32)
                    .collect()
            })
            .collect();
        self.trained = true;

        self.signatures = vec![None; max_tid as usize];
        for (tid, vector) in rows {
            let signature = self
                .signature_of(&vector)
                .expect("freshly trained marks cover every vector");
            self.signatures[tid as usize] = Some(signature);
        }
        self.dirty = false;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.persist()?;
        self.committed = self.signatures.clone();
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.signatures = self.committed.clone();
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let mut enc = Encoder::new();
        enc.u8(self.dirty as u8);
        enc.u8(self.trained as u8);
        enc.u64(self.dim as u64);
        enc.u64(self.cells as u64);
        if self.trained {
            for boundaries in &self.marks {
                for mark in boundaries {
                    enc.f32(*mark);
                }
            }
        }
        enc.u64(self.signatures.len() as u64);
        for signature in &self.signatures {
            match signature {
                Some(s) => {
                    enc.u8(1);
                    enc.bytes(s);
                }
                None => {
                    enc.u8(0);
                }
            }
        }
        let tmp = self.path.with_extension("idx.tmp");
        std::fs::write(&tmp, enc.finish())?;
        std::fs::rename(&tmp, &self.path)
            .wrap_err_with(|| format!("failed to install snapshot {}", self.path.display()))
    }
}

/// Per-query lookup tables for signature distance bounds.
///
/// `update(signature)` returns `(lower, upper)` bounds on the exact
/// distance; `is_candidate` compares the lower bound against the scan's
/// running threshold.
pub struct VaBounds {
    /// Per dimension, per cell: smallest possible contribution.
    lb: Vec<Vec<f64>>,
    /// Per dimension, per cell: largest possible contribution.
    ub: Vec<Vec<f64>>,
    distance: Distance,
}

impl VaBounds {
    fn new(marks: &[Vec<f32>], query: &[f32], distance: Distance) -> Self {
        let mut lb = Vec::with_capacity(marks.len());
        let mut ub = Vec::with_capacity(marks.len());
        for (d, boundaries) in marks.iter().enumerate() {
            let q = query[d] as f64;
            let cells = boundaries.len() - 1;
            let mut lb_d = Vec::with_capacity(cells);
            let mut ub_d = Vec::with_capacity(cells);
            for c in 0..cells {
                let low = boundaries[c] as f64;
                let high = boundaries[c + 1] as f64;
                let (lo_delta, hi_delta) = if q < low {
                    (low - q, high - q)
                } else if q > high {
                    (q - high, q - low)
                } else {
                    (0.0, (q - low).max(high - q))
                };
                match distance {
                    Distance::L1 => {
                        lb_d.push(lo_delta);
                        ub_d.push(hi_delta);
                    }
                    _ => {
                        lb_d.push(lo_delta * lo_delta);
                        ub_d.push(hi_delta * hi_delta);
                    }
                }
            }
            lb.push(lb_d);
            ub.push(ub_d);
        }
        Self { lb, ub, distance }
    }

    /// Lower and upper bounds on the distance for a signature.
    pub fn update(&self, signature: &[u8]) -> (f64, f64) {
        let mut lower = 0.0;
        let mut upper = 0.0;
        for (d, cell) in signature.iter().enumerate() {
            lower += self.lb[d][*cell as usize];
            upper += self.ub[d][*cell as usize];
        }
        if self.distance == Distance::L2 {
            (lower.sqrt(), upper.sqrt())
        } else {
            (lower, upper)
        }
    }

    pub fn is_candidate(&self, signature: &[u8], threshold: f64) -> bool {
        self.update(signature).0 <= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::kernel_f32;
    use tempfile::TempDir;

    fn vectors() -> Vec<(TupleId, Vec<f32>)> {
        vec![
            (0, vec![0.0, 0.0]),
            (1, vec![1.0, 0.0]),
            (2, vec![0.5, 0.5]),
            (3, vec![1.0, 1.0]),
            (4, vec![0.25, 0.75]),
        ]
    }

    fn trained_index(dir: &TempDir) -> VaFileIndex {
        let mut index = VaFileIndex::create(
            "warren.test.feat_idx",
            "feat",
            Type::FloatVector(2),
            dir.path(),
        )
        .unwrap();
        let rows: Vec<Result<(TupleId, Option<Value>)>> = vectors()
            .into_iter()
            .map(|(tid, v)| Ok((tid, Some(Value::FloatVector(v)))))
            .collect();
        let mut source = rows.into_iter();
        index.rebuild(&mut source).unwrap();
        index
    }

    #[test]
    fn fresh_index_is_dirty_until_rebuilt() {
        let dir = TempDir::new().unwrap();
        let index = VaFileIndex::create(
            "warren.test.feat_idx",
            "feat",
            Type::FloatVector(2),
            dir.path(),
        )
        .unwrap();
        assert!(index.is_dirty());

        let trained = trained_index(&dir);
        assert!(!trained.is_dirty());
    }

    #[test]
    fn bounds_bracket_exact_distances() {
        let dir = TempDir::new().unwrap();
        let index = trained_index(&dir);
        let query = [0.9f32, 0.1];
        for metric in [Distance::L1, Distance::L2, Distance::L2Squared] {
            let bounds = index.bounds(&query, metric).unwrap();
            let kernel = kernel_f32(metric);
            for (tid, vector) in vectors() {
                let exact = kernel(&query, &vector);
                let sig = index.signatures[tid as usize].as_ref().unwrap();
                let (lb, ub) = bounds.update(sig);
                assert!(
                    lb <= exact + 1e-6 && exact <= ub + 1e-6,
                    "{:?}: bounds [{}, {}] miss exact {} for tuple {}",
                    metric,
                    lb,
                    ub,
                    exact,
                    tid
                );
            }
        }
    }

    #[test]
    fn out_of_range_update_marks_dirty() {
        let dir = TempDir::new().unwrap();
        let mut index = trained_index(&dir);
        index
            .update(&DataChangeEvent::Insert {
                tid: 5,
                values: vec![("feat".into(), Some(Value::FloatVector(vec![100.0, 0.0])))],
            })
            .unwrap();
        assert!(index.is_dirty());
    }

    #[test]
    fn in_range_update_extends_signatures() {
        let dir = TempDir::new().unwrap();
        let mut index = trained_index(&dir);
        index
            .update(&DataChangeEvent::Insert {
                tid: 5,
                values: vec![("feat".into(), Some(Value::FloatVector(vec![0.75, 0.25])))],
            })
            .unwrap();
        assert!(!index.is_dirty());
        assert_eq!(index.signatures().count(), 6);
    }

    #[test]
    fn delete_clears_signature_and_rollback_restores() {
        let dir = TempDir::new().unwrap();
        let mut index = trained_index(&dir);
        index.commit().unwrap();
        index
            .update(&DataChangeEvent::Delete {
                tid: 2,
                old: vec![("feat".into(), Some(Value::FloatVector(vec![0.5, 0.5])))],
            })
            .unwrap();
        assert_eq!(index.signatures().count(), 4);
        index.rollback().unwrap();
        assert_eq!(index.signatures().count(), 5);
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut index = trained_index(&dir);
        index.commit().unwrap();
        drop(index);

        let index = VaFileIndex::open("warren.test.feat_idx", "feat", dir.path()).unwrap();
        assert!(!index.is_dirty());
        assert_eq!(index.dimension(), 2);
        assert_eq!(index.signatures().count(), 5);
    }

    #[test]
    fn can_process_respects_kernel_and_weights() {
        let dir = TempDir::new().unwrap();
        let index = trained_index(&dir);

        let ok = KnnPredicate::new("feat", 2, Distance::L2, vec![vec![0.1, 0.2]]);
        assert!(index.can_process_knn(&ok));

        let cosine = KnnPredicate::new("feat", 2, Distance::Cosine, vec![vec![0.1, 0.2]]);
        assert!(!index.can_process_knn(&cosine));

        let weighted = KnnPredicate::new("feat", 2, Distance::L2, vec![vec![0.1, 0.2]])
            .with_weights(vec![vec![2.0, 1.0]]);
        assert!(!index.can_process_knn(&weighted));

        let wrong_dim = KnnPredicate::new("feat", 2, Distance::L2, vec![vec![0.1]]);
        assert!(!index.can_process_knn(&wrong_dim));
    }
}
