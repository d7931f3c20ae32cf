//! # Physical Plans
//!
//! Executable operator trees. Each node names a concrete access path or
//! operator implementation; [`PhysicalPlan::total_cost`] folds the cost
//! model over the tree, and [`PhysicalPlan::to_logical`] recovers the
//! logical intent (the planner-idempotence property relies on it).

use super::cost::{Cost, COST_CPU_PER_DIMENSION, COST_CPU_PER_TUPLE, COST_READ_PAGE};
use super::logical::{LogicalPlan, ProjectionColumn};
use super::predicate::{BooleanPredicate, KnnPredicate};
use super::{DISTANCE_COLUMN, SCORE_COLUMN};
use crate::catalog::Entity;
use crate::index::IndexKind;
use std::sync::Arc;

/// Rows a page holds under the cost model's average-width assumption.
const ROWS_PER_PAGE: f32 = 64.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Sum,
    Mean,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalPlan {
    EntityScan {
        entity: String,
        columns: Vec<String>,
    },
    RangedEntityScan {
        entity: String,
        columns: Vec<String>,
        partitions: usize,
    },
    EntitySample {
        entity: String,
        columns: Vec<String>,
        size: u64,
        seed: u64,
    },
    LinearScanFilter {
        input: Box<PhysicalPlan>,
        predicate: BooleanPredicate,
    },
    IndexedFilter {
        entity: String,
        index: String,
        kind: IndexKind,
        predicate: BooleanPredicate,
    },
    /// Completes partial records (from indexes or kNN) with entity columns.
    FetchColumns {
        input: Box<PhysicalPlan>,
        entity: String,
        columns: Vec<String>,
    },
    KnnFullscan {
        entity: String,
        predicate: KnnPredicate,
        prefilter: Option<BooleanPredicate>,
        parallelism: usize,
    },
    KnnIndexed {
        entity: String,
        index: String,
        predicate: KnnPredicate,
    },
    SelectProjection {
        input: Box<PhysicalPlan>,
        columns: Vec<ProjectionColumn>,
    },
    CountProjection {
        input: Box<PhysicalPlan>,
    },
    ExistsProjection {
        input: Box<PhysicalPlan>,
    },
    AggregateProjection {
        input: Box<PhysicalPlan>,
        function: AggregateFunction,
        columns: Vec<ProjectionColumn>,
    },
    Limit {
        input: Box<PhysicalPlan>,
        limit: u64,
        skip: u64,
    },
}

impl PhysicalPlan {
    /// Column names this node's operator will emit.
    pub fn output_columns(&self) -> Vec<String> {
        match self {
            PhysicalPlan::EntityScan { columns, .. }
            | PhysicalPlan::RangedEntityScan { columns, .. }
            | PhysicalPlan::EntitySample { columns, .. } => columns.clone(),
            PhysicalPlan::LinearScanFilter { input, .. } | PhysicalPlan::Limit { input, .. } => {
                input.output_columns()
            }
            PhysicalPlan::IndexedFilter {
                kind, predicate, ..
            } => match kind {
                IndexKind::UniqueHash => predicate
                    .columns()
                    .first()
                    .map(|c| vec![c.to_string()])
                    .unwrap_or_default(),
                IndexKind::InvertedText => vec![SCORE_COLUMN.to_string()],
                IndexKind::VaFile => Vec::new(),
            },
            PhysicalPlan::FetchColumns { input, columns, .. } => {
                let mut out = input.output_columns();
                for c in columns {
                    if !out.contains(c) {
                        out.push(c.clone());
                    }
                }
                out
            }
            PhysicalPlan::KnnFullscan { .. } | PhysicalPlan::KnnIndexed { .. } => {
                vec![DISTANCE_COLUMN.to_string()]
            }
            PhysicalPlan::SelectProjection { columns, .. } => columns
                .iter()
                .map(|(name, alias)| alias.clone().unwrap_or_else(|| name.clone()))
                .collect(),
            PhysicalPlan::CountProjection { .. } => vec!["count(*)".to_string()],
            PhysicalPlan::ExistsProjection { .. } => vec!["exists(*)".to_string()],
            PhysicalPlan::AggregateProjection {
                function, columns, ..
            } => {
                let label = match function {
                    AggregateFunction::Sum => "sum",
                    AggregateFunction::Mean => "mean",
                    AggregateFunction::Min => "min",
                    AggregateFunction::Max => "max",
                };
                columns
                    .iter()
                    .map(|(name, alias)| {
                        alias.clone().unwrap_or_else(|| format!("{}({})", label, name))
                    })
                    .collect()
            }
        }
    }

    /// Whether the tree can be handed to the executor: every projection
    /// and filter must find its columns in what its input produces. This
    /// is what rules out, say, a linear-scan plan for a query that
    /// projects the text index's score column.
    pub fn executable(&self) -> bool {
        let inputs_ok = match self.input() {
            Some(input) => input.executable(),
            None => true,
        };
        if !inputs_ok {
            return false;
        }
        match self {
            PhysicalPlan::SelectProjection { input, columns } => {
                let available = input.output_columns();
                columns.iter().all(|(name, _)| available.contains(name))
            }
            PhysicalPlan::AggregateProjection { input, columns, .. } => {
                let available = input.output_columns();
                columns.iter().all(|(name, _)| available.contains(name))
            }
            PhysicalPlan::LinearScanFilter { input, predicate } => {
                let available = input.output_columns();
                predicate
                    .columns()
                    .iter()
                    .all(|name| available.iter().any(|a| a == name))
            }
            _ => true,
        }
    }

    pub fn input(&self) -> Option<&PhysicalPlan> {
        match self {
            PhysicalPlan::LinearScanFilter { input, .. }
            | PhysicalPlan::FetchColumns { input, .. }
            | PhysicalPlan::SelectProjection { input, .. }
            | PhysicalPlan::CountProjection { input }
            | PhysicalPlan::ExistsProjection { input }
            | PhysicalPlan::AggregateProjection { input, .. }
            | PhysicalPlan::Limit { input, .. } => Some(input),
            _ => None,
        }
    }

    /// Sum of this node's own cost and its inputs'.
    pub fn total_cost(&self, entity: &Arc<Entity>) -> Cost {
        let rows = entity.statistics().rows.max(1) as f32;
        let own = match self {
            PhysicalPlan::EntityScan { columns, .. } => Cost::new(
                rows / ROWS_PER_PAGE * COST_READ_PAGE * columns.len().max(1) as f32,
                rows * COST_CPU_PER_TUPLE,
                0.0,
            ),
            PhysicalPlan::RangedEntityScan {
                columns,
                partitions,
                ..
            } => Cost::new(
                rows / ROWS_PER_PAGE * COST_READ_PAGE * columns.len().max(1) as f32,
                rows * COST_CPU_PER_TUPLE / (*partitions).max(1) as f32,
                *partitions as f32,
            ),
            PhysicalPlan::EntitySample { size, columns, .. } => {
                let sampled = (*size as f32).min(rows);
                Cost::new(
                    sampled * COST_READ_PAGE * columns.len().max(1) as f32 / ROWS_PER_PAGE,
                    sampled * COST_CPU_PER_TUPLE,
                    0.0,
                )
            }
            PhysicalPlan::LinearScanFilter { predicate, .. } => Cost::new(
                0.0,
                rows * COST_CPU_PER_TUPLE * predicate.atoms().len().max(1) as f32,
                0.0,
            ),
            PhysicalPlan::IndexedFilter {
                index, predicate, ..
            } => match entity.index(index) {
                Ok(handle) => handle.lock().cost(predicate),
                Err(_) => Cost::INVALID,
            },
            PhysicalPlan::FetchColumns { columns, .. } => Cost::new(
                columns.len() as f32 * COST_READ_PAGE,
                COST_CPU_PER_TUPLE,
                0.0,
            ),
            PhysicalPlan::KnnFullscan {
                predicate,
                parallelism,
                ..
            } => {
                let dim = predicate.dimension() as f32;
                Cost::new(
                    rows * dim * 4.0 / 4096.0 * COST_READ_PAGE,
                    rows * dim * COST_CPU_PER_DIMENSION * predicate.queries.len() as f32
                        / (*parallelism).max(1) as f32,
                    predicate.k as f32 * predicate.queries.len() as f32,
                )
            }
            PhysicalPlan::KnnIndexed {
                index, predicate, ..
            } => match entity.index(index) {
                Ok(handle) => handle.lock().knn_cost(predicate),
                Err(_) => Cost::INVALID,
            },
            PhysicalPlan::SelectProjection { columns, .. } => {
                Cost::new(0.0, columns.len() as f32 * COST_CPU_PER_TUPLE, 0.0)
            }
            PhysicalPlan::CountProjection { .. } | PhysicalPlan::ExistsProjection { .. } => {
                Cost::new(0.0, COST_CPU_PER_TUPLE, 0.0)
            }
            PhysicalPlan::AggregateProjection { columns, .. } => Cost::new(
                0.0,
                rows * COST_CPU_PER_TUPLE * columns.len().max(1) as f32,
                0.0,
            ),
            PhysicalPlan::Limit { .. } => Cost::ZERO,
        };
        match self.input() {
            Some(input) => own + input.total_cost(entity),
            None => own,
        }
    }

    /// Recovers the logical tree this physical tree implements.
    pub fn to_logical(&self) -> LogicalPlan {
        match self {
            PhysicalPlan::EntityScan { entity, columns } => LogicalPlan::EntitySource {
                entity: entity.clone(),
                columns: columns.clone(),
            },
            PhysicalPlan::RangedEntityScan {
                entity, columns, ..
            } => LogicalPlan::EntitySource {
                entity: entity.clone(),
                columns: columns.clone(),
            },
            PhysicalPlan::EntitySample {
                entity,
                columns,
                size,
                seed,
            } => LogicalPlan::Sample {
                entity: entity.clone(),
                columns: columns.clone(),
                size: *size,
                seed: *seed,
            },
            PhysicalPlan::LinearScanFilter { input, predicate } => LogicalPlan::Filter {
                input: Box::new(input.to_logical()),
                predicate: predicate.clone(),
            },
            PhysicalPlan::IndexedFilter {
                entity, predicate, ..
            } => LogicalPlan::Filter {
                input: Box::new(LogicalPlan::EntitySource {
                    entity: entity.clone(),
                    columns: predicate.columns().iter().map(|c| c.to_string()).collect(),
                }),
                predicate: predicate.clone(),
            }, // kind is an access-path detail; the logical filter is the same
            PhysicalPlan::FetchColumns { input, .. } => input.to_logical(),
            PhysicalPlan::KnnFullscan {
                entity,
                predicate,
                prefilter,
                ..
            } => {
                let source = LogicalPlan::EntitySource {
                    entity: entity.clone(),
                    columns: vec![predicate.column.clone()],
                };
                let input = match prefilter {
                    Some(pred) => LogicalPlan::Filter {
                        input: Box::new(source),
                        predicate: pred.clone(),
                    },
                    None => source,
                };
                LogicalPlan::Knn {
                    input: Box::new(input),
                    predicate: predicate.clone(),
                }
            }
            PhysicalPlan::KnnIndexed {
                entity, predicate, ..
            } => LogicalPlan::Knn {
                input: Box::new(LogicalPlan::EntitySource {
                    entity: entity.clone(),
                    columns: vec![predicate.column.clone()],
                }),
                predicate: predicate.clone(),
            },
            PhysicalPlan::SelectProjection { input, columns } => LogicalPlan::Projection {
                input: Box::new(input.to_logical()),
                op: super::logical::ProjectionOp::Select,
                columns: columns.clone(),
            },
            PhysicalPlan::CountProjection { input } => LogicalPlan::Projection {
                input: Box::new(input.to_logical()),
                op: super::logical::ProjectionOp::Count,
                columns: Vec::new(),
            },
            PhysicalPlan::ExistsProjection { input } => LogicalPlan::Projection {
                input: Box::new(input.to_logical()),
                op: super::logical::ProjectionOp::Exists,
                columns: Vec::new(),
            },
            PhysicalPlan::AggregateProjection {
                input,
                function,
                columns,
            } => LogicalPlan::Projection {
                input: Box::new(input.to_logical()),
                op: match function {
                    AggregateFunction::Sum => super::logical::ProjectionOp::Sum,
                    AggregateFunction::Mean => super::logical::ProjectionOp::Mean,
                    AggregateFunction::Min => super::logical::ProjectionOp::Min,
                    AggregateFunction::Max => super::logical::ProjectionOp::Max,
                },
                columns: columns.clone(),
            },
            PhysicalPlan::Limit { input, limit, skip } => LogicalPlan::Limit {
                input: Box::new(input.to_logical()),
                limit: *limit,
                skip: *skip,
            },
        }
    }
}
