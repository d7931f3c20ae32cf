//! # Logical Plans
//!
//! The logical operator tree the binder produces: relational intent
//! without physical access paths. Stage-1 rewrite rules transform trees of
//! this type; stage-2 implementation rules translate them into
//! [`super::physical::PhysicalPlan`]s.

use super::predicate::{hash_boolean_predicate, hash_knn_predicate, BooleanPredicate, KnnPredicate};
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectionOp {
    Select,
    Count,
    Exists,
    Sum,
    Max,
    Min,
    Mean,
}

/// Output column with an optional alias.
pub type ProjectionColumn = (String, Option<String>);

#[derive(Debug, Clone, PartialEq)]
pub enum LogicalPlan {
    /// Full access to an entity, restricted to the named columns.
    EntitySource {
        entity: String,
        columns: Vec<String>,
    },
    /// Seeded random sample of an entity.
    Sample {
        entity: String,
        columns: Vec<String>,
        size: u64,
        seed: u64,
    },
    Filter {
        input: Box<LogicalPlan>,
        predicate: BooleanPredicate,
    },
    Knn {
        input: Box<LogicalPlan>,
        predicate: KnnPredicate,
    },
    Projection {
        input: Box<LogicalPlan>,
        op: ProjectionOp,
        columns: Vec<ProjectionColumn>,
    },
    Limit {
        input: Box<LogicalPlan>,
        limit: u64,
        skip: u64,
    },
}

impl LogicalPlan {
    pub fn entity(&self) -> &str {
        match self {
            LogicalPlan::EntitySource { entity, .. } | LogicalPlan::Sample { entity, .. } => {
                entity
            }
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Knn { input, .. }
            | LogicalPlan::Projection { input, .. }
            | LogicalPlan::Limit { input, .. } => input.entity(),
        }
    }

    /// Deep structural digest; the plan-cache key.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash_into(&mut hasher);
        hasher.finish()
    }

    fn hash_into(&self, h: &mut dyn Hasher) {
        match self {
            LogicalPlan::EntitySource { entity, columns } => {
                h.write_u8(0);
                h.write(entity.as_bytes());
                for c in columns {
                    h.write(c.as_bytes());
                }
            }
            LogicalPlan::Sample {
                entity,
                columns,
                size,
                seed,
            } => {
                h.write_u8(1);
                h.write(entity.as_bytes());
                for c in columns {
                    h.write(c.as_bytes());
                }
                h.write_u64(*size);
                h.write_u64(*seed);
            }
            LogicalPlan::Filter { input, predicate } => {
                h.write_u8(2);
                hash_boolean_predicate(predicate, h);
                input.hash_into(h);
            }
            LogicalPlan::Knn { input, predicate } => {
                h.write_u8(3);
                hash_knn_predicate(predicate, h);
                input.hash_into(h);
            }
            LogicalPlan::Projection { input, op, columns } => {
                h.write_u8(4);
                h.write_u8(*op as u8);
                for (name, alias) in columns {
                    h.write(name.as_bytes());
                    if let Some(alias) = alias {
                        h.write(alias.as_bytes());
                    }
                }
                input.hash_into(h);
            }
            LogicalPlan::Limit { input, limit, skip } => {
                h.write_u8(5);
                h.write_u64(*limit);
                h.write_u64(*skip);
                input.hash_into(h);
            }
        }
    }
}
