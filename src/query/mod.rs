//! # Query Model & Planner
//!
//! The declarative [`Query`] object a client hands the engine, the binder
//! that attaches catalogue objects and produces a [`LogicalPlan`], and the
//! two-stage rule-based planner that turns it into the cheapest
//! [`PhysicalPlan`].

pub mod cost;
pub mod logical;
pub mod physical;
pub mod planner;
pub mod predicate;
pub mod rules;

pub use cost::Cost;
pub use logical::{LogicalPlan, ProjectionColumn, ProjectionOp};
pub use physical::{AggregateFunction, PhysicalPlan};
pub use planner::Planner;
pub use predicate::{
    AtomicPredicate, BooleanPredicate, ComparisonOperator, Connector, KnnPredicate,
};

use crate::catalog::{Catalogue, Entity};
use crate::error::DbError;
use crate::types::Type;
use eyre::{ensure, Result};
use std::sync::Arc;

/// Name of the implicit distance column kNN queries produce.
pub const DISTANCE_COLUMN: &str = "distance";

/// Name of the implicit score column text-index filters produce.
pub const SCORE_COLUMN: &str = "score";

#[derive(Debug, Clone, PartialEq)]
pub enum QuerySource {
    Entity {
        schema: String,
        entity: String,
    },
    /// Seeded random sample of an entity.
    Sample {
        schema: String,
        entity: String,
        size: u64,
        seed: u64,
    },
}

impl QuerySource {
    pub fn entity(schema: impl Into<String>, entity: impl Into<String>) -> Self {
        QuerySource::Entity {
            schema: schema.into(),
            entity: entity.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub op: ProjectionOp,
    pub columns: Vec<ProjectionColumn>,
}

impl Projection {
    pub fn select(columns: &[&str]) -> Self {
        Self {
            op: ProjectionOp::Select,
            columns: columns.iter().map(|c| (c.to_string(), None)).collect(),
        }
    }

    pub fn count() -> Self {
        Self {
            op: ProjectionOp::Count,
            columns: Vec::new(),
        }
    }

    pub fn exists() -> Self {
        Self {
            op: ProjectionOp::Exists,
            columns: Vec::new(),
        }
    }

    pub fn aggregate(op: ProjectionOp, column: &str) -> Self {
        Self {
            op,
            columns: vec![(column.to_string(), None)],
        }
    }
}

/// The wire-level query object, already parsed by the outer surface.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub from: QuerySource,
    pub filter: Option<BooleanPredicate>,
    pub knn: Option<KnnPredicate>,
    pub projection: Option<Projection>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
}

impl Query {
    pub fn from(source: QuerySource) -> Self {
        Self {
            from: source,
            filter: None,
            knn: None,
            projection: None,
            limit: None,
            skip: None,
        }
    }

    pub fn filtered(mut self, predicate: BooleanPredicate) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn knn(mut self, predicate: KnnPredicate) -> Self {
        self.knn = Some(predicate);
        self
    }

    pub fn project(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// Resolves the query against the catalogue and produces the logical tree.
/// Binder errors never mutate catalogue state.
pub fn bind(query: &Query, catalogue: &Arc<Catalogue>) -> Result<(LogicalPlan, Arc<Entity>)> {
    let (schema_name, entity_name) = match &query.from {
        QuerySource::Entity { schema, entity } | QuerySource::Sample { schema, entity, .. } => {
            (schema.as_str(), entity.as_str())
        }
    };
    let schema = catalogue.schema(schema_name)?;
    let entity = schema.entity(entity_name)?;
    let all_columns: Vec<String> = entity
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let mut plan = match &query.from {
        QuerySource::Entity { .. } => LogicalPlan::EntitySource {
            entity: entity.fqname().to_string(),
            columns: all_columns.clone(),
        },
        QuerySource::Sample { size, seed, .. } => {
            ensure!(
                *size > 0,
                DbError::QueryBind(format!("sample of {} must be non-empty", entity.fqname()))
            );
            LogicalPlan::Sample {
                entity: entity.fqname().to_string(),
                columns: all_columns.clone(),
                size: *size,
                seed: *seed,
            }
        }
    };

    if let Some(filter) = &query.filter {
        let referenced: Vec<String> = filter.columns().iter().map(|c| c.to_string()).collect();
        crate::catalog::require_columns(&entity, &referenced)?;
        plan = LogicalPlan::Filter {
            input: Box::new(plan),
            predicate: filter.clone(),
        };
    }

    if let Some(knn) = &query.knn {
        knn.validate()?;
        let handle = entity.column(&knn.column)?;
        match handle.def().ty {
            Type::FloatVector(dim) => {
                ensure!(
                    dim as usize == knn.dimension(),
                    DbError::QueryBind(format!(
                        "kNN on {}.{} expects dimension {}, query has {}",
                        entity.fqname(),
                        knn.column,
                        dim,
                        knn.dimension()
                    ))
                );
            }
            other => {
                return Err(DbError::QueryBind(format!(
                    "kNN on {}.{} requires a float vector column, found {}",
                    entity.fqname(),
                    knn.column,
                    other.name()
                ))
                .into());
            }
        }
        plan = LogicalPlan::Knn {
            input: Box::new(plan),
            predicate: knn.clone(),
        };
    }

    let projection = match &query.projection {
        Some(p) => p.clone(),
        None => Projection {
            op: ProjectionOp::Select,
            columns: all_columns.iter().map(|c| (c.clone(), None)).collect(),
        },
    };
    let mut columns = projection.columns.clone();
    match projection.op {
        ProjectionOp::Select => {
            for (name, _) in &columns {
                if name != DISTANCE_COLUMN && name != SCORE_COLUMN {
                    crate::catalog::require_columns(&entity, &[name.clone()])?;
                }
            }
            // A kNN query implicitly exposes its distance column.
            if query.knn.is_some() && !columns.iter().any(|(n, _)| n == DISTANCE_COLUMN) {
                columns.push((DISTANCE_COLUMN.to_string(), None));
            }
        }
        ProjectionOp::Sum | ProjectionOp::Mean | ProjectionOp::Min | ProjectionOp::Max => {
            ensure!(
                columns.len() == 1,
                DbError::QueryBind(format!(
                    "{:?} projection over {} requires exactly one column",
                    projection.op,
                    entity.fqname()
                ))
            );
            crate::catalog::require_columns(&entity, &[columns[0].0.clone()])?;
            let ty = entity.column(&columns[0].0)?.def().ty;
            ensure!(
                ty.is_numeric(),
                DbError::QueryBind(format!(
                    "{:?} projection requires a numeric column, {}.{} is {}",
                    projection.op,
                    entity.fqname(),
                    columns[0].0,
                    ty.name()
                ))
            );
        }
        ProjectionOp::Count | ProjectionOp::Exists => {}
    }
    plan = LogicalPlan::Projection {
        input: Box::new(plan),
        op: projection.op,
        columns,
    };

    if query.limit.is_some() || query.skip.is_some() {
        plan = LogicalPlan::Limit {
            input: Box::new(plan),
            limit: query.limit.unwrap_or(u64::MAX),
            skip: query.skip.unwrap_or(0),
        };
    }

    Ok((plan, entity))
}
