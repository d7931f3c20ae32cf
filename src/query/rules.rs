//! # Rewrite Rules
//!
//! Stage 1 (logical → logical) generates equivalent-or-mandated variants
//! of the bound tree: constant folding, predicate pushdown, projection
//! pushdown, LIMIT pushdown through sort-free operators, kNN-before-where
//! for selective kNN, redundant-projection elimination.
//!
//! Stage 2 (logical → physical) replaces every logical node with its
//! candidate implementations: scans become ranged scans when the entity is
//! large enough to partition, filters become indexed filters where an
//! index accepts the predicate, kNN becomes the VA-file scan where one
//! accepts the query. Each alternative is a complete tree; the planner
//! picks the cheapest.

use super::logical::{LogicalPlan, ProjectionOp};
use super::physical::{AggregateFunction, PhysicalPlan};
use super::predicate::{AtomicPredicate, BooleanPredicate, ComparisonOperator};
use crate::catalog::Entity;
use crate::config::{EngineConfig, MIN_PARTITION_ROWS};
use std::sync::Arc;

/// Applies the stage-1 rules, returning the original plus every distinct
/// rewritten variant.
pub fn stage_one(plan: &LogicalPlan, entity: &Arc<Entity>) -> Vec<LogicalPlan> {
    let mut candidates = vec![plan.clone()];

    push_variant(&mut candidates, fold_constants(plan));
    push_variant(&mut candidates, pushdown_predicate(plan));
    push_variant(&mut candidates, pushdown_projection(plan));
    push_variant(&mut candidates, pushdown_limit(plan));
    push_variant(&mut candidates, eliminate_redundant_projection(plan));
    push_variant(&mut candidates, knn_before_where(plan, entity));

    // Rules compose: run the set once more over fresh variants so e.g. a
    // folded predicate still gets its projection pushed down.
    let first_round: Vec<LogicalPlan> = candidates[1..].to_vec();
    for variant in first_round {
        push_variant(&mut candidates, fold_constants(&variant));
        push_variant(&mut candidates, pushdown_predicate(&variant));
        push_variant(&mut candidates, pushdown_projection(&variant));
        push_variant(&mut candidates, pushdown_limit(&variant));
    }
    candidates
}

fn push_variant(candidates: &mut Vec<LogicalPlan>, variant: Option<LogicalPlan>) {
    if let Some(v) = variant {
        if !candidates.contains(&v) {
            candidates.push(v);
        }
    }
}

/// Rewrites one node anywhere in the tree with `f`; `None` when nothing
/// changed.
fn rewrite(plan: &LogicalPlan, f: &dyn Fn(&LogicalPlan) -> Option<LogicalPlan>) -> Option<LogicalPlan> {
    if let Some(rewritten) = f(plan) {
        return Some(rewritten);
    }
    let rebuilt = match plan {
        LogicalPlan::Filter { input, predicate } => LogicalPlan::Filter {
            input: Box::new(rewrite(input, f)?),
            predicate: predicate.clone(),
        },
        LogicalPlan::Knn { input, predicate } => LogicalPlan::Knn {
            input: Box::new(rewrite(input, f)?),
            predicate: predicate.clone(),
        },
        LogicalPlan::Projection { input, op, columns } => LogicalPlan::Projection {
            input: Box::new(rewrite(input, f)?),
            op: *op,
            columns: columns.clone(),
        },
        LogicalPlan::Limit { input, limit, skip } => LogicalPlan::Limit {
            input: Box::new(rewrite(input, f)?),
            limit: *limit,
            skip: *skip,
        },
        _ => return None,
    };
    Some(rebuilt)
}

/// Constant folding over predicates: `≠` becomes negated `=` (so the hash
/// index sees it), `BETWEEN` unfolds into a range conjunction.
fn fold_constants(plan: &LogicalPlan) -> Option<LogicalPlan> {
    rewrite(plan, &|node| match node {
        LogicalPlan::Filter { input, predicate } => {
            let folded = fold_predicate(predicate)?;
            Some(LogicalPlan::Filter {
                input: input.clone(),
                predicate: folded,
            })
        }
        _ => None,
    })
}

fn fold_predicate(predicate: &BooleanPredicate) -> Option<BooleanPredicate> {
    match predicate {
        BooleanPredicate::Atomic(atom) => match atom.op {
            ComparisonOperator::NotEqual => {
                let mut folded = atom.clone();
                folded.op = ComparisonOperator::Equal;
                folded.not = !folded.not;
                Some(BooleanPredicate::Atomic(folded))
            }
            ComparisonOperator::Between if !atom.not && atom.values.len() == 2 => {
                let low = AtomicPredicate::new(
                    atom.column.clone(),
                    ComparisonOperator::GreaterEqual,
                    vec![atom.values[0].clone()],
                );
                let high = AtomicPredicate::new(
                    atom.column.clone(),
                    ComparisonOperator::LessEqual,
                    vec![atom.values[1].clone()],
                );
                Some(BooleanPredicate::and(
                    BooleanPredicate::Atomic(low),
                    BooleanPredicate::Atomic(high),
                ))
            }
            _ => None,
        },
        BooleanPredicate::Compound {
            connector,
            left,
            right,
        } => {
            let fl = fold_predicate(left);
            let fr = fold_predicate(right);
            if fl.is_none() && fr.is_none() {
                return None;
            }
            Some(BooleanPredicate::Compound {
                connector: *connector,
                left: Box::new(fl.unwrap_or_else(|| (**left).clone())),
                right: Box::new(fr.unwrap_or_else(|| (**right).clone())),
            })
        }
    }
}

/// Moves a filter below a projection so it runs closer to the source.
fn pushdown_predicate(plan: &LogicalPlan) -> Option<LogicalPlan> {
    rewrite(plan, &|node| match node {
        LogicalPlan::Filter { input, predicate } => match input.as_ref() {
            LogicalPlan::Projection {
                input: inner,
                op,
                columns,
            } if *op == ProjectionOp::Select => Some(LogicalPlan::Projection {
                input: Box::new(LogicalPlan::Filter {
                    input: inner.clone(),
                    predicate: predicate.clone(),
                }),
                op: *op,
                columns: columns.clone(),
            }),
            _ => None,
        },
        _ => None,
    })
}

/// Restricts the source to the columns the tree above actually touches.
fn pushdown_projection(plan: &LogicalPlan) -> Option<LogicalPlan> {
    let mut required: Vec<String> = Vec::new();
    collect_required_columns(plan, &mut required);
    rewrite(plan, &|node| match node {
        LogicalPlan::EntitySource { entity, columns } => {
            let trimmed: Vec<String> = columns
                .iter()
                .filter(|c| required.contains(c))
                .cloned()
                .collect();
            if trimmed.is_empty() || trimmed.len() == columns.len() {
                return None;
            }
            Some(LogicalPlan::EntitySource {
                entity: entity.clone(),
                columns: trimmed,
            })
        }
        _ => None,
    })
}

fn collect_required_columns(plan: &LogicalPlan, out: &mut Vec<String>) {
    match plan {
        LogicalPlan::EntitySource { .. } | LogicalPlan::Sample { .. } => {}
        LogicalPlan::Filter { input, predicate } => {
            for c in predicate.columns() {
                if !out.iter().any(|o| o == c) {
                    out.push(c.to_string());
                }
            }
            collect_required_columns(input, out);
        }
        LogicalPlan::Knn { input, predicate } => {
            if !out.iter().any(|o| o == &predicate.column) {
                out.push(predicate.column.clone());
            }
            collect_required_columns(input, out);
        }
        LogicalPlan::Projection { input, columns, .. } => {
            for (name, _) in columns {
                if name != "distance" && !out.iter().any(|o| o == name) {
                    out.push(name.clone());
                }
            }
            collect_required_columns(input, out);
        }
        LogicalPlan::Limit { input, .. } => collect_required_columns(input, out),
    }
}

/// LIMIT commutes with a select projection (sort-free); it never crosses a
/// breaker or an aggregate.
fn pushdown_limit(plan: &LogicalPlan) -> Option<LogicalPlan> {
    rewrite(plan, &|node| match node {
        LogicalPlan::Limit { input, limit, skip } => match input.as_ref() {
            LogicalPlan::Projection {
                input: inner,
                op,
                columns,
            } if *op == ProjectionOp::Select => Some(LogicalPlan::Projection {
                input: Box::new(LogicalPlan::Limit {
                    input: inner.clone(),
                    limit: *limit,
                    skip: *skip,
                }),
                op: *op,
                columns: columns.clone(),
            }),
            _ => None,
        },
        _ => None,
    })
}

/// Collapses a select projection whose input is an identical select.
fn eliminate_redundant_projection(plan: &LogicalPlan) -> Option<LogicalPlan> {
    rewrite(plan, &|node| match node {
        LogicalPlan::Projection {
            input,
            op: ProjectionOp::Select,
            columns,
        } => match input.as_ref() {
            LogicalPlan::Projection {
                input: inner,
                op: ProjectionOp::Select,
                columns: inner_columns,
            } if columns == inner_columns => Some(LogicalPlan::Projection {
                input: inner.clone(),
                op: ProjectionOp::Select,
                columns: columns.clone(),
            }),
            _ => None,
        },
        _ => None,
    })
}

/// For a selective kNN (k far below the row count), runs the kNN first and
/// the Boolean predicate over its k results.
fn knn_before_where(plan: &LogicalPlan, entity: &Arc<Entity>) -> Option<LogicalPlan> {
    let rows = entity.statistics().rows;
    rewrite(plan, &|node| match node {
        LogicalPlan::Knn { input, predicate } => match input.as_ref() {
            LogicalPlan::Filter {
                input: inner,
                predicate: boolean,
            } if (predicate.k as u64) * 10 <= rows => Some(LogicalPlan::Filter {
                input: Box::new(LogicalPlan::Knn {
                    input: inner.clone(),
                    predicate: predicate.clone(),
                }),
                predicate: boolean.clone(),
            }),
            _ => None,
        },
        _ => None,
    })
}

/// Applies the stage-2 implementation rules, producing every executable
/// physical alternative for one logical tree.
pub fn stage_two(
    plan: &LogicalPlan,
    entity: &Arc<Entity>,
    config: &EngineConfig,
) -> Vec<PhysicalPlan> {
    match plan {
        LogicalPlan::EntitySource {
            entity: name,
            columns,
        } => {
            let mut out = vec![PhysicalPlan::EntityScan {
                entity: name.clone(),
                columns: columns.clone(),
            }];
            if entity.statistics().rows >= MIN_PARTITION_ROWS && config.io_parallelism > 1 {
                out.push(PhysicalPlan::RangedEntityScan {
                    entity: name.clone(),
                    columns: columns.clone(),
                    partitions: config.io_parallelism,
                });
            }
            out
        }
        LogicalPlan::Sample {
            entity: name,
            columns,
            size,
            seed,
        } => vec![PhysicalPlan::EntitySample {
            entity: name.clone(),
            columns: columns.clone(),
            size: *size,
            seed: *seed,
        }],
        LogicalPlan::Filter { input, predicate } => {
            let mut out: Vec<PhysicalPlan> = stage_two(input, entity, config)
                .into_iter()
                .map(|child| PhysicalPlan::LinearScanFilter {
                    input: Box::new(child),
                    predicate: predicate.clone(),
                })
                .collect();
            // An index replaces the whole source access path, so it only
            // applies when the filter sits directly on the source.
            if let LogicalPlan::EntitySource {
                entity: name,
                columns,
            } = input.as_ref()
            {
                for (def, handle) in entity.index_handles() {
                    if handle.lock().can_process(predicate) {
                        out.push(PhysicalPlan::FetchColumns {
                            input: Box::new(PhysicalPlan::IndexedFilter {
                                entity: name.clone(),
                                index: def.name.clone(),
                                kind: def.kind,
                                predicate: predicate.clone(),
                            }),
                            entity: name.clone(),
                            columns: columns.clone(),
                        });
                    }
                }
            }
            out
        }
        LogicalPlan::Knn { input, predicate } => {
            let mut out = Vec::new();
            let (source_entity, source_columns, prefilter) = match input.as_ref() {
                LogicalPlan::EntitySource {
                    entity: name,
                    columns,
                } => (name.clone(), columns.clone(), None),
                LogicalPlan::Filter {
                    input: inner,
                    predicate: boolean,
                } => match inner.as_ref() {
                    LogicalPlan::EntitySource {
                        entity: name,
                        columns,
                    } => (name.clone(), columns.clone(), Some(boolean.clone())),
                    _ => return Vec::new(),
                },
                _ => return Vec::new(),
            };

            out.push(PhysicalPlan::FetchColumns {
                input: Box::new(PhysicalPlan::KnnFullscan {
                    entity: source_entity.clone(),
                    predicate: predicate.clone(),
                    prefilter: prefilter.clone(),
                    parallelism: config.io_parallelism,
                }),
                entity: source_entity.clone(),
                columns: source_columns.clone(),
            });
            if prefilter.is_none() {
                for (def, handle) in entity.index_handles() {
                    if handle.lock().can_process_knn(predicate) {
                        out.push(PhysicalPlan::FetchColumns {
                            input: Box::new(PhysicalPlan::KnnIndexed {
                                entity: source_entity.clone(),
                                index: def.name.clone(),
                                predicate: predicate.clone(),
                            }),
                            entity: source_entity.clone(),
                            columns: source_columns.clone(),
                        });
                    }
                }
            }
            out
        }
        LogicalPlan::Projection { input, op, columns } => stage_two(input, entity, config)
            .into_iter()
            .map(|child| {
                let input = Box::new(child);
                match op {
                    ProjectionOp::Select => PhysicalPlan::SelectProjection {
                        input,
                        columns: columns.clone(),
                    },
                    ProjectionOp::Count => PhysicalPlan::CountProjection { input },
                    ProjectionOp::Exists => PhysicalPlan::ExistsProjection { input },
                    ProjectionOp::Sum => PhysicalPlan::AggregateProjection {
                        input,
                        function: AggregateFunction::Sum,
                        columns: columns.clone(),
                    },
                    ProjectionOp::Mean => PhysicalPlan::AggregateProjection {
                        input,
                        function: AggregateFunction::Mean,
                        columns: columns.clone(),
                    },
                    ProjectionOp::Min => PhysicalPlan::AggregateProjection {
                        input,
                        function: AggregateFunction::Min,
                        columns: columns.clone(),
                    },
                    ProjectionOp::Max => PhysicalPlan::AggregateProjection {
                        input,
                        function: AggregateFunction::Max,
                        columns: columns.clone(),
                    },
                }
            })
            .collect(),
        LogicalPlan::Limit { input, limit, skip } => stage_two(input, entity, config)
            .into_iter()
            .map(|child| PhysicalPlan::Limit {
                input: Box::new(child),
                limit: *limit,
                skip: *skip,
            })
            .collect(),
    }
}
