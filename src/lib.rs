//! # HareDB - Columnar Storage for Boolean + kNN Queries
//!
//! HareDB is a single-node, column-oriented database engine specialized
//! for mixed Boolean and k-nearest-neighbor queries over high-dimensional
//! vectors. A caller hands the engine a declarative [`Query`] and a
//! transaction handle; the engine binds, plans, optimizes and executes it
//! against paged columnar storage and returns a lazy record stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Public API (Engine)           │
//! ├─────────────────────────────────────────┤
//! │  Binder │ Planner (2-stage, plan cache)  │
//! ├─────────────────────────────────────────┤
//! │    Execution operators (pull, kNN)       │
//! ├─────────────────────────────────────────┤
//! │ Catalogue │ Schema │ Entity │ Txn + Locks│
//! ├─────────────────────────────────────────┤
//! │  Indexes (hash / text / VA-file)         │
//! ├─────────────────────────────────────────┤
//! │   Column files (fixed / variable)        │
//! ├─────────────────────────────────────────┤
//! │   Buffer pool (pluggable eviction)       │
//! ├─────────────────────────────────────────┤
//! │   Disk manager (direct / WAL) + pages    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use haredb::{ColumnDef, Engine, EngineConfig, Type, TxMode, Value};
//!
//! let engine = Engine::open("./warren-db", EngineConfig::default())?;
//!
//! let tx = engine.begin(TxMode::ReadWrite);
//! let catalogue_tx = engine.catalogue().begin_tx(&tx)?;
//! let schema = catalogue_tx.create_schema("warren")?;
//! let schema_tx = schema.begin_tx(&tx)?;
//! schema_tx.create_entity(
//!     "test",
//!     &[
//!         ColumnDef::new("id", Type::String),
//!         ColumnDef::new("feature", Type::FloatVector(128)),
//!     ],
//! )?;
//! schema_tx.commit()?;
//! catalogue_tx.commit()?;
//! tx.commit()?;
//! ```
//!
//! ## File Layout
//!
//! ```text
//! database_dir/
//! ├── catalogue.db          # schema registry
//! └── warren/               # one directory per schema
//!     ├── index.db          # entity registry
//!     └── test/             # one directory per entity
//!         ├── index.db      # columns, indexes, statistics
//!         ├── id.col        # one page file per column
//!         ├── feature.col
//!         └── feature_idx/  # one directory per index
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: pages, disk managers (direct/WAL), buffer pool, column files
//! - [`catalog`]: catalogue → schema → entity → column hierarchy
//! - [`txn`]: transaction contexts, status machine, logical lock manager
//! - [`index`]: unique-hash, inverted-text and VA-file indexes
//! - [`math`]: SIMD distance kernels and the bounded top-k heap
//! - [`query`]: predicates, logical/physical plans, two-stage planner
//! - [`exec`]: pull operators, from scans to the parallel kNN fullscan

#[macro_use]
mod macros;

pub mod catalog;
pub mod config;
pub mod encoding;
pub mod error;
pub mod exec;
pub mod index;
pub mod math;
pub mod query;
pub mod storage;
pub mod txn;
pub mod types;

pub use catalog::{Catalogue, ColumnDef, Entity, EntityTx, Schema};
pub use config::EngineConfig;
pub use error::DbError;
pub use exec::{Operator, Record};
pub use math::Distance;
pub use query::{
    AtomicPredicate, BooleanPredicate, ComparisonOperator, Connector, KnnPredicate, Projection,
    ProjectionOp, Query, QuerySource,
};
pub use txn::{TransactionContext, TxMode, TxStatus};
pub use types::{Type, Value};

use crate::catalog::EntityTx as CatalogEntityTx;
use crate::exec::dml;
use crate::query::physical::PhysicalPlan;
use crate::query::Planner;
use crate::txn::{LockManager, TransactionManager};
use eyre::Result;
use std::path::Path;
use std::sync::Arc;

/// Engine handle: owns the catalogue, the process-wide lock manager and
/// transaction manager, and the plan cache. Never a global; callers pass
/// it explicitly.
pub struct Engine {
    config: EngineConfig,
    locks: Arc<LockManager>,
    txns: TransactionManager,
    catalogue: Arc<Catalogue>,
    planner: Planner,
}

impl Engine {
    /// Opens (or initializes) a database rooted at `root`.
    pub fn open(root: impl AsRef<Path>, config: EngineConfig) -> Result<Engine> {
        let locks = Arc::new(LockManager::new());
        let txns = TransactionManager::with_timeout(Arc::clone(&locks), config.lock_timeout);
        let catalogue = Catalogue::open(root.as_ref(), &config)?;
        let planner = Planner::new(config.clone());
        Ok(Engine {
            config,
            locks,
            txns,
            catalogue,
            planner,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn begin(&self, mode: TxMode) -> Arc<TransactionContext> {
        self.txns.begin(mode)
    }

    /// Binds, plans and executes a query, returning a lazy record stream.
    pub fn query(
        &self,
        ctx: &Arc<TransactionContext>,
        query: &Query,
    ) -> Result<RecordStream> {
        self.query_with_options(ctx, query, false)
    }

    /// As [`Engine::query`], with an optional plan-cache bypass.
    pub fn query_with_options(
        &self,
        ctx: &Arc<TransactionContext>,
        query: &Query,
        bypass_plan_cache: bool,
    ) -> Result<RecordStream> {
        let (plan, tx) = self.prepare(ctx, query, bypass_plan_cache)?;
        let op = exec::build(&plan, &tx, &self.config)?;
        Ok(RecordStream { op, tx })
    }

    /// Plans a query without executing it; exposed so callers can inspect
    /// cache behavior and selected plans.
    pub fn plan(
        &self,
        query: &Query,
        bypass_plan_cache: bool,
    ) -> Result<Arc<PhysicalPlan>> {
        let (logical, entity) = query::bind(query, &self.catalogue)?;
        self.planner
            .plan_and_select(&logical, &entity, bypass_plan_cache)
    }

    fn prepare(
        &self,
        ctx: &Arc<TransactionContext>,
        query: &Query,
        bypass_plan_cache: bool,
    ) -> Result<(Arc<PhysicalPlan>, Arc<CatalogEntityTx>)> {
        let (logical, entity) = query::bind(query, &self.catalogue)?;
        let plan = self
            .planner
            .plan_and_select(&logical, &entity, bypass_plan_cache)?;
        let tx = Arc::new(entity.begin_tx(ctx)?);
        Ok((plan, tx))
    }

    fn entity_tx(
        &self,
        ctx: &Arc<TransactionContext>,
        schema: &str,
        entity: &str,
    ) -> Result<Arc<CatalogEntityTx>> {
        let entity = self.catalogue.schema(schema)?.entity(entity)?;
        Ok(Arc::new(entity.begin_tx(ctx)?))
    }

    /// Inserts rows through the Insert operator; returns the count and the
    /// entity transaction (the caller commits it with the context).
    pub fn insert(
        &self,
        ctx: &Arc<TransactionContext>,
        schema: &str,
        entity: &str,
        rows: Vec<Vec<(String, Value)>>,
    ) -> Result<(u64, Arc<CatalogEntityTx>)> {
        let tx = self.entity_tx(ctx, schema, entity)?;
        let mut op = dml::Insert::new(Arc::clone(&tx), rows);
        let count = run_dml(&mut op, &tx, ctx)?;
        Ok((count, tx))
    }

    /// Deletes every tuple matching the predicate.
    pub fn delete_where(
        &self,
        ctx: &Arc<TransactionContext>,
        schema: &str,
        entity: &str,
        predicate: BooleanPredicate,
    ) -> Result<(u64, Arc<CatalogEntityTx>)> {
        let tx = self.entity_tx(ctx, schema, entity)?;
        let columns: Vec<String> = predicate.columns().iter().map(|c| c.to_string()).collect();
        let scan = exec::scan::EntityScan::new(Arc::clone(&tx), columns, None)?;
        let filtered = exec::filter::LinearScanFilter::new(Box::new(scan), predicate);
        let mut op = dml::Delete::new(Arc::clone(&tx), Box::new(filtered));
        let count = run_dml(&mut op, &tx, ctx)?;
        Ok((count, tx))
    }

    /// Updates every tuple matching the predicate with the assignments.
    pub fn update_where(
        &self,
        ctx: &Arc<TransactionContext>,
        schema: &str,
        entity: &str,
        predicate: BooleanPredicate,
        values: Vec<(String, Option<Value>)>,
    ) -> Result<(u64, Arc<CatalogEntityTx>)> {
        let tx = self.entity_tx(ctx, schema, entity)?;
        let columns: Vec<String> = predicate.columns().iter().map(|c| c.to_string()).collect();
        let scan = exec::scan::EntityScan::new(Arc::clone(&tx), columns, None)?;
        let filtered = exec::filter::LinearScanFilter::new(Box::new(scan), predicate);
        let mut op = dml::Update::new(Arc::clone(&tx), Box::new(filtered), values);
        let count = run_dml(&mut op, &tx, ctx)?;
        Ok((count, tx))
    }

    /// Rebuilds an entity's indexes and refreshes its statistics. A broken
    /// index raises; it stays dirty and out of query plans.
    pub fn optimize(
        &self,
        ctx: &Arc<TransactionContext>,
        schema: &str,
        entity: &str,
    ) -> Result<(u64, Arc<CatalogEntityTx>)> {
        let tx = self.entity_tx(ctx, schema, entity)?;
        let mut op = dml::OptimizeEntity::new(Arc::clone(&tx));
        let count = run_dml(&mut op, &tx, ctx)?;
        Ok((count, tx))
    }

    /// Closes the catalogue; every schema and entity must be free of live
    /// transactions.
    pub fn close(self) -> Result<()> {
        self.catalogue.close()
    }
}

/// Drains a writing operator. A failure rolls the entity work and the
/// transaction back before the error propagates, so a failing statement
/// never leaves partial writes behind.
fn run_dml(
    op: &mut dyn Operator,
    tx: &Arc<CatalogEntityTx>,
    ctx: &Arc<TransactionContext>,
) -> Result<u64> {
    let mut drain = || -> Result<u64> {
        let mut count = 0u64;
        while let Some(record) = op.next()? {
            if let Some(Some(Value::Long(n))) = record.values().first() {
                count = *n as u64;
            }
        }
        Ok(count)
    };
    match drain() {
        Ok(count) => Ok(count),
        Err(e) => {
            let _ = tx.rollback();
            let _ = ctx.rollback();
            Err(e)
        }
    }
}

/// Lazy result stream over an executed query. Dropping it releases the
/// entity transaction's close-lock hold.
pub struct RecordStream {
    op: Box<dyn Operator>,
    tx: Arc<CatalogEntityTx>,
}

impl RecordStream {
    pub fn columns(&self) -> Arc<Vec<String>> {
        self.op.columns()
    }

    pub fn entity_tx(&self) -> &Arc<CatalogEntityTx> {
        &self.tx
    }
}

impl Iterator for RecordStream {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.op.next().transpose()
    }
}
