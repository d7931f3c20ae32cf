//! # Entities
//!
//! An entity is an ordered set of columns sharing one tuple-id space, plus
//! its secondary indexes and statistics. The entity directory holds an
//! `index.db` catalog (columns, indexes, statistics), one page file per
//! column and one subdirectory per index.
//!
//! [`EntityTx`] is the transactional view: reads take a shared logical
//! lock on the entity, writes an exclusive one, both held until the
//! enclosing transaction resolves. Every write emits a [`DataChangeEvent`]
//! that is dispatched to each incrementally-updatable index immediately,
//! so uniqueness violations surface at the offending statement and a
//! transaction observes its own pending writes through the indexes as
//! well as the column files.

use super::{run_actions, Action, CloseLock, CloseLockGuard, ColumnDef, ColumnHandle};
use crate::config::EngineConfig;
use crate::encoding::{Decoder, Encoder};
use crate::error::DbError;
use crate::index::{DataChangeEvent, Index, IndexKind};
use crate::storage::column::ColumnFile;
use crate::storage::TupleId;
use crate::txn::{LockMode, TransactionContext};
use crate::types::{Type, Value};
use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CATALOG_FILE: &str = "index.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub kind: IndexKind,
    pub column: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityStatistics {
    /// Live (non-deleted) tuples.
    pub rows: u64,
    /// First unassigned tuple id.
    pub max_tuple_id: u64,
    /// Null cells per column.
    pub null_counts: Vec<(String, u64)>,
}

impl EntityStatistics {
    pub fn null_count(&self, column: &str) -> u64 {
        self.null_counts
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

pub struct Entity {
    name: String,
    fqname: String,
    path: PathBuf,
    config: EngineConfig,
    columns: Vec<Arc<ColumnHandle>>,
    indexes: RwLock<Vec<(IndexDef, Arc<Mutex<Index>>)>>,
    statistics: RwLock<EntityStatistics>,
    close_lock: Arc<CloseLock>,
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity").field("fqname", &self.fqname).finish()
    }
}

impl Entity {
    /// Creates the entity directory, its column files and catalog.
    pub fn create(
        schema_name: &str,
        name: &str,
        path: &Path,
        defs: &[ColumnDef],
        config: &EngineConfig,
    ) -> Result<Arc<Entity>> {
        ensure!(!defs.is_empty(), "entity {} needs at least one column", name);
        let mut seen = HashMap::new();
        for def in defs {
            if seen.insert(def.name.clone(), ()).is_some() {
                return Err(DbError::DuplicateColumn(format!(
                    "{}.{}.{}",
                    schema_name, name, def.name
                ))
                .into());
            }
        }

        std::fs::create_dir_all(path)
            .wrap_err_with(|| format!("failed to create entity directory {}", path.display()))?;
        let mut columns = Vec::with_capacity(defs.len());
        for def in defs {
            let file_path = path.join(def.file_name());
            let file = ColumnFile::create(&file_path, def.ty, def.nullable, config)?;
            columns.push(Arc::new(ColumnHandle::new(def.clone(), file_path, file)));
        }

        let entity = Arc::new(Entity {
            name: name.to_string(),
            fqname: format!("{}.{}", schema_name, name),
            path: path.to_path_buf(),
            config: config.clone(),
            columns,
            indexes: RwLock::new(Vec::new()),
            statistics: RwLock::new(EntityStatistics::default()),
            close_lock: CloseLock::new(),
        });
        entity.persist_catalog()?;
        Ok(entity)
    }

    pub fn open(
        schema_name: &str,
        name: &str,
        path: &Path,
        config: &EngineConfig,
    ) -> Result<Arc<Entity>> {
        let catalog_path = path.join(CATALOG_FILE);
        let bytes = std::fs::read(&catalog_path).wrap_err_with(|| {
            format!("failed to read entity catalog {}", catalog_path.display())
        })?;
        let mut dec = Decoder::new(&bytes);

        let column_count = dec.u64()? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let col_name = dec.string()?;
            let ordinal = dec.u64()? as u32;
            let logical = dec.u64()? as u32;
            let nullable = dec.u8()? != 0;
            let file_name = dec.string()?;
            let ty = Type::from_ordinal(ordinal, logical)?;
            let file_path = path.join(&file_name);
            let file = ColumnFile::open(&file_path, config)?;
            ensure!(
                file.column_type() == ty && file.nullable() == nullable,
                "column file {} disagrees with the entity catalog",
                file_path.display()
            );
            let mut def = ColumnDef::new(col_name, ty);
            if nullable {
                def = def.nullable();
            }
            columns.push(Arc::new(ColumnHandle::new(def, file_path, file)));
        }

        let fqname = format!("{}.{}", schema_name, name);
        let index_count = dec.u64()? as usize;
        let mut indexes = Vec::with_capacity(index_count);
        for _ in 0..index_count {
            let idx_name = dec.string()?;
            let kind = IndexKind::from_name(&dec.string()?)?;
            let column = dec.string()?;
            let dir = path.join(&idx_name);
            let index = Index::open(kind, &format!("{}.{}", fqname, idx_name), &column, &dir)?;
            indexes.push((
                IndexDef {
                    name: idx_name,
                    kind,
                    column,
                },
                Arc::new(Mutex::new(index)),
            ));
        }

        let rows = dec.u64()?;
        let max_tuple_id = dec.u64()?;
        let null_count = dec.u64()? as usize;
        let mut null_counts = Vec::with_capacity(null_count);
        for _ in 0..null_count {
            let col = dec.string()?;
            let nulls = dec.u64()?;
            null_counts.push((col, nulls));
        }

        Ok(Arc::new(Entity {
            name: name.to_string(),
            fqname,
            path: path.to_path_buf(),
            config: config.clone(),
            columns,
            indexes: RwLock::new(indexes),
            statistics: RwLock::new(EntityStatistics {
                rows,
                max_tuple_id,
                null_counts,
            }),
            close_lock: CloseLock::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fqname(&self) -> &str {
        &self.fqname
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close_lock(&self) -> &Arc<CloseLock> {
        &self.close_lock
    }

    pub fn columns(&self) -> &[Arc<ColumnHandle>] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Result<Arc<ColumnHandle>> {
        self.columns
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| DbError::ColumnDoesNotExist(format!("{}.{}", self.fqname, name)).into())
    }

    pub fn index_defs(&self) -> Vec<IndexDef> {
        self.indexes.read().iter().map(|(d, _)| d.clone()).collect()
    }

    pub fn index(&self, name: &str) -> Result<Arc<Mutex<Index>>> {
        self.indexes
            .read()
            .iter()
            .find(|(d, _)| d.name == name)
            .map(|(_, i)| Arc::clone(i))
            .ok_or_else(|| DbError::IndexDoesNotExist(format!("{}.{}", self.fqname, name)).into())
    }

    pub fn index_handles(&self) -> Vec<(IndexDef, Arc<Mutex<Index>>)> {
        self.indexes
            .read()
            .iter()
            .map(|(d, i)| (d.clone(), Arc::clone(i)))
            .collect()
    }

    pub fn statistics(&self) -> EntityStatistics {
        self.statistics.read().clone()
    }

    /// Live tuples, counted from the first column (all columns share the
    /// tuple-id space).
    pub fn live_count(&self) -> u64 {
        self.columns[0].file().read().meta().live()
    }

    pub fn max_tuple_id(&self) -> u64 {
        self.columns[0].file().read().meta().max_tuple_id
    }

    pub fn is_deleted(&self, tid: TupleId) -> Result<bool> {
        self.columns[0].file().read().is_deleted(tid)
    }

    pub fn read_value(&self, column: &str, tid: TupleId) -> Result<Option<Value>> {
        self.column(column)?.file().read().read(tid)
    }

    /// The keyed column of every live tuple, for index rebuilds.
    pub fn column_snapshot(&self, column: &str) -> Result<Vec<(TupleId, Option<Value>)>> {
        let handle = self.column(column)?;
        let guard = handle.file().read();
        let mut rows = Vec::new();
        let mut cursor = guard.cursor(None);
        while let Some(tid) = cursor.next()? {
            rows.push((tid, guard.read(tid)?));
        }
        Ok(rows)
    }

    /// Flushes column counters and statistics into the entity catalog.
    pub(crate) fn persist_catalog(&self) -> Result<()> {
        let mut enc = Encoder::new();
        enc.u64(self.columns.len() as u64);
        for handle in &self.columns {
            let def = handle.def();
            enc.string(&def.name);
            enc.u64(def.ty.ordinal() as u64);
            enc.u64(def.ty.logical_size() as u64);
            enc.u8(def.nullable as u8);
            enc.string(&def.file_name());
        }
        let indexes = self.indexes.read();
        enc.u64(indexes.len() as u64);
        for (def, _) in indexes.iter() {
            enc.string(&def.name);
            enc.string(def.kind.name());
            enc.string(&def.column);
        }
        drop(indexes);
        let stats = self.statistics.read();
        enc.u64(stats.rows);
        enc.u64(stats.max_tuple_id);
        enc.u64(stats.null_counts.len() as u64);
        for (col, nulls) in &stats.null_counts {
            enc.string(col);
            enc.u64(*nulls);
        }
        drop(stats);

        let catalog_path = self.path.join(CATALOG_FILE);
        let tmp = self.path.join("index.db.tmp");
        std::fs::write(&tmp, enc.finish())?;
        std::fs::rename(&tmp, &catalog_path)
            .wrap_err_with(|| format!("failed to install {}", catalog_path.display()))
    }

    /// Closes every column file and index; requires no live transactions.
    pub fn close(&self) -> Result<()> {
        self.close_lock.close(&self.fqname)?;
        for handle in &self.columns {
            handle.close()?;
        }
        Ok(())
    }

    pub fn begin_tx(self: &Arc<Self>, ctx: &Arc<TransactionContext>) -> Result<EntityTx> {
        let close_guard = self.close_lock.acquire(ctx.id(), &self.fqname)?;
        Ok(EntityTx {
            entity: Arc::clone(self),
            ctx: Arc::clone(ctx),
            _close: close_guard,
            post_commit: Mutex::new(Vec::new()),
            post_rollback: Mutex::new(Vec::new()),
            null_deltas: Mutex::new(HashMap::new()),
        })
    }
}

pub struct EntityTx {
    entity: Arc<Entity>,
    ctx: Arc<TransactionContext>,
    _close: CloseLockGuard,
    post_commit: Mutex<Vec<Action>>,
    post_rollback: Mutex<Vec<Action>>,
    null_deltas: Mutex<HashMap<String, i64>>,
}

impl EntityTx {
    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    pub fn ctx(&self) -> &Arc<TransactionContext> {
        &self.ctx
    }

    pub fn on_commit(&self, action: Action) {
        self.post_commit.lock().push(action);
    }

    pub fn on_rollback(&self, action: Action) {
        self.post_rollback.lock().push(action);
    }

    fn ensure_readable(&self) -> Result<()> {
        self.ctx.begin_read()?;
        self.ctx
            .request_lock(self.entity.fqname(), LockMode::Shared)
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ctx.begin_write()?;
        self.ctx
            .request_lock(self.entity.fqname(), LockMode::Exclusive)
            .map_err(|e| match e.downcast_ref::<DbError>() {
                Some(DbError::Timeout(_)) => DbError::TransactionWriteLockFailed(
                    self.ctx.id(),
                    self.entity.fqname().to_string(),
                )
                .into(),
                _ => e,
            })
    }

    pub fn list_columns(&self) -> Result<Vec<ColumnDef>> {
        self.ensure_readable()?;
        Ok(self
            .entity
            .columns()
            .iter()
            .map(|c| c.def().clone())
            .collect())
    }

    pub fn column_for_name(&self, name: &str) -> Result<Arc<ColumnHandle>> {
        self.ensure_readable()?;
        self.entity.column(name)
    }

    pub fn list_indexes(&self) -> Result<Vec<IndexDef>> {
        self.ensure_readable()?;
        Ok(self.entity.index_defs())
    }

    pub fn index_for_name(&self, name: &str) -> Result<Arc<Mutex<Index>>> {
        self.ensure_readable()?;
        self.entity.index(name)
    }

    pub fn count(&self) -> Result<u64> {
        self.ensure_readable()?;
        Ok(self.entity.live_count())
    }

    pub fn max_tuple_id(&self) -> Result<u64> {
        self.ensure_readable()?;
        Ok(self.entity.max_tuple_id())
    }

    pub fn statistics(&self) -> Result<EntityStatistics> {
        self.ensure_readable()?;
        let mut stats = self.entity.statistics();
        stats.rows = self.entity.live_count();
        stats.max_tuple_id = self.entity.max_tuple_id();
        Ok(stats)
    }

    pub fn is_deleted(&self, tid: TupleId) -> Result<bool> {
        self.ensure_readable()?;
        self.entity.is_deleted(tid)
    }

    pub fn read_value(&self, column: &str, tid: TupleId) -> Result<Option<Value>> {
        self.ensure_readable()?;
        self.entity.read_value(column, tid)
    }

    /// Reads the named columns of a tuple; `None` when it is deleted.
    pub fn read_row(
        &self,
        tid: TupleId,
        columns: &[String],
    ) -> Result<Option<Vec<Option<Value>>>> {
        self.ensure_readable()?;
        if self.entity.is_deleted(tid)? {
            return Ok(None);
        }
        let mut row = Vec::with_capacity(columns.len());
        for column in columns {
            row.push(self.entity.read_value(column, tid)?);
        }
        Ok(Some(row))
    }

    /// Inserts a row given as `(column, value)` pairs; omitted nullable
    /// columns become null. Returns the fresh tuple id.
    pub fn insert(&self, values: &[(&str, Value)]) -> Result<TupleId> {
        self.ensure_writable()?;
        for (name, _) in values {
            self.entity.column(name)?;
        }

        let tid = self.entity.max_tuple_id();
        let mut row: Vec<(String, Option<Value>)> = Vec::with_capacity(self.entity.columns().len());
        for handle in self.entity.columns() {
            let def = handle.def();
            let provided = values
                .iter()
                .find(|(n, _)| *n == def.name)
                .map(|(_, v)| v.clone());
            match &provided {
                Some(v) if v.type_of() != def.ty => {
                    return Err(DbError::TxValidation(
                        format!("{}.{}", self.entity.fqname(), def.name),
                        format!(
                            "expected {}, got {}",
                            def.ty.name(),
                            v.type_of().name()
                        ),
                    )
                    .into());
                }
                None if !def.nullable => {
                    return Err(DbError::TxValidation(
                        format!("{}.{}", self.entity.fqname(), def.name),
                        "column is not nullable".into(),
                    )
                    .into());
                }
                _ => {}
            }
            row.push((def.name.clone(), provided));
        }

        for (handle, (_, value)) in self.entity.columns().iter().zip(row.iter()) {
            if value.is_none() {
                *self
                    .null_deltas
                    .lock()
                    .entry(handle.name().to_string())
                    .or_default() += 1;
            }
            if let Err(e) = handle.file().write().append(tid, value.as_ref()) {
                self.ctx.fail();
                return Err(e);
            }
        }

        self.dispatch(DataChangeEvent::Insert { tid, values: row })?;
        Ok(tid)
    }

    /// Updates the given columns of a live tuple in place.
    pub fn update(&self, tid: TupleId, values: &[(&str, Option<Value>)]) -> Result<()> {
        self.ensure_writable()?;
        ensure!(
            !self.entity.is_deleted(tid)?,
            "cannot update deleted tuple {} of {}",
            tid,
            self.entity.fqname()
        );

        let mut old = Vec::with_capacity(values.len());
        let mut new = Vec::with_capacity(values.len());
        for (name, value) in values {
            let handle = self.entity.column(name)?;
            let def = handle.def();
            if let Some(v) = value {
                if v.type_of() != def.ty {
                    return Err(DbError::TxValidation(
                        format!("{}.{}", self.entity.fqname(), def.name),
                        format!("expected {}, got {}", def.ty.name(), v.type_of().name()),
                    )
                    .into());
                }
            } else if !def.nullable {
                return Err(DbError::TxValidation(
                    format!("{}.{}", self.entity.fqname(), def.name),
                    "column is not nullable".into(),
                )
                .into());
            }
            let previous = handle.file().read().read(tid)?;
            match (&previous, value) {
                (Some(_), None) => {
                    *self.null_deltas.lock().entry(def.name.clone()).or_default() += 1
                }
                (None, Some(_)) => {
                    *self.null_deltas.lock().entry(def.name.clone()).or_default() -= 1
                }
                _ => {}
            }
            old.push((def.name.clone(), previous));
            new.push((def.name.clone(), value.clone()));
            let update_result = handle.file().write().update(tid, value.as_ref());
            if let Err(e) = update_result {
                self.ctx.fail();
                return Err(e);
            }
        }

        self.dispatch(DataChangeEvent::Update { tid, old, new })?;
        Ok(())
    }

    /// Logically deletes a tuple in every column.
    pub fn delete(&self, tid: TupleId) -> Result<()> {
        self.ensure_writable()?;
        ensure!(
            !self.entity.is_deleted(tid)?,
            "tuple {} of {} is already deleted",
            tid,
            self.entity.fqname()
        );

        let mut old = Vec::with_capacity(self.entity.columns().len());
        for handle in self.entity.columns() {
            old.push((handle.name().to_string(), handle.file().read().read(tid)?));
        }
        for handle in self.entity.columns() {
            if let Err(e) = handle.file().write().delete(tid) {
                self.ctx.fail();
                return Err(e);
            }
        }

        self.dispatch(DataChangeEvent::Delete { tid, old })?;
        Ok(())
    }

    /// Sends a change event to every incrementally-updatable index before
    /// the statement returns.
    fn dispatch(&self, event: DataChangeEvent) -> Result<()> {
        for (def, index) in self.entity.index_handles() {
            if def.kind.supports_incremental_update() {
                index.lock().update(&event)?;
            }
        }
        Ok(())
    }

    /// Creates and trains a new index over one column.
    pub fn create_index(&self, name: &str, kind: IndexKind, column: &str) -> Result<()> {
        self.ensure_writable()?;
        let handle = self.entity.column(column)?;
        ensure!(
            !self
                .entity
                .index_defs()
                .iter()
                .any(|d| d.name == name),
            "index {}.{} already exists",
            self.entity.fqname(),
            name
        );

        let dir = self.entity.path().join(name);
        let fq_index = format!("{}.{}", self.entity.fqname(), name);
        let mut index = Index::create(kind, &fq_index, column, handle.def().ty, &dir)?;
        let rows = self.entity.column_snapshot(column)?;
        let mut source = rows.into_iter().map(Ok);
        index.rebuild(&mut source)?;

        self.entity.indexes.write().push((
            IndexDef {
                name: name.to_string(),
                kind,
                column: column.to_string(),
            },
            Arc::new(Mutex::new(index)),
        ));

        let entity = Arc::clone(&self.entity);
        let index_name = name.to_string();
        self.on_rollback(Box::new(move || {
            entity
                .indexes
                .write()
                .retain(|(d, _)| d.name != index_name);
            let dir = entity.path().join(&index_name);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        }));
        Ok(())
    }

    /// Unregisters an index; its directory is removed on commit and the
    /// registration restored on rollback.
    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let mut indexes = self.entity.indexes.write();
        let position = indexes
            .iter()
            .position(|(d, _)| d.name == name)
            .ok_or_else(|| {
                DbError::IndexDoesNotExist(format!("{}.{}", self.entity.fqname(), name))
            })?;
        let (def, index) = indexes.remove(position);
        drop(indexes);

        let entity = Arc::clone(&self.entity);
        let dir = entity.path().join(&def.name);
        self.on_commit(Box::new(move || {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        }));
        let entity = Arc::clone(&self.entity);
        self.on_rollback(Box::new(move || {
            entity.indexes.write().push((def, index));
            Ok(())
        }));
        Ok(())
    }

    /// Retrains one index from the entity's current live tuples.
    pub fn rebuild_index(&self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let handle = self.entity.index(name)?;
        let mut index = handle.lock();
        let rows = self.entity.column_snapshot(index.column())?;
        let mut source = rows.into_iter().map(Ok);
        index.rebuild(&mut source)
    }

    /// Commits this entity's transactional work: indexes first (so a
    /// failed index commit leaves column counters untouched), then column
    /// files, then statistics and the catalog, then the action queue.
    pub fn commit(&self) -> Result<()> {
        self.ctx.check_active()?;
        for (_, index) in self.entity.index_handles() {
            index.lock().commit()?;
        }
        for handle in self.entity.columns() {
            if let Err(e) = handle.file().write().commit() {
                self.ctx.fail();
                return Err(e);
            }
        }

        {
            let mut stats = self.entity.statistics.write();
            stats.rows = self.entity.live_count();
            stats.max_tuple_id = self.entity.max_tuple_id();
            let deltas = self.null_deltas.lock();
            for handle in self.entity.columns() {
                let delta = deltas.get(handle.name()).copied().unwrap_or(0);
                match stats.null_counts.iter_mut().find(|(c, _)| c == handle.name()) {
                    Some((_, n)) => *n = (*n as i64 + delta).max(0) as u64,
                    None => stats
                        .null_counts
                        .push((handle.name().to_string(), delta.max(0) as u64)),
                }
            }
        }
        self.entity.persist_catalog()?;
        self.null_deltas.lock().clear();

        let actions = std::mem::take(&mut *self.post_commit.lock());
        self.post_rollback.lock().clear();
        run_actions(actions)
    }

    /// Rolls this entity's transactional work back and runs the reversing
    /// actions.
    pub fn rollback(&self) -> Result<()> {
        for (_, index) in self.entity.index_handles() {
            index.lock().rollback()?;
        }
        for handle in self.entity.columns() {
            handle.file().write().rollback()?;
        }
        self.null_deltas.lock().clear();

        let actions = std::mem::take(&mut *self.post_rollback.lock());
        self.post_commit.lock().clear();
        run_actions(actions)
    }
}

/// Columns referenced by a query must exist; surfaced as a bind error.
pub fn require_columns(entity: &Entity, columns: &[String]) -> Result<()> {
    for column in columns {
        if !entity.columns().iter().any(|c| c.name() == column.as_str()) {
            bail!(DbError::ColumnDoesNotExist(format!(
                "{}.{}",
                entity.fqname(),
                column
            )));
        }
    }
    Ok(())
}
