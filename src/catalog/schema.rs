//! # Schemas
//!
//! A schema is a named namespace of entities backed by one directory. Its
//! `index.db` records the entities; the registry in memory mirrors it.
//! Structural mutations go through [`SchemaTx`], which queues the forward
//! filesystem action and its reverse so the schema resolves consistently
//! whichever way the transaction ends.

use super::{run_actions, shadow_name, Action, CloseLock, CloseLockGuard, ColumnDef, Entity};
use crate::config::EngineConfig;
use crate::encoding::{Decoder, Encoder};
use crate::error::DbError;
use crate::txn::{LockMode, TransactionContext};
use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CATALOG_FILE: &str = "index.db";

pub struct Schema {
    name: String,
    path: PathBuf,
    config: EngineConfig,
    entities: RwLock<HashMap<String, Arc<Entity>>>,
    close_lock: Arc<CloseLock>,
}

impl Schema {
    pub fn create(name: &str, path: &Path, config: &EngineConfig) -> Result<Arc<Schema>> {
        std::fs::create_dir_all(path)
            .wrap_err_with(|| format!("failed to create schema directory {}", path.display()))?;
        let schema = Arc::new(Schema {
            name: name.to_string(),
            path: path.to_path_buf(),
            config: config.clone(),
            entities: RwLock::new(HashMap::new()),
            close_lock: CloseLock::new(),
        });
        schema.persist_catalog()?;
        Ok(schema)
    }

    pub fn open(name: &str, path: &Path, config: &EngineConfig) -> Result<Arc<Schema>> {
        let catalog_path = path.join(CATALOG_FILE);
        let bytes = std::fs::read(&catalog_path).wrap_err_with(|| {
            format!("failed to read schema catalog {}", catalog_path.display())
        })?;
        let mut dec = Decoder::new(&bytes);
        let count = dec.u64()? as usize;
        let mut entities = HashMap::with_capacity(count);
        for _ in 0..count {
            let entity_name = dec.string()?;
            let dir_name = dec.string()?;
            let entity = Entity::open(name, &entity_name, &path.join(&dir_name), config)?;
            entities.insert(entity_name, entity);
        }
        Ok(Arc::new(Schema {
            name: name.to_string(),
            path: path.to_path_buf(),
            config: config.clone(),
            entities: RwLock::new(entities),
            close_lock: CloseLock::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close_lock(&self) -> &Arc<CloseLock> {
        &self.close_lock
    }

    pub fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entities.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn entity(&self, name: &str) -> Result<Arc<Entity>> {
        self.entities
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::EntityDoesNotExist(format!("{}.{}", self.name, name)).into())
    }

    pub(crate) fn persist_catalog(&self) -> Result<()> {
        let entities = self.entities.read();
        let mut names: Vec<&String> = entities.keys().collect();
        names.sort();
        let mut enc = Encoder::new();
        enc.u64(names.len() as u64);
        for name in names {
            enc.string(name);
            enc.string(name);
        }
        drop(entities);

        let catalog_path = self.path.join(CATALOG_FILE);
        let tmp = self.path.join("index.db.tmp");
        std::fs::write(&tmp, enc.finish())?;
        std::fs::rename(&tmp, &catalog_path)
            .wrap_err_with(|| format!("failed to install {}", catalog_path.display()))
    }

    /// Closes every entity, then the schema itself.
    pub fn close(&self) -> Result<()> {
        for entity in self.entities.read().values() {
            entity.close()?;
        }
        self.close_lock.close(&self.name)
    }

    pub fn begin_tx(self: &Arc<Self>, ctx: &Arc<TransactionContext>) -> Result<SchemaTx> {
        let close_guard = self.close_lock.acquire(ctx.id(), &self.name)?;
        Ok(SchemaTx {
            schema: Arc::clone(self),
            ctx: Arc::clone(ctx),
            _close: close_guard,
            post_commit: Mutex::new(Vec::new()),
            post_rollback: Mutex::new(Vec::new()),
        })
    }
}

pub struct SchemaTx {
    schema: Arc<Schema>,
    ctx: Arc<TransactionContext>,
    _close: CloseLockGuard,
    post_commit: Mutex<Vec<Action>>,
    post_rollback: Mutex<Vec<Action>>,
}

impl SchemaTx {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn ensure_readable(&self) -> Result<()> {
        self.ctx.begin_read()?;
        self.ctx.request_lock(self.schema.name(), LockMode::Shared)
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ctx.begin_write()?;
        self.ctx
            .request_lock(self.schema.name(), LockMode::Exclusive)
    }

    pub fn list_entities(&self) -> Result<Vec<String>> {
        self.ensure_readable()?;
        Ok(self.schema.entity_names())
    }

    pub fn entity_for_name(&self, name: &str) -> Result<Arc<Entity>> {
        self.ensure_readable()?;
        self.schema.entity(name)
    }

    /// Creates an entity with its column files. The schema's on-disk
    /// catalog is only rewritten at commit, so a rollback leaves it
    /// bit-for-bit unchanged.
    pub fn create_entity(&self, name: &str, defs: &[ColumnDef]) -> Result<Arc<Entity>> {
        self.ensure_writable()?;
        ensure!(
            !self.schema.entities.read().contains_key(name),
            DbError::EntityAlreadyExists(format!("{}.{}", self.schema.name(), name))
        );

        let path = self.schema.path().join(name);
        let entity = Entity::create(self.schema.name(), name, &path, defs, &self.schema.config)?;
        self.schema
            .entities
            .write()
            .insert(name.to_string(), Arc::clone(&entity));

        let schema = Arc::clone(&self.schema);
        let entity_name = name.to_string();
        let reverse = Arc::clone(&entity);
        self.post_rollback.lock().push(Box::new(move || {
            schema.entities.write().remove(&entity_name);
            reverse.close()?;
            let dir = schema.path().join(&entity_name);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        }));
        Ok(entity)
    }

    /// Drops an entity via the shadow-rename protocol: the directory is
    /// renamed now, deleted on commit, restored on rollback.
    pub fn drop_entity(&self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let entity = self.schema.entity(name)?;
        self.ctx
            .request_lock(entity.fqname(), LockMode::Exclusive)?;

        entity.close()?;
        self.schema.entities.write().remove(name);

        let dir = self.schema.path().join(name);
        let shadow = self.schema.path().join(shadow_name(name, self.ctx.id()));
        std::fs::rename(&dir, &shadow)
            .wrap_err_with(|| format!("failed to shadow {}", dir.display()))?;

        let commit_shadow = shadow.clone();
        self.post_commit.lock().push(Box::new(move || {
            if commit_shadow.exists() {
                std::fs::remove_dir_all(&commit_shadow)?;
            }
            Ok(())
        }));

        let schema = Arc::clone(&self.schema);
        let entity_name = name.to_string();
        self.post_rollback.lock().push(Box::new(move || {
            std::fs::rename(&shadow, &dir)?;
            let reopened = Entity::open(schema.name(), &entity_name, &dir, &schema.config)?;
            schema.entities.write().insert(entity_name, reopened);
            Ok(())
        }));
        Ok(())
    }

    /// Persists the schema catalog and runs the post-commit queue.
    pub fn commit(&self) -> Result<()> {
        self.ctx.check_active()?;
        self.schema.persist_catalog()?;
        let actions = std::mem::take(&mut *self.post_commit.lock());
        self.post_rollback.lock().clear();
        run_actions(actions)
    }

    /// Runs the reversing actions.
    pub fn rollback(&self) -> Result<()> {
        let actions = std::mem::take(&mut *self.post_rollback.lock());
        self.post_commit.lock().clear();
        run_actions(actions)
    }
}
