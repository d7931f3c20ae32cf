//! # Catalogue
//!
//! The root of the DBO tree: a directory containing `catalogue.db` (the
//! schema registry) and one subdirectory per schema. Opened once per
//! engine instance; schema creation and drops go through [`CatalogueTx`]
//! with the same action-queue protocol as the lower levels.

use super::{run_actions, shadow_name, Action, CloseLock, CloseLockGuard, Schema};
use crate::config::EngineConfig;
use crate::encoding::{Decoder, Encoder};
use crate::error::DbError;
use crate::txn::{LockMode, TransactionContext};
use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CATALOG_FILE: &str = "catalogue.db";

/// Lock-manager key for the catalogue itself.
const CATALOGUE_DBO: &str = "\u{0}catalogue";

pub struct Catalogue {
    root: PathBuf,
    config: EngineConfig,
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
    close_lock: Arc<CloseLock>,
}

impl Catalogue {
    /// Opens (or initializes) the catalogue rooted at `root`.
    pub fn open(root: &Path, config: &EngineConfig) -> Result<Arc<Catalogue>> {
        std::fs::create_dir_all(root)
            .wrap_err_with(|| format!("failed to create catalogue root {}", root.display()))?;
        let catalog_path = root.join(CATALOG_FILE);
        let mut schemas = HashMap::new();
        if catalog_path.exists() {
            let bytes = std::fs::read(&catalog_path)?;
            let mut dec = Decoder::new(&bytes);
            let count = dec.u64()? as usize;
            for _ in 0..count {
                let name = dec.string()?;
                let dir_name = dec.string()?;
                let schema = Schema::open(&name, &root.join(&dir_name), config)?;
                schemas.insert(name, schema);
            }
        }
        let catalogue = Arc::new(Catalogue {
            root: root.to_path_buf(),
            config: config.clone(),
            schemas: RwLock::new(schemas),
            close_lock: CloseLock::new(),
        });
        if !catalog_path.exists() {
            catalogue.persist_catalog()?;
        }
        Ok(catalogue)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schema_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn schema(&self, name: &str) -> Result<Arc<Schema>> {
        self.schemas
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::SchemaDoesNotExist(name.to_string()).into())
    }

    pub(crate) fn persist_catalog(&self) -> Result<()> {
        let schemas = self.schemas.read();
        let mut names: Vec<&String> = schemas.keys().collect();
        names.sort();
        let mut enc = Encoder::new();
        enc.u64(names.len() as u64);
        for name in names {
            enc.string(name);
            enc.string(name);
        }
        drop(schemas);

        let catalog_path = self.root.join(CATALOG_FILE);
        let tmp = self.root.join("catalogue.db.tmp");
        std::fs::write(&tmp, enc.finish())?;
        std::fs::rename(&tmp, &catalog_path)
            .wrap_err_with(|| format!("failed to install {}", catalog_path.display()))
    }

    /// Closes every schema, children before parents.
    pub fn close(&self) -> Result<()> {
        for schema in self.schemas.read().values() {
            schema.close()?;
        }
        self.close_lock.close("catalogue")
    }

    pub fn begin_tx(self: &Arc<Self>, ctx: &Arc<TransactionContext>) -> Result<CatalogueTx> {
        let close_guard = self.close_lock.acquire(ctx.id(), "catalogue")?;
        Ok(CatalogueTx {
            catalogue: Arc::clone(self),
            ctx: Arc::clone(ctx),
            _close: close_guard,
            post_commit: Mutex::new(Vec::new()),
            post_rollback: Mutex::new(Vec::new()),
        })
    }
}

pub struct CatalogueTx {
    catalogue: Arc<Catalogue>,
    ctx: Arc<TransactionContext>,
    _close: CloseLockGuard,
    post_commit: Mutex<Vec<Action>>,
    post_rollback: Mutex<Vec<Action>>,
}

impl CatalogueTx {
    fn ensure_readable(&self) -> Result<()> {
        self.ctx.begin_read()?;
        self.ctx.request_lock(CATALOGUE_DBO, LockMode::Shared)
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ctx.begin_write()?;
        self.ctx.request_lock(CATALOGUE_DBO, LockMode::Exclusive)
    }

    pub fn list_schemas(&self) -> Result<Vec<String>> {
        self.ensure_readable()?;
        Ok(self.catalogue.schema_names())
    }

    pub fn schema_for_name(&self, name: &str) -> Result<Arc<Schema>> {
        self.ensure_readable()?;
        self.catalogue.schema(name)
    }

    pub fn create_schema(&self, name: &str) -> Result<Arc<Schema>> {
        self.ensure_writable()?;
        ensure!(
            !self.catalogue.schemas.read().contains_key(name),
            DbError::SchemaAlreadyExists(name.to_string())
        );

        let path = self.catalogue.root().join(name);
        let schema = Schema::create(name, &path, &self.catalogue.config)?;
        self.catalogue
            .schemas
            .write()
            .insert(name.to_string(), Arc::clone(&schema));

        let catalogue = Arc::clone(&self.catalogue);
        let schema_name = name.to_string();
        let created = Arc::clone(&schema);
        self.post_rollback.lock().push(Box::new(move || {
            catalogue.schemas.write().remove(&schema_name);
            created.close()?;
            let dir = catalogue.root().join(&schema_name);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            Ok(())
        }));
        Ok(schema)
    }

    /// Drops a schema via the shadow-rename protocol.
    pub fn drop_schema(&self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        let schema = self.catalogue.schema(name)?;
        self.ctx.request_lock(name, LockMode::Exclusive)?;

        schema.close()?;
        self.catalogue.schemas.write().remove(name);

        let dir = self.catalogue.root().join(name);
        let shadow = self
            .catalogue
            .root()
            .join(shadow_name(name, self.ctx.id()));
        std::fs::rename(&dir, &shadow)
            .wrap_err_with(|| format!("failed to shadow {}", dir.display()))?;

        let commit_shadow = shadow.clone();
        self.post_commit.lock().push(Box::new(move || {
            if commit_shadow.exists() {
                std::fs::remove_dir_all(&commit_shadow)?;
            }
            Ok(())
        }));

        let catalogue = Arc::clone(&self.catalogue);
        let schema_name = name.to_string();
        self.post_rollback.lock().push(Box::new(move || {
            std::fs::rename(&shadow, &dir)?;
            let reopened = Schema::open(&schema_name, &dir, &catalogue.config)?;
            catalogue.schemas.write().insert(schema_name, reopened);
            Ok(())
        }));
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.ctx.check_active()?;
        self.catalogue.persist_catalog()?;
        let actions = std::mem::take(&mut *self.post_commit.lock());
        self.post_rollback.lock().clear();
        run_actions(actions)
    }

    pub fn rollback(&self) -> Result<()> {
        let actions = std::mem::take(&mut *self.post_rollback.lock());
        self.post_commit.lock().clear();
        run_actions(actions)
    }
}
