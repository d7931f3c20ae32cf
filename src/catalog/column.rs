//! # Column Descriptors
//!
//! [`ColumnDef`] is the logical description of a column (name, type,
//! nullability); [`ColumnHandle`] pairs it with the open column file. The
//! handle's `RwLock` is the per-file latch of the lock order: readers share
//! it, writers take it exclusively, page pins are acquired beneath it.

use crate::storage::column::ColumnFile;
use crate::types::Type;
use eyre::Result;
use parking_lot::RwLock;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: Type,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// File-name stem used for the column's page file.
    pub fn file_name(&self) -> String {
        format!("{}.col", self.name)
    }
}

pub struct ColumnHandle {
    def: ColumnDef,
    path: PathBuf,
    file: RwLock<ColumnFile>,
}

impl ColumnHandle {
    pub fn new(def: ColumnDef, path: PathBuf, file: ColumnFile) -> Self {
        Self {
            def,
            path,
            file: RwLock::new(file),
        }
    }

    pub fn def(&self) -> &ColumnDef {
        &self.def
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// The column-file latch. Lock order: entity logical lock first, then
    /// this latch, then page pins.
    pub fn file(&self) -> &RwLock<ColumnFile> {
        &self.file
    }

    pub fn close(&self) -> Result<()> {
        self.file.write().close()
    }
}
