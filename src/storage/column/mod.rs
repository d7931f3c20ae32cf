//! # Column Files
//!
//! A column file is a page file holding one column of an entity. Two
//! layouts exist behind the [`ColumnFile`] dispatch:
//!
//! - **Fixed** ([`fixed::FixedColumnFile`]): every tuple occupies the same
//!   number of bytes, so `TupleId → (page, slot)` is pure arithmetic.
//! - **Variable** ([`variable::VariableColumnFile`]): a chain of directory
//!   pages maps each tuple to a slot in a slotted data page.
//!
//! Both layouts share the column header on page 2, which persists the
//! column's type, nullability and the committed tuple counters. The
//! counters are the transactional anchor: they are only written during
//! commit, so an uncommitted tail of appended tuples is invisible after a
//! rollback or crash.
//!
//! Mutations flow through the buffer pool; commit flushes the pool and
//! commits the disk manager, rollback discards unpinned frames and reverts
//! the in-memory counters.

pub mod fixed;
pub mod variable;

use crate::config::EngineConfig;
use crate::storage::buffer::BufferPool;
use crate::storage::disk::{DirectDiskManager, DiskManager};
use crate::storage::header::FileType;
use crate::storage::page::{PageId, PageTag};
use crate::storage::wal::WalDiskManager;
use crate::types::{Type, Value};
use crate::zerocopy_accessors;
use eyre::{ensure, Result};
use std::path::Path;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Page id of the column header page.
pub const COLUMN_HEADER_PAGE: PageId = 2;

/// Entry flag bits shared by both layouts.
pub const ENTRY_DELETED: u8 = 1 << 0;
pub const ENTRY_NULL: u8 = 1 << 1;

/// Column header flag bits.
pub const COLUMN_NULLABLE: u64 = 1 << 0;

pub type TupleId = u64;

/// On-disk column header, at offset 0 of page 2.
///
/// ```text
/// Offset  Size  Field
/// ------  ----  -------------------------------
/// 0       4     page-type tag
/// 4       4     type ordinal
/// 8       4     logical size (vector element count)
/// 12      4     physical entry size in bytes
/// 16      8     flag bits (bit 0 = nullable)
/// 24      8     tuple count (appended, including deleted)
/// 32      8     deleted count
/// 40      8     max tuple id (first unassigned id)
/// 48      8     current append data page (variable layout)
/// 56      8     tail directory page (variable layout)
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ColumnHeader {
    tag: U32,
    type_ordinal: U32,
    logical_size: U32,
    entry_size: U32,
    flags: U64,
    count: U64,
    deleted: U64,
    max_tuple_id: U64,
    append_page: U64,
    dir_tail: U64,
}

const _: () = assert!(std::mem::size_of::<ColumnHeader>() == 64);

impl ColumnHeader {
    pub fn new(ty: Type, nullable: bool) -> Self {
        Self {
            tag: U32::new(PageTag::ColumnHeader as u32),
            type_ordinal: U32::new(ty.ordinal()),
            logical_size: U32::new(ty.logical_size()),
            entry_size: U32::new(
                ty.physical_size().map(|s| s as u32 + 1).unwrap_or(0),
            ),
            flags: U64::new(if nullable { COLUMN_NULLABLE } else { 0 }),
            count: U64::new(0),
            deleted: U64::new(0),
            max_tuple_id: U64::new(0),
            append_page: U64::new(0),
            dir_tail: U64::new(0),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= std::mem::size_of::<Self>(),
            "buffer too small for ColumnHeader"
        );
        let header = Self::ref_from_bytes(&bytes[..std::mem::size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to parse ColumnHeader: {:?}", e))?;
        ensure!(
            header.tag.get() == PageTag::ColumnHeader as u32,
            "page 2 does not carry a column header tag"
        );
        Ok(header)
    }

    pub fn column_type(&self) -> Result<Type> {
        Type::from_ordinal(self.type_ordinal.get(), self.logical_size.get())
    }

    pub fn nullable(&self) -> bool {
        self.flags.get() & COLUMN_NULLABLE != 0
    }

    zerocopy_accessors! {
        count: u64,
        deleted: u64,
        max_tuple_id: u64,
        append_page: u64,
        dir_tail: u64,
    }
}

/// In-memory tuple counters, snapshotted at commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ColumnMeta {
    /// Tuples ever appended (deleted ones included).
    pub count: u64,
    pub deleted: u64,
    /// First unassigned tuple id.
    pub max_tuple_id: u64,
}

impl ColumnMeta {
    pub fn live(&self) -> u64 {
        self.count - self.deleted
    }
}

pub(crate) fn create_disk(
    path: &Path,
    file_type: FileType,
    config: &EngineConfig,
) -> Result<Box<dyn DiskManager>> {
    Ok(if config.use_wal {
        Box::new(WalDiskManager::create(path, file_type)?)
    } else {
        Box::new(DirectDiskManager::create(path, file_type)?)
    })
}

pub(crate) fn open_disk(path: &Path, config: &EngineConfig) -> Result<Box<dyn DiskManager>> {
    Ok(if config.use_wal {
        Box::new(WalDiskManager::open(path, config.file_lock_timeout)?)
    } else {
        Box::new(DirectDiskManager::open(path, config.file_lock_timeout)?)
    })
}

/// One column file, either layout.
pub enum ColumnFile {
    Fixed(fixed::FixedColumnFile),
    Variable(variable::VariableColumnFile),
}

impl ColumnFile {
    /// Creates the file for `ty`: fixed-width types get the fixed layout,
    /// strings the variable layout.
    pub fn create(path: &Path, ty: Type, nullable: bool, config: &EngineConfig) -> Result<Self> {
        if ty.is_fixed() {
            Ok(ColumnFile::Fixed(fixed::FixedColumnFile::create(
                path, ty, nullable, config,
            )?))
        } else {
            Ok(ColumnFile::Variable(variable::VariableColumnFile::create(
                path, ty, nullable, config,
            )?))
        }
    }

    pub fn open(path: &Path, config: &EngineConfig) -> Result<Self> {
        let disk = open_disk(path, config)?;
        match disk.file_type() {
            FileType::FixedColumn => Ok(ColumnFile::Fixed(fixed::FixedColumnFile::from_disk(
                disk, config,
            )?)),
            FileType::VariableColumn => Ok(ColumnFile::Variable(
                variable::VariableColumnFile::from_disk(disk, config)?,
            )),
            other => eyre::bail!(
                "{} is not a column file (file type {:?})",
                path.display(),
                other
            ),
        }
    }

    pub fn column_type(&self) -> Type {
        match self {
            ColumnFile::Fixed(f) => f.column_type(),
            ColumnFile::Variable(f) => f.column_type(),
        }
    }

    pub fn nullable(&self) -> bool {
        match self {
            ColumnFile::Fixed(f) => f.nullable(),
            ColumnFile::Variable(f) => f.nullable(),
        }
    }

    pub fn meta(&self) -> ColumnMeta {
        match self {
            ColumnFile::Fixed(f) => f.meta(),
            ColumnFile::Variable(f) => f.meta(),
        }
    }

    pub fn read(&self, tid: TupleId) -> Result<Option<Value>> {
        match self {
            ColumnFile::Fixed(f) => f.read(tid),
            ColumnFile::Variable(f) => f.read(tid),
        }
    }

    pub fn is_deleted(&self, tid: TupleId) -> Result<bool> {
        match self {
            ColumnFile::Fixed(f) => f.is_deleted(tid),
            ColumnFile::Variable(f) => f.is_deleted(tid),
        }
    }

    /// Appends the value for the next tuple id, which the caller supplies
    /// so every column of an entity stays aligned.
    pub fn append(&mut self, tid: TupleId, value: Option<&Value>) -> Result<()> {
        match self {
            ColumnFile::Fixed(f) => f.append(tid, value),
            ColumnFile::Variable(f) => f.append(tid, value),
        }
    }

    pub fn update(&mut self, tid: TupleId, value: Option<&Value>) -> Result<()> {
        match self {
            ColumnFile::Fixed(f) => f.update(tid, value),
            ColumnFile::Variable(f) => f.update(tid, value),
        }
    }

    pub fn delete(&mut self, tid: TupleId) -> Result<()> {
        match self {
            ColumnFile::Fixed(f) => f.delete(tid),
            ColumnFile::Variable(f) => f.delete(tid),
        }
    }

    pub fn commit(&mut self) -> Result<()> {
        match self {
            ColumnFile::Fixed(f) => f.commit(),
            ColumnFile::Variable(f) => f.commit(),
        }
    }

    pub fn rollback(&mut self) -> Result<()> {
        match self {
            ColumnFile::Fixed(f) => f.rollback(),
            ColumnFile::Variable(f) => f.rollback(),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            ColumnFile::Fixed(f) => f.close(),
            ColumnFile::Variable(f) => f.close(),
        }
    }

    pub fn delete_file(&mut self) -> Result<()> {
        match self {
            ColumnFile::Fixed(f) => f.delete_file(),
            ColumnFile::Variable(f) => f.delete_file(),
        }
    }

    pub fn validate(&self) -> Result<bool> {
        match self {
            ColumnFile::Fixed(f) => f.pool().with_disk(|d| d.validate()),
            ColumnFile::Variable(f) => f.pool().with_disk(|d| d.validate()),
        }
    }

    pub fn pool(&self) -> &BufferPool {
        match self {
            ColumnFile::Fixed(f) => f.pool(),
            ColumnFile::Variable(f) => f.pool(),
        }
    }

    /// Cursor over the non-deleted tuple ids in `[start, end]`.
    pub fn cursor(&self, range: Option<(TupleId, TupleId)>) -> ColumnCursor<'_> {
        let meta = self.meta();
        let (start, end) = match range {
            Some((s, e)) => (s, e.min(meta.max_tuple_id.saturating_sub(1))),
            None => (0, meta.max_tuple_id.saturating_sub(1)),
        };
        ColumnCursor {
            file: self,
            next: start,
            end,
            exhausted: meta.max_tuple_id == 0 || start > end,
        }
    }

    pub fn reader(&self) -> ColumnReader<'_> {
        ColumnReader { file: self }
    }
}

/// Iterates tuple ids, skipping deleted entries. Single-threaded.
pub struct ColumnCursor<'a> {
    file: &'a ColumnFile,
    next: TupleId,
    end: TupleId,
    exhausted: bool,
}

impl ColumnCursor<'_> {
    /// Advances to the next live tuple; `None` at the end of the range.
    pub fn next(&mut self) -> Result<Option<TupleId>> {
        while !self.exhausted {
            let tid = self.next;
            if tid >= self.end {
                self.exhausted = true;
            } else {
                self.next += 1;
            }
            if tid <= self.end && !self.file.is_deleted(tid)? {
                return Ok(Some(tid));
            }
        }
        Ok(None)
    }
}

/// Read view paired with a cursor.
pub struct ColumnReader<'a> {
    file: &'a ColumnFile,
}

impl ColumnReader<'_> {
    pub fn get(&self, tid: TupleId) -> Result<Option<Value>> {
        self.file.read(tid)
    }
}
