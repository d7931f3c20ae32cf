//! # Fixed-Width Column Files
//!
//! Layout for columns whose type has a fixed physical size. Every entry is
//! `1 + physical_size(type)` bytes: a flag byte (deleted, null) followed by
//! the payload. Entries never straddle pages; a data page holds
//! `PAGE_SIZE / entry_size` entries, so addressing is pure arithmetic:
//!
//! ```text
//! page(tid) = 3 + tid / entries_per_page
//! slot(tid) = tid % entries_per_page
//! offset    = slot * entry_size
//! ```
//!
//! Page 1 is the file header, page 2 the column header, data pages start at
//! 3 and are append-only (fixed files never free pages, keeping the
//! arithmetic valid).

use super::{
    create_disk, ColumnHeader, ColumnMeta, COLUMN_HEADER_PAGE, ENTRY_DELETED, ENTRY_NULL,
    TupleId,
};
use crate::config::{EngineConfig, PAGE_SIZE};
use crate::storage::buffer::{BufferPool, Priority};
use crate::storage::disk::DiskManager;
use crate::storage::header::FileType;
use crate::storage::page::PageId;
use crate::types::{Type, Value};
use eyre::{ensure, Result};
use std::path::Path;
use zerocopy::IntoBytes;

/// First data page of a fixed column file.
const DATA_START: PageId = 3;

pub struct FixedColumnFile {
    pool: BufferPool,
    ty: Type,
    nullable: bool,
    entry_size: usize,
    per_page: usize,
    meta: ColumnMeta,
    committed: ColumnMeta,
}

impl FixedColumnFile {
    pub fn create(path: &Path, ty: Type, nullable: bool, config: &EngineConfig) -> Result<Self> {
        let physical = ty
            .physical_size()
            .ok_or_else(|| eyre::eyre!("{} requires the variable layout", ty.name()))?;
        ensure!(
            physical + 1 <= PAGE_SIZE,
            "entry size {} exceeds a page",
            physical + 1
        );

        let mut disk = create_disk(path, FileType::FixedColumn, config)?;
        let header_page = disk.allocate(None)?;
        ensure!(header_page == COLUMN_HEADER_PAGE, "column header must be page 2");

        let pool = BufferPool::new(disk, config.buffer_pool_size, config.eviction_timeout);
        let mut file = Self {
            pool,
            ty,
            nullable,
            entry_size: physical + 1,
            per_page: PAGE_SIZE / (physical + 1),
            meta: ColumnMeta::default(),
            committed: ColumnMeta::default(),
        };
        file.write_header_page(nullable)?;
        file.commit()?;
        Ok(file)
    }

    pub(super) fn from_disk(disk: Box<dyn DiskManager>, config: &EngineConfig) -> Result<Self> {
        let pool = BufferPool::new(disk, config.buffer_pool_size, config.eviction_timeout);
        let (ty, nullable, meta) = {
            let page = pool.get(COLUMN_HEADER_PAGE, Priority::High)?;
            let data = page.read();
            let header = ColumnHeader::from_bytes(data.as_slice())?;
            (
                header.column_type()?,
                header.nullable(),
                ColumnMeta {
                    count: header.count(),
                    deleted: header.deleted(),
                    max_tuple_id: header.max_tuple_id(),
                },
            )
        };
        let physical = ty
            .physical_size()
            .ok_or_else(|| eyre::eyre!("fixed column file carries variable type {}", ty.name()))?;
        Ok(Self {
            pool,
            ty,
            nullable,
            entry_size: physical + 1,
            per_page: PAGE_SIZE / (physical + 1),
            meta,
            committed: meta,
        })
    }

    pub fn column_type(&self) -> Type {
        self.ty
    }

    pub fn nullable(&self) -> bool {
        self.nullable
    }

    pub fn meta(&self) -> ColumnMeta {
        self.meta
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    #[inline]
    fn page_of(&self, tid: TupleId) -> PageId {
        DATA_START + tid / self.per_page as u64
    }

    #[inline]
    fn offset_of(&self, tid: TupleId) -> usize {
        (tid as usize % self.per_page) * self.entry_size
    }

    fn check_bounds(&self, tid: TupleId) -> Result<()> {
        ensure!(
            tid < self.meta.max_tuple_id,
            "tuple id {} out of bounds (max {})",
            tid,
            self.meta.max_tuple_id
        );
        Ok(())
    }

    pub fn read(&self, tid: TupleId) -> Result<Option<Value>> {
        self.check_bounds(tid)?;
        let page = self.pool.get(self.page_of(tid), Priority::Normal)?;
        let data = page.read();
        let offset = self.offset_of(tid);
        let flags = data.get_u8(offset);
        if flags & ENTRY_NULL != 0 {
            return Ok(None);
        }
        let payload = data.get_bytes(offset + 1, self.entry_size - 1);
        Ok(Some(Value::read_fixed(self.ty, payload)?))
    }

    pub fn is_deleted(&self, tid: TupleId) -> Result<bool> {
        self.check_bounds(tid)?;
        let page = self.pool.get(self.page_of(tid), Priority::Normal)?;
        let flags = page.read().get_u8(self.offset_of(tid));
        Ok(flags & ENTRY_DELETED != 0)
    }

    pub fn append(&mut self, tid: TupleId, value: Option<&Value>) -> Result<()> {
        ensure!(
            tid == self.meta.max_tuple_id,
            "append expects tuple id {} (got {})",
            self.meta.max_tuple_id,
            tid
        );
        if value.is_none() {
            ensure!(self.nullable, "column is not nullable");
        }

        let target = self.page_of(tid);
        self.pool.with_disk(|disk| -> Result<()> {
            while disk.pages() < target {
                disk.allocate(None)?;
            }
            Ok(())
        })?;

        self.write_entry(tid, value, 0)?;
        self.meta.count += 1;
        self.meta.max_tuple_id += 1;
        Ok(())
    }

    pub fn update(&mut self, tid: TupleId, value: Option<&Value>) -> Result<()> {
        self.check_bounds(tid)?;
        ensure!(!self.is_deleted(tid)?, "cannot update deleted tuple {}", tid);
        if value.is_none() {
            ensure!(self.nullable, "column is not nullable");
        }
        self.write_entry(tid, value, 0)
    }

    pub fn delete(&mut self, tid: TupleId) -> Result<()> {
        self.check_bounds(tid)?;
        let page = self.pool.get(self.page_of(tid), Priority::Normal)?;
        let offset = self.offset_of(tid);
        let mut data = page.write();
        let flags = data.get_u8(offset);
        ensure!(flags & ENTRY_DELETED == 0, "tuple {} is already deleted", tid);
        data.put_u8(offset, flags | ENTRY_DELETED);
        drop(data);
        self.meta.deleted += 1;
        Ok(())
    }

    fn write_entry(&self, tid: TupleId, value: Option<&Value>, base_flags: u8) -> Result<()> {
        if let Some(v) = value {
            ensure!(
                v.type_of() == self.ty,
                "type mismatch: column is {}, value is {}",
                self.ty.name(),
                v.type_of().name()
            );
        }
        let page = self.pool.get(self.page_of(tid), Priority::Normal)?;
        let offset = self.offset_of(tid);
        let mut data = page.write();
        match value {
            Some(v) => {
                data.put_u8(offset, base_flags);
                let mut payload = vec![0u8; self.entry_size - 1];
                v.write_fixed(&mut payload)?;
                data.put_bytes(offset + 1, &payload);
            }
            None => {
                data.put_u8(offset, base_flags | ENTRY_NULL);
            }
        }
        Ok(())
    }

    fn write_header_page(&mut self, nullable: bool) -> Result<()> {
        let mut header = ColumnHeader::new(self.ty, nullable);
        header.set_count(self.meta.count);
        header.set_deleted(self.meta.deleted);
        header.set_max_tuple_id(self.meta.max_tuple_id);
        let page = self.pool.get(COLUMN_HEADER_PAGE, Priority::High)?;
        page.write().put_bytes(0, header.as_bytes());
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.write_header_page(self.nullable)?;
        self.pool.flush()?;
        self.pool.with_disk(|disk| disk.commit())?;
        self.committed = self.meta;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.pool.discard_unpinned();
        self.pool.with_disk(|disk| disk.rollback())?;
        self.meta = self.committed;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.pool.discard_unpinned();
        self.pool.with_disk(|disk| disk.close())
    }

    pub fn delete_file(&mut self) -> Result<()> {
        self.pool.with_disk(|disk| disk.delete_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::column::ColumnFile;
    use tempfile::TempDir;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn append_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("feat.hare");
        let mut file =
            FixedColumnFile::create(&path, Type::FloatVector(2), false, &config()).unwrap();

        file.append(0, Some(&Value::FloatVector(vec![1.0, 0.0]))).unwrap();
        file.append(1, Some(&Value::FloatVector(vec![0.0, 1.0]))).unwrap();
        assert_eq!(file.meta().count, 2);

        assert_eq!(
            file.read(0).unwrap(),
            Some(Value::FloatVector(vec![1.0, 0.0]))
        );
        assert_eq!(
            file.read(1).unwrap(),
            Some(Value::FloatVector(vec![0.0, 1.0]))
        );
        assert!(file.read(2).is_err());
    }

    #[test]
    fn nulls_and_nullability() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("n.hare");
        let mut file = FixedColumnFile::create(&path, Type::Int, true, &config()).unwrap();
        file.append(0, None).unwrap();
        file.append(1, Some(&Value::Int(5))).unwrap();
        assert_eq!(file.read(0).unwrap(), None);
        assert_eq!(file.read(1).unwrap(), Some(Value::Int(5)));

        let path2 = dir.path().join("nn.hare");
        let mut strict = FixedColumnFile::create(&path2, Type::Int, false, &config()).unwrap();
        assert!(strict.append(0, None).is_err());
    }

    #[test]
    fn delete_marks_but_keeps_payload_addressing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("d.hare");
        let mut file = FixedColumnFile::create(&path, Type::Long, false, &config()).unwrap();
        for i in 0..5i64 {
            file.append(i as u64, Some(&Value::Long(i * 10))).unwrap();
        }
        file.delete(2).unwrap();
        assert!(file.is_deleted(2).unwrap());
        assert!(!file.is_deleted(3).unwrap());
        assert_eq!(file.meta().live(), 4);
        assert_eq!(file.read(3).unwrap(), Some(Value::Long(30)));
        assert!(file.delete(2).is_err(), "double delete is rejected");
    }

    #[test]
    fn commit_persists_counters_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.hare");
        let mut file = FixedColumnFile::create(&path, Type::Double, false, &config()).unwrap();
        file.append(0, Some(&Value::Double(2.5))).unwrap();
        file.append(1, Some(&Value::Double(-1.0))).unwrap();
        file.commit().unwrap();
        // Uncommitted tail beyond the committed counters.
        file.append(2, Some(&Value::Double(9.0))).unwrap();
        file.close().unwrap();

        let reopened = ColumnFile::open(&path, &config()).unwrap();
        assert_eq!(reopened.meta().count, 2, "uncommitted tail is invisible");
        assert_eq!(reopened.read(1).unwrap(), Some(Value::Double(-1.0)));
    }

    #[test]
    fn rollback_reverts_counters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("r.hare");
        let mut file = FixedColumnFile::create(&path, Type::Int, false, &config()).unwrap();
        file.append(0, Some(&Value::Int(1))).unwrap();
        file.commit().unwrap();
        file.append(1, Some(&Value::Int(2))).unwrap();
        file.rollback().unwrap();
        assert_eq!(file.meta().count, 1);
        assert_eq!(file.meta().max_tuple_id, 1);
    }

    #[test]
    fn cursor_skips_deleted_and_reader_pairs_with_it() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cur.hare");
        let mut file = FixedColumnFile::create(&path, Type::Int, false, &config()).unwrap();
        for i in 0..6 {
            file.append(i, Some(&Value::Int(i as i32))).unwrap();
        }
        file.delete(1).unwrap();
        file.delete(4).unwrap();

        let file = ColumnFile::Fixed(file);
        let reader = file.reader();
        let mut cursor = file.cursor(None);
        let mut seen = Vec::new();
        while let Some(tid) = cursor.next().unwrap() {
            seen.push((tid, reader.get(tid).unwrap()));
        }
        assert_eq!(
            seen,
            vec![
                (0, Some(Value::Int(0))),
                (2, Some(Value::Int(2))),
                (3, Some(Value::Int(3))),
                (5, Some(Value::Int(5))),
            ]
        );

        let mut ranged = file.cursor(Some((2, 3)));
        assert_eq!(ranged.next().unwrap(), Some(2));
        assert_eq!(ranged.next().unwrap(), Some(3));
        assert_eq!(ranged.next().unwrap(), None);
    }

    #[test]
    fn entries_span_many_pages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.hare");
        let mut file = FixedColumnFile::create(&path, Type::Long, false, &config()).unwrap();
        let per_page = PAGE_SIZE / 9;
        let n = (per_page * 3 + 10) as u64;
        for tid in 0..n {
            file.append(tid, Some(&Value::Long(tid as i64))).unwrap();
        }
        file.commit().unwrap();
        for tid in [0, per_page as u64, n - 1] {
            assert_eq!(file.read(tid).unwrap(), Some(Value::Long(tid as i64)));
        }
    }
}
