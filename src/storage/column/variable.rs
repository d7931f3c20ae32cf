//! # Variable-Width Column Files
//!
//! Layout for strings. A chain of *directory* pages maps each tuple id to
//! `(flags, address)`; the address points into a *slotted* data page where
//! the payload bytes live.
//!
//! ## Directory pages
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  ----------------------------------------
//! 0       4     page-type tag
//! 4       8     previous directory page id (-1 = none)
//! 12      8     next directory page id (-1 = none)
//! 20      8     first tuple id covered by this page
//! 28      8     last tuple id covered (-1 = empty)
//! 36      12*N  entries: (flags i32, address i64)
//! ```
//!
//! An address packs `(page_id << 16) | slot`. Address 0 means "no payload"
//! (null entries). Each directory page covers a contiguous tuple range, so
//! lookup is a binary search over the in-memory chain cache plus one page
//! pin.
//!
//! ## Slotted data pages
//!
//! The slot directory sits at the bottom of the page (4-byte entries of
//! `(offset, length)` growing downward from the page end); payloads grow
//! from the top, starting after the 8-byte page header. Deleting a tuple
//! tombstones its slot; the space is reclaimed by compaction, which runs
//! opportunistically when an insert fails for lack of room. Slot indexes
//! are stable across compaction, so directory addresses stay valid.
//!
//! A payload must fit a single page (there are no overflow chains); the
//! practical string limit is `PAGE_SIZE - 12` bytes.

use super::{
    create_disk, ColumnHeader, ColumnMeta, COLUMN_HEADER_PAGE, ENTRY_DELETED, ENTRY_NULL,
    TupleId,
};
use crate::config::{EngineConfig, PAGE_SIZE};
use crate::storage::buffer::{BufferPool, Priority};
use crate::storage::disk::DiskManager;
use crate::storage::header::FileType;
use crate::storage::page::{Page, PageId, PageTag};
use crate::types::{Type, Value};
use eyre::{bail, ensure, Result};
use std::path::Path;
use zerocopy::IntoBytes;

const DIR_HEADER_SIZE: usize = 36;
const DIR_ENTRY_SIZE: usize = 12;
/// Tuples per directory page.
pub const DIR_CAPACITY: u64 = ((PAGE_SIZE - DIR_HEADER_SIZE) / DIR_ENTRY_SIZE) as u64;

const DIR_PREV: usize = 4;
const DIR_NEXT: usize = 12;
const DIR_FIRST: usize = 20;
const DIR_LAST: usize = 28;

const SLOTTED_HEADER_SIZE: usize = 8;
const SLOT_ENTRY_SIZE: usize = 4;
const SLOT_COUNT: usize = 4;
const PAYLOAD_END: usize = 6;

/// Largest payload a slotted page can take.
pub const MAX_PAYLOAD: usize = PAGE_SIZE - SLOTTED_HEADER_SIZE - SLOT_ENTRY_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DirInfo {
    page: PageId,
    first: TupleId,
}

#[derive(Clone)]
struct Snapshot {
    meta: ColumnMeta,
    dirs: Vec<DirInfo>,
    append_page: Option<PageId>,
}

pub struct VariableColumnFile {
    pool: BufferPool,
    ty: Type,
    nullable: bool,
    meta: ColumnMeta,
    dirs: Vec<DirInfo>,
    append_page: Option<PageId>,
    committed: Snapshot,
}

impl VariableColumnFile {
    pub fn create(path: &Path, ty: Type, nullable: bool, config: &EngineConfig) -> Result<Self> {
        ensure!(
            !ty.is_fixed(),
            "{} belongs in the fixed layout",
            ty.name()
        );
        let mut disk = create_disk(path, FileType::VariableColumn, config)?;
        let header_page = disk.allocate(None)?;
        ensure!(header_page == COLUMN_HEADER_PAGE, "column header must be page 2");
        let first_dir = disk.allocate(None)?;

        let pool = BufferPool::new(disk, config.buffer_pool_size, config.eviction_timeout);
        let committed = Snapshot {
            meta: ColumnMeta::default(),
            dirs: vec![DirInfo {
                page: first_dir,
                first: 0,
            }],
            append_page: None,
        };
        let mut file = Self {
            pool,
            ty,
            nullable,
            meta: ColumnMeta::default(),
            dirs: committed.dirs.clone(),
            append_page: None,
            committed,
        };
        file.init_directory_page(first_dir, -1, 0)?;
        file.commit()?;
        Ok(file)
    }

    pub(super) fn from_disk(disk: Box<dyn DiskManager>, config: &EngineConfig) -> Result<Self> {
        let pool = BufferPool::new(disk, config.buffer_pool_size, config.eviction_timeout);
        let (ty, nullable, meta, append_page) = {
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
                match header.append_page() {
                    0 => None,
                    p => Some(p),
                },
            )
        };

        // Rebuild the chain cache by walking next pointers.
        let mut dirs = Vec::new();
        let mut next: i64 = (COLUMN_HEADER_PAGE + 1) as i64;
        while next > 0 {
            let id = next as PageId;
            let page = pool.get(id, Priority::Normal)?;
            let data = page.read();
            ensure!(
                data.tag() == PageTag::Directory,
                "page {} is not a directory page",
                id
            );
            dirs.push(DirInfo {
                page: id,
                first: data.get_u64(DIR_FIRST),
            });
            next = data.get_i64(DIR_NEXT);
        }
        ensure!(!dirs.is_empty(), "variable column file has no directory chain");

        let committed = Snapshot {
            meta,
            dirs: dirs.clone(),
            append_page,
        };
        Ok(Self {
            pool,
            ty,
            nullable,
            meta,
            dirs,
            append_page,
            committed,
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

    fn init_directory_page(&self, id: PageId, prev: i64, first: TupleId) -> Result<()> {
        let page = self.pool.get(id, Priority::Normal)?;
        let mut data = page.write();
        data.clear();
        data.set_tag(PageTag::Directory);
        data.put_i64(DIR_PREV, prev);
        data.put_i64(DIR_NEXT, -1);
        data.put_u64(DIR_FIRST, first);
        data.put_i64(DIR_LAST, -1);
        Ok(())
    }

    /// Directory page covering `tid`, plus the entry offset inside it.
    fn locate(&self, tid: TupleId) -> Result<(PageId, usize)> {
        let idx = match self.dirs.binary_search_by_key(&tid, |d| d.first) {
            Ok(i) => i,
            Err(0) => bail!("tuple id {} precedes the directory chain", tid),
            Err(i) => i - 1,
        };
        let info = self.dirs[idx];
        let slot = tid - info.first;
        ensure!(
            slot < DIR_CAPACITY,
            "tuple id {} outside directory page {} range",
            tid,
            info.page
        );
        Ok((info.page, DIR_HEADER_SIZE + (slot as usize) * DIR_ENTRY_SIZE))
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

    fn read_entry(&self, tid: TupleId) -> Result<(i32, i64)> {
        let (dir_page, offset) = self.locate(tid)?;
        let page = self.pool.get(dir_page, Priority::Normal)?;
        let data = page.read();
        Ok((data.get_i32(offset), data.get_i64(offset + 4)))
    }

    fn write_entry(&self, tid: TupleId, flags: i32, addr: i64) -> Result<()> {
        let (dir_page, offset) = self.locate(tid)?;
        let page = self.pool.get(dir_page, Priority::Normal)?;
        let mut data = page.write();
        data.put_i32(offset, flags);
        data.put_i64(offset + 4, addr);
        if data.get_i64(DIR_LAST) < tid as i64 {
            data.put_i64(DIR_LAST, tid as i64);
        }
        Ok(())
    }

    pub fn read(&self, tid: TupleId) -> Result<Option<Value>> {
        self.check_bounds(tid)?;
        let (flags, addr) = self.read_entry(tid)?;
        if flags & ENTRY_NULL as i32 != 0 {
            return Ok(None);
        }
        let (page_id, slot) = unpack_address(addr)?;
        let page = self.pool.get(page_id, Priority::Normal)?;
        let data = page.read();
        let (offset, len) = read_slot(&data, slot)?;
        ensure!(len > 0, "tuple {} points at a tombstoned slot", tid);
        let bytes = data.get_bytes(offset, len);
        Ok(Some(Value::read_variable(self.ty, bytes)?))
    }

    pub fn is_deleted(&self, tid: TupleId) -> Result<bool> {
        self.check_bounds(tid)?;
        let (flags, _) = self.read_entry(tid)?;
        Ok(flags & ENTRY_DELETED as i32 != 0)
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

        // Grow the directory chain when the tail page is exhausted.
        let tail = *self.dirs.last().expect("chain is never empty");
        if tid - tail.first >= DIR_CAPACITY {
            let new_dir = self.pool.with_disk(|disk| disk.allocate(None))?;
            self.init_directory_page(new_dir, tail.page as i64, tid)?;
            let page = self.pool.get(tail.page, Priority::Normal)?;
            page.write().put_i64(DIR_NEXT, new_dir as i64);
            drop(page);
            self.dirs.push(DirInfo {
                page: new_dir,
                first: tid,
            });
        }

        let (flags, addr) = match value {
            None => (ENTRY_NULL as i32, 0),
            Some(v) => {
                ensure!(
                    v.type_of() == self.ty,
                    "type mismatch: column is {}, value is {}",
                    self.ty.name(),
                    v.type_of().name()
                );
                let bytes = v.write_variable()?;
                (0, self.store_payload(&bytes)?)
            }
        };
        self.write_entry(tid, flags, addr)?;
        self.meta.count += 1;
        self.meta.max_tuple_id += 1;
        Ok(())
    }

    pub fn update(&mut self, tid: TupleId, value: Option<&Value>) -> Result<()> {
        self.check_bounds(tid)?;
        let (flags, old_addr) = self.read_entry(tid)?;
        ensure!(
            flags & ENTRY_DELETED as i32 == 0,
            "cannot update deleted tuple {}",
            tid
        );
        if value.is_none() {
            ensure!(self.nullable, "column is not nullable");
        }
        if old_addr != 0 {
            self.tombstone(old_addr)?;
        }
        let (new_flags, addr) = match value {
            None => (ENTRY_NULL as i32, 0),
            Some(v) => {
                let bytes = v.write_variable()?;
                (0, self.store_payload(&bytes)?)
            }
        };
        self.write_entry(tid, new_flags, addr)
    }

    pub fn delete(&mut self, tid: TupleId) -> Result<()> {
        self.check_bounds(tid)?;
        let (flags, addr) = self.read_entry(tid)?;
        ensure!(
            flags & ENTRY_DELETED as i32 == 0,
            "tuple {} is already deleted",
            tid
        );
        if addr != 0 {
            self.tombstone(addr)?;
        }
        self.write_entry(tid, flags | ENTRY_DELETED as i32, 0)?;
        self.meta.deleted += 1;
        Ok(())
    }

    /// Stores payload bytes in the current append page, compacting or
    /// allocating a fresh slotted page as needed. Returns the address.
    fn store_payload(&mut self, bytes: &[u8]) -> Result<i64> {
        ensure!(
            bytes.len() <= MAX_PAYLOAD,
            "payload of {} bytes exceeds the single-page limit of {}",
            bytes.len(),
            MAX_PAYLOAD
        );

        let page_id = match self.append_page {
            Some(id) if self.page_fits(id, bytes.len())? => id,
            Some(id) => {
                self.compact(id)?;
                if self.page_fits(id, bytes.len())? {
                    id
                } else {
                    self.fresh_slotted_page()?
                }
            }
            None => self.fresh_slotted_page()?,
        };
        self.append_page = Some(page_id);

        let page = self.pool.get(page_id, Priority::Normal)?;
        let mut data = page.write();
        let slot_count = data.get_u16(SLOT_COUNT) as usize;
        let payload_end = data.get_u16(PAYLOAD_END) as usize;
        data.put_bytes(payload_end, bytes);
        let slot_offset = PAGE_SIZE - SLOT_ENTRY_SIZE * (slot_count + 1);
        data.put_u16(slot_offset, payload_end as u16);
        data.put_u16(slot_offset + 2, bytes.len() as u16);
        data.put_u16(SLOT_COUNT, (slot_count + 1) as u16);
        data.put_u16(PAYLOAD_END, (payload_end + bytes.len()) as u16);
        Ok(pack_address(page_id, slot_count as u16))
    }

    fn fresh_slotted_page(&mut self) -> Result<PageId> {
        let id = self.pool.with_disk(|disk| disk.allocate(None))?;
        let page = self.pool.get(id, Priority::Normal)?;
        let mut data = page.write();
        data.clear();
        data.set_tag(PageTag::Slotted);
        data.put_u16(SLOT_COUNT, 0);
        data.put_u16(PAYLOAD_END, SLOTTED_HEADER_SIZE as u16);
        Ok(id)
    }

    fn page_fits(&self, id: PageId, len: usize) -> Result<bool> {
        let page = self.pool.get(id, Priority::Normal)?;
        let data = page.read();
        let slot_count = data.get_u16(SLOT_COUNT) as usize;
        let payload_end = data.get_u16(PAYLOAD_END) as usize;
        let free = PAGE_SIZE
            .saturating_sub(SLOT_ENTRY_SIZE * (slot_count + 1))
            .saturating_sub(payload_end);
        Ok(free >= len)
    }

    fn tombstone(&self, addr: i64) -> Result<()> {
        let (page_id, slot) = unpack_address(addr)?;
        let page = self.pool.get(page_id, Priority::Normal)?;
        let mut data = page.write();
        let slot_offset = slot_entry_offset(&data, slot)?;
        data.put_u16(slot_offset, 0);
        data.put_u16(slot_offset + 2, 0);
        Ok(())
    }

    /// Rewrites live payloads tightly, keeping slot indexes stable.
    fn compact(&self, id: PageId) -> Result<()> {
        let page = self.pool.get(id, Priority::Normal)?;
        let mut data = page.write();
        let slot_count = data.get_u16(SLOT_COUNT) as usize;

        let mut live: Vec<(usize, usize, Vec<u8>)> = Vec::new();
        for slot in 0..slot_count {
            let slot_offset = PAGE_SIZE - SLOT_ENTRY_SIZE * (slot + 1);
            let offset = data.get_u16(slot_offset) as usize;
            let len = data.get_u16(slot_offset + 2) as usize;
            if len > 0 {
                live.push((slot, slot_offset, data.get_bytes(offset, len).to_vec()));
            }
        }

        let mut cursor = SLOTTED_HEADER_SIZE;
        for (_, slot_offset, bytes) in &live {
            data.put_bytes(cursor, bytes);
            data.put_u16(*slot_offset, cursor as u16);
            data.put_u16(slot_offset + 2, bytes.len() as u16);
            cursor += bytes.len();
        }
        data.put_u16(PAYLOAD_END, cursor as u16);
        Ok(())
    }

    fn write_header_page(&self) -> Result<()> {
        let mut header = ColumnHeader::new(self.ty, self.nullable);
        header.set_count(self.meta.count);
        header.set_deleted(self.meta.deleted);
        header.set_max_tuple_id(self.meta.max_tuple_id);
        header.set_append_page(self.append_page.unwrap_or(0));
        header.set_dir_tail(self.dirs.last().map(|d| d.page).unwrap_or(0));
        let page = self.pool.get(COLUMN_HEADER_PAGE, Priority::High)?;
        page.write().put_bytes(0, header.as_bytes());
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.write_header_page()?;
        self.pool.flush()?;
        self.pool.with_disk(|disk| disk.commit())?;
        self.committed = Snapshot {
            meta: self.meta,
            dirs: self.dirs.clone(),
            append_page: self.append_page,
        };
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.pool.discard_unpinned();
        self.pool.with_disk(|disk| disk.rollback())?;
        self.meta = self.committed.meta;
        self.dirs = self.committed.dirs.clone();
        self.append_page = self.committed.append_page;
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

#[inline]
fn pack_address(page: PageId, slot: u16) -> i64 {
    ((page << 16) | slot as u64) as i64
}

#[inline]
fn unpack_address(addr: i64) -> Result<(PageId, u16)> {
    ensure!(addr > 0, "invalid payload address {}", addr);
    Ok(((addr as u64) >> 16, (addr as u64 & 0xFFFF) as u16))
}

fn slot_entry_offset(data: &Page, slot: u16) -> Result<usize> {
    let slot_count = data.get_u16(SLOT_COUNT);
    ensure!(
        slot < slot_count,
        "slot {} out of bounds (page has {})",
        slot,
        slot_count
    );
    Ok(PAGE_SIZE - SLOT_ENTRY_SIZE * (slot as usize + 1))
}

fn read_slot(data: &Page, slot: u16) -> Result<(usize, usize)> {
    let slot_offset = slot_entry_offset(data, slot)?;
    Ok((
        data.get_u16(slot_offset) as usize,
        data.get_u16(slot_offset + 2) as usize,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::column::ColumnFile;
    use tempfile::TempDir;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn string(v: &str) -> Value {
        Value::String(v.to_string())
    }

    #[test]
    fn append_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("id.hare");
        let mut file =
            VariableColumnFile::create(&path, Type::String, false, &config()).unwrap();
        file.append(0, Some(&string("a"))).unwrap();
        file.append(1, Some(&string("longer value"))).unwrap();

        assert_eq!(file.read(0).unwrap(), Some(string("a")));
        assert_eq!(file.read(1).unwrap(), Some(string("longer value")));
        assert!(file.read(2).is_err());
    }

    #[test]
    fn delete_tombstones_and_flags() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("d.hare");
        let mut file =
            VariableColumnFile::create(&path, Type::String, false, &config()).unwrap();
        file.append(0, Some(&string("x"))).unwrap();
        file.append(1, Some(&string("y"))).unwrap();
        file.delete(0).unwrap();

        assert!(file.is_deleted(0).unwrap());
        assert!(!file.is_deleted(1).unwrap());
        assert_eq!(file.meta().live(), 1);
        assert_eq!(file.read(1).unwrap(), Some(string("y")));
    }

    #[test]
    fn update_relocates_payload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("u.hare");
        let mut file =
            VariableColumnFile::create(&path, Type::String, false, &config()).unwrap();
        file.append(0, Some(&string("short"))).unwrap();
        file.update(0, Some(&string("a considerably longer replacement")))
            .unwrap();
        assert_eq!(
            file.read(0).unwrap(),
            Some(string("a considerably longer replacement"))
        );
    }

    #[test]
    fn compaction_reclaims_space() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.hare");
        let mut file =
            VariableColumnFile::create(&path, Type::String, false, &config()).unwrap();

        // Fill a page, delete everything, and verify new payloads reuse it.
        let payload = "x".repeat(400);
        for tid in 0..9 {
            file.append(tid, Some(&string(&payload))).unwrap();
        }
        let pages_before = file.pool().with_disk(|d| d.pages());
        for tid in 0..9 {
            file.delete(tid).unwrap();
        }
        for tid in 9..18 {
            file.append(tid, Some(&string(&payload))).unwrap();
        }
        let pages_after = file.pool().with_disk(|d| d.pages());
        assert!(
            pages_after <= pages_before + 1,
            "compaction should have reused the tombstoned extents"
        );
    }

    #[test]
    fn nulls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("n.hare");
        let mut file = VariableColumnFile::create(&path, Type::String, true, &config()).unwrap();
        file.append(0, None).unwrap();
        file.append(1, Some(&string("v"))).unwrap();
        assert_eq!(file.read(0).unwrap(), None);
        assert_eq!(file.read(1).unwrap(), Some(string("v")));
    }

    #[test]
    fn directory_chain_growth_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chain.hare");
        let mut file =
            VariableColumnFile::create(&path, Type::String, false, &config()).unwrap();
        let n = DIR_CAPACITY + 10;
        for tid in 0..n {
            file.append(tid, Some(&string(&format!("v{}", tid)))).unwrap();
        }
        assert_eq!(file.dirs.len(), 2);
        file.commit().unwrap();
        file.close().unwrap();

        let reopened = ColumnFile::open(&path, &config()).unwrap();
        assert_eq!(reopened.meta().count, n);
        assert_eq!(reopened.read(0).unwrap(), Some(string("v0")));
        assert_eq!(
            reopened.read(n - 1).unwrap(),
            Some(string(&format!("v{}", n - 1)))
        );
    }

    #[test]
    fn uncommitted_tail_hidden_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tail.hare");
        let mut file =
            VariableColumnFile::create(&path, Type::String, false, &config()).unwrap();
        file.append(0, Some(&string("committed"))).unwrap();
        file.commit().unwrap();
        file.append(1, Some(&string("uncommitted"))).unwrap();
        file.close().unwrap();

        let reopened = ColumnFile::open(&path, &config()).unwrap();
        assert_eq!(reopened.meta().count, 1);
        assert_eq!(reopened.read(0).unwrap(), Some(string("committed")));
    }
}
