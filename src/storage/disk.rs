//! # Disk Managers
//!
//! A disk manager owns one page file: it reads and updates pages through an
//! explicit file channel (no caching of its own), allocates and frees pages,
//! and maintains the file header across commit, rollback and recovery.
//!
//! Two interchangeable implementations exist: [`DirectDiskManager`] here,
//! which writes every update synchronously, and the write-ahead-logging
//! variant in [`super::wal`].
//!
//! ## Allocation & freelist
//!
//! `allocate` returns the lowest freed page id if any exist, otherwise it
//! appends to the file. Freed pages form an intrusive chain on disk: each
//! freed page stores the id of the next freed page, the head lives in the
//! file header. The in-memory freelist is an ordered set; the chain is
//! rewritten in ascending order on commit so "lowest first" survives reopen.
//!
//! ## Consistency protocol
//!
//! The first mutation after open or commit rewrites the header with
//! `consistency = CHECK`. Commit writes the freelist chain, recomputes the
//! CRC32C over all data pages, and rewrites the header with `OK` before
//! fsyncing. A file that opens with `CHECK` goes through a recovery scan; a
//! checksum mismatch under `OK` is fatal `DataCorruption`.
//!
//! Rollback reverts the in-memory header counters and freelist to the last
//! committed snapshot. Page bytes written since then stay in the file; the
//! layers above keep their tuple counters in committed header pages, which
//! makes such residue unreachable.

use crate::config::{PAGE_SIZE, PAGE_SHIFT};
use crate::error::DbError;
use crate::storage::header::{FileHeader, FileType, CRC32C};
use crate::storage::page::{page_position, Page, PageId, PageTag};
use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use zerocopy::IntoBytes;

/// Offset within a freed page where the next-chain pointer lives.
const FREED_NEXT_OFFSET: usize = 8;

pub trait DiskManager: Send {
    /// Reads a page, bypassing any caching layer.
    fn read(&self, id: PageId, page: &mut Page) -> Result<()>;
    /// Writes a page, bypassing any caching layer.
    fn update(&mut self, id: PageId, page: &Page) -> Result<()>;
    /// Returns the lowest freed page id, or appends a fresh page.
    fn allocate(&mut self, content: Option<&Page>) -> Result<PageId>;
    /// Pushes a page onto the freelist.
    fn free(&mut self, id: PageId) -> Result<()>;
    /// Page count including the header page.
    fn pages(&self) -> u64;
    fn freed_count(&self) -> u32;
    fn file_type(&self) -> FileType;
    /// Persists the header with `consistency = OK` and fsyncs.
    fn commit(&mut self) -> Result<()>;
    /// Reverts in-memory counters to the last committed snapshot.
    fn rollback(&mut self) -> Result<()>;
    /// CRC32C over all data pages (id >= 2) as currently on disk.
    fn calculate_checksum(&self) -> Result<u64>;
    /// True iff the stored checksum matches [`Self::calculate_checksum`].
    fn validate(&self) -> Result<bool>;
    /// Rewrites the header for a clean close and releases the file lock.
    fn close(&mut self) -> Result<()>;
    /// Closes without a header rewrite and removes the file.
    fn delete_file(&mut self) -> Result<()>;
    fn path(&self) -> &Path;
}

/// Advisory lock on a page file. Held for the lifetime of the manager;
/// released when dropped.
pub struct FileLock {
    #[allow(dead_code)]
    file: File,
}

impl FileLock {
    /// Acquires an exclusive advisory lock, retrying until `timeout`.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open {} for locking", path.display()))?;
        let deadline = Instant::now() + timeout;
        loop {
            if Self::try_lock(&file)? {
                return Ok(Self { file });
            }
            if Instant::now() >= deadline {
                return Err(DbError::FileLocked(path.display().to_string()).into());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> Result<bool> {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Ok(false)
        } else {
            Err(err).wrap_err("flock failed")
        }
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}

/// Committed snapshot the manager can revert to on rollback.
#[derive(Clone)]
struct Snapshot {
    header: FileHeader,
    freelist: BTreeSet<PageId>,
}

pub struct DirectDiskManager {
    path: PathBuf,
    file: Mutex<File>,
    _lock: FileLock,
    header: FileHeader,
    freelist: BTreeSet<PageId>,
    committed: Snapshot,
    dirty: bool,
    closed: bool,
    sync_on_commit: bool,
}

impl std::fmt::Debug for DirectDiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectDiskManager")
            .field("path", &self.path)
            .field("dirty", &self.dirty)
            .field("closed", &self.closed)
            .finish()
    }
}

impl DirectDiskManager {
    /// Creates a new page file. Fails if the path already exists.
    pub fn create(path: &Path, file_type: FileType) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create page file {}", path.display()))?;

        // Page 0 is reserved; the file always spans it plus the header page.
        file.set_len(2 * PAGE_SIZE as u64)?;
        let header = FileHeader::new(file_type);
        write_header(&mut file, &header)?;
        file.sync_all()?;

        let lock = FileLock::acquire(path, Duration::from_secs(1))?;
        let committed = Snapshot {
            header,
            freelist: BTreeSet::new(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            _lock: lock,
            header,
            freelist: BTreeSet::new(),
            committed,
            dirty: true,
            closed: false,
            sync_on_commit: true,
        })
    }

    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self> {
        let lock = FileLock::acquire(path, lock_timeout)?;
        Self::open_locked(path, lock)
    }

    /// Opens a page file whose advisory lock the caller already holds.
    pub(crate) fn open_locked(path: &Path, lock: FileLock) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open page file {}", path.display()))?;

        let mut header_page = Page::new();
        read_page_raw(&mut file, 1, &mut header_page)?;
        let header = *FileHeader::from_bytes(header_page.as_slice())?;

        let stored = header.checksum();
        let actual = checksum_pages(&mut file, header.pages())?;
        let needs_recovery = !header.consistency_ok();
        if stored != actual && !needs_recovery {
            return Err(DbError::DataCorruption(
                path.display().to_string(),
                format!("checksum mismatch: stored {:#x}, computed {:#x}", stored, actual),
            )
            .into());
        }

        let mut manager = Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            _lock: lock,
            header,
            freelist: BTreeSet::new(),
            committed: Snapshot {
                header,
                freelist: BTreeSet::new(),
            },
            dirty: false,
            closed: false,
            sync_on_commit: true,
        };
        manager.load_freelist()?;
        manager.committed.freelist = manager.freelist.clone();

        if needs_recovery {
            manager.recover()?;
        }
        Ok(manager)
    }

    /// Recovery scan for a file that was not cleanly closed: the freelist
    /// chain is validated (already loaded defensively), the checksum is
    /// recomputed from the surviving page images, and the header is
    /// rewritten clean. Uncommitted tail bytes stay in the file; the layers
    /// above hide them behind their committed counters.
    fn recover(&mut self) -> Result<()> {
        let checksum = self.calculate_checksum()?;
        self.header.set_checksum(checksum);
        self.header.set_consistency(true);
        {
            let mut file = self.file.lock();
            write_header(&mut file, &self.header)?;
            file.sync_all()?;
        }
        self.committed.header = self.header;
        self.committed.freelist = self.freelist.clone();
        self.dirty = false;
        Ok(())
    }

    fn load_freelist(&mut self) -> Result<()> {
        self.freelist.clear();
        let mut next = self.header.freelist_head_page();
        let mut remaining = self.header.freed() as u64 + 1;
        let mut page = Page::new();
        while let Some(id) = next {
            if remaining == 0 {
                // Chain longer than the freed counter: broken link or cycle.
                break;
            }
            remaining -= 1;
            if id < 2 || id > self.header.pages() || self.freelist.contains(&id) {
                break;
            }
            {
                let mut file = self.file.lock();
                read_page_raw(&mut file, id, &mut page)?;
            }
            if page.tag() != PageTag::Freed {
                break;
            }
            self.freelist.insert(id);
            next = match page.get_u64(FREED_NEXT_OFFSET) {
                0 => None,
                n => Some(n),
            };
        }
        Ok(())
    }

    /// Writes the freelist chain in ascending order and returns the head.
    fn persist_freelist(&self, freelist: &BTreeSet<PageId>) -> Result<Option<PageId>> {
        let ids: Vec<PageId> = freelist.iter().copied().collect();
        let mut page = Page::new();
        let mut file = self.file.lock();
        for (i, id) in ids.iter().enumerate() {
            page.clear();
            page.set_tag(PageTag::Freed);
            let next = ids.get(i + 1).copied().unwrap_or(0);
            page.put_u64(FREED_NEXT_OFFSET, next);
            write_page_raw(&mut file, *id, &page)?;
        }
        Ok(ids.first().copied())
    }

    fn check_open(&self) -> Result<()> {
        ensure!(!self.closed, "disk manager for {} is closed", self.path.display());
        Ok(())
    }

    fn mark_dirty(&mut self) -> Result<()> {
        if !self.dirty {
            self.dirty = true;
            self.header.set_consistency(false);
            let mut file = self.file.lock();
            write_header(&mut file, &self.header)?;
        }
        Ok(())
    }

    fn persist_committed_state(&mut self) -> Result<()> {
        let head = self.persist_freelist(&self.committed.freelist.clone())?;
        let mut header = self.committed.header;
        header.set_freelist_head_page(head);
        header.set_freed(self.committed.freelist.len() as u32);
        let checksum = self.calculate_checksum()?;
        header.set_checksum(checksum);
        header.set_consistency(true);
        {
            let mut file = self.file.lock();
            write_header(&mut file, &header)?;
            if self.sync_on_commit {
                file.sync_all()?;
            }
        }
        self.committed.header = header;
        self.header = header;
        self.freelist = self.committed.freelist.clone();
        self.dirty = false;
        Ok(())
    }
}

impl DiskManager for DirectDiskManager {
    fn read(&self, id: PageId, page: &mut Page) -> Result<()> {
        self.check_open()?;
        ensure!(
            id >= 1 && id <= self.header.pages(),
            "page id {} out of bounds (1..={})",
            id,
            self.header.pages()
        );
        let mut file = self.file.lock();
        read_page_raw(&mut file, id, page)
    }

    fn update(&mut self, id: PageId, page: &Page) -> Result<()> {
        self.check_open()?;
        ensure!(
            id >= 1 && id <= self.header.pages(),
            "page id {} out of bounds (1..={})",
            id,
            self.header.pages()
        );
        self.mark_dirty()?;
        let mut file = self.file.lock();
        write_page_raw(&mut file, id, page)
    }

    fn allocate(&mut self, content: Option<&Page>) -> Result<PageId> {
        self.check_open()?;
        self.mark_dirty()?;
        let id = if let Some(lowest) = self.freelist.iter().next().copied() {
            self.freelist.remove(&lowest);
            lowest
        } else {
            let id = self.header.pages() + 1;
            self.header.set_pages(id);
            let mut file = self.file.lock();
            file.set_len((id + 1) << PAGE_SHIFT)?;
            id
        };
        let mut file = self.file.lock();
        match content {
            Some(page) => write_page_raw(&mut file, id, page)?,
            None => write_page_raw(&mut file, id, &Page::new())?,
        }
        Ok(id)
    }

    fn free(&mut self, id: PageId) -> Result<()> {
        self.check_open()?;
        ensure!(
            id >= 2 && id <= self.header.pages(),
            "cannot free page {} (data pages are 2..={})",
            id,
            self.header.pages()
        );
        ensure!(!self.freelist.contains(&id), "page {} is already freed", id);
        self.mark_dirty()?;
        self.freelist.insert(id);
        Ok(())
    }

    fn pages(&self) -> u64 {
        self.header.pages()
    }

    fn freed_count(&self) -> u32 {
        self.freelist.len() as u32
    }

    fn file_type(&self) -> FileType {
        self.header.file_type_of().expect("validated on open")
    }

    fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.committed = Snapshot {
            header: self.header,
            freelist: self.freelist.clone(),
        };
        self.persist_committed_state()
    }

    fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        self.header = self.committed.header;
        self.freelist = self.committed.freelist.clone();
        self.dirty = false;
        Ok(())
    }

    fn calculate_checksum(&self) -> Result<u64> {
        self.check_open()?;
        let mut file = self.file.lock();
        checksum_pages(&mut file, self.header.pages())
    }

    fn validate(&self) -> Result<bool> {
        Ok(self.header.checksum() == self.calculate_checksum()?)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        // A clean close persists the committed state: uncommitted counter
        // changes are discarded, the chain is rewritten, the header leaves
        // with `consistency = OK`.
        self.persist_committed_state()?;
        self.closed = true;
        Ok(())
    }

    fn delete_file(&mut self) -> Result<()> {
        self.closed = true;
        std::fs::remove_file(&self.path)
            .wrap_err_with(|| format!("failed to delete {}", self.path.display()))
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn read_page_raw(file: &mut File, id: PageId, page: &mut Page) -> Result<()> {
    file.seek(SeekFrom::Start(page_position(id)))?;
    file.read_exact(page.as_mut_slice())
        .wrap_err_with(|| format!("failed to read page {}", id))
}

fn write_page_raw(file: &mut File, id: PageId, page: &Page) -> Result<()> {
    file.seek(SeekFrom::Start(page_position(id)))?;
    file.write_all(page.as_slice())
        .wrap_err_with(|| format!("failed to write page {}", id))
}

fn write_header(file: &mut File, header: &FileHeader) -> Result<()> {
    let mut page = Page::new();
    page.put_bytes(0, header.as_bytes());
    write_page_raw(file, 1, &page)
}

/// CRC32C over every data page (2..=pages). The header page is excluded
/// because it embeds the digest.
fn checksum_pages(file: &mut File, pages: u64) -> Result<u64> {
    let mut digest = CRC32C.digest();
    let mut page = Page::new();
    for id in 2..=pages {
        read_page_raw(file, id, &mut page)?;
        digest.update(page.as_slice());
    }
    Ok(digest.finalize() as u64)
}
