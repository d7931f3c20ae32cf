//! # Buffer Pool
//!
//! A fixed-capacity set of page frames over a [`DiskManager`]. `get` pins a
//! page into a frame and hands out a [`PageRef`]; dropping the ref unpins.
//! Frames whose pin count reaches zero become eviction candidates.
//!
//! ## Eviction
//!
//! Eviction policy is pluggable through [`EvictionQueue`]: the pool offers
//! a candidate when a frame's pin count falls to zero, removes it when the
//! frame is re-pinned, and polls for a victim on a miss with no free frame.
//! [`LruEvictionQueue`] orders candidates by `(priority, last_access,
//! accessed)`: low-priority, least-recently, least-often used pages go
//! first. A poll that finds no victim parks on a condvar until a pin is
//! released or the configured deadline expires (`DbError::Timeout`).
//!
//! ## Concurrency
//!
//! The frame table and queue sit behind one mutex; page contents behind a
//! per-frame `RwLock`, so multiple readers share a pinned page while a
//! writer takes the frame latch exclusively. The pool offers no snapshot
//! isolation: a reader that re-pulls a page sees the latest committed bytes
//! plus its own transaction's writes (cross-transaction writers are held
//! apart by the entity locks above this layer).

use crate::error::DbError;
use crate::storage::disk::DiskManager;
use crate::storage::page::{Page, PageId};
use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pin priority; higher priorities survive eviction pressure longer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Priority {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Priority::Low,
            2 => Priority::High,
            _ => Priority::Normal,
        }
    }
}

/// Snapshot of a frame's eviction-relevant state at unpin time.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub frame: usize,
    pub priority: Priority,
    pub last_access: u64,
    pub accessed: u64,
}

pub trait EvictionQueue: Send {
    fn offer_candidate(&mut self, candidate: Candidate);
    fn remove_candidate(&mut self, frame: usize);
    /// Picks and removes the next victim, or `None` if no frame is
    /// currently disposable.
    fn poll(&mut self) -> Option<usize>;
}

/// Priority-aware LRU: victims ordered by `(priority, last_access,
/// accessed)`, smallest first.
#[derive(Default)]
pub struct LruEvictionQueue {
    candidates: Vec<Candidate>,
}

impl LruEvictionQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EvictionQueue for LruEvictionQueue {
    fn offer_candidate(&mut self, candidate: Candidate) {
        self.remove_candidate(candidate.frame);
        self.candidates.push(candidate);
    }

    fn remove_candidate(&mut self, frame: usize) {
        self.candidates.retain(|c| c.frame != frame);
    }

    fn poll(&mut self) -> Option<usize> {
        let best = self
            .candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| (c.priority, c.last_access, c.accessed))
            .map(|(i, _)| i)?;
        Some(self.candidates.swap_remove(best).frame)
    }
}

struct Frame {
    data: RwLock<Page>,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    priority: AtomicU8,
    accessed: AtomicU64,
    last_access: AtomicU64,
}

impl Frame {
    fn new() -> Self {
        Self {
            data: RwLock::new(Page::new()),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            priority: AtomicU8::new(Priority::Normal as u8),
            accessed: AtomicU64::new(0),
            last_access: AtomicU64::new(0),
        }
    }

    fn candidate(&self, frame: usize) -> Candidate {
        Candidate {
            frame,
            priority: Priority::from_u8(self.priority.load(Ordering::Relaxed)),
            last_access: self.last_access.load(Ordering::Relaxed),
            accessed: self.accessed.load(Ordering::Relaxed),
        }
    }
}

struct PoolState {
    map: HashMap<PageId, usize>,
    bound: Vec<Option<PageId>>,
    free: Vec<usize>,
    queue: Box<dyn EvictionQueue>,
}

struct PoolInner {
    disk: Mutex<Box<dyn DiskManager>>,
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    released: Condvar,
    eviction_timeout: Duration,
    clock: AtomicU64,
}

/// Shared handle to a buffer pool; clones refer to the same frames.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(disk: Box<dyn DiskManager>, capacity: usize, eviction_timeout: Duration) -> Self {
        Self::with_queue(disk, capacity, eviction_timeout, Box::new(LruEvictionQueue::new()))
    }

    pub fn with_queue(
        disk: Box<dyn DiskManager>,
        capacity: usize,
        eviction_timeout: Duration,
        queue: Box<dyn EvictionQueue>,
    ) -> Self {
        let capacity = capacity.max(2);
        let frames = (0..capacity).map(|_| Frame::new()).collect();
        Self {
            inner: Arc::new(PoolInner {
                disk: Mutex::new(disk),
                frames,
                state: Mutex::new(PoolState {
                    map: HashMap::with_capacity(capacity),
                    bound: vec![None; capacity],
                    free: (0..capacity).rev().collect(),
                    queue,
                }),
                released: Condvar::new(),
                eviction_timeout,
                clock: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.frames.len()
    }

    /// Pins a page into a frame, evicting if necessary.
    pub fn get(&self, id: PageId, priority: Priority) -> Result<PageRef> {
        let inner = &self.inner;
        let mut state = inner.state.lock();

        if let Some(&idx) = state.map.get(&id) {
            let frame = &inner.frames[idx];
            let previous = frame.pin_count.fetch_add(1, Ordering::AcqRel);
            if previous == 0 {
                state.queue.remove_candidate(idx);
            }
            self.touch(frame, priority);
            return Ok(PageRef {
                pool: Arc::clone(inner),
                frame: idx,
                page_id: id,
            });
        }

        let idx = self.take_frame(&mut state)?;
        let frame = &inner.frames[idx];
        {
            let mut data = frame.data.write();
            inner.disk.lock().read(id, &mut data)?;
        }
        frame.pin_count.store(1, Ordering::Release);
        frame.dirty.store(false, Ordering::Release);
        frame.accessed.store(0, Ordering::Relaxed);
        frame.priority.store(priority as u8, Ordering::Relaxed);
        self.touch(frame, priority);
        state.bound[idx] = Some(id);
        state.map.insert(id, idx);
        Ok(PageRef {
            pool: Arc::clone(inner),
            frame: idx,
            page_id: id,
        })
    }

    /// Loads a page into a free frame without pinning. A no-op when the
    /// page is resident or when loading would require an eviction.
    pub fn prefetch(&self, id: PageId) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.map.contains_key(&id) {
            return Ok(());
        }
        let Some(idx) = state.free.pop() else {
            return Ok(());
        };
        let frame = &inner.frames[idx];
        {
            let mut data = frame.data.write();
            inner.disk.lock().read(id, &mut data)?;
        }
        frame.pin_count.store(0, Ordering::Release);
        frame.dirty.store(false, Ordering::Release);
        state.bound[idx] = Some(id);
        state.map.insert(id, idx);
        let candidate = frame.candidate(idx);
        state.queue.offer_candidate(candidate);
        Ok(())
    }

    /// Writes every dirty resident page back to the disk manager.
    pub fn flush(&self) -> Result<()> {
        let inner = &self.inner;
        let state = inner.state.lock();
        let mut disk = inner.disk.lock();
        for (&id, &idx) in state.map.iter() {
            let frame = &inner.frames[idx];
            if frame.dirty.swap(false, Ordering::AcqRel) {
                let data = frame.data.read();
                disk.update(id, &data)?;
            }
        }
        Ok(())
    }

    /// Drops every unpinned frame binding, forcing subsequent reads back
    /// through the disk manager. Dirty frames are discarded, not written.
    pub fn discard_unpinned(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let mut unbound = Vec::new();
        for (&id, &idx) in state.map.iter() {
            let frame = &inner.frames[idx];
            if frame.pin_count.load(Ordering::Acquire) == 0 {
                frame.dirty.store(false, Ordering::Release);
                unbound.push((id, idx));
            }
        }
        for (id, idx) in unbound {
            state.map.remove(&id);
            state.bound[idx] = None;
            state.queue.remove_candidate(idx);
            state.free.push(idx);
        }
    }

    pub fn flush_and_close(&self) -> Result<()> {
        self.flush()?;
        self.inner.disk.lock().close()
    }

    /// Direct access to the underlying disk manager (allocation, commit,
    /// checksum). Pool contents stay valid across these calls.
    pub fn with_disk<R>(&self, f: impl FnOnce(&mut dyn DiskManager) -> R) -> R {
        let mut disk = self.inner.disk.lock();
        f(disk.as_mut())
    }

    fn touch(&self, frame: &Frame, priority: Priority) {
        let now = self.inner.clock.fetch_add(1, Ordering::Relaxed);
        frame.last_access.store(now, Ordering::Relaxed);
        frame.accessed.fetch_add(1, Ordering::Relaxed);
        let current = frame.priority.load(Ordering::Relaxed);
        if (priority as u8) > current {
            frame.priority.store(priority as u8, Ordering::Relaxed);
        }
    }

    /// Finds a frame for a new binding: a free one, or an evicted victim.
    /// Parks until a pin is released when everything is pinned.
    fn take_frame(&self, state: &mut parking_lot::MutexGuard<'_, PoolState>) -> Result<usize> {
        let inner = &self.inner;
        if let Some(idx) = state.free.pop() {
            return Ok(idx);
        }
        let deadline = Instant::now() + inner.eviction_timeout;
        loop {
            if let Some(idx) = state.queue.poll() {
                let frame = &inner.frames[idx];
                debug_assert_eq!(frame.pin_count.load(Ordering::Acquire), 0);
                if let Some(old) = state.bound[idx].take() {
                    if frame.dirty.swap(false, Ordering::AcqRel) {
                        let data = frame.data.read();
                        inner.disk.lock().update(old, &data)?;
                    }
                    state.map.remove(&old);
                }
                return Ok(idx);
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            ensure!(
                !timeout.is_zero(),
                DbError::Timeout("waiting for a disposable buffer frame".into())
            );
            inner.released.wait_for(state, timeout);
        }
    }
}

/// Pinned reference to a resident page. Dropping releases the pin.
pub struct PageRef {
    pool: Arc<PoolInner>,
    frame: usize,
    page_id: PageId,
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("frame", &self.frame)
            .field("page_id", &self.page_id)
            .finish()
    }
}

impl PageRef {
    pub fn id(&self) -> PageId {
        self.page_id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.pool.frames[self.frame].data.read()
    }

    /// Exclusive latch on the frame; marks it dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        let frame = &self.pool.frames[self.frame];
        frame.dirty.store(true, Ordering::Release);
        frame.data.write()
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        let mut state = self.pool.state.lock();
        let frame = &self.pool.frames[self.frame];
        let previous = frame.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "unpin of unpinned frame");
        if previous == 1 {
            let candidate = frame.candidate(self.frame);
            state.queue.offer_candidate(candidate);
            self.pool.released.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::DirectDiskManager;
    use crate::storage::header::FileType;
    use tempfile::TempDir;

    fn pool_with_pages(dir: &TempDir, capacity: usize, pages: usize) -> BufferPool {
        let path = dir.path().join("pool.hare");
        let mut disk = DirectDiskManager::create(&path, FileType::FixedColumn).unwrap();
        for _ in 0..pages {
            disk.allocate(None).unwrap();
        }
        disk.commit().unwrap();
        BufferPool::new(Box::new(disk), capacity, Duration::from_millis(200))
    }

    #[test]
    fn get_pins_and_rereads() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_pages(&dir, 4, 2);

        let page = pool.get(2, Priority::Normal).unwrap();
        page.write().put_u64(32, 77);
        drop(page);

        let again = pool.get(2, Priority::Normal).unwrap();
        assert_eq!(again.read().get_u64(32), 77);
    }

    #[test]
    fn eviction_writes_back_dirty_pages() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_pages(&dir, 2, 4);

        {
            let page = pool.get(2, Priority::Normal).unwrap();
            page.write().put_u64(8, 0xC0FFEE);
        }
        // Fill the pool so frame for page 2 must be evicted.
        let _a = pool.get(3, Priority::Normal).unwrap();
        let _b = pool.get(4, Priority::Normal).unwrap();
        let _c = pool.get(5, Priority::Normal).unwrap();

        // The write-back must be visible through the raw channel.
        pool.with_disk(|disk| {
            let mut page = Page::new();
            disk.read(2, &mut page).unwrap();
            assert_eq!(page.get_u64(8), 0xC0FFEE);
        });
    }

    #[test]
    fn all_pinned_times_out() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_pages(&dir, 2, 3);
        let _a = pool.get(2, Priority::Normal).unwrap();
        let _b = pool.get(3, Priority::Normal).unwrap();

        let err = pool.get(4, Priority::Normal).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DbError>(),
            Some(DbError::Timeout(_))
        ));
    }

    #[test]
    fn release_unblocks_waiter() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_pages(&dir, 2, 3);
        let a = pool.get(2, Priority::Normal).unwrap();
        let _b = pool.get(3, Priority::Normal).unwrap();

        let pool2 = pool.clone();
        let handle = std::thread::spawn(move || pool2.get(4, Priority::Normal).map(|r| r.id()));
        std::thread::sleep(Duration::from_millis(30));
        drop(a);
        assert_eq!(handle.join().unwrap().unwrap(), 4);
    }

    #[test]
    fn lru_priority_ordering() {
        let mut queue = LruEvictionQueue::new();
        queue.offer_candidate(Candidate {
            frame: 0,
            priority: Priority::High,
            last_access: 1,
            accessed: 1,
        });
        queue.offer_candidate(Candidate {
            frame: 1,
            priority: Priority::Low,
            last_access: 9,
            accessed: 5,
        });
        queue.offer_candidate(Candidate {
            frame: 2,
            priority: Priority::Normal,
            last_access: 2,
            accessed: 3,
        });

        assert_eq!(queue.poll(), Some(1), "low priority goes first");
        assert_eq!(queue.poll(), Some(2));
        assert_eq!(queue.poll(), Some(0));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn flush_persists_without_eviction() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_pages(&dir, 4, 2);
        {
            let page = pool.get(3, Priority::Normal).unwrap();
            page.write().put_u64(0, 11);
        }
        pool.flush().unwrap();
        pool.with_disk(|disk| {
            let mut page = Page::new();
            disk.read(3, &mut page).unwrap();
            assert_eq!(page.get_u64(0), 11);
        });
    }
}
