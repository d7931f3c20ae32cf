//! # Engine Configuration
//!
//! Centralized constants and the runtime [`EngineConfig`]. Interdependent
//! values live together so a change to one is visible next to the values
//! that depend on it.
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> PAGE_SHIFT (12, used for page-id → file-position arithmetic)
//!       │
//!       ├─> FILE_HEADER_SIZE (64 bytes at the start of page 1)
//!       │
//!       └─> WAL_FRAME_SIZE (WAL_FRAME_HEADER_SIZE + PAGE_SIZE)
//!
//! DEFAULT_BUFFER_POOL_SIZE (64 frames)
//!       │
//!       └─> must be >= 2: a column operation can hold the column header
//!           page pinned while pulling a data page
//! ```

use std::time::Duration;

/// Size of a single page in bytes. The unit of all file I/O.
pub const PAGE_SIZE: usize = 4096;

/// `page_id << PAGE_SHIFT` is the byte position of a page in its file.
pub const PAGE_SHIFT: u32 = 12;

const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

/// Bytes reserved for the file header at the start of the header page.
pub const FILE_HEADER_SIZE: usize = 64;

/// Number of frames in a column file's buffer pool.
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 64;

const _: () = assert!(DEFAULT_BUFFER_POOL_SIZE >= 2);

/// Bound on the number of physical plan trees kept in the planner cache.
pub const DEFAULT_PLAN_CACHE_SIZE: usize = 100;

/// Documents an inverted-text index writer buffers before a forced flush.
pub const TEXT_WRITER_BUFFER_LIMIT: usize = 100_000;

/// Quantization cells per dimension in a VA-file signature (fits in a u8).
pub const VAF_CELLS_PER_DIMENSION: usize = 32;

/// Tuples below which ranged partitioning of a scan is never worthwhile.
pub const MIN_PARTITION_ROWS: u64 = 4096;

/// Runtime configuration for an engine instance.
///
/// All deadlines are upper bounds; expiry raises `DbError::Timeout` (pool
/// eviction polls) or `DbError::FileLocked` / lock-timeout errors at the
/// respective acquisition sites.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Frames per buffer pool.
    pub buffer_pool_size: usize,
    /// Deadline for acquiring the advisory file lock on open.
    pub file_lock_timeout: Duration,
    /// Deadline for logical DBO lock acquisition.
    pub lock_timeout: Duration,
    /// Deadline for a buffer-pool eviction poll.
    pub eviction_timeout: Duration,
    /// Upper bound on kNN fullscan worker threads.
    pub io_parallelism: usize,
    /// Entries in the planner's LRU plan cache.
    pub plan_cache_size: usize,
    /// Route column-file page writes through the write-ahead log.
    pub use_wal: bool,
    /// Fsync data files on commit.
    pub sync_on_commit: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            file_lock_timeout: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(10),
            eviction_timeout: Duration::from_secs(5),
            io_parallelism: 4,
            plan_cache_size: DEFAULT_PLAN_CACHE_SIZE,
            use_wal: false,
            sync_on_commit: true,
        }
    }
}

impl EngineConfig {
    pub fn with_wal(mut self) -> Self {
        self.use_wal = true;
        self
    }

    pub fn buffer_pool_size(mut self, frames: usize) -> Self {
        self.buffer_pool_size = frames.max(2);
        self
    }

    pub fn io_parallelism(mut self, workers: usize) -> Self {
        self.io_parallelism = workers.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_shift_matches_page_size() {
        assert_eq!(1usize << PAGE_SHIFT, PAGE_SIZE);
    }

    #[test]
    fn pool_size_floor_is_two() {
        let config = EngineConfig::default().buffer_pool_size(0);
        assert_eq!(config.buffer_pool_size, 2);
    }

    #[test]
    fn vaf_cells_fit_in_signature_byte() {
        assert!(VAF_CELLS_PER_DIMENSION <= u8::MAX as usize + 1);
    }
}
