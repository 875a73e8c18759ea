use std::path::PathBuf;

pub const DEFAULT_CACHE_SIZE_MB: u64 = 200;
pub const DEFAULT_DISK_CACHE_DIR: &str = "/tmp/bucketfs_cache";
pub const DEFAULT_PREFETCH_SIZE: usize = 256 * 1024;
pub const DEFAULT_META_CAPACITY: usize = 10_000;
pub const DEFAULT_TRANSFER_BUFFERS: usize = 8;
pub const DEFAULT_TRANSFER_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Immutable configuration snapshot built once from the CLI and handed to
/// the cache and the binding at construction.
#[derive(Debug, Clone)]
pub struct Options {
    /// Hard in-memory budget for cached page data, in bytes.
    pub max_cache_size: u64,
    /// Scratch directory receiving pages spilled from memory.
    pub disk_cache_dir: PathBuf,
    /// Read-ahead granularity the binding uses to coalesce miss downloads.
    pub prefetch_size: usize,
    /// When false, a write that cannot fit in memory fails instead of
    /// spilling to the scratch directory.
    pub allow_disk_spill: bool,
    /// When true, chmod/chown/utimens succeed without touching metadata.
    pub nullable_meta: bool,
    /// Entry bound of the detached file metadata LRU.
    pub meta_capacity: usize,
    /// Number of pooled transfer staging buffers.
    pub transfer_buffers: usize,
    /// Size of each pooled transfer staging buffer, in bytes.
    pub transfer_buffer_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_CACHE_SIZE_MB * 1024 * 1024,
            disk_cache_dir: PathBuf::from(DEFAULT_DISK_CACHE_DIR),
            prefetch_size: DEFAULT_PREFETCH_SIZE,
            allow_disk_spill: true,
            nullable_meta: true,
            meta_capacity: DEFAULT_META_CAPACITY,
            transfer_buffers: DEFAULT_TRANSFER_BUFFERS,
            transfer_buffer_size: DEFAULT_TRANSFER_BUFFER_SIZE,
        }
    }
}
