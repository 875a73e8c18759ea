use crate::config::Options;
use crate::data::file::{File, MissRange};
use crate::data::lru::{LruList, SlotId};
use crate::data::tree::DirectoryTree;
use crate::error::{DataError, DataResult};
use crate::scratch;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct CacheInner {
    size: u64,
    list: LruList<(String, Arc<File>)>,
    index: HashMap<String, SlotId>,
}

/// Process-wide bounded map from file id to [`File`], ordered by recency.
///
/// A single mutex guards the LRU order, the id index, and the global size
/// counter; it stays held across eviction and the handoff into
/// `File::write` so the memory accounting moves atomically. File handles
/// escape only as `Arc`s created under this lock.
pub struct Cache {
    capacity: u64,
    disk_cache_dir: PathBuf,
    allow_disk_spill: bool,
    inner: Mutex<CacheInner>,
}

impl Cache {
    pub fn new(options: &Options) -> Self {
        Self {
            capacity: options.max_cache_size,
            disk_cache_dir: options.disk_cache_dir.clone(),
            allow_disk_spill: options.allow_disk_spill,
            inner: Mutex::new(CacheInner {
                size: 0,
                list: LruList::new(),
                index: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn num_files(&self) -> usize {
        self.inner.lock().list.len()
    }

    pub fn has_file(&self, fid: &str) -> bool {
        self.inner.lock().index.contains_key(fid)
    }

    /// Look up a file and mark it most recently used.
    pub fn find_file(&self, fid: &str) -> Option<Arc<File>> {
        let mut inner = self.inner.lock();
        let id = *inner.index.get(fid)?;
        inner.list.touch(id);
        Some(inner.list.get(id).1.clone())
    }

    pub fn file_size(&self, fid: &str) -> u64 {
        let inner = self.inner.lock();
        match inner.index.get(fid) {
            Some(&id) => inner.list.get(id).1.size(),
            None => 0,
        }
    }

    /// Return the file for `fid`, creating an empty one if absent.
    pub fn make_file(&self, fid: &str) -> Arc<File> {
        let mut inner = self.inner.lock();
        Self::file_at_front_locked(&mut inner, fid)
    }

    /// Read through the cache. Returns bytes copied into `out`, the ranges
    /// no page covers, and the cached file's logical size (0 when the file
    /// is not resident). The caller resolves misses against the backing
    /// store and feeds them back through `write`.
    pub fn read(
        &self,
        fid: &str,
        off: u64,
        len: usize,
        out: &mut [u8],
    ) -> DataResult<(usize, Vec<MissRange>, u64)> {
        let file = {
            let mut inner = self.inner.lock();
            match inner.index.get(fid) {
                Some(&id) => {
                    inner.list.touch(id);
                    Some(inner.list.get(id).1.clone())
                }
                None => None,
            }
        };
        match file {
            Some(file) => {
                let (hit, misses) = file.read(off, len, out)?;
                Ok((hit, misses, file.size()))
            }
            None => {
                if out.len() < len {
                    return Err(DataError::InvalidArgument);
                }
                out[..len].fill(0);
                Ok((0, Vec::new(), 0))
            }
        }
    }

    /// Canonical write path: budget check, LRU eviction, disk fallback,
    /// then the page surgery inside the file. Metadata (tree node size and
    /// open state) is only touched after the file reports success.
    pub fn write(
        &self,
        fid: &str,
        off: u64,
        data: &[u8],
        tree: Option<&DirectoryTree>,
        open: bool,
    ) -> DataResult<()> {
        {
            let mut inner = self.inner.lock();
            if data.is_empty() {
                Self::file_at_front_locked(&mut inner, fid);
                return Ok(());
            }
            if fid.is_empty() {
                return Err(DataError::InvalidArgument);
            }
            tracing::debug!(fid, off, len = data.len(), "cache write");
            let file = self.prepare_write_locked(&mut inner, fid, data.len() as u64, tree)?;
            let delta = file.write(off, data, &self.disk_cache_dir, open)?;
            inner.size += delta.mem;
        }
        if let Some(tree) = tree {
            tree.apply_file_write(fid, off + data.len() as u64, open);
        }
        Ok(())
    }

    /// `write` with a streamed source of exactly `len` bytes.
    pub fn write_from_stream(
        &self,
        fid: &str,
        off: u64,
        len: usize,
        reader: &mut dyn Read,
        tree: Option<&DirectoryTree>,
        open: bool,
    ) -> DataResult<()> {
        {
            let mut inner = self.inner.lock();
            if len == 0 {
                Self::file_at_front_locked(&mut inner, fid);
                return Ok(());
            }
            if fid.is_empty() {
                return Err(DataError::InvalidArgument);
            }
            tracing::debug!(fid, off, len, "cache write from stream");
            let file = self.prepare_write_locked(&mut inner, fid, len as u64, tree)?;
            let delta = file.write_from_stream(off, len, reader, &self.disk_cache_dir, open)?;
            inner.size += delta.mem;
        }
        if let Some(tree) = tree {
            tree.apply_file_write(fid, off + len as u64, open);
        }
        Ok(())
    }

    /// Grow by writing a zero hole after the current end, shrink by
    /// truncating pages. The tree node follows the new size on success.
    pub fn resize(
        &self,
        fid: &str,
        new_size: u64,
        tree: Option<&DirectoryTree>,
    ) -> DataResult<()> {
        let (file, old_size) = {
            let mut inner = self.inner.lock();
            let file = Self::file_at_front_locked(&mut inner, fid);
            let old_size = file.size();
            if new_size == old_size {
                return Ok(());
            }
            if new_size < old_size {
                let old_cached = file.cached_size();
                file.resize_to_smaller_size(new_size);
                inner.size -= old_cached - file.cached_size();
                (file, old_size)
            } else {
                (file, old_size)
            }
        };
        if new_size > old_size {
            // hole fill; zero bytes run through the normal write path so
            // the budget and spill rules apply
            let hole = vec![0u8; (new_size - old_size) as usize];
            tracing::debug!(fid, old_size, new_size, "fill hole");
            let open = file.is_open();
            self.write(fid, old_size, &hole, tree, open)?;
            return Ok(());
        }
        if let Some(tree) = tree {
            tree.set_file_size(fid, new_size);
        }
        Ok(())
    }

    pub fn set_file_open(&self, fid: &str, open: bool, tree: Option<&DirectoryTree>) {
        {
            let inner = self.inner.lock();
            if let Some(&id) = inner.index.get(fid) {
                inner.list.get(id).1.set_open(open);
            }
        }
        if let Some(tree) = tree {
            tree.set_file_open(fid, open);
        }
    }

    /// Rebind `old_fid` to `new_fid`, discarding any file already cached
    /// under the new id, and move the entry to the front.
    pub fn rename(&self, old_fid: &str, new_fid: &str) {
        if old_fid == new_fid {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(id) = inner.index.remove(new_fid) {
            tracing::warn!(fid = new_fid, "rename target already cached, dropping it");
            Self::erase_slot_locked(&mut inner, id);
        }
        let Some(id) = inner.index.remove(old_fid) else {
            tracing::debug!(fid = old_fid, "rename of uncached file, nothing to do");
            return;
        };
        {
            let (key, file) = inner.list.get_mut(id);
            *key = new_fid.to_string();
            file.rename(new_fid);
        }
        inner.list.touch(id);
        inner.index.insert(new_fid.to_string(), id);
        tracing::debug!(from = old_fid, to = new_fid, "renamed cached file");
    }

    /// Drop a file and release its pages. Returns whether it was cached.
    pub fn erase(&self, fid: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.index.remove(fid) {
            Some(id) => {
                tracing::debug!(fid, "erase cached file");
                Self::erase_slot_locked(&mut inner, id);
                true
            }
            None => false,
        }
    }

    /// Evict least-recently-used files until `size` more bytes fit in the
    /// memory budget. `unfreeable` and open files are skipped; each
    /// evicted file's node surrenders its metadata through `tree`.
    /// Returns whether the target was reached.
    pub fn free(&self, size: u64, unfreeable: &str, tree: Option<&DirectoryTree>) -> bool {
        let mut inner = self.inner.lock();
        self.free_locked(&mut inner, size, unfreeable, tree)
    }

    /// Analogous eviction driven by scratch-filesystem free space.
    pub fn free_disk_cache_files(
        &self,
        folder: &Path,
        size: u64,
        unfreeable: &str,
        tree: Option<&DirectoryTree>,
    ) -> bool {
        let mut inner = self.inner.lock();
        self.free_disk_locked(&mut inner, folder, size, unfreeable, tree)
    }

    fn has_free_space_locked(&self, inner: &CacheInner, size: u64) -> bool {
        inner.size + size <= self.capacity
    }

    fn free_locked(
        &self,
        inner: &mut CacheInner,
        size: u64,
        unfreeable: &str,
        tree: Option<&DirectoryTree>,
    ) -> bool {
        if size > self.capacity {
            tracing::debug!(size, capacity = self.capacity, "free request beyond capacity");
            return false;
        }
        let mut freed = 0u64;
        let mut freed_disk = 0u64;
        let mut cur = inner.list.back();
        while !self.has_free_space_locked(inner, size) {
            let Some(id) = cur else { break };
            // compute the next candidate before any erase
            let next = inner.list.prev_of(id);
            let (fid, file) = {
                let (fid, file) = inner.list.get(id);
                (fid.clone(), file.clone())
            };
            if fid != unfreeable && !file.is_open() {
                let cached = file.cached_size();
                freed += cached;
                freed_disk += file.size() - cached;
                inner.size -= cached;
                file.clear();
                inner.list.remove(id);
                inner.index.remove(&fid);
                if let Some(tree) = tree {
                    tree.surrender_meta(&fid);
                }
            }
            cur = next;
        }
        if freed > 0 || freed_disk > 0 {
            tracing::info!(freed, freed_disk, skipped_for = unfreeable, "evicted cache files");
        }
        self.has_free_space_locked(inner, size)
    }

    fn free_disk_locked(
        &self,
        inner: &mut CacheInner,
        folder: &Path,
        size: u64,
        unfreeable: &str,
        tree: Option<&DirectoryTree>,
    ) -> bool {
        let mut freed = 0u64;
        let mut freed_disk = 0u64;
        let mut cur = inner.list.back();
        while !scratch::is_safe_disk_space(folder, size) {
            let Some(id) = cur else { break };
            let next = inner.list.prev_of(id);
            let (fid, file) = {
                let (fid, file) = inner.list.get(id);
                (fid.clone(), file.clone())
            };
            if fid != unfreeable && !file.is_open() {
                let cached = file.cached_size();
                freed += cached;
                freed_disk += file.size() - cached;
                inner.size -= cached;
                file.clear();
                inner.list.remove(id);
                inner.index.remove(&fid);
                if let Some(tree) = tree {
                    tree.surrender_meta(&fid);
                }
            }
            cur = next;
        }
        if freed > 0 || freed_disk > 0 {
            tracing::info!(freed, freed_disk, skipped_for = unfreeable, "evicted for disk space");
        }
        scratch::is_safe_disk_space(folder, size)
    }

    /// Budget admission for an incoming write of `len` bytes. On success
    /// the target file sits at the front with its spill flag set to
    /// whether memory could not be freed.
    fn prepare_write_locked(
        &self,
        inner: &mut CacheInner,
        fid: &str,
        len: u64,
        tree: Option<&DirectoryTree>,
    ) -> DataResult<Arc<File>> {
        let mut available = true;
        if !self.has_free_space_locked(inner, len) {
            available = self.free_locked(inner, len, fid, tree);
            if !available {
                if !self.allow_disk_spill {
                    return Err(DataError::OutOfMemoryBudget);
                }
                scratch::ensure_dir_exists(&self.disk_cache_dir)?;
                if !scratch::is_safe_disk_space(&self.disk_cache_dir, len)
                    && !self.free_disk_locked(inner, &self.disk_cache_dir, len, fid, tree)
                {
                    tracing::warn!(
                        fid,
                        len,
                        folder = %self.disk_cache_dir.display(),
                        "no free space in memory or scratch"
                    );
                    return Err(DataError::OutOfDiskBudget);
                }
            }
        }
        let file = Self::file_at_front_locked(inner, fid);
        file.set_use_disk_file(!available);
        Ok(file)
    }

    fn file_at_front_locked(inner: &mut CacheInner, fid: &str) -> Arc<File> {
        match inner.index.get(fid) {
            Some(&id) => {
                inner.list.touch(id);
                inner.list.get(id).1.clone()
            }
            None => {
                let file = Arc::new(File::new(fid));
                let id = inner.list.push_front((fid.to_string(), file.clone()));
                inner.index.insert(fid.to_string(), id);
                file
            }
        }
    }

    fn erase_slot_locked(inner: &mut CacheInner, id: SlotId) {
        let (_, file) = inner.list.remove(id);
        inner.size -= file.cached_size();
        file.clear();
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let inner = self.inner.lock();
        let mut sum = 0u64;
        let mut seen = 0usize;
        for (id, (fid, file)) in inner.list.iter() {
            assert_eq!(inner.index.get(fid), Some(&id), "index disagrees with order");
            sum += file.cached_size();
            seen += 1;
            file.check_invariants();
        }
        assert_eq!(seen, inner.index.len(), "order and index sizes differ");
        assert_eq!(inner.size, sum, "cache size != sum of cached sizes");
        assert!(inner.size <= self.capacity, "capacity exceeded at rest");
    }
}
