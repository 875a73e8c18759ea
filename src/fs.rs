use crate::config::Options;
use crate::data::cache::Cache;
use crate::data::file::MissRange;
use crate::data::meta::{FileMeta, FileMetaDataManager};
use crate::data::resource::ResourceManager;
use crate::data::tree::DirectoryTree;
use crate::error::{DataError, DataResult};
use crate::handle_table::HandleTable;
use crate::scratch;
use crate::transfer::TransferBridge;
use crate::util::{
    child_fid, errno_from_data, fid_from_os, file_attr_from_meta, file_type_from_kind,
};
use bytes::Bytes;
use fuse3::path::prelude::*;
use fuse3::path::reply::DirectoryEntryPlus;
use fuse3::{FileType, SetAttr};
use nix::sys::statvfs::statvfs;
use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const ATTR_TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: u32 = 128 * 1024;

/// The FUSE face of the filesystem: paths in, cache and transfer calls
/// out. Every file id is the mount-absolute path, which doubles as the
/// object key.
pub struct BucketFs<B: TransferBridge> {
    options: Options,
    cache: Arc<Cache>,
    tree: Arc<DirectoryTree>,
    meta_manager: Arc<FileMetaDataManager>,
    buffers: Arc<ResourceManager>,
    bridge: Arc<B>,
    handles: HandleTable,
}

impl<B: TransferBridge> BucketFs<B> {
    pub fn new(options: Options, bridge: B) -> DataResult<Self> {
        // an unusable scratch directory is fatal before mount
        scratch::ensure_dir_exists(&options.disk_cache_dir)?;
        let cache = Arc::new(Cache::new(&options));
        let buffers = ResourceManager::new(
            options.transfer_buffers,
            options.transfer_buffer_size,
        );
        let meta_manager = Arc::new(FileMetaDataManager::new(options.meta_capacity));
        // nodes evicted from the data cache surrender their metadata here
        let tree = Arc::new(DirectoryTree::with_meta_manager(meta_manager.clone()));
        Ok(Self {
            cache,
            tree,
            meta_manager,
            buffers,
            bridge: Arc::new(bridge),
            handles: HandleTable::new(),
            options,
        })
    }

    /// Resolve metadata for a file id: the tree first, then the detached
    /// metadata manager, then the remote. Remote answers are re-attached
    /// so the next stat is local.
    fn stat_fid(&self, fid: &str) -> DataResult<FileMeta> {
        if let Some(meta) = self.tree.find(fid) {
            return Ok(meta);
        }
        if self.tree.has(fid) {
            // node surrendered its metadata; manager or remote must answer
            if let Some(meta) = self.meta_manager.get(fid) {
                self.tree.attach_meta(fid, meta.clone());
                return Ok(meta);
            }
        }
        let meta = self.stat_remote(fid)?;
        if self.tree.has(fid) {
            self.tree.attach_meta(fid, meta.clone());
        } else {
            let _ = self.tree.insert(fid, meta.clone());
        }
        Ok(meta)
    }

    fn stat_remote(&self, fid: &str) -> DataResult<FileMeta> {
        if let Some(stat) = self.bridge.head_object(fid)? {
            if stat.is_prefix {
                return Ok(FileMeta::directory(stat.mtime));
            }
            return Ok(FileMeta::regular(stat.size, stat.mtime));
        }
        // a bare prefix with no marker object still lists as a directory
        let marker = format!("{}/", fid.trim_end_matches('/'));
        if self.bridge.head_object(&marker)?.is_some() {
            return Ok(FileMeta::directory(SystemTime::now()));
        }
        Err(DataError::NotFound)
    }

    /// Populate a directory node's children from the remote listing. The
    /// listing may split entries between `objects` and `common_prefixes`
    /// in any combination; both shapes land in the tree the same way.
    fn ensure_dir_loaded(&self, fid: &str) -> DataResult<()> {
        if self.tree.children_loaded(fid) {
            return Ok(());
        }
        if !self.tree.has(fid) {
            let meta = self.stat_fid(fid)?;
            if !meta.is_dir() {
                return Err(DataError::InvalidArgument);
            }
        }
        let prefix = if fid == "/" {
            "/".to_string()
        } else {
            format!("{fid}/")
        };
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .bridge
                .list_objects(&prefix, "/", continuation.as_deref())?;
            for object in &page.objects {
                let key = object.key.trim_end_matches('/');
                if key.is_empty() || key == fid || self.tree.has(key) {
                    // never let a stale remote listing clobber local state
                    continue;
                }
                let meta = if object.key.ends_with('/') {
                    FileMeta::directory(object.mtime)
                } else {
                    FileMeta::regular(object.size, object.mtime)
                };
                let _ = self.tree.insert(key, meta);
            }
            for dir_prefix in &page.common_prefixes {
                let key = dir_prefix.trim_end_matches('/');
                if key.is_empty() || key == fid || self.tree.has(key) {
                    continue;
                }
                let _ = self.tree.insert(key, FileMeta::directory(SystemTime::now()));
            }
            match page.next_continuation {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }
        self.tree.mark_children_loaded(fid);
        Ok(())
    }

    /// Serve a read from the cache, fetching uncovered ranges through the
    /// transfer bridge and writing them back before answering. Misses are
    /// staged through the pooled transfer buffers.
    fn read_through(&self, fid: &str, off: u64, len: usize, open: bool) -> DataResult<Vec<u8>> {
        let meta_size = self.stat_fid(fid)?.size;
        let mut out = vec![0u8; len];
        let (_, mut misses, cached_size) = self.cache.read(fid, off, len, &mut out)?;
        let logical = meta_size.max(cached_size);
        let end = (off + len as u64).min(logical);
        if off >= end {
            return Ok(Vec::new());
        }

        // the file read only reports gaps below its own size; everything
        // between the cached size and the logical size is also missing
        let tail_start = cached_size.max(off);
        if tail_start < end {
            misses.push(MissRange {
                offset: tail_start,
                len: (end - tail_start) as usize,
            });
        }

        if !misses.is_empty() {
            self.fetch_misses(fid, &misses, logical, cached_size, open)?;
            self.cache.read(fid, off, len, &mut out)?;
        }
        out.truncate((end - off) as usize);
        Ok(out)
    }

    fn fetch_misses(
        &self,
        fid: &str,
        misses: &[MissRange],
        logical: u64,
        cached_size: u64,
        open: bool,
    ) -> DataResult<()> {
        let mut lease = self.buffers.acquire();
        for (i, miss) in misses.iter().enumerate() {
            let mut pos = miss.offset;
            let mut miss_end = miss.offset + miss.len as u64;
            if i == misses.len() - 1 && miss_end >= cached_size {
                // read ahead on the trailing miss; past the cached size
                // nothing local can be overwritten by remote bytes
                let prefetch = self.options.prefetch_size as u64;
                if prefetch > 0 {
                    miss_end = miss_end.div_ceil(prefetch).saturating_mul(prefetch);
                }
                miss_end = miss_end.min(logical);
            }
            while pos < miss_end {
                let want = ((miss_end - pos) as usize).min(lease.bytes().len());
                let got = match self.bridge.download_range(fid, pos, &mut lease.bytes_mut()[..want])
                {
                    Ok(got) => got,
                    // never uploaded (locally sparse); the zero fill stands
                    Err(DataError::NotFound) => break,
                    Err(e) => {
                        tracing::warn!(fid, pos, error = %e, "range download failed");
                        return Err(e);
                    }
                };
                if got == 0 {
                    break;
                }
                self.cache
                    .write(fid, pos, &lease.bytes()[..got], Some(&self.tree), open)?;
                pos += got as u64;
                if got < want {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Push the current cached content of a file to the object store.
    fn upload_from_cache(&self, fid: &str) -> DataResult<()> {
        let size = self.stat_fid(fid)?.size.max(self.cache.file_size(fid));
        let open = self
            .cache
            .find_file(fid)
            .map(|file| file.is_open())
            .unwrap_or(false);
        tracing::debug!(fid, size, "upload file");
        let mut reader = CacheReader {
            fs: self,
            fid,
            pos: 0,
            size,
            open,
        };
        self.bridge.upload_file(fid, size, &mut reader)?;
        Ok(())
    }

    fn flush_handle(&self, fid: &str, handle: &crate::handle_table::FileHandle) -> DataResult<()> {
        if handle.take_dirty() {
            if let Err(e) = self.upload_from_cache(fid) {
                handle.mark_dirty();
                return Err(e);
            }
        }
        Ok(())
    }

    fn attr_reply(&self, fid: &str) -> Result<ReplyAttr, fuse3::Errno> {
        let meta = self.stat_fid(fid).map_err(|e| errno_from_data(&e))?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr: file_attr_from_meta(&meta),
        })
    }

    fn entry_reply(&self, fid: &str) -> Result<ReplyEntry, fuse3::Errno> {
        let meta = self.stat_fid(fid).map_err(|e| errno_from_data(&e))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr: file_attr_from_meta(&meta),
        })
    }

    fn create_file_node(&self, fid: &str, mode: u32) -> DataResult<()> {
        let mut meta = FileMeta::regular(0, SystemTime::now());
        meta.mode = mode & 0o777;
        self.tree.insert(fid, meta)?;
        self.cache.make_file(fid);
        // materialize the empty object so the file survives eviction
        self.bridge.upload_file(fid, 0, &mut std::io::empty())?;
        Ok(())
    }

    fn remove_file_everywhere(&self, fid: &str) -> DataResult<()> {
        self.bridge.delete_object(fid)?;
        self.cache.erase(fid);
        self.meta_manager.remove(fid);
        let _ = self.tree.remove(fid);
        Ok(())
    }
}

/// Streams a file's bytes out of the cache for an upload, pulling any
/// still-remote ranges through the read path chunk by chunk.
struct CacheReader<'a, B: TransferBridge> {
    fs: &'a BucketFs<B>,
    fid: &'a str,
    pos: u64,
    size: u64,
    open: bool,
}

impl<B: TransferBridge> Read for CacheReader<'_, B> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let want = ((self.size - self.pos) as usize).min(buf.len());
        let bytes = self
            .fs
            .read_through(self.fid, self.pos, want, self.open)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        // holes inside the size watermark read back as zeros
        buf[bytes.len()..want].fill(0);
        self.pos += want as u64;
        Ok(want)
    }
}

impl<B: TransferBridge + 'static> PathFilesystem for BucketFs<B> {
    async fn init(&self, _req: Request) -> Result<ReplyInit, fuse3::Errno> {
        Ok(ReplyInit {
            max_write: NonZeroU32::new(MAX_WRITE).expect("nonzero max_write"),
        })
    }

    async fn destroy(&self, _req: Request) {
        tracing::info!(
            files = self.cache.num_files(),
            cached_bytes = self.cache.size(),
            "unmounting"
        );
    }

    async fn lookup(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let fid = child_fid(parent, name)?;
        self.entry_reply(&fid)
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        if let Some(handle) = fh.and_then(|id| self.handles.get_file(id)) {
            return self.attr_reply(&handle.fid);
        }
        let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;
        let fid = fid_from_os(path)?;
        self.attr_reply(&fid)
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let fid = match fh.and_then(|id| self.handles.get_file(id)) {
            Some(handle) => handle.fid.clone(),
            None => {
                let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;
                fid_from_os(path)?
            }
        };

        if let Some(size) = set_attr.size {
            let meta = self.stat_fid(&fid).map_err(|e| errno_from_data(&e))?;
            if meta.is_dir() {
                return Err(fuse3::Errno::from(libc::EISDIR));
            }
            // the bytes that survive the truncate must be local before the
            // cut, or a sparsely cached file would lose them
            let keep = meta.size.min(size);
            if keep > 0 {
                let _ = self
                    .read_through(&fid, 0, keep as usize, meta.open_count > 0)
                    .map_err(|e| errno_from_data(&e))?;
            }
            self.cache
                .resize(&fid, size, Some(&self.tree))
                .map_err(|e| errno_from_data(&e))?;
            self.tree.set_file_size(&fid, size);
            self.upload_from_cache(&fid)
                .map_err(|e| errno_from_data(&e))?;
        }

        if !self.options.nullable_meta {
            let changed = self.tree.update_meta(&fid, |meta| {
                if let Some(mode) = set_attr.mode {
                    meta.mode = mode & 0o7777;
                }
                if let Some(uid) = set_attr.uid {
                    meta.uid = uid;
                }
                if let Some(gid) = set_attr.gid {
                    meta.gid = gid;
                }
                if let Some(atime) = set_attr.atime {
                    meta.atime = SystemTime::UNIX_EPOCH
                        + Duration::new(atime.sec.max(0) as u64, atime.nsec);
                }
                if let Some(mtime) = set_attr.mtime {
                    meta.mtime = SystemTime::UNIX_EPOCH
                        + Duration::new(mtime.sec.max(0) as u64, mtime.nsec);
                }
            });
            if !changed && set_attr.size.is_none() {
                return Err(fuse3::Errno::new_not_exist());
            }
        }

        self.attr_reply(&fid)
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let fid = child_fid(parent, name)?;
        if self.tree.has(&fid) {
            return Err(fuse3::Errno::from(libc::EEXIST));
        }
        let mut meta = FileMeta::directory(SystemTime::now());
        meta.mode = mode & 0o7777;
        self.tree
            .insert(&fid, meta)
            .map_err(|e| errno_from_data(&e))?;
        let marker = format!("{fid}/");
        if let Err(e) = self.bridge.upload_file(&marker, 0, &mut std::io::empty()) {
            let _ = self.tree.remove(&fid);
            return Err(errno_from_data(&e));
        }
        self.entry_reply(&fid)
    }

    async fn unlink(&self, _req: Request, parent: &OsStr, name: &OsStr) -> Result<(), fuse3::Errno> {
        let fid = child_fid(parent, name)?;
        let meta = self.stat_fid(&fid).map_err(|e| errno_from_data(&e))?;
        if meta.is_dir() {
            return Err(fuse3::Errno::from(libc::EISDIR));
        }
        self.remove_file_everywhere(&fid)
            .map_err(|e| errno_from_data(&e))
    }

    async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> Result<(), fuse3::Errno> {
        let fid = child_fid(parent, name)?;
        let meta = self.stat_fid(&fid).map_err(|e| errno_from_data(&e))?;
        if !meta.is_dir() {
            return Err(fuse3::Errno::from(libc::ENOTDIR));
        }
        self.ensure_dir_loaded(&fid)
            .map_err(|e| errno_from_data(&e))?;
        let children = self
            .tree
            .children(&fid)
            .map_err(|e| errno_from_data(&e))?;
        if !children.is_empty() {
            return Err(fuse3::Errno::from(libc::ENOTEMPTY));
        }
        self.bridge
            .delete_object(&format!("{fid}/"))
            .map_err(|e| errno_from_data(&e))?;
        self.meta_manager.remove(&fid);
        self.tree.remove(&fid).map_err(|e| errno_from_data(&e))
    }

    async fn rename(
        &self,
        _req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let from = child_fid(origin_parent, origin_name)?;
        let to = child_fid(parent, name)?;
        if from == "/" || to == "/" {
            return Err(fuse3::Errno::from(libc::EINVAL));
        }
        if from == to {
            return Ok(());
        }

        let source = self.stat_fid(&from).map_err(|e| errno_from_data(&e))?;
        if source.is_dir() {
            // descendants must be known locally before their keys move
            self.ensure_dir_loaded(&from)
                .map_err(|e| errno_from_data(&e))?;
        }
        match self.stat_fid(&to) {
            Ok(existing) if existing.is_dir() => {
                self.ensure_dir_loaded(&to)
                    .map_err(|e| errno_from_data(&e))?;
                let children = self.tree.children(&to).map_err(|e| errno_from_data(&e))?;
                if !children.is_empty() {
                    return Err(fuse3::Errno::from(libc::ENOTEMPTY));
                }
                self.bridge
                    .delete_object(&format!("{to}/"))
                    .map_err(|e| errno_from_data(&e))?;
                self.meta_manager.remove(&to);
                let _ = self.tree.remove(&to);
            }
            Ok(_) => {
                self.remove_file_everywhere(&to)
                    .map_err(|e| errno_from_data(&e))?;
            }
            Err(DataError::NotFound) => {}
            Err(e) => return Err(errno_from_data(&e)),
        }

        self.bridge
            .rename_object(&from, &to)
            .map_err(|e| errno_from_data(&e))?;
        let renamed = self
            .tree
            .rename(&from, &to)
            .map_err(|e| errno_from_data(&e))?;
        for (old_fid, new_fid) in renamed {
            self.cache.rename(&old_fid, &new_fid);
            self.meta_manager.rename(&old_fid, &new_fid);
        }
        tracing::debug!(from = %from, to = %to, "renamed");
        Ok(())
    }

    async fn open(&self, _req: Request, path: &OsStr, flags: u32) -> Result<ReplyOpen, fuse3::Errno> {
        let fid = fid_from_os(path)?;
        let meta = self.stat_fid(&fid).map_err(|e| errno_from_data(&e))?;
        if meta.is_dir() {
            return Err(fuse3::Errno::from(libc::EISDIR));
        }
        let write = (flags as i32 & libc::O_ACCMODE) != libc::O_RDONLY;
        let truncated = (flags as i32 & libc::O_TRUNC) != 0 && write;
        if truncated {
            self.cache
                .resize(&fid, 0, Some(&self.tree))
                .map_err(|e| errno_from_data(&e))?;
            self.tree.set_file_size(&fid, 0);
        }
        self.cache.set_file_open(&fid, true, Some(&self.tree));
        let fh = self.handles.insert_file(fid, write);
        if truncated {
            // the cut reaches the store on flush/release
            if let Some(handle) = self.handles.get_file(fh) {
                handle.mark_dirty();
            }
        }
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn create(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> Result<ReplyCreated, fuse3::Errno> {
        let fid = child_fid(parent, name)?;
        if self.tree.find(&fid).is_none() {
            self.create_file_node(&fid, mode)
                .map_err(|e| errno_from_data(&e))?;
        }
        let write = (flags as i32 & libc::O_ACCMODE) != libc::O_RDONLY;
        self.cache.set_file_open(&fid, true, Some(&self.tree));
        let fh = self.handles.insert_file(fid.clone(), write);
        let meta = self.stat_fid(&fid).map_err(|e| errno_from_data(&e))?;
        Ok(ReplyCreated {
            ttl: ATTR_TTL,
            attr: file_attr_from_meta(&meta),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn read(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData, fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        let data = self
            .read_through(&handle.fid, offset, size as usize, true)
            .map_err(|e| errno_from_data(&e))?;
        Ok(Bytes::from(data).into())
    }

    async fn write(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite, fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        if !handle.write {
            return Err(fuse3::Errno::from(libc::EBADF));
        }
        self.cache
            .write(&handle.fid, offset, data, Some(&self.tree), true)
            .map_err(|e| errno_from_data(&e))?;
        handle.mark_dirty();
        Ok(ReplyWrite {
            written: data.len() as u32,
        })
    }

    async fn flush(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
    ) -> Result<(), fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        self.flush_handle(&handle.fid, &handle)
            .map_err(|e| errno_from_data(&e))
    }

    async fn fsync(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _datasync: bool,
    ) -> Result<(), fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        self.flush_handle(&handle.fid, &handle)
            .map_err(|e| errno_from_data(&e))
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<(), fuse3::Errno> {
        let Some(handle) = self.handles.get_file(fh) else {
            return Ok(());
        };
        let res = self.flush_handle(&handle.fid, &handle);
        self.cache.set_file_open(&handle.fid, false, Some(&self.tree));
        self.handles.remove(fh);
        res.map_err(|e| errno_from_data(&e))
    }

    async fn opendir(&self, _req: Request, path: &OsStr, flags: u32) -> Result<ReplyOpen, fuse3::Errno> {
        let fid = fid_from_os(path)?;
        let meta = self.stat_fid(&fid).map_err(|e| errno_from_data(&e))?;
        if !meta.is_dir() {
            return Err(fuse3::Errno::from(libc::ENOTDIR));
        }
        let fh = self.handles.insert_dir(fid);
        Ok(ReplyOpen { fh, flags })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _path: &OsStr,
        fh: u64,
        _flags: u32,
    ) -> Result<(), fuse3::Errno> {
        self.handles.remove(fh);
        Ok(())
    }

    type DirEntryStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        _path: &'a OsStr,
        fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'a>>, fuse3::Errno> {
        let handle = self
            .handles
            .get_dir(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        self.ensure_dir_loaded(&handle.fid)
            .map_err(|e| errno_from_data(&e))?;
        let children = self
            .tree
            .children(&handle.fid)
            .map_err(|e| errno_from_data(&e))?;

        let mut entries: Vec<fuse3::Result<DirectoryEntry>> = Vec::with_capacity(children.len() + 2);
        let mut idx: i64 = 0;
        for name in [".", ".."] {
            idx += 1;
            entries.push(Ok(DirectoryEntry {
                kind: FileType::Directory,
                name: OsString::from(name),
                offset: idx,
            }));
        }
        for (name, meta) in children {
            idx += 1;
            let kind = meta
                .map(|m| file_type_from_kind(m.kind))
                .unwrap_or(FileType::RegularFile);
            entries.push(Ok(DirectoryEntry {
                kind,
                name: OsString::from(name),
                offset: idx,
            }));
        }

        let skip = offset.max(0) as usize;
        let entries: Vec<_> = entries.into_iter().skip(skip).collect();
        Ok(ReplyDirectory {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: &'a OsStr,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>, fuse3::Errno> {
        let handle = self
            .handles
            .get_dir(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        self.ensure_dir_loaded(&handle.fid)
            .map_err(|e| errno_from_data(&e))?;
        let dir_meta = self
            .stat_fid(&handle.fid)
            .map_err(|e| errno_from_data(&e))?;
        let children = self
            .tree
            .children(&handle.fid)
            .map_err(|e| errno_from_data(&e))?;

        let mut entries: Vec<fuse3::Result<DirectoryEntryPlus>> =
            Vec::with_capacity(children.len() + 2);
        let dir_attr = file_attr_from_meta(&dir_meta);
        let mut idx: i64 = 0;
        for name in [".", ".."] {
            idx += 1;
            entries.push(Ok(DirectoryEntryPlus {
                kind: FileType::Directory,
                name: OsString::from(name),
                offset: idx,
                attr: dir_attr,
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }
        for (name, meta) in children {
            idx += 1;
            let child = child_fid(parent, OsStr::new(&name))?;
            let meta = match meta {
                Some(meta) => meta,
                None => self.stat_fid(&child).map_err(|e| errno_from_data(&e))?,
            };
            entries.push(Ok(DirectoryEntryPlus {
                kind: file_type_from_kind(meta.kind),
                name: OsString::from(name),
                offset: idx,
                attr: file_attr_from_meta(&meta),
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }

        let skip = offset as usize;
        let entries: Vec<_> = entries.into_iter().skip(skip).collect();
        Ok(ReplyDirectoryPlus {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> Result<ReplyStatFs, fuse3::Errno> {
        // the bucket has no real limits; report the scratch filesystem so
        // spill headroom is visible to tools like df
        let stats = statvfs(&self.options.disk_cache_dir)
            .map_err(|e| fuse3::Errno::from(e as i32))?;
        Ok(ReplyStatFs {
            blocks: stats.blocks(),
            bfree: stats.blocks_free(),
            bavail: stats.blocks_available(),
            files: stats.files(),
            ffree: stats.files_free(),
            bsize: stats.block_size() as u32,
            namelen: stats.name_max() as u32,
            frsize: stats.fragment_size() as u32,
        })
    }

    async fn access(&self, _req: Request, path: &OsStr, _mask: u32) -> Result<(), fuse3::Errno> {
        let fid = fid_from_os(path)?;
        self.stat_fid(&fid).map_err(|e| errno_from_data(&e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::meta::FileKind;
    use crate::transfer::LocalStore;

    fn mounted() -> (tempfile::TempDir, tempfile::TempDir, BucketFs<LocalStore>) {
        let backing = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let options = Options {
            max_cache_size: 64 * 1024,
            disk_cache_dir: scratch.path().to_path_buf(),
            prefetch_size: 4096,
            ..Options::default()
        };
        let fs = BucketFs::new(options, LocalStore::new(backing.path())).unwrap();
        (backing, scratch, fs)
    }

    fn seed(backing: &tempfile::TempDir, rel: &str, data: &[u8]) {
        let path = backing.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn stat_resolves_remote_objects_and_prefixes() {
        let (backing, _scratch, fs) = mounted();
        seed(&backing, "dir/obj", b"hello");

        let meta = fs.stat_fid("/dir/obj").unwrap();
        assert_eq!(meta.kind, FileKind::Regular);
        assert_eq!(meta.size, 5);

        let meta = fs.stat_fid("/dir").unwrap();
        assert!(meta.is_dir());

        assert!(matches!(fs.stat_fid("/missing"), Err(DataError::NotFound)));
    }

    #[test]
    fn read_through_fetches_misses_and_caches_them() {
        let (backing, _scratch, fs) = mounted();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        seed(&backing, "obj", &payload);

        let bytes = fs.read_through("/obj", 100, 500, false).unwrap();
        assert_eq!(bytes, &payload[100..600]);

        // second read is served from the cache: corrupt the remote and
        // the answer must not change
        seed(&backing, "obj", &vec![0u8; 10_000]);
        let bytes = fs.read_through("/obj", 100, 500, false).unwrap();
        assert_eq!(bytes, &payload[100..600]);
    }

    #[test]
    fn read_past_eof_comes_back_short() {
        let (backing, _scratch, fs) = mounted();
        seed(&backing, "small", b"abc");
        let bytes = fs.read_through("/small", 0, 100, false).unwrap();
        assert_eq!(bytes, b"abc");
        let bytes = fs.read_through("/small", 10, 100, false).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn prefetch_pulls_whole_small_object_on_first_miss() {
        let (backing, _scratch, fs) = mounted();
        let payload = vec![b'p'; 3000];
        seed(&backing, "obj", &payload);

        let bytes = fs.read_through("/obj", 0, 10, false).unwrap();
        assert_eq!(bytes, &payload[..10]);
        // prefetch granularity is 4096, so the whole 3000-byte object is
        // now resident
        assert_eq!(fs.cache.file_size("/obj"), 3000);
    }

    #[test]
    fn write_then_upload_roundtrips_through_the_store() {
        let (backing, _scratch, fs) = mounted();
        fs.create_file_node("/out", 0o644).unwrap();
        fs.cache
            .write("/out", 0, b"written locally", Some(&fs.tree), true)
            .unwrap();
        fs.upload_from_cache("/out").unwrap();

        let stored = std::fs::read(backing.path().join("out")).unwrap();
        assert_eq!(stored, b"written locally");
    }

    #[test]
    fn sparse_local_write_uploads_zero_filled_hole() {
        let (backing, _scratch, fs) = mounted();
        fs.create_file_node("/sparse", 0o644).unwrap();
        fs.cache
            .write("/sparse", 1024, &[b'A'; 1024], Some(&fs.tree), true)
            .unwrap();
        fs.upload_from_cache("/sparse").unwrap();

        let stored = std::fs::read(backing.path().join("sparse")).unwrap();
        assert_eq!(stored.len(), 2048);
        assert!(stored[..1024].iter().all(|&b| b == 0));
        assert!(stored[1024..].iter().all(|&b| b == b'A'));
    }

    #[test]
    fn dir_listing_loads_children_from_both_groupings() {
        let (backing, _scratch, fs) = mounted();
        seed(&backing, "d/file_a", b"1");
        seed(&backing, "d/file_b", b"22");
        std::fs::create_dir_all(backing.path().join("d/subdir")).unwrap();

        fs.ensure_dir_loaded("/d").unwrap();
        let children = fs.tree.children("/d").unwrap();
        let names: Vec<&str> = children.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["file_a", "file_b", "subdir"]);
        assert!(children[2].1.as_ref().unwrap().is_dir());
        assert_eq!(children[1].1.as_ref().unwrap().size, 2);
    }

    #[test]
    fn evicted_file_meta_is_served_from_the_manager() {
        let (backing, _scratch, fs) = mounted();
        let payload = vec![b'm'; 3000];
        seed(&backing, "obj", &payload);
        // cache the object and its node metadata
        let bytes = fs.read_through("/obj", 0, 3000, false).unwrap();
        assert_eq!(bytes, payload);
        assert_eq!(fs.tree.find("/obj").unwrap().size, 3000);

        // fill the 64 KiB cache until /obj is evicted under pressure
        for i in 0..4 {
            let fid = format!("/press{i}");
            fs.cache
                .write(&fid, 0, &vec![i as u8; 16 * 1024], Some(&fs.tree), false)
                .unwrap();
        }
        assert!(!fs.cache.has_file("/obj"));
        assert!(fs.tree.find("/obj").is_none(), "meta left the tree");
        assert_eq!(fs.meta_manager.get("/obj").unwrap().size, 3000);

        // the stat path answers from the manager and re-attaches
        assert_eq!(fs.stat_fid("/obj").unwrap().size, 3000);
        assert_eq!(fs.tree.find("/obj").unwrap().size, 3000);
    }

    #[test]
    fn cold_meta_is_reloaded_from_the_remote() {
        let (backing, _scratch, fs) = mounted();
        seed(&backing, "obj", b"0123456789");
        fs.stat_fid("/obj").unwrap();

        // the node goes cold: metadata surrendered to the manager, then
        // the manager loses it too
        let meta = fs.tree.detach_meta("/obj").unwrap();
        fs.meta_manager.put("/obj", meta);
        fs.meta_manager.remove("/obj");

        let reloaded = fs.stat_fid("/obj").unwrap();
        assert_eq!(reloaded.size, 10);
        // and it is attached again
        assert_eq!(fs.tree.find("/obj").unwrap().size, 10);
    }
}
