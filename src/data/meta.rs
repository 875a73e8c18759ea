use crate::data::lru::{LruList, SlotId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::SystemTime;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

/// Per-file metadata as the namespace sees it. `size` mirrors the cached
/// file's logical size whenever a file is resident in the data cache.
#[derive(Clone, Debug)]
pub struct FileMeta {
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub open_count: u32,
    pub symlink_target: Option<String>,
}

impl FileMeta {
    pub fn regular(size: u64, mtime: SystemTime) -> Self {
        Self {
            kind: FileKind::Regular,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size,
            mtime,
            atime: mtime,
            open_count: 0,
            symlink_target: None,
        }
    }

    pub fn directory(mtime: SystemTime) -> Self {
        Self {
            kind: FileKind::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            size: 0,
            mtime,
            atime: mtime,
            open_count: 0,
            symlink_target: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

struct ManagerInner {
    list: LruList<(String, FileMeta)>,
    index: HashMap<String, SlotId>,
}

/// Bounded LRU of detached file metadata.
///
/// A tree node surrenders its metadata here when it goes cold; on
/// overflow the eldest closed entry is dropped, and a dropped entry must
/// be re-fetched from the remote before the next stat is answered.
pub struct FileMetaDataManager {
    capacity: usize,
    inner: Mutex<ManagerInner>,
}

impl FileMetaDataManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(ManagerInner {
                list: LruList::new(),
                index: HashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().list.len()
    }

    pub fn get(&self, fid: &str) -> Option<FileMeta> {
        let mut inner = self.inner.lock();
        let id = *inner.index.get(fid)?;
        inner.list.touch(id);
        Some(inner.list.get(id).1.clone())
    }

    pub fn put(&self, fid: &str, meta: FileMeta) {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.index.get(fid) {
            inner.list.get_mut(id).1 = meta;
            inner.list.touch(id);
            return;
        }
        while inner.list.len() >= self.capacity {
            if !Self::discard_eldest_cold(&mut inner) {
                break;
            }
        }
        let id = inner.list.push_front((fid.to_string(), meta));
        inner.index.insert(fid.to_string(), id);
    }

    pub fn remove(&self, fid: &str) -> Option<FileMeta> {
        let mut inner = self.inner.lock();
        let id = inner.index.remove(fid)?;
        Some(inner.list.remove(id).1)
    }

    pub fn rename(&self, old_fid: &str, new_fid: &str) {
        let mut inner = self.inner.lock();
        let Some(id) = inner.index.remove(old_fid) else {
            return;
        };
        if let Some(stale) = inner.index.remove(new_fid) {
            inner.list.remove(stale);
        }
        inner.list.get_mut(id).0 = new_fid.to_string();
        inner.index.insert(new_fid.to_string(), id);
    }

    /// Walk from the back, dropping the first entry not held open.
    fn discard_eldest_cold(inner: &mut ManagerInner) -> bool {
        let mut cur = inner.list.back();
        while let Some(id) = cur {
            let next = inner.list.prev_of(id);
            if inner.list.get(id).1.open_count == 0 {
                let (fid, _) = inner.list.remove(id);
                inner.index.remove(&fid);
                tracing::debug!(fid = %fid, "discarded cold file metadata");
                return true;
            }
            cur = next;
        }
        false
    }
}
