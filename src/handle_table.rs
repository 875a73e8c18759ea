use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
pub struct FileHandle {
    pub fid: String,
    pub write: bool,
    dirty: AtomicBool,
}

impl FileHandle {
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug)]
pub struct DirHandle {
    pub fid: String,
}

#[derive(Debug, Clone)]
pub enum Handle {
    File(Arc<FileHandle>),
    Dir(Arc<DirHandle>),
}

#[derive(Debug, Default)]
pub struct HandleTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Handle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_file(&self, fid: String, write: bool) -> u64 {
        self.insert(Handle::File(Arc::new(FileHandle {
            fid,
            write,
            dirty: AtomicBool::new(false),
        })))
    }

    pub fn insert_dir(&self, fid: String) -> u64 {
        self.insert(Handle::Dir(Arc::new(DirHandle { fid })))
    }

    pub fn get_file(&self, id: u64) -> Option<Arc<FileHandle>> {
        match self.entries.read().get(&id) {
            Some(Handle::File(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn get_dir(&self, id: u64) -> Option<Arc<DirHandle>> {
        match self.entries.read().get(&id) {
            Some(Handle::Dir(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn remove(&self, id: u64) -> Option<Handle> {
        self.entries.write().remove(&id)
    }

    fn insert(&self, handle: Handle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(id, handle);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_and_dir_handles_do_not_mix() {
        let table = HandleTable::new();
        let f = table.insert_file("/f".to_string(), true);
        let d = table.insert_dir("/d".to_string());

        assert_eq!(table.get_file(f).unwrap().fid, "/f");
        assert!(table.get_file(d).is_none());
        assert_eq!(table.get_dir(d).unwrap().fid, "/d");
        assert!(table.get_dir(f).is_none());

        assert!(table.remove(f).is_some());
        assert!(table.get_file(f).is_none());
    }

    #[test]
    fn dirty_flag_is_sticky_until_taken() {
        let table = HandleTable::new();
        let id = table.insert_file("/f".to_string(), true);
        let handle = table.get_file(id).unwrap();
        assert!(!handle.take_dirty());
        handle.mark_dirty();
        assert!(handle.take_dirty());
        assert!(!handle.take_dirty());
    }
}
