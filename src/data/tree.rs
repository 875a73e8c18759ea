use crate::data::cache::Cache;
use crate::data::meta::{FileMeta, FileMetaDataManager};
use crate::error::{DataError, DataResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

pub type NodeId = u64;

#[derive(Debug)]
struct Node {
    path: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    meta: Option<FileMeta>,
    /// Whether the children list reflects a remote listing. Directories
    /// start unloaded; the binding lists the remote before trusting them.
    children_loaded: bool,
}

struct TreeInner {
    nodes: HashMap<NodeId, Node>,
    by_path: HashMap<String, NodeId>,
    next_id: NodeId,
    root: NodeId,
}

/// The namespace: path → node with parent/child links and per-file
/// metadata. Nodes form an arena keyed by id, parents referenced by id,
/// so the graph carries no cyclic ownership. One mutex guards it all.
///
/// A cold node surrenders its metadata to the bounded manager instead of
/// keeping it pinned in the tree; the manager never calls back in, so its
/// lock always nests inside the tree's.
pub struct DirectoryTree {
    inner: Mutex<TreeInner>,
    meta_manager: Option<Arc<FileMetaDataManager>>,
}

fn leaf_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(n) => &path[..n],
        None => "/",
    }
}

impl DirectoryTree {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A tree that hands cold metadata to `manager` instead of holding it.
    pub fn with_meta_manager(manager: Arc<FileMetaDataManager>) -> Self {
        Self::build(Some(manager))
    }

    fn build(meta_manager: Option<Arc<FileMetaDataManager>>) -> Self {
        let mut nodes = HashMap::new();
        let mut by_path = HashMap::new();
        let root: NodeId = 1;
        nodes.insert(
            root,
            Node {
                path: "/".to_string(),
                parent: None,
                children: Vec::new(),
                meta: Some(FileMeta::directory(SystemTime::now())),
                children_loaded: false,
            },
        );
        by_path.insert("/".to_string(), root);
        Self {
            inner: Mutex::new(TreeInner {
                nodes,
                by_path,
                next_id: root + 1,
                root,
            }),
            meta_manager,
        }
    }

    pub fn has(&self, path: &str) -> bool {
        self.inner.lock().by_path.contains_key(path)
    }

    /// Metadata of `path`, if the node exists and still holds it. A node
    /// that surrendered its metadata to the manager answers `None` here
    /// and the caller falls back to the manager or the remote.
    pub fn find(&self, path: &str) -> Option<FileMeta> {
        let inner = self.inner.lock();
        let id = *inner.by_path.get(path)?;
        inner.nodes[&id].meta.clone()
    }

    /// Insert a node. The parent must already exist and be a directory;
    /// intermediate directories are never fabricated here, resolving them
    /// against the remote listing is the caller's job.
    pub fn insert(&self, path: &str, meta: FileMeta) -> DataResult<()> {
        if path == "/" {
            return Err(DataError::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        if inner.by_path.contains_key(path) {
            // refresh in place
            let id = inner.by_path[path];
            let node = inner.nodes.get_mut(&id).expect("indexed node missing");
            node.meta = Some(meta);
            return Ok(());
        }
        let parent_id = *inner
            .by_path
            .get(parent_path(path))
            .ok_or(DataError::NotFound)?;
        let parent = inner.nodes.get(&parent_id).expect("indexed node missing");
        if !parent.meta.as_ref().is_none_or(|m| m.is_dir()) {
            return Err(DataError::InvalidArgument);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.nodes.insert(
            id,
            Node {
                path: path.to_string(),
                parent: Some(parent_id),
                children: Vec::new(),
                meta: Some(meta),
                children_loaded: false,
            },
        );
        inner
            .nodes
            .get_mut(&parent_id)
            .expect("indexed node missing")
            .children
            .push(id);
        inner.by_path.insert(path.to_string(), id);
        Ok(())
    }

    /// Remove a single node. Directories must be empty.
    pub fn remove(&self, path: &str) -> DataResult<()> {
        let mut inner = self.inner.lock();
        if *inner.by_path.get(path).ok_or(DataError::NotFound)? == inner.root {
            return Err(DataError::InvalidArgument);
        }
        let id = inner.by_path[path];
        if !inner.nodes[&id].children.is_empty() {
            return Err(DataError::InvalidArgument);
        }
        let parent = inner.nodes[&id].parent;
        if let Some(pid) = parent {
            if let Some(p) = inner.nodes.get_mut(&pid) {
                p.children.retain(|&c| c != id);
            }
        }
        inner.nodes.remove(&id);
        inner.by_path.remove(path);
        Ok(())
    }

    /// Child (name, metadata) pairs of a directory, sorted by name.
    pub fn children(&self, path: &str) -> DataResult<Vec<(String, Option<FileMeta>)>> {
        let inner = self.inner.lock();
        let id = *inner.by_path.get(path).ok_or(DataError::NotFound)?;
        let node = &inner.nodes[&id];
        if !node.meta.as_ref().is_none_or(|m| m.is_dir()) {
            return Err(DataError::InvalidArgument);
        }
        let mut out: Vec<(String, Option<FileMeta>)> = node
            .children
            .iter()
            .map(|cid| {
                let child = &inner.nodes[cid];
                (leaf_name(&child.path).to_string(), child.meta.clone())
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub fn children_loaded(&self, path: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .by_path
            .get(path)
            .map(|id| inner.nodes[id].children_loaded)
            .unwrap_or(false)
    }

    pub fn mark_children_loaded(&self, path: &str) {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_path.get(path) {
            if let Some(node) = inner.nodes.get_mut(&id) {
                node.children_loaded = true;
            }
        }
    }

    /// Rename a node, rewriting every descendant path under the tree lock.
    /// Returns the (old, new) path of each regular file touched so the
    /// caller can rebind their cache entries.
    pub fn rename(&self, old: &str, new: &str) -> DataResult<Vec<(String, String)>> {
        if old == "/" || new == "/" {
            return Err(DataError::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        let id = *inner.by_path.get(old).ok_or(DataError::NotFound)?;
        let new_parent_id = *inner
            .by_path
            .get(parent_path(new))
            .ok_or(DataError::NotFound)?;

        // a replaced target must be a leaf; richer overwrite rules live
        // in the binding
        if let Some(&target) = inner.by_path.get(new) {
            if !inner.nodes[&target].children.is_empty() {
                return Err(DataError::InvalidArgument);
            }
            let tp = inner.nodes[&target].parent;
            if let Some(pid) = tp {
                if let Some(p) = inner.nodes.get_mut(&pid) {
                    p.children.retain(|&c| c != target);
                }
            }
            inner.nodes.remove(&target);
            inner.by_path.remove(new);
        }

        // relink under the new parent
        if let Some(pid) = inner.nodes[&id].parent {
            if let Some(p) = inner.nodes.get_mut(&pid) {
                p.children.retain(|&c| c != id);
            }
        }
        inner
            .nodes
            .get_mut(&new_parent_id)
            .expect("indexed node missing")
            .children
            .push(id);
        inner.nodes.get_mut(&id).expect("indexed node missing").parent = Some(new_parent_id);

        // rewrite the whole subtree's path keys
        let mut renamed_files = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let (old_path, children): (String, Vec<NodeId>) = {
                let node = &inner.nodes[&cur];
                (node.path.clone(), node.children.clone())
            };
            let new_path = if cur == id {
                new.to_string()
            } else {
                format!("{new}{}", &old_path[old.len()..])
            };
            inner.by_path.remove(&old_path);
            inner.by_path.insert(new_path.clone(), cur);
            let node = inner.nodes.get_mut(&cur).expect("indexed node missing");
            let is_file = node.meta.as_ref().map(|m| !m.is_dir()).unwrap_or(true);
            node.path = new_path.clone();
            if is_file {
                renamed_files.push((old_path, new_path));
            }
            stack.extend(children);
        }
        Ok(renamed_files)
    }

    /// Drop a whole subtree and erase every regular file it contained
    /// from the data cache.
    pub fn invalidate(&self, path: &str, cache: &Cache) -> DataResult<()> {
        let stale = {
            let mut inner = self.inner.lock();
            let id = *inner.by_path.get(path).ok_or(DataError::NotFound)?;
            if id == inner.root {
                return Err(DataError::InvalidArgument);
            }
            if let Some(pid) = inner.nodes[&id].parent {
                if let Some(p) = inner.nodes.get_mut(&pid) {
                    p.children.retain(|&c| c != id);
                }
            }
            let mut stale = Vec::new();
            let mut stack = vec![id];
            while let Some(cur) = stack.pop() {
                let node = inner.nodes.remove(&cur).expect("indexed node missing");
                inner.by_path.remove(&node.path);
                let is_file = node.meta.as_ref().map(|m| !m.is_dir()).unwrap_or(true);
                if is_file {
                    stale.push(node.path);
                }
                stack.extend(node.children);
            }
            stale
        };
        // the cache has its own lock; never call into it while holding ours
        for fid in stale {
            cache.erase(&fid);
        }
        Ok(())
    }

    /// Metadata side-effect of a successful cache write: the node's size
    /// watermark moves with the write end, mtime follows, and a write
    /// under a live handle re-arms the open count so re-attached metadata
    /// is never mistaken for cold.
    pub fn apply_file_write(&self, path: &str, write_end: u64, open: bool) {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_path.get(path) {
            if let Some(node) = inner.nodes.get_mut(&id) {
                if let Some(meta) = node.meta.as_mut() {
                    if write_end > meta.size {
                        meta.size = write_end;
                    }
                    if open {
                        meta.open_count = meta.open_count.max(1);
                    }
                    meta.mtime = SystemTime::now();
                }
            }
        }
    }

    pub fn set_file_size(&self, path: &str, size: u64) {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_path.get(path) {
            if let Some(node) = inner.nodes.get_mut(&id) {
                if let Some(meta) = node.meta.as_mut() {
                    meta.size = size;
                    meta.mtime = SystemTime::now();
                }
            }
        }
    }

    pub fn set_file_open(&self, path: &str, open: bool) {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_path.get(path) {
            if let Some(node) = inner.nodes.get_mut(&id) {
                if let Some(meta) = node.meta.as_mut() {
                    if open {
                        meta.open_count += 1;
                    } else {
                        meta.open_count = meta.open_count.saturating_sub(1);
                    }
                }
            }
        }
    }

    pub fn update_meta(&self, path: &str, apply: impl FnOnce(&mut FileMeta)) -> bool {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_path.get(path) {
            if let Some(node) = inner.nodes.get_mut(&id) {
                if let Some(meta) = node.meta.as_mut() {
                    apply(meta);
                    return true;
                }
            }
        }
        false
    }

    /// Hand a cold node's metadata to the bounded manager. Called when
    /// the data cache evicts the file; a node held open keeps its
    /// metadata in place.
    pub fn surrender_meta(&self, path: &str) {
        let Some(manager) = &self.meta_manager else {
            return;
        };
        let mut inner = self.inner.lock();
        let Some(&id) = inner.by_path.get(path) else {
            return;
        };
        let Some(node) = inner.nodes.get_mut(&id) else {
            return;
        };
        if node.meta.as_ref().is_some_and(|m| m.open_count == 0) {
            if let Some(meta) = node.meta.take() {
                manager.put(path, meta);
                tracing::debug!(fid = path, "surrendered cold metadata");
            }
        }
    }

    /// Take the metadata out of a node, leaving the node in place. Used
    /// when a cold node hands its metadata to the bounded manager.
    pub fn detach_meta(&self, path: &str) -> Option<FileMeta> {
        let mut inner = self.inner.lock();
        let id = *inner.by_path.get(path)?;
        inner.nodes.get_mut(&id)?.meta.take()
    }

    pub fn attach_meta(&self, path: &str, meta: FileMeta) -> bool {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_path.get(path) {
            if let Some(node) = inner.nodes.get_mut(&id) {
                node.meta = Some(meta);
                return true;
            }
        }
        false
    }
}

impl Default for DirectoryTree {
    fn default() -> Self {
        Self::new()
    }
}
