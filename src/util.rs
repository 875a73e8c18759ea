use crate::data::meta::{FileKind, FileMeta};
use crate::error::DataError;
use fuse3::FileType;
use fuse3::path::reply::FileAttr;
use std::ffi::OsStr;

pub fn errno_from_data(err: &DataError) -> fuse3::Errno {
    fuse3::Errno::from(err.to_errno())
}

/// Object keys are UTF-8; a name the store cannot express is rejected
/// before it reaches the cache.
pub fn fid_from_os(path: &OsStr) -> Result<String, fuse3::Errno> {
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| fuse3::Errno::from(libc::EINVAL))
}

/// File id of `name` under `parent`. Trimming the parent's trailing
/// separator makes the root (`/`) and nested directories compose the
/// same way, and the result is already the cache/object key.
pub fn child_fid(parent: &OsStr, name: &OsStr) -> Result<String, fuse3::Errno> {
    let parent = fid_from_os(parent)?;
    let name = fid_from_os(name)?;
    Ok(format!("{}/{name}", parent.trim_end_matches('/')))
}

pub fn file_type_from_kind(kind: FileKind) -> FileType {
    match kind {
        FileKind::Regular => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
    }
}

pub fn file_attr_from_meta(meta: &FileMeta) -> FileAttr {
    let kind = file_type_from_kind(meta.kind);
    let perm = fuse3::perm_from_mode_and_kind(kind, meta.mode as libc::mode_t);

    FileAttr {
        size: meta.size,
        blocks: meta.size.div_ceil(512),
        atime: meta.atime,
        mtime: meta.mtime,
        ctime: meta.mtime,
        kind,
        perm,
        nlink: 1,
        uid: meta.uid,
        gid: meta.gid,
        rdev: 0,
        blksize: 4096,
        #[cfg(target_os = "macos")]
        crtime: std::time::UNIX_EPOCH,
        #[cfg(target_os = "macos")]
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn child_fids_compose_from_root_and_nested_parents() {
        assert_eq!(child_fid(OsStr::new("/"), OsStr::new("a")).unwrap(), "/a");
        assert_eq!(
            child_fid(OsStr::new("/a/b"), OsStr::new("c")).unwrap(),
            "/a/b/c"
        );
    }

    #[test]
    fn attr_mirrors_meta() {
        let meta = FileMeta::regular(1025, SystemTime::UNIX_EPOCH);
        let attr = file_attr_from_meta(&meta);
        assert_eq!(attr.size, 1025);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.uid, 0);
    }
}
