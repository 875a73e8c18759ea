use crate::error::{DataError, DataResult};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Stat of one remote object.
#[derive(Debug, Clone)]
pub struct ObjectStat {
    pub size: u64,
    pub mtime: SystemTime,
    pub is_prefix: bool,
}

#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub mtime: SystemTime,
}

/// One page of a listing. Backends are free to group directory-like
/// entries under `common_prefixes`, under `objects` (as zero-byte marker
/// keys), or both; callers must accept every combination.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectEntry>,
    pub common_prefixes: Vec<String>,
    pub next_continuation: Option<String>,
}

/// Boundary to the asynchronous transfer executor. Calls block until the
/// transfer reaches a final outcome; retries with backoff for transient
/// failures happen behind this trait, the cache core never retries.
///
/// Keys are the mount-absolute paths used as file ids; a key with a
/// trailing `/` addresses a directory marker.
pub trait TransferBridge: Send + Sync {
    /// Fill `buf` from the object starting at `off`. Returns the bytes
    /// produced, short only when the object ends inside the range.
    fn download_range(&self, fid: &str, off: u64, buf: &mut [u8]) -> DataResult<usize>;

    /// Store `size` bytes from `reader` as the object's new content.
    /// Whether this runs as a single put or a multipart upload is the
    /// implementation's decision.
    fn upload_file(&self, fid: &str, size: u64, reader: &mut dyn Read) -> DataResult<()>;

    fn head_object(&self, fid: &str) -> DataResult<Option<ObjectStat>>;

    fn delete_object(&self, fid: &str) -> DataResult<()>;

    fn rename_object(&self, from: &str, to: &str) -> DataResult<()>;

    fn list_objects(
        &self,
        prefix: &str,
        delimiter: &str,
        continuation: Option<&str>,
    ) -> DataResult<ListPage>;
}

const LIST_PAGE_SIZE: usize = 1000;

/// Object store backed by a local directory. Serves development mounts
/// and every test; the semantics mirror a bucket listed with `/` as the
/// delimiter.
pub struct LocalStore {
    root: PathBuf,
    page_size: usize,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            page_size: LIST_PAGE_SIZE,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_page_size<P: AsRef<Path>>(root: P, page_size: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            page_size: page_size.max(1),
        }
    }

    fn path_for(&self, fid: &str) -> PathBuf {
        self.root.join(fid.trim_start_matches('/').trim_end_matches('/'))
    }

    fn remote_err(e: std::io::Error) -> DataError {
        if e.kind() == std::io::ErrorKind::NotFound {
            DataError::NotFound
        } else {
            DataError::RemoteFatal(e.to_string())
        }
    }
}

impl TransferBridge for LocalStore {
    fn download_range(&self, fid: &str, off: u64, buf: &mut [u8]) -> DataResult<usize> {
        let mut file = fs::File::open(self.path_for(fid)).map_err(Self::remote_err)?;
        file.seek(SeekFrom::Start(off)).map_err(Self::remote_err)?;
        let mut done = 0;
        while done < buf.len() {
            let n = file.read(&mut buf[done..]).map_err(Self::remote_err)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    fn upload_file(&self, fid: &str, size: u64, reader: &mut dyn Read) -> DataResult<()> {
        let path = self.path_for(fid);
        if fid.ends_with('/') {
            // directory marker
            return fs::create_dir_all(path).map_err(Self::remote_err);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(Self::remote_err)?;
        }
        let mut file = fs::File::create(&path).map_err(Self::remote_err)?;
        let copied = std::io::copy(reader, &mut file).map_err(Self::remote_err)?;
        if copied != size {
            return Err(DataError::RemoteFatal(format!(
                "short upload of {fid}: {copied} of {size} bytes"
            )));
        }
        Ok(())
    }

    fn head_object(&self, fid: &str) -> DataResult<Option<ObjectStat>> {
        let path = self.path_for(fid);
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(ObjectStat {
                size: if meta.is_dir() { 0 } else { meta.len() },
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                is_prefix: meta.is_dir(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::remote_err(e)),
        }
    }

    fn delete_object(&self, fid: &str) -> DataResult<()> {
        let path = self.path_for(fid);
        let res = if fid.ends_with('/') || path.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::remote_err(e)),
        }
    }

    fn rename_object(&self, from: &str, to: &str) -> DataResult<()> {
        let to_path = self.path_for(to);
        if let Some(dir) = to_path.parent() {
            fs::create_dir_all(dir).map_err(Self::remote_err)?;
        }
        fs::rename(self.path_for(from), to_path).map_err(Self::remote_err)
    }

    fn list_objects(
        &self,
        prefix: &str,
        delimiter: &str,
        continuation: Option<&str>,
    ) -> DataResult<ListPage> {
        debug_assert_eq!(delimiter, "/", "only '/' delimited listings are used");
        let dir = self.path_for(prefix);
        let mut names: Vec<(String, fs::Metadata)> = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ListPage::default());
            }
            Err(e) => return Err(Self::remote_err(e)),
        };
        for entry in entries {
            let entry = entry.map_err(Self::remote_err)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().map_err(Self::remote_err)?;
            names.push((name, meta));
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let start = match continuation {
            Some(token) => names.partition_point(|(n, _)| n.as_str() <= token),
            None => 0,
        };
        let page = &names[start..(start + self.page_size).min(names.len())];
        let next_continuation = if start + page.len() < names.len() {
            page.last().map(|(n, _)| n.clone())
        } else {
            None
        };

        let base = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        let mut out = ListPage {
            next_continuation,
            ..ListPage::default()
        };
        for (name, meta) in page {
            if meta.is_dir() {
                out.common_prefixes.push(format!("{base}{name}/"));
            } else {
                out.objects.push(ObjectEntry {
                    key: format!("{base}{name}"),
                    size: meta.len(),
                    mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::new(tmp.path());
        (tmp, store)
    }

    fn put(store: &LocalStore, fid: &str, data: &[u8]) {
        let mut cursor = std::io::Cursor::new(data.to_vec());
        store.upload_file(fid, data.len() as u64, &mut cursor).unwrap();
    }

    #[test]
    fn upload_then_ranged_download() {
        let (_tmp, store) = store();
        put(&store, "/dir/obj", b"0123456789");

        let mut buf = [0u8; 4];
        let n = store.download_range("/dir/obj", 3, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"3456");

        // range running past the end comes back short
        let mut buf = [0u8; 8];
        let n = store.download_range("/dir/obj", 6, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..n], b"6789");
    }

    #[test]
    fn download_of_missing_object_is_not_found() {
        let (_tmp, store) = store();
        let mut buf = [0u8; 1];
        assert!(matches!(
            store.download_range("/nope", 0, &mut buf),
            Err(DataError::NotFound)
        ));
    }

    #[test]
    fn head_distinguishes_objects_and_prefixes() {
        let (_tmp, store) = store();
        put(&store, "/d/", b"");
        put(&store, "/d/x", b"abc");

        let dir = store.head_object("/d").unwrap().unwrap();
        assert!(dir.is_prefix);
        let obj = store.head_object("/d/x").unwrap().unwrap();
        assert!(!obj.is_prefix);
        assert_eq!(obj.size, 3);
        assert!(store.head_object("/d/y").unwrap().is_none());
    }

    #[test]
    fn listing_groups_prefixes_and_pages() {
        let (_tmp, store) = store();
        let paged = {
            let root = store.root.clone();
            LocalStore::with_page_size(root, 2)
        };
        put(&store, "/d/", b"");
        put(&store, "/d/a", b"1");
        put(&store, "/d/b/", b"");
        put(&store, "/d/c", b"22");
        put(&store, "/d/d", b"333");

        let mut objects = Vec::new();
        let mut prefixes = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = paged
                .list_objects("/d/", "/", token.as_deref())
                .unwrap();
            objects.extend(page.objects.iter().map(|o| o.key.clone()));
            prefixes.extend(page.common_prefixes.iter().cloned());
            match page.next_continuation {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(objects, vec!["/d/a", "/d/c", "/d/d"]);
        assert_eq!(prefixes, vec!["/d/b/"]);
    }

    #[test]
    fn rename_and_delete() {
        let (_tmp, store) = store();
        put(&store, "/a", b"payload");
        store.rename_object("/a", "/sub/b").unwrap();
        assert!(store.head_object("/a").unwrap().is_none());
        assert_eq!(store.head_object("/sub/b").unwrap().unwrap().size, 7);

        store.delete_object("/sub/b").unwrap();
        assert!(store.head_object("/sub/b").unwrap().is_none());
        // deleting twice is fine
        store.delete_object("/sub/b").unwrap();
    }
}
