use crate::error::{DataError, DataResult};
use std::fs::{File as StdFile, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Where the bytes of a page live.
#[derive(Debug)]
pub enum PageBody {
    Mem(Vec<u8>),
    Disk { path: PathBuf, file_offset: u64 },
}

/// A contiguous byte range of one file, the unit of cache I/O.
///
/// Pages never overlap within a file and are owned by the file's page map;
/// all bounds checking against sibling pages happens one level up.
#[derive(Debug)]
pub struct Page {
    offset: u64,
    size: usize,
    body: PageBody,
}

impl Page {
    pub fn new_mem(offset: u64, data: &[u8]) -> Self {
        Self {
            offset,
            size: data.len(),
            body: PageBody::Mem(data.to_vec()),
        }
    }

    /// Create a disk-backed page by writing `data` into its scratch file.
    /// The scratch file is created (or truncated) at `path`.
    pub fn new_disk(offset: u64, data: &[u8], path: PathBuf) -> DataResult<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(DataError::ScratchIo)?;
        file.write_all(data).map_err(DataError::ScratchIo)?;
        Ok(Self {
            offset,
            size: data.len(),
            body: PageBody::Disk {
                path,
                file_offset: 0,
            },
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte covered by this page.
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }

    pub fn in_memory(&self) -> bool {
        matches!(self.body, PageBody::Mem(_))
    }

    /// Copy `len` bytes starting at file offset `off` into `out`.
    /// Preconditions: `off >= self.offset` and the range lies within the page.
    pub fn read(&self, off: u64, len: usize, out: &mut [u8]) -> DataResult<()> {
        if len == 0 {
            return Ok(());
        }
        if off < self.offset || off + len as u64 > self.end() || out.len() < len {
            return Err(DataError::InvalidArgument);
        }
        let rel = (off - self.offset) as usize;
        match &self.body {
            PageBody::Mem(buf) => {
                out[..len].copy_from_slice(&buf[rel..rel + len]);
                Ok(())
            }
            PageBody::Disk { path, file_offset } => {
                let mut file = StdFile::open(path).map_err(DataError::ScratchIo)?;
                file.seek(SeekFrom::Start(file_offset + rel as u64))
                    .map_err(DataError::ScratchIo)?;
                file.read_exact(&mut out[..len]).map_err(DataError::ScratchIo)?;
                Ok(())
            }
        }
    }

    /// Overwrite bytes starting at file offset `off`. The write may extend
    /// the page in place when it lands exactly at the current tail;
    /// anything further out is the file's job to split into a new page.
    pub fn write(&mut self, off: u64, src: &[u8]) -> DataResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        if off < self.offset || off > self.end() {
            return Err(DataError::InvalidArgument);
        }
        let rel = (off - self.offset) as usize;
        let new_end = rel + src.len();
        match &mut self.body {
            PageBody::Mem(buf) => {
                if new_end > buf.len() {
                    buf.resize(new_end, 0);
                }
                buf[rel..new_end].copy_from_slice(src);
            }
            PageBody::Disk { path, file_offset } => {
                let mut file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(DataError::ScratchIo)?;
                file.seek(SeekFrom::Start(*file_offset + rel as u64))
                    .map_err(DataError::ScratchIo)?;
                file.write_all(src).map_err(DataError::ScratchIo)?;
            }
        }
        self.size = self.size.max(new_end);
        Ok(())
    }

    /// Replace the body with `data`, preserving the offset.
    pub fn set_content(&mut self, data: &[u8]) -> DataResult<()> {
        match &mut self.body {
            PageBody::Mem(buf) => {
                buf.clear();
                buf.extend_from_slice(data);
            }
            PageBody::Disk { path, file_offset } => {
                let mut file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(DataError::ScratchIo)?;
                file.seek(SeekFrom::Start(*file_offset))
                    .map_err(DataError::ScratchIo)?;
                file.write_all(data).map_err(DataError::ScratchIo)?;
                file.set_len(*file_offset + data.len() as u64)
                    .map_err(DataError::ScratchIo)?;
            }
        }
        self.size = data.len();
        Ok(())
    }

    /// A readable stream over the page body. Disk pages reopen their
    /// scratch file positioned at the page start.
    pub fn reader(&self) -> DataResult<Box<dyn Read + Send>> {
        match &self.body {
            PageBody::Mem(buf) => Ok(Box::new(std::io::Cursor::new(buf.clone()))),
            PageBody::Disk { path, file_offset } => {
                let mut file = StdFile::open(path).map_err(DataError::ScratchIo)?;
                file.seek(SeekFrom::Start(*file_offset))
                    .map_err(DataError::ScratchIo)?;
                Ok(Box::new(file.take(self.size as u64)))
            }
        }
    }

    /// Shorten the page so it ends at file offset `new_end`.
    /// The scratch file of a disk page is left at its old length.
    pub fn truncate(&mut self, new_end: u64) {
        debug_assert!(new_end > self.offset && new_end < self.end());
        let new_size = (new_end - self.offset) as usize;
        if let PageBody::Mem(buf) = &mut self.body {
            buf.truncate(new_size);
        }
        self.size = new_size;
    }

    /// Release backing storage. Mem pages just drop their buffer; disk
    /// pages unlink their scratch file.
    pub fn release(&mut self) -> DataResult<()> {
        match &self.body {
            PageBody::Mem(_) => Ok(()),
            PageBody::Disk { path, .. } => match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(DataError::ScratchIo(e)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_page_read_write_roundtrip() {
        let mut page = Page::new_mem(100, b"hello world");
        assert_eq!(page.offset(), 100);
        assert_eq!(page.size(), 11);
        assert_eq!(page.end(), 111);

        let mut out = vec![0u8; 5];
        page.read(106, 5, &mut out).unwrap();
        assert_eq!(&out, b"world");

        page.write(106, b"earth").unwrap();
        let mut all = vec![0u8; 11];
        page.read(100, 11, &mut all).unwrap();
        assert_eq!(&all, b"hello earth");
    }

    #[test]
    fn mem_page_extends_at_tail() {
        let mut page = Page::new_mem(0, b"abc");
        page.write(3, b"def").unwrap();
        assert_eq!(page.size(), 6);
        let mut out = vec![0u8; 6];
        page.read(0, 6, &mut out).unwrap();
        assert_eq!(&out, b"abcdef");
    }

    #[test]
    fn read_past_page_end_is_rejected() {
        let page = Page::new_mem(0, b"abc");
        let mut out = vec![0u8; 4];
        assert!(matches!(
            page.read(0, 4, &mut out),
            Err(DataError::InvalidArgument)
        ));
        assert!(matches!(
            page.read(1, 3, &mut out),
            Err(DataError::InvalidArgument)
        ));
    }

    #[test]
    fn zero_length_ops_are_noops() {
        let mut page = Page::new_mem(10, b"xyz");
        let mut out = Vec::new();
        page.read(12, 0, &mut out).unwrap();
        page.write(13, b"").unwrap();
        assert_eq!(page.size(), 3);
    }

    #[test]
    fn disk_page_roundtrip_and_release() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("page_0");
        let mut page = Page::new_disk(4096, b"spilled bytes", path.clone()).unwrap();
        assert!(!page.in_memory());

        let mut out = vec![0u8; 7];
        page.read(4096 + 8, 5, &mut out[..5]).unwrap();
        assert_eq!(&out[..5], b"bytes");

        page.write(4096, b"SPILLED").unwrap();
        let mut all = vec![0u8; 13];
        page.read(4096, 13, &mut all).unwrap();
        assert_eq!(&all, b"SPILLED bytes");

        let mut stream = page.reader().unwrap();
        let mut streamed = Vec::new();
        stream.read_to_end(&mut streamed).unwrap();
        assert_eq!(streamed, b"SPILLED bytes");

        page.release().unwrap();
        assert!(!path.exists());
        // releasing twice is fine
        page.release().unwrap();
    }

    #[test]
    fn set_content_replaces_body_in_place() {
        let mut page = Page::new_mem(0, b"old old old");
        page.set_content(b"new").unwrap();
        assert_eq!(page.size(), 3);
        assert_eq!(page.offset(), 0);
        let mut out = vec![0u8; 3];
        page.read(0, 3, &mut out).unwrap();
        assert_eq!(&out, b"new");
    }
}
