use crate::error::{DataError, DataResult};
use nix::sys::statvfs::statvfs;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Bytes kept free on the scratch filesystem beyond any allocation request.
pub const DISK_RESERVE_BYTES: u64 = 16 * 1024 * 1024;

const HASH_BYTES: usize = 16; // first 16 bytes of SHA-256, 32 hex chars

fn hash_file_id(fid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fid.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..HASH_BYTES])
}

/// Scratch file backing one spilled page. The name embeds the file id hash
/// and the page offset so distinct files never collide, and so the path
/// stays stable when the owning file is renamed.
pub fn page_file_path(folder: &Path, fid: &str, offset: u64) -> PathBuf {
    folder.join(format!("{}_{offset}", hash_file_id(fid)))
}

pub fn ensure_dir_exists(folder: &Path) -> DataResult<()> {
    fs::create_dir_all(folder).map_err(DataError::ScratchIo)
}

/// Whether the filesystem holding `folder` can take `size` more bytes while
/// keeping the reserve free. Advisory only; the allocation itself can still
/// fail and is handled per-page.
pub fn is_safe_disk_space(folder: &Path, size: u64) -> bool {
    match statvfs(folder) {
        Ok(stat) => {
            let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
            free >= size + DISK_RESERVE_BYTES
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_paths_differ_by_file_and_offset() {
        let folder = Path::new("/tmp/scratch");
        let a0 = page_file_path(folder, "/bucket/a", 0);
        let a4096 = page_file_path(folder, "/bucket/a", 4096);
        let b0 = page_file_path(folder, "/bucket/b", 0);
        assert_ne!(a0, a4096);
        assert_ne!(a0, b0);
        // stable: same inputs, same path
        assert_eq!(a0, page_file_path(folder, "/bucket/a", 0));
    }

    #[test]
    fn safe_space_check_runs_on_real_mount() {
        let tmp = tempfile::tempdir().unwrap();
        // zero-byte request only needs the reserve; any healthy tmpfs has it
        assert!(is_safe_disk_space(tmp.path(), 0));
    }
}
