use std::fmt;
use std::io;

/// Failure values surfaced at the File / Cache / TransferBridge boundary.
/// The FUSE binding maps them onto errno just before replying. The remote
/// kinds belong to bridge implementations; retries for transient failures
/// stay behind the bridge.
#[derive(Debug)]
#[allow(dead_code)]
pub enum DataError {
    OutOfMemoryBudget,
    OutOfDiskBudget,
    ScratchIo(io::Error),
    NotFound,
    InvalidArgument,
    RemoteTransient(String),
    RemoteFatal(String),
    Renamed,
}

impl DataError {
    pub fn to_errno(&self) -> i32 {
        match self {
            DataError::OutOfMemoryBudget | DataError::OutOfDiskBudget => libc::ENOSPC,
            DataError::ScratchIo(ioe) => ioe.raw_os_error().unwrap_or(libc::EIO),
            DataError::NotFound => libc::ENOENT,
            DataError::InvalidArgument => libc::EINVAL,
            DataError::RemoteTransient(_) => libc::EAGAIN,
            DataError::RemoteFatal(_) => libc::EIO,
            DataError::Renamed => libc::ESTALE,
        }
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::OutOfMemoryBudget => write!(f, "cache memory budget exhausted"),
            DataError::OutOfDiskBudget => write!(f, "disk cache budget exhausted"),
            DataError::ScratchIo(ioe) => write!(f, "scratch i/o failure: {ioe}"),
            DataError::NotFound => write!(f, "no such file"),
            DataError::InvalidArgument => write!(f, "invalid argument"),
            DataError::RemoteTransient(msg) => write!(f, "transient remote failure: {msg}"),
            DataError::RemoteFatal(msg) => write!(f, "remote failure: {msg}"),
            DataError::Renamed => write!(f, "file was renamed"),
        }
    }
}

impl std::error::Error for DataError {}

impl From<io::Error> for DataError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::NotFound => DataError::NotFound,
            _ => DataError::ScratchIo(value),
        }
    }
}

pub type DataResult<T> = Result<T, DataError>;
