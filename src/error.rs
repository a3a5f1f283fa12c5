//! Error types for the siftdb engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Stable discriminant of the error taxonomy.
///
/// Every [`Error`] maps onto exactly one code, so callers can branch on the
/// failure class without matching message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Thread,
    Invalid,
    NoFile,
    NoPerm,
    Open,
    Close,
    Trunc,
    Stat,
    Seek,
    Read,
    Write,
    Mmap,
    Lock,
    Unlink,
    Rename,
    Mkdir,
    Rmdir,
    Metadata,
    RecordHeader,
    NoRecord,
    Keep,
    Misc,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("threading error: {0}")]
    Thread(String),

    #[error("invalid operation: {0}")]
    Invalid(String),

    #[error("file not found: {0}")]
    NoFile(String),

    #[error("no permission: {0}")]
    NoPerm(String),

    #[error("open error: {0}")]
    Open(String),

    #[error("close error: {0}")]
    Close(String),

    #[error("truncate error: {0}")]
    Trunc(String),

    #[error("stat error: {0}")]
    Stat(String),

    #[error("seek error: {0}")]
    Seek(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("mmap error: {0}")]
    Mmap(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("unlink error: {0}")]
    Unlink(String),

    #[error("rename error: {0}")]
    Rename(String),

    #[error("mkdir error: {0}")]
    Mkdir(String),

    #[error("rmdir error: {0}")]
    Rmdir(String),

    #[error("invalid metadata: {0}")]
    Metadata(String),

    #[error("corrupt record header: {0}")]
    RecordHeader(String),

    #[error("no record found")]
    NoRecord,

    #[error("existing record")]
    Keep,

    #[error("miscellaneous error: {0}")]
    Misc(String),
}

impl Error {
    /// The taxonomy code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Thread(_) => ErrorCode::Thread,
            Error::Invalid(_) => ErrorCode::Invalid,
            Error::NoFile(_) => ErrorCode::NoFile,
            Error::NoPerm(_) => ErrorCode::NoPerm,
            Error::Open(_) => ErrorCode::Open,
            Error::Close(_) => ErrorCode::Close,
            Error::Trunc(_) => ErrorCode::Trunc,
            Error::Stat(_) => ErrorCode::Stat,
            Error::Seek(_) => ErrorCode::Seek,
            Error::Read(_) => ErrorCode::Read,
            Error::Write(_) => ErrorCode::Write,
            Error::Mmap(_) => ErrorCode::Mmap,
            Error::Lock(_) => ErrorCode::Lock,
            Error::Unlink(_) => ErrorCode::Unlink,
            Error::Rename(_) => ErrorCode::Rename,
            Error::Mkdir(_) => ErrorCode::Mkdir,
            Error::Rmdir(_) => ErrorCode::Rmdir,
            Error::Metadata(_) => ErrorCode::Metadata,
            Error::RecordHeader(_) => ErrorCode::RecordHeader,
            Error::NoRecord => ErrorCode::NoRecord,
            Error::Keep => ErrorCode::Keep,
            Error::Misc(_) => ErrorCode::Misc,
        }
    }

    /// Classify an I/O failure at `path` into the taxonomy, preferring the
    /// permission / absence codes over the generic operation code `fallback`.
    pub(crate) fn from_io(err: std::io::Error, path: &std::path::Path, fallback: IoOp) -> Self {
        use std::io::ErrorKind;
        let ctx = format!("{}: {}", path.display(), err);
        match err.kind() {
            ErrorKind::NotFound => Error::NoFile(ctx),
            ErrorKind::PermissionDenied => Error::NoPerm(ctx),
            _ => match fallback {
                IoOp::Open => Error::Open(ctx),
                IoOp::Trunc => Error::Trunc(ctx),
                IoOp::Stat => Error::Stat(ctx),
                IoOp::Seek => Error::Seek(ctx),
                IoOp::Read => Error::Read(ctx),
                IoOp::Write => Error::Write(ctx),
                IoOp::Lock => Error::Lock(ctx),
                IoOp::Unlink => Error::Unlink(ctx),
                IoOp::Rename => Error::Rename(ctx),
                IoOp::Mkdir => Error::Mkdir(ctx),
            },
        }
    }
}

/// Which filesystem operation failed, for [`Error::from_io`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum IoOp {
    Open,
    Trunc,
    Stat,
    Seek,
    Read,
    Write,
    Lock,
    Unlink,
    Rename,
    Mkdir,
}
