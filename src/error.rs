//! Errors surfaced by the filesystem core.

use std::{fmt, io};

/// Result alias for filesystem operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error raised by the filesystem core.
///
/// The mount adapter translates each kind into an errno at the FUSE
/// boundary. The core never retries a failed operation.
#[derive(Debug)]
pub enum Error {
    /// A name lookup failed.
    NotFound,
    /// A directory entry name is longer than 28 bytes or contains `/`.
    NameTooLong,
    /// The inode table has no free record left.
    NoInodes,
    /// The sector map has no free sector left.
    NoSpace,
    /// The directory still contains entries other than `.` and `..`.
    NotEmpty,
    /// A write would start past the current end of the file.
    BadOffset,
    /// A sector chain references a free sector, leaves the data pool, or
    /// loops back on itself.
    Corrupt,
    /// The operation requires a file type the target is not.
    WrongType,
    /// An I/O error on the backing image.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(fmt, "no such file or directory"),
            Self::NameTooLong => write!(fmt, "name too long"),
            Self::NoInodes => write!(fmt, "out of inodes"),
            Self::NoSpace => write!(fmt, "out of data sectors"),
            Self::NotEmpty => write!(fmt, "directory not empty"),
            Self::BadOffset => write!(fmt, "write offset past the end of the file"),
            Self::Corrupt => write!(fmt, "corrupted sector chain"),
            Self::WrongType => write!(fmt, "invalid file type for the operation"),
            Self::Io(e) => write!(fmt, "{e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
