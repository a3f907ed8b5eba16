#![forbid(unsafe_code)]
//! Error types for PageFS.
//!
//! # Error Taxonomy
//!
//! PageFS separates two kinds of failure:
//!
//! | Kind | Mechanism | Purpose |
//! |------|-----------|---------|
//! | User-visible | [`PfsError`] via [`Result`] | Bad arguments, exhausted space, missing names; reported back to the caller as an errno |
//! | Invariant violation | [`fault`] / [`pfs_assert!`] | Corrupt index link, double free, refcount underflow; logged and the process aborts |
//!
//! Invariant violations are never returned as `Err`: once one is observed the
//! in-memory state can no longer be trusted.
//!
//! ## errno Mapping
//!
//! Every `PfsError` variant maps to exactly one POSIX errno via
//! [`PfsError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `NotFound` | `ENOENT` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NoSpace` | `ENOSPC` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NotSupported` | `EOPNOTSUPP` |
//! | `FileTooBig` | `EFBIG` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `OutOfRange` | `ENXIO` |
//! | `InvalidSuperblock` | `EINVAL` |
//! | `Io` | raw OS error or `EIO` |
//!
//! `ParseError` from `pfs-types` is converted to `InvalidSuperblock` by
//! `pfs-core` at the mount boundary; this crate does not depend on
//! `pfs-types`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::error;

/// Space class exhausted by a failed allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    Pages,
    InodeSlots,
    DirentSlots,
    DataRefSlots,
    FileRefSlots,
    Inodes,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pages => "pages",
            Self::InodeSlots => "inode slots",
            Self::DirentSlots => "dirent slots",
            Self::DataRefSlots => "data-block-ref slots",
            Self::FileRefSlots => "file-block-ref slots",
            Self::Inodes => "inodes",
        };
        f.write_str(name)
    }
}

/// Unified error type for all PageFS operations.
#[derive(Debug, Error)]
pub enum PfsError {
    /// Backing device I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Named entry or inode not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// Removal of a directory that still has children.
    #[error("directory not empty")]
    NotEmpty,

    #[error("no space left: {0} exhausted")]
    NoSpace(Resource),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Request is well formed but this engine does not implement it.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Offset or end of range past the maximum file size.
    #[error("file too big")]
    FileTooBig,

    #[error("is a directory")]
    IsDirectory,

    #[error("not a directory")]
    NotDirectory,

    #[error("name too long")]
    NameTooLong,

    /// Seek origin at or past end of file, or no matching region.
    #[error("offset out of range")]
    OutOfRange,

    /// Superblock image failed validation (magic, checksum, version, size).
    #[error("invalid superblock: {0}")]
    InvalidSuperblock(String),
}

impl PfsError {
    /// POSIX errno for this error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NotFound(_) => libc::ENOENT,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NoSpace(_) => libc::ENOSPC,
            Self::InvalidArgument(_) | Self::InvalidSuperblock(_) => libc::EINVAL,
            Self::NotSupported(_) => libc::EOPNOTSUPP,
            Self::FileTooBig => libc::EFBIG,
            Self::IsDirectory => libc::EISDIR,
            Self::NotDirectory => libc::ENOTDIR,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::OutOfRange => libc::ENXIO,
        }
    }

    /// Signed reply code: the negated errno.
    #[must_use]
    pub fn to_neg_errno(&self) -> i32 {
        -self.to_errno()
    }

    /// True for lookups that simply found nothing; callers log these quietly.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias using `PfsError`.
pub type Result<T> = std::result::Result<T, PfsError>;

/// Report a broken internal invariant and abort.
///
/// Used for conditions that cannot arise from user input: a second insert of
/// the same inode number, a double free, a refcount released below zero.
#[cold]
pub fn fault(file: &'static str, line: u32, condition: &str) -> ! {
    error!(file, line, condition, "invariant_fault");
    std::process::abort()
}

/// Abort through [`fault`] when `cond` does not hold.
#[macro_export]
macro_rules! pfs_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::fault(file!(), line!(), stringify!($cond));
        }
    };
    ($cond:expr, $msg:literal $(,)?) => {
        if !$cond {
            $crate::fault(file!(), line!(), $msg);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(PfsError, libc::c_int)> = vec![
            (PfsError::Io(std::io::Error::other("test")), libc::EIO),
            (PfsError::NotFound("x".into()), libc::ENOENT),
            (PfsError::NotEmpty, libc::ENOTEMPTY),
            (PfsError::NoSpace(Resource::Pages), libc::ENOSPC),
            (PfsError::NoSpace(Resource::DirentSlots), libc::ENOSPC),
            (PfsError::InvalidArgument("len == 0".into()), libc::EINVAL),
            (PfsError::NotSupported("insert range".into()), libc::EOPNOTSUPP),
            (PfsError::FileTooBig, libc::EFBIG),
            (PfsError::IsDirectory, libc::EISDIR),
            (PfsError::NotDirectory, libc::ENOTDIR),
            (PfsError::NameTooLong, libc::ENAMETOOLONG),
            (PfsError::OutOfRange, libc::ENXIO),
            (PfsError::InvalidSuperblock("magic".into()), libc::EINVAL),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
            assert_eq!(error.to_neg_errno(), -*expected_errno);
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(PfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            PfsError::NoSpace(Resource::InodeSlots).to_string(),
            "no space left: inode slots exhausted"
        );
        assert_eq!(
            PfsError::NotFound("name `a`".into()).to_string(),
            "not found: name `a`"
        );
        assert_eq!(PfsError::FileTooBig.to_string(), "file too big");
    }

    #[test]
    fn not_found_predicate() {
        assert!(PfsError::NotFound(String::new()).is_not_found());
        assert!(!PfsError::NotEmpty.is_not_found());
    }

    #[test]
    fn passing_assert_does_not_fault() {
        let refcount = 1_u32;
        pfs_assert!(refcount > 0);
        pfs_assert!(refcount == 1, "refcount mismatch");
    }
}
