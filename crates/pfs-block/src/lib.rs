#![forbid(unsafe_code)]
//! Byte-addressed backing store for the PageFS arena.
//!
//! Provides the [`ByteDevice`] trait with a file-backed implementation
//! (persistent regions) and a lazily materialized memory implementation
//! (volatile regions), the [`DurableCopy`] seam through which persistent
//! mutations are made durable, and [`Region`], the page-addressed view the
//! pool allocator works on.

mod mem;
mod region;

pub use mem::MemByteDevice;
pub use region::{Region, RegionKind};

use pfs_error::{PfsError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Check that `[offset, offset + len)` lies inside a device of `dev_len` bytes.
pub(crate) fn check_range(op: &str, offset: u64, len: usize, dev_len: u64) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| PfsError::InvalidArgument(format!("{op} range overflows u64")))?;
    if end > dev_len {
        return Err(PfsError::InvalidArgument(format!(
            "{op} out of bounds: offset={offset} len={len} dev_len={dev_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range("read", offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(PfsError::Io(std::io::Error::from_raw_os_error(
                libc::EROFS,
            )));
        }
        check_range("write", offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Makes a byte span durable on a persistent region.
///
/// Every page mutation on a persistent region goes through this primitive
/// instead of a plain device write.
pub trait DurableCopy: Send + Sync {
    fn persist(&self, dev: &dyn ByteDevice, offset: u64, bytes: &[u8]) -> Result<()>;
}

/// Portable durable copy: write, then flush the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteThrough;

impl DurableCopy for WriteThrough {
    fn persist(&self, dev: &dyn ByteDevice, offset: u64, bytes: &[u8]) -> Result<()> {
        dev.write_all_at(offset, bytes)?;
        dev.sync()
    }
}
