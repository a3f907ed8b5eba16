#![forbid(unsafe_code)]
//! Shared value types for PageFS.
//!
//! Unit-carrying newtypes (inode numbers, page numbers), page geometry
//! helpers used by every layer that walks a byte range page by page, POSIX
//! mode/type bits, and the little-endian parsing helpers used by
//! `pfs-ondisk`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Fixed allocation unit of the arena: 4 KiB.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// [`PAGE_SIZE`] as `u64`, for offset arithmetic.
pub const PAGE_SIZE_U64: u64 = 1 << PAGE_SHIFT;

/// Largest file size accepted by the I/O engine (1 PiB).
pub const MAX_FILE_SIZE: u64 = 1 << 50;

/// Largest single read or write request (4 MiB).
pub const MAX_IO_SIZE: u64 = 4 << 20;

/// Longest directory entry name, in bytes.
pub const NAME_MAX: usize = 255;

/// Symlink targets up to this many bytes live inside the inode record.
pub const SYMLINK_INLINE_MAX: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    /// Sentinel returned by lookups that find nothing.
    pub const NULL: Self = Self(0);
    pub const ROOT: Self = Self(1);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Page index within the allocation arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageNumber(pub u64);

impl PageNumber {
    /// Byte offset of the first byte of this page, relative to the arena.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        self.0 << PAGE_SHIFT
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Page geometry ───────────────────────────────────────────────────────────

/// Round `off` down to its page boundary.
#[inline]
#[must_use]
pub fn page_base(off: u64) -> u64 {
    off & !(PAGE_SIZE_U64 - 1)
}

/// Position of `off` within its page.
#[inline]
#[must_use]
#[expect(clippy::cast_possible_truncation)]
pub fn offset_in_page(off: u64) -> usize {
    (off & (PAGE_SIZE_U64 - 1)) as usize
}

/// First page boundary strictly after `off`.
#[inline]
#[must_use]
pub fn next_page(off: u64) -> u64 {
    page_base(off) + PAGE_SIZE_U64
}

#[inline]
#[must_use]
pub fn is_page_aligned(off: u64) -> bool {
    offset_in_page(off) == 0
}

/// Round `off` up to a page boundary.
#[inline]
#[must_use]
pub fn page_align_up(off: u64) -> u64 {
    if is_page_aligned(off) {
        off
    } else {
        next_page(off)
    }
}

/// Bytes to process at `off` before hitting either the next page boundary
/// or `end`, whichever comes first.
#[inline]
#[must_use]
#[expect(clippy::cast_possible_truncation)]
pub fn span_in_page(off: u64, end: u64) -> usize {
    let next = next_page(off);
    (next.min(end) - off) as usize
}

/// Iterator over `(offset, len)` page-bounded spans covering `[start, end)`.
#[derive(Debug, Clone)]
pub struct PageSpans {
    off: u64,
    end: u64,
}

impl Iterator for PageSpans {
    type Item = (u64, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.off >= self.end {
            return None;
        }
        let off = self.off;
        let len = span_in_page(off, self.end);
        self.off = next_page(off);
        Some((off, len))
    }
}

/// Walk `[start, end)` in page-bounded spans.
#[must_use]
pub fn page_spans(start: u64, end: u64) -> PageSpans {
    PageSpans { off: start, end }
}

// ── Mode bits ───────────────────────────────────────────────────────────────

pub const S_IFMT: u32 = 0o170_000;
pub const S_IFSOCK: u32 = 0o140_000;
pub const S_IFLNK: u32 = 0o120_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFBLK: u32 = 0o060_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFCHR: u32 = 0o020_000;
pub const S_IFIFO: u32 = 0o010_000;

/// Permission and special bits (lower 12 bits of mode).
pub const S_IPERM: u32 = 0o7777;

/// File type decoded from mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileType {
    /// Decode the `S_IFMT` bits of `mode`.
    #[must_use]
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::RegularFile),
            S_IFDIR => Some(Self::Directory),
            S_IFLNK => Some(Self::Symlink),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFCHR => Some(Self::CharDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }

    /// `S_IFMT` bits for this type.
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::RegularFile => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
            Self::BlockDevice => S_IFBLK,
            Self::CharDevice => S_IFCHR,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
        }
    }

    /// `d_type` value reported by readdir (`DT_*`).
    #[must_use]
    pub fn dirent_type(self) -> u8 {
        match self {
            Self::Fifo => 1,
            Self::CharDevice => 2,
            Self::Directory => 4,
            Self::BlockDevice => 6,
            Self::RegularFile => 8,
            Self::Symlink => 10,
            Self::Socket => 12,
        }
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    data.get(offset..end).ok_or(ParseError::InsufficientData {
        needed: len,
        offset,
        actual: data.len().saturating_sub(offset),
    })
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    read_fixed(data, offset).map(u16::from_le_bytes)
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    read_fixed(data, offset).map(u32::from_le_bytes)
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    read_fixed(data, offset).map(u64::from_le_bytes)
}

/// Copy `bytes` into `buf` at `offset`, failing if it would not fit.
#[inline]
pub fn write_bytes(buf: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    let actual = buf.len().saturating_sub(offset);
    let dst = offset
        .checked_add(bytes.len())
        .and_then(|end| buf.get_mut(offset..end))
        .ok_or(ParseError::InsufficientData {
            needed: bytes.len(),
            offset,
            actual,
        })?;
    dst.copy_from_slice(bytes);
    Ok(())
}

#[inline]
pub fn write_le_u16(buf: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    write_bytes(buf, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    write_bytes(buf, offset, &value.to_le_bytes())
}

#[inline]
pub fn write_le_u64(buf: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    write_bytes(buf, offset, &value.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_geometry_helpers() {
        assert_eq!(page_base(0), 0);
        assert_eq!(page_base(4095), 0);
        assert_eq!(page_base(4096), 4096);
        assert_eq!(offset_in_page(4097), 1);
        assert_eq!(next_page(0), 4096);
        assert_eq!(next_page(4095), 4096);
        assert_eq!(next_page(4096), 8192);
        assert_eq!(page_align_up(1), 4096);
        assert_eq!(page_align_up(8192), 8192);
        assert!(is_page_aligned(0));
        assert!(!is_page_aligned(10));
    }

    #[test]
    fn page_spans_split_on_boundaries() {
        let spans: Vec<_> = page_spans(100, 10_000).collect();
        assert_eq!(spans, vec![(100, 3996), (4096, 4096), (8192, 1808)]);
        let total: usize = spans.iter().map(|(_, len)| len).sum();
        assert_eq!(total, 9900);
    }

    #[test]
    fn page_spans_empty_range() {
        assert_eq!(page_spans(4096, 4096).count(), 0);
        assert_eq!(page_spans(5000, 10).count(), 0);
    }

    #[test]
    fn file_type_round_trips_through_mode() {
        for kind in [
            FileType::RegularFile,
            FileType::Directory,
            FileType::Symlink,
            FileType::BlockDevice,
            FileType::CharDevice,
            FileType::Fifo,
            FileType::Socket,
        ] {
            assert_eq!(FileType::from_mode(kind.mode_bits() | 0o644), Some(kind));
        }
        assert_eq!(FileType::from_mode(0o644), None);
    }

    #[test]
    fn dirent_types_match_posix() {
        assert_eq!(FileType::Directory.dirent_type(), 4);
        assert_eq!(FileType::RegularFile.dirent_type(), 8);
        assert_eq!(FileType::Symlink.dirent_type(), 10);
    }

    #[test]
    fn le_readers_and_writers() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 0, 0xBEEF).expect("u16");
        write_le_u32(&mut buf, 2, 0xDEAD_BEEF).expect("u32");
        write_le_u64(&mut buf, 6, 0x0102_0304_0506_0708).expect("u64");
        assert_eq!(read_le_u16(&buf, 0).expect("u16"), 0xBEEF);
        assert_eq!(read_le_u32(&buf, 2).expect("u32"), 0xDEAD_BEEF);
        assert_eq!(read_le_u64(&buf, 6).expect("u64"), 0x0102_0304_0506_0708);
    }

    #[test]
    fn short_buffers_are_rejected() {
        let buf = [0_u8; 3];
        assert_eq!(
            read_le_u32(&buf, 0),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 0,
                actual: 3
            })
        );
        let mut out = [0_u8; 3];
        assert!(write_le_u32(&mut out, 1, 7).is_err());
        assert!(ensure_slice(&buf, usize::MAX, 2).is_err());
    }
}
