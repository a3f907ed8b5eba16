//! Typed request dispatcher.
//!
//! [`PageFs::dispatch`] takes one [`Request`], runs it against the engine and
//! answers with a [`Response`] whose `code` is 0 or a negative errno. Every
//! dispatch is counted in [`OpMetrics`].

use crate::PageFs;
use crate::dir::Rename;
use crate::file::Whence;
use crate::inode::{InodeAttr, NewInode, SetAttr};
use crate::space::StatFs;
use pfs_dir::ReaddirEntry;
use pfs_error::{PfsError, Result};
use pfs_types::{InodeNumber, PageNumber};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

// ── Requests and replies ────────────────────────────────────────────────────

/// One engine operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    NewInode { dir: InodeNumber, spec: NewInode },
    FreeInode { ino: InodeNumber },
    Evict { ino: InodeNumber },
    Iget { ino: InodeNumber },
    Lookup { dir: InodeNumber, name: Vec<u8> },
    AddDentry { dir: InodeNumber, ino: InodeNumber, name: Vec<u8> },
    RemoveDentry { dir: InodeNumber, name: Vec<u8> },
    Rename(Rename),
    /// Fill at most `buf_len` bytes of `linux_dirent64` records from `pos`.
    Readdir { dir: InodeNumber, pos: u64, buf_len: usize },
    Clone {
        src: InodeNumber,
        dst: InodeNumber,
        src_off: u64,
        dst_off: u64,
        len: u64,
    },
    Read { ino: InodeNumber, off: u64, len: usize },
    Write { ino: InodeNumber, off: u64, data: Vec<u8> },
    GetBlock { ino: InodeNumber, index: u64 },
    GetSymlink { ino: InodeNumber },
    Setattr { ino: InodeNumber, attr: SetAttr },
    Sync { ino: InodeNumber, off: u64, len: u64 },
    Fallocate { ino: InodeNumber, off: u64, len: u64, mode: u32 },
    /// `whence` is a raw `SEEK_DATA` or `SEEK_HOLE`.
    Seek { ino: InodeNumber, from: u64, whence: i32 },
    Statfs,
}

impl Request {
    /// Operation name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewInode { .. } => "new_inode",
            Self::FreeInode { .. } => "free_inode",
            Self::Evict { .. } => "evict",
            Self::Iget { .. } => "iget",
            Self::Lookup { .. } => "lookup",
            Self::AddDentry { .. } => "add_dentry",
            Self::RemoveDentry { .. } => "remove_dentry",
            Self::Rename(_) => "rename",
            Self::Readdir { .. } => "readdir",
            Self::Clone { .. } => "clone",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::GetBlock { .. } => "get_block",
            Self::GetSymlink { .. } => "get_symlink",
            Self::Setattr { .. } => "setattr",
            Self::Sync { .. } => "sync",
            Self::Fallocate { .. } => "fallocate",
            Self::Seek { .. } => "seek",
            Self::Statfs => "statfs",
        }
    }

    /// Inode the request is addressed to: the directory for directory
    /// operations, the destination for clone, 0 for statfs.
    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        match self {
            Self::NewInode { dir, .. }
            | Self::Lookup { dir, .. }
            | Self::AddDentry { dir, .. }
            | Self::RemoveDentry { dir, .. }
            | Self::Readdir { dir, .. } => *dir,
            Self::Rename(r) => r.new_dir,
            Self::Clone { dst, .. } => *dst,
            Self::FreeInode { ino }
            | Self::Evict { ino }
            | Self::Iget { ino }
            | Self::Read { ino, .. }
            | Self::Write { ino, .. }
            | Self::GetBlock { ino, .. }
            | Self::GetSymlink { ino }
            | Self::Setattr { ino, .. }
            | Self::Sync { ino, .. }
            | Self::Fallocate { ino, .. }
            | Self::Seek { ino, .. } => *ino,
            Self::Statfs => InodeNumber::NULL,
        }
    }

    /// Byte offset or position carried by the request, if any.
    #[must_use]
    pub fn offset(&self) -> Option<u64> {
        match self {
            Self::Readdir { pos, .. } => Some(*pos),
            Self::Clone { dst_off, .. } => Some(*dst_off),
            Self::Read { off, .. }
            | Self::Write { off, .. }
            | Self::Sync { off, .. }
            | Self::Fallocate { off, .. } => Some(*off),
            Self::Seek { from, .. } => Some(*from),
            _ => None,
        }
    }
}

/// Successful result of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    None,
    Attr(InodeAttr),
    Ino(Option<InodeNumber>),
    Offset(u64),
    /// Packed `linux_dirent64` records and where to resume.
    Dirents { buf: Vec<u8>, pos: u64, more: bool },
    Data(Vec<u8>),
    Written(usize),
    Block(PageNumber),
    Symlink(Vec<u8>),
    Statfs(StatFs),
}

/// Result code plus reply; `code` is 0 or a negative errno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: i32,
    pub reply: Reply,
}

impl Response {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

// ── Error context ───────────────────────────────────────────────────────────

/// Operation name, inode and offset of a failed request, for logging.
struct OpErrorContext<'a> {
    error: &'a PfsError,
    operation: &'static str,
    ino: u64,
    offset: Option<u64>,
}

impl OpErrorContext<'_> {
    /// Log the failure and return the positive errno.
    fn log_and_errno(&self) -> i32 {
        let errno = self.error.to_errno();
        if errno == libc::ENOENT {
            trace!(
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "op returned ENOENT"
            );
        } else {
            warn!(
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "op failed"
            );
        }
        errno
    }
}

// ── Cache-line padding ──────────────────────────────────────────────────────

/// Keeps a hot counter on its own 64-byte line.
#[repr(C, align(64))]
pub struct CacheLinePadded<T>(pub T);

impl<T: std::fmt::Debug> std::fmt::Debug for CacheLinePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Per-mount dispatch counters, updated with relaxed atomics.
#[repr(C)]
pub struct OpMetrics {
    pub requests_total: CacheLinePadded<AtomicU64>,
    pub requests_ok: CacheLinePadded<AtomicU64>,
    pub requests_err: CacheLinePadded<AtomicU64>,
    pub bytes_read: CacheLinePadded<AtomicU64>,
    pub bytes_written: CacheLinePadded<AtomicU64>,
}

impl OpMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_total: CacheLinePadded(AtomicU64::new(0)),
            requests_ok: CacheLinePadded(AtomicU64::new(0)),
            requests_err: CacheLinePadded(AtomicU64::new(0)),
            bytes_read: CacheLinePadded(AtomicU64::new(0)),
            bytes_written: CacheLinePadded(AtomicU64::new(0)),
        }
    }

    fn record_ok(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_ok.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_err(&self) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        self.requests_err.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes_read(&self, n: usize) {
        self.bytes_read
            .0
            .fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn record_bytes_written(&self, n: usize) {
        self.bytes_written
            .0
            .fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.0.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.0.load(Ordering::Relaxed),
            requests_err: self.requests_err.0.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.0.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.0.load(Ordering::Relaxed),
        }
    }
}

impl Default for OpMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OpMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.snapshot();
        f.debug_struct("OpMetrics")
            .field("requests_total", &s.requests_total)
            .field("requests_ok", &s.requests_ok)
            .field("requests_err", &s.requests_err)
            .field("bytes_read", &s.bytes_read)
            .field("bytes_written", &s.bytes_written)
            .finish()
    }
}

/// Point-in-time copy of [`OpMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

// ── Dirent packing ──────────────────────────────────────────────────────────

/// Fixed part of a `linux_dirent64`: ino, off, reclen, type.
const DIRENT_HEADER: usize = 8 + 8 + 2 + 1;

/// Record length of a `linux_dirent64` for `name_len`, NUL included, 8-aligned.
fn dirent_reclen(name_len: usize) -> usize {
    (DIRENT_HEADER + name_len + 1 + 7) & !7
}

/// Append one record to `buf` unless it would exceed `cap`.
fn pack_dirent(buf: &mut Vec<u8>, cap: usize, entry: &ReaddirEntry<'_>) -> bool {
    let reclen = dirent_reclen(entry.name.len());
    if buf.len() + reclen > cap {
        return false;
    }
    let Ok(reclen16) = u16::try_from(reclen) else {
        return false;
    };
    let start = buf.len();
    buf.extend_from_slice(&entry.ino.0.to_le_bytes());
    buf.extend_from_slice(&entry.next_pos.to_le_bytes());
    buf.extend_from_slice(&reclen16.to_le_bytes());
    buf.push(entry.kind.dirent_type());
    buf.extend_from_slice(entry.name);
    buf.resize(start + reclen, 0);
    true
}

// ── Dispatch ────────────────────────────────────────────────────────────────

impl PageFs {
    /// Run one request and fold the outcome into a [`Response`].
    pub fn dispatch(&self, req: Request) -> Response {
        let operation = req.name();
        let ino = req.ino().0;
        let offset = req.offset();
        match self.execute(req) {
            Ok(reply) => {
                self.metrics.record_ok();
                Response { code: 0, reply }
            }
            Err(error) => {
                self.metrics.record_err();
                let errno = OpErrorContext {
                    error: &error,
                    operation,
                    ino,
                    offset,
                }
                .log_and_errno();
                Response {
                    code: -errno,
                    reply: Reply::None,
                }
            }
        }
    }

    fn execute(&self, req: Request) -> Result<Reply> {
        match req {
            Request::NewInode { dir, spec } => self.new_inode(dir, spec).map(Reply::Attr),
            Request::FreeInode { ino } => self.free_inode(ino).map(|()| Reply::None),
            Request::Evict { ino } => {
                self.evict(ino);
                Ok(Reply::None)
            }
            Request::Iget { ino } => self.iget(ino).map(Reply::Attr),
            Request::Lookup { dir, name } => self.lookup(dir, &name).map(Reply::Ino),
            Request::AddDentry { dir, ino, name } => {
                self.add_dentry(dir, ino, &name).map(Reply::Offset)
            }
            Request::RemoveDentry { dir, name } => {
                self.remove_dentry(dir, &name).map(|()| Reply::None)
            }
            Request::Rename(rename) => self.rename(&rename).map(|()| Reply::None),
            Request::Readdir { dir, pos, buf_len } => {
                let mut buf = Vec::with_capacity(buf_len);
                let outcome = self.readdir(dir, pos, |e| pack_dirent(&mut buf, buf_len, e))?;
                if buf.is_empty() && outcome.more {
                    return Err(PfsError::InvalidArgument(format!(
                        "readdir buffer of {buf_len} bytes holds no entry"
                    )));
                }
                Ok(Reply::Dirents {
                    buf,
                    pos: outcome.pos,
                    more: outcome.more,
                })
            }
            Request::Clone {
                src,
                dst,
                src_off,
                dst_off,
                len,
            } => self
                .clone_range(src, dst, src_off, dst_off, len)
                .map(|()| Reply::None),
            Request::Read { ino, off, len } => {
                let mut data = vec![0_u8; len];
                let n = self.read(ino, off, &mut data)?;
                data.truncate(n);
                self.metrics.record_bytes_read(n);
                Ok(Reply::Data(data))
            }
            Request::Write { ino, off, data } => {
                let n = self.write(ino, off, &data)?;
                self.metrics.record_bytes_written(n);
                Ok(Reply::Written(n))
            }
            Request::GetBlock { ino, index } => self.get_block(ino, index).map(Reply::Block),
            Request::GetSymlink { ino } => self.get_symlink(ino).map(Reply::Symlink),
            Request::Setattr { ino, attr } => self.setattr(ino, &attr).map(Reply::Attr),
            Request::Sync { ino, off, len } => self.sync(ino, off, len).map(|()| Reply::None),
            Request::Fallocate {
                ino,
                off,
                len,
                mode,
            } => self.fallocate(ino, off, len, mode).map(|()| Reply::None),
            Request::Seek { ino, from, whence } => {
                let whence = Whence::from_raw(whence)?;
                self.seek(ino, from, whence).map(Reply::Offset)
            }
            Request::Statfs => Ok(Reply::Statfs(self.statfs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MountOptions, SEEK_HOLE};
    use pfs_types::{FileType, PAGE_SIZE_U64};

    fn fs() -> PageFs {
        PageFs::mount(MountOptions::volatile(64 * PAGE_SIZE_U64)).expect("mount")
    }

    fn attr(resp: Response) -> InodeAttr {
        match resp.reply {
            Reply::Attr(attr) => attr,
            other => panic!("expected attr, got {other:?}"),
        }
    }

    #[test]
    fn dirent_reclen_is_eight_aligned() {
        assert_eq!(dirent_reclen(1), 24);
        assert_eq!(dirent_reclen(4), 24);
        assert_eq!(dirent_reclen(5), 32);
        assert_eq!(dirent_reclen(255), 280);
    }

    #[test]
    fn pack_dirent_layout() {
        let entry = ReaddirEntry {
            name: b"abc",
            ino: InodeNumber(7),
            kind: FileType::RegularFile,
            next_pos: 9,
        };
        let mut buf = Vec::new();
        assert!(!pack_dirent(&mut buf, 8, &entry));
        assert!(buf.is_empty());
        assert!(pack_dirent(&mut buf, 64, &entry));
        assert_eq!(buf.len(), 24);
        assert_eq!(&buf[0..8], &7_u64.to_le_bytes());
        assert_eq!(&buf[8..16], &9_u64.to_le_bytes());
        assert_eq!(&buf[16..18], &24_u16.to_le_bytes());
        assert_eq!(buf[18], FileType::RegularFile.dirent_type());
        assert_eq!(&buf[19..23], b"abc\0");
    }

    #[test]
    fn dispatch_round_trip_counts_metrics() {
        let fs = fs();
        let root = fs.root_ino();
        let f = attr(fs.dispatch(Request::NewInode {
            dir: root,
            spec: NewInode::regular(0o644),
        }))
        .ino;
        let resp = fs.dispatch(Request::AddDentry {
            dir: root,
            ino: f,
            name: b"f".to_vec(),
        });
        assert_eq!(resp.reply, Reply::Offset(2 * PAGE_SIZE_U64));

        let resp = fs.dispatch(Request::Write {
            ino: f,
            off: 0,
            data: b"hello".to_vec(),
        });
        assert_eq!(resp.reply, Reply::Written(5));
        let resp = fs.dispatch(Request::Read {
            ino: f,
            off: 1,
            len: 100,
        });
        assert_eq!(resp.reply, Reply::Data(b"ello".to_vec()));

        let resp = fs.dispatch(Request::Lookup {
            dir: root,
            name: b"missing".to_vec(),
        });
        assert_eq!(resp.reply, Reply::Ino(None));

        let snap = fs.metrics().snapshot();
        assert_eq!(snap.requests_total, 5);
        assert_eq!(snap.requests_ok, 5);
        assert_eq!(snap.bytes_written, 5);
        assert_eq!(snap.bytes_read, 4);
    }

    #[test]
    fn errors_become_negative_errno() {
        let fs = fs();
        let resp = fs.dispatch(Request::Iget {
            ino: InodeNumber(42),
        });
        assert_eq!(resp.code, -libc::ENOENT);
        assert_eq!(resp.reply, Reply::None);

        let resp = fs.dispatch(Request::Seek {
            ino: fs.root_ino(),
            from: 0,
            whence: 0,
        });
        assert_eq!(resp.code, -libc::EOPNOTSUPP);

        let resp = fs.dispatch(Request::RemoveDentry {
            dir: fs.root_ino(),
            name: Vec::new(),
        });
        assert!(!resp.is_ok());
        assert_eq!(fs.metrics().snapshot().requests_err, 3);
    }

    #[test]
    fn seek_hole_through_dispatch() {
        let fs = fs();
        let f = attr(fs.dispatch(Request::NewInode {
            dir: fs.root_ino(),
            spec: NewInode::regular(0o600),
        }))
        .ino;
        fs.write(f, 0, &[1_u8; 10]).expect("write");
        let resp = fs.dispatch(Request::Seek {
            ino: f,
            from: 0,
            whence: SEEK_HOLE,
        });
        assert_eq!(resp.reply, Reply::Offset(10));
    }

    #[test]
    fn readdir_buffer_too_small_for_one_entry() {
        let fs = fs();
        let resp = fs.dispatch(Request::Readdir {
            dir: fs.root_ino(),
            pos: 0,
            buf_len: 8,
        });
        assert_eq!(resp.code, -libc::EINVAL);
    }

    #[test]
    fn statfs_reply() {
        let fs = fs();
        match fs.dispatch(Request::Statfs).reply {
            Reply::Statfs(st) => assert_eq!(st.blocks, 62),
            other => panic!("expected statfs, got {other:?}"),
        }
    }
}
