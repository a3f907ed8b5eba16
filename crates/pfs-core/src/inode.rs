//! Inode lifecycle: create, free, look up, attributes.

use crate::{PageFs, now};
use pfs_alloc::RecordKind;
use pfs_dir::DirChildren;
use pfs_error::{PfsError, Result};
use pfs_extent::{BlockMap, BlockSpace};
use pfs_inode::{InodeHandle, InodeMeta, InodePayload, InodeRecord, SymlinkTarget};
use pfs_types::{
    FileType, InodeNumber, PAGE_SIZE, PAGE_SIZE_U64, S_IFDIR, S_IFIFO, S_IFLNK,
    S_IFREG, S_IPERM, SYMLINK_INLINE_MAX,
};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tracing::debug;

/// Sectors per page, for `InodeAttr::blocks`.
const SECTORS_PER_PAGE: u64 = PAGE_SIZE_U64 / 512;

/// Attributes of one inode, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub kind: FileType,
    /// Permission and special bits (lower 12 bits of mode).
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// 512-byte sectors backing the inode.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub rdev: u64,
    pub blksize: u32,
    pub generation: u64,
    /// Parent directory for directories; first parent for files and fifos.
    pub parent: InodeNumber,
}

impl InodeAttr {
    #[must_use]
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | u32::from(self.perm)
    }
}

/// Request to create an inode.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewInode {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    /// [`NewInode::TMPFILE`] or nothing.
    pub flags: u32,
    /// Link target; required for symlinks, ignored otherwise.
    pub symlink: Option<Vec<u8>>,
}

impl NewInode {
    /// Unnamed regular file: starts with one link instead of zero.
    pub const TMPFILE: u32 = 1;

    #[must_use]
    pub fn directory(perm: u32) -> Self {
        Self {
            mode: S_IFDIR | (perm & S_IPERM),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn regular(perm: u32) -> Self {
        Self {
            mode: S_IFREG | (perm & S_IPERM),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn fifo(perm: u32) -> Self {
        Self {
            mode: S_IFIFO | (perm & S_IPERM),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn symlink(target: &[u8]) -> Self {
        Self {
            mode: S_IFLNK | 0o777,
            symlink: Some(target.to_vec()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn tmpfile(mut self) -> Self {
        self.flags |= Self::TMPFILE;
        self
    }

    #[must_use]
    pub fn owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }
}

/// Attribute changes; `None` leaves a field alone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

pub(crate) fn record_kind(rec: &InodeRecord) -> FileType {
    match &rec.payload {
        InodePayload::Directory(_) => FileType::Directory,
        InodePayload::RegularFile { .. } => FileType::RegularFile,
        InodePayload::Symlink(_) => FileType::Symlink,
        InodePayload::Other { .. } => rec.kind().unwrap_or(FileType::Fifo),
    }
}

pub(crate) fn attr_of(rec: &InodeRecord) -> InodeAttr {
    let parent = match &rec.payload {
        InodePayload::RegularFile { first_parent, .. } | InodePayload::Other { first_parent } => {
            *first_parent
        }
        _ => rec.parent,
    };
    #[expect(clippy::cast_possible_truncation)]
    let perm = (rec.meta.mode & S_IPERM) as u16;
    #[expect(clippy::cast_possible_truncation)]
    let blksize = PAGE_SIZE as u32;
    InodeAttr {
        ino: rec.ino,
        kind: record_kind(rec),
        perm,
        nlink: rec.meta.nlink,
        uid: rec.meta.uid,
        gid: rec.meta.gid,
        size: rec.meta.size,
        blocks: rec.mapped_pages() * SECTORS_PER_PAGE,
        atime: rec.meta.atime,
        mtime: rec.meta.mtime,
        ctime: rec.meta.ctime,
        rdev: rec.meta.rdev,
        blksize,
        generation: rec.meta.generation,
        parent,
    }
}

impl PageFs {
    /// Create an inode under `dir`. The new inode is not linked anywhere;
    /// [`PageFs::add_dentry`] names it.
    pub fn new_inode(&self, dir: InodeNumber, req: NewInode) -> Result<InodeAttr> {
        let kind = match FileType::from_mode(req.mode) {
            Some(
                kind @ (FileType::Directory
                | FileType::RegularFile
                | FileType::Symlink
                | FileType::Fifo),
            ) => kind,
            _ => {
                return Err(PfsError::NotSupported(format!(
                    "inode mode {:#o}",
                    req.mode
                )));
            }
        };
        let target = match (kind, &req.symlink) {
            (FileType::Symlink, Some(target)) if target.is_empty() => {
                return Err(PfsError::InvalidArgument("empty symlink target".to_owned()));
            }
            (FileType::Symlink, Some(target)) if target.len() >= PAGE_SIZE => {
                return Err(PfsError::InvalidArgument(format!(
                    "symlink target of {} bytes",
                    target.len()
                )));
            }
            (FileType::Symlink, Some(target)) => Some(target.as_slice()),
            (FileType::Symlink, None) => {
                return Err(PfsError::InvalidArgument("symlink without target".to_owned()));
            }
            _ => None,
        };

        let parent = self.handle(dir)?;
        if !parent.lock().is_dir() {
            return Err(PfsError::NotDirectory);
        }

        self.space.charge_inode()?;
        let slot = match self.space.alloc_record(RecordKind::Inode) {
            Ok(slot) => slot,
            Err(err) => {
                self.space.credit_inode();
                return Err(err);
            }
        };
        let symlink = match target.map(|t| self.store_symlink(t)).transpose() {
            Ok(link) => link,
            Err(err) => {
                self.space.free_record(RecordKind::Inode, slot);
                self.space.credit_inode();
                return Err(err);
            }
        };

        let ino = self.allocate_ino();
        let mut meta = InodeMeta::new(req.mode, req.uid, req.gid, now());
        meta.rdev = req.rdev;
        let (payload, record_parent) = match kind {
            FileType::Directory => {
                meta.size = PAGE_SIZE_U64;
                meta.nlink = 1;
                (InodePayload::Directory(DirChildren::new()), dir)
            }
            FileType::RegularFile => {
                if req.flags & NewInode::TMPFILE != 0 {
                    meta.nlink = 1;
                }
                let payload = InodePayload::RegularFile {
                    map: BlockMap::new(),
                    first_parent: dir,
                };
                (payload, InodeNumber::NULL)
            }
            FileType::Symlink => {
                let link = symlink.unwrap_or(SymlinkTarget::Inline(Vec::new()));
                meta.size = link.len() as u64;
                (InodePayload::Symlink(link), InodeNumber::NULL)
            }
            _ => (InodePayload::Other { first_parent: dir }, InodeNumber::NULL),
        };

        let record = InodeRecord {
            ino,
            parent: record_parent,
            meta,
            payload,
            slot,
        };
        let attr = attr_of(&record);
        self.index.insert(InodeHandle::new(record));
        debug!(ino = ino.0, dir = dir.0, ?kind, mode = req.mode, "new_inode");
        Ok(attr)
    }

    fn store_symlink(&self, target: &[u8]) -> Result<SymlinkTarget> {
        if target.len() <= SYMLINK_INLINE_MAX {
            return Ok(SymlinkTarget::Inline(target.to_vec()));
        }
        let page = self.space.alloc_data_page()?;
        if let Err(err) = self.space.pool().write_page(page, 0, target) {
            self.space.free_data_page(page);
            return Err(err);
        }
        Ok(SymlinkTarget::Page {
            page,
            len: target.len(),
        })
    }

    /// Release an inode and everything it owns.
    pub fn free_inode(&self, ino: InodeNumber) -> Result<()> {
        if ino == self.root_ino() {
            return Err(PfsError::InvalidArgument("root inode cannot be freed".to_owned()));
        }
        let handle = self.handle(ino)?;
        let mut guard = handle.lock();
        let rec = &mut *guard;
        match &mut rec.payload {
            InodePayload::Directory(children) => {
                if !children.is_empty() {
                    return Err(PfsError::NotEmpty);
                }
                rec.parent = InodeNumber::NULL;
            }
            InodePayload::Symlink(link) => {
                if let SymlinkTarget::Page { page, .. } = *link {
                    self.space.free_data_page(page);
                    *link = SymlinkTarget::Inline(Vec::new());
                }
            }
            InodePayload::RegularFile { map, .. } => {
                map.clear(&self.space);
                rec.meta.size = 0;
            }
            InodePayload::Other { .. } => rec.meta.rdev = 0,
        }
        let slot = rec.slot;
        drop(guard);

        self.index.remove(ino);
        self.space.free_record(RecordKind::Inode, slot);
        self.space.credit_inode();
        debug!(ino = ino.0, "free_inode");
        Ok(())
    }

    /// Attributes of a resident inode.
    pub fn iget(&self, ino: InodeNumber) -> Result<InodeAttr> {
        self.getattr(ino)
    }

    /// Cache-invalidation hook: nothing is cached beyond the index.
    pub fn evict(&self, ino: InodeNumber) {
        debug!(ino = ino.0, resident = self.index.find(ino).is_some(), "evict");
    }

    pub fn getattr(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let handle = self.handle(ino)?;
        let rec = handle.lock();
        Ok(attr_of(&rec))
    }

    /// Apply attribute changes; a size change truncates.
    pub fn setattr(&self, ino: InodeNumber, changes: &SetAttr) -> Result<InodeAttr> {
        let handle = self.handle(ino)?;
        let mut guard = handle.lock();
        let rec = &mut *guard;
        if let Some(size) = changes.size {
            self.truncate_locked(rec, size)?;
        }
        if let Some(mode) = changes.mode {
            rec.meta.set_perm(mode);
        }
        if let Some(uid) = changes.uid {
            rec.meta.uid = uid;
        }
        if let Some(gid) = changes.gid {
            rec.meta.gid = gid;
        }
        if let Some(atime) = changes.atime {
            rec.meta.atime = atime;
        }
        if let Some(mtime) = changes.mtime {
            rec.meta.mtime = mtime;
        }
        rec.meta.ctime = now();
        debug!(ino = ino.0, size = ?changes.size, mode = ?changes.mode, "setattr");
        Ok(attr_of(rec))
    }

    /// Symlink target bytes.
    pub fn get_symlink(&self, ino: InodeNumber) -> Result<Vec<u8>> {
        let handle = self.handle(ino)?;
        let rec = handle.lock();
        let (page, len) = match &rec.payload {
            InodePayload::Symlink(SymlinkTarget::Inline(bytes)) => return Ok(bytes.clone()),
            InodePayload::Symlink(SymlinkTarget::Page { page, len }) => (*page, *len),
            other => {
                return Err(PfsError::InvalidArgument(format!(
                    "{} inode is not a symlink",
                    other.name()
                )));
            }
        };
        drop(rec);
        let mut out = vec![0_u8; len];
        self.space.pool().read_page(page, 0, &mut out)?;
        Ok(out)
    }
}
