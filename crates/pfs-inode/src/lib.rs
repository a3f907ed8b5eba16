#![forbid(unsafe_code)]
//! Inode records and the inode index.
//!
//! An [`InodeRecord`] carries the generic attributes of every inode plus a
//! type-tagged [`InodePayload`]. Each live record sits behind its own lock
//! in an [`InodeHandle`]; the [`InodeIndex`] owns the handles and hands them
//! out as `Arc`s.

use parking_lot::{Mutex, MutexGuard};
use pfs_alloc::SlotId;
use pfs_dir::DirChildren;
use pfs_error::fault;
use pfs_extent::BlockMap;
use pfs_types::{FileType, InodeNumber, PageNumber, S_IFMT, S_IPERM};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::trace;

// ── Attributes ──────────────────────────────────────────────────────────────

/// Generic attributes shared by every inode type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeMeta {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub rdev: u64,
    pub generation: u64,
    pub flags: u32,
}

impl InodeMeta {
    /// Fresh attributes with all timestamps set to `now`.
    #[must_use]
    pub fn new(mode: u32, uid: u32, gid: u32, now: SystemTime) -> Self {
        Self {
            mode,
            uid,
            gid,
            nlink: 0,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            rdev: 0,
            generation: 0,
            flags: 0,
        }
    }

    #[must_use]
    pub fn kind(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    /// Replace the permission bits, keeping the type bits.
    pub fn set_perm(&mut self, perm: u32) {
        self.mode = (self.mode & S_IFMT) | (perm & S_IPERM);
    }

    /// Content changed: bump mtime and ctime.
    pub fn touch_modified(&mut self, now: SystemTime) {
        self.mtime = now;
        self.ctime = now;
    }
}

// ── Payload ─────────────────────────────────────────────────────────────────

/// Where a symlink keeps its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymlinkTarget {
    /// Short targets live in the record itself.
    Inline(Vec<u8>),
    /// Longer targets occupy one overflow page.
    Page { page: PageNumber, len: usize },
}

impl SymlinkTarget {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Inline(bytes) => bytes.len(),
            Self::Page { len, .. } => *len,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub enum InodePayload {
    Directory(DirChildren),
    RegularFile {
        map: BlockMap,
        first_parent: InodeNumber,
    },
    Symlink(SymlinkTarget),
    /// Fifos and other special files.
    Other { first_parent: InodeNumber },
}

impl InodePayload {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Directory(_) => "directory",
            Self::RegularFile { .. } => "regular",
            Self::Symlink(_) => "symlink",
            Self::Other { .. } => "other",
        }
    }
}

/// One inode: attributes, payload and the pool slot backing it.
#[derive(Debug)]
pub struct InodeRecord {
    pub ino: InodeNumber,
    pub parent: InodeNumber,
    pub meta: InodeMeta,
    pub payload: InodePayload,
    pub slot: SlotId,
}

impl InodeRecord {
    #[must_use]
    pub fn kind(&self) -> Option<FileType> {
        self.meta.kind()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self.payload, InodePayload::Directory(_))
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        matches!(self.payload, InodePayload::RegularFile { .. })
    }

    #[must_use]
    pub fn dir(&self) -> Option<&DirChildren> {
        match &self.payload {
            InodePayload::Directory(children) => Some(children),
            _ => None,
        }
    }

    pub fn dir_mut(&mut self) -> Option<&mut DirChildren> {
        match &mut self.payload {
            InodePayload::Directory(children) => Some(children),
            _ => None,
        }
    }

    #[must_use]
    pub fn block_map(&self) -> Option<&BlockMap> {
        match &self.payload {
            InodePayload::RegularFile { map, .. } => Some(map),
            _ => None,
        }
    }

    pub fn block_map_mut(&mut self) -> Option<&mut BlockMap> {
        match &mut self.payload {
            InodePayload::RegularFile { map, .. } => Some(map),
            _ => None,
        }
    }

    /// Number of data pages backing this inode.
    #[must_use]
    pub fn mapped_pages(&self) -> u64 {
        match &self.payload {
            InodePayload::RegularFile { map, .. } => map.len() as u64,
            InodePayload::Symlink(SymlinkTarget::Page { .. }) => 1,
            _ => 0,
        }
    }
}

// ── Handles ─────────────────────────────────────────────────────────────────

/// In-core reference to a live inode.
pub struct InodeHandle {
    ino: InodeNumber,
    state: Mutex<InodeRecord>,
}

impl fmt::Debug for InodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeHandle")
            .field("ino", &self.ino)
            .finish_non_exhaustive()
    }
}

impl InodeHandle {
    #[must_use]
    pub fn new(record: InodeRecord) -> Arc<Self> {
        Arc::new(Self {
            ino: record.ino,
            state: Mutex::new(record),
        })
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// Lock the record.
    pub fn lock(&self) -> MutexGuard<'_, InodeRecord> {
        self.state.lock()
    }
}

/// Live inodes by number.
#[derive(Debug, Default)]
pub struct InodeIndex {
    map: Mutex<HashMap<InodeNumber, Arc<InodeHandle>>>,
}

impl InodeIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle. The ino must be valid and not already present.
    pub fn insert(&self, handle: Arc<InodeHandle>) {
        let ino = handle.ino();
        if ino.is_null() {
            fault(file!(), line!(), "insert of null inode number");
        }
        let mut map = self.map.lock();
        if map.insert(ino, handle).is_some() {
            fault(file!(), line!(), "inode number already indexed");
        }
        drop(map);
        trace!(ino = ino.0, "index_insert");
    }

    #[must_use]
    pub fn find(&self, ino: InodeNumber) -> Option<Arc<InodeHandle>> {
        self.map.lock().get(&ino).cloned()
    }

    /// Drop a handle. The ino must be present.
    pub fn remove(&self, ino: InodeNumber) -> Arc<InodeHandle> {
        let removed = self.map.lock().remove(&ino);
        let Some(handle) = removed else {
            fault(file!(), line!(), "remove of unindexed inode");
        };
        trace!(ino = ino.0, "index_remove");
        handle
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live inode numbers, ascending.
    #[must_use]
    pub fn inos(&self) -> Vec<InodeNumber> {
        let mut inos: Vec<_> = self.map.lock().keys().copied().collect();
        inos.sort_unstable();
        inos
    }

    /// Empty the index, returning every handle it held.
    pub fn drain(&self) -> Vec<Arc<InodeHandle>> {
        self.map.lock().drain().map(|(_, h)| h).collect()
    }
}
