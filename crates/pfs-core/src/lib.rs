#![forbid(unsafe_code)]
//! PageFS engine: mount state, inode lifecycle, directories, file I/O and
//! the request dispatcher.
//!
//! A [`PageFs`] is built by [`PageFs::mount`] over either a caller-supplied
//! persistent region or an anonymous volatile one. Every operation is
//! synchronous and `PageFs` is `Send + Sync`; callers may drive it from as
//! many threads as they like, directly or through [`PageFs::dispatch`].
//!
//! Lock order: inode records (two at a time only in inode-number order),
//! then the pool, then the space counters. The index lock is never held
//! while taking an inode lock.

mod dir;
mod file;
mod inode;
mod mount;
pub mod ops;
mod space;

pub use dir::{LinkHooks, Rename, StdLinkHooks};
pub use file::{
    FALLOC_FL_COLLAPSE_RANGE, FALLOC_FL_INSERT_RANGE, FALLOC_FL_KEEP_SIZE,
    FALLOC_FL_NO_HIDE_STALE, FALLOC_FL_PUNCH_HOLE, FALLOC_FL_UNSHARE_RANGE,
    FALLOC_FL_ZERO_RANGE, SEEK_DATA, SEEK_HOLE, Whence,
};
pub use inode::{InodeAttr, NewInode, SetAttr};
pub use mount::{DEFAULT_VOLATILE_SIZE, MountOptions};
pub use ops::{CacheLinePadded, MetricsSnapshot, OpMetrics, Reply, Request, Response};
pub use space::StatFs;

pub use pfs_alloc::PoolStats;
pub use pfs_block::{
    ByteDevice, DurableCopy, FileByteDevice, MemByteDevice, RegionKind, WriteThrough,
};
pub use pfs_dir::{ReaddirEntry, ReaddirOutcome};
pub use pfs_error::{PfsError, Resource, Result};
pub use pfs_types::{
    FileType, InodeNumber, MAX_FILE_SIZE, MAX_IO_SIZE, NAME_MAX, PAGE_SHIFT, PAGE_SIZE,
    PAGE_SIZE_U64, PageNumber,
};

use parking_lot::MutexGuard;
use pfs_inode::{InodeHandle, InodeIndex, InodeRecord};
use space::Space;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

// ── Mounted filesystem ──────────────────────────────────────────────────────

/// One mounted PageFS instance.
pub struct PageFs {
    space: Space,
    index: InodeIndex,
    next_ino: AtomicU64,
    root: Arc<InodeHandle>,
    kind: RegionKind,
    hooks: Arc<dyn LinkHooks>,
    metrics: OpMetrics,
}

impl fmt::Debug for PageFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFs")
            .field("kind", &self.kind)
            .field("inodes", &self.index.len())
            .field("next_ino", &self.next_ino.load(Ordering::Relaxed))
            .field("statfs", &self.space.statfs())
            .finish_non_exhaustive()
    }
}

impl PageFs {
    #[must_use]
    pub fn root_ino(&self) -> InodeNumber {
        self.root.ino()
    }

    #[must_use]
    pub fn region_kind(&self) -> RegionKind {
        self.kind
    }

    /// Block size in bytes; always one page.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        1 << PAGE_SHIFT
    }

    #[must_use]
    pub fn block_shift(&self) -> u32 {
        PAGE_SHIFT
    }

    /// Snapshot of the space counters.
    #[must_use]
    pub fn statfs(&self) -> StatFs {
        self.space.statfs()
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.space.pool_stats()
    }

    /// Number of resident inodes, root included.
    #[must_use]
    pub fn inode_count(&self) -> usize {
        self.index.len()
    }

    /// Resident inode numbers, ascending.
    #[must_use]
    pub fn inode_numbers(&self) -> Vec<InodeNumber> {
        self.index.inos()
    }

    #[must_use]
    pub fn metrics(&self) -> &OpMetrics {
        &self.metrics
    }

    fn handle(&self, ino: InodeNumber) -> Result<Arc<InodeHandle>> {
        self.index
            .find(ino)
            .ok_or_else(|| PfsError::NotFound(format!("inode {ino}")))
    }

    fn allocate_ino(&self) -> InodeNumber {
        InodeNumber(self.next_ino.fetch_add(1, Ordering::Relaxed))
    }
}

fn now() -> SystemTime {
    SystemTime::now()
}

/// Lock two distinct inodes in inode-number order; guards come back as
/// `(a, b)` regardless of which was taken first.
fn lock_pair<'a>(
    a: &'a InodeHandle,
    b: &'a InodeHandle,
) -> (MutexGuard<'a, InodeRecord>, MutexGuard<'a, InodeRecord>) {
    pfs_error::pfs_assert!(a.ino() != b.ino(), "lock_pair on one inode");
    if a.ino() < b.ino() {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}
