//! Space accounting layered over the pool.
//!
//! Counts follow pages, not records: every page that leaves the generic page
//! list (data pages, symlink pages, pages carved into record slots) is
//! charged against `bfree`/`bavail`, and only pages that come back to the
//! list are credited. Carved pages never come back.

use parking_lot::Mutex;
use pfs_alloc::{Pool, PoolStats, RecordKind, SlotId};
use pfs_error::{PfsError, Resource, Result, pfs_assert};
use pfs_extent::BlockSpace;
use pfs_types::{NAME_MAX, PAGE_SIZE, PageNumber};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Filesystem statistics, as reported by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub bsize: u32,
    pub frsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub namemax: u32,
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    blocks: u64,
    bfree: u64,
    bavail: u64,
    files: u64,
    ffree: u64,
    favail: u64,
}

/// The pool plus the mount-wide counters.
///
/// The pool lock and the counter lock are never held together.
#[derive(Debug)]
pub(crate) struct Space {
    pool: Pool,
    counters: Mutex<Counters>,
}

impl Space {
    pub(crate) fn new(pool: Pool) -> Self {
        let total = pool.total_pages();
        Self {
            pool,
            counters: Mutex::new(Counters {
                blocks: total,
                bfree: total,
                bavail: total,
                files: total,
                ffree: total,
                favail: total,
            }),
        }
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    pub(crate) fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn charge_page(&self) {
        let mut c = self.counters.lock();
        pfs_assert!(c.bfree > 0 && c.bavail > 0, "page charged with no free blocks");
        c.bfree -= 1;
        c.bavail -= 1;
    }

    fn credit_page(&self) {
        let mut c = self.counters.lock();
        pfs_assert!(c.bfree < c.blocks, "page credited past total blocks");
        c.bfree += 1;
        c.bavail += 1;
    }

    /// Reserve one inode against `ffree`/`favail`.
    pub(crate) fn charge_inode(&self) -> Result<()> {
        let mut c = self.counters.lock();
        if c.ffree == 0 || c.favail == 0 {
            return Err(PfsError::NoSpace(Resource::Inodes));
        }
        c.ffree -= 1;
        c.favail -= 1;
        Ok(())
    }

    pub(crate) fn credit_inode(&self) {
        let mut c = self.counters.lock();
        pfs_assert!(c.ffree < c.files, "inode credited past total files");
        c.ffree += 1;
        c.favail += 1;
    }

    pub(crate) fn statfs(&self) -> StatFs {
        let c = *self.counters.lock();
        #[expect(clippy::cast_possible_truncation)]
        let bsize = PAGE_SIZE as u32;
        #[expect(clippy::cast_possible_truncation)]
        let namemax = NAME_MAX as u32;
        StatFs {
            bsize,
            frsize: bsize,
            blocks: c.blocks,
            bfree: c.bfree,
            bavail: c.bavail,
            files: c.files,
            ffree: c.ffree,
            favail: c.favail,
            namemax,
        }
    }
}

impl BlockSpace for Space {
    fn alloc_data_page(&self) -> Result<PageNumber> {
        let pn = self.pool.alloc_page()?;
        self.charge_page();
        Ok(pn)
    }

    fn free_data_page(&self, pn: PageNumber) {
        self.pool.free_page(pn);
        self.credit_page();
    }

    fn alloc_record(&self, kind: RecordKind) -> Result<SlotId> {
        let grant = self.pool.alloc_slot(kind)?;
        if let Some(page) = grant.donated {
            trace!(page = page.0, ?kind, "page_donate");
            self.charge_page();
        }
        Ok(grant.slot)
    }

    fn free_record(&self, kind: RecordKind, slot: SlotId) {
        self.pool.free_slot(kind, slot);
    }

    fn copy_page(&self, src: PageNumber, dst: PageNumber) -> Result<()> {
        self.pool.copy_page(src, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::Region;
    use pfs_types::PAGE_SIZE_U64;
    use std::sync::Arc;

    fn space(pages: u64) -> Space {
        let region = Region::volatile((pages + 2) * PAGE_SIZE_U64, 2).expect("region");
        Space::new(Pool::new(Arc::new(region)))
    }

    #[test]
    fn data_pages_charge_and_credit() {
        let space = space(8);
        let pn = space.alloc_data_page().expect("page");
        assert_eq!(space.statfs().bfree, 7);
        space.free_data_page(pn);
        let st = space.statfs();
        assert_eq!((st.blocks, st.bfree, st.bavail), (8, 8, 8));
    }

    #[test]
    fn donated_pages_stay_charged() {
        let space = space(8);
        let slot = space.alloc_record(RecordKind::Dirent).expect("slot");
        assert_eq!(space.statfs().bfree, 7);
        space.free_record(RecordKind::Dirent, slot);
        assert_eq!(space.statfs().bfree, 7);
        space.alloc_record(RecordKind::Dirent).expect("reuse");
        assert_eq!(space.statfs().bfree, 7, "slot reuse needs no new page");
    }

    #[test]
    fn inode_budget_is_bounded() {
        let space = space(2);
        space.charge_inode().expect("first");
        space.charge_inode().expect("second");
        assert!(matches!(
            space.charge_inode(),
            Err(PfsError::NoSpace(Resource::Inodes))
        ));
        space.credit_inode();
        assert_eq!(space.statfs().ffree, 1);
    }

    #[test]
    fn statfs_reports_page_geometry() {
        let st = space(4).statfs();
        assert_eq!(st.bsize, 4096);
        assert_eq!(st.frsize, 4096);
        assert_eq!(st.namemax, 255);
        assert_eq!(st.files, 4);
    }
}
