#![forbid(unsafe_code)]
//! Block mapping: file offset to physical page resolution, with
//! copy-on-write sharing.
//!
//! A file maps page-aligned offsets to [`FileBlockRef`]s; each of those
//! points at a refcounted [`DataBlockRef`] that owns one physical page.
//! Cloning a range only bumps refcounts. The first write to a shared page
//! splits it: the writer gets a private copy and the other mappings keep
//! the original.
//!
//! Invariants:
//! - a `DataBlockRef`'s refcount equals the number of `FileBlockRef`s that
//!   point at it, and its page is freed exactly when that reaches zero;
//! - `FileBlockRef` offsets are page aligned and unique within one map.

use pfs_alloc::{Pool, RecordKind, SlotId};
use pfs_error::{Result, fault, pfs_assert};
use pfs_types::{PageNumber, is_page_aligned, page_align_up};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::trace;

// ── Space seam ──────────────────────────────────────────────────────────────

/// Space provider for mapping changes.
///
/// Implementations own accounting: every page handed out by
/// [`BlockSpace::alloc_data_page`] is charged until it comes back through
/// [`BlockSpace::free_data_page`].
pub trait BlockSpace {
    /// Allocate one zero-filled data page.
    fn alloc_data_page(&self) -> Result<PageNumber>;

    fn free_data_page(&self, pn: PageNumber);

    /// Allocate one record slot of `kind`.
    fn alloc_record(&self, kind: RecordKind) -> Result<SlotId>;

    fn free_record(&self, kind: RecordKind, slot: SlotId);

    /// Copy the whole of page `src` over page `dst`.
    fn copy_page(&self, src: PageNumber, dst: PageNumber) -> Result<()>;
}

impl BlockSpace for Pool {
    fn alloc_data_page(&self) -> Result<PageNumber> {
        self.alloc_page()
    }

    fn free_data_page(&self, pn: PageNumber) {
        self.free_page(pn);
    }

    fn alloc_record(&self, kind: RecordKind) -> Result<SlotId> {
        self.alloc_slot(kind).map(|grant| grant.slot)
    }

    fn free_record(&self, kind: RecordKind, slot: SlotId) {
        self.free_slot(kind, slot);
    }

    fn copy_page(&self, src: PageNumber, dst: PageNumber) -> Result<()> {
        Pool::copy_page(self, src, dst)
    }
}

// ── References ──────────────────────────────────────────────────────────────

/// One physical data page and the number of mappings that share it.
#[derive(Debug)]
pub struct DataBlockRef {
    page: PageNumber,
    slot: SlotId,
    refcount: AtomicU32,
}

impl DataBlockRef {
    fn new(page: PageNumber, slot: SlotId) -> Arc<Self> {
        Arc::new(Self {
            page,
            slot,
            refcount: AtomicU32::new(1),
        })
    }

    #[must_use]
    pub fn page(&self) -> PageNumber {
        self.page
    }

    #[must_use]
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.refcount() > 1
    }

    /// Record one more mapping of this page.
    pub fn share(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::AcqRel);
        pfs_assert!(prev > 0, "share of a released data block");
    }

    /// Drop one mapping; frees page and slot when it was the last.
    ///
    /// Returns true when the page was freed.
    pub fn release(&self, space: &dyn BlockSpace) -> bool {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            fault(file!(), line!(), "data block refcount released below zero");
        }
        if prev > 1 {
            return false;
        }
        space.free_data_page(self.page);
        space.free_record(RecordKind::DataRef, self.slot);
        trace!(page = self.page.0, "data_block_free");
        true
    }
}

/// A file's mapping of one page-aligned offset.
#[derive(Debug)]
pub struct FileBlockRef {
    pub offset: u64,
    pub data: Arc<DataBlockRef>,
    pub slot: SlotId,
}

impl FileBlockRef {
    #[must_use]
    pub fn page(&self) -> PageNumber {
        self.data.page()
    }
}

/// What [`BlockMap::require`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapped {
    /// Already exclusive.
    Existing(PageNumber),
    /// New zero-filled page.
    Fresh(PageNumber),
    /// Private copy of a shared page.
    Split(PageNumber),
}

impl Mapped {
    #[must_use]
    pub fn page(self) -> PageNumber {
        match self {
            Self::Existing(pn) | Self::Fresh(pn) | Self::Split(pn) => pn,
        }
    }
}

/// Allocate a fresh page plus its data-ref slot, or nothing.
fn alloc_data(space: &dyn BlockSpace) -> Result<(PageNumber, SlotId)> {
    let page = space.alloc_data_page()?;
    match space.alloc_record(RecordKind::DataRef) {
        Ok(slot) => Ok((page, slot)),
        Err(err) => {
            space.free_data_page(page);
            Err(err)
        }
    }
}

// ── Block map ───────────────────────────────────────────────────────────────

/// Ordered offset → mapping table for one regular file.
#[derive(Debug, Default)]
pub struct BlockMap {
    refs: BTreeMap<u64, FileBlockRef>,
}

impl BlockMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mapped pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileBlockRef> {
        self.refs.values()
    }

    /// Mappings at or beyond `off`, ascending.
    pub fn iter_from(&self, off: u64) -> impl Iterator<Item = &FileBlockRef> {
        self.refs.range(off..).map(|(_, fbr)| fbr)
    }

    /// Exact lookup of the mapping at page-aligned `off`.
    #[must_use]
    pub fn fetch(&self, off: u64) -> Option<&FileBlockRef> {
        pfs_assert!(is_page_aligned(off));
        self.refs.get(&off)
    }

    #[must_use]
    pub fn is_mapped(&self, off: u64) -> bool {
        self.fetch(off).is_some()
    }

    /// Ensure `off` maps an exclusive page, allocating or splitting as needed.
    ///
    /// Everything is allocated before any mapping changes, so an error
    /// leaves the map untouched.
    pub fn require(&mut self, off: u64, space: &dyn BlockSpace) -> Result<Mapped> {
        pfs_assert!(is_page_aligned(off));
        match self.refs.get_mut(&off) {
            Some(existing) if !existing.data.is_shared() => Ok(Mapped::Existing(existing.page())),
            Some(existing) => {
                let (page, slot) = alloc_data(space)?;
                if let Err(err) = space.copy_page(existing.page(), page) {
                    space.free_record(RecordKind::DataRef, slot);
                    space.free_data_page(page);
                    return Err(err);
                }
                let old = std::mem::replace(&mut existing.data, DataBlockRef::new(page, slot));
                trace!(
                    offset = off,
                    old_page = old.page().0,
                    new_page = page.0,
                    "cow_split"
                );
                old.release(space);
                Ok(Mapped::Split(page))
            }
            None => {
                let (page, data_slot) = alloc_data(space)?;
                let slot = match space.alloc_record(RecordKind::FileRef) {
                    Ok(slot) => slot,
                    Err(err) => {
                        space.free_record(RecordKind::DataRef, data_slot);
                        space.free_data_page(page);
                        return Err(err);
                    }
                };
                self.refs.insert(
                    off,
                    FileBlockRef {
                        offset: off,
                        data: DataBlockRef::new(page, data_slot),
                        slot,
                    },
                );
                trace!(offset = off, page = page.0, "block_map");
                Ok(Mapped::Fresh(page))
            }
        }
    }

    /// Unmap `off`. Returns false when nothing was mapped there.
    pub fn drop_at(&mut self, off: u64, space: &dyn BlockSpace) -> bool {
        let Some(fbr) = self.refs.remove(&off) else {
            return false;
        };
        release_mapping(fbr, space);
        true
    }

    /// Unmap every offset at or beyond `pos` rounded up to a page boundary.
    ///
    /// Returns the number of mappings dropped.
    pub fn drop_from(&mut self, pos: u64, space: &dyn BlockSpace) -> usize {
        let tail = self.refs.split_off(&page_align_up(pos));
        let dropped = tail.len();
        for fbr in tail.into_values() {
            release_mapping(fbr, space);
        }
        dropped
    }

    /// Unmap everything.
    pub fn clear(&mut self, space: &dyn BlockSpace) -> usize {
        self.drop_from(0, space)
    }

    /// Point `dst_off` at `src`, sharing its page.
    ///
    /// Whatever `dst_off` mapped before is released. Mapping the same data
    /// block twice is a no-op.
    pub fn share_into(
        &mut self,
        dst_off: u64,
        src: &Arc<DataBlockRef>,
        space: &dyn BlockSpace,
    ) -> Result<()> {
        pfs_assert!(is_page_aligned(dst_off));
        if let Some(existing) = self.refs.get_mut(&dst_off) {
            if Arc::ptr_eq(&existing.data, src) {
                return Ok(());
            }
            src.share();
            let old = std::mem::replace(&mut existing.data, Arc::clone(src));
            old.release(space);
        } else {
            let slot = space.alloc_record(RecordKind::FileRef)?;
            src.share();
            self.refs.insert(
                dst_off,
                FileBlockRef {
                    offset: dst_off,
                    data: Arc::clone(src),
                    slot,
                },
            );
        }
        trace!(
            offset = dst_off,
            page = src.page().0,
            refcount = src.refcount(),
            "block_share"
        );
        Ok(())
    }

    /// Shared handle to the data block at `off`, for cloning into another map.
    #[must_use]
    pub fn data_at(&self, off: u64) -> Option<Arc<DataBlockRef>> {
        self.fetch(off).map(|fbr| Arc::clone(&fbr.data))
    }
}

fn release_mapping(fbr: FileBlockRef, space: &dyn BlockSpace) {
    trace!(offset = fbr.offset, page = fbr.page().0, "block_drop");
    fbr.data.release(space);
    space.free_record(RecordKind::FileRef, fbr.slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_block::Region;
    use pfs_error::{PfsError, Resource};
    use pfs_types::{PAGE_SIZE, PAGE_SIZE_U64};
    use proptest::prelude::*;

    fn pool(pages: u64) -> Pool {
        let region = Region::volatile((pages + 2) * PAGE_SIZE_U64, 2).expect("region");
        Pool::new(Arc::new(region))
    }

    fn fill(pool: &Pool, pn: PageNumber, byte: u8) {
        pool.write_page(pn, 0, &[byte; PAGE_SIZE]).expect("fill");
    }

    fn first_byte(pool: &Pool, pn: PageNumber) -> u8 {
        let mut b = [0_u8; 1];
        pool.read_page(pn, 0, &mut b).expect("read");
        b[0]
    }

    #[test]
    fn require_maps_fresh_then_existing() {
        let pool = pool(16);
        let mut map = BlockMap::new();
        let first = map.require(0, &pool).expect("map");
        assert!(matches!(first, Mapped::Fresh(_)));
        let again = map.require(0, &pool).expect("map");
        assert_eq!(again, Mapped::Existing(first.page()));
        assert_eq!(map.len(), 1);
        assert_eq!(map.fetch(0).map(|f| f.data.refcount()), Some(1));
        assert!(map.fetch(PAGE_SIZE_U64).is_none());
    }

    #[test]
    fn shared_page_splits_on_require() {
        let pool = pool(16);
        let mut a = BlockMap::new();
        let mut b = BlockMap::new();
        let pn = a.require(0, &pool).expect("map").page();
        fill(&pool, pn, 0xAB);

        let data = a.data_at(0).expect("data");
        b.share_into(0, &data, &pool).expect("share");
        assert_eq!(data.refcount(), 2);
        drop(data);

        let split = b.require(0, &pool).expect("cow");
        let Mapped::Split(copy) = split else {
            panic!("expected split, got {split:?}");
        };
        assert_ne!(copy, pn);
        assert_eq!(first_byte(&pool, copy), 0xAB);
        assert_eq!(a.fetch(0).map(|f| f.data.refcount()), Some(1));
        assert_eq!(b.fetch(0).map(|f| f.data.refcount()), Some(1));
    }

    #[test]
    fn last_release_frees_the_page() {
        let pool = pool(16);
        let mut a = BlockMap::new();
        let mut b = BlockMap::new();
        a.require(0, &pool).expect("map");
        let data = a.data_at(0).expect("data");
        b.share_into(PAGE_SIZE_U64 * 3, &data, &pool).expect("share");
        drop(data);
        let before = pool.stats().free_pages;

        assert!(a.drop_at(0, &pool));
        assert_eq!(pool.stats().free_pages, before, "still referenced by b");
        assert_eq!(b.clear(&pool), 1);
        assert_eq!(pool.stats().free_pages, before + 1);
        assert!(!a.drop_at(0, &pool));
    }

    #[test]
    fn drop_from_rounds_up() {
        let pool = pool(16);
        let mut map = BlockMap::new();
        for i in 0..4 {
            map.require(i * PAGE_SIZE_U64, &pool).expect("map");
        }
        assert_eq!(map.drop_from(PAGE_SIZE_U64 + 1, &pool), 2);
        let left: Vec<u64> = map.iter().map(|f| f.offset).collect();
        assert_eq!(left, vec![0, PAGE_SIZE_U64]);
        assert_eq!(map.drop_from(PAGE_SIZE_U64, &pool), 1);
        let from: Vec<u64> = map.iter_from(1).map(|f| f.offset).collect();
        assert!(from.is_empty());
        assert_eq!(map.iter_from(0).count(), 1);
    }

    #[test]
    fn share_into_replaces_and_same_block_is_noop() {
        let pool = pool(16);
        let mut src = BlockMap::new();
        let mut dst = BlockMap::new();
        src.require(0, &pool).expect("map");
        dst.require(0, &pool).expect("map");
        let before = pool.stats().free_pages;

        let data = src.data_at(0).expect("data");
        dst.share_into(0, &data, &pool).expect("share");
        assert_eq!(pool.stats().free_pages, before + 1, "old dst page freed");
        dst.share_into(0, &data, &pool).expect("again");
        assert_eq!(data.refcount(), 2);
    }

    #[test]
    fn failed_require_leaves_map_untouched() {
        let pool = pool(3);
        let mut map = BlockMap::new();
        // data page + data-ref page + file-ref page
        map.require(0, &pool).expect("map");
        assert_eq!(pool.stats().free_pages, 0);
        let err = map.require(PAGE_SIZE_U64, &pool).expect_err("full");
        assert!(matches!(err, PfsError::NoSpace(Resource::Pages)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn failed_split_keeps_sharing() {
        let pool = pool(3);
        let mut a = BlockMap::new();
        let mut b = BlockMap::new();
        a.require(0, &pool).expect("map");
        let data = a.data_at(0).expect("data");
        b.share_into(0, &data, &pool).expect("share");
        assert!(b.require(0, &pool).is_err());
        assert_eq!(data.refcount(), 2);
        assert!(Arc::ptr_eq(&b.data_at(0).expect("b"), &data));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn refcounts_match_mappings(
            ops in proptest::collection::vec((0_u8..4, 0_u64..8, any::<bool>()), 1..60),
        ) {
            let pool = pool(256);
            let total = pool.stats().free_pages;
            let mut maps = [BlockMap::new(), BlockMap::new(), BlockMap::new()];

            for (op, page, which) in ops {
                let off = page * PAGE_SIZE_U64;
                let (x, y) = if which { (0, 1) } else { (1, 2) };
                match op {
                    0 => { maps[x].require(off, &pool).expect("require"); }
                    1 => { maps[x].drop_at(off, &pool); }
                    2 => {
                        if let Some(data) = maps[x].data_at(off) {
                            maps[y].share_into(off, &data, &pool).expect("share");
                        }
                    }
                    _ => { maps[y].drop_from(off, &pool); }
                }

                let mut counts: std::collections::HashMap<PageNumber, u32> = Default::default();
                for map in &maps {
                    let mut last = None;
                    for fbr in map.iter() {
                        prop_assert!(is_page_aligned(fbr.offset));
                        prop_assert!(last.is_none_or(|l| l < fbr.offset));
                        last = Some(fbr.offset);
                        *counts.entry(fbr.page()).or_default() += 1;
                    }
                }
                for map in &maps {
                    for fbr in map.iter() {
                        prop_assert_eq!(fbr.data.refcount(), counts[&fbr.page()]);
                    }
                }
            }

            for map in &mut maps {
                map.clear(&pool);
            }
            let stats = pool.stats();
            let carved: u64 = stats.carved_pages.iter().sum();
            prop_assert_eq!(stats.free_pages + carved, total);
        }
    }
}
