#![forbid(unsafe_code)]
//! Page and record-slot allocation.
//!
//! ## Design
//!
//! The pool is layered:
//!
//! 1. **Page list**: every arena page starts on the fresh cursor; freed
//!    pages go onto a LIFO recycle list. An in-use bitmap catches double
//!    frees.
//! 2. **Typed slot lists**: one per [`RecordKind`]. When a list runs dry it
//!    takes one whole page from the page list and carves it into
//!    `PAGE_SIZE / record_size` slots. Carved pages never return to the page
//!    list.
//!
//! All list mutation happens under one pool-wide lock. Page contents are
//! accessed through the [`Region`], outside that lock.

use parking_lot::Mutex;
use pfs_block::Region;
use pfs_error::{PfsError, Resource, Result, fault, pfs_assert};
use pfs_types::{PAGE_SIZE, PageNumber};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .is_some_and(|byte| (byte >> (idx % 8)) & 1 == 1)
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: usize) {
    if let Some(byte) = bitmap.get_mut(idx / 8) {
        *byte |= 1 << (idx % 8);
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: usize) {
    if let Some(byte) = bitmap.get_mut(idx / 8) {
        *byte &= !(1 << (idx % 8));
    }
}

// ── Record kinds ────────────────────────────────────────────────────────────

/// Fixed-size record classes carved out of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Inode,
    Dirent,
    DataRef,
    FileRef,
}

impl RecordKind {
    pub const ALL: [Self; 4] = [Self::Inode, Self::Dirent, Self::DataRef, Self::FileRef];

    /// Nominal on-media record size in bytes.
    #[must_use]
    pub fn record_size(self) -> usize {
        match self {
            Self::Inode => 192,
            Self::Dirent => 304,
            Self::DataRef | Self::FileRef => 32,
        }
    }

    /// Slots carved from one page.
    #[must_use]
    pub fn per_page(self) -> usize {
        PAGE_SIZE / self.record_size()
    }

    /// Resource reported when this kind cannot be allocated.
    #[must_use]
    pub fn resource(self) -> Resource {
        match self {
            Self::Inode => Resource::InodeSlots,
            Self::Dirent => Resource::DirentSlots,
            Self::DataRef => Resource::DataRefSlots,
            Self::FileRef => Resource::FileRefSlots,
        }
    }

    fn idx(self) -> usize {
        match self {
            Self::Inode => 0,
            Self::Dirent => 1,
            Self::DataRef => 2,
            Self::FileRef => 3,
        }
    }
}

/// Location of one record slot: carved page plus index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId {
    pub page: PageNumber,
    pub index: u16,
}

/// A granted slot; `donated` is set when a page was carved to satisfy it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrant {
    pub slot: SlotId,
    pub donated: Option<PageNumber>,
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_pages: u64,
    pub free_pages: u64,
    pub free_slots: [u64; 4],
    pub carved_pages: [u64; 4],
}

impl PoolStats {
    #[must_use]
    pub fn free_slots_of(&self, kind: RecordKind) -> u64 {
        self.free_slots[kind.idx()]
    }

    #[must_use]
    pub fn carved_pages_of(&self, kind: RecordKind) -> u64 {
        self.carved_pages[kind.idx()]
    }
}

#[derive(Debug, Default)]
struct SlotList {
    free: Vec<SlotId>,
    free_set: HashSet<SlotId>,
    carved: HashSet<PageNumber>,
}

#[derive(Debug)]
struct PoolInner {
    first_page: u64,
    end_page: u64,
    /// Next page never handed out.
    fresh: u64,
    recycled: Vec<PageNumber>,
    in_use: Vec<u8>,
    lists: [SlotList; 4],
}

impl PoolInner {
    #[expect(clippy::cast_possible_truncation)]
    fn bit(&self, pn: PageNumber) -> usize {
        (pn.0 - self.first_page) as usize
    }

    fn take_page(&mut self) -> Option<PageNumber> {
        let pn = match self.recycled.pop() {
            Some(pn) => pn,
            None if self.fresh < self.end_page => {
                let pn = PageNumber(self.fresh);
                self.fresh += 1;
                pn
            }
            None => return None,
        };
        let bit = self.bit(pn);
        pfs_assert!(!bitmap_get(&self.in_use, bit), "free page marked in use");
        bitmap_set(&mut self.in_use, bit);
        Some(pn)
    }

    fn free_pages(&self) -> u64 {
        (self.end_page - self.fresh) + self.recycled.len() as u64
    }
}

/// Arena allocator over a [`Region`].
#[derive(Debug)]
pub struct Pool {
    region: Arc<Region>,
    inner: Mutex<PoolInner>,
}

impl Pool {
    #[must_use]
    pub fn new(region: Arc<Region>) -> Self {
        let first_page = region.first_page();
        let end_page = region.end_page();
        let bits = usize::try_from(end_page - first_page).unwrap_or(usize::MAX);
        let inner = PoolInner {
            first_page,
            end_page,
            fresh: first_page,
            recycled: Vec::new(),
            in_use: vec![0_u8; bits.div_ceil(8)],
            lists: Default::default(),
        };
        Self {
            region,
            inner: Mutex::new(inner),
        }
    }

    #[must_use]
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Arena pages managed by this pool.
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.region.arena_pages()
    }

    /// Take one zero-filled page from the page list.
    pub fn alloc_page(&self) -> Result<PageNumber> {
        let pn = self
            .inner
            .lock()
            .take_page()
            .ok_or(PfsError::NoSpace(Resource::Pages))?;
        if let Err(err) = self.region.zero_page(pn) {
            self.free_page(pn);
            return Err(err);
        }
        trace!(page = pn.0, "page_alloc");
        Ok(pn)
    }

    /// Return a page to the page list.
    pub fn free_page(&self, pn: PageNumber) {
        let mut inner = self.inner.lock();
        if pn.0 < inner.first_page || pn.0 >= inner.end_page {
            fault(file!(), line!(), "free of page outside the arena");
        }
        let bit = inner.bit(pn);
        if !bitmap_get(&inner.in_use, bit) {
            fault(file!(), line!(), "double free of page");
        }
        bitmap_clear(&mut inner.in_use, bit);
        inner.recycled.push(pn);
        drop(inner);
        trace!(page = pn.0, "page_free");
    }

    /// Take one record slot of `kind`, carving a fresh page when the list is empty.
    pub fn alloc_slot(&self, kind: RecordKind) -> Result<SlotGrant> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.lists[kind.idx()].free.pop() {
            inner.lists[kind.idx()].free_set.remove(&slot);
            return Ok(SlotGrant {
                slot,
                donated: None,
            });
        }

        let pn = inner
            .take_page()
            .ok_or(PfsError::NoSpace(kind.resource()))?;
        let list = &mut inner.lists[kind.idx()];
        list.carved.insert(pn);
        #[expect(clippy::cast_possible_truncation)]
        for index in (1..kind.per_page() as u16).rev() {
            let slot = SlotId { page: pn, index };
            list.free.push(slot);
            list.free_set.insert(slot);
        }
        drop(inner);
        trace!(page = pn.0, ?kind, slots = kind.per_page(), "page_carve");
        Ok(SlotGrant {
            slot: SlotId { page: pn, index: 0 },
            donated: Some(pn),
        })
    }

    /// Return a record slot to its list.
    pub fn free_slot(&self, kind: RecordKind, slot: SlotId) {
        let mut inner = self.inner.lock();
        let list = &mut inner.lists[kind.idx()];
        if !list.carved.contains(&slot.page) || usize::from(slot.index) >= kind.per_page() {
            fault(file!(), line!(), "slot does not belong to this record kind");
        }
        if !list.free_set.insert(slot) {
            fault(file!(), line!(), "double free of record slot");
        }
        list.free.push(slot);
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let mut stats = PoolStats {
            total_pages: inner.end_page - inner.first_page,
            free_pages: inner.free_pages(),
            ..PoolStats::default()
        };
        for kind in RecordKind::ALL {
            let list = &inner.lists[kind.idx()];
            stats.free_slots[kind.idx()] = list.free.len() as u64;
            stats.carved_pages[kind.idx()] = list.carved.len() as u64;
        }
        stats
    }

    // ── Page I/O ────────────────────────────────────────────────────────────

    pub fn read_page(&self, pn: PageNumber, pos: usize, buf: &mut [u8]) -> Result<()> {
        self.region.read(pn, pos, buf)
    }

    pub fn write_page(&self, pn: PageNumber, pos: usize, bytes: &[u8]) -> Result<()> {
        self.region.write(pn, pos, bytes)
    }

    pub fn copy_page(&self, src: PageNumber, dst: PageNumber) -> Result<()> {
        self.region.copy_page(src, dst)
    }

    pub fn zero_page_range(&self, pn: PageNumber, pos: usize, len: usize) -> Result<()> {
        self.region.zero(pn, pos, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pfs_types::PAGE_SIZE_U64;

    fn pool(pages: u64) -> Pool {
        let region = Region::volatile((pages + 2) * PAGE_SIZE_U64, 2).expect("region");
        Pool::new(Arc::new(region))
    }

    #[test]
    fn bitmap_ops() {
        let mut bm = [0_u8; 2];
        bitmap_set(&mut bm, 9);
        assert!(bitmap_get(&bm, 9));
        assert!(!bitmap_get(&bm, 8));
        bitmap_clear(&mut bm, 9);
        assert!(!bitmap_get(&bm, 9));
        assert!(!bitmap_get(&bm, 100));
    }

    #[test]
    fn record_geometry() {
        assert_eq!(RecordKind::Inode.per_page(), 21);
        assert_eq!(RecordKind::Dirent.per_page(), 13);
        assert_eq!(RecordKind::DataRef.per_page(), 128);
        assert_eq!(RecordKind::FileRef.per_page(), 128);
    }

    #[test]
    fn pages_come_from_the_arena_and_are_zeroed() {
        let pool = pool(4);
        let pn = pool.alloc_page().expect("page");
        assert_eq!(pn, PageNumber(2));
        pool.write_page(pn, 0, b"dirty").expect("write");
        pool.free_page(pn);

        let again = pool.alloc_page().expect("page");
        assert_eq!(again, pn, "recycled list is LIFO");
        let mut buf = [0xFF_u8; 5];
        pool.read_page(again, 0, &mut buf).expect("read");
        assert_eq!(buf, [0; 5]);
    }

    #[test]
    fn exhaustion_reports_pages() {
        let pool = pool(2);
        pool.alloc_page().expect("first");
        pool.alloc_page().expect("second");
        assert!(matches!(
            pool.alloc_page(),
            Err(PfsError::NoSpace(Resource::Pages))
        ));
        assert_eq!(pool.stats().free_pages, 0);
    }

    #[test]
    fn slot_lists_carve_one_page() {
        let pool = pool(4);
        let first = pool.alloc_slot(RecordKind::Dirent).expect("slot");
        assert!(first.donated.is_some());
        let stats = pool.stats();
        assert_eq!(stats.free_pages, 3);
        assert_eq!(stats.free_slots_of(RecordKind::Dirent), 12);
        assert_eq!(stats.carved_pages_of(RecordKind::Dirent), 1);

        for _ in 0..12 {
            let grant = pool.alloc_slot(RecordKind::Dirent).expect("slot");
            assert!(grant.donated.is_none());
        }
        let next = pool.alloc_slot(RecordKind::Dirent).expect("slot");
        assert!(next.donated.is_some(), "thirteenth slot carves again");
        assert_eq!(pool.stats().free_pages, 2);
    }

    #[test]
    fn slot_exhaustion_reports_kind() {
        let pool = pool(1);
        pool.alloc_page().expect("only page");
        assert!(matches!(
            pool.alloc_slot(RecordKind::Inode),
            Err(PfsError::NoSpace(Resource::InodeSlots))
        ));
    }

    #[test]
    fn freed_slots_are_reused_and_pages_stay_carved() {
        let pool = pool(2);
        let grant = pool.alloc_slot(RecordKind::FileRef).expect("slot");
        pool.free_slot(RecordKind::FileRef, grant.slot);
        let again = pool.alloc_slot(RecordKind::FileRef).expect("slot");
        assert_eq!(again.slot, grant.slot);
        assert!(again.donated.is_none());
        assert_eq!(pool.stats().free_pages, 1);
    }
}
