use crate::{ByteDevice, DurableCopy, MemByteDevice};
use pfs_error::{PfsError, Result, pfs_assert};
use pfs_types::{PAGE_SIZE, PAGE_SIZE_U64, PageNumber};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Where the arena lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Anonymous memory; contents vanish at unmount.
    Volatile,
    /// Caller-supplied device; mutations go through [`DurableCopy`].
    Persistent,
}

impl RegionKind {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Volatile => "volatile",
            Self::Persistent => "persistent",
        }
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Page-addressed view of a backing device.
///
/// Page numbers are absolute device pages. The arena is `[first_page,
/// end_page)`; pages below `first_page` are header pages reachable only
/// through [`Region::read_at`] and [`Region::persist_at`].
pub struct Region {
    dev: Arc<dyn ByteDevice>,
    durable: Option<Arc<dyn DurableCopy>>,
    kind: RegionKind,
    first_page: u64,
    end_page: u64,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("kind", &self.kind)
            .field("first_page", &self.first_page)
            .field("end_page", &self.end_page)
            .finish_non_exhaustive()
    }
}

impl Region {
    /// Anonymous region of `len` bytes with the arena starting at `first_page`.
    pub fn volatile(len: u64, first_page: u64) -> Result<Self> {
        let dev: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(len));
        Self::new(dev, None, RegionKind::Volatile, first_page)
    }

    /// Persistent region over `dev`; page mutations are made durable by `durable`.
    pub fn persistent(
        dev: Arc<dyn ByteDevice>,
        durable: Arc<dyn DurableCopy>,
        first_page: u64,
    ) -> Result<Self> {
        Self::new(dev, Some(durable), RegionKind::Persistent, first_page)
    }

    fn new(
        dev: Arc<dyn ByteDevice>,
        durable: Option<Arc<dyn DurableCopy>>,
        kind: RegionKind,
        first_page: u64,
    ) -> Result<Self> {
        let end_page = dev.len_bytes() / PAGE_SIZE_U64;
        if end_page <= first_page {
            return Err(PfsError::InvalidArgument(format!(
                "region of {end_page} pages has no arena past page {first_page}"
            )));
        }
        Ok(Self {
            dev,
            durable,
            kind,
            first_page,
            end_page,
        })
    }

    #[must_use]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    #[must_use]
    pub fn first_page(&self) -> u64 {
        self.first_page
    }

    #[must_use]
    pub fn end_page(&self) -> u64 {
        self.end_page
    }

    /// Pages available to the allocator.
    #[must_use]
    pub fn arena_pages(&self) -> u64 {
        self.end_page - self.first_page
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn ByteDevice> {
        &self.dev
    }

    fn page_offset(&self, pn: PageNumber, pos: usize, len: usize) -> u64 {
        pfs_assert!(pn.0 >= self.first_page && pn.0 < self.end_page);
        pfs_assert!(pos + len <= PAGE_SIZE);
        pn.byte_offset() + pos as u64
    }

    /// Raw read at an absolute byte offset (header pages included).
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.dev.read_exact_at(offset, buf)
    }

    /// Raw mutation at an absolute byte offset, durable when persistent.
    pub fn persist_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        match &self.durable {
            Some(durable) => durable.persist(self.dev.as_ref(), offset, bytes),
            None => self.dev.write_all_at(offset, bytes),
        }
    }

    /// Read `buf.len()` bytes from page `pn` starting at `pos`.
    pub fn read(&self, pn: PageNumber, pos: usize, buf: &mut [u8]) -> Result<()> {
        let off = self.page_offset(pn, pos, buf.len());
        self.dev.read_exact_at(off, buf)
    }

    /// Write `bytes` into page `pn` starting at `pos`.
    pub fn write(&self, pn: PageNumber, pos: usize, bytes: &[u8]) -> Result<()> {
        let off = self.page_offset(pn, pos, bytes.len());
        self.persist_at(off, bytes)
    }

    /// Zero `len` bytes of page `pn` starting at `pos`.
    pub fn zero(&self, pn: PageNumber, pos: usize, len: usize) -> Result<()> {
        trace!(page = pn.0, pos, len, "page_zero");
        self.write(pn, pos, &vec![0_u8; len])
    }

    pub fn zero_page(&self, pn: PageNumber) -> Result<()> {
        self.zero(pn, 0, PAGE_SIZE)
    }

    /// Copy the whole of page `src` over page `dst`.
    pub fn copy_page(&self, src: PageNumber, dst: PageNumber) -> Result<()> {
        let mut buf = vec![0_u8; PAGE_SIZE];
        self.read(src, 0, &mut buf)?;
        self.write(dst, 0, &buf)
    }

    /// Flush the device.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WriteThrough;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingCopy {
        calls: AtomicUsize,
    }

    impl DurableCopy for CountingCopy {
        fn persist(&self, dev: &dyn ByteDevice, offset: u64, bytes: &[u8]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            WriteThrough.persist(dev, offset, bytes)
        }
    }

    #[test]
    fn volatile_region_geometry() {
        let region = Region::volatile(16 * PAGE_SIZE_U64, 2).expect("region");
        assert_eq!(region.kind(), RegionKind::Volatile);
        assert_eq!(region.first_page(), 2);
        assert_eq!(region.end_page(), 16);
        assert_eq!(region.arena_pages(), 14);
    }

    #[test]
    fn region_without_arena_is_rejected() {
        assert!(Region::volatile(2 * PAGE_SIZE_U64, 2).is_err());
    }

    #[test]
    fn page_io_and_copy() {
        let region = Region::volatile(8 * PAGE_SIZE_U64, 2).expect("region");
        region.write(PageNumber(3), 10, b"hello").expect("write");
        region.copy_page(PageNumber(3), PageNumber(5)).expect("copy");
        let mut buf = [0_u8; 5];
        region.read(PageNumber(5), 10, &mut buf).expect("read");
        assert_eq!(&buf, b"hello");

        region.zero(PageNumber(5), 11, 2).expect("zero");
        region.read(PageNumber(5), 10, &mut buf).expect("read");
        assert_eq!(&buf, b"h\0\0lo");
    }

    #[test]
    fn persistent_mutations_use_durable_copy() {
        let dev: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(4 * PAGE_SIZE_U64));
        let durable = Arc::new(CountingCopy::default());
        let region = Region::persistent(dev, durable.clone(), 2).expect("region");
        assert_eq!(region.kind(), RegionKind::Persistent);

        region.write(PageNumber(2), 0, b"x").expect("write");
        region.zero_page(PageNumber(3)).expect("zero");
        region.copy_page(PageNumber(2), PageNumber(3)).expect("copy");
        assert_eq!(durable.calls.load(Ordering::Relaxed), 3);
    }
}
