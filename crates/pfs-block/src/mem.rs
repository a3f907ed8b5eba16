use crate::{ByteDevice, check_range};
use parking_lot::RwLock;
use pfs_error::Result;
use pfs_types::{PAGE_SIZE, PAGE_SIZE_U64, offset_in_page, page_spans};

/// Anonymous memory region, materialized one page at a time.
///
/// Pages that were never written read as zeros and cost nothing, so a
/// nominal 1 GiB volatile region only pays for what is used.
#[derive(Debug)]
pub struct MemByteDevice {
    pages: Vec<RwLock<Option<Box<[u8]>>>>,
    len: u64,
}

impl MemByteDevice {
    /// Region of `len` bytes, rounded down to whole pages.
    #[must_use]
    pub fn new(len: u64) -> Self {
        let count = len / PAGE_SIZE_U64;
        let pages = (0..count).map(|_| RwLock::new(None)).collect();
        Self {
            pages,
            len: count * PAGE_SIZE_U64,
        }
    }

    /// Number of pages currently backed by memory.
    #[must_use]
    pub fn materialized_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.read().is_some()).count()
    }

    fn slot(&self, off: u64) -> &RwLock<Option<Box<[u8]>>> {
        let idx = usize::try_from(off / PAGE_SIZE_U64).unwrap_or(usize::MAX);
        // Callers range-check first.
        &self.pages[idx]
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range("read", offset, buf.len(), self.len)?;
        let end = offset + buf.len() as u64;
        let mut done = 0;
        for (off, len) in page_spans(offset, end) {
            let dst = &mut buf[done..done + len];
            let pos = offset_in_page(off);
            match self.slot(off).read().as_deref() {
                Some(page) => dst.copy_from_slice(&page[pos..pos + len]),
                None => dst.fill(0),
            }
            done += len;
        }
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range("write", offset, buf.len(), self.len)?;
        let end = offset + buf.len() as u64;
        let mut done = 0;
        for (off, len) in page_spans(offset, end) {
            let src = &buf[done..done + len];
            let pos = offset_in_page(off);
            let mut slot = self.slot(off).write();
            match slot.as_deref_mut() {
                Some(page) => page[pos..pos + len].copy_from_slice(src),
                // Zeros into an untouched page change nothing.
                None if src.iter().all(|b| *b == 0) => {}
                None => {
                    let mut page = vec![0_u8; PAGE_SIZE].into_boxed_slice();
                    page[pos..pos + len].copy_from_slice(src);
                    *slot = Some(page);
                }
            }
            done += len;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
