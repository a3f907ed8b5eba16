//! File I/O engine: read, write, fallocate, truncate, seek, clone.
//!
//! Multi-page operations take the inode lock once per page and drop it
//! between pages. Writers to different pages of one file interleave; two
//! writers to the same page race at the granularity of one mapping call.

use crate::{PageFs, lock_pair, now};
use pfs_error::{PfsError, Result};
use pfs_extent::BlockMap;
use pfs_inode::{InodeHandle, InodePayload, InodeRecord};
use pfs_types::{
    InodeNumber, MAX_FILE_SIZE, MAX_IO_SIZE, PAGE_SIZE, PAGE_SIZE_U64, PageNumber,
    is_page_aligned, offset_in_page, page_base, page_spans,
};
use tracing::debug;

// ── Flags ───────────────────────────────────────────────────────────────────

pub const FALLOC_FL_KEEP_SIZE: u32 = 0x01;
pub const FALLOC_FL_PUNCH_HOLE: u32 = 0x02;
pub const FALLOC_FL_NO_HIDE_STALE: u32 = 0x04;
pub const FALLOC_FL_COLLAPSE_RANGE: u32 = 0x08;
pub const FALLOC_FL_ZERO_RANGE: u32 = 0x10;
pub const FALLOC_FL_INSERT_RANGE: u32 = 0x20;
pub const FALLOC_FL_UNSHARE_RANGE: u32 = 0x40;

pub const SEEK_DATA: i32 = 3;
pub const SEEK_HOLE: i32 = 4;

/// What [`PageFs::seek`] looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Data,
    Hole,
}

impl Whence {
    /// Decode a raw `lseek` whence; only `SEEK_DATA` and `SEEK_HOLE` are handled here.
    pub fn from_raw(whence: i32) -> Result<Self> {
        match whence {
            SEEK_DATA => Ok(Self::Data),
            SEEK_HOLE => Ok(Self::Hole),
            other => Err(PfsError::NotSupported(format!("seek whence {other}"))),
        }
    }
}

// ── Checks ──────────────────────────────────────────────────────────────────

fn check_io(off: u64, len: u64) -> Result<()> {
    if len == 0 {
        return Err(PfsError::InvalidArgument("zero-length range".to_owned()));
    }
    if off > MAX_FILE_SIZE || off.checked_add(len).is_none_or(|end| end > MAX_FILE_SIZE) {
        return Err(PfsError::FileTooBig);
    }
    Ok(())
}

fn check_rw(off: u64, len: u64) -> Result<()> {
    if len > MAX_IO_SIZE {
        return Err(PfsError::InvalidArgument(format!(
            "I/O of {len} bytes exceeds {MAX_IO_SIZE}"
        )));
    }
    check_io(off, len)
}

fn check_falloc_flags(mode: u32) -> Result<()> {
    let refused = [
        (FALLOC_FL_NO_HIDE_STALE, "no-hide-stale"),
        (FALLOC_FL_COLLAPSE_RANGE, "collapse-range"),
        (FALLOC_FL_INSERT_RANGE, "insert-range"),
        (FALLOC_FL_UNSHARE_RANGE, "unshare-range"),
    ];
    for (flag, name) in refused {
        if mode & flag != 0 {
            return Err(PfsError::NotSupported(format!("fallocate {name}")));
        }
    }
    if mode & FALLOC_FL_PUNCH_HOLE != 0 && mode & FALLOC_FL_KEEP_SIZE == 0 {
        return Err(PfsError::NotSupported(
            "punch-hole without keep-size".to_owned(),
        ));
    }
    Ok(())
}

pub(crate) fn file_map(payload: &InodePayload) -> Result<&BlockMap> {
    match payload {
        InodePayload::RegularFile { map, .. } => Ok(map),
        InodePayload::Directory(_) => Err(PfsError::IsDirectory),
        other => Err(PfsError::InvalidArgument(format!(
            "{} inode has no data pages",
            other.name()
        ))),
    }
}

pub(crate) fn file_map_mut(payload: &mut InodePayload) -> Result<&mut BlockMap> {
    match payload {
        InodePayload::RegularFile { map, .. } => Ok(map),
        InodePayload::Directory(_) => Err(PfsError::IsDirectory),
        other => Err(PfsError::InvalidArgument(format!(
            "{} inode has no data pages",
            other.name()
        ))),
    }
}

fn clone_not_supported() -> PfsError {
    PfsError::NotSupported("clone needs two regular files".to_owned())
}

impl PageFs {
    // ── Read / write ────────────────────────────────────────────────────────

    /// Read into `buf` from `off`. Stops at end of file; holes read as zeros.
    pub fn read(&self, ino: InodeNumber, off: u64, buf: &mut [u8]) -> Result<usize> {
        check_rw(off, buf.len() as u64)?;
        let handle = self.handle(ino)?;
        let size = {
            let rec = handle.lock();
            file_map(&rec.payload)?;
            rec.meta.size
        };
        let end = (off + buf.len() as u64).min(size);
        let mut done = 0_usize;
        for (pos, n) in page_spans(off, end) {
            let dst = &mut buf[done..done + n];
            let rec = handle.lock();
            match file_map(&rec.payload)?.fetch(page_base(pos)) {
                Some(fbr) => {
                    self.space
                        .pool()
                        .read_page(fbr.page(), offset_in_page(pos), dst)?;
                }
                None => dst.fill(0),
            }
            drop(rec);
            done += n;
        }
        Ok(done)
    }

    /// Write `data` at `off`, mapping and splitting pages as needed.
    ///
    /// If space runs out part way, the size covers what was written and the
    /// error is returned.
    pub fn write(&self, ino: InodeNumber, off: u64, data: &[u8]) -> Result<usize> {
        check_rw(off, data.len() as u64)?;
        let handle = self.handle(ino)?;
        let mut done = 0_usize;
        let mut outcome = Ok(());
        for (pos, n) in page_spans(off, off + data.len() as u64) {
            let mut rec = handle.lock();
            let step = file_map_mut(&mut rec.payload)
                .and_then(|map| map.require(page_base(pos), &self.space))
                .and_then(|mapped| {
                    self.space.pool().write_page(
                        mapped.page(),
                        offset_in_page(pos),
                        &data[done..done + n],
                    )
                });
            drop(rec);
            if let Err(err) = step {
                outcome = Err(err);
                break;
            }
            done += n;
        }
        if done > 0 {
            let mut rec = handle.lock();
            rec.meta.size = rec.meta.size.max(off + done as u64);
            rec.meta.touch_modified(now());
        }
        outcome.map(|()| done)
    }

    // ── Fallocate ───────────────────────────────────────────────────────────

    pub fn fallocate(&self, ino: InodeNumber, off: u64, len: u64, mode: u32) -> Result<()> {
        check_falloc_flags(mode)?;
        check_io(off, len)?;
        let handle = self.handle(ino)?;
        file_map(&handle.lock().payload)?;
        let end = off + len;
        debug!(ino = ino.0, off, len, mode, "fallocate");
        if mode & FALLOC_FL_PUNCH_HOLE != 0 {
            self.punch_hole(&handle, off, end)
        } else if mode & FALLOC_FL_ZERO_RANGE != 0 {
            self.zero_range(&handle, off, end)
        } else {
            self.falloc_range(&handle, off, end, mode & FALLOC_FL_KEEP_SIZE != 0)
        }
    }

    fn falloc_range(&self, handle: &InodeHandle, off: u64, end: u64, keep_size: bool) -> Result<()> {
        for (pos, _) in page_spans(off, end) {
            let mut rec = handle.lock();
            file_map_mut(&mut rec.payload)?.require(page_base(pos), &self.space)?;
        }
        let mut rec = handle.lock();
        if !keep_size {
            rec.meta.size = rec.meta.size.max(end);
        }
        rec.meta.ctime = now();
        Ok(())
    }

    /// Whole pages lose their mapping; partial pages are zeroed in place.
    fn punch_hole(&self, handle: &InodeHandle, off: u64, end: u64) -> Result<()> {
        for (pos, n) in page_spans(off, end) {
            let base = page_base(pos);
            let mut rec = handle.lock();
            let map = file_map_mut(&mut rec.payload)?;
            if n == PAGE_SIZE {
                map.drop_at(base, &self.space);
            } else if map.is_mapped(base) {
                self.zero_in_page(map, pos, n)?;
            }
        }
        handle.lock().meta.touch_modified(now());
        Ok(())
    }

    /// Zero mapped pages in range; holes stay holes.
    fn zero_range(&self, handle: &InodeHandle, off: u64, end: u64) -> Result<()> {
        for (pos, n) in page_spans(off, end) {
            let mut rec = handle.lock();
            let map = file_map_mut(&mut rec.payload)?;
            if map.is_mapped(page_base(pos)) {
                self.zero_in_page(map, pos, n)?;
            }
        }
        handle.lock().meta.touch_modified(now());
        Ok(())
    }

    /// Zero `n` bytes at `pos` of a mapped page, splitting it first if shared.
    fn zero_in_page(&self, map: &mut BlockMap, pos: u64, n: usize) -> Result<()> {
        let page = map.require(page_base(pos), &self.space)?.page();
        self.space
            .pool()
            .zero_page_range(page, offset_in_page(pos), n)
    }

    // ── Truncate ────────────────────────────────────────────────────────────

    pub fn truncate(&self, ino: InodeNumber, size: u64) -> Result<()> {
        let handle = self.handle(ino)?;
        let mut rec = handle.lock();
        self.truncate_locked(&mut rec, size)
    }

    /// Set the size. Shrinking zeroes the tail of the page holding the new
    /// end, then drops every page past it. A failed split of a shared
    /// boundary page leaves the file untouched.
    pub(crate) fn truncate_locked(&self, rec: &mut InodeRecord, size: u64) -> Result<()> {
        let map = file_map_mut(&mut rec.payload)?;
        if size > MAX_FILE_SIZE {
            return Err(PfsError::FileTooBig);
        }
        if size < rec.meta.size {
            let tail = offset_in_page(size);
            if tail != 0 && map.is_mapped(page_base(size)) {
                self.zero_in_page(map, size, PAGE_SIZE - tail)?;
            }
            let dropped = map.drop_from(size, &self.space);
            debug!(ino = rec.ino.0, from = rec.meta.size, to = size, dropped, "truncate");
        }
        rec.meta.size = size;
        rec.meta.touch_modified(now());
        Ok(())
    }

    // ── Seek ────────────────────────────────────────────────────────────────

    /// First data or hole position at or after `from`.
    ///
    /// `OutOfRange` when `from` is at or past the end, or when no data
    /// follows it. The end of file counts as a hole.
    pub fn seek(&self, ino: InodeNumber, from: u64, whence: Whence) -> Result<u64> {
        let handle = self.handle(ino)?;
        let rec = handle.lock();
        let map = file_map(&rec.payload)?;
        let size = rec.meta.size;
        if from >= size {
            return Err(PfsError::OutOfRange);
        }
        let base = page_base(from);
        let found = match whence {
            Whence::Data => map.iter_from(base).next().map(|fbr| fbr.offset),
            Whence::Hole => {
                let mut expect = base;
                for fbr in map.iter_from(base) {
                    if fbr.offset != expect {
                        break;
                    }
                    expect += PAGE_SIZE_U64;
                }
                Some(expect)
            }
        };
        match found {
            Some(pos) if pos < size => Ok(pos.max(from)),
            _ if whence == Whence::Hole => Ok(size),
            _ => Err(PfsError::OutOfRange),
        }
    }

    // ── Clone ───────────────────────────────────────────────────────────────

    /// Share `len` bytes of `src` at `src_off` into `dst` at `dst_off`.
    ///
    /// All-zero arguments clone the whole file. Ranged clones must be page
    /// aligned.
    pub fn clone_range(
        &self,
        src: InodeNumber,
        dst: InodeNumber,
        src_off: u64,
        dst_off: u64,
        len: u64,
    ) -> Result<()> {
        let src_h = self.handle(src)?;
        let dst_h = self.handle(dst)?;
        for handle in [&src_h, &dst_h] {
            if !handle.lock().is_regular() {
                return Err(clone_not_supported());
            }
        }
        if src == dst {
            return Ok(());
        }
        debug!(src = src.0, dst = dst.0, src_off, dst_off, len, "clone");
        if src_off == 0 && dst_off == 0 && len == 0 {
            return self.clone_whole(&src_h, &dst_h);
        }
        if ![src_off, dst_off, len].into_iter().all(is_page_aligned) {
            return Err(PfsError::NotSupported(
                "clone range is not page aligned".to_owned(),
            ));
        }
        for off in [src_off, dst_off] {
            if off.checked_add(len).is_none_or(|end| end > MAX_FILE_SIZE) {
                return Err(PfsError::FileTooBig);
            }
        }

        let mut done = 0;
        while done < len {
            let (s, d) = (src_off + done, dst_off + done);
            let (src_g, mut dst_g) = lock_pair(&src_h, &dst_h);
            let dst_rec = &mut *dst_g;
            let shared = file_map(&src_g.payload)?.data_at(s);
            let map = file_map_mut(&mut dst_rec.payload)?;
            match shared {
                Some(data) => map.share_into(d, &data, &self.space)?,
                None if map.is_mapped(d) => self.zero_in_page(map, d, PAGE_SIZE)?,
                None => {}
            }
            dst_rec.meta.size = dst_rec.meta.size.max(d + PAGE_SIZE_U64);
            dst_rec.meta.touch_modified(now());
            done += PAGE_SIZE_U64;
        }
        Ok(())
    }

    /// Replace every mapping of `dst` with a share of `src`'s and copy the size.
    ///
    /// On failure `dst` keeps the pages shared so far and its size ends
    /// where the first unshared page begins.
    fn clone_whole(&self, src_h: &InodeHandle, dst_h: &InodeHandle) -> Result<()> {
        let (src_g, mut dst_g) = lock_pair(src_h, dst_h);
        let dst_rec = &mut *dst_g;
        let src_map = file_map(&src_g.payload)?;
        let dst_map = file_map_mut(&mut dst_rec.payload)?;
        dst_map.clear(&self.space);
        for fbr in src_map.iter() {
            if let Err(err) = dst_map.share_into(fbr.offset, &fbr.data, &self.space) {
                dst_rec.meta.size = src_g.meta.size.min(fbr.offset);
                dst_rec.meta.touch_modified(now());
                return Err(err);
            }
        }
        dst_rec.meta.size = src_g.meta.size;
        dst_rec.meta.touch_modified(now());
        Ok(())
    }

    // ── Misc ────────────────────────────────────────────────────────────────

    /// Physical page backing block `index` of a regular file; page 0 is a hole.
    pub fn get_block(&self, ino: InodeNumber, index: u64) -> Result<PageNumber> {
        let handle = self.handle(ino)?;
        let rec = handle.lock();
        let InodePayload::RegularFile { map, .. } = &rec.payload else {
            return Err(PfsError::NotSupported(format!(
                "get_block on {} inode",
                rec.payload.name()
            )));
        };
        let off = index
            .checked_mul(PAGE_SIZE_U64)
            .filter(|off| *off < MAX_FILE_SIZE)
            .ok_or(PfsError::FileTooBig)?;
        Ok(map.fetch(off).map_or(PageNumber(0), |fbr| fbr.page()))
    }

    /// Data is persisted as it is written; only checks the inode exists.
    pub fn sync(&self, ino: InodeNumber, off: u64, len: u64) -> Result<()> {
        self.handle(ino)?;
        debug!(ino = ino.0, off, len, "sync");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MountOptions, NewInode};

    fn fs(pages: u64) -> PageFs {
        PageFs::mount(MountOptions::volatile((pages + 2) * PAGE_SIZE_U64)).expect("mount")
    }

    fn file(fs: &PageFs) -> InodeNumber {
        fs.new_inode(fs.root_ino(), NewInode::regular(0o644))
            .expect("file")
            .ino
    }

    fn data_pages(fs: &PageFs, ino: InodeNumber) -> Vec<u64> {
        let handle = fs.handle(ino).expect("inode");
        let rec = handle.lock();
        file_map(&rec.payload)
            .expect("file")
            .iter()
            .map(|f| f.offset)
            .collect()
    }

    fn size(fs: &PageFs, ino: InodeNumber) -> u64 {
        fs.getattr(ino).expect("attr").size
    }

    #[test]
    fn range_checks() {
        let fs = fs(16);
        let f = file(&fs);
        assert!(matches!(fs.write(f, 0, &[]), Err(PfsError::InvalidArgument(_))));
        assert!(matches!(
            fs.write(f, MAX_FILE_SIZE, &[1]),
            Err(PfsError::FileTooBig)
        ));
        let big = vec![0_u8; usize::try_from(MAX_IO_SIZE).expect("fits") + 1];
        assert!(matches!(fs.write(f, 0, &big), Err(PfsError::InvalidArgument(_))));
        assert!(matches!(
            fs.fallocate(f, 0, 0, 0),
            Err(PfsError::InvalidArgument(_))
        ));
        let mut buf = [0_u8; 4];
        assert!(matches!(
            fs.read(fs.root_ino(), 0, &mut buf),
            Err(PfsError::IsDirectory)
        ));
        let fifo = fs
            .new_inode(fs.root_ino(), NewInode::fifo(0o644))
            .expect("fifo")
            .ino;
        assert!(matches!(
            fs.write(fifo, 0, b"x"),
            Err(PfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn read_clamps_to_size_and_fills_holes() {
        let fs = fs(16);
        let f = file(&fs);
        fs.write(f, PAGE_SIZE_U64 + 10, b"abc").expect("write");
        assert_eq!(size(&fs, f), PAGE_SIZE_U64 + 13);
        let mut buf = vec![0xFF_u8; 2 * PAGE_SIZE];
        let n = fs.read(f, 0, &mut buf).expect("read");
        assert_eq!(n, PAGE_SIZE + 13);
        assert!(buf[..PAGE_SIZE + 10].iter().all(|b| *b == 0));
        assert_eq!(&buf[PAGE_SIZE + 10..PAGE_SIZE + 13], b"abc");
        assert_eq!(fs.read(f, 1 << 20, &mut buf).expect("past end"), 0);
        assert_eq!(data_pages(&fs, f), vec![PAGE_SIZE_U64]);
    }

    #[test]
    fn partial_write_keeps_written_size() {
        // inode page, then data, data-ref and file-ref pages for page 0
        let fs = fs(4);
        let f = file(&fs);
        let data = vec![9_u8; 3 * PAGE_SIZE];
        let err = fs.write(f, 0, &data).expect_err("no space");
        assert!(matches!(err, PfsError::NoSpace(_)));
        assert_eq!(size(&fs, f), PAGE_SIZE_U64);
    }

    #[test]
    fn fallocate_flags() {
        let fs = fs(16);
        let f = file(&fs);
        for mode in [
            FALLOC_FL_NO_HIDE_STALE,
            FALLOC_FL_COLLAPSE_RANGE,
            FALLOC_FL_INSERT_RANGE,
            FALLOC_FL_UNSHARE_RANGE,
            FALLOC_FL_PUNCH_HOLE,
        ] {
            assert!(matches!(
                fs.fallocate(f, 0, 1, mode),
                Err(PfsError::NotSupported(_))
            ));
        }
    }

    #[test]
    fn fallocate_maps_and_grows() {
        let fs = fs(16);
        let f = file(&fs);
        fs.fallocate(f, 100, 2 * PAGE_SIZE_U64, 0).expect("falloc");
        assert_eq!(data_pages(&fs, f), vec![0, PAGE_SIZE_U64, 2 * PAGE_SIZE_U64]);
        assert_eq!(size(&fs, f), 2 * PAGE_SIZE_U64 + 100);

        fs.fallocate(f, 8 * PAGE_SIZE_U64, 1, FALLOC_FL_KEEP_SIZE)
            .expect("keep");
        assert_eq!(size(&fs, f), 2 * PAGE_SIZE_U64 + 100);
        assert_eq!(data_pages(&fs, f).len(), 4);
    }

    #[test]
    fn punch_hole_zeroes_partial_and_drops_whole_pages() {
        let fs = fs(16);
        let f = file(&fs);
        fs.write(f, 0, &vec![0xAA_u8; 3 * PAGE_SIZE]).expect("write");
        let bfree = fs.statfs().bfree;
        let mode = FALLOC_FL_PUNCH_HOLE | FALLOC_FL_KEEP_SIZE;
        fs.fallocate(f, 100, 2 * PAGE_SIZE_U64 - 100, mode).expect("punch");

        assert_eq!(data_pages(&fs, f), vec![0, 2 * PAGE_SIZE_U64]);
        assert_eq!(fs.statfs().bfree, bfree + 1);
        assert_eq!(size(&fs, f), 3 * PAGE_SIZE_U64);
        let mut buf = vec![0_u8; 3 * PAGE_SIZE];
        fs.read(f, 0, &mut buf).expect("read");
        assert!(buf[..100].iter().all(|b| *b == 0xAA));
        assert!(buf[100..2 * PAGE_SIZE].iter().all(|b| *b == 0));
        assert!(buf[2 * PAGE_SIZE..].iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn zero_range_keeps_holes_and_mappings() {
        let fs = fs(16);
        let f = file(&fs);
        fs.write(f, 0, &[1_u8; 10]).expect("write");
        fs.truncate(f, 3 * PAGE_SIZE_U64).expect("grow");
        fs.fallocate(f, 5, 3 * PAGE_SIZE_U64 - 5, FALLOC_FL_ZERO_RANGE)
            .expect("zero");
        assert_eq!(data_pages(&fs, f), vec![0]);
        assert_eq!(size(&fs, f), 3 * PAGE_SIZE_U64);
        let mut buf = [0_u8; 10];
        fs.read(f, 0, &mut buf).expect("read");
        assert_eq!(buf, [1, 1, 1, 1, 1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn truncate_drops_pages_and_zeroes_tail() {
        let fs = fs(16);
        let f = file(&fs);
        fs.write(f, 0, &vec![5_u8; 3 * PAGE_SIZE]).expect("write");
        fs.truncate(f, PAGE_SIZE_U64 + 1).expect("shrink");
        assert_eq!(data_pages(&fs, f), vec![0, PAGE_SIZE_U64]);
        fs.truncate(f, 2 * PAGE_SIZE_U64).expect("grow");
        let mut buf = [0xFF_u8; 4];
        fs.read(f, PAGE_SIZE_U64, &mut buf).expect("read");
        assert_eq!(buf, [5, 0, 0, 0]);
        assert!(matches!(
            fs.truncate(fs.root_ino(), 0),
            Err(PfsError::IsDirectory)
        ));
    }

    #[test]
    fn seek_data_and_hole() {
        let fs = fs(16);
        let f = file(&fs);
        fs.write(f, 2 * PAGE_SIZE_U64, &[1_u8; 10]).expect("write");
        fs.truncate(f, 5 * PAGE_SIZE_U64).expect("grow");

        assert_eq!(fs.seek(f, 0, Whence::Data).expect("data"), 2 * PAGE_SIZE_U64);
        assert_eq!(fs.seek(f, 2 * PAGE_SIZE_U64 + 7, Whence::Data).expect("data"), 2 * PAGE_SIZE_U64 + 7);
        assert_eq!(fs.seek(f, 10, Whence::Hole).expect("hole"), 10);
        assert_eq!(fs.seek(f, 2 * PAGE_SIZE_U64 + 7, Whence::Hole).expect("hole"), 3 * PAGE_SIZE_U64);
        assert!(matches!(
            fs.seek(f, 3 * PAGE_SIZE_U64, Whence::Data),
            Err(PfsError::OutOfRange)
        ));
        assert!(matches!(
            fs.seek(f, 5 * PAGE_SIZE_U64, Whence::Hole),
            Err(PfsError::OutOfRange)
        ));
        assert!(matches!(Whence::from_raw(0), Err(PfsError::NotSupported(_))));
    }

    #[test]
    fn seek_hole_in_dense_file_is_size() {
        let fs = fs(16);
        let f = file(&fs);
        fs.write(f, 0, &[1_u8; 100]).expect("write");
        assert_eq!(fs.seek(f, 0, Whence::Hole).expect("hole"), 100);
    }

    #[test]
    fn ranged_clone_shares_and_zeroes() {
        let fs = fs(32);
        let src = file(&fs);
        let dst = file(&fs);
        fs.write(src, 0, &vec![3_u8; PAGE_SIZE]).expect("src");
        fs.write(dst, 0, &vec![4_u8; 2 * PAGE_SIZE]).expect("dst");

        fs.clone_range(src, dst, 0, PAGE_SIZE_U64, 2 * PAGE_SIZE_U64)
            .expect("clone");
        assert_eq!(
            fs.get_block(src, 0).expect("src"),
            fs.get_block(dst, 1).expect("dst")
        );
        assert_eq!(fs.get_block(dst, 2).expect("hole"), PageNumber(0));
        assert_eq!(size(&fs, dst), 3 * PAGE_SIZE_U64);

        let mut buf = vec![0_u8; 3 * PAGE_SIZE];
        fs.read(dst, 0, &mut buf).expect("read");
        assert!(buf[..PAGE_SIZE].iter().all(|b| *b == 4));
        assert!(buf[PAGE_SIZE..2 * PAGE_SIZE].iter().all(|b| *b == 3));
        assert!(buf[2 * PAGE_SIZE..].iter().all(|b| *b == 0));
    }

    #[test]
    fn clone_rules() {
        let fs = fs(16);
        let a = file(&fs);
        let b = file(&fs);
        fs.write(a, 0, b"x").expect("write");
        assert!(matches!(
            fs.clone_range(a, b, 1, 0, PAGE_SIZE_U64),
            Err(PfsError::NotSupported(_))
        ));
        assert!(matches!(
            fs.clone_range(a, fs.root_ino(), 0, 0, 0),
            Err(PfsError::NotSupported(_))
        ));
        let before = fs.statfs();
        fs.clone_range(a, a, 0, PAGE_SIZE_U64, PAGE_SIZE_U64).expect("self");
        assert_eq!(fs.statfs(), before);
        assert_eq!(data_pages(&fs, a), vec![0]);
    }

    #[test]
    fn get_block_and_sync() {
        let fs = fs(16);
        let f = file(&fs);
        fs.write(f, 0, b"x").expect("write");
        assert_ne!(fs.get_block(f, 0).expect("mapped"), PageNumber(0));
        assert!(matches!(
            fs.get_block(fs.root_ino(), 0),
            Err(PfsError::NotSupported(_))
        ));
        fs.sync(f, 0, 1).expect("sync");
        assert!(fs.sync(InodeNumber(999), 0, 1).expect_err("missing").is_not_found());
    }
}
