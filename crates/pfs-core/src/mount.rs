//! Mount, unmount and persistent-region preparation.

use crate::dir::{LinkHooks, StdLinkHooks};
use crate::ops::OpMetrics;
use crate::space::Space;
use crate::{PageFs, now};
use pfs_alloc::{Pool, RecordKind};
use pfs_block::{ByteDevice, DurableCopy, Region, RegionKind, WriteThrough};
use pfs_dir::{DirChildren, FIRST_CURSOR};
use pfs_error::{PfsError, Result};
use pfs_extent::BlockSpace;
use pfs_inode::{InodeHandle, InodeIndex, InodeMeta, InodePayload, InodeRecord};
use pfs_ondisk::{
    HEADER_PAGES, ROOT_INODE_OFFSET, ROOT_INODE_SIZE, RootInodeRecord, check_mirrored_magic,
    parse_header_page,
};
use pfs_types::{InodeNumber, PAGE_SIZE, PAGE_SIZE_U64, ParseError, S_IFDIR};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tracing::{debug, info};

/// Size of the anonymous region used when no persistent region is offered.
pub const DEFAULT_VOLATILE_SIZE: u64 = 1 << 30;

/// Chunk size for the first-use read and write passes.
const PREPARE_CHUNK: usize = 1 << 20;

/// Mount configuration.
#[derive(Clone)]
pub struct MountOptions {
    /// Persistent region to mount; page 0 must hold a superblock.
    pub region: Option<Arc<dyn ByteDevice>>,
    /// Durable-copy primitive for the persistent region.
    ///
    /// `None` selects [`WriteThrough`].
    pub durable: Option<Arc<dyn DurableCopy>>,
    /// Bytes of anonymous memory for a volatile mount.
    pub volatile_size: u64,
    /// Parse the whole superblock (version, checksum, geometry), not just
    /// the mirrored magic numbers.
    pub validate_superblock: bool,
    /// Link-count side effects of dentry changes; `None` selects
    /// [`StdLinkHooks`].
    pub hooks: Option<Arc<dyn LinkHooks>>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            region: None,
            durable: None,
            volatile_size: DEFAULT_VOLATILE_SIZE,
            validate_superblock: true,
            hooks: None,
        }
    }
}

impl fmt::Debug for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOptions")
            .field("region_bytes", &self.region.as_ref().map(|r| r.len_bytes()))
            .field("durable", &self.durable.is_some())
            .field("volatile_size", &self.volatile_size)
            .field("validate_superblock", &self.validate_superblock)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

impl MountOptions {
    /// Mount the given persistent region.
    #[must_use]
    pub fn persistent(region: Arc<dyn ByteDevice>) -> Self {
        Self {
            region: Some(region),
            ..Self::default()
        }
    }

    /// Anonymous mount of `size` bytes.
    #[must_use]
    pub fn volatile(size: u64) -> Self {
        Self {
            volatile_size: size,
            ..Self::default()
        }
    }

    /// Persistent only when a region is offered that holds more than the
    /// two header pages.
    #[must_use]
    pub fn resolved_region_kind(&self) -> RegionKind {
        match &self.region {
            Some(dev) if dev.len_bytes() / PAGE_SIZE_U64 > HEADER_PAGES => RegionKind::Persistent,
            _ => RegionKind::Volatile,
        }
    }
}

fn parse_error_to_pfs(e: &ParseError) -> PfsError {
    PfsError::InvalidSuperblock(e.to_string())
}

fn read_header(dev: &dyn ByteDevice) -> Result<Vec<u8>> {
    let mut page = vec![0_u8; PAGE_SIZE];
    dev.read_exact_at(0, &mut page)?;
    Ok(page)
}

fn check_magic(dev: &dyn ByteDevice) -> Result<()> {
    let page = read_header(dev)?;
    check_mirrored_magic(&page).map_err(|e| parse_error_to_pfs(&e))
}

/// Chunked `[start, end)` byte spans of at most [`PREPARE_CHUNK`].
fn chunks(start: u64, end: u64) -> impl Iterator<Item = (u64, usize)> {
    let step = PREPARE_CHUNK as u64;
    (start..end).step_by(PREPARE_CHUNK).map(move |off| {
        let len = usize::try_from(step.min(end - off)).unwrap_or(PREPARE_CHUNK);
        (off, len)
    })
}

/// First-use preparation of a persistent region: validate the superblock,
/// touch every byte once for reading, then write the arena through the
/// durable-copy primitive. The magic numbers are re-checked after each pass.
fn prepare_persistent(
    dev: &Arc<dyn ByteDevice>,
    durable: &dyn DurableCopy,
    validate: bool,
) -> Result<()> {
    let header = read_header(dev.as_ref())?;
    check_mirrored_magic(&header).map_err(|e| parse_error_to_pfs(&e))?;
    let pages = dev.len_bytes() / PAGE_SIZE_U64;
    if validate {
        let sb = parse_header_page(&header).map_err(|e| parse_error_to_pfs(&e))?;
        if sb.blocks > pages {
            return Err(PfsError::InvalidSuperblock(format!(
                "superblock claims {} blocks, region holds {pages}",
                sb.blocks
            )));
        }
        debug!(
            major = sb.major,
            minor = sb.minor,
            blocks = sb.blocks,
            devices = sb.devices.len(),
            "superblock_valid"
        );
    }

    let end = pages * PAGE_SIZE_U64;
    let mut buf = vec![0_u8; PREPARE_CHUNK];
    for (off, len) in chunks(0, end) {
        dev.read_exact_at(off, &mut buf[..len])?;
    }
    check_magic(dev.as_ref())?;

    buf.fill(0);
    for (off, len) in chunks(HEADER_PAGES * PAGE_SIZE_U64, end) {
        durable.persist(dev.as_ref(), off, &buf[..len])?;
    }
    check_magic(dev.as_ref())?;
    Ok(())
}

impl PageFs {
    /// Mount a filesystem.
    pub fn mount(options: MountOptions) -> Result<Self> {
        let kind = options.resolved_region_kind();
        let region = match (kind, &options.region) {
            (RegionKind::Persistent, Some(dev)) => {
                let durable = options
                    .durable
                    .clone()
                    .unwrap_or_else(|| Arc::new(WriteThrough));
                prepare_persistent(dev, durable.as_ref(), options.validate_superblock)?;
                Region::persistent(Arc::clone(dev), durable, HEADER_PAGES)?
            }
            _ => Region::volatile(options.volatile_size, HEADER_PAGES)?,
        };
        let space = Space::new(Pool::new(Arc::new(region)));
        let index = InodeIndex::new();
        let root = create_root(&space)?;
        index.insert(Arc::clone(&root));

        let fs = Self {
            space,
            index,
            next_ino: AtomicU64::new(InodeNumber::ROOT.0 + 1),
            root,
            kind,
            hooks: options.hooks.unwrap_or_else(|| Arc::new(StdLinkHooks)),
            metrics: OpMetrics::new(),
        };
        if kind == RegionKind::Persistent {
            fs.persist_root_record()?;
        }
        let st = fs.space.statfs();
        info!(
            kind = %kind,
            blocks = st.blocks,
            bfree = st.bfree,
            files = st.files,
            "mount"
        );
        Ok(fs)
    }

    /// Tear the mount down. A persistent region gets its root record
    /// rewritten and is synced; a volatile region is dropped.
    pub fn unmount(self) -> Result<()> {
        if self.kind == RegionKind::Persistent {
            self.persist_root_record()?;
            self.space.pool().region().sync()?;
        }
        let drained = self.index.drain().len();
        info!(kind = %self.kind, inodes = drained, "unmount");
        Ok(())
    }

    /// Write the root inode record to page 1.
    fn persist_root_record(&self) -> Result<()> {
        let rec = self.root.lock();
        let record = RootInodeRecord {
            ino: rec.ino,
            parent: rec.parent,
            mode: rec.meta.mode,
            nlink: rec.meta.nlink,
            size: rec.meta.size,
            dir_cursor: rec.dir().map_or(FIRST_CURSOR, DirChildren::cursor),
        };
        drop(rec);
        let mut raw = vec![0_u8; ROOT_INODE_SIZE];
        record
            .encode_into(&mut raw)
            .map_err(|e| parse_error_to_pfs(&e))?;
        let offset = PAGE_SIZE_U64 + ROOT_INODE_OFFSET as u64;
        self.space.pool().region().persist_at(offset, &raw)
    }
}

fn create_root(space: &Space) -> Result<Arc<InodeHandle>> {
    space.charge_inode()?;
    let slot = match space.alloc_record(RecordKind::Inode) {
        Ok(slot) => slot,
        Err(err) => {
            space.credit_inode();
            return Err(err);
        }
    };
    let defaults = RootInodeRecord::default();
    let mut meta = InodeMeta::new(S_IFDIR | 0o755, 0, 0, now());
    meta.nlink = defaults.nlink;
    meta.size = defaults.size;
    Ok(InodeHandle::new(InodeRecord {
        ino: InodeNumber::ROOT,
        parent: InodeNumber::ROOT,
        meta,
        payload: InodePayload::Directory(DirChildren::with_cursor(defaults.dir_cursor)),
        slot,
    }))
}
