//! Directory engine: add, remove, lookup, readdir, rename.

use crate::inode::record_kind;
use crate::{PageFs, lock_pair, now};
use pfs_alloc::RecordKind;
use pfs_dir::{DirChildren, ReaddirEntry, ReaddirOutcome, validate_name};
use pfs_error::{PfsError, Result};
use pfs_extent::BlockSpace;
use pfs_inode::{InodeMeta, InodePayload, InodeRecord};
use pfs_types::{FileType, InodeNumber, PAGE_SIZE_U64};
use std::time::SystemTime;
use tracing::debug;

// ── Link hooks ──────────────────────────────────────────────────────────────

/// Link-count and timestamp side effects of naming and unnaming an inode.
pub trait LinkHooks: Send + Sync {
    /// `child` gained a name in `dir`.
    fn link(&self, dir: &mut InodeMeta, child: &mut InodeMeta, now: SystemTime);

    /// `child` lost a name in `dir`.
    fn unlink(&self, dir: &mut InodeMeta, child: &mut InodeMeta, now: SystemTime);
}

/// POSIX link counting: a subdirectory's `..` counts as a link to its parent.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdLinkHooks;

impl LinkHooks for StdLinkHooks {
    fn link(&self, dir: &mut InodeMeta, child: &mut InodeMeta, now: SystemTime) {
        child.nlink = child.nlink.saturating_add(1);
        if child.kind() == Some(FileType::Directory) {
            dir.nlink = dir.nlink.saturating_add(1);
        }
        child.ctime = now;
        dir.touch_modified(now);
    }

    fn unlink(&self, dir: &mut InodeMeta, child: &mut InodeMeta, now: SystemTime) {
        child.nlink = child.nlink.saturating_sub(1);
        if child.kind() == Some(FileType::Directory) {
            dir.nlink = dir.nlink.saturating_sub(1);
        }
        child.ctime = now;
        dir.touch_modified(now);
    }
}

/// Rename request.
///
/// When `target` is `None` the new name is added for `ino`; when
/// `old_name` is non-empty it is then removed from `old_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub old_dir: InodeNumber,
    pub new_dir: InodeNumber,
    pub ino: InodeNumber,
    /// Inode already named `new_name`, if any.
    pub target: Option<InodeNumber>,
    pub old_name: Vec<u8>,
    pub new_name: Vec<u8>,
}

fn children(rec: &InodeRecord) -> Result<&DirChildren> {
    rec.dir().ok_or(PfsError::NotDirectory)
}

fn not_found(name: &[u8]) -> PfsError {
    PfsError::NotFound(String::from_utf8_lossy(name).into_owned())
}

impl PageFs {
    /// Name `child` as `name` inside `dir`; returns the entry's offset.
    pub fn add_dentry(&self, dir: InodeNumber, child: InodeNumber, name: &[u8]) -> Result<u64> {
        validate_name(name)?;
        if dir == child {
            return Err(PfsError::InvalidArgument(
                "directory cannot contain itself".to_owned(),
            ));
        }
        let dir_h = self.handle(dir)?;
        let child_h = self.handle(child)?;
        let (mut dir_g, mut child_g) = lock_pair(&dir_h, &child_h);
        let (d, c) = (&mut *dir_g, &mut *child_g);
        let kind = record_kind(c);
        let InodePayload::Directory(list) = &mut d.payload else {
            return Err(PfsError::NotDirectory);
        };
        let slot = self.space.alloc_record(RecordKind::Dirent)?;
        let offset = list.insert(name, child, kind, slot);
        d.meta.size = offset + PAGE_SIZE_U64 + 2;
        if kind == FileType::Directory {
            c.parent = dir;
        }
        self.hooks.link(&mut d.meta, &mut c.meta, now());
        debug!(
            dir = dir.0,
            ino = child.0,
            offset,
            name = %String::from_utf8_lossy(name),
            "add_dentry"
        );
        Ok(offset)
    }

    /// Remove the entry called `name` from `dir`.
    pub fn remove_dentry(&self, dir: InodeNumber, name: &[u8]) -> Result<()> {
        self.unlink_dentry(dir, name, false)
    }

    /// With `undo` set, takes back a name added moments ago: the child may be
    /// a non-empty directory and its link count is only decremented.
    fn unlink_dentry(&self, dir: InodeNumber, name: &[u8], undo: bool) -> Result<()> {
        let dir_h = self.handle(dir)?;
        let target = {
            let rec = dir_h.lock();
            children(&rec)?.lookup(name).map(|e| e.ino)
        };
        let target = target.ok_or_else(|| not_found(name))?;
        let child_h = self.index.find(target).ok_or_else(|| not_found(name))?;
        if target == dir {
            return Err(PfsError::InvalidArgument(
                "directory entry names its own directory".to_owned(),
            ));
        }

        let (mut dir_g, mut child_g) = lock_pair(&dir_h, &child_h);
        let (d, c) = (&mut *dir_g, &mut *child_g);
        if !undo && c.dir().is_some_and(|list| !list.is_empty()) {
            return Err(PfsError::NotEmpty);
        }
        let InodePayload::Directory(list) = &mut d.payload else {
            return Err(PfsError::NotDirectory);
        };
        // The name may have moved while no lock was held.
        if list.lookup(name).is_none_or(|e| e.ino != target) {
            return Err(not_found(name));
        }
        let Some(entry) = list.remove(name) else {
            return Err(not_found(name));
        };
        self.space.free_record(RecordKind::Dirent, entry.slot);
        self.hooks.unlink(&mut d.meta, &mut c.meta, now());
        if !undo && c.dir().is_some_and(DirChildren::is_empty) && c.meta.nlink == 1 {
            c.meta.nlink = 0;
        }
        debug!(
            dir = dir.0,
            ino = target.0,
            nlink = c.meta.nlink,
            undo,
            name = %String::from_utf8_lossy(name),
            "remove_dentry"
        );
        Ok(())
    }

    /// Inode named `name` in `dir`, if any.
    pub fn lookup(&self, dir: InodeNumber, name: &[u8]) -> Result<Option<InodeNumber>> {
        let handle = self.handle(dir)?;
        let rec = handle.lock();
        Ok(children(&rec)?.lookup(name).map(|e| e.ino))
    }

    /// Feed entries of `dir` from `pos` to `emit` until it refuses one.
    pub fn readdir<F>(&self, dir: InodeNumber, pos: u64, emit: F) -> Result<ReaddirOutcome>
    where
        F: FnMut(&ReaddirEntry<'_>) -> bool,
    {
        let handle = self.handle(dir)?;
        let rec = handle.lock();
        let outcome = children(&rec)?.readdir(pos, rec.ino, rec.parent, emit);
        debug!(dir = dir.0, pos, next = outcome.pos, more = outcome.more, "readdir");
        Ok(outcome)
    }

    /// Move `ino` to its new name. When the old name cannot be removed the
    /// new one is taken back, so the inode stays named exactly once.
    pub fn rename(&self, req: &Rename) -> Result<()> {
        let added = req.target.is_none();
        if added {
            self.add_dentry(req.new_dir, req.ino, &req.new_name)?;
            self.touch_ctime(req.new_dir)?;
        }
        if !req.old_name.is_empty() {
            if let Err(err) = self.remove_dentry(req.old_dir, &req.old_name) {
                if added {
                    self.unlink_dentry(req.new_dir, &req.new_name, true)?;
                    let handle = self.handle(req.ino)?;
                    let mut rec = handle.lock();
                    if rec.dir().is_some() {
                        rec.parent = req.old_dir;
                    }
                }
                return Err(err);
            }
            self.touch_ctime(req.old_dir)?;
        }
        debug!(
            old_dir = req.old_dir.0,
            new_dir = req.new_dir.0,
            ino = req.ino.0,
            "rename"
        );
        Ok(())
    }

    fn touch_ctime(&self, ino: InodeNumber) -> Result<()> {
        self.handle(ino)?.lock().meta.ctime = now();
        Ok(())
    }
}
