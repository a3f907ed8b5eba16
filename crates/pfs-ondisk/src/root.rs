//! Root inode record stored on page 1.
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00 | 8 | ino |
//! | 0x08 | 8 | parent ino |
//! | 0x10 | 4 | mode |
//! | 0x14 | 4 | nlink |
//! | 0x18 | 8 | size |
//! | 0x20 | 8 | directory offset cursor |

use pfs_types::{
    InodeNumber, ParseError, S_IFDIR, ensure_slice, read_le_u32, read_le_u64, write_le_u32,
    write_le_u64,
};
use serde::{Deserialize, Serialize};

/// Byte offset of the record within page 1.
pub const ROOT_INODE_OFFSET: usize = 0;
pub const ROOT_INODE_SIZE: usize = 0x28;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootInodeRecord {
    pub ino: InodeNumber,
    pub parent: InodeNumber,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub dir_cursor: u64,
}

impl Default for RootInodeRecord {
    fn default() -> Self {
        Self {
            ino: InodeNumber::ROOT,
            parent: InodeNumber::ROOT,
            mode: S_IFDIR | 0o755,
            nlink: 2,
            size: 0,
            dir_cursor: 2,
        }
    }
}

impl RootInodeRecord {
    pub fn parse(page: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(page, ROOT_INODE_OFFSET, ROOT_INODE_SIZE)?;
        let rec = Self {
            ino: InodeNumber(read_le_u64(raw, 0x00)?),
            parent: InodeNumber(read_le_u64(raw, 0x08)?),
            mode: read_le_u32(raw, 0x10)?,
            nlink: read_le_u32(raw, 0x14)?,
            size: read_le_u64(raw, 0x18)?,
            dir_cursor: read_le_u64(raw, 0x20)?,
        };
        if rec.ino != InodeNumber::ROOT {
            return Err(ParseError::InvalidField {
                field: "ino",
                reason: "root record must carry ino 1",
            });
        }
        Ok(rec)
    }

    /// Write the record into `page` at [`ROOT_INODE_OFFSET`].
    pub fn encode_into(&self, page: &mut [u8]) -> Result<(), ParseError> {
        let base = ROOT_INODE_OFFSET;
        write_le_u64(page, base, self.ino.0)?;
        write_le_u64(page, base + 0x08, self.parent.0)?;
        write_le_u32(page, base + 0x10, self.mode)?;
        write_le_u32(page, base + 0x14, self.nlink)?;
        write_le_u64(page, base + 0x18, self.size)?;
        write_le_u64(page, base + 0x20, self.dir_cursor)
    }
}
