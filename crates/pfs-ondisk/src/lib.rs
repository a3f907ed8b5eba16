#![forbid(unsafe_code)]
//! On-media format for PageFS persistent regions.
//!
//! Pure parsing crate, no I/O. Page 0 of a persistent region carries two
//! mirrored superblock parts; page 1 carries the root inode record; the
//! allocation arena begins at page 2.

pub mod root;
pub mod superblock;

pub use root::{ROOT_INODE_OFFSET, ROOT_INODE_SIZE, RootInodeRecord};
pub use superblock::{
    DevId, HEADER_PAGES, MAX_DEVICES, PART_SIZE, SUPER_MAGIC, Superblock, VERSION_MAJOR,
    VERSION_MINOR, check_mirrored_magic, encode_header_page, parse_header_page, part_magics,
};
