//! Mirrored superblock (device table) records.
//!
//! Page 0 holds two identical [`PART_SIZE`]-byte parts. Each part is laid
//! out little-endian:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00 | 4 | crc32c of bytes `0x04..0x1B8` |
//! | 0x04 | 2 | major version |
//! | 0x06 | 2 | minor version |
//! | 0x08 | 4 | magic (`0x5346_314D`) |
//! | 0x0C | 4 | flags |
//! | 0x10 | 16 | filesystem UUID |
//! | 0x20 | 8 | total blocks (pages) |
//! | 0x28 | 8 | last write time, ns since the epoch |
//! | 0x30 | 2 | index of this device in the list |
//! | 0x32 | 2 | device count |
//! | 0x34 | 4 | reserved |
//! | 0x38 | 16 × 24 | device list: `{uuid[16], blocks u64}` |

use pfs_types::{
    PAGE_SIZE, ParseError, ensure_slice, read_fixed, read_le_u16, read_le_u32, read_le_u64,
    write_bytes, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const SUPER_MAGIC: u32 = 0x5346_314D;
pub const VERSION_MAJOR: u16 = 14;
pub const VERSION_MINOR: u16 = 1;

/// Size of one mirrored part; two parts fill page 0.
pub const PART_SIZE: usize = PAGE_SIZE / 2;

/// Pages reserved at the head of a persistent region (superblock + root inode).
pub const HEADER_PAGES: u64 = 2;

pub const MAX_DEVICES: usize = 16;

const CSUM_OFFSET: usize = 0x00;
const MAJOR_OFFSET: usize = 0x04;
const MINOR_OFFSET: usize = 0x06;
const MAGIC_OFFSET: usize = 0x08;
const FLAGS_OFFSET: usize = 0x0C;
const UUID_OFFSET: usize = 0x10;
const BLOCKS_OFFSET: usize = 0x20;
const WTIME_OFFSET: usize = 0x28;
const ID_INDEX_OFFSET: usize = 0x30;
const DEV_COUNT_OFFSET: usize = 0x32;
const DEV_LIST_OFFSET: usize = 0x38;
const DEV_ID_SIZE: usize = 24;
const STATIC_SIZE: usize = DEV_LIST_OFFSET + MAX_DEVICES * DEV_ID_SIZE;

/// One entry of the device list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevId {
    pub uuid: [u8; 16],
    pub blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub major: u16,
    pub minor: u16,
    pub magic: u32,
    pub flags: u32,
    pub uuid: [u8; 16],
    pub blocks: u64,
    pub wtime_ns: u64,
    pub id_index: u16,
    pub devices: Vec<DevId>,
    /// Stored crc32c; recomputed by [`Superblock::encode_part`].
    pub checksum: u32,
}

impl Superblock {
    /// Single-device superblock covering `blocks` pages.
    #[must_use]
    pub fn new(uuid: [u8; 16], device_uuid: [u8; 16], blocks: u64, wtime_ns: u64) -> Self {
        Self {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
            magic: SUPER_MAGIC,
            flags: 0,
            uuid,
            blocks,
            wtime_ns,
            id_index: 0,
            devices: vec![DevId {
                uuid: device_uuid,
                blocks,
            }],
            checksum: 0,
        }
    }

    /// Parse one part, verifying magic, checksum, version and device list.
    pub fn parse_part(part: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(part, 0, STATIC_SIZE)?;

        let magic = read_le_u32(raw, MAGIC_OFFSET)?;
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let stored = read_le_u32(raw, CSUM_OFFSET)?;
        let computed = checksum(raw);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch { stored, computed });
        }

        let major = read_le_u16(raw, MAJOR_OFFSET)?;
        if major != VERSION_MAJOR {
            return Err(ParseError::InvalidField {
                field: "major",
                reason: "unsupported major version",
            });
        }

        let id_index = read_le_u16(raw, ID_INDEX_OFFSET)?;
        let count = usize::from(read_le_u16(raw, DEV_COUNT_OFFSET)?);
        if count == 0 || count > MAX_DEVICES {
            return Err(ParseError::InvalidField {
                field: "dev_count",
                reason: "must be between 1 and 16",
            });
        }
        if usize::from(id_index) >= count {
            return Err(ParseError::InvalidField {
                field: "id_index",
                reason: "beyond device count",
            });
        }

        let mut devices = Vec::with_capacity(count);
        for i in 0..count {
            let base = DEV_LIST_OFFSET + i * DEV_ID_SIZE;
            devices.push(DevId {
                uuid: read_fixed(raw, base)?,
                blocks: read_le_u64(raw, base + 16)?,
            });
        }

        let sb = Self {
            major,
            minor: read_le_u16(raw, MINOR_OFFSET)?,
            magic,
            flags: read_le_u32(raw, FLAGS_OFFSET)?,
            uuid: read_fixed(raw, UUID_OFFSET)?,
            blocks: read_le_u64(raw, BLOCKS_OFFSET)?,
            wtime_ns: read_le_u64(raw, WTIME_OFFSET)?,
            id_index,
            devices,
            checksum: stored,
        };
        sb.validate_geometry()?;
        Ok(sb)
    }

    /// The device list must account for every block and leave room for an
    /// arena past the header pages.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.blocks <= HEADER_PAGES {
            return Err(ParseError::InvalidField {
                field: "blocks",
                reason: "no room past header pages",
            });
        }
        let listed = self
            .devices
            .iter()
            .try_fold(0_u64, |acc, dev| acc.checked_add(dev.blocks));
        if listed != Some(self.blocks) {
            return Err(ParseError::InvalidField {
                field: "dev_list",
                reason: "device blocks do not sum to total",
            });
        }
        Ok(())
    }

    /// Encode as one [`PART_SIZE`] part with a fresh checksum.
    pub fn encode_part(&self) -> Result<Vec<u8>, ParseError> {
        if self.devices.is_empty() || self.devices.len() > MAX_DEVICES {
            return Err(ParseError::InvalidField {
                field: "dev_count",
                reason: "must be between 1 and 16",
            });
        }
        let mut part = vec![0_u8; PART_SIZE];
        write_le_u16(&mut part, MAJOR_OFFSET, self.major)?;
        write_le_u16(&mut part, MINOR_OFFSET, self.minor)?;
        write_le_u32(&mut part, MAGIC_OFFSET, self.magic)?;
        write_le_u32(&mut part, FLAGS_OFFSET, self.flags)?;
        write_bytes(&mut part, UUID_OFFSET, &self.uuid)?;
        write_le_u64(&mut part, BLOCKS_OFFSET, self.blocks)?;
        write_le_u64(&mut part, WTIME_OFFSET, self.wtime_ns)?;
        write_le_u16(&mut part, ID_INDEX_OFFSET, self.id_index)?;
        #[expect(clippy::cast_possible_truncation)]
        write_le_u16(&mut part, DEV_COUNT_OFFSET, self.devices.len() as u16)?;
        for (i, dev) in self.devices.iter().enumerate() {
            let base = DEV_LIST_OFFSET + i * DEV_ID_SIZE;
            write_bytes(&mut part, base, &dev.uuid)?;
            write_le_u64(&mut part, base + 16, dev.blocks)?;
        }
        let csum = checksum(&part);
        write_le_u32(&mut part, CSUM_OFFSET, csum)?;
        Ok(part)
    }
}

fn checksum(raw: &[u8]) -> u32 {
    crc32c::crc32c(&raw[MAJOR_OFFSET..STATIC_SIZE])
}

/// Encode page 0: the same part written twice.
pub fn encode_header_page(sb: &Superblock) -> Result<Vec<u8>, ParseError> {
    let part = sb.encode_part()?;
    let mut page = Vec::with_capacity(PAGE_SIZE);
    page.extend_from_slice(&part);
    page.extend_from_slice(&part);
    Ok(page)
}

/// Raw magic fields of both parts.
pub fn part_magics(page: &[u8]) -> Result<(u32, u32), ParseError> {
    Ok((
        read_le_u32(page, MAGIC_OFFSET)?,
        read_le_u32(page, PART_SIZE + MAGIC_OFFSET)?,
    ))
}

/// Both mirrored magic fields must carry [`SUPER_MAGIC`].
pub fn check_mirrored_magic(page: &[u8]) -> Result<(), ParseError> {
    let (first, second) = part_magics(page)?;
    for magic in [first, second] {
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }
    }
    Ok(())
}

/// Parse page 0, falling back to the second part when the first is damaged.
pub fn parse_header_page(page: &[u8]) -> Result<Superblock, ParseError> {
    check_mirrored_magic(page)?;
    let first = ensure_slice(page, 0, PART_SIZE)?;
    match Superblock::parse_part(first) {
        Ok(sb) => Ok(sb),
        Err(primary) => {
            let second = ensure_slice(page, PART_SIZE, PART_SIZE)?;
            Superblock::parse_part(second).map_err(|_| primary)
        }
    }
}
