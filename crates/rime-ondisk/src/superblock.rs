//! Superblock parsing and geometry validation.

use rime_types::{
    CSUM_FIELD_SIZE, ParseError, SUPERBLOCK_MAGIC, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
    SYS_CHUNK_ARRAY_MAX, csum_digest_size, read_fixed, read_le_u16, read_le_u32, read_le_u64,
    trim_nul_padded,
};
use serde::{Deserialize, Serialize};

use crate::items::DevItem;

const SUPER_LABEL_OFFSET: usize = 0x12B;
const SUPER_LABEL_LEN: usize = 256;
const SUPER_DEV_ITEM_OFFSET: usize = 0xC9;
const SYS_CHUNK_ARRAY_OFFSET: usize = 0x32B;

/// Parsed superblock.
///
/// The embedded `dev_item` describes the device the superblock was read
/// from; `sys_chunk_array` carries the bootstrap chunks needed to reach
/// the chunk tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub csum: [u8; CSUM_FIELD_SIZE],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub magic: u64,
    pub generation: u64,
    pub root: u64,
    pub chunk_root: u64,
    pub log_root: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub root_dir_objectid: u64,
    pub num_devices: u64,
    pub sectorsize: u32,
    pub nodesize: u32,
    pub stripesize: u32,
    pub chunk_root_generation: u64,
    pub compat_flags: u64,
    pub compat_ro_flags: u64,
    pub incompat_flags: u64,
    pub csum_type: u16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item: DevItem,
    pub label: String,
    pub sys_chunk_array_size: u32,
    pub sys_chunk_array: Vec<u8>,
}

impl Superblock {
    /// Parse and validate a superblock region (4096 bytes).
    #[allow(clippy::too_many_lines)]
    pub fn parse_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u64(region, 0x40)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: SUPERBLOCK_MAGIC,
                actual: magic,
            });
        }

        let sectorsize = read_le_u32(region, 0x90)?;
        let nodesize = read_le_u32(region, 0x94)?;
        let stripesize = read_le_u32(region, 0x9C)?;

        if sectorsize == 0 || !sectorsize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "must be non-zero power of two",
            });
        }
        if nodesize == 0 || !nodesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "must be non-zero power of two",
            });
        }
        if nodesize < sectorsize {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "smaller than sectorsize",
            });
        }
        if stripesize != 0 && !stripesize.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "stripesize",
                reason: "must be zero or power of two",
            });
        }
        // Sane upper bounds (256K)
        if sectorsize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "sectorsize",
                reason: "exceeds 256K upper bound",
            });
        }
        if nodesize > 256 * 1024 {
            return Err(ParseError::InvalidField {
                field: "nodesize",
                reason: "exceeds 256K upper bound",
            });
        }

        let csum_type = read_le_u16(region, 0xC4)?;
        if csum_digest_size(csum_type).is_none() {
            return Err(ParseError::InvalidField {
                field: "csum_type",
                reason: "unknown checksum algorithm tag",
            });
        }

        let sys_chunk_array_size = read_le_u32(region, 0xA0)?;
        let sys_array_len =
            usize::try_from(sys_chunk_array_size).map_err(|_| ParseError::IntegerConversion {
                field: "sys_chunk_array_size",
            })?;
        if sys_array_len > SYS_CHUNK_ARRAY_MAX {
            return Err(ParseError::InvalidField {
                field: "sys_chunk_array_size",
                reason: "exceeds 2048 byte limit",
            });
        }

        let array_end = SYS_CHUNK_ARRAY_OFFSET
            .checked_add(sys_array_len)
            .ok_or(ParseError::InvalidField {
                field: "sys_chunk_array",
                reason: "offset overflow",
            })?;
        if array_end > region.len() {
            return Err(ParseError::InsufficientData {
                needed: array_end,
                offset: SYS_CHUNK_ARRAY_OFFSET,
                actual: region.len(),
            });
        }
        let sys_chunk_array = region[SYS_CHUNK_ARRAY_OFFSET..array_end].to_vec();

        Ok(Self {
            csum: read_fixed::<CSUM_FIELD_SIZE>(region, 0x00)?,
            fsid: read_fixed::<16>(region, 0x20)?,
            bytenr: read_le_u64(region, 0x30)?,
            flags: read_le_u64(region, 0x38)?,
            magic,
            generation: read_le_u64(region, 0x48)?,
            root: read_le_u64(region, 0x50)?,
            chunk_root: read_le_u64(region, 0x58)?,
            log_root: read_le_u64(region, 0x60)?,
            total_bytes: read_le_u64(region, 0x70)?,
            bytes_used: read_le_u64(region, 0x78)?,
            root_dir_objectid: read_le_u64(region, 0x80)?,
            num_devices: read_le_u64(region, 0x88)?,
            sectorsize,
            nodesize,
            stripesize,
            chunk_root_generation: read_le_u64(region, 0xA4)?,
            compat_flags: read_le_u64(region, 0xAC)?,
            compat_ro_flags: read_le_u64(region, 0xB4)?,
            incompat_flags: read_le_u64(region, 0xBC)?,
            csum_type,
            root_level: region[0xC6],
            chunk_root_level: region[0xC7],
            log_root_level: region[0xC8],
            dev_item: DevItem::parse(region, SUPER_DEV_ITEM_OFFSET)?,
            label: trim_nul_padded(&read_fixed::<SUPER_LABEL_LEN>(region, SUPER_LABEL_OFFSET)?),
            sys_chunk_array_size,
            sys_chunk_array,
        })
    }

    /// Parse the primary superblock out of a whole-device image.
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let end = SUPERBLOCK_OFFSET
            .checked_add(SUPERBLOCK_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "superblock_offset",
                reason: "overflow",
            })?;

        if image.len() < end {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: SUPERBLOCK_OFFSET,
                actual: image.len().saturating_sub(SUPERBLOCK_OFFSET),
            });
        }

        Self::parse_region(&image[SUPERBLOCK_OFFSET..end])
    }
}
