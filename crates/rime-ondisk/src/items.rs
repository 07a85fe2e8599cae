//! Leaf item payload parsers: chunk, device, root, and file extent items.

use rime_types::{
    CHUNK_ITEM_FIXED_SIZE, DISK_KEY_SIZE, FILE_EXTENT_INLINE, FILE_EXTENT_PREALLOC,
    FILE_EXTENT_REG, Key, ParseError, STRIPE_SIZE, read_fixed, read_le_u16, read_le_u32,
    read_le_u64,
};
use serde::{Deserialize, Serialize};

/// One stripe of a chunk: which device, and where on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// A chunk item: one contiguous logical range and its physical stripes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkItem {
    pub length: u64,
    pub owner: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<Stripe>,
}

impl ChunkItem {
    /// Parse a chunk item at `offset`, returning it and the bytes consumed.
    pub fn parse(data: &[u8], offset: usize) -> Result<(Self, usize), ParseError> {
        if offset
            .checked_add(CHUNK_ITEM_FIXED_SIZE)
            .map_or(true, |end| end > data.len())
        {
            return Err(ParseError::InsufficientData {
                needed: CHUNK_ITEM_FIXED_SIZE,
                offset,
                actual: data.len().saturating_sub(offset),
            });
        }

        let length = read_le_u64(data, offset)?;
        let owner = read_le_u64(data, offset + 8)?;
        let stripe_len = read_le_u64(data, offset + 16)?;
        let chunk_type = read_le_u64(data, offset + 24)?;
        let io_align = read_le_u32(data, offset + 32)?;
        let io_width = read_le_u32(data, offset + 36)?;
        let sector_size = read_le_u32(data, offset + 40)?;
        let num_stripes = read_le_u16(data, offset + 44)?;
        let sub_stripes = read_le_u16(data, offset + 46)?;

        if num_stripes == 0 {
            return Err(ParseError::InvalidField {
                field: "num_stripes",
                reason: "chunk must have at least one stripe",
            });
        }

        let stripes_count = usize::from(num_stripes);
        let stripes_bytes =
            stripes_count
                .checked_mul(STRIPE_SIZE)
                .ok_or(ParseError::InvalidField {
                    field: "num_stripes",
                    reason: "stripe count overflow",
                })?;
        let mut cur = offset + CHUNK_ITEM_FIXED_SIZE;
        if cur
            .checked_add(stripes_bytes)
            .map_or(true, |end| end > data.len())
        {
            return Err(ParseError::InsufficientData {
                needed: stripes_bytes,
                offset: cur,
                actual: data.len().saturating_sub(cur),
            });
        }

        let mut stripes = Vec::with_capacity(stripes_count);
        for _ in 0..stripes_count {
            stripes.push(Stripe {
                devid: read_le_u64(data, cur)?,
                offset: read_le_u64(data, cur + 8)?,
                dev_uuid: read_fixed::<16>(data, cur + 16)?,
            });
            cur += STRIPE_SIZE;
        }

        Ok((
            Self {
                length,
                owner,
                stripe_len,
                chunk_type,
                io_align,
                io_width,
                sector_size,
                num_stripes,
                sub_stripes,
                stripes,
            },
            CHUNK_ITEM_FIXED_SIZE + stripes_bytes,
        ))
    }

    /// On-disk size of a chunk item with this stripe count.
    #[must_use]
    pub fn disk_size(&self) -> usize {
        CHUNK_ITEM_FIXED_SIZE + usize::from(self.num_stripes) * STRIPE_SIZE
    }
}

/// Parse the superblock's embedded bootstrap chunk array.
///
/// The array is a packed sequence of (disk key, chunk item) pairs. The
/// keys' `offset` fields carry each chunk's logical start address.
pub fn parse_sys_chunk_array(data: &[u8]) -> Result<Vec<(Key, ChunkItem)>, ParseError> {
    let mut entries = Vec::new();
    let mut cur = 0_usize;

    while cur < data.len() {
        let key = Key::parse(data, cur)?;
        cur += DISK_KEY_SIZE;
        let (chunk, consumed) = ChunkItem::parse(data, cur)?;
        cur += consumed;
        entries.push((key, chunk));
    }

    Ok(entries)
}

/// A device item: per-device metadata stored in the chunk tree and
/// embedded in the superblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevItem {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub dev_type: u64,
    pub generation: u64,
    pub start_offset: u64,
    pub dev_group: u32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: [u8; 16],
    pub fsid: [u8; 16],
}

/// On-disk size of a device item.
pub const DEV_ITEM_SIZE: usize = 98;

impl DevItem {
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        if offset
            .checked_add(DEV_ITEM_SIZE)
            .map_or(true, |end| end > data.len())
        {
            return Err(ParseError::InsufficientData {
                needed: DEV_ITEM_SIZE,
                offset,
                actual: data.len().saturating_sub(offset),
            });
        }

        Ok(Self {
            devid: read_le_u64(data, offset)?,
            total_bytes: read_le_u64(data, offset + 8)?,
            bytes_used: read_le_u64(data, offset + 16)?,
            io_align: read_le_u32(data, offset + 24)?,
            io_width: read_le_u32(data, offset + 28)?,
            sector_size: read_le_u32(data, offset + 32)?,
            dev_type: read_le_u64(data, offset + 36)?,
            generation: read_le_u64(data, offset + 44)?,
            start_offset: read_le_u64(data, offset + 52)?,
            dev_group: read_le_u32(data, offset + 60)?,
            seek_speed: data[offset + 64],
            bandwidth: data[offset + 65],
            uuid: read_fixed::<16>(data, offset + 66)?,
            fsid: read_fixed::<16>(data, offset + 82)?,
        })
    }
}

/// A root item: the location of a tree's root block.
///
/// Only the fields this engine navigates by are decoded; the embedded
/// inode item is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootItem {
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
    pub bytes_used: u64,
    pub last_snapshot: u64,
    pub flags: u64,
    pub refs: u32,
    pub level: u8,
}

/// Minimum on-disk size of a root item (v0 layout; later versions append).
pub const ROOT_ITEM_MIN_SIZE: usize = 239;

const ROOT_ITEM_INODE_SIZE: usize = 160;

impl RootItem {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < ROOT_ITEM_MIN_SIZE {
            return Err(ParseError::InsufficientData {
                needed: ROOT_ITEM_MIN_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        let base = ROOT_ITEM_INODE_SIZE;
        Ok(Self {
            generation: read_le_u64(data, base)?,
            root_dirid: read_le_u64(data, base + 8)?,
            bytenr: read_le_u64(data, base + 16)?,
            bytes_used: read_le_u64(data, base + 32)?,
            last_snapshot: read_le_u64(data, base + 40)?,
            flags: read_le_u64(data, base + 48)?,
            refs: read_le_u32(data, base + 56)?,
            level: data[base + 78],
        })
    }
}

/// Decoded payload of an `EXTENT_DATA` item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileExtentPayload {
    /// File bytes stored directly in the leaf, possibly compressed.
    Inline { data: Vec<u8> },
    /// A pointer into the data address space.
    ///
    /// `disk_bytenr == 0` denotes a hole. `offset`/`num_bytes` select the
    /// sub-range of the (decompressed) extent that belongs to the file.
    Regular {
        disk_bytenr: u64,
        disk_num_bytes: u64,
        offset: u64,
        num_bytes: u64,
        prealloc: bool,
    },
}

/// A file extent item: one contiguous run of file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtentItem {
    pub generation: u64,
    /// Decompressed size of the whole extent.
    pub ram_bytes: u64,
    pub compression: u8,
    pub payload: FileExtentPayload,
}

const FILE_EXTENT_INLINE_HEADER: usize = 21;
const FILE_EXTENT_REG_SIZE: usize = 53;

impl FileExtentItem {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < FILE_EXTENT_INLINE_HEADER {
            return Err(ParseError::InsufficientData {
                needed: FILE_EXTENT_INLINE_HEADER,
                offset: 0,
                actual: data.len(),
            });
        }

        let generation = read_le_u64(data, 0)?;
        let ram_bytes = read_le_u64(data, 8)?;
        let compression = data[16];
        if data[17] != 0 {
            return Err(ParseError::InvalidField {
                field: "encryption",
                reason: "encrypted extents are not defined by the format",
            });
        }
        if read_le_u16(data, 18)? != 0 {
            return Err(ParseError::InvalidField {
                field: "other_encoding",
                reason: "unknown extra encoding",
            });
        }
        let extent_type = data[20];

        let payload = match extent_type {
            FILE_EXTENT_INLINE => FileExtentPayload::Inline {
                data: data[FILE_EXTENT_INLINE_HEADER..].to_vec(),
            },
            FILE_EXTENT_REG | FILE_EXTENT_PREALLOC => {
                if data.len() < FILE_EXTENT_REG_SIZE {
                    return Err(ParseError::InsufficientData {
                        needed: FILE_EXTENT_REG_SIZE,
                        offset: FILE_EXTENT_INLINE_HEADER,
                        actual: data.len(),
                    });
                }
                FileExtentPayload::Regular {
                    disk_bytenr: read_le_u64(data, 21)?,
                    disk_num_bytes: read_le_u64(data, 29)?,
                    offset: read_le_u64(data, 37)?,
                    num_bytes: read_le_u64(data, 45)?,
                    prealloc: extent_type == FILE_EXTENT_PREALLOC,
                }
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "extent_type",
                    reason: "unknown file extent kind",
                });
            }
        };

        Ok(Self {
            generation,
            ram_bytes,
            compression,
            payload,
        })
    }
}
