#![forbid(unsafe_code)]
//! Core types shared by every RimeFS crate.
//!
//! Holds the B-tree [`Key`] and its total order, unit-carrying newtypes
//! for the three address spaces the engine juggles (filesystem-logical,
//! device-physical, and tree object ids), the on-disk constants of the
//! format, little-endian field readers, and [`ParseError`] — the
//! parse-layer error type. `ParseError` deliberately lives here and not
//! in `rime-error`: parsing crates depend on `rime-types` only, and the
//! runtime taxonomy converts from it at crate boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Format constants ────────────────────────────────────────────────────────

/// Primary superblock offset on every member device (64 KiB).
pub const SUPERBLOCK_OFFSET: usize = 64 * 1024;
/// Size of the superblock region.
pub const SUPERBLOCK_SIZE: usize = 4096;
/// `_BHRfS_M` little-endian.
pub const SUPERBLOCK_MAGIC: u64 = 0x4D5F_5366_5248_425F;

/// Size of the checksum field at the head of superblocks and tree blocks.
pub const CSUM_FIELD_SIZE: usize = 32;

/// Tree-block header size: csum(32) + fsid(16) + bytenr(8) + flags(8) +
/// chunk_tree_uuid(16) + generation(8) + owner(8) + nritems(4) + level(1).
pub const HEADER_SIZE: usize = 101;
/// Leaf item descriptor size: key(17) + data offset(4) + data size(4).
pub const LEAF_ITEM_SIZE: usize = 25;
/// Internal key pointer size: key(17) + blockptr(8) + generation(8).
pub const KEY_PTR_SIZE: usize = 33;
/// On-disk key size: objectid(8) + type(1) + offset(8).
pub const DISK_KEY_SIZE: usize = 17;
/// Deepest tree the format allows (levels 0-7).
pub const MAX_LEVEL: u8 = 7;

/// Fixed chunk-item prefix before the stripe array.
pub const CHUNK_ITEM_FIXED_SIZE: usize = 48;
/// One stripe record: devid(8) + offset(8) + dev_uuid(16).
pub const STRIPE_SIZE: usize = 32;
/// The stripe length every known filesystem writes (64 KiB).
pub const STRIPE_LEN: u64 = 64 * 1024;
/// Upper bound on the superblock's embedded system chunk array.
pub const SYS_CHUNK_ARRAY_MAX: usize = 2048;

/// Checksum algorithm tags (superblock `csum_type`).
pub const CSUM_TYPE_CRC32C: u16 = 0;
pub const CSUM_TYPE_XXHASH64: u16 = 1;
pub const CSUM_TYPE_SHA256: u16 = 2;
pub const CSUM_TYPE_BLAKE2B: u16 = 3;

// ── Well-known tree object ids ──────────────────────────────────────────────

pub const ROOT_TREE_OBJECTID: u64 = 1;
pub const EXTENT_TREE_OBJECTID: u64 = 2;
pub const CHUNK_TREE_OBJECTID: u64 = 3;
pub const DEV_TREE_OBJECTID: u64 = 4;
pub const FS_TREE_OBJECTID: u64 = 5;
pub const CSUM_TREE_OBJECTID: u64 = 7;
/// Objectid under which device items live in the chunk tree.
pub const DEV_ITEMS_OBJECTID: u64 = 1;
/// First objectid available to user subvolumes and inodes.
pub const FIRST_FREE_OBJECTID: u64 = 256;

// ── Item type tags ──────────────────────────────────────────────────────────

pub const INODE_ITEM_KEY: u8 = 1;
pub const INODE_REF_KEY: u8 = 12;
pub const EXTENT_DATA_KEY: u8 = 108;
pub const ROOT_ITEM_KEY: u8 = 132;
pub const ROOT_BACKREF_KEY: u8 = 144;
pub const DEV_ITEM_KEY: u8 = 216;
pub const CHUNK_ITEM_KEY: u8 = 228;

// ── Block-group / chunk type bits ───────────────────────────────────────────

pub const BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BLOCK_GROUP_METADATA: u64 = 1 << 2;
pub const BLOCK_GROUP_RAID0: u64 = 1 << 3;
pub const BLOCK_GROUP_RAID1: u64 = 1 << 4;
pub const BLOCK_GROUP_DUP: u64 = 1 << 5;
pub const BLOCK_GROUP_RAID10: u64 = 1 << 6;
pub const BLOCK_GROUP_RAID5: u64 = 1 << 7;
pub const BLOCK_GROUP_RAID6: u64 = 1 << 8;
pub const BLOCK_GROUP_RAID1C3: u64 = 1 << 9;
pub const BLOCK_GROUP_RAID1C4: u64 = 1 << 10;

/// Mask of all profile (layout) bits, as opposed to usage-type bits.
pub const BLOCK_GROUP_PROFILE_MASK: u64 = BLOCK_GROUP_RAID0
    | BLOCK_GROUP_RAID1
    | BLOCK_GROUP_DUP
    | BLOCK_GROUP_RAID10
    | BLOCK_GROUP_RAID5
    | BLOCK_GROUP_RAID6
    | BLOCK_GROUP_RAID1C3
    | BLOCK_GROUP_RAID1C4;

/// Mask of the usage-type bits (data / system / metadata).
pub const BLOCK_GROUP_TYPE_MASK: u64 =
    BLOCK_GROUP_DATA | BLOCK_GROUP_SYSTEM | BLOCK_GROUP_METADATA;

// ── Compression tags (file extent items) ────────────────────────────────────

pub const COMPRESS_NONE: u8 = 0;
pub const COMPRESS_ZLIB: u8 = 1;
pub const COMPRESS_LZO: u8 = 2;
pub const COMPRESS_ZSTD: u8 = 3;

// ── File extent kinds ───────────────────────────────────────────────────────

pub const FILE_EXTENT_INLINE: u8 = 0;
pub const FILE_EXTENT_REG: u8 = 1;
pub const FILE_EXTENT_PREALLOC: u8 = 2;

// ── The B-tree key ──────────────────────────────────────────────────────────

/// A B-tree key: the ordered triple every tree is sorted by.
///
/// The derived `Ord` is the on-disk total order because the fields are
/// declared in comparison order: objectid, then type, then offset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    pub const MIN: Self = Self {
        objectid: 0,
        item_type: 0,
        offset: 0,
    };
    pub const MAX: Self = Self {
        objectid: u64::MAX,
        item_type: u8::MAX,
        offset: u64::MAX,
    };

    #[must_use]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Parse a 17-byte on-disk key at `offset` within `data`.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let bytes = ensure_slice(data, offset, DISK_KEY_SIZE)?;
        Ok(Self {
            objectid: u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            item_type: bytes[8],
            offset: u64::from_le_bytes([
                bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
                bytes[16],
            ]),
        })
    }

    /// Serialize to the 17-byte on-disk layout.
    #[must_use]
    pub fn to_disk(&self) -> [u8; DISK_KEY_SIZE] {
        let mut out = [0_u8; DISK_KEY_SIZE];
        out[0..8].copy_from_slice(&self.objectid.to_le_bytes());
        out[8] = self.item_type;
        out[9..17].copy_from_slice(&self.offset.to_le_bytes());
        out
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.objectid, self.item_type, self.offset)
    }
}

// ── Address-space newtypes ──────────────────────────────────────────────────

/// A filesystem-logical byte address (the chunk-mapped address space).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Logical(pub u64);

impl Logical {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Round down to the nearest multiple of `alignment`.
    #[must_use]
    pub fn align_down(self, alignment: u64) -> Option<Self> {
        align_down(self.0, alignment).map(Self)
    }

    /// True when the address is a multiple of `alignment`.
    #[must_use]
    pub fn is_aligned(self, alignment: u64) -> bool {
        alignment != 0 && self.0 % alignment == 0
    }
}

/// A device-physical byte offset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Physical(pub u64);

impl Physical {
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

/// On-disk device id (`devid` in stripe and dev-item records).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DeviceId(pub u64);

/// Tree-block and chunk generation counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

/// Objectid of a tree root (`owner` in tree-block headers).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TreeId(pub u64);

impl fmt::Display for Logical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Physical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Parse-layer errors ──────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Little-endian field readers ─────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Decode a NUL-padded label field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

// ── Checked arithmetic helpers ──────────────────────────────────────────────

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Digest size in bytes for a superblock checksum type tag.
///
/// Returns `None` for unknown tags.
#[must_use]
pub fn csum_digest_size(csum_type: u16) -> Option<usize> {
    match csum_type {
        CSUM_TYPE_CRC32C => Some(4),
        CSUM_TYPE_XXHASH64 => Some(8),
        CSUM_TYPE_SHA256 | CSUM_TYPE_BLAKE2B => Some(32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_is_lexicographic() {
        let a = Key::new(1, 0, 0);
        let b = Key::new(1, 0, 1);
        let c = Key::new(1, 1, 0);
        let d = Key::new(2, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
        // type outranks offset
        assert!(Key::new(5, 2, 0) > Key::new(5, 1, u64::MAX));
        // objectid outranks type
        assert!(Key::new(6, 0, 0) > Key::new(5, u8::MAX, u64::MAX));
    }

    #[test]
    fn key_disk_round_trip() {
        let key = Key::new(0xDEAD_BEEF, 108, 0x1_0000);
        let disk = key.to_disk();
        assert_eq!(Key::parse(&disk, 0).expect("parse"), key);
    }

    #[test]
    fn key_parse_truncated() {
        let err = Key::parse(&[0_u8; 10], 0).unwrap_err();
        assert!(matches!(err, ParseError::InsufficientData { .. }));
    }

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert!(read_le_u64(&bytes, 4).is_err());
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(4097, 4096), Some(4096));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_down(100, 3), None);
        assert_eq!(align_up(u64::MAX, 4096), None);
        assert!(Logical(0x8000).is_aligned(0x4000));
        assert!(!Logical(0x8001).is_aligned(0x4000));
        assert!(!Logical(0x8000).is_aligned(0));
    }

    #[test]
    fn logical_checked_add() {
        assert_eq!(Logical(10).checked_add(5), Some(Logical(15)));
        assert_eq!(Logical(u64::MAX).checked_add(1), None);
    }

    #[test]
    fn profile_mask_excludes_type_bits() {
        assert_eq!(BLOCK_GROUP_PROFILE_MASK & BLOCK_GROUP_TYPE_MASK, 0);
        assert_eq!(BLOCK_GROUP_METADATA & BLOCK_GROUP_PROFILE_MASK, 0);
    }

    #[test]
    fn csum_digest_sizes() {
        assert_eq!(csum_digest_size(CSUM_TYPE_CRC32C), Some(4));
        assert_eq!(csum_digest_size(CSUM_TYPE_XXHASH64), Some(8));
        assert_eq!(csum_digest_size(CSUM_TYPE_SHA256), Some(32));
        assert_eq!(csum_digest_size(CSUM_TYPE_BLAKE2B), Some(32));
        assert_eq!(csum_digest_size(99), None);
    }

    #[test]
    fn trim_nul_padded_label() {
        assert_eq!(trim_nul_padded(b"boot\0\0\0"), "boot");
        assert_eq!(trim_nul_padded(b""), "");
    }
}
