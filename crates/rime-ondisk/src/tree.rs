//! Tree-block parsing: header, leaf items, internal key pointers.
//!
//! A tree block is one `nodesize` buffer. Leaves (level 0) hold an item
//! table growing forward from the header and a data region growing
//! backward from the block end; item data offsets are relative to the
//! end of the header. Internal nodes hold fixed-size key pointers only.

use rime_types::{
    CSUM_FIELD_SIZE, DISK_KEY_SIZE, HEADER_SIZE, KEY_PTR_SIZE, Key, LEAF_ITEM_SIZE, MAX_LEVEL,
    ParseError, read_fixed, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Parsed tree-block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub csum: [u8; CSUM_FIELD_SIZE],
    pub fsid: [u8; 16],
    pub bytenr: u64,
    pub flags: u64,
    pub chunk_tree_uuid: [u8; 16],
    pub generation: u64,
    pub owner: u64,
    pub nritems: u32,
    pub level: u8,
}

impl Header {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        Ok(Self {
            csum: read_fixed::<CSUM_FIELD_SIZE>(block, 0x00)?,
            fsid: read_fixed::<16>(block, 0x20)?,
            bytenr: read_le_u64(block, 0x30)?,
            flags: read_le_u64(block, 0x38)?,
            chunk_tree_uuid: read_fixed::<16>(block, 0x40)?,
            generation: read_le_u64(block, 0x50)?,
            owner: read_le_u64(block, 0x58)?,
            nritems: read_le_u32(block, 0x60)?,
            level: block[0x64],
        })
    }

    /// Validate header invariants against the block geometry.
    ///
    /// Checks:
    /// - `bytenr` matches `expected_bytenr` (if provided);
    /// - `level` does not exceed the maximum tree depth;
    /// - `nritems` fits the block, using the per-level item size;
    /// - internal nodes carry at least one key pointer.
    pub fn validate(
        &self,
        block_size: usize,
        expected_bytenr: Option<u64>,
    ) -> Result<(), ParseError> {
        if let Some(expected) = expected_bytenr {
            if self.bytenr != expected {
                return Err(ParseError::InvalidField {
                    field: "bytenr",
                    reason: "header bytenr does not match expected",
                });
            }
        }

        if self.level > MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree depth",
            });
        }

        let payload_space = block_size.saturating_sub(HEADER_SIZE);
        let item_size = if self.level == 0 {
            LEAF_ITEM_SIZE
        } else {
            KEY_PTR_SIZE
        };
        let max_items = payload_space / item_size;
        let nritems = usize::try_from(self.nritems)
            .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;

        if nritems > max_items {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "item count exceeds block capacity",
            });
        }

        if self.level > 0 && self.nritems == 0 {
            return Err(ParseError::InvalidField {
                field: "nritems",
                reason: "internal node has no children",
            });
        }

        Ok(())
    }
}

/// One leaf item descriptor: key plus the location of its payload.
///
/// `data_offset` is relative to the end of the header, as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafItem {
    pub key: Key,
    pub data_offset: u32,
    pub data_size: u32,
}

impl LeafItem {
    /// Byte range of this item's payload within the whole block.
    pub fn data_range(&self, block_len: usize) -> Result<(usize, usize), ParseError> {
        let off = usize::try_from(self.data_offset).map_err(|_| ParseError::IntegerConversion {
            field: "data_offset",
        })?;
        let size = usize::try_from(self.data_size)
            .map_err(|_| ParseError::IntegerConversion { field: "data_size" })?;
        let start = HEADER_SIZE
            .checked_add(off)
            .ok_or(ParseError::InvalidField {
                field: "data_offset",
                reason: "overflow",
            })?;
        let end = start.checked_add(size).ok_or(ParseError::InvalidField {
            field: "data_size",
            reason: "overflow",
        })?;
        if end > block_len {
            return Err(ParseError::InvalidField {
                field: "data_offset",
                reason: "item data extends past block",
            });
        }
        Ok((start, end))
    }
}

/// An internal-node entry: the minimum key of a child subtree plus the
/// child's block address and expected generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPtr {
    pub key: Key,
    pub blockptr: u64,
    pub generation: u64,
}

/// Parse a leaf block, returning the header and its item table.
///
/// Validates the strict key ordering invariant, that payloads stay
/// inside the data region (after the item table, within the block), and
/// that no two payloads overlap.
pub fn parse_leaf_items(block: &[u8]) -> Result<(Header, Vec<LeafItem>), ParseError> {
    let header = Header::parse_from_block(block)?;
    if header.level != 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected leaf level 0",
        });
    }
    header.validate(block.len(), None)?;

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;
    let table_end = HEADER_SIZE + nritems * LEAF_ITEM_SIZE;

    let mut items = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = HEADER_SIZE + idx * LEAF_ITEM_SIZE;
        let key = Key::parse(block, base)?;
        let data_offset = read_le_u32(block, base + DISK_KEY_SIZE)?;
        let data_size = read_le_u32(block, base + DISK_KEY_SIZE + 4)?;

        let item = LeafItem {
            key,
            data_offset,
            data_size,
        };
        let (start, _) = item.data_range(block.len())?;
        if start < table_end {
            return Err(ParseError::InvalidField {
                field: "data_offset",
                reason: "item data overlaps item table",
            });
        }

        if let Some(prev) = items.last() {
            let prev: &LeafItem = prev;
            if prev.key >= key {
                return Err(ParseError::InvalidField {
                    field: "key",
                    reason: "leaf keys not strictly increasing",
                });
            }
        }
        items.push(item);
    }

    check_no_data_overlap(&items, block.len())?;

    Ok((header, items))
}

/// Reject leaves whose item payloads overlap each other.
fn check_no_data_overlap(items: &[LeafItem], block_len: usize) -> Result<(), ParseError> {
    let mut ranges: Vec<(usize, usize)> = Vec::with_capacity(items.len());
    for item in items {
        if item.data_size == 0 {
            continue;
        }
        ranges.push(item.data_range(block_len)?);
    }
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        if pair[0].1 > pair[1].0 {
            return Err(ParseError::InvalidField {
                field: "data_offset",
                reason: "item data regions overlap",
            });
        }
    }
    Ok(())
}

/// Parse an internal block, returning the header and its key pointers.
pub fn parse_internal_items(block: &[u8]) -> Result<(Header, Vec<KeyPtr>), ParseError> {
    let header = Header::parse_from_block(block)?;
    if header.level == 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "expected internal node (level > 0)",
        });
    }
    header.validate(block.len(), None)?;

    let nritems = usize::try_from(header.nritems)
        .map_err(|_| ParseError::IntegerConversion { field: "nritems" })?;

    let mut ptrs = Vec::with_capacity(nritems);
    for idx in 0..nritems {
        let base = HEADER_SIZE + idx * KEY_PTR_SIZE;
        let key = Key::parse(block, base)?;
        let blockptr = read_le_u64(block, base + DISK_KEY_SIZE)?;
        let generation = read_le_u64(block, base + DISK_KEY_SIZE + 8)?;

        if blockptr == 0 {
            return Err(ParseError::InvalidField {
                field: "blockptr",
                reason: "child block pointer is zero",
            });
        }

        if let Some(prev) = ptrs.last() {
            let prev: &KeyPtr = prev;
            if prev.key >= key {
                return Err(ParseError::InvalidField {
                    field: "key",
                    reason: "node keys not strictly increasing",
                });
            }
        }

        ptrs.push(KeyPtr {
            key,
            blockptr,
            generation,
        });
    }

    Ok((header, ptrs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_block(size: usize, nritems: u32, level: u8) -> Vec<u8> {
        let mut block = vec![0_u8; size];
        block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
        block[0x64] = level;
        block
    }

    fn write_leaf_item(
        block: &mut [u8],
        idx: usize,
        key: Key,
        data_off: u32,
        data_sz: u32,
    ) {
        let base = HEADER_SIZE + idx * LEAF_ITEM_SIZE;
        block[base..base + DISK_KEY_SIZE].copy_from_slice(&key.to_disk());
        block[base + 17..base + 21].copy_from_slice(&data_off.to_le_bytes());
        block[base + 21..base + 25].copy_from_slice(&data_sz.to_le_bytes());
    }

    fn write_key_ptr(block: &mut [u8], idx: usize, key: Key, blockptr: u64, generation: u64) {
        let base = HEADER_SIZE + idx * KEY_PTR_SIZE;
        block[base..base + DISK_KEY_SIZE].copy_from_slice(&key.to_disk());
        block[base + 17..base + 25].copy_from_slice(&blockptr.to_le_bytes());
        block[base + 25..base + 33].copy_from_slice(&generation.to_le_bytes());
    }

    #[test]
    fn parse_leaf_smoke() {
        let mut block = make_block(4096, 2, 0);
        // data offsets are header-relative: 3000 lands at byte 3101
        write_leaf_item(&mut block, 0, Key::new(256, 1, 0), 3000, 10);
        write_leaf_item(&mut block, 1, Key::new(257, 1, 0), 2985, 15);
        block[HEADER_SIZE + 3000..HEADER_SIZE + 3010].copy_from_slice(&[0xAA; 10]);

        let (header, items) = parse_leaf_items(&block).expect("leaf parse");
        assert_eq!(header.nritems, 2);
        assert_eq!(items[0].key, Key::new(256, 1, 0));
        let (start, end) = items[0].data_range(block.len()).expect("range");
        assert_eq!(&block[start..end], &[0xAA; 10]);
    }

    #[test]
    fn parse_leaf_rejects_unsorted_keys() {
        let mut block = make_block(4096, 2, 0);
        write_leaf_item(&mut block, 0, Key::new(300, 1, 0), 3000, 4);
        write_leaf_item(&mut block, 1, Key::new(299, 1, 0), 2990, 4);
        let err = parse_leaf_items(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField { field: "key", .. }
        ));
    }

    #[test]
    fn parse_leaf_rejects_duplicate_keys() {
        let mut block = make_block(4096, 2, 0);
        write_leaf_item(&mut block, 0, Key::new(300, 1, 0), 3000, 4);
        write_leaf_item(&mut block, 1, Key::new(300, 1, 0), 2990, 4);
        let err = parse_leaf_items(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField { field: "key", .. }
        ));
    }

    #[test]
    fn parse_leaf_rejects_out_of_bounds_data() {
        let mut block = make_block(512, 1, 0);
        write_leaf_item(&mut block, 0, Key::new(1, 1, 0), 600, 10);
        let err = parse_leaf_items(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "data_offset",
                ..
            }
        ));
    }

    #[test]
    fn parse_leaf_rejects_data_under_item_table() {
        let mut block = make_block(4096, 1, 0);
        // offset 0 points at the first item slot itself
        write_leaf_item(&mut block, 0, Key::new(1, 1, 0), 0, 10);
        let err = parse_leaf_items(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "data_offset",
                ..
            }
        ));
    }

    #[test]
    fn parse_leaf_rejects_overlapping_data() {
        let mut block = make_block(4096, 2, 0);
        write_leaf_item(&mut block, 0, Key::new(1, 1, 0), 3000, 20);
        write_leaf_item(&mut block, 1, Key::new(2, 1, 0), 3010, 20);
        let err = parse_leaf_items(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "data_offset",
                ..
            }
        ));
    }

    #[test]
    fn parse_internal_smoke() {
        let mut block = make_block(4096, 2, 1);
        write_key_ptr(&mut block, 0, Key::new(256, 1, 0), 0x4000, 10);
        write_key_ptr(&mut block, 1, Key::new(512, 1, 100), 0x8000, 10);

        let (header, ptrs) = parse_internal_items(&block).expect("internal parse");
        assert_eq!(header.level, 1);
        assert_eq!(ptrs.len(), 2);
        assert_eq!(ptrs[0].blockptr, 0x4000);
        assert_eq!(ptrs[1].key.objectid, 512);
    }

    #[test]
    fn parse_internal_rejects_leaf_level() {
        let block = make_block(4096, 1, 0);
        let err = parse_internal_items(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField { field: "level", .. }
        ));
    }

    #[test]
    fn parse_internal_rejects_zero_blockptr() {
        let mut block = make_block(4096, 1, 1);
        write_key_ptr(&mut block, 0, Key::new(256, 1, 0), 0, 10);
        let err = parse_internal_items(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "blockptr",
                ..
            }
        ));
    }

    #[test]
    fn parse_internal_rejects_empty_node() {
        let block = make_block(4096, 0, 1);
        let err = parse_internal_items(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "nritems",
                ..
            }
        ));
    }

    #[test]
    fn parse_internal_rejects_unsorted_keys() {
        let mut block = make_block(4096, 2, 1);
        write_key_ptr(&mut block, 0, Key::new(512, 1, 0), 0x4000, 10);
        write_key_ptr(&mut block, 1, Key::new(256, 1, 0), 0x8000, 10);
        let err = parse_internal_items(&block).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField { field: "key", .. }
        ));
    }

    #[test]
    fn header_validate_bytenr() {
        let mut block = make_block(4096, 0, 0);
        block[0x30..0x38].copy_from_slice(&0x1_0000_u64.to_le_bytes());
        let header = Header::parse_from_block(&block).expect("parse");
        header.validate(4096, Some(0x1_0000)).expect("match");
        let err = header.validate(4096, Some(0x2_0000)).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "bytenr",
                ..
            }
        ));
    }

    #[test]
    fn header_validate_level_too_high() {
        let block = make_block(4096, 0, 8);
        let header = Header::parse_from_block(&block).expect("parse");
        let err = header.validate(4096, None).unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidField { field: "level", .. }
        ));
    }

    #[test]
    fn header_validate_nritems_capacity() {
        // A 4096-byte leaf holds (4096-101)/25 = 159 items at most.
        let leaf = make_block(4096, 200, 0);
        let header = Header::parse_from_block(&leaf).expect("parse");
        assert!(header.validate(4096, None).is_err());

        // A 4096-byte node holds (4096-101)/33 = 121 pointers at most.
        let node = make_block(4096, 130, 1);
        let header = Header::parse_from_block(&node).expect("parse");
        assert!(header.validate(4096, None).is_err());
    }
}
