//! Validated in-memory tree blocks.

use rime_error::{Result, RimeError};
use rime_ondisk::tree::{Header, KeyPtr, LeafItem, parse_internal_items, parse_leaf_items};
use rime_types::{Key, Logical};

/// Per-level contents of a parsed block.
#[derive(Debug, Clone)]
enum Contents {
    Leaf(Vec<LeafItem>),
    Node(Vec<KeyPtr>),
}

/// One immutable, structurally validated tree block.
///
/// Construction is the only validation gate: a `TreeBlock` in hand has
/// a self-consistent header, strictly increasing keys, and in-bounds
/// item data. Checksum and generation checks happen in the read path
/// before construction.
#[derive(Debug, Clone)]
pub struct TreeBlock {
    header: Header,
    contents: Contents,
    raw: Vec<u8>,
}

impl TreeBlock {
    /// Parse and validate a raw `nodesize` buffer.
    pub fn parse(logical: Logical, raw: Vec<u8>) -> Result<Self> {
        let header = Header::parse_from_block(&raw)
            .map_err(|err| RimeError::structural(logical, &err))?;
        header
            .validate(raw.len(), Some(logical.0))
            .map_err(|err| RimeError::structural(logical, &err))?;

        let contents = if header.level == 0 {
            let (_, items) =
                parse_leaf_items(&raw).map_err(|err| RimeError::structural(logical, &err))?;
            Contents::Leaf(items)
        } else {
            let (_, ptrs) =
                parse_internal_items(&raw).map_err(|err| RimeError::structural(logical, &err))?;
            Contents::Node(ptrs)
        };

        Ok(Self {
            header,
            contents,
            raw,
        })
    }

    #[must_use]
    pub fn header(&self) -> &Header {
        &self.header
    }

    #[must_use]
    pub fn logical(&self) -> Logical {
        Logical(self.header.bytenr)
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.header.level
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.header.generation
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.header.level == 0
    }

    #[must_use]
    pub fn nritems(&self) -> usize {
        match &self.contents {
            Contents::Leaf(items) => items.len(),
            Contents::Node(ptrs) => ptrs.len(),
        }
    }

    /// Key at `slot`, for leaves and internal nodes alike.
    #[must_use]
    pub fn key(&self, slot: usize) -> Option<Key> {
        match &self.contents {
            Contents::Leaf(items) => items.get(slot).map(|item| item.key),
            Contents::Node(ptrs) => ptrs.get(slot).map(|ptr| ptr.key),
        }
    }

    /// Leaf item descriptor at `slot` (leaves only).
    #[must_use]
    pub fn item(&self, slot: usize) -> Option<&LeafItem> {
        match &self.contents {
            Contents::Leaf(items) => items.get(slot),
            Contents::Node(_) => None,
        }
    }

    /// Raw payload bytes of the leaf item at `slot`.
    pub fn item_data(&self, slot: usize) -> Result<&[u8]> {
        let item = self.item(slot).ok_or_else(|| RimeError::Structural {
            logical: self.logical(),
            detail: format!("no leaf item at slot {slot}"),
        })?;
        let (start, end) = item
            .data_range(self.raw.len())
            .map_err(|err| RimeError::structural(self.logical(), &err))?;
        Ok(&self.raw[start..end])
    }

    /// Child pointer at `slot` (internal nodes only).
    #[must_use]
    pub fn key_ptr(&self, slot: usize) -> Option<&KeyPtr> {
        match &self.contents {
            Contents::Node(ptrs) => ptrs.get(slot),
            Contents::Leaf(_) => None,
        }
    }

    /// Ordered binary search over the block's keys.
    ///
    /// `Ok(slot)` on an exact hit; `Err(slot)` gives the insertion
    /// point, i.e. every key before it is `< key` and every key from it
    /// on is `> key`.
    #[must_use]
    pub fn search_slot(&self, key: &Key) -> std::result::Result<usize, usize> {
        match &self.contents {
            Contents::Leaf(items) => items.binary_search_by(|item| item.key.cmp(key)),
            Contents::Node(ptrs) => ptrs.binary_search_by(|ptr| ptr.key.cmp(key)),
        }
    }
}
