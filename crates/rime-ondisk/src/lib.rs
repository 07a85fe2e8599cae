#![forbid(unsafe_code)]
//! Byte-exact parsers for the on-disk format.
//!
//! Every multi-byte integer field is little-endian. Parsing never
//! reinterprets storage in place: each record kind has its own function
//! decoding from raw bytes into an owned struct, and validation beyond
//! "the bytes are present and self-consistent" lives with the callers
//! that know the mount geometry.

pub mod items;
pub mod superblock;
pub mod tree;

pub use items::{
    ChunkItem, DevItem, FileExtentItem, FileExtentPayload, RootItem, Stripe, parse_sys_chunk_array,
};
pub use superblock::Superblock;
pub use tree::{Header, KeyPtr, LeafItem, parse_internal_items, parse_leaf_items};
