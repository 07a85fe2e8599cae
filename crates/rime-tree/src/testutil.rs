//! Fixture builders shared by the engine's test suites: raw tree blocks
//! laid out exactly as mkfs would write them, checksum sealing, and an
//! in-memory device image.

use rime_types::{CSUM_FIELD_SIZE, DISK_KEY_SIZE, HEADER_SIZE, KEY_PTR_SIZE, Key, LEAF_ITEM_SIZE};
use rime_volume::BlockRead;

pub const NODESIZE: usize = 4096;

/// fsid every sealed fixture block carries.
pub const FSID: [u8; 16] = [0x42; 16];

/// An in-memory device image.
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl BlockRead for MemDevice {
    fn len_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "offset overflow"))?;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "length overflow")
        })?;
        if end > self.data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of device image",
            ));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

pub struct LeafSpec {
    pub key: Key,
    pub data: Vec<u8>,
}

impl LeafSpec {
    pub fn new(key: Key, data: &[u8]) -> Self {
        Self {
            key,
            data: data.to_vec(),
        }
    }
}

fn write_header(block: &mut [u8], bytenr: u64, generation: u64, owner: u64, nritems: u32, level: u8) {
    block[0x30..0x38].copy_from_slice(&bytenr.to_le_bytes());
    block[0x50..0x58].copy_from_slice(&generation.to_le_bytes());
    block[0x58..0x60].copy_from_slice(&owner.to_le_bytes());
    block[0x60..0x64].copy_from_slice(&nritems.to_le_bytes());
    block[0x64] = level;
}

/// Build a leaf block: item table forward from the header, payloads
/// packed backward from the block end.
pub fn build_leaf(bytenr: u64, generation: u64, owner: u64, items: &[LeafSpec]) -> Vec<u8> {
    let mut block = vec![0_u8; NODESIZE];
    write_header(
        &mut block,
        bytenr,
        generation,
        owner,
        u32::try_from(items.len()).expect("item count"),
        0,
    );

    let mut data_cursor = NODESIZE;
    for (idx, spec) in items.iter().enumerate() {
        data_cursor -= spec.data.len();
        let base = HEADER_SIZE + idx * LEAF_ITEM_SIZE;
        block[base..base + DISK_KEY_SIZE].copy_from_slice(&spec.key.to_disk());
        let rel = u32::try_from(data_cursor - HEADER_SIZE).expect("offset");
        block[base + 17..base + 21].copy_from_slice(&rel.to_le_bytes());
        block[base + 21..base + 25]
            .copy_from_slice(&u32::try_from(spec.data.len()).expect("size").to_le_bytes());
        block[data_cursor..data_cursor + spec.data.len()].copy_from_slice(&spec.data);
    }
    block
}

/// Build an internal node from (key, child blockptr, child generation).
pub fn build_internal(
    bytenr: u64,
    generation: u64,
    level: u8,
    ptrs: &[(Key, u64, u64)],
) -> Vec<u8> {
    let mut block = vec![0_u8; NODESIZE];
    write_header(
        &mut block,
        bytenr,
        generation,
        1,
        u32::try_from(ptrs.len()).expect("ptr count"),
        level,
    );

    for (idx, (key, blockptr, child_gen)) in ptrs.iter().enumerate() {
        let base = HEADER_SIZE + idx * KEY_PTR_SIZE;
        block[base..base + DISK_KEY_SIZE].copy_from_slice(&key.to_disk());
        block[base + 17..base + 25].copy_from_slice(&blockptr.to_le_bytes());
        block[base + 25..base + 33].copy_from_slice(&child_gen.to_le_bytes());
    }
    block
}

/// Stamp the fsid and a valid CRC32C over everything after the checksum
/// field.
pub fn seal(block: &mut [u8], fsid: [u8; 16]) {
    block[0x20..0x30].copy_from_slice(&fsid);
    let digest = crc32c::crc32c(&block[CSUM_FIELD_SIZE..]);
    block[0..4].copy_from_slice(&digest.to_le_bytes());
}
