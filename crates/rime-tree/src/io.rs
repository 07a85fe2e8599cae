//! Checksum-verified tree block reads with mirror fallback.
//!
//! [`TreeReader`] is the only way blocks enter the cache: a read resolves
//! the logical address through the volume map, pulls the raw bytes off
//! one mirror, verifies the stored checksum and the header invariants,
//! and only then parses and caches the block. A mirror that fails any
//! check is abandoned and the next one tried, in increasing index order;
//! the read as a whole fails only once every copy is exhausted.

use crate::block::TreeBlock;
use crate::cache::BlockCache;
use rime_error::{Result, RimeError};
use rime_types::{
    CSUM_FIELD_SIZE, CSUM_TYPE_CRC32C, Generation, Logical, SUPERBLOCK_OFFSET,
};
use rime_volume::VolumeMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Mount geometry every read needs: block sizes, the checksum algorithm,
/// and the set of fsids a block header may legitimately carry (the
/// mounted filesystem plus its seed chain).
#[derive(Debug, Clone)]
pub struct FsGeometry {
    pub nodesize: u32,
    pub sectorsize: u32,
    pub csum_type: u16,
    pub fsids: Vec<[u8; 16]>,
}

/// How strictly generation hints are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// A generation mismatch on every mirror fails the read.
    #[default]
    Strict,
    /// After all mirrors fail strict checks, fall back to the readable
    /// copy with the highest generation and flag it in the cache.
    Permissive,
}

/// The tree block read path.
#[derive(Debug)]
pub struct TreeReader {
    volumes: Arc<VolumeMap>,
    cache: Arc<BlockCache>,
    geometry: FsGeometry,
}

enum MirrorOutcome {
    /// Passed every check.
    Valid(Arc<TreeBlock>),
    /// Readable and self-consistent, but its generation differs from
    /// the referencing pointer's.
    Stale(Arc<TreeBlock>),
}

impl TreeReader {
    #[must_use]
    pub fn new(volumes: Arc<VolumeMap>, cache: Arc<BlockCache>, geometry: FsGeometry) -> Self {
        Self {
            volumes,
            cache,
            geometry,
        }
    }

    #[must_use]
    pub fn volumes(&self) -> &VolumeMap {
        &self.volumes
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    #[must_use]
    pub fn nodesize(&self) -> u32 {
        self.geometry.nodesize
    }

    #[must_use]
    pub fn sectorsize(&self) -> u32 {
        self.geometry.sectorsize
    }

    /// Read and validate the tree block at `logical`.
    ///
    /// `expected` is the generation stamped on the pointer that referenced
    /// this block; pass `None` when no referencing pointer exists (roots
    /// learned from an untrusted source). A cached uptodate block with a
    /// matching generation is returned without re-validation.
    pub fn read_block(
        &self,
        logical: Logical,
        expected: Option<Generation>,
        mode: ReadMode,
    ) -> Result<Arc<TreeBlock>> {
        let nodesize = self.geometry.nodesize;
        if logical.0 < SUPERBLOCK_OFFSET as u64 {
            return Err(RimeError::Structural {
                logical,
                detail: "block address below the first usable byte".into(),
            });
        }
        if !logical.is_aligned(u64::from(nodesize)) {
            return Err(RimeError::Structural {
                logical,
                detail: "block address not aligned to nodesize".into(),
            });
        }

        if let Some(block) = self.cache.get(logical, nodesize) {
            match expected {
                Some(generation) if block.generation() != generation.0 => {
                    debug!(
                        logical = logical.0,
                        cached = block.generation(),
                        expected = generation.0,
                        "cached generation differs from pointer, re-reading"
                    );
                    self.cache.evict(logical);
                }
                _ => {
                    trace!(logical = logical.0, "tree block cache hit");
                    return Ok(block);
                }
            }
        }

        let copies = self.volumes.copies_count(logical, u64::from(nodesize))?;
        let mut last_err: Option<RimeError> = None;
        let mut stale_fallback: Option<Arc<TreeBlock>> = None;

        for mirror in 1..=copies {
            match self.try_mirror(logical, mirror, expected) {
                Ok(MirrorOutcome::Valid(block)) => {
                    trace!(logical = logical.0, mirror, "tree block read ok");
                    self.cache.insert(logical, nodesize, Arc::clone(&block));
                    return Ok(block);
                }
                Ok(MirrorOutcome::Stale(block)) => {
                    let found = block.generation();
                    warn!(
                        logical = logical.0,
                        mirror, found, "mirror has unexpected generation"
                    );
                    let best = stale_fallback
                        .as_ref()
                        .map_or(0, |candidate| candidate.generation());
                    if found > best {
                        stale_fallback = Some(Arc::clone(&block));
                    }
                    last_err = Some(RimeError::GenerationMismatch {
                        logical,
                        expected: expected.unwrap_or(Generation(0)),
                        found: Generation(found),
                    });
                }
                Err(err) if err.is_mirror_recoverable() => {
                    warn!(
                        logical = logical.0,
                        mirror,
                        error = %err,
                        "mirror failed, trying next copy"
                    );
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        if mode == ReadMode::Permissive {
            if let Some(block) = stale_fallback {
                warn!(
                    logical = logical.0,
                    generation = block.generation(),
                    "all mirrors stale, accepting highest-generation copy"
                );
                self.cache.insert(logical, nodesize, Arc::clone(&block));
                self.cache.mark_defect(logical, nodesize);
                return Ok(block);
            }
        }

        Err(last_err.unwrap_or_else(|| RimeError::NotFound(format!(
            "no mirrors available for logical {logical}"
        ))))
    }

    fn try_mirror(
        &self,
        logical: Logical,
        mirror: u16,
        expected: Option<Generation>,
    ) -> Result<MirrorOutcome> {
        let raw = self.read_raw(logical, mirror)?;
        self.verify_checksum(logical, mirror, &raw)?;

        let block = TreeBlock::parse(logical, raw)?;
        let fsid = &block.header().fsid;
        if !self.geometry.fsids.iter().any(|known| known == fsid) {
            return Err(RimeError::Structural {
                logical,
                detail: "header fsid matches neither the mount nor its seed chain".into(),
            });
        }

        if let Some(generation) = expected {
            if block.generation() != generation.0 {
                return Ok(MirrorOutcome::Stale(Arc::new(block)));
            }
        }
        Ok(MirrorOutcome::Valid(Arc::new(block)))
    }

    /// Pull the raw `nodesize` bytes for one mirror, looping over mapped
    /// segments when a striped profile splits the block.
    fn read_raw(&self, logical: Logical, mirror: u16) -> Result<Vec<u8>> {
        let nodesize = u64::from(self.geometry.nodesize);
        let mut buf = vec![0_u8; self.geometry.nodesize as usize];
        let mut done = 0_u64;

        while done < nodesize {
            let run = self
                .volumes
                .map_block(Logical(logical.0 + done), nodesize - done, mirror)?;
            if run.length == 0 {
                return Err(RimeError::Structural {
                    logical,
                    detail: "volume map produced an empty segment".into(),
                });
            }
            let handle = run.device.handle.as_ref().ok_or_else(|| RimeError::Io {
                logical,
                devid: run.device.devid,
                mirror,
                detail: "device not opened".into(),
            })?;
            let start = usize::try_from(done).map_err(|_| RimeError::Structural {
                logical,
                detail: "segment offset overflow".into(),
            })?;
            let end = usize::try_from(done + run.length).map_err(|_| RimeError::Structural {
                logical,
                detail: "segment length overflow".into(),
            })?;
            handle
                .read_exact_at(run.physical.0, &mut buf[start..end])
                .map_err(|err| RimeError::Io {
                    logical,
                    devid: run.device.devid,
                    mirror,
                    detail: err.to_string(),
                })?;
            done += run.length;
        }

        Ok(buf)
    }

    fn verify_checksum(&self, logical: Logical, mirror: u16, raw: &[u8]) -> Result<()> {
        if self.geometry.csum_type != CSUM_TYPE_CRC32C {
            return Err(RimeError::UnsupportedFeature(format!(
                "checksum type {} verification",
                self.geometry.csum_type
            )));
        }
        if raw.len() <= CSUM_FIELD_SIZE {
            return Err(RimeError::Structural {
                logical,
                detail: "block smaller than its checksum field".into(),
            });
        }
        let computed = crc32c::crc32c(&raw[CSUM_FIELD_SIZE..]);
        let stored = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if computed != stored {
            return Err(RimeError::Checksum { logical, mirror });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FSID, LeafSpec, MemDevice, NODESIZE, build_leaf, seal};
    use rime_ondisk::items::{ChunkItem, Stripe};
    use rime_types::{
        BLOCK_GROUP_METADATA, BLOCK_GROUP_RAID1, BLOCK_GROUP_RAID1C3, CHUNK_ITEM_KEY,
        CSUM_TYPE_SHA256, DeviceId, Key, STRIPE_LEN,
    };

    const CHUNK_LOGICAL: u64 = 0x40_0000;
    const CHUNK_LEN: u64 = 32 * STRIPE_LEN;

    fn geometry() -> FsGeometry {
        FsGeometry {
            nodesize: NODESIZE as u32,
            sectorsize: 4096,
            csum_type: CSUM_TYPE_CRC32C,
            fsids: vec![FSID],
        }
    }

    fn sealed_leaf(logical: u64, generation: u64) -> Vec<u8> {
        let mut raw = build_leaf(
            logical,
            generation,
            5,
            &[LeafSpec::new(Key::new(256, 1, 0), b"payload")],
        );
        seal(&mut raw, FSID);
        raw
    }

    /// One device per stripe, each a full mirror (RAID1C3-style layout
    /// collapses to RAID1/DUP behavior for fewer stripes).
    fn reader_with_mirrors(images: Vec<Vec<u8>>, profile: u64) -> TreeReader {
        let num_stripes = u16::try_from(images.len()).expect("stripe count");
        let mut volumes = VolumeMap::new();
        let stripes = (0..images.len())
            .map(|i| Stripe {
                devid: i as u64 + 1,
                offset: 0x10_0000,
                dev_uuid: [0; 16],
            })
            .collect();
        for (i, image) in images.into_iter().enumerate() {
            volumes.attach_handle(DeviceId(i as u64 + 1), Arc::new(MemDevice::new(image)));
        }
        let item = ChunkItem {
            length: CHUNK_LEN,
            owner: 2,
            stripe_len: STRIPE_LEN,
            chunk_type: BLOCK_GROUP_METADATA | profile,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes,
            sub_stripes: 0,
            stripes,
        };
        volumes
            .insert_chunk(&Key::new(256, CHUNK_ITEM_KEY, CHUNK_LOGICAL), &item)
            .expect("chunk");
        TreeReader::new(
            Arc::new(volumes),
            Arc::new(BlockCache::new()),
            geometry(),
        )
    }

    /// A device image with `block` placed at the stripe base plus the
    /// block's offset within the chunk.
    fn image_with_block(logical: u64, block: &[u8]) -> Vec<u8> {
        let mut image = vec![0_u8; 0x10_0000 + CHUNK_LEN as usize];
        let physical = 0x10_0000 + (logical - CHUNK_LOGICAL) as usize;
        image[physical..physical + block.len()].copy_from_slice(block);
        image
    }

    #[test]
    fn read_single_mirror() {
        let logical = CHUNK_LOGICAL;
        let reader = reader_with_mirrors(
            vec![image_with_block(logical, &sealed_leaf(logical, 7))],
            0,
        );
        let block = reader
            .read_block(Logical(logical), Some(Generation(7)), ReadMode::Strict)
            .expect("read");
        assert_eq!(block.generation(), 7);
        assert_eq!(block.nritems(), 1);
        assert_eq!(reader.cache().len(), 1);
    }

    #[test]
    fn rejects_unaligned_and_low_addresses() {
        let logical = CHUNK_LOGICAL;
        let reader = reader_with_mirrors(
            vec![image_with_block(logical, &sealed_leaf(logical, 7))],
            0,
        );
        assert!(matches!(
            reader.read_block(Logical(logical + 17), None, ReadMode::Strict),
            Err(RimeError::Structural { .. })
        ));
        assert!(matches!(
            reader.read_block(Logical(0), None, ReadMode::Strict),
            Err(RimeError::Structural { .. })
        ));
        assert!(matches!(
            reader.read_block(Logical(0x8000), None, ReadMode::Strict),
            Err(RimeError::Structural { .. })
        ));
    }

    #[test]
    fn mirror_fallback_on_checksum_corruption() {
        let logical = CHUNK_LOGICAL + NODESIZE as u64;
        let good = sealed_leaf(logical, 7);

        // only the last of three mirrors is intact
        for valid_mirror in 1..=3_usize {
            let images = (1..=3)
                .map(|i| {
                    let mut image = image_with_block(logical, &good);
                    if i != valid_mirror {
                        let physical = 0x10_0000 + (logical - CHUNK_LOGICAL) as usize;
                        image[physical + 200] ^= 0xFF;
                    }
                    image
                })
                .collect();
            let reader = reader_with_mirrors(images, BLOCK_GROUP_RAID1C3);
            let block = reader
                .read_block(Logical(logical), Some(Generation(7)), ReadMode::Strict)
                .expect("fallback");
            assert_eq!(block.generation(), 7, "valid mirror {valid_mirror}");
        }
    }

    #[test]
    fn all_mirrors_corrupt_fails_with_checksum() {
        let logical = CHUNK_LOGICAL;
        let good = sealed_leaf(logical, 7);
        let images = (0..2)
            .map(|_| {
                let mut image = image_with_block(logical, &good);
                image[0x10_0000 + 50] ^= 0xFF;
                image
            })
            .collect();
        let reader = reader_with_mirrors(images, BLOCK_GROUP_RAID1);
        let err = reader
            .read_block(Logical(logical), Some(Generation(7)), ReadMode::Strict)
            .unwrap_err();
        assert!(matches!(err, RimeError::Checksum { mirror: 2, .. }));
        assert!(reader.cache().is_empty(), "failed reads must not cache");
    }

    #[test]
    fn missing_device_degrades_to_other_mirror() {
        let logical = CHUNK_LOGICAL;
        let good = sealed_leaf(logical, 7);

        let mut volumes = VolumeMap::new();
        // device 1 never opened; device 2 holds the block
        volumes.attach_handle(
            DeviceId(2),
            Arc::new(MemDevice::new(image_with_block(logical, &good))),
        );
        let item = ChunkItem {
            length: CHUNK_LEN,
            owner: 2,
            stripe_len: STRIPE_LEN,
            chunk_type: BLOCK_GROUP_METADATA | BLOCK_GROUP_RAID1,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes: 2,
            sub_stripes: 0,
            stripes: vec![
                Stripe {
                    devid: 1,
                    offset: 0x10_0000,
                    dev_uuid: [0; 16],
                },
                Stripe {
                    devid: 2,
                    offset: 0x10_0000,
                    dev_uuid: [0; 16],
                },
            ],
        };
        volumes
            .insert_chunk(&Key::new(256, CHUNK_ITEM_KEY, CHUNK_LOGICAL), &item)
            .expect("chunk");

        let reader = TreeReader::new(
            Arc::new(volumes),
            Arc::new(BlockCache::new()),
            geometry(),
        );
        let block = reader
            .read_block(Logical(logical), Some(Generation(7)), ReadMode::Strict)
            .expect("degraded read");
        assert_eq!(block.generation(), 7);
    }

    #[test]
    fn generation_mismatch_strict_vs_permissive() {
        let logical = CHUNK_LOGICAL;
        // two self-consistent mirrors, generations 5 and 6, pointer wants 9
        let images = vec![
            image_with_block(logical, &sealed_leaf(logical, 5)),
            image_with_block(logical, &sealed_leaf(logical, 6)),
        ];
        let reader = reader_with_mirrors(images, BLOCK_GROUP_RAID1);

        let err = reader
            .read_block(Logical(logical), Some(Generation(9)), ReadMode::Strict)
            .unwrap_err();
        assert!(matches!(err, RimeError::GenerationMismatch { .. }));
        assert!(reader.cache().is_empty());

        let block = reader
            .read_block(Logical(logical), Some(Generation(9)), ReadMode::Permissive)
            .expect("permissive fallback");
        assert_eq!(block.generation(), 6, "highest generation wins");
        assert!(reader.cache().is_defect(Logical(logical), NODESIZE as u32));
    }

    #[test]
    fn wrong_fsid_is_structural() {
        let logical = CHUNK_LOGICAL;
        let mut raw = build_leaf(logical, 7, 5, &[]);
        seal(&mut raw, [0xEE; 16]);
        let reader = reader_with_mirrors(vec![image_with_block(logical, &raw)], 0);
        let err = reader
            .read_block(Logical(logical), Some(Generation(7)), ReadMode::Strict)
            .unwrap_err();
        assert!(matches!(err, RimeError::Structural { .. }));
    }

    #[test]
    fn seed_fsid_chain_accepted() {
        let logical = CHUNK_LOGICAL;
        let seed_fsid = [0xEE_u8; 16];
        let mut raw = build_leaf(logical, 7, 5, &[]);
        seal(&mut raw, seed_fsid);

        let mut volumes = VolumeMap::new();
        volumes.attach_handle(
            DeviceId(1),
            Arc::new(MemDevice::new(image_with_block(logical, &raw))),
        );
        let item = ChunkItem {
            length: CHUNK_LEN,
            owner: 2,
            stripe_len: STRIPE_LEN,
            chunk_type: BLOCK_GROUP_METADATA,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes: 1,
            sub_stripes: 0,
            stripes: vec![Stripe {
                devid: 1,
                offset: 0x10_0000,
                dev_uuid: [0; 16],
            }],
        };
        volumes
            .insert_chunk(&Key::new(256, CHUNK_ITEM_KEY, CHUNK_LOGICAL), &item)
            .expect("chunk");

        let mut geometry = geometry();
        geometry.fsids.push(seed_fsid);
        let reader = TreeReader::new(Arc::new(volumes), Arc::new(BlockCache::new()), geometry);
        assert!(reader
            .read_block(Logical(logical), Some(Generation(7)), ReadMode::Strict)
            .is_ok());
    }

    #[test]
    fn cache_hit_returns_same_block() {
        let logical = CHUNK_LOGICAL;
        let reader = reader_with_mirrors(
            vec![image_with_block(logical, &sealed_leaf(logical, 7))],
            0,
        );
        let first = reader
            .read_block(Logical(logical), Some(Generation(7)), ReadMode::Strict)
            .expect("first read");
        let second = reader
            .read_block(Logical(logical), Some(Generation(7)), ReadMode::Strict)
            .expect("cache hit");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reader.cache().len(), 1);

        // a stricter generation hint invalidates the cached copy
        let err = reader
            .read_block(Logical(logical), Some(Generation(8)), ReadMode::Strict)
            .unwrap_err();
        assert!(matches!(err, RimeError::GenerationMismatch { .. }));
    }

    #[test]
    fn unsupported_csum_type_aborts_immediately() {
        let logical = CHUNK_LOGICAL;
        let image = image_with_block(logical, &sealed_leaf(logical, 7));
        let mut geometry = geometry();
        geometry.csum_type = CSUM_TYPE_SHA256;

        let mut volumes = VolumeMap::new();
        volumes.attach_handle(DeviceId(1), Arc::new(MemDevice::new(image)));
        let item = ChunkItem {
            length: CHUNK_LEN,
            owner: 2,
            stripe_len: STRIPE_LEN,
            chunk_type: BLOCK_GROUP_METADATA,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            num_stripes: 1,
            sub_stripes: 0,
            stripes: vec![Stripe {
                devid: 1,
                offset: 0x10_0000,
                dev_uuid: [0; 16],
            }],
        };
        volumes
            .insert_chunk(&Key::new(256, CHUNK_ITEM_KEY, CHUNK_LOGICAL), &item)
            .expect("chunk");

        let reader = TreeReader::new(Arc::new(volumes), Arc::new(BlockCache::new()), geometry);
        let err = reader
            .read_block(Logical(logical), None, ReadMode::Strict)
            .unwrap_err();
        assert!(matches!(err, RimeError::UnsupportedFeature(_)));
    }
}
