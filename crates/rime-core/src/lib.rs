#![forbid(unsafe_code)]
//! The mount context: superblock intake, chunk bootstrap, root
//! resolution, and file-extent decode.
//!
//! [`Filesystem::mount`] takes already-opened device handles (device
//! discovery and partition scanning belong to the host) and brings up
//! the read path in order: parse and checksum the superblock, learn the
//! bootstrap system chunks from its embedded array, walk the chunk tree
//! to register devices and the remaining chunks, then hand out roots.
//! From there callers search trees and decode `EXTENT_DATA` payloads
//! into their own buffers.

use rime_compress::{Algorithm, decompress};
use rime_error::{Result, RimeError};
use rime_ondisk::Superblock;
use rime_ondisk::items::{ChunkItem, DevItem, FileExtentItem, FileExtentPayload, RootItem};
use rime_tree::{
    BlockCache, FsGeometry, ReadMode, Search, TreeReader, TreeRoot, next_leaf, search,
};
use rime_types::{
    CHUNK_ITEM_KEY, CSUM_FIELD_SIZE, CSUM_TYPE_CRC32C, DEV_ITEM_KEY, DeviceId, FS_TREE_OBJECTID,
    Generation, Key, Logical, ROOT_ITEM_KEY, SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};
use rime_volume::{BlockRead, VolumeMap};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Largest size a compressed extent may inflate to (the format
/// compresses file data in 128 KiB windows).
const MAX_COMPRESSED_EXTENT: u64 = 128 * 1024;

/// Mount-time knobs.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Generation enforcement for every tree block read.
    pub read_mode: ReadMode,
    /// Additional fsids tree blocks may carry (seed device chain).
    pub seed_fsids: Vec<[u8; 16]>,
}

/// One mounted filesystem.
#[derive(Debug)]
pub struct Filesystem {
    superblock: Superblock,
    volumes: Arc<VolumeMap>,
    cache: Arc<BlockCache>,
    reader: TreeReader,
    mode: ReadMode,
    root_tree: TreeRoot,
    chunk_tree: TreeRoot,
}

impl Filesystem {
    /// Mount from opened device handles.
    ///
    /// Every handle must expose a device of the same filesystem; the
    /// superblock with the highest generation among them becomes
    /// authoritative. Devices the superblock records but the caller did
    /// not open degrade mirror counts rather than failing the mount.
    pub fn mount(handles: Vec<Arc<dyn BlockRead>>, options: MountOptions) -> Result<Self> {
        if handles.is_empty() {
            return Err(RimeError::NotFound("no devices supplied".into()));
        }

        let mut superblock: Option<Superblock> = None;
        let mut opened: Vec<(DeviceId, Arc<dyn BlockRead>)> = Vec::with_capacity(handles.len());
        for handle in handles {
            let sb = read_superblock(handle.as_ref())?;
            if let Some(reference) = &superblock {
                if sb.fsid != reference.fsid {
                    return Err(RimeError::Structural {
                        logical: Logical(sb.bytenr),
                        detail: "device fsid differs from the first opened device".into(),
                    });
                }
            }
            let devid = DeviceId(sb.dev_item.devid);
            if opened.iter().any(|(id, _)| *id == devid) {
                return Err(RimeError::Structural {
                    logical: Logical(sb.bytenr),
                    detail: format!("device id {devid} opened twice"),
                });
            }
            opened.push((devid, handle));
            if superblock
                .as_ref()
                .map_or(true, |best| sb.generation > best.generation)
            {
                superblock = Some(sb);
            }
        }
        let superblock = superblock.ok_or_else(|| RimeError::NotFound("no superblock".into()))?;

        info!(
            label = %superblock.label,
            generation = superblock.generation,
            nodesize = superblock.nodesize,
            devices = opened.len(),
            "mounting filesystem"
        );

        let mut volumes = VolumeMap::new();
        for (devid, handle) in opened {
            volumes.attach_handle(devid, handle);
        }
        let bootstrapped = volumes.bootstrap_system_chunks(&superblock.sys_chunk_array)?;
        debug!(chunks = bootstrapped, "system chunks bootstrapped");

        let mut fsids = vec![superblock.fsid];
        fsids.extend(options.seed_fsids.iter().copied());
        let geometry = FsGeometry {
            nodesize: superblock.nodesize,
            sectorsize: superblock.sectorsize,
            csum_type: superblock.csum_type,
            fsids,
        };

        let chunk_tree = TreeRoot::new(
            Logical(superblock.chunk_root),
            superblock.chunk_root_level,
            Generation(superblock.chunk_root_generation),
        );

        // The chunk tree itself lives in system chunks, so a reader over
        // the bootstrap map suffices to ingest it.
        let boot_reader = TreeReader::new(
            Arc::new(volumes.clone()),
            Arc::new(BlockCache::new()),
            geometry.clone(),
        );
        let mut dev_items: Vec<DevItem> = Vec::new();
        let mut chunk_items: Vec<(Key, ChunkItem)> = Vec::new();
        walk_tree_leaves(&boot_reader, &chunk_tree, options.read_mode, |key, data| {
            match key.item_type {
                DEV_ITEM_KEY => dev_items.push(DevItem::parse(data, 0)?),
                CHUNK_ITEM_KEY => match ChunkItem::parse(data, 0) {
                    Ok((item, _)) => chunk_items.push((*key, item)),
                    Err(err) => warn!(
                        logical = key.offset,
                        error = %err,
                        "unparseable chunk item skipped"
                    ),
                },
                other => trace!(item_type = other, "ignoring chunk tree item"),
            }
            Ok(())
        })?;
        drop(boot_reader);

        for item in &dev_items {
            if item.fsid != [0; 16] && !geometry.fsids.iter().any(|fsid| *fsid == item.fsid) {
                return Err(RimeError::Structural {
                    logical: Logical(0),
                    detail: format!("device {} carries a foreign fsid", item.devid),
                });
            }
            volumes.register_device(item);
        }
        for (key, item) in &chunk_items {
            if let Err(err) = volumes.insert_chunk(key, item) {
                warn!(logical = key.offset, error = %err, "chunk tree entry skipped");
            }
        }
        if (volumes.device_count() as u64) < superblock.num_devices {
            warn!(
                expected = superblock.num_devices,
                opened = volumes.device_count(),
                "fewer devices than the superblock records, reads may degrade"
            );
        }

        let volumes = Arc::new(volumes);
        let cache = Arc::new(BlockCache::new());
        let reader = TreeReader::new(Arc::clone(&volumes), Arc::clone(&cache), geometry);
        let root_tree = TreeRoot::new(
            Logical(superblock.root),
            superblock.root_level,
            Generation(superblock.generation),
        );

        Ok(Self {
            superblock,
            volumes,
            cache,
            reader,
            mode: options.read_mode,
            root_tree,
            chunk_tree,
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub fn fsid(&self) -> [u8; 16] {
        self.superblock.fsid
    }

    #[must_use]
    pub fn nodesize(&self) -> u32 {
        self.superblock.nodesize
    }

    #[must_use]
    pub fn sectorsize(&self) -> u32 {
        self.superblock.sectorsize
    }

    #[must_use]
    pub fn reader(&self) -> &TreeReader {
        &self.reader
    }

    #[must_use]
    pub fn volumes(&self) -> &VolumeMap {
        &self.volumes
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Root of the tree of trees.
    #[must_use]
    pub fn root_tree(&self) -> TreeRoot {
        self.root_tree
    }

    #[must_use]
    pub fn chunk_tree(&self) -> TreeRoot {
        self.chunk_tree
    }

    /// Search `root` for `key`, descending to `lowest_level`.
    pub fn search_tree(&self, root: &TreeRoot, key: &Key, lowest_level: u8) -> Result<Search> {
        search(&self.reader, root, key, lowest_level, self.mode)
    }

    /// Payload of the exact item `key` in `root`, or `None`.
    pub fn search_item(&self, root: &TreeRoot, key: &Key) -> Result<Option<Vec<u8>>> {
        let found = self.search_tree(root, key, 0)?;
        if !found.exact {
            return Ok(None);
        }
        let bottom = found.path.bottom().ok_or_else(|| RimeError::NotFound(
            "search returned an empty path".into(),
        ))?;
        Ok(Some(bottom.block.item_data(bottom.slot)?.to_vec()))
    }

    /// Resolve a tree's root block from its `ROOT_ITEM` in the root tree.
    ///
    /// The item's key offset carries a transid for snapshots, so the
    /// lookup accepts the first root item under `objectid` rather than
    /// demanding offset zero.
    pub fn tree_root(&self, objectid: u64) -> Result<TreeRoot> {
        let target = Key::new(objectid, ROOT_ITEM_KEY, 0);
        let mut found = self.search_tree(&self.root_tree, &target, 0)?;

        let missing = || RimeError::NotFound(format!("no root item for tree {objectid}"));
        let past_leaf_end = {
            let bottom = found.path.bottom().ok_or_else(missing)?;
            bottom.slot >= bottom.block.nritems()
        };
        if past_leaf_end && !next_leaf(&self.reader, &mut found.path, self.mode)? {
            return Err(missing());
        }
        let bottom = found.path.bottom().ok_or_else(missing)?;
        match bottom.block.key(bottom.slot) {
            Some(key) if key.objectid == objectid && key.item_type == ROOT_ITEM_KEY => {}
            _ => return Err(missing()),
        }

        let item = RootItem::parse(bottom.block.item_data(bottom.slot)?)?;
        debug!(
            tree = objectid,
            root = item.bytenr,
            level = item.level,
            generation = item.generation,
            "resolved tree root"
        );
        Ok(TreeRoot::new(
            Logical(item.bytenr),
            item.level,
            Generation(item.generation),
        ))
    }

    /// Root of the default filesystem tree.
    pub fn fs_tree(&self) -> Result<TreeRoot> {
        self.tree_root(FS_TREE_OBJECTID)
    }

    /// Decode one `EXTENT_DATA` payload into `out`.
    ///
    /// Returns the bytes written: the extent's logical size capped at
    /// the buffer length. Holes, preallocated ranges, and any tail a
    /// compressor did not fill come back zeroed.
    pub fn decode_extent(&self, item: &FileExtentItem, out: &mut [u8]) -> Result<usize> {
        let algo = Algorithm::from_tag(item.compression).ok_or_else(|| {
            RimeError::UnsupportedFeature(format!("compression tag {}", item.compression))
        })?;

        match &item.payload {
            FileExtentPayload::Inline { data } => {
                let want = clamp_len(item.ram_bytes, out.len());
                if algo == Algorithm::None {
                    let n = data.len().min(want);
                    out[..n].copy_from_slice(&data[..n]);
                    out[n..want].fill(0);
                } else {
                    let inflated = self.inflate(algo, data, item.ram_bytes)?;
                    let n = inflated.len().min(want);
                    out[..n].copy_from_slice(&inflated[..n]);
                    out[n..want].fill(0);
                }
                Ok(want)
            }
            FileExtentPayload::Regular {
                disk_bytenr,
                disk_num_bytes,
                offset,
                num_bytes,
                prealloc,
            } => {
                let want = clamp_len(*num_bytes, out.len());
                if *disk_bytenr == 0 || *prealloc {
                    out[..want].fill(0);
                    return Ok(want);
                }
                if algo == Algorithm::None {
                    let start = disk_bytenr.checked_add(*offset).ok_or_else(|| {
                        RimeError::Decode("extent offset overflows its disk address".into())
                    })?;
                    self.read_data(Logical(start), &mut out[..want])?;
                    return Ok(want);
                }

                // the whole on-disk extent inflates to ram_bytes; the
                // file references [offset, offset + num_bytes) of it
                if *disk_num_bytes > MAX_COMPRESSED_EXTENT {
                    return Err(RimeError::Decode(
                        "compressed extent larger than the format allows".into(),
                    ));
                }
                let mut packed = vec![0_u8; clamp_len(*disk_num_bytes, usize::MAX)];
                self.read_data(Logical(*disk_bytenr), &mut packed)?;
                let inflated = self.inflate(algo, &packed, item.ram_bytes)?;

                let start = usize::try_from(*offset).map_err(|_| {
                    RimeError::Decode("extent offset exceeds the address space".into())
                })?;
                let avail = inflated.len().saturating_sub(start).min(want);
                if avail > 0 {
                    out[..avail].copy_from_slice(&inflated[start..start + avail]);
                }
                out[avail..want].fill(0);
                Ok(want)
            }
        }
    }

    /// Read raw data-chunk bytes, retrying alternate mirrors per mapped
    /// segment on read failure.
    pub fn read_data(&self, logical: Logical, out: &mut [u8]) -> Result<()> {
        let mut done = 0_usize;
        while done < out.len() {
            let at = Logical(logical.0 + done as u64);
            let remaining = (out.len() - done) as u64;
            let copies = self.volumes.copies_count(at, 1)?;

            let mut last_err: Option<RimeError> = None;
            let mut segment = 0_usize;
            for mirror in 1..=copies {
                match self.volumes.map_block(at, remaining, mirror) {
                    Ok(run) => {
                        let Some(handle) = run.device.handle.as_ref() else {
                            last_err = Some(RimeError::Io {
                                logical: at,
                                devid: run.device.devid,
                                mirror,
                                detail: "device not opened".into(),
                            });
                            continue;
                        };
                        let len = clamp_len(run.length, out.len() - done);
                        match handle.read_exact_at(run.physical.0, &mut out[done..done + len]) {
                            Ok(()) => {
                                segment = len;
                                break;
                            }
                            Err(err) => {
                                warn!(
                                    logical = at.0,
                                    mirror,
                                    error = %err,
                                    "data read failed, trying next copy"
                                );
                                last_err = Some(RimeError::Io {
                                    logical: at,
                                    devid: run.device.devid,
                                    mirror,
                                    detail: err.to_string(),
                                });
                            }
                        }
                    }
                    Err(err) if err.is_mirror_recoverable() => last_err = Some(err),
                    Err(err) => return Err(err),
                }
            }
            if segment == 0 {
                return Err(last_err.unwrap_or_else(|| {
                    RimeError::NotFound(format!("no mirrors available for logical {at}"))
                }));
            }
            done += segment;
        }
        Ok(())
    }

    fn inflate(&self, algo: Algorithm, packed: &[u8], ram_bytes: u64) -> Result<Vec<u8>> {
        if ram_bytes > MAX_COMPRESSED_EXTENT {
            return Err(RimeError::Decode(
                "decompressed extent size exceeds the format limit".into(),
            ));
        }
        let mut scratch = vec![0_u8; clamp_len(ram_bytes, usize::MAX)];
        let produced = decompress(algo, packed, self.sectorsize(), &mut scratch)?;
        if produced < scratch.len() {
            debug!(
                produced,
                expected = scratch.len(),
                "short decompression yield, tail stays zeroed"
            );
        }
        Ok(scratch)
    }
}

/// Clamp a 64-bit on-disk length into an in-memory span.
fn clamp_len(len: u64, cap: usize) -> usize {
    usize::try_from(len).unwrap_or(usize::MAX).min(cap)
}

fn read_superblock(handle: &dyn BlockRead) -> Result<Superblock> {
    let mut region = vec![0_u8; SUPERBLOCK_SIZE];
    handle
        .read_exact_at(SUPERBLOCK_OFFSET as u64, &mut region)
        .map_err(|err| RimeError::Io {
            logical: Logical(SUPERBLOCK_OFFSET as u64),
            devid: DeviceId(0),
            mirror: 0,
            detail: err.to_string(),
        })?;

    let sb = Superblock::parse_region(&region)?;
    if sb.csum_type != CSUM_TYPE_CRC32C {
        return Err(RimeError::UnsupportedFeature(format!(
            "superblock checksum type {}",
            sb.csum_type
        )));
    }
    let computed = crc32c::crc32c(&region[CSUM_FIELD_SIZE..]);
    let stored = u32::from_le_bytes([region[0], region[1], region[2], region[3]]);
    if computed != stored {
        return Err(RimeError::Checksum {
            logical: Logical(SUPERBLOCK_OFFSET as u64),
            mirror: 0,
        });
    }
    Ok(sb)
}

/// Visit every leaf item of `root` in key order.
fn walk_tree_leaves<F>(
    reader: &TreeReader,
    root: &TreeRoot,
    mode: ReadMode,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(&Key, &[u8]) -> Result<()>,
{
    let mut found = search(reader, root, &Key::MIN, 0, mode)?;
    loop {
        let Some(bottom) = found.path.bottom() else {
            return Ok(());
        };
        let block = Arc::clone(&bottom.block);
        for slot in bottom.slot..block.nritems() {
            let key = block.key(slot).ok_or_else(|| RimeError::Structural {
                logical: block.logical(),
                detail: format!("missing key at slot {slot}"),
            })?;
            visit(&key, block.item_data(slot)?)?;
        }
        if !next_leaf(reader, &mut found.path, mode)? {
            return Ok(());
        }
    }
}
