#![forbid(unsafe_code)]
//! Chunk and volume mapping: filesystem-logical addresses to physical
//! device offsets.
//!
//! The chunk map is learned twice at mount time: first from the
//! superblock's embedded bootstrap array (system chunks, required to
//! reach the chunk tree at all), then from the chunk tree itself.
//! Device items precede chunk items in chunk-tree key order, so every
//! stripe can resolve its owning [`DeviceRecord`] at insertion time; a
//! device that was never opened resolves to a placeholder record with
//! no read handle, degrading that chunk's usable mirror count.

use rime_error::{Result, RimeError};
use rime_extent::{Interval, IntervalCache};
use rime_ondisk::items::{ChunkItem, DevItem};
use rime_ondisk::parse_sys_chunk_array;
use rime_types::{
    BLOCK_GROUP_DUP, BLOCK_GROUP_PROFILE_MASK, BLOCK_GROUP_RAID0, BLOCK_GROUP_RAID1,
    BLOCK_GROUP_RAID1C3, BLOCK_GROUP_RAID1C4, BLOCK_GROUP_RAID5, BLOCK_GROUP_RAID6,
    BLOCK_GROUP_RAID10, BLOCK_GROUP_TYPE_MASK, CHUNK_ITEM_KEY, DeviceId, Generation, Key,
    Logical, Physical, STRIPE_LEN,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Raw synchronous read primitive over one device or partition.
///
/// A short read is an error; there is no partial-read tolerance.
pub trait BlockRead: Send + Sync {
    /// Total readable length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;
}

/// One member device of the filesystem.
pub struct DeviceRecord {
    pub devid: DeviceId,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub sector_size: u32,
    pub generation: Generation,
    pub uuid: [u8; 16],
    /// Read handle; `None` marks a device that was not opened.
    pub handle: Option<Arc<dyn BlockRead>>,
}

impl DeviceRecord {
    /// Placeholder for a device referenced by a stripe but never opened.
    #[must_use]
    pub fn placeholder(devid: DeviceId, uuid: [u8; 16]) -> Self {
        Self {
            devid,
            total_bytes: 0,
            bytes_used: 0,
            sector_size: 0,
            generation: Generation(0),
            uuid,
            handle: None,
        }
    }

    /// Build a record from a parsed device item and an optional handle.
    #[must_use]
    pub fn from_dev_item(item: &DevItem, handle: Option<Arc<dyn BlockRead>>) -> Self {
        Self {
            devid: DeviceId(item.devid),
            total_bytes: item.total_bytes,
            bytes_used: item.bytes_used,
            sector_size: item.sector_size,
            generation: Generation(item.generation),
            uuid: item.uuid,
            handle,
        }
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        self.handle.is_some()
    }
}

impl fmt::Debug for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRecord")
            .field("devid", &self.devid)
            .field("total_bytes", &self.total_bytes)
            .field("bytes_used", &self.bytes_used)
            .field("sector_size", &self.sector_size)
            .field("generation", &self.generation)
            .field("uuid", &self.uuid)
            .field("present", &self.is_present())
            .finish()
    }
}

/// One stripe of a mapped chunk.
#[derive(Debug, Clone)]
pub struct MappedStripe {
    pub device: Arc<DeviceRecord>,
    pub offset: u64,
}

/// An immutable chunk mapping: one logical range and its stripes.
///
/// Created once while the bootstrap array and chunk tree are parsed,
/// never mutated afterward.
#[derive(Debug, Clone)]
pub struct ChunkMapping {
    pub length: u64,
    pub stripe_len: u64,
    pub chunk_type: u64,
    pub num_stripes: u16,
    pub sub_stripes: u16,
    pub stripes: Vec<MappedStripe>,
}

impl ChunkMapping {
    #[must_use]
    pub fn profile(&self) -> u64 {
        self.chunk_type & BLOCK_GROUP_PROFILE_MASK
    }

    /// Independent full copies this chunk stores for any byte.
    #[must_use]
    pub fn copies(&self) -> u16 {
        match self.profile() {
            BLOCK_GROUP_DUP | BLOCK_GROUP_RAID1 => 2,
            BLOCK_GROUP_RAID1C3 => 3,
            BLOCK_GROUP_RAID1C4 => 4,
            BLOCK_GROUP_RAID10 => self.sub_stripes.max(1),
            // RAID5/6 parity is not an independent copy for plain reads.
            _ => 1,
        }
    }

    #[must_use]
    pub fn parity_stripes(&self) -> u16 {
        match self.profile() {
            BLOCK_GROUP_RAID5 => 1,
            BLOCK_GROUP_RAID6 => 2,
            _ => 0,
        }
    }
}

/// One physical read segment produced by [`VolumeMap::map_block`].
///
/// `length` never crosses a stripe boundary; callers loop for longer
/// ranges.
#[derive(Debug, Clone)]
pub struct MappedRun {
    pub device: Arc<DeviceRecord>,
    pub physical: Physical,
    pub length: u64,
}

/// The logical-to-physical translation layer.
#[derive(Debug, Clone, Default)]
pub struct VolumeMap {
    devices: BTreeMap<u64, Arc<DeviceRecord>>,
    chunks: IntervalCache<ChunkMapping>,
}

impl VolumeMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            chunks: IntervalCache::new(),
        }
    }

    /// Register an opened read handle for a device id.
    ///
    /// Called before any chunk is inserted; metadata is filled in later
    /// when the device item is seen.
    pub fn attach_handle(&mut self, devid: DeviceId, handle: Arc<dyn BlockRead>) {
        let mut record = DeviceRecord::placeholder(devid, [0; 16]);
        record.handle = Some(handle);
        self.devices.insert(devid.0, Arc::new(record));
    }

    /// Merge a parsed device item into the registry, keeping any handle
    /// already attached under that devid.
    pub fn register_device(&mut self, item: &DevItem) {
        let handle = self
            .devices
            .get(&item.devid)
            .and_then(|record| record.handle.clone());
        if handle.is_none() {
            debug!(devid = item.devid, "device item without opened handle");
        }
        self.devices
            .insert(item.devid, Arc::new(DeviceRecord::from_dev_item(item, handle)));
    }

    /// The record for `devid`, if registered.
    #[must_use]
    pub fn device(&self, devid: DeviceId) -> Option<Arc<DeviceRecord>> {
        self.devices.get(&devid.0).cloned()
    }

    /// Number of registered devices (placeholders included).
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn device_or_placeholder(&mut self, devid: u64, uuid: [u8; 16]) -> Arc<DeviceRecord> {
        if let Some(record) = self.devices.get(&devid) {
            return Arc::clone(record);
        }
        warn!(devid, "stripe references unopened device, degrading mirrors");
        let record = Arc::new(DeviceRecord::placeholder(DeviceId(devid), uuid));
        self.devices.insert(devid, Arc::clone(&record));
        record
    }

    /// Validate and insert one chunk item keyed by its logical start.
    ///
    /// An exact duplicate of an existing mapping (system chunks appear
    /// both in the bootstrap array and in the chunk tree) is skipped;
    /// any other overlap is structural corruption.
    pub fn insert_chunk(&mut self, key: &Key, item: &ChunkItem) -> Result<()> {
        let logical = Logical(key.offset);
        validate_chunk(logical, item)?;

        if self.chunks.get_exact(0, key.offset, item.length).is_some() {
            trace!(logical = key.offset, "duplicate chunk mapping skipped");
            return Ok(());
        }

        let stripes = item
            .stripes
            .iter()
            .map(|stripe| MappedStripe {
                device: self.device_or_placeholder(stripe.devid, stripe.dev_uuid),
                offset: stripe.offset,
            })
            .collect();

        let mapping = ChunkMapping {
            length: item.length,
            stripe_len: item.stripe_len,
            chunk_type: item.chunk_type,
            num_stripes: item.num_stripes,
            sub_stripes: item.sub_stripes,
            stripes,
        };

        debug!(
            logical = key.offset,
            length = item.length,
            profile = format_args!("{:#x}", mapping.profile()),
            stripes = item.num_stripes,
            "chunk mapping inserted"
        );
        self.chunks
            .insert(Interval::range(key.offset, item.length), mapping)
            .map_err(|_| RimeError::Structural {
                logical,
                detail: "chunk range overlaps an existing chunk".into(),
            })
    }

    /// Learn the bootstrap system chunks from the superblock array.
    ///
    /// A chunk that fails validation is skipped with a warning; the scan
    /// continues, matching the loader's mount behavior.
    pub fn bootstrap_system_chunks(&mut self, sys_chunk_array: &[u8]) -> Result<usize> {
        let entries = parse_sys_chunk_array(sys_chunk_array)?;
        let mut inserted = 0_usize;
        for (key, item) in &entries {
            if key.item_type != CHUNK_ITEM_KEY {
                warn!(
                    objectid = key.objectid,
                    item_type = key.item_type,
                    "unexpected key in sys chunk array, skipping"
                );
                continue;
            }
            match self.insert_chunk(key, item) {
                Ok(()) => inserted += 1,
                Err(err) => warn!(
                    logical = key.offset,
                    error = %err,
                    "bad bootstrap chunk skipped"
                ),
            }
        }
        Ok(inserted)
    }

    /// The chunk covering `logical`, if any.
    #[must_use]
    pub fn chunk_at(&self, logical: Logical) -> Option<(Logical, &ChunkMapping)> {
        self.chunks
            .get(0, logical.0)
            .map(|(iv, mapping)| (Logical(iv.start), mapping))
    }

    /// Stripe length of the chunk covering `logical`.
    pub fn stripe_length(&self, logical: Logical) -> Result<u64> {
        self.chunk_at(logical)
            .map(|(_, mapping)| mapping.stripe_len)
            .ok_or_else(|| no_chunk(logical))
    }

    /// How many independent copies exist for this byte range.
    pub fn copies_count(&self, logical: Logical, length: u64) -> Result<u16> {
        let (start, mapping) = self.chunk_at(logical).ok_or_else(|| no_chunk(logical))?;
        let chunk_end = start.0.saturating_add(mapping.length);
        if logical.0.saturating_add(length) > chunk_end {
            return Err(RimeError::Structural {
                logical,
                detail: "range crosses a chunk boundary".into(),
            });
        }
        Ok(mapping.copies())
    }

    /// First block group starting at or after `logical` whose type
    /// matches any of `type_bits` (data / system / metadata). Returns
    /// (start, size).
    #[must_use]
    pub fn next_block_group(&self, logical: Logical, type_bits: u64) -> Option<(Logical, u64)> {
        let mut at = logical.0;
        loop {
            let (iv, mapping) = self.chunks.get_or_next(0, at)?;
            if iv.start >= at && mapping.chunk_type & BLOCK_GROUP_TYPE_MASK & type_bits != 0 {
                return Some((Logical(iv.start), iv.size));
            }
            if iv.end() <= at {
                return None;
            }
            at = iv.end();
        }
    }

    /// Map one logical range to a physical read segment on mirror
    /// `mirror` (1-based).
    ///
    /// The returned segment never crosses a stripe boundary, so its
    /// length may be shorter than requested. Parity profiles map only
    /// the data stripe; asking for a redundant copy of them reports the
    /// missing reconstruction capability.
    pub fn map_block(&self, logical: Logical, length: u64, mirror: u16) -> Result<MappedRun> {
        if mirror == 0 {
            return Err(RimeError::Structural {
                logical,
                detail: "mirror index is 1-based".into(),
            });
        }
        let (start, mapping) = self.chunk_at(logical).ok_or_else(|| no_chunk(logical))?;
        let off = logical.0 - start.0;
        let in_chunk = mapping.length - off;

        let profile = mapping.profile();
        let (stripen, stripe_offset, boundary) = match profile {
            0 | BLOCK_GROUP_DUP | BLOCK_GROUP_RAID1 | BLOCK_GROUP_RAID1C3
            | BLOCK_GROUP_RAID1C4 => {
                // Each stripe is a full copy; the mirror picks which one.
                if mirror > mapping.copies() {
                    return Err(RimeError::Structural {
                        logical,
                        detail: "mirror index exceeds copy count".into(),
                    });
                }
                (u64::from(mirror - 1), off, in_chunk)
            }
            BLOCK_GROUP_RAID0 => {
                let stripe_nr = off / mapping.stripe_len;
                let stripen = stripe_nr % u64::from(mapping.num_stripes);
                let high = stripe_nr / u64::from(mapping.num_stripes);
                let within = off % mapping.stripe_len;
                (
                    stripen,
                    high * mapping.stripe_len + within,
                    mapping.stripe_len - within,
                )
            }
            BLOCK_GROUP_RAID10 => {
                let groups = u64::from(mapping.num_stripes / mapping.sub_stripes.max(1));
                if mirror > mapping.sub_stripes {
                    return Err(RimeError::Structural {
                        logical,
                        detail: "mirror index exceeds sub-stripe count".into(),
                    });
                }
                let stripe_nr = off / mapping.stripe_len;
                let group = stripe_nr % groups;
                let high = stripe_nr / groups;
                let within = off % mapping.stripe_len;
                (
                    group * u64::from(mapping.sub_stripes) + u64::from(mirror - 1),
                    high * mapping.stripe_len + within,
                    mapping.stripe_len - within,
                )
            }
            BLOCK_GROUP_RAID5 | BLOCK_GROUP_RAID6 => {
                if mirror > 1 {
                    return Err(RimeError::UnsupportedLayout(format!(
                        "parity reconstruction requested at logical {logical}"
                    )));
                }
                let data_stripes =
                    u64::from(mapping.num_stripes - mapping.parity_stripes());
                let stripe_nr = off / mapping.stripe_len;
                let high = stripe_nr / data_stripes;
                // Data stripes rotate by one position each row so parity
                // is distributed across all devices.
                let stripen =
                    (stripe_nr % data_stripes + high) % u64::from(mapping.num_stripes);
                let within = off % mapping.stripe_len;
                (
                    stripen,
                    high * mapping.stripe_len + within,
                    mapping.stripe_len - within,
                )
            }
            _ => {
                return Err(RimeError::UnsupportedLayout(format!(
                    "unknown chunk profile {profile:#x}"
                )));
            }
        };

        let index = usize::try_from(stripen).map_err(|_| RimeError::Structural {
            logical,
            detail: "stripe index overflow".into(),
        })?;
        let stripe = mapping.stripes.get(index).ok_or_else(|| RimeError::Structural {
            logical,
            detail: "stripe index out of range".into(),
        })?;

        if mapping.parity_stripes() > 0 && !stripe.device.is_present() {
            return Err(RimeError::UnsupportedLayout(format!(
                "degraded parity read at logical {logical} requires reconstruction"
            )));
        }

        let physical =
            stripe
                .offset
                .checked_add(stripe_offset)
                .ok_or_else(|| RimeError::Structural {
                    logical,
                    detail: "physical offset overflow".into(),
                })?;

        Ok(MappedRun {
            device: Arc::clone(&stripe.device),
            physical: Physical(physical),
            length: length.min(boundary).min(in_chunk),
        })
    }
}

fn no_chunk(logical: Logical) -> RimeError {
    RimeError::NotFound(format!("no chunk covers logical {logical}"))
}

/// Structural validation of a chunk item before it enters the map.
fn validate_chunk(logical: Logical, item: &ChunkItem) -> Result<()> {
    let fail = |detail: &str| {
        Err(RimeError::Structural {
            logical,
            detail: detail.into(),
        })
    };

    if item.length == 0 {
        return fail("chunk length is zero");
    }
    if item.stripe_len != STRIPE_LEN {
        return fail("stripe length differs from the fixed 64K constant");
    }
    if usize::from(item.num_stripes) != item.stripes.len() {
        return fail("stripe array length disagrees with num_stripes");
    }

    let profile = item.chunk_type & BLOCK_GROUP_PROFILE_MASK;
    if profile.count_ones() > 1 {
        return fail("profile bits are not mutually exclusive");
    }

    let min_stripes: u16 = match profile {
        0 => 1,
        BLOCK_GROUP_RAID0 => 1,
        BLOCK_GROUP_DUP | BLOCK_GROUP_RAID1 => 2,
        BLOCK_GROUP_RAID1C3 => 3,
        BLOCK_GROUP_RAID1C4 => 4,
        BLOCK_GROUP_RAID10 => 4,
        BLOCK_GROUP_RAID5 => 2,
        BLOCK_GROUP_RAID6 => 3,
        _ => return fail("unknown profile bit"),
    };
    if item.num_stripes < min_stripes {
        return fail("stripe count below profile minimum");
    }

    if profile == BLOCK_GROUP_RAID10 {
        if item.sub_stripes != 2 {
            return fail("striped-mirror profile requires sub_stripes == 2");
        }
        if item.num_stripes % item.sub_stripes != 0 {
            return fail("stripe count not divisible by sub-stripe count");
        }
    } else if item.sub_stripes > 1 {
        return fail("sub_stripes set on a non-striped-mirror profile");
    }

    Ok(())
}
