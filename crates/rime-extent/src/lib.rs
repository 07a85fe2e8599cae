#![forbid(unsafe_code)]
//! Interval cache and extent state tracking.
//!
//! [`IntervalCache`] is the ordered range index everything above it
//! builds on: the tree block cache keys decoded blocks by (address,
//! size), the chunk map keys mappings by logical start, and
//! [`ExtentStateTree`] marks byte ranges of the logical address space
//! with state bits. Ranges held by one cache never overlap; `insert`
//! enforces that contract instead of trusting callers.

pub mod state;

pub use state::{
    EXTENT_DEFECT, EXTENT_DIRTY, EXTENT_LOCKED, EXTENT_UPTODATE, ExtentStateTree,
};

use std::collections::BTreeMap;
use std::collections::btree_map;
use thiserror::Error;

/// A half-open byte range `[start, start + size)`, optionally grouped
/// under a leading object id.
///
/// Trees that do not group by object pass `objectid = 0` everywhere;
/// the ordering is then plain range order. Two intervals compare by
/// objectid first, then by range (an interval sorts before another when
/// its end is at or before the other's start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    pub objectid: u64,
    pub start: u64,
    pub size: u64,
}

impl Interval {
    #[must_use]
    pub const fn new(objectid: u64, start: u64, size: u64) -> Self {
        Self {
            objectid,
            start,
            size,
        }
    }

    /// Plain-mode constructor (no object grouping).
    #[must_use]
    pub const fn range(start: u64, size: u64) -> Self {
        Self::new(0, start, size)
    }

    /// Exclusive end of the range, saturating at the address-space top.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }

    /// True when `at` falls inside the range.
    #[must_use]
    pub fn contains(&self, at: u64) -> bool {
        at >= self.start && at < self.end()
    }

    /// True when the two ranges share at least one byte (same objectid).
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.objectid == other.objectid && self.start < other.end() && other.start < self.end()
    }
}

/// Errors from interval cache mutation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The new range overlaps an entry already in the cache.
    #[error(
        "range [{start}, +{size}) under object {objectid} overlaps an existing cache entry"
    )]
    AlreadyExists {
        objectid: u64,
        start: u64,
        size: u64,
    },
}

/// An ordered index of non-overlapping intervals, each owning a value.
///
/// Lookup answers "which entry covers this address", "which is the
/// nearest entry at or after it", and exact-bounds queries. Removal
/// detaches the entry and hands the value back to the caller.
#[derive(Debug, Clone)]
pub struct IntervalCache<V> {
    map: BTreeMap<(u64, u64), (u64, V)>,
}

impl<V> Default for IntervalCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> IntervalCache<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert a range. Fails when any stored range overlaps it.
    ///
    /// Zero-size ranges are rejected as overlapping nothing sensibly;
    /// the cache has no use for empty entries.
    pub fn insert(&mut self, interval: Interval, value: V) -> Result<(), CacheError> {
        let conflict = CacheError::AlreadyExists {
            objectid: interval.objectid,
            start: interval.start,
            size: interval.size,
        };

        if interval.size == 0 {
            return Err(conflict);
        }

        // Predecessor within the same objectid whose range may reach in.
        if let Some((iv, _)) = self.prev_at_or_before(interval.objectid, interval.start) {
            if iv.overlaps(&interval) {
                return Err(conflict);
            }
        }
        // First entry at or after the new start.
        if let Some((iv, _)) = self.next_at_or_after(interval.objectid, interval.start) {
            if iv.overlaps(&interval) {
                return Err(conflict);
            }
        }

        self.map.insert(
            (interval.objectid, interval.start),
            (interval.size, value),
        );
        Ok(())
    }

    /// Entry covering `at` under `objectid`, if any.
    #[must_use]
    pub fn get(&self, objectid: u64, at: u64) -> Option<(Interval, &V)> {
        let (iv, value) = self.prev_at_or_before(objectid, at)?;
        iv.contains(at).then_some((iv, value))
    }

    /// Mutable variant of [`Self::get`].
    pub fn get_mut(&mut self, objectid: u64, at: u64) -> Option<(Interval, &mut V)> {
        let iv = self.get(objectid, at).map(|(iv, _)| iv)?;
        let (_, value) = self.map.get_mut(&(iv.objectid, iv.start))?;
        Some((iv, value))
    }

    /// Entry covering `at`, or failing that the nearest entry whose
    /// start is at or after `at` (in full key order, so the "next" entry
    /// may belong to a later objectid).
    #[must_use]
    pub fn get_or_next(&self, objectid: u64, at: u64) -> Option<(Interval, &V)> {
        if let Some(hit) = self.get(objectid, at) {
            return Some(hit);
        }
        self.map
            .range((objectid, at)..)
            .next()
            .map(|(&(oid, start), &(size, ref value))| (Interval::new(oid, start, size), value))
    }

    /// Entry whose bounds equal the query exactly.
    #[must_use]
    pub fn get_exact(&self, objectid: u64, start: u64, size: u64) -> Option<&V> {
        match self.map.get(&(objectid, start)) {
            Some(&(stored, ref value)) if stored == size => Some(value),
            _ => None,
        }
    }

    /// Detach the entry starting exactly at (`objectid`, `start`),
    /// transferring ownership of the value to the caller.
    pub fn remove(&mut self, objectid: u64, start: u64) -> Option<(Interval, V)> {
        self.map
            .remove(&(objectid, start))
            .map(|(size, value)| (Interval::new(objectid, start, size), value))
    }

    /// Lowest entry in key order.
    #[must_use]
    pub fn first(&self) -> Option<(Interval, &V)> {
        self.map
            .iter()
            .next()
            .map(|(&(oid, start), &(size, ref value))| (Interval::new(oid, start, size), value))
    }

    /// Highest entry in key order.
    #[must_use]
    pub fn last(&self) -> Option<(Interval, &V)> {
        self.map
            .iter()
            .next_back()
            .map(|(&(oid, start), &(size, ref value))| (Interval::new(oid, start, size), value))
    }

    /// Next entry strictly after the entry starting at (`objectid`, `start`).
    #[must_use]
    pub fn next_after(&self, objectid: u64, start: u64) -> Option<(Interval, &V)> {
        self.map
            .range((
                std::ops::Bound::Excluded((objectid, start)),
                std::ops::Bound::Unbounded,
            ))
            .next()
            .map(|(&(oid, s), &(size, ref value))| (Interval::new(oid, s, size), value))
    }

    /// Previous entry strictly before the entry starting at (`objectid`, `start`).
    #[must_use]
    pub fn prev_before(&self, objectid: u64, start: u64) -> Option<(Interval, &V)> {
        self.map
            .range(..(objectid, start))
            .next_back()
            .map(|(&(oid, s), &(size, ref value))| (Interval::new(oid, s, size), value))
    }

    /// In-order iteration over all entries.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            inner: self.map.iter(),
        }
    }

    fn prev_at_or_before(&self, objectid: u64, at: u64) -> Option<(Interval, &V)> {
        self.map
            .range(..=(objectid, at))
            .next_back()
            .filter(|entry| entry.0.0 == objectid)
            .map(|(&(oid, start), &(size, ref value))| (Interval::new(oid, start, size), value))
    }

    fn next_at_or_after(&self, objectid: u64, at: u64) -> Option<(Interval, &V)> {
        self.map
            .range((objectid, at)..)
            .next()
            .filter(|entry| entry.0.0 == objectid)
            .map(|(&(oid, start), &(size, ref value))| (Interval::new(oid, start, size), value))
    }
}

/// In-order borrowing iterator over cache entries.
pub struct Iter<'a, V> {
    inner: btree_map::Iter<'a, (u64, u64), (u64, V)>,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (Interval, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .next()
            .map(|(&(oid, start), &(size, ref value))| (Interval::new(oid, start, size), value))
    }
}
