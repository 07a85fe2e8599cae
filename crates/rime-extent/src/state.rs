//! Byte-range state tracking over the logical address space.
//!
//! Ranges carry a bit mask; adjacent ranges with identical masks (and
//! identical private values) coalesce, partial updates split, and an
//! entry whose mask drops to zero is destroyed. The tree block cache
//! uses this to remember which metadata ranges are resident and
//! validated.

use crate::{Interval, IntervalCache};
use tracing::trace;

pub const EXTENT_DIRTY: u32 = 1 << 0;
pub const EXTENT_UPTODATE: u32 = 1 << 1;
pub const EXTENT_LOCKED: u32 = 1 << 2;
pub const EXTENT_DEFECT: u32 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateEntry {
    bits: u32,
    /// Opaque per-range value for the owner's bookkeeping.
    private: Option<u64>,
}

/// State-bit index over half-open byte ranges.
#[derive(Debug, Clone, Default)]
pub struct ExtentStateTree {
    cache: IntervalCache<StateEntry>,
}

impl ExtentStateTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cache: IntervalCache::new(),
        }
    }

    /// Number of distinct ranges currently tracked.
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.cache.len()
    }

    /// Set `bits` on every byte of `[start, end)`.
    ///
    /// Uncovered gaps get fresh entries carrying exactly `bits`; covered
    /// sub-ranges keep their existing bits plus `bits`, splitting at the
    /// update boundaries. Adjacent equal-state ranges are merged.
    pub fn set_bits(&mut self, start: u64, end: u64, bits: u32) {
        if start >= end || bits == 0 {
            return;
        }
        trace!(start, end, bits, "extent_state set");
        self.apply(start, end, |entry| {
            let mut next = entry.unwrap_or(StateEntry {
                bits: 0,
                private: None,
            });
            next.bits |= bits;
            Some(next)
        });
    }

    /// Clear `bits` from every byte of `[start, end)`.
    ///
    /// Ranges whose mask reaches zero are destroyed; uncovered bytes are
    /// untouched.
    pub fn clear_bits(&mut self, start: u64, end: u64, bits: u32) {
        if start >= end || bits == 0 {
            return;
        }
        trace!(start, end, bits, "extent_state clear");
        self.apply(start, end, |entry| {
            let mut next = entry?;
            next.bits &= !bits;
            (next.bits != 0).then_some(next)
        });
    }

    /// True when every byte of `[start, end)` carries all of `bits`.
    #[must_use]
    pub fn test_bits(&self, start: u64, end: u64, bits: u32) -> bool {
        if start >= end || bits == 0 {
            return false;
        }
        let mut cursor = start;
        while cursor < end {
            let Some((iv, entry)) = self.cache.get(0, cursor) else {
                return false;
            };
            if entry.bits & bits != bits {
                return false;
            }
            cursor = iv.end();
        }
        true
    }

    /// First range (in address order) carrying all of `bits`.
    #[must_use]
    pub fn find_first(&self, bits: u32) -> Option<Interval> {
        self.cache
            .iter()
            .find(|(_, entry)| entry.bits & bits == bits)
            .map(|(iv, _)| iv)
    }

    /// Attach an opaque value to the range covering `at`.
    ///
    /// Returns false when no range covers `at`.
    pub fn set_private(&mut self, at: u64, value: u64) -> bool {
        match self.cache.get_mut(0, at) {
            Some((_, entry)) => {
                entry.private = Some(value);
                true
            }
            None => false,
        }
    }

    /// The opaque value attached to the range covering `at`.
    #[must_use]
    pub fn get_private(&self, at: u64) -> Option<u64> {
        self.cache.get(0, at).and_then(|(_, entry)| entry.private)
    }

    /// Rewrite `[start, end)` through `update`, splitting boundary
    /// entries, then re-merge around the touched window.
    fn apply<F>(&mut self, start: u64, end: u64, update: F)
    where
        F: Fn(Option<StateEntry>) -> Option<StateEntry>,
    {
        // Detach every entry intersecting the window, including one
        // reaching in from below.
        let mut detached: Vec<(Interval, StateEntry)> = Vec::new();
        if let Some((iv, _)) = self.cache.get(0, start) {
            if let Some(removed) = self.cache.remove(0, iv.start) {
                detached.push(removed);
            }
        }
        while let Some((iv, _)) = self.cache.get_or_next(0, start) {
            if iv.start >= end {
                break;
            }
            match self.cache.remove(0, iv.start) {
                Some(removed) => detached.push(removed),
                None => break,
            }
        }

        // Rebuild: left remainders keep their old state, the covered
        // window goes through `update` (existing pieces and gaps alike),
        // right remainders keep their old state.
        let mut rebuilt: Vec<(u64, u64, StateEntry)> = Vec::new();
        let mut push = |s: u64, e: u64, entry: Option<StateEntry>| {
            if s < e {
                if let Some(entry) = entry {
                    rebuilt.push((s, e, entry));
                }
            }
        };

        let mut cursor = start;
        for (iv, entry) in detached {
            let (es, ee) = (iv.start, iv.end());
            if es < start {
                push(es, start, Some(entry));
            }
            if cursor < es {
                // gap inside the window
                push(cursor, es.min(end), update(None));
            }
            let mid_start = es.max(start);
            let mid_end = ee.min(end);
            push(mid_start, mid_end, update(Some(entry)));
            if ee > end {
                push(end, ee, Some(entry));
            }
            cursor = mid_end.max(cursor);
        }
        if cursor < end {
            push(cursor, end, update(None));
        }

        // Merge adjacent equal-state pieces before reinserting.
        rebuilt.sort_unstable_by_key(|&(s, _, _)| s);
        let mut merged: Vec<(u64, u64, StateEntry)> = Vec::new();
        for piece in rebuilt {
            match merged.last_mut() {
                Some(last) if last.1 == piece.0 && last.2 == piece.2 => last.1 = piece.1,
                _ => merged.push(piece),
            }
        }

        for (s, e, entry) in merged {
            let inserted = self.cache.insert(Interval::range(s, e - s), entry);
            debug_assert!(inserted.is_ok(), "rebuilt ranges must be disjoint");
        }

        // Coalesce with untouched neighbors on both sides of the window.
        self.merge_at(start);
        self.merge_at(end);
    }

    /// Merge the entry ending at `boundary` with the one starting there,
    /// when both exist and carry identical state.
    fn merge_at(&mut self, boundary: u64) {
        if boundary == 0 {
            return;
        }
        let Some((left, left_entry)) = self.cache.get(0, boundary - 1) else {
            return;
        };
        if left.end() != boundary {
            return;
        }
        let Some((right, right_entry)) = self.cache.get(0, boundary) else {
            return;
        };
        if right.start != boundary || left_entry != right_entry {
            return;
        }
        let Some((left, entry)) = self.cache.remove(0, left.start) else {
            return;
        };
        let Some((right, _)) = self.cache.remove(0, right.start) else {
            return;
        };
        let inserted = self
            .cache
            .insert(Interval::range(left.start, left.size + right.size), entry);
        debug_assert!(inserted.is_ok(), "merged range must be free");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl ExtentStateTree {
        fn next_range_at(&self, at: u64) -> Option<Interval> {
            self.cache.get_or_next(0, at).map(|(iv, _)| iv)
        }
    }

    fn ranges(tree: &ExtentStateTree) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        let mut probe = 0_u64;
        while let Some(iv) = tree.next_range_at(probe) {
            out.push((iv.start, iv.end()));
            probe = iv.end();
        }
        out
    }

    #[test]
    fn merge_idempotence() {
        let mut tree = ExtentStateTree::new();
        tree.set_bits(0, 10, EXTENT_DIRTY);
        tree.set_bits(10, 20, EXTENT_DIRTY);
        tree.set_bits(20, 30, EXTENT_DIRTY);

        assert_eq!(tree.range_count(), 1);
        assert_eq!(ranges(&tree), vec![(0, 30)]);
        assert!(tree.test_bits(0, 30, EXTENT_DIRTY));

        // re-applying the coalesced range changes nothing
        tree.set_bits(0, 30, EXTENT_DIRTY);
        assert_eq!(tree.range_count(), 1);
        assert_eq!(ranges(&tree), vec![(0, 30)]);
    }

    #[test]
    fn different_bits_do_not_merge() {
        let mut tree = ExtentStateTree::new();
        tree.set_bits(0, 10, EXTENT_DIRTY);
        tree.set_bits(10, 20, EXTENT_UPTODATE);
        assert_eq!(tree.range_count(), 2);
    }

    #[test]
    fn partial_set_splits() {
        let mut tree = ExtentStateTree::new();
        tree.set_bits(0, 30, EXTENT_DIRTY);
        tree.set_bits(10, 20, EXTENT_UPTODATE);

        assert_eq!(tree.range_count(), 3);
        assert!(tree.test_bits(0, 30, EXTENT_DIRTY));
        assert!(tree.test_bits(10, 20, EXTENT_UPTODATE));
        assert!(!tree.test_bits(0, 30, EXTENT_UPTODATE));
        assert!(!tree.test_bits(9, 11, EXTENT_UPTODATE));
    }

    #[test]
    fn clear_destroys_zero_mask() {
        let mut tree = ExtentStateTree::new();
        tree.set_bits(0, 30, EXTENT_DIRTY);
        tree.clear_bits(10, 20, EXTENT_DIRTY);

        assert_eq!(ranges(&tree), vec![(0, 10), (20, 30)]);
        assert!(!tree.test_bits(0, 30, EXTENT_DIRTY));
        assert!(tree.test_bits(0, 10, EXTENT_DIRTY));
        assert!(tree.test_bits(20, 30, EXTENT_DIRTY));

        tree.clear_bits(0, 30, EXTENT_DIRTY);
        assert_eq!(tree.range_count(), 0);
    }

    #[test]
    fn clear_single_bit_keeps_remainder() {
        let mut tree = ExtentStateTree::new();
        tree.set_bits(0, 10, EXTENT_DIRTY | EXTENT_UPTODATE);
        tree.clear_bits(0, 10, EXTENT_DIRTY);
        assert_eq!(tree.range_count(), 1);
        assert!(tree.test_bits(0, 10, EXTENT_UPTODATE));
        assert!(!tree.test_bits(0, 10, EXTENT_DIRTY));
    }

    #[test]
    fn set_over_gap_fills_it() {
        let mut tree = ExtentStateTree::new();
        tree.set_bits(0, 10, EXTENT_DIRTY);
        tree.set_bits(20, 30, EXTENT_DIRTY);
        assert_eq!(tree.range_count(), 2);
        assert!(!tree.test_bits(0, 30, EXTENT_DIRTY));

        tree.set_bits(5, 25, EXTENT_DIRTY);
        assert_eq!(ranges(&tree), vec![(0, 30)]);
        assert!(tree.test_bits(0, 30, EXTENT_DIRTY));
    }

    #[test]
    fn test_bits_needs_full_coverage() {
        let mut tree = ExtentStateTree::new();
        tree.set_bits(0, 10, EXTENT_UPTODATE);
        assert!(tree.test_bits(0, 10, EXTENT_UPTODATE));
        assert!(!tree.test_bits(0, 11, EXTENT_UPTODATE));
        assert!(!tree.test_bits(0, 10, EXTENT_UPTODATE | EXTENT_DIRTY));
        // empty and zero-bit queries are vacuously false
        assert!(!tree.test_bits(5, 5, EXTENT_UPTODATE));
        assert!(!tree.test_bits(0, 10, 0));
    }

    #[test]
    fn find_first_filters_by_bits() {
        let mut tree = ExtentStateTree::new();
        tree.set_bits(100, 110, EXTENT_DIRTY);
        tree.set_bits(50, 60, EXTENT_UPTODATE);
        assert_eq!(
            tree.find_first(EXTENT_DIRTY),
            Some(Interval::range(100, 10))
        );
        assert_eq!(
            tree.find_first(EXTENT_UPTODATE),
            Some(Interval::range(50, 10))
        );
        assert_eq!(tree.find_first(EXTENT_LOCKED), None);
    }

    #[test]
    fn private_survives_split_not_merge() {
        let mut tree = ExtentStateTree::new();
        tree.set_bits(0, 30, EXTENT_UPTODATE);
        assert!(tree.set_private(5, 0xABCD));
        assert_eq!(tree.get_private(25), Some(0xABCD));

        // splitting copies the private value to both halves
        tree.set_bits(10, 20, EXTENT_DIRTY);
        assert_eq!(tree.get_private(5), Some(0xABCD));
        assert_eq!(tree.get_private(15), Some(0xABCD));

        // a neighbor with a different private value does not merge in
        tree.set_bits(30, 40, EXTENT_UPTODATE);
        assert_eq!(tree.get_private(35), None);
        assert_eq!(tree.next_range_at(30), Some(Interval::range(30, 10)));
        assert!(!tree.set_private(100, 1));
    }
}
