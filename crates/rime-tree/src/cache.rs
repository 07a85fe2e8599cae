//! The tree block cache.
//!
//! Decoded blocks are shared as `Arc<TreeBlock>`: the cache holds one
//! reference until eviction, every `Path` and caller holds its own, and
//! the block is freed when the last reference drops. The interior sits
//! behind a mutex so the cache can be shared in a multi-threaded host;
//! the engine itself never needs more than one caller.

use crate::block::TreeBlock;
use parking_lot::Mutex;
use rime_extent::{EXTENT_DEFECT, EXTENT_UPTODATE, ExtentStateTree, Interval, IntervalCache};
use rime_types::Logical;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default)]
struct CacheInner {
    blocks: IntervalCache<Arc<TreeBlock>>,
    /// UPTODATE marks validated resident ranges; DEFECT marks addresses
    /// whose last strict read only produced a generation-mismatched copy.
    state: ExtentStateTree,
}

/// Process-wide (per filesystem context) cache of validated tree blocks.
#[derive(Debug, Default)]
pub struct BlockCache {
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// A cached, validated block covering exactly this address.
    #[must_use]
    pub fn get(&self, logical: Logical, nodesize: u32) -> Option<Arc<TreeBlock>> {
        let inner = self.inner.lock();
        let end = logical.0.checked_add(u64::from(nodesize))?;
        if !inner.state.test_bits(logical.0, end, EXTENT_UPTODATE) {
            return None;
        }
        inner
            .blocks
            .get_exact(0, logical.0, u64::from(nodesize))
            .cloned()
    }

    /// Insert a validated block, marking its range uptodate.
    ///
    /// Succeeds silently when the exact block is already resident; an
    /// overlapping differently-sized resident range is evicted first
    /// (a read-only tree never legitimately produces one).
    pub fn insert(&self, logical: Logical, nodesize: u32, block: Arc<TreeBlock>) {
        let size = u64::from(nodesize);
        let mut inner = self.inner.lock();
        if inner.blocks.get_exact(0, logical.0, size).is_some() {
            return;
        }
        if let Some((iv, _)) = inner.blocks.get(0, logical.0) {
            trace!(logical = logical.0, "evicting overlapping cache entry");
            inner.blocks.remove(0, iv.start);
            inner.state.clear_bits(iv.start, iv.end(), EXTENT_UPTODATE | EXTENT_DEFECT);
        }
        if inner
            .blocks
            .insert(Interval::range(logical.0, size), block)
            .is_ok()
        {
            inner.state.clear_bits(logical.0, logical.0 + size, EXTENT_DEFECT);
            inner.state.set_bits(logical.0, logical.0 + size, EXTENT_UPTODATE);
        }
    }

    /// Drop the entry at `logical`, clearing its state bits.
    ///
    /// Callers still holding an `Arc` keep their block; the cache just
    /// stops handing it out.
    pub fn evict(&self, logical: Logical) -> bool {
        let mut inner = self.inner.lock();
        match inner.blocks.remove(0, logical.0) {
            Some((iv, _)) => {
                inner
                    .state
                    .clear_bits(iv.start, iv.end(), EXTENT_UPTODATE | EXTENT_DEFECT);
                true
            }
            None => false,
        }
    }

    /// Remember that `logical` only yielded a generation-mismatched copy.
    pub fn mark_defect(&self, logical: Logical, nodesize: u32) {
        let mut inner = self.inner.lock();
        inner
            .state
            .set_bits(logical.0, logical.0 + u64::from(nodesize), EXTENT_DEFECT);
    }

    /// True when the last strict read of `logical` fell back to a
    /// mismatched copy.
    #[must_use]
    pub fn is_defect(&self, logical: Logical, nodesize: u32) -> bool {
        let inner = self.inner.lock();
        inner
            .state
            .test_bits(logical.0, logical.0 + u64::from(nodesize), EXTENT_DEFECT)
    }

    /// Number of resident blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry (filesystem context teardown).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        *inner = CacheInner::default();
    }
}
