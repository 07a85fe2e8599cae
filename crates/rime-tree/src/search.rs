//! Keyed search and ordered navigation over rooted trees.
//!
//! A search walks from the root toward `lowest_level`, binary-searching
//! each block's key array and descending through validated child
//! pointers. Leaves carry no sibling links, so [`next_leaf`] and
//! [`prev_leaf`] re-ascend to the nearest ancestor with an unvisited
//! slot and re-descend from there.

use crate::block::TreeBlock;
use crate::io::{ReadMode, TreeReader};
use rime_error::{Result, RimeError};
use rime_types::{Generation, Key, Logical};
use std::sync::Arc;
use tracing::trace;

/// Location and expected identity of a tree's root block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub logical: Logical,
    pub level: u8,
    pub generation: Generation,
}

impl TreeRoot {
    #[must_use]
    pub const fn new(logical: Logical, level: u8, generation: Generation) -> Self {
        Self {
            logical,
            level,
            generation,
        }
    }
}

/// One visited level: the block and the chosen slot within it.
#[derive(Debug, Clone)]
pub struct PathLevel {
    pub block: Arc<TreeBlock>,
    pub slot: usize,
}

/// The blocks a search visited, root first, lowest level last.
///
/// Every level holds its own reference; the blocks stay alive for as
/// long as the path does, independent of cache eviction.
#[derive(Debug, Clone, Default)]
pub struct Path {
    levels: Vec<PathLevel>,
}

impl Path {
    #[must_use]
    pub fn levels(&self) -> &[PathLevel] {
        &self.levels
    }

    /// The lowest level reached (the leaf, for a full descent).
    #[must_use]
    pub fn bottom(&self) -> Option<&PathLevel> {
        self.levels.last()
    }

    /// The leaf block, when the path descended all the way down.
    #[must_use]
    pub fn leaf(&self) -> Option<&Arc<TreeBlock>> {
        self.levels
            .last()
            .filter(|level| level.block.is_leaf())
            .map(|level| &level.block)
    }

    /// Slot in the leaf: the match on an exact hit, the insertion point
    /// otherwise.
    #[must_use]
    pub fn leaf_slot(&self) -> Option<usize> {
        self.levels
            .last()
            .filter(|level| level.block.is_leaf())
            .map(|level| level.slot)
    }
}

/// Search outcome: the visited path plus whether the key was found.
#[derive(Debug, Clone)]
pub struct Search {
    pub path: Path,
    pub exact: bool,
}

/// Walk from `root` toward `lowest_level` looking for `key`.
///
/// At internal levels an inexact hit descends into the predecessor
/// child (clamped to the first), because a node's key is the minimum of
/// its subtree. At the bottom level an inexact hit leaves the slot at
/// the point where `key` would be inserted, which may be one past the
/// last item. Any block failing validation aborts the whole search.
pub fn search(
    reader: &TreeReader,
    root: &TreeRoot,
    key: &Key,
    lowest_level: u8,
    mode: ReadMode,
) -> Result<Search> {
    if lowest_level > root.level {
        return Err(RimeError::Structural {
            logical: root.logical,
            detail: "target level above the tree root".into(),
        });
    }

    let mut block = reader.read_block(root.logical, Some(root.generation), mode)?;
    if block.level() != root.level {
        return Err(RimeError::Structural {
            logical: root.logical,
            detail: "root level differs from its referencing pointer".into(),
        });
    }

    trace!(
        root = root.logical.0,
        key = %key,
        lowest_level,
        "tree search"
    );

    let mut path = Path::default();
    loop {
        let level = block.level();
        let (slot, exact) = match block.search_slot(key) {
            Ok(slot) => (slot, true),
            Err(insertion) => (insertion, false),
        };

        if level == lowest_level {
            path.levels.push(PathLevel { block, slot });
            return Ok(Search { path, exact });
        }

        // a node key is the minimum key of its subtree, so an inexact
        // hit belongs to the predecessor child
        let slot = if exact { slot } else { slot.saturating_sub(1) };
        let ptr = *block.key_ptr(slot).ok_or_else(|| RimeError::Structural {
            logical: block.logical(),
            detail: format!("no child pointer at slot {slot}"),
        })?;
        path.levels.push(PathLevel { block, slot });

        let child = reader.read_block(
            Logical(ptr.blockptr),
            Some(Generation(ptr.generation)),
            mode,
        )?;
        if child.level() + 1 != level {
            return Err(RimeError::Structural {
                logical: Logical(ptr.blockptr),
                detail: format!(
                    "child level {} under a level {} node",
                    child.level(),
                    level
                ),
            });
        }
        block = child;
    }
}

/// Advance the path to the next block at its bottom level, positioned at
/// slot 0. Returns `false` when the path is already at the last block.
pub fn next_leaf(reader: &TreeReader, path: &mut Path, mode: ReadMode) -> Result<bool> {
    let Some(bottom_level) = path.bottom().map(|level| level.block.level()) else {
        return Ok(false);
    };

    // lowest ancestor that still has a following sibling slot
    let Some(pivot) = (0..path.levels.len().saturating_sub(1))
        .rev()
        .find(|&i| path.levels[i].slot + 1 < path.levels[i].block.nritems())
    else {
        return Ok(false);
    };

    path.levels.truncate(pivot + 1);
    path.levels[pivot].slot += 1;
    descend_edge(reader, path, bottom_level, mode, Edge::First)?;
    Ok(true)
}

/// Move the path to the previous block at its bottom level, positioned
/// at its last slot. Returns `false` at the first block.
pub fn prev_leaf(reader: &TreeReader, path: &mut Path, mode: ReadMode) -> Result<bool> {
    let Some(bottom_level) = path.bottom().map(|level| level.block.level()) else {
        return Ok(false);
    };

    let Some(pivot) = (0..path.levels.len().saturating_sub(1))
        .rev()
        .find(|&i| path.levels[i].slot > 0)
    else {
        return Ok(false);
    };

    path.levels.truncate(pivot + 1);
    path.levels[pivot].slot -= 1;
    descend_edge(reader, path, bottom_level, mode, Edge::Last)?;
    Ok(true)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Edge {
    First,
    Last,
}

/// Extend the path from its current bottom down to `target_level`,
/// following the first or last child at each level.
fn descend_edge(
    reader: &TreeReader,
    path: &mut Path,
    target_level: u8,
    mode: ReadMode,
    edge: Edge,
) -> Result<()> {
    loop {
        let bottom = path.levels.last_mut().ok_or_else(|| RimeError::Structural {
            logical: Logical(0),
            detail: "empty path".into(),
        })?;
        let level = bottom.block.level();
        if level == target_level {
            bottom.slot = match edge {
                Edge::First => 0,
                Edge::Last => bottom.block.nritems().saturating_sub(1),
            };
            return Ok(());
        }

        let slot = bottom.slot;
        let ptr = *bottom
            .block
            .key_ptr(slot)
            .ok_or_else(|| RimeError::Structural {
                logical: bottom.block.logical(),
                detail: format!("no child pointer at slot {slot}"),
            })?;
        let child = reader.read_block(
            Logical(ptr.blockptr),
            Some(Generation(ptr.generation)),
            mode,
        )?;
        if child.level() + 1 != level {
            return Err(RimeError::Structural {
                logical: Logical(ptr.blockptr),
                detail: format!(
                    "child level {} under a level {} node",
                    child.level(),
                    level
                ),
            });
        }
        let slot = match edge {
            Edge::First => 0,
            Edge::Last => child.nritems().saturating_sub(1),
        };
        path.levels.push(PathLevel { block: child, slot });
    }
}

/// Step backward to the nearest preceding item whose type is
/// `item_type`, stopping as soon as the scan drops below `min_objectid`.
///
/// The path must come from a full descent (bottom at level 0). On
/// success the path is positioned on the found item and its key is
/// returned; `None` means no such item precedes the starting position.
pub fn previous_item(
    reader: &TreeReader,
    path: &mut Path,
    min_objectid: u64,
    item_type: u8,
    mode: ReadMode,
) -> Result<Option<Key>> {
    loop {
        let stepped_back = {
            let Some(bottom) = path.levels.last_mut() else {
                return Ok(None);
            };
            if bottom.slot > 0 && bottom.block.nritems() > 0 {
                bottom.slot = bottom.slot.min(bottom.block.nritems()) - 1;
                true
            } else {
                false
            }
        };
        if !stepped_back && !prev_leaf(reader, path, mode)? {
            return Ok(None);
        }

        let Some(bottom) = path.levels.last() else {
            return Ok(None);
        };
        let Some(key) = bottom.block.key(bottom.slot) else {
            // empty leaf: keep walking backward
            continue;
        };
        if key.objectid < min_objectid {
            return Ok(None);
        }
        if key.item_type == item_type {
            return Ok(Some(key));
        }
    }
}
