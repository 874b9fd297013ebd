//! Block tracker: a short window of the blocks a worker has just processed,
//! used to verify parent-hash linkage without a store round-trip.

use std::collections::VecDeque;

use crate::types::Block;

/// Tracks the last N blocks processed within the current range.
///
/// When a new block arrives, the tracker checks whether its `parent_hash`
/// matches the hash of the previous block. A mismatch means a reorg occurred.
pub struct BlockTracker {
    /// Sliding window of recent blocks (oldest first).
    window: VecDeque<Block>,
    /// Maximum number of blocks to retain.
    window_size: usize,
}

impl BlockTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    /// Add a block to the tracker.
    ///
    /// Returns `Err(expected_parent_hash)` if the block directly follows the
    /// tracked head but does not link to it. A block that does not directly
    /// follow the head restarts the window.
    pub fn push(&mut self, block: Block) -> Result<(), String> {
        if let Some(head) = self.window.back() {
            if block.number == head.number + 1 && block.parent_hash != head.hash {
                return Err(head.hash.clone());
            }
            if block.number != head.number + 1 {
                self.window.clear();
            }
        }
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(block);
        Ok(())
    }

    /// Returns the most recently added block.
    pub fn head(&self) -> Option<&Block> {
        self.window.back()
    }

    /// Returns a block by number if it's in the window.
    pub fn get(&self, number: u64) -> Option<&Block> {
        self.window.iter().find(|b| b.number == number)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Discard everything at or above `block_number`.
    pub fn rewind_below(&mut self, block_number: u64) {
        while let Some(back) = self.window.back() {
            if back.number >= block_number {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}
