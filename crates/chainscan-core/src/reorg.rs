//! Reorg detection and divergence search.
//!
//! A reorg is signalled in three ways:
//! 1. **Parent mismatch**: a freshly fetched block's `parent_hash` differs from
//!    the stored hash at `number - 1`
//! 2. **Stale neighbour**: the store refuses a write set because a stored
//!    block above it no longer links
//! 3. **Vanished tip**: the highest stored block is no longer canonical
//!
//! In every case the detector walks backward from the detection point,
//! comparing stored hashes with the canonical chain, to find the lowest
//! block number that must be rolled back.

use crate::client::{BlockId, ChainClient};
use crate::error::IndexerError;
use crate::retry::RetryPolicy;
use crate::store::IndexStore;
use crate::types::BlockStatus;

/// Describes a detected chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgEvent {
    /// The block where the fork was detected.
    pub detected_at: u64,
    /// Lowest block number whose stored data is not canonical.
    pub diverged_at: u64,
}

impl ReorgEvent {
    /// Number of block heights invalidated below the detection point.
    pub fn depth(&self) -> u64 {
        self.detected_at.saturating_sub(self.diverged_at)
    }
}

/// Finds the divergence point of a reorg.
#[derive(Debug, Clone)]
pub struct ReorgDetector {
    max_depth: u64,
}

impl ReorgDetector {
    pub fn new(max_depth: u64) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> u64 {
        self.max_depth
    }

    /// Walk backward from `detected_at` until the stored block at `n - 1`
    /// matches the canonical chain (or is not stored) and return `n`.
    ///
    /// Stored blocks at [`BlockStatus::Executed`] are final: having to roll
    /// one back is [`IndexerError::ReorgTooDeep`], as is walking further than
    /// `max_depth` below `detected_at`.
    pub async fn find_divergence<S, C>(
        &self,
        store: &S,
        client: &C,
        retry: &RetryPolicy,
        detected_at: u64,
    ) -> Result<ReorgEvent, IndexerError>
    where
        S: IndexStore + ?Sized,
        C: ChainClient + ?Sized,
    {
        let mut n = detected_at;
        while n > 0 {
            let parent = n - 1;
            let Some(stored) = store.block(parent).await? else {
                break;
            };
            let canonical = retry
                .run("get_block", || client.get_block(BlockId::Number(parent)))
                .await?;
            if canonical.as_ref().map(|b| b.hash.as_str()) == Some(stored.hash.as_str()) {
                break;
            }
            if stored.status == BlockStatus::Executed || detected_at - parent > self.max_depth {
                tracing::error!(
                    detected_at,
                    at = parent,
                    status = %stored.status,
                    max_depth = self.max_depth,
                    "Divergence below the reorg safety bound"
                );
                return Err(IndexerError::ReorgTooDeep {
                    detected_at,
                    max_depth: self.max_depth,
                });
            }
            n = parent;
        }

        let event = ReorgEvent {
            detected_at,
            diverged_at: n,
        };
        tracing::warn!(
            depth = event.depth(),
            at = detected_at,
            diverged_at = n,
            "Reorg detected"
        );
        Ok(event)
    }
}
