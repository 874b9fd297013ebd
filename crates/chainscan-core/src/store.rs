//! Store traits: the persistence layer, the range table and the script registry.
//!
//! The store is the single coordination point between workers. Every mutating
//! operation here is atomic on its own; nothing relies on in-process locks
//! shared between workers.

use std::time::Duration;

use alloy_primitives::I256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::balance::BalanceDelta;
use crate::error::IndexerError;
use crate::types::{
    AddressTransfer, Balance, Block, BlockScanRange, BlockStatus, NftItem, ScriptMigration,
    ScriptMigrationStatus, Token, Transfer,
};
use crate::write_set::WriteSet;

/// Version of the persisted schema this build writes.
pub const SCHEMA_VERSION: u32 = 1;

// ─── Persistence ─────────────────────────────────────────────────────────────

/// Result of [`IndexStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// A block with the same hash is already stored; nothing was written.
    AlreadyApplied,
    /// A stored block does not link to this one; nothing was written. The
    /// stored row at `at - 1` is suspect, so the divergence search starts at `at`.
    ParentMismatch { at: u64 },
}

/// Reject anything but a single forward step of the finality state machine.
pub fn ensure_status_step(from: BlockStatus, to: BlockStatus) -> Result<(), IndexerError> {
    if from.next() == Some(to) {
        Ok(())
    } else {
        Err(IndexerError::InvalidTransition {
            entity: "block".into(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Persist every row of `ws` in one atomic unit.
    ///
    /// Idempotent: re-applying a stored block returns
    /// [`ApplyOutcome::AlreadyApplied`]. Balance deltas are added to the
    /// snapshot at `ws.block.number` and to every later snapshot of the key.
    async fn apply(&self, ws: &WriteSet) -> Result<ApplyOutcome, IndexerError>;

    /// Remove one block and everything derived from it, atomically.
    /// Returns `false` if no block was stored at `number`.
    async fn rollback_block(&self, number: u64) -> Result<bool, IndexerError>;

    /// Remove every block `>= number`, highest first, one block per atomic unit.
    /// Returns the number of blocks removed.
    async fn rollback_from(&self, number: u64) -> Result<u64, IndexerError> {
        let mut removed = 0;
        while let Some(last) = self.last_block().await? {
            if last.number < number {
                break;
            }
            if self.rollback_block(last.number).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn block(&self, number: u64) -> Result<Option<Block>, IndexerError>;

    /// Highest stored block.
    async fn last_block(&self) -> Result<Option<Block>, IndexerError>;

    /// Highest block number whose status is `status` or later.
    async fn highest_block_with_status(
        &self,
        status: BlockStatus,
    ) -> Result<Option<u64>, IndexerError>;

    /// Move every block `<= up_to` currently at `from` to `to`.
    /// `to` must be `from.next()`. Returns the number of blocks updated.
    async fn advance_status(
        &self,
        up_to: u64,
        from: BlockStatus,
        to: BlockStatus,
    ) -> Result<u64, IndexerError>;

    async fn transfer(&self, block_number: u64, log_index: u32)
        -> Result<Option<Transfer>, IndexerError>;

    /// Transfers in `[from, to]`, ordered by `(block_number, log_index)`.
    async fn transfers_between(&self, from: u64, to: u64) -> Result<Vec<Transfer>, IndexerError>;

    /// Ordered by `(block_number, log_index)`.
    async fn address_transfers(&self, address: &str)
        -> Result<Vec<AddressTransfer>, IndexerError>;

    /// Balance from the latest snapshot at or below `block_number`.
    async fn balance_at(
        &self,
        address: &str,
        token_address: &str,
        block_number: u64,
    ) -> Result<Option<I256>, IndexerError>;

    /// Every snapshot of a key, ascending by block number.
    async fn balance_snapshots(
        &self,
        address: &str,
        token_address: &str,
    ) -> Result<Vec<Balance>, IndexerError>;

    async fn token(&self, l2_address: &str) -> Result<Option<Token>, IndexerError>;

    async fn nft_item(
        &self,
        token_address: &str,
        token_id: alloy_primitives::U256,
    ) -> Result<Option<NftItem>, IndexerError>;

    // ── Maintenance (backfill scripts) ──

    async fn clear_balances(&self) -> Result<(), IndexerError>;

    /// Same snapshot arithmetic as [`apply`](Self::apply), without the block rows.
    async fn apply_balance_deltas(
        &self,
        block_number: u64,
        deltas: &[BalanceDelta],
    ) -> Result<(), IndexerError>;

    async fn clear_address_transfers(&self) -> Result<(), IndexerError>;

    async fn insert_address_transfers(&self, rows: &[AddressTransfer]) -> Result<(), IndexerError>;
}

// ─── Range table ─────────────────────────────────────────────────────────────

/// Parameters of one claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker_id: String,
    pub max_size: u64,
    /// Current chain head; nothing above it is handed out.
    pub head: u64,
    pub from_block: u64,
    pub to_block: Option<u64>,
    /// Claims older than this are reclaimable.
    pub lease: Duration,
    pub now: DateTime<Utc>,
}

impl ClaimRequest {
    /// Highest block this request may receive given the current reorg hold.
    pub fn ceiling(&self, hold: Option<u64>) -> Option<u64> {
        let mut top = self.head;
        if let Some(to) = self.to_block {
            top = top.min(to);
        }
        match hold {
            Some(0) => None,
            Some(h) => Some(top.min(h - 1)),
            None => Some(top),
        }
    }

    /// Claims made before this instant have expired.
    pub fn expiry_cutoff(&self) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.lease)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// End of a window starting at `start`, or `None` if `start` is out of bounds.
    pub fn window_end(&self, start: u64, limit: u64, hold: Option<u64>) -> Option<u64> {
        let ceiling = self.ceiling(hold)?;
        if start > ceiling || start > limit {
            return None;
        }
        let by_size = start.saturating_add(self.max_size.max(1) - 1);
        Some(by_size.min(ceiling).min(limit))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(BlockScanRange),
    /// Another worker won a race on the same row; retry immediately.
    Conflict,
    /// Nothing claimable right now.
    Empty,
}

#[async_trait]
pub trait RangeStore: Send + Sync {
    /// One claim attempt. Serves, in order: the lowest reopened range (split at
    /// `max_size`), the lowest expired claim, a fresh window at the frontier.
    async fn try_claim(&self, req: &ClaimRequest) -> Result<ClaimOutcome, IndexerError>;

    /// Mark a range complete. Returns `false` if `owner` no longer holds it.
    async fn complete_range(&self, id: u64, owner: &str) -> Result<bool, IndexerError>;

    /// Refresh the lease on a claimed range and return its current bounds
    /// (a reorg may have shortened it). `None` if `owner` no longer holds it.
    async fn heartbeat(
        &self,
        id: u64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockScanRange>, IndexerError>;

    /// Block claims at or above `number` (lowering any existing hold).
    async fn hold_from(&self, number: u64) -> Result<(), IndexerError>;

    async fn pending_hold(&self) -> Result<Option<u64>, IndexerError>;

    /// Split the range straddling `number`, mark every range at or above it
    /// reopened, and clear any hold at or above `number`. Returns the number
    /// of ranges reopened.
    async fn reopen_from(&self, number: u64) -> Result<u64, IndexerError>;

    /// First block never handed out; `None` before the first claim.
    async fn frontier(&self) -> Result<Option<u64>, IndexerError>;

    /// All ranges, ascending by `from`.
    async fn ranges(&self) -> Result<Vec<BlockScanRange>, IndexerError>;
}

// ─── Script registry ─────────────────────────────────────────────────────────

#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Insert a `not_started` row unless one exists; return the stored row.
    async fn register_script(
        &self,
        name: &str,
        timestamp: i64,
        params: &serde_json::Value,
    ) -> Result<ScriptMigration, IndexerError>;

    async fn script(&self, name: &str) -> Result<Option<ScriptMigration>, IndexerError>;

    /// Ordered by `(timestamp, name)`.
    async fn scripts(&self) -> Result<Vec<ScriptMigration>, IndexerError>;

    /// Conditional status update. Returns `false` if the row was not at `from`.
    async fn transition_script(
        &self,
        name: &str,
        from: ScriptMigrationStatus,
        to: ScriptMigrationStatus,
    ) -> Result<bool, IndexerError>;

    /// Schema version of the underlying store.
    async fn schema_version(&self) -> Result<u32, IndexerError>;
}

/// Everything a worker needs from one backend.
pub trait Store: IndexStore + RangeStore + ScriptStore {}

impl<T: IndexStore + RangeStore + ScriptStore + ?Sized> Store for T {}
