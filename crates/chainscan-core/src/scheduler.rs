//! Range scheduler: claim/complete/reopen over the persisted range table.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::IndexerError;
use crate::indexer::IndexerConfig;
use crate::store::{ClaimOutcome, ClaimRequest, RangeStore};
use crate::types::{BlockScanRange, RangeStatus};

/// Claim conflicts are retried immediately, at most this many times per call.
const MAX_CLAIM_ATTEMPTS: u32 = 16;

pub struct RangeScheduler<S: ?Sized> {
    store: Arc<S>,
    worker_id: String,
    max_size: u64,
    lease: Duration,
    from_block: u64,
    to_block: Option<u64>,
}

impl<S: RangeStore + ?Sized> RangeScheduler<S> {
    pub fn new(store: Arc<S>, config: &IndexerConfig) -> Self {
        Self {
            store,
            worker_id: config.worker_id.clone(),
            max_size: config.range_size,
            lease: config.liveness_timeout(),
            from_block: config.from_block,
            to_block: config.to_block,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Reserve the next window at or below `head`. `None` when there is nothing
    /// to claim or every attempt lost a race.
    pub async fn claim_range(&self, head: u64) -> Result<Option<BlockScanRange>, IndexerError> {
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let req = ClaimRequest {
                worker_id: self.worker_id.clone(),
                max_size: self.max_size,
                head,
                from_block: self.from_block,
                to_block: self.to_block,
                lease: self.lease,
                now: Utc::now(),
            };
            match self.store.try_claim(&req).await? {
                ClaimOutcome::Claimed(range) => {
                    tracing::debug!(
                        worker = %self.worker_id,
                        from = range.from,
                        to = range.to,
                        range_id = range.id,
                        "Range claimed"
                    );
                    return Ok(Some(range));
                }
                ClaimOutcome::Empty => return Ok(None),
                ClaimOutcome::Conflict => {
                    tracing::trace!(worker = %self.worker_id, attempt, "Claim conflict");
                }
            }
        }
        tracing::debug!(worker = %self.worker_id, "Claim contention, giving up this round");
        Ok(None)
    }

    /// Returns `false` if the range was reopened or reclaimed meanwhile.
    pub async fn complete_range(&self, range: &BlockScanRange) -> Result<bool, IndexerError> {
        let done = self.store.complete_range(range.id, &self.worker_id).await?;
        if done {
            tracing::debug!(from = range.from, to = range.to, "Range complete");
        } else {
            tracing::info!(
                from = range.from,
                to = range.to,
                worker = %self.worker_id,
                "Range ownership lost before completion"
            );
        }
        Ok(done)
    }

    /// Keep the lease alive; returns the range's current bounds while still owned.
    pub async fn heartbeat(
        &self,
        range: &BlockScanRange,
    ) -> Result<Option<BlockScanRange>, IndexerError> {
        self.store.heartbeat(range.id, &self.worker_id, Utc::now()).await
    }

    /// First step of the reorg protocol: stop handing out `number` and above.
    pub async fn hold_from(&self, number: u64) -> Result<(), IndexerError> {
        self.store.hold_from(number).await
    }

    pub async fn pending_hold(&self) -> Result<Option<u64>, IndexerError> {
        self.store.pending_hold().await
    }

    /// Last step of the reorg protocol: invalidate ranges at or above `number`
    /// and release the hold.
    pub async fn reopen_from(&self, number: u64) -> Result<u64, IndexerError> {
        let reopened = self.store.reopen_from(number).await?;
        tracing::info!(from = number, reopened, "Ranges reopened");
        Ok(reopened)
    }

    /// `true` once a bounded run has every block up to `to_block` completed.
    pub async fn is_finished(&self) -> Result<bool, IndexerError> {
        let Some(to) = self.to_block else {
            return Ok(false);
        };
        match self.store.frontier().await? {
            Some(frontier) if frontier > to => {}
            _ => return Ok(false),
        }
        let ranges = self.store.ranges().await?;
        Ok(ranges
            .iter()
            .filter(|r| r.from <= to)
            .all(|r| r.status == RangeStatus::Completed))
    }
}

/// Gaps or overlaps in the completed coverage of `[start, end)`.
///
/// Returns the first offending block number, or `None` if every block in the
/// window is covered by exactly one completed range.
pub fn coverage_fault(ranges: &[BlockScanRange], start: u64, end: u64) -> Option<u64> {
    let mut completed: Vec<&BlockScanRange> = ranges
        .iter()
        .filter(|r| r.status == RangeStatus::Completed && r.to >= start && r.from < end)
        .collect();
    completed.sort_by_key(|r| r.from);
    let mut next = start;
    for r in completed {
        let from = r.from.max(start);
        if from != next {
            return Some(next.min(from));
        }
        next = r.to + 1;
    }
    if next < end {
        Some(next)
    } else {
        None
    }
}
