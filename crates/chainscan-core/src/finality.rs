//! Finality tracker: advances persisted blocks through
//! `sealed → committed → proven → executed` as confirmation signals arrive.
//!
//! A signal says "every block up to N has reached status S". It is applied as
//! one store update per intermediate step, so no block skips a state, and it
//! is idempotent: blocks already at or past S are untouched.

use std::collections::HashMap;
use std::sync::Arc;

use crate::client::ChainClient;
use crate::error::IndexerError;
use crate::retry::RetryPolicy;
use crate::store::IndexStore;
use crate::types::BlockStatus;

/// "Every block `<= up_to` has reached `status`."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalitySignal {
    pub status: BlockStatus,
    pub up_to: u64,
}

pub struct FinalityTracker<S: ?Sized> {
    store: Arc<S>,
    /// Highest `up_to` seen per status, to flag a source that goes backwards.
    last_seen: HashMap<BlockStatus, u64>,
}

impl<S: IndexStore + ?Sized> FinalityTracker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            last_seen: HashMap::new(),
        }
    }

    /// Apply one signal. Returns the number of block-status updates made.
    pub async fn on_signal(&mut self, signal: FinalitySignal) -> Result<u64, IndexerError> {
        if signal.status == BlockStatus::Sealed {
            return Ok(0);
        }
        if let Some(&last) = self.last_seen.get(&signal.status) {
            if signal.up_to < last {
                tracing::warn!(
                    status = %signal.status,
                    last,
                    reported = signal.up_to,
                    "Finality source went backwards; keeping stored statuses"
                );
            }
        }
        let seen = self.last_seen.entry(signal.status).or_insert(signal.up_to);
        *seen = (*seen).max(signal.up_to);

        let mut updated = 0;
        let mut from = BlockStatus::Sealed;
        while let Some(to) = from.next() {
            if to > signal.status {
                break;
            }
            updated += self.store.advance_status(signal.up_to, from, to).await?;
            from = to;
        }
        if updated > 0 {
            tracing::debug!(status = %signal.status, up_to = signal.up_to, updated, "Block statuses advanced");
        }
        Ok(updated)
    }

    /// Ask the client for the latest block at each status and apply the answers.
    pub async fn poll_once<C: ChainClient + ?Sized>(
        &mut self,
        client: &C,
        retry: &RetryPolicy,
    ) -> Result<u64, IndexerError> {
        let mut updated = 0;
        for status in [BlockStatus::Committed, BlockStatus::Proven, BlockStatus::Executed] {
            let latest = retry
                .run("latest_block_with_status", || client.latest_block_with_status(status))
                .await?;
            if let Some(up_to) = latest {
                updated += self.on_signal(FinalitySignal { status, up_to }).await?;
            }
        }
        Ok(updated)
    }
}
