//! Backfill scripts shipped with the indexer.
//!
//! Both clear their target and rebuild it from the Transfer table, so a run
//! that is interrupted or repeated converges to the same state.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use chainscan_core::backfill::BackfillScript;
use chainscan_core::balance::BalanceDeltas;
use chainscan_core::error::IndexerError;
use chainscan_core::store::IndexStore;
use chainscan_core::types::AddressTransfer;

/// Blocks read per `transfers_between` call.
const DEFAULT_SCAN_CHUNK: u64 = 1_000;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ScanParams {
    chunk_blocks: u64,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            chunk_blocks: DEFAULT_SCAN_CHUNK,
        }
    }
}

impl ScanParams {
    fn parse(params: &serde_json::Value) -> Result<Self, IndexerError> {
        if params.is_null() {
            return Ok(Self::default());
        }
        let parsed: Self = serde_json::from_value(params.clone())
            .map_err(|e| IndexerError::Other(format!("invalid script params: {e}")))?;
        Ok(Self {
            chunk_blocks: parsed.chunk_blocks.max(1),
        })
    }
}

/// `[from, to]` windows of `chunk` blocks covering `[0, last]`.
fn windows(last: u64, chunk: u64) -> impl Iterator<Item = (u64, u64)> {
    let chunk = chunk.max(1);
    (0..=last / chunk).map(move |i| (i * chunk, (i * chunk + chunk - 1).min(last)))
}

/// Rebuild every balance snapshot from transfers.
pub struct RecomputeBalances<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> RecomputeBalances<S> {
    pub const NAME: &'static str = "recompute-balances-v2";

    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: IndexStore + ?Sized> BackfillScript for RecomputeBalances<S> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn timestamp(&self) -> i64 {
        1_717_200_000
    }

    fn supersedes(&self) -> Vec<String> {
        vec!["recompute-balances-v1".into()]
    }

    fn params(&self) -> serde_json::Value {
        serde_json::json!({ "chunk_blocks": DEFAULT_SCAN_CHUNK })
    }

    async fn run(&self, params: &serde_json::Value) -> Result<(), IndexerError> {
        let params = ScanParams::parse(params)?;
        self.store.clear_balances().await?;
        let Some(last) = self.store.last_block().await? else {
            return Ok(());
        };

        let mut blocks = 0u64;
        for (from, to) in windows(last.number, params.chunk_blocks) {
            let transfers = self.store.transfers_between(from, to).await?;
            let mut i = 0;
            while i < transfers.len() {
                let n = transfers[i].block_number;
                let mut deltas = BalanceDeltas::new();
                while i < transfers.len() && transfers[i].block_number == n {
                    deltas.add_transfer(&transfers[i]);
                    i += 1;
                }
                self.store.apply_balance_deltas(n, &deltas.into_vec()).await?;
                blocks += 1;
            }
        }
        tracing::info!(blocks, "Balances recomputed from transfers");
        Ok(())
    }
}

/// Regenerate the per-address transfer index.
pub struct RebuildAddressTransfers<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> RebuildAddressTransfers<S> {
    pub const NAME: &'static str = "rebuild-address-transfers";

    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: IndexStore + ?Sized> BackfillScript for RebuildAddressTransfers<S> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn timestamp(&self) -> i64 {
        1_717_300_000
    }

    async fn run(&self, params: &serde_json::Value) -> Result<(), IndexerError> {
        let params = ScanParams::parse(params)?;
        self.store.clear_address_transfers().await?;
        let Some(last) = self.store.last_block().await? else {
            return Ok(());
        };

        let mut count = 0usize;
        for (from, to) in windows(last.number, params.chunk_blocks) {
            let rows: Vec<AddressTransfer> = self
                .store
                .transfers_between(from, to)
                .await?
                .iter()
                .flat_map(AddressTransfer::from_transfer)
                .collect();
            count += rows.len();
            self.store.insert_address_transfers(&rows).await?;
        }
        tracing::info!(rows = count, "Address transfers rebuilt");
        Ok(())
    }
}

/// Every shipped script, ready to hand to a `BackfillRunner`.
pub fn default_scripts<S>(store: Arc<S>) -> Vec<Arc<dyn BackfillScript>>
where
    S: IndexStore + ?Sized + 'static,
{
    vec![
        Arc::new(RecomputeBalances::new(store.clone())),
        Arc::new(RebuildAddressTransfers::new(store)),
    ]
}
