//! Block processor: turns one block number into one [`WriteSet`].
//!
//! Fetches the block, its receipts and logs through the Chain Client (with
//! retry on transient failures), verifies parent linkage against the
//! previously persisted block, decodes transfers and folds them into balance
//! deltas, NFT owner updates and newly discovered tokens.
//!
//! Logs reporting a block hash other than the fetched block's are refetched;
//! nodes behind a load balancer can answer from different forks.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use alloy_primitives::U256;

use chainscan_core::balance::BalanceDeltas;
use chainscan_core::client::{BlockId, ChainClient, RawLog, TokenMetadata};
use chainscan_core::decoder::LogDecoder;
use chainscan_core::error::{ClientError, IndexerError};
use chainscan_core::metrics::IndexerMetrics;
use chainscan_core::retry::RetryPolicy;
use chainscan_core::store::IndexStore;
use chainscan_core::tracker::BlockTracker;
use chainscan_core::types::{
    AddressTransfer, Block, BlockStatus, Log, NftItem, Token, TokenType, Transaction,
    TransactionReceipt, Transfer,
};
use chainscan_core::write_set::WriteSet;

/// Recently applied blocks kept for parent checks without a store read.
const TRACKER_WINDOW: usize = 128;

pub struct BlockProcessor<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    client: Arc<C>,
    decoder: Arc<dyn LogDecoder>,
    retry: RetryPolicy,
    metrics: IndexerMetrics,
    tracker: BlockTracker,
}

impl<S, C> BlockProcessor<S, C>
where
    S: IndexStore + ?Sized,
    C: ChainClient + ?Sized,
{
    pub fn new(
        store: Arc<S>,
        client: Arc<C>,
        decoder: Arc<dyn LogDecoder>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            client,
            decoder,
            metrics: retry.metrics.clone(),
            retry,
            tracker: BlockTracker::new(TRACKER_WINDOW),
        }
    }

    /// Build the write set for block `number`.
    ///
    /// Returns [`IndexerError::ReorgDetected`] when the block does not link to
    /// the persisted block at `number - 1`.
    pub async fn process(&mut self, number: u64) -> Result<WriteSet, IndexerError> {
        let client = Arc::clone(&self.client);
        let raw = self
            .retry
            .run("get_block", || client.get_block(BlockId::Number(number)))
            .await?
            .ok_or_else(|| ClientError::Permanent(format!("block {number} not found")))?;

        if number > 0 {
            self.check_parent(number, &raw.parent_hash).await?;
        }

        let receipts = self
            .retry
            .run("get_receipts", || client.get_receipts(number))
            .await?;
        let raw_logs = self.fetch_logs(&*client, number, &raw.hash).await?;

        let block = Block {
            number,
            hash: raw.hash.clone(),
            parent_hash: raw.parent_hash.clone(),
            miner: raw.miner.clone(),
            timestamp: raw.timestamp,
            tx_count: raw.transactions.len() as u32,
            status: BlockStatus::Sealed,
        };
        let mut ws = WriteSet::new(block);

        ws.transactions = raw
            .transactions
            .into_iter()
            .map(|tx| Transaction {
                hash: tx.hash,
                block_number: number,
                from: tx.from,
                to: tx.to,
                nonce: tx.nonce,
                index: tx.index,
                value: tx.value,
            })
            .collect();
        ws.receipts = receipts
            .into_iter()
            .map(|r| TransactionReceipt {
                transaction_hash: r.transaction_hash,
                block_number: number,
                status: r.status,
                contract_address: r.contract_address,
                gas_used: r.gas_used,
                log_count: r.log_count,
            })
            .collect();
        ws.logs = raw_logs
            .into_iter()
            .map(|l| Log {
                block_number: number,
                log_index: l.log_index,
                transaction_hash: l.transaction_hash,
                transaction_index: l.transaction_index,
                address: l.address,
                topics: l.topics,
                data: l.data,
                timestamp: raw.timestamp,
            })
            .collect();

        ws.transfers = self.decode_transfers(&ws.logs);
        ws.address_transfers = ws
            .transfers
            .iter()
            .flat_map(AddressTransfer::from_transfer)
            .collect();

        let mut deltas = BalanceDeltas::new();
        for t in &ws.transfers {
            deltas.add_transfer(t);
        }
        ws.balance_deltas = deltas.into_vec();
        ws.nft_updates = nft_updates(&ws.transfers);
        ws.tokens = self.discover_tokens(number, &ws.logs, &ws.transfers).await?;

        tracing::debug!(
            block = number,
            txs = ws.transactions.len(),
            logs = ws.logs.len(),
            transfers = ws.transfers.len(),
            "Block processed"
        );
        Ok(ws)
    }

    /// Record a block the store accepted, for the next parent check.
    pub fn accept(&mut self, block: &Block) {
        if self.tracker.push(block.clone()).is_err() {
            self.tracker.clear();
            let _ = self.tracker.push(block.clone());
        }
    }

    /// Forget everything at or above `number` (after a rollback).
    pub fn rewind_below(&mut self, number: u64) {
        self.tracker.rewind_below(number);
    }

    async fn check_parent(&mut self, number: u64, parent_hash: &str) -> Result<(), IndexerError> {
        if let Some(prev) = self.tracker.get(number - 1) {
            if prev.hash == parent_hash {
                return Ok(());
            }
        }
        // The tracker may be stale if another worker rolled blocks back; the store decides.
        let Some(stored) = self.store.block(number - 1).await? else {
            return Ok(());
        };
        if stored.hash == parent_hash {
            return Ok(());
        }
        self.tracker.rewind_below(number - 1);
        Err(IndexerError::ReorgDetected {
            block_number: number,
            expected: stored.hash,
            actual: parent_hash.to_string(),
        })
    }

    fn decode_transfers(&self, logs: &[Log]) -> Vec<Transfer> {
        let mut transfers = Vec::new();
        for log in logs {
            match self.decoder.decode(log) {
                Ok(Some(t)) => transfers.push(t),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        block = log.block_number,
                        log_index = log.log_index,
                        error = %e,
                        "Skipping undecodable log"
                    );
                }
            }
        }
        transfers
    }

    /// Logs of block `number`, all served from `block_hash`.
    ///
    /// Logs that carry another block hash are refetched with backoff; once
    /// retries run out the mismatch is a transient client error.
    async fn fetch_logs(
        &self,
        client: &C,
        number: u64,
        block_hash: &str,
    ) -> Result<Vec<RawLog>, IndexerError> {
        let mut attempt = 0u32;
        loop {
            let logs = self.retry.run("get_logs", || client.get_logs(number)).await?;
            let served = logs
                .iter()
                .filter_map(|l| l.block_hash.as_deref())
                .find(|h| *h != block_hash);
            let Some(served) = served else {
                return Ok(logs);
            };
            self.metrics.record_log_refetch();
            attempt += 1;
            let Some(delay) = self.retry.next_delay(attempt) else {
                return Err(ClientError::Transient(format!(
                    "logs of block {number} served from {served}, expected {block_hash}"
                ))
                .into());
            };
            tracing::debug!(
                block = number,
                expected = block_hash,
                served,
                attempt,
                "Logs from another block hash, refetching"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Token rows for addresses neither stored nor already seen in this block.
    ///
    /// Metadata announced by a log of the block (a bridged token's
    /// initialisation) wins over metadata read from the token contract.
    async fn discover_tokens(
        &self,
        number: u64,
        logs: &[Log],
        transfers: &[Transfer],
    ) -> Result<Vec<Token>, IndexerError> {
        let mut announced = Vec::new();
        for log in logs {
            match self.decoder.announced_token(log) {
                Ok(Some(token)) => announced.push(token),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        block = log.block_number,
                        log_index = log.log_index,
                        error = %e,
                        "Skipping undecodable token announcement"
                    );
                }
            }
        }

        let candidates = transfers
            .iter()
            .filter(|t| t.token_type != TokenType::BaseToken)
            .map(|t| (t.token_address.as_str(), t.token_type))
            .chain(announced.iter().map(|t| (t.l2_address.as_str(), t.token_type)));

        let mut seen = HashSet::new();
        let mut tokens = Vec::new();
        for (address, token_type) in candidates {
            if !seen.insert(address) {
                continue;
            }
            if self.store.token(address).await?.is_some() {
                continue;
            }
            let metadata = match announced.iter().find(|t| t.l2_address == address) {
                Some(t) => TokenMetadata {
                    symbol: t.symbol.clone(),
                    name: t.name.clone(),
                    decimals: t.decimals,
                    l1_address: t.l1_address.clone(),
                },
                None => self.fetch_metadata(number, address).await,
            };
            tokens.push(Token {
                l2_address: address.to_string(),
                l1_address: metadata.l1_address,
                symbol: metadata.symbol,
                name: metadata.name,
                decimals: metadata.decimals,
                token_type,
                block_number: number,
            });
        }
        Ok(tokens)
    }

    async fn fetch_metadata(&self, number: u64, address: &str) -> TokenMetadata {
        let client = &*self.client;
        match self
            .retry
            .run("token_metadata", || client.token_metadata(address))
            .await
        {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    token = %address,
                    block = number,
                    error = %e,
                    "Token metadata unavailable"
                );
                TokenMetadata::default()
            }
        }
    }
}

/// Latest owner per ERC721 item within the block.
fn nft_updates(transfers: &[Transfer]) -> Vec<NftItem> {
    let mut latest: BTreeMap<(String, U256), NftItem> = BTreeMap::new();
    for t in transfers {
        let (TokenType::Erc721, Some(token_id)) = (t.token_type, t.token_id) else {
            continue;
        };
        latest.insert(
            (t.token_address.clone(), token_id),
            NftItem {
                token_id,
                token_address: t.token_address.clone(),
                owner: t.to.clone(),
                name: None,
                description: None,
                image_url: None,
                metadata_url: None,
                last_transfer: (t.block_number, t.log_index),
            },
        );
    }
    latest.into_values().collect()
}
