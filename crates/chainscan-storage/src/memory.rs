//! In-memory storage backend.
//!
//! Implements every store trait behind one mutex, so each operation is atomic
//! by construction. All data is lost when the process exits; used by tests and
//! short-lived runs that don't need persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use alloy_primitives::{I256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use chainscan_core::balance::BalanceDelta;
use chainscan_core::error::IndexerError;
use chainscan_core::store::{
    ensure_status_step, ApplyOutcome, ClaimOutcome, ClaimRequest, IndexStore, RangeStore,
    ScriptStore, SCHEMA_VERSION,
};
use chainscan_core::types::{
    AddressTransfer, Balance, Block, BlockScanRange, BlockStatus, Log, NftItem, RangeStatus,
    ScriptMigration, ScriptMigrationStatus, Token, TokenType, Transaction, TransactionReceipt,
    Transfer,
};
use chainscan_core::write_set::WriteSet;

type BalanceKey = (String, String);

#[derive(Default)]
struct State {
    blocks: BTreeMap<u64, Block>,
    transactions: HashMap<String, Transaction>,
    receipts: HashMap<String, TransactionReceipt>,
    logs: BTreeMap<(u64, u32), Log>,
    transfers: BTreeMap<(u64, u32), Transfer>,
    address_transfers: BTreeMap<(String, u64, u32), AddressTransfer>,
    balances: HashMap<BalanceKey, BTreeMap<u64, I256>>,
    tokens: HashMap<String, Token>,
    nft_items: HashMap<(String, U256), NftItem>,

    ranges: BTreeMap<u64, BlockScanRange>,
    next_range_id: u64,
    frontier: Option<u64>,
    hold: Option<u64>,

    scripts: HashMap<String, ScriptMigration>,
}

impl State {
    fn add_deltas(&mut self, block_number: u64, deltas: &[BalanceDelta]) {
        for d in deltas {
            let series = self
                .balances
                .entry((d.address.clone(), d.token_address.clone()))
                .or_default();
            let prev = series
                .range(..block_number)
                .next_back()
                .map(|(_, v)| *v)
                .unwrap_or(I256::ZERO);
            *series.entry(block_number).or_insert(prev) += d.delta;
            for (_, later) in series.range_mut(block_number + 1..) {
                *later += d.delta;
            }
        }
    }

    fn remove_snapshots_at(&mut self, block_number: u64) {
        for series in self.balances.values_mut() {
            let Some(value) = series.remove(&block_number) else {
                continue;
            };
            let prev = series
                .range(..block_number)
                .next_back()
                .map(|(_, v)| *v)
                .unwrap_or(I256::ZERO);
            let delta = value - prev;
            for (_, later) in series.range_mut(block_number + 1..) {
                *later -= delta;
            }
        }
        self.balances.retain(|_, series| !series.is_empty());
    }

    fn apply_nft_update(&mut self, update: &NftItem) {
        let key = (update.token_address.clone(), update.token_id);
        match self.nft_items.get_mut(&key) {
            Some(item) if item.last_transfer >= update.last_transfer => {}
            Some(item) => {
                item.owner = update.owner.clone();
                item.last_transfer = update.last_transfer;
            }
            None => {
                self.nft_items.insert(key, update.clone());
            }
        }
    }

    /// Point `owner` back at the latest surviving transfer of the item.
    fn restore_nft_owner(&mut self, token_address: &str, token_id: U256) {
        let key = (token_address.to_string(), token_id);
        let latest = self
            .transfers
            .values()
            .rev()
            .find(|t| {
                t.token_type == TokenType::Erc721
                    && t.token_address == token_address
                    && t.token_id == Some(token_id)
            })
            .map(|t| (t.to.clone(), (t.block_number, t.log_index)));
        match latest {
            Some((owner, last_transfer)) => {
                if let Some(item) = self.nft_items.get_mut(&key) {
                    item.owner = owner;
                    item.last_transfer = last_transfer;
                }
            }
            None => {
                self.nft_items.remove(&key);
            }
        }
    }

    /// Drop tokens first seen at `block_number` unless a surviving transfer
    /// still references them; survivors move to their lowest referencing block.
    fn release_tokens_at(&mut self, block_number: u64) {
        let stamped: Vec<String> = self
            .tokens
            .values()
            .filter(|tok| tok.token_type != TokenType::BaseToken && tok.block_number == block_number)
            .map(|tok| tok.l2_address.clone())
            .collect();
        for address in stamped {
            let first_seen = self
                .transfers
                .values()
                .find(|t| t.token_address == address)
                .map(|t| t.block_number);
            match first_seen {
                Some(n) => {
                    if let Some(tok) = self.tokens.get_mut(&address) {
                        tok.block_number = n;
                    }
                }
                None => {
                    self.tokens.remove(&address);
                }
            }
        }
    }

    fn insert_range(&mut self, mut range: BlockScanRange) -> BlockScanRange {
        self.next_range_id += 1;
        range.id = self.next_range_id;
        self.ranges.insert(range.id, range.clone());
        range
    }

    fn lowest_range(&self, pred: impl Fn(&BlockScanRange) -> bool) -> Option<BlockScanRange> {
        self.ranges
            .values()
            .filter(|r| pred(r))
            .min_by_key(|r| r.from)
            .cloned()
    }
}

/// In-memory implementation of every store trait.
pub struct InMemoryStorage {
    state: Mutex<State>,
    schema_version: u32,
    failing_applies: AtomicU32,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_schema_version(SCHEMA_VERSION)
    }

    pub fn with_schema_version(schema_version: u32) -> Self {
        let mut state = State::default();
        let base = Token::base_token();
        state.tokens.insert(base.l2_address.clone(), base);
        Self {
            state: Mutex::new(state),
            schema_version,
            failing_applies: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls to `apply` fail with a storage error.
    pub fn fail_next_applies(&self, n: u32) {
        self.failing_applies.store(n, Ordering::SeqCst);
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, IndexerError> {
        self.state
            .lock()
            .map_err(|_| IndexerError::Storage("in-memory state lock poisoned".into()))
    }

    /// Number of stored transfers.
    pub fn transfer_count(&self) -> Result<usize, IndexerError> {
        Ok(self.state()?.transfers.len())
    }

    /// All stored blocks, ascending.
    pub fn blocks(&self) -> Result<Vec<Block>, IndexerError> {
        Ok(self.state()?.blocks.values().cloned().collect())
    }

    /// All stored logs for a block, ascending by log index.
    pub fn logs(&self, block_number: u64) -> Result<Vec<Log>, IndexerError> {
        Ok(self
            .state()?
            .logs
            .range((block_number, 0)..=(block_number, u32::MAX))
            .map(|(_, l)| l.clone())
            .collect())
    }

    pub fn transaction(&self, hash: &str) -> Result<Option<Transaction>, IndexerError> {
        Ok(self.state()?.transactions.get(hash).cloned())
    }
}

#[async_trait]
impl IndexStore for InMemoryStorage {
    async fn apply(&self, ws: &WriteSet) -> Result<ApplyOutcome, IndexerError> {
        let remaining = self.failing_applies.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_applies.store(remaining - 1, Ordering::SeqCst);
            return Err(IndexerError::Storage("injected apply failure".into()));
        }

        let mut st = self.state()?;
        let block = &ws.block;
        let n = block.number;

        if let Some(existing) = st.blocks.get(&n) {
            if existing.hash == block.hash {
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            return Ok(ApplyOutcome::ParentMismatch { at: n + 1 });
        }
        if n > 0 {
            if let Some(parent) = st.blocks.get(&(n - 1)) {
                if parent.hash != block.parent_hash {
                    return Ok(ApplyOutcome::ParentMismatch { at: n });
                }
            }
        }
        if let Some(child) = st.blocks.get(&(n + 1)) {
            if child.parent_hash != block.hash {
                return Ok(ApplyOutcome::ParentMismatch { at: n + 2 });
            }
        }

        st.blocks.insert(n, block.clone());
        for tx in &ws.transactions {
            st.transactions.insert(tx.hash.clone(), tx.clone());
        }
        for r in &ws.receipts {
            st.receipts.insert(r.transaction_hash.clone(), r.clone());
        }
        for log in &ws.logs {
            st.logs.insert((log.block_number, log.log_index), log.clone());
        }
        for t in &ws.transfers {
            st.transfers.insert((t.block_number, t.log_index), t.clone());
        }
        for at in &ws.address_transfers {
            st.address_transfers
                .insert((at.address.clone(), at.block_number, at.log_index), at.clone());
        }
        for token in &ws.tokens {
            st.tokens
                .entry(token.l2_address.clone())
                .or_insert_with(|| token.clone());
        }
        for item in &ws.nft_updates {
            st.apply_nft_update(item);
        }
        st.add_deltas(n, &ws.balance_deltas);

        tracing::trace!(block = n, rows = ws.row_count(), "Write set applied");
        Ok(ApplyOutcome::Applied)
    }

    async fn rollback_block(&self, number: u64) -> Result<bool, IndexerError> {
        let mut st = self.state()?;
        if st.blocks.remove(&number).is_none() {
            return Ok(false);
        }
        st.transactions.retain(|_, tx| tx.block_number != number);
        st.receipts.retain(|_, r| r.block_number != number);
        st.logs.retain(|(b, _), _| *b != number);

        let removed: Vec<Transfer> = st
            .transfers
            .range((number, 0)..=(number, u32::MAX))
            .map(|(_, t)| t.clone())
            .collect();
        st.transfers.retain(|(b, _), _| *b != number);
        st.address_transfers.retain(|(_, b, _), _| *b != number);

        st.remove_snapshots_at(number);

        for t in removed.iter().filter(|t| t.token_type == TokenType::Erc721) {
            if let Some(token_id) = t.token_id {
                let stale = st
                    .nft_items
                    .get(&(t.token_address.clone(), token_id))
                    .map(|item| item.last_transfer.0 >= number)
                    .unwrap_or(false);
                if stale {
                    st.restore_nft_owner(&t.token_address, token_id);
                }
            }
        }
        st.release_tokens_at(number);

        tracing::debug!(block = number, "Block rolled back");
        Ok(true)
    }

    async fn block(&self, number: u64) -> Result<Option<Block>, IndexerError> {
        Ok(self.state()?.blocks.get(&number).cloned())
    }

    async fn last_block(&self) -> Result<Option<Block>, IndexerError> {
        Ok(self.state()?.blocks.values().next_back().cloned())
    }

    async fn highest_block_with_status(
        &self,
        status: BlockStatus,
    ) -> Result<Option<u64>, IndexerError> {
        Ok(self
            .state()?
            .blocks
            .values()
            .rev()
            .find(|b| b.status >= status)
            .map(|b| b.number))
    }

    async fn advance_status(
        &self,
        up_to: u64,
        from: BlockStatus,
        to: BlockStatus,
    ) -> Result<u64, IndexerError> {
        ensure_status_step(from, to)?;
        let mut st = self.state()?;
        let mut updated = 0;
        for block in st.blocks.range_mut(..=up_to).map(|(_, b)| b) {
            if block.status == from {
                block.status = to;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn transfer(
        &self,
        block_number: u64,
        log_index: u32,
    ) -> Result<Option<Transfer>, IndexerError> {
        Ok(self.state()?.transfers.get(&(block_number, log_index)).cloned())
    }

    async fn transfers_between(&self, from: u64, to: u64) -> Result<Vec<Transfer>, IndexerError> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .state()?
            .transfers
            .range((from, 0)..=(to, u32::MAX))
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn address_transfers(
        &self,
        address: &str,
    ) -> Result<Vec<AddressTransfer>, IndexerError> {
        Ok(self
            .state()?
            .address_transfers
            .range((address.to_string(), 0, 0)..=(address.to_string(), u64::MAX, u32::MAX))
            .map(|(_, at)| at.clone())
            .collect())
    }

    async fn balance_at(
        &self,
        address: &str,
        token_address: &str,
        block_number: u64,
    ) -> Result<Option<I256>, IndexerError> {
        let st = self.state()?;
        Ok(st
            .balances
            .get(&(address.to_string(), token_address.to_string()))
            .and_then(|series| series.range(..=block_number).next_back())
            .map(|(_, v)| *v))
    }

    async fn balance_snapshots(
        &self,
        address: &str,
        token_address: &str,
    ) -> Result<Vec<Balance>, IndexerError> {
        let st = self.state()?;
        Ok(st
            .balances
            .get(&(address.to_string(), token_address.to_string()))
            .map(|series| {
                series
                    .iter()
                    .map(|(b, v)| Balance {
                        address: address.to_string(),
                        token_address: token_address.to_string(),
                        block_number: *b,
                        balance: *v,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn token(&self, l2_address: &str) -> Result<Option<Token>, IndexerError> {
        Ok(self.state()?.tokens.get(l2_address).cloned())
    }

    async fn nft_item(
        &self,
        token_address: &str,
        token_id: U256,
    ) -> Result<Option<NftItem>, IndexerError> {
        Ok(self
            .state()?
            .nft_items
            .get(&(token_address.to_string(), token_id))
            .cloned())
    }

    async fn clear_balances(&self) -> Result<(), IndexerError> {
        self.state()?.balances.clear();
        Ok(())
    }

    async fn apply_balance_deltas(
        &self,
        block_number: u64,
        deltas: &[BalanceDelta],
    ) -> Result<(), IndexerError> {
        self.state()?.add_deltas(block_number, deltas);
        Ok(())
    }

    async fn clear_address_transfers(&self) -> Result<(), IndexerError> {
        self.state()?.address_transfers.clear();
        Ok(())
    }

    async fn insert_address_transfers(&self, rows: &[AddressTransfer]) -> Result<(), IndexerError> {
        let mut st = self.state()?;
        for at in rows {
            st.address_transfers
                .insert((at.address.clone(), at.block_number, at.log_index), at.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl RangeStore for InMemoryStorage {
    async fn try_claim(&self, req: &ClaimRequest) -> Result<ClaimOutcome, IndexerError> {
        let mut st = self.state()?;
        let hold = st.hold;

        // 1. Reopened ranges, lowest first, split at max_size.
        if let Some(r) = st.lowest_range(|r| r.status == RangeStatus::Reopened) {
            if let Some(end) = req.window_end(r.from, r.to, hold) {
                if end < r.to {
                    st.insert_range(BlockScanRange {
                        id: 0,
                        from: end + 1,
                        to: r.to,
                        status: RangeStatus::Reopened,
                        owner: None,
                        claimed_at: None,
                    });
                }
                let claimed = BlockScanRange {
                    to: end,
                    status: RangeStatus::Claimed,
                    owner: Some(req.worker_id.clone()),
                    claimed_at: Some(req.now),
                    ..r
                };
                st.ranges.insert(claimed.id, claimed.clone());
                return Ok(ClaimOutcome::Claimed(claimed));
            }
        }

        // 2. Claims whose owner went silent.
        if let Some(ceiling) = req.ceiling(hold) {
            let cutoff = req.expiry_cutoff();
            let expired = st.lowest_range(|r| {
                r.status == RangeStatus::Claimed
                    && r.to <= ceiling
                    && r.claimed_at.map(|at| at < cutoff).unwrap_or(true)
            });
            if let Some(r) = expired {
                tracing::info!(
                    from = r.from,
                    to = r.to,
                    previous_owner = r.owner.as_deref().unwrap_or(""),
                    worker = %req.worker_id,
                    "Reclaiming expired range"
                );
                let claimed = BlockScanRange {
                    owner: Some(req.worker_id.clone()),
                    claimed_at: Some(req.now),
                    ..r
                };
                st.ranges.insert(claimed.id, claimed.clone());
                return Ok(ClaimOutcome::Claimed(claimed));
            }
        }

        // 3. A fresh window at the frontier.
        let start = st.frontier.unwrap_or(req.from_block).max(req.from_block);
        let Some(end) = req.window_end(start, u64::MAX, hold) else {
            return Ok(ClaimOutcome::Empty);
        };
        st.frontier = Some(end + 1);
        let claimed = st.insert_range(BlockScanRange {
            id: 0,
            from: start,
            to: end,
            status: RangeStatus::Claimed,
            owner: Some(req.worker_id.clone()),
            claimed_at: Some(req.now),
        });
        Ok(ClaimOutcome::Claimed(claimed))
    }

    async fn complete_range(&self, id: u64, owner: &str) -> Result<bool, IndexerError> {
        let mut st = self.state()?;
        match st.ranges.get_mut(&id) {
            Some(r) if r.status == RangeStatus::Claimed && r.owner.as_deref() == Some(owner) => {
                r.status = RangeStatus::Completed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(
        &self,
        id: u64,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockScanRange>, IndexerError> {
        let mut st = self.state()?;
        match st.ranges.get_mut(&id) {
            Some(r) if r.status == RangeStatus::Claimed && r.owner.as_deref() == Some(owner) => {
                r.claimed_at = Some(now);
                Ok(Some(r.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn hold_from(&self, number: u64) -> Result<(), IndexerError> {
        let mut st = self.state()?;
        st.hold = Some(st.hold.map_or(number, |h| h.min(number)));
        Ok(())
    }

    async fn pending_hold(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self.state()?.hold)
    }

    async fn reopen_from(&self, number: u64) -> Result<u64, IndexerError> {
        let mut st = self.state()?;
        let mut reopened = 0;
        let ids: Vec<u64> = st.ranges.keys().copied().collect();
        for id in ids {
            let Some(r) = st.ranges.get(&id).cloned() else {
                continue;
            };
            if r.from < number && number <= r.to {
                if let Some(lower) = st.ranges.get_mut(&id) {
                    lower.to = number - 1;
                }
                st.insert_range(BlockScanRange {
                    id: 0,
                    from: number,
                    to: r.to,
                    status: RangeStatus::Reopened,
                    owner: None,
                    claimed_at: None,
                });
                reopened += 1;
            } else if r.from >= number {
                if let Some(upper) = st.ranges.get_mut(&id) {
                    upper.status = RangeStatus::Reopened;
                    upper.owner = None;
                    upper.claimed_at = None;
                }
                reopened += 1;
            }
        }
        if matches!(st.hold, Some(h) if h >= number) {
            st.hold = None;
        }
        Ok(reopened)
    }

    async fn frontier(&self) -> Result<Option<u64>, IndexerError> {
        Ok(self.state()?.frontier)
    }

    async fn ranges(&self) -> Result<Vec<BlockScanRange>, IndexerError> {
        let mut ranges: Vec<BlockScanRange> = self.state()?.ranges.values().cloned().collect();
        ranges.sort_by_key(|r| r.from);
        Ok(ranges)
    }
}

#[async_trait]
impl ScriptStore for InMemoryStorage {
    async fn register_script(
        &self,
        name: &str,
        timestamp: i64,
        params: &serde_json::Value,
    ) -> Result<ScriptMigration, IndexerError> {
        let mut st = self.state()?;
        Ok(st
            .scripts
            .entry(name.to_string())
            .or_insert_with(|| ScriptMigration {
                name: name.to_string(),
                timestamp,
                status: ScriptMigrationStatus::NotStarted,
                params: params.clone(),
                updated_at: Utc::now(),
            })
            .clone())
    }

    async fn script(&self, name: &str) -> Result<Option<ScriptMigration>, IndexerError> {
        Ok(self.state()?.scripts.get(name).cloned())
    }

    async fn scripts(&self) -> Result<Vec<ScriptMigration>, IndexerError> {
        let mut all: Vec<ScriptMigration> = self.state()?.scripts.values().cloned().collect();
        all.sort_by(|a, b| (a.timestamp, &a.name).cmp(&(b.timestamp, &b.name)));
        Ok(all)
    }

    async fn transition_script(
        &self,
        name: &str,
        from: ScriptMigrationStatus,
        to: ScriptMigrationStatus,
    ) -> Result<bool, IndexerError> {
        if !from.can_transition_to(to) {
            return Err(IndexerError::InvalidTransition {
                entity: format!("script {name}"),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let mut st = self.state()?;
        match st.scripts.get_mut(name) {
            Some(row) if row.status == from => {
                row.status = to;
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn schema_version(&self) -> Result<u32, IndexerError> {
        Ok(self.schema_version)
    }
}
