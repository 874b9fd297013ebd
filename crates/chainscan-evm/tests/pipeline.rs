//! End-to-end scenarios: scripted chain → worker → in-memory store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use alloy_primitives::I256;
use async_trait::async_trait;

use chainscan_core::backfill::{BackfillRunner, BackfillScript};
use chainscan_core::client::{BlockId, ChainClient, RawBlock, RawLog, RawReceipt, TokenMetadata};
use chainscan_core::error::{ClientError, IndexerError};
use chainscan_core::finality::FinalityTracker;
use chainscan_core::indexer::{IndexerConfig, IndexerState, RetrySettings};
use chainscan_core::retry::RetryPolicy;
use chainscan_core::scheduler::coverage_fault;
use chainscan_core::store::{IndexStore, RangeStore, ScriptStore};
use chainscan_core::types::{BlockStatus, ScriptMigrationStatus, ZERO_ADDRESS};
use chainscan_evm::decoder::TRANSFER_TOPIC;
use chainscan_evm::{
    run_indexer, BlockProcessor, IndexerBuilder, RecomputeBalances, Shutdown, TransferDecoder,
    Worker,
};
use chainscan_storage::InMemoryStorage;

const TOKEN: &str = "0x00000000000000000000000000000000000070c0";
const A: &str = "0x00000000000000000000000000000000000000aa";
const B: &str = "0x00000000000000000000000000000000000000bb";
const C: &str = "0x00000000000000000000000000000000000000cc";
const D: &str = "0x00000000000000000000000000000000000000dd";

// ─── Scripted chain ──────────────────────────────────────────────────────────

#[derive(Default)]
struct ChainState {
    /// Fork tag per block number; the hash is derived from (tag, number).
    tags: BTreeMap<u64, u8>,
    /// Parent hash overrides where a fork attaches to an older branch.
    parents: HashMap<u64, String>,
    logs: HashMap<u64, Vec<RawLog>>,
    committed: Option<u64>,
    executed: Option<u64>,
}

#[derive(Default)]
struct MockChain {
    state: Mutex<ChainState>,
    transient_failures: AtomicU32,
}

fn hash(tag: u8, n: u64) -> String {
    format!("0x{tag:02x}{n:062x}")
}

impl MockChain {
    fn new(head: u64) -> Self {
        let chain = Self::default();
        chain.extend(head, 0);
        chain
    }

    fn extend(&self, head: u64, tag: u8) {
        let mut st = self.state.lock().unwrap();
        let start = st.tags.keys().next_back().map(|n| n + 1).unwrap_or(0);
        for n in start..=head {
            st.tags.insert(n, tag);
        }
    }

    /// Replace every block `>= from` with a branch tagged `tag`, up to `head`.
    fn fork(&self, from: u64, tag: u8, head: u64) {
        let mut st = self.state.lock().unwrap();
        let parent = st.tags.get(&(from - 1)).map(|t| hash(*t, from - 1));
        st.tags.retain(|n, _| *n < from);
        st.logs.retain(|n, _| *n < from);
        st.parents.retain(|n, _| *n < from);
        if let Some(parent) = parent {
            st.parents.insert(from, parent);
        }
        for n in from..=head {
            st.tags.insert(n, tag);
        }
    }

    fn set_logs(&self, n: u64, logs: Vec<RawLog>) {
        self.state.lock().unwrap().logs.insert(n, logs);
    }

    fn hash_of(&self, n: u64) -> Option<String> {
        self.state.lock().unwrap().tags.get(&n).map(|t| hash(*t, n))
    }

    fn set_finality(&self, committed: Option<u64>, executed: Option<u64>) {
        let mut st = self.state.lock().unwrap();
        st.committed = committed;
        st.executed = executed;
    }

    fn fail_next(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64, ClientError> {
        let st = self.state.lock().unwrap();
        Ok(st.tags.keys().next_back().copied().unwrap_or(0))
    }

    async fn get_block(&self, id: BlockId) -> Result<Option<RawBlock>, ClientError> {
        let left = self.transient_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.transient_failures.store(left - 1, Ordering::SeqCst);
            return Err(ClientError::Transient("429 Too Many Requests".into()));
        }
        let BlockId::Number(n) = id else {
            return Err(ClientError::Permanent("lookup by hash unsupported".into()));
        };
        let st = self.state.lock().unwrap();
        let Some(tag) = st.tags.get(&n) else {
            return Ok(None);
        };
        let parent_hash = match st.parents.get(&n) {
            Some(p) => p.clone(),
            None if n == 0 => hash(0, u64::MAX >> 8),
            None => hash(st.tags[&(n - 1)], n - 1),
        };
        Ok(Some(RawBlock {
            number: n,
            hash: hash(*tag, n),
            parent_hash,
            miner: ZERO_ADDRESS.into(),
            timestamp: 1_700_000_000 + n as i64,
            transactions: vec![],
        }))
    }

    async fn get_receipts(&self, _block_number: u64) -> Result<Vec<RawReceipt>, ClientError> {
        Ok(vec![])
    }

    async fn get_logs(&self, block_number: u64) -> Result<Vec<RawLog>, ClientError> {
        let st = self.state.lock().unwrap();
        let block_hash = st.tags.get(&block_number).map(|t| hash(*t, block_number));
        Ok(st
            .logs
            .get(&block_number)
            .into_iter()
            .flatten()
            .map(|l| RawLog {
                block_hash: block_hash.clone(),
                ..l.clone()
            })
            .collect())
    }

    async fn token_metadata(&self, _address: &str) -> Result<TokenMetadata, ClientError> {
        Ok(TokenMetadata {
            symbol: "TST".into(),
            name: "Test Token".into(),
            decimals: 18,
            l1_address: None,
        })
    }

    async fn latest_block_with_status(
        &self,
        status: BlockStatus,
    ) -> Result<Option<u64>, ClientError> {
        let st = self.state.lock().unwrap();
        Ok(match status {
            BlockStatus::Committed => st.committed,
            BlockStatus::Executed => st.executed,
            _ => None,
        })
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn topic(addr: &str) -> String {
    format!("0x{:0>64}", addr.trim_start_matches("0x"))
}

fn transfer(log_index: u32, from: &str, to: &str, amount: u64) -> RawLog {
    RawLog {
        block_hash: None,
        log_index,
        transaction_hash: Some(format!("0x{log_index:064x}")),
        transaction_index: 0,
        address: TOKEN.into(),
        topics: vec![TRANSFER_TOPIC.into(), topic(from), topic(to)],
        data: format!("0x{amount:064x}"),
    }
}

fn unknown_log(log_index: u32) -> RawLog {
    RawLog {
        block_hash: None,
        log_index,
        transaction_hash: None,
        transaction_index: 0,
        address: TOKEN.into(),
        topics: vec![format!("0x{:064x}", 0xdead)],
        data: "0x".into(),
    }
}

fn config(to_block: u64) -> IndexerConfig {
    IndexerBuilder::new()
        .worker_id("test-worker")
        .to_block(to_block)
        .range_size(10)
        .poll_interval_ms(1)
        .retry(RetrySettings {
            max_retries: 5,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        })
        .build_config()
}

async fn run_worker(
    cfg: IndexerConfig,
    store: &Arc<InMemoryStorage>,
    chain: &Arc<MockChain>,
) -> (Result<(), IndexerError>, IndexerState) {
    let (_trigger, shutdown) = Shutdown::channel();
    let mut worker = Worker::new(
        cfg,
        store.clone(),
        chain.clone(),
        Arc::new(TransferDecoder),
        shutdown,
    );
    let result = worker.run().await;
    (result, worker.state())
}

fn amount(n: i64) -> Option<I256> {
    Some(I256::try_from(n).unwrap())
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn reprocessing_a_range_does_not_duplicate_transfers() {
    let chain = Arc::new(MockChain::new(105));
    chain.set_logs(
        102,
        vec![unknown_log(0), unknown_log(1), unknown_log(2), transfer(3, A, B, 5)],
    );
    let store = Arc::new(InMemoryStorage::new());

    let (result, _) = run_worker(config(105), &store, &chain).await;
    result.unwrap();
    assert_eq!(store.transfer_count().unwrap(), 1);
    assert_eq!(store.logs(102).unwrap().len(), 4);

    store.reopen_from(100).await.unwrap();
    let (result, state) = run_worker(config(105), &store, &chain).await;
    result.unwrap();
    assert_eq!(state, IndexerState::Stopped);

    assert_eq!(store.transfer_count().unwrap(), 1);
    assert!(store.transfer(102, 3).await.unwrap().is_some());
    let rows = store.address_transfers(B).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!((rows[0].block_number, rows[0].log_index), (102, 3));
    assert_eq!(store.balance_at(B, TOKEN, 105).await.unwrap(), amount(5));
}

#[tokio::test]
async fn transfer_moves_balance_between_accounts() {
    let chain = Arc::new(MockChain::new(60));
    chain.set_logs(10, vec![transfer(0, ZERO_ADDRESS, A, 1000)]);
    chain.set_logs(50, vec![transfer(0, A, B, 500)]);
    let store = Arc::new(InMemoryStorage::new());

    run_worker(config(60), &store, &chain).await.0.unwrap();

    assert_eq!(store.balance_at(A, TOKEN, 49).await.unwrap(), amount(1000));
    assert_eq!(store.balance_at(B, TOKEN, 49).await.unwrap(), None);
    assert_eq!(store.balance_at(A, TOKEN, 50).await.unwrap(), amount(500));
    assert_eq!(store.balance_at(B, TOKEN, 50).await.unwrap(), amount(500));
    assert_eq!(store.balance_at(ZERO_ADDRESS, TOKEN, 60).await.unwrap(), None);

    let token = store.token(TOKEN).await.unwrap().unwrap();
    assert_eq!((token.symbol.as_str(), token.block_number), ("TST", 10));
}

#[tokio::test]
async fn reorg_replaces_blocks_and_balances() {
    let chain = Arc::new(MockChain::new(105));
    chain.set_logs(1, vec![transfer(0, ZERO_ADDRESS, A, 1000)]);
    for n in 100..=103 {
        chain.set_logs(n, vec![transfer(0, A, B, 10)]);
    }
    chain.set_logs(104, vec![transfer(0, A, C, 1)]);
    let store = Arc::new(InMemoryStorage::new());
    run_worker(config(105), &store, &chain).await.0.unwrap();
    assert_eq!(store.balance_at(B, TOKEN, 105).await.unwrap(), amount(40));

    chain.fork(100, 1, 105);
    chain.set_logs(101, vec![transfer(0, A, D, 7)]);
    let (result, state) = run_worker(config(105), &store, &chain).await;
    result.unwrap();
    assert_eq!(state, IndexerState::Stopped);

    for n in 100..=105 {
        assert_eq!(store.block(n).await.unwrap().unwrap().hash, chain.hash_of(n).unwrap());
    }
    assert_eq!(store.block(99).await.unwrap().unwrap().hash, hash(0, 99));
    assert_eq!(store.balance_at(B, TOKEN, 105).await.unwrap(), None);
    assert_eq!(store.balance_at(C, TOKEN, 105).await.unwrap(), None);
    assert_eq!(store.balance_at(D, TOKEN, 105).await.unwrap(), amount(7));
    assert_eq!(store.balance_at(A, TOKEN, 105).await.unwrap(), amount(993));
    assert_eq!(store.transfers_between(100, 105).await.unwrap().len(), 1);

    let ranges = store.ranges().await.unwrap();
    assert_eq!(coverage_fault(&ranges, 0, 106), None);
}

#[tokio::test]
async fn parent_mismatch_mid_range_triggers_reorg() {
    let chain = Arc::new(MockChain::new(99));
    let store = Arc::new(InMemoryStorage::new());
    let mut cfg = config(99);
    cfg.range_size = 100;
    run_worker(cfg, &store, &chain).await.0.unwrap();

    chain.fork(98, 2, 105);
    let (result, _) = run_worker(config(105), &store, &chain).await;
    result.unwrap();

    for n in 97..=105 {
        assert_eq!(store.block(n).await.unwrap().unwrap().hash, chain.hash_of(n).unwrap());
    }
    assert_eq!(store.pending_hold().await.unwrap(), None);
    let ranges = store.ranges().await.unwrap();
    assert_eq!(coverage_fault(&ranges, 0, 106), None);
}

#[tokio::test]
async fn divergence_beyond_the_bound_is_fatal() {
    let chain = Arc::new(MockChain::new(20));
    let store = Arc::new(InMemoryStorage::new());
    run_worker(config(20), &store, &chain).await.0.unwrap();

    chain.fork(15, 3, 20);
    let mut cfg = config(20);
    cfg.max_reorg_depth = 2;
    let (result, state) = run_worker(cfg, &store, &chain).await;
    assert!(matches!(result, Err(IndexerError::ReorgTooDeep { .. })));
    assert_eq!(state, IndexerState::Error);
    assert_eq!(store.block(20).await.unwrap().unwrap().hash, hash(0, 20));
}

#[tokio::test]
async fn executed_blocks_are_never_rolled_back() {
    let chain = Arc::new(MockChain::new(20));
    let store = Arc::new(InMemoryStorage::new());
    run_worker(config(20), &store, &chain).await.0.unwrap();

    chain.set_finality(None, Some(16));
    let mut tracker = FinalityTracker::new(store.clone());
    tracker.poll_once(&*chain, &RetryPolicy::default()).await.unwrap();

    chain.fork(15, 4, 20);
    let (result, _) = run_worker(config(20), &store, &chain).await;
    assert!(matches!(result, Err(IndexerError::ReorgTooDeep { .. })));
    assert_eq!(store.block(16).await.unwrap().unwrap().hash, hash(0, 16));
}

#[tokio::test]
async fn backfill_script_is_repeatable() {
    let chain = Arc::new(MockChain::new(30));
    chain.set_logs(5, vec![transfer(0, ZERO_ADDRESS, A, 1000)]);
    chain.set_logs(12, vec![transfer(0, A, B, 300), transfer(1, B, C, 100)]);
    chain.set_logs(25, vec![transfer(0, C, A, 50)]);
    let store = Arc::new(InMemoryStorage::new());
    run_worker(config(30), &store, &chain).await.0.unwrap();

    let indexed: Vec<_> = balance_series(&store).await;

    let script = Arc::new(RecomputeBalances::new(store.clone()));
    let mut runner = BackfillRunner::new(store.clone());
    runner.register(script.clone());
    let report = runner.execute_pending().await.unwrap();
    assert_eq!(report.completed, vec!["recompute-balances-v2".to_string()]);
    let first = balance_series(&store).await;

    script.run(&serde_json::json!({ "chunk_blocks": 7 })).await.unwrap();
    let second = balance_series(&store).await;

    assert_eq!(first, indexed);
    assert_eq!(second, first);
    assert!(runner.execute_pending().await.unwrap().completed.is_empty());
    assert_eq!(
        store.script("recompute-balances-v2").await.unwrap().unwrap().status,
        ScriptMigrationStatus::Completed
    );
}

async fn balance_series(store: &Arc<InMemoryStorage>) -> Vec<(String, Vec<(u64, I256)>)> {
    let mut out = Vec::new();
    for addr in [A, B, C] {
        let series = store
            .balance_snapshots(addr, TOKEN)
            .await
            .unwrap()
            .into_iter()
            .map(|b| (b.block_number, b.balance))
            .collect();
        out.push((addr.to_string(), series));
    }
    out
}

#[tokio::test]
async fn status_only_moves_forward() {
    let chain = Arc::new(MockChain::new(20));
    let store = Arc::new(InMemoryStorage::new());
    run_worker(config(20), &store, &chain).await.0.unwrap();

    let retry = RetryPolicy::default();
    let mut tracker = FinalityTracker::new(store.clone());
    chain.set_finality(Some(15), Some(10));
    tracker.poll_once(&*chain, &retry).await.unwrap();

    let status = |n: u64| {
        let store = store.clone();
        async move { store.block(n).await.unwrap().unwrap().status }
    };
    assert_eq!(status(10).await, BlockStatus::Executed);
    assert_eq!(status(11).await, BlockStatus::Committed);
    assert_eq!(status(15).await, BlockStatus::Committed);
    assert_eq!(status(16).await, BlockStatus::Sealed);

    chain.set_finality(Some(12), Some(5));
    tracker.poll_once(&*chain, &retry).await.unwrap();
    assert_eq!(status(13).await, BlockStatus::Committed);
    assert_eq!(status(8).await, BlockStatus::Executed);

    assert!(store
        .advance_status(20, BlockStatus::Sealed, BlockStatus::Executed)
        .await
        .is_err());
    assert_eq!(store.highest_block_with_status(BlockStatus::Proven).await.unwrap(), Some(10));
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let chain = Arc::new(MockChain::new(5));
    chain.fail_next(3);
    let store = Arc::new(InMemoryStorage::new());
    run_worker(config(5), &store, &chain).await.0.unwrap();
    assert_eq!(store.blocks().unwrap().len(), 6);
}

#[tokio::test]
async fn failed_apply_is_retried_after_lease_expiry() {
    let chain = Arc::new(MockChain::new(9));
    let store = Arc::new(InMemoryStorage::new());
    store.fail_next_applies(1);
    let mut cfg = config(9);
    cfg.range_liveness_timeout_secs = 0;
    let (result, _) = run_worker(cfg, &store, &chain).await;
    result.unwrap();

    assert_eq!(store.blocks().unwrap().len(), 10);
    let ranges = store.ranges().await.unwrap();
    assert_eq!(coverage_fault(&ranges, 0, 10), None);
}

#[tokio::test]
async fn parallel_workers_cover_every_block_once() {
    let chain = Arc::new(MockChain::new(60));
    for n in (0..=60).step_by(3) {
        chain.set_logs(n, vec![transfer(0, A, B, 1)]);
    }
    let store = Arc::new(InMemoryStorage::new());
    let cfg = IndexerBuilder::from_config(config(60))
        .range_size(7)
        .workers(3)
        .build_config();
    let (_trigger, shutdown) = Shutdown::channel();

    run_indexer(cfg, store.clone(), chain.clone(), Arc::new(TransferDecoder), shutdown)
        .await
        .unwrap();

    assert_eq!(store.blocks().unwrap().len(), 61);
    let ranges = store.ranges().await.unwrap();
    assert_eq!(coverage_fault(&ranges, 0, 61), None);
    assert_eq!(store.balance_at(B, TOKEN, 60).await.unwrap(), amount(21));
    assert_eq!(store.balance_at(A, TOKEN, 60).await.unwrap(), amount(-21));
}

#[tokio::test]
async fn rollback_keeps_tokens_still_referenced_below_the_fork() {
    let chain = Arc::new(MockChain::new(200));
    chain.set_logs(150, vec![transfer(0, A, B, 3)]);
    chain.set_logs(200, vec![transfer(0, ZERO_ADDRESS, A, 10)]);
    let store = Arc::new(InMemoryStorage::new());
    let mut processor = BlockProcessor::new(
        store.clone(),
        chain.clone(),
        Arc::new(TransferDecoder),
        RetryPolicy::default(),
    );

    // A parallel worker reaches 200 first; 150 then finds the token already stored.
    let ws = processor.process(200).await.unwrap();
    assert_eq!(ws.tokens.len(), 1);
    store.apply(&ws).await.unwrap();
    let ws = processor.process(150).await.unwrap();
    assert!(ws.tokens.is_empty());
    store.apply(&ws).await.unwrap();

    store.rollback_from(180).await.unwrap();

    let token = store.token(TOKEN).await.unwrap().expect("token referenced at 150");
    assert_eq!(token.block_number, 150);
    assert_eq!(store.transfers_between(0, 200).await.unwrap().len(), 1);

    store.rollback_from(150).await.unwrap();
    assert_eq!(store.token(TOKEN).await.unwrap(), None);
}
