//! chainscan-core: foundation of the ChainScan chain-indexing engine.
//!
//! # Architecture
//!
//! ```text
//! Worker loop (chainscan-evm)
//!   ├── RangeScheduler   (claim / complete / reopen over BlockScanRange rows)
//!   ├── BlockProcessor   (ChainClient + LogDecoder → WriteSet per block)
//!   ├── ReorgDetector    (divergence search, bounded lookback)
//!   ├── IndexStore       (atomic, idempotent apply; rollback per block)
//!   └── FinalityTracker  (sealed → committed → proven → executed)
//! BackfillRunner          (ScriptMigration status machine)
//! ```
//!
//! Storage backends live in `chainscan-storage`; the JSON-RPC client, decoder
//! and worker loop live in `chainscan-evm`.

pub mod backfill;
pub mod balance;
pub mod client;
pub mod decoder;
pub mod error;
pub mod finality;
pub mod indexer;
pub mod metrics;
pub mod reorg;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod tracker;
pub mod types;
pub mod write_set;

pub use backfill::{BackfillReport, BackfillRunner, BackfillScript};
pub use balance::{BalanceDelta, BalanceDeltas};
pub use client::{BlockId, ChainClient, RawBlock, RawLog, RawReceipt, RawTransaction, TokenMetadata};
pub use decoder::LogDecoder;
pub use error::{ClientError, DecodeError, IndexerError};
pub use finality::{FinalitySignal, FinalityTracker};
pub use indexer::{IndexerConfig, IndexerState, RetrySettings};
pub use metrics::IndexerMetrics;
pub use reorg::{ReorgDetector, ReorgEvent};
pub use retry::RetryPolicy;
pub use scheduler::RangeScheduler;
pub use store::{ApplyOutcome, ClaimOutcome, ClaimRequest, IndexStore, RangeStore, ScriptStore, Store};
pub use tracker::BlockTracker;
pub use types::{
    AddressTransfer, Balance, Block, BlockScanRange, BlockStatus, Log, NftItem, RangeStatus,
    ScriptMigration, ScriptMigrationStatus, Token, TokenType, Transaction, TransactionReceipt,
    Transfer, TransferType,
};
pub use write_set::WriteSet;
