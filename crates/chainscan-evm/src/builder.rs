//! Fluent builder API for indexer configuration.
//!
//! # Example
//!
//! ```rust,no_run
//! use chainscan_evm::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .worker_id("scanner-a")
//!     .from_block(1_000_000)
//!     .range_size(250)
//!     .workers(4)
//!     .build_config();
//! ```

use chainscan_core::indexer::{IndexerConfig, RetrySettings};

/// Fluent builder for `IndexerConfig`.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Start from an existing configuration (e.g. one loaded from a file).
    pub fn from_config(config: IndexerConfig) -> Self {
        Self { config }
    }

    /// Set the worker identity written as range owner.
    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = id.into();
        self
    }

    /// Set the start block.
    pub fn from_block(mut self, block: u64) -> Self {
        self.config.from_block = block;
        self
    }

    /// Set the end block (for bounded backfill).
    pub fn to_block(mut self, block: u64) -> Self {
        self.config.to_block = Some(block);
        self
    }

    /// Set the maximum number of blocks per claimed range.
    pub fn range_size(mut self, size: u64) -> Self {
        self.config.range_size = size;
        self
    }

    /// Set rows per multi-row insert.
    pub fn write_chunk_size(mut self, rows: usize) -> Self {
        self.config.write_chunk_size = rows;
        self
    }

    /// Set how long a silent claim is honoured before it can be reclaimed.
    pub fn range_liveness_timeout_secs(mut self, secs: u64) -> Self {
        self.config.range_liveness_timeout_secs = secs;
        self
    }

    /// Set the divergence-search bound.
    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.config.max_reorg_depth = depth;
        self
    }

    /// Set live mode polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn finality_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.finality_poll_interval_ms = ms;
        self
    }

    /// Set the number of parallel workers.
    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n;
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }
}
