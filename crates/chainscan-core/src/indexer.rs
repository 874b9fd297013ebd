//! Indexer configuration and state types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Configuration for an indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Identity written as the owner of claimed ranges.
    pub worker_id: String,
    /// First block to index.
    pub from_block: u64,
    /// Optional end block (for bounded backfill). `None` = follow the tip forever.
    pub to_block: Option<u64>,
    /// Maximum number of blocks handed out per claim.
    pub range_size: u64,
    /// Rows per multi-row insert when a write set is persisted.
    pub write_chunk_size: usize,
    /// A claimed range whose owner has been silent this long may be reclaimed.
    pub range_liveness_timeout_secs: u64,
    /// How far below the detection point the divergence search may walk.
    pub max_reorg_depth: u64,
    /// Idle sleep between claims when caught up with the tip (milliseconds).
    pub poll_interval_ms: u64,
    /// Finality polling interval (milliseconds).
    pub finality_poll_interval_ms: u64,
    /// Number of worker tasks started by the runner.
    pub workers: usize,
    pub retry: RetrySettings,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-0".into(),
            from_block: 0,
            to_block: None,
            range_size: 100,
            write_chunk_size: 200,
            range_liveness_timeout_secs: 300,
            max_reorg_depth: 1000,
            poll_interval_ms: 1000,
            finality_poll_interval_ms: 10_000,
            workers: 1,
            retry: RetrySettings::default(),
        }
    }
}

impl IndexerConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.range_liveness_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn finality_poll_interval(&self) -> Duration {
        Duration::from_millis(self.finality_poll_interval_ms)
    }

    /// Reject combinations that would make the scheduler hand out nothing or loop.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.worker_id.trim().is_empty() {
            return Err(IndexerError::Config("worker_id must not be empty".into()));
        }
        if self.range_size == 0 {
            return Err(IndexerError::Config("range_size must be at least 1".into()));
        }
        if self.write_chunk_size == 0 {
            return Err(IndexerError::Config("write_chunk_size must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(IndexerError::Config("workers must be at least 1".into()));
        }
        if let Some(to) = self.to_block {
            if to < self.from_block {
                return Err(IndexerError::Config(format!(
                    "to_block {to} is below from_block {}",
                    self.from_block
                )));
            }
        }
        if self.retry.multiplier < 1.0 {
            return Err(IndexerError::Config("retry.multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

/// Exponential backoff for transient Chain Client failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retry attempts after the first try.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Runtime state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Processing a claimed range.
    Scanning,
    /// Nothing to claim; polling for new blocks.
    Live,
    /// Running the reorg protocol.
    ReorgRecovery,
    /// Shutting down gracefully.
    Stopping,
    /// Terminated.
    Stopped,
    /// Encountered an unrecoverable error.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::Live => write!(f, "live"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}
