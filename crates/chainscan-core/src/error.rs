//! Error types for the chainscan pipeline.

use thiserror::Error;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(#[from] ClientError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Reorg detected at block {block_number}: expected parent {expected}, got {actual}")]
    ReorgDetected {
        block_number: u64,
        expected: String,
        actual: String,
    },

    #[error("Reorg deeper than {max_depth} blocks below block {detected_at}")]
    ReorgTooDeep { detected_at: u64, max_depth: u64 },

    #[error("Range [{from}, {to}] stuck at block {block_number}: {reason}")]
    RangeStuck {
        from: u64,
        to: u64,
        block_number: u64,
        reason: String,
    },

    #[error("Invalid status transition for '{entity}': {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backfill script '{name}' failed: {reason}")]
    Script { name: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error is a reorg signal (recoverable).
    pub fn is_reorg(&self) -> bool {
        matches!(self, Self::ReorgDetected { .. })
    }

    /// Returns `true` if the owning control loop must stop and surface the error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ReorgTooDeep { .. } | Self::Config(_) | Self::InvalidTransition { .. }
        )
    }

    pub fn storage(e: impl std::fmt::Display) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Failures reported by a [`ChainClient`](crate::client::ChainClient).
///
/// The block processor retries only [`ClientError::Transient`].
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Timeout, rate limit, dropped connection, 5xx.
    #[error("transient: {0}")]
    Transient(String),

    /// Invalid or pruned block number, malformed response, execution error.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A single log could not be turned into a transfer.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("log {log_index} in block {block_number}: expected {expected} topics, got {actual}")]
    TopicCount {
        block_number: u64,
        log_index: u32,
        expected: usize,
        actual: usize,
    },

    #[error("log {log_index} in block {block_number}: malformed payload: {reason}")]
    Malformed {
        block_number: u64,
        log_index: u32,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_classification() {
        assert!(ClientError::Transient("429".into()).is_transient());
        assert!(!ClientError::Permanent("pruned".into()).is_transient());
    }

    #[test]
    fn reorg_is_not_fatal() {
        let e = IndexerError::ReorgDetected {
            block_number: 10,
            expected: "0xa".into(),
            actual: "0xb".into(),
        };
        assert!(e.is_reorg());
        assert!(!e.is_fatal());
        assert!(IndexerError::ReorgTooDeep { detected_at: 10, max_depth: 5 }.is_fatal());
    }
}
