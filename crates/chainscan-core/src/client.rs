//! The Chain Client capability consumed by the engine.
//!
//! Implementations live outside this crate (`chainscan-evm` ships a JSON-RPC
//! one). Every method distinguishes transient from permanent failures so that
//! callers can retry only the former.

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::types::BlockStatus;

/// Block selector for [`ChainClient::get_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockId {
    Number(u64),
    Hash(String),
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "#{n}"),
            Self::Hash(h) => f.write_str(h),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub nonce: u64,
    pub index: u32,
    pub value: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBlock {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub miner: String,
    pub timestamp: i64,
    pub transactions: Vec<RawTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawReceipt {
    pub transaction_hash: String,
    pub status: u8,
    pub contract_address: Option<String>,
    pub gas_used: U256,
    pub log_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLog {
    /// Hash of the block the node served this log from, when reported.
    #[serde(default)]
    pub block_hash: Option<String>,
    pub log_index: u32,
    pub transaction_hash: Option<String>,
    pub transaction_index: u32,
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub l1_address: Option<String>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current chain head.
    async fn block_number(&self) -> Result<u64, ClientError>;

    /// `Ok(None)` when the block does not exist (yet).
    async fn get_block(&self, id: BlockId) -> Result<Option<RawBlock>, ClientError>;

    async fn get_receipts(&self, block_number: u64) -> Result<Vec<RawReceipt>, ClientError>;

    async fn get_logs(&self, block_number: u64) -> Result<Vec<RawLog>, ClientError>;

    /// Decoded token metadata (symbol, name, decimals) for a token contract.
    async fn token_metadata(&self, address: &str) -> Result<TokenMetadata, ClientError>;

    /// Highest block the source reports at `status`, if it exposes that signal.
    async fn latest_block_with_status(
        &self,
        _status: BlockStatus,
    ) -> Result<Option<u64>, ClientError> {
        Ok(None)
    }
}
