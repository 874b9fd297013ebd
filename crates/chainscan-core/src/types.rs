//! Persisted entity types.
//!
//! Hashes and addresses are lower-cased `0x…` hex strings; amounts are
//! 256-bit integers.

use alloy_primitives::{I256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// The zero address: mint source and burn sink, never a balance holder.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// L2 address of the chain-native (base) token.
pub const BASE_TOKEN_ADDRESS: &str = "0x000000000000000000000000000000000000800a";

/// The bootloader collects fees and pays refunds.
pub const BOOTLOADER_ADDRESS: &str = "0x0000000000000000000000000000000000008001";

/// Lower-case an address or hash and make sure it carries the `0x` prefix.
pub fn normalize_hex(s: &str) -> String {
    let body = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    format!("0x{}", body.to_ascii_lowercase())
}

// ─── BlockStatus ─────────────────────────────────────────────────────────────

/// Finality of a persisted block. Ordered: `Sealed < Committed < Proven < Executed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Sealed,
    Committed,
    Proven,
    Executed,
}

impl BlockStatus {
    pub const ALL: [BlockStatus; 4] = [
        BlockStatus::Sealed,
        BlockStatus::Committed,
        BlockStatus::Proven,
        BlockStatus::Executed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sealed => "sealed",
            Self::Committed => "committed",
            Self::Proven => "proven",
            Self::Executed => "executed",
        }
    }

    /// The next state in the linear progression, if any.
    pub fn next(&self) -> Option<BlockStatus> {
        match self {
            Self::Sealed => Some(Self::Committed),
            Self::Committed => Some(Self::Proven),
            Self::Proven => Some(Self::Executed),
            Self::Executed => None,
        }
    }

    /// Returns `true` if moving from `self` to `target` goes forward.
    pub fn can_advance_to(&self, target: BlockStatus) -> bool {
        target > *self
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BlockStatus {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sealed" => Ok(Self::Sealed),
            "committed" => Ok(Self::Committed),
            "proven" => Ok(Self::Proven),
            "executed" => Ok(Self::Executed),
            other => Err(IndexerError::Other(format!("unknown block status '{other}'"))),
        }
    }
}

// ─── Transfer / token enums ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    Deposit,
    Transfer,
    Withdrawal,
    Fee,
    Mint,
    Refund,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Transfer => "transfer",
            Self::Withdrawal => "withdrawal",
            Self::Fee => "fee",
            Self::Mint => "mint",
            Self::Refund => "refund",
        }
    }
}

impl std::str::FromStr for TransferType {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(Self::Deposit),
            "transfer" => Ok(Self::Transfer),
            "withdrawal" => Ok(Self::Withdrawal),
            "fee" => Ok(Self::Fee),
            "mint" => Ok(Self::Mint),
            "refund" => Ok(Self::Refund),
            other => Err(IndexerError::Other(format!("unknown transfer type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenType {
    /// The chain-native token.
    #[serde(rename = "BASETOKEN")]
    BaseToken,
    #[serde(rename = "ERC20")]
    Erc20,
    #[serde(rename = "ERC721")]
    Erc721,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BaseToken => "BASETOKEN",
            Self::Erc20 => "ERC20",
            Self::Erc721 => "ERC721",
        }
    }
}

impl std::str::FromStr for TokenType {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BASETOKEN" => Ok(Self::BaseToken),
            "ERC20" => Ok(Self::Erc20),
            "ERC721" => Ok(Self::Erc721),
            other => Err(IndexerError::Other(format!("unknown token type '{other}'"))),
        }
    }
}

// ─── Chain entities ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub miner: String,
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    pub tx_count: u32,
    pub status: BlockStatus,
}

impl Block {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub block_number: u64,
    pub from: String,
    /// `None` for contract creation.
    pub to: Option<String>,
    pub nonce: u64,
    pub index: u32,
    pub value: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    /// 1 = success, 0 = reverted.
    pub status: u8,
    pub contract_address: Option<String>,
    pub gas_used: U256,
    pub log_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub block_number: u64,
    pub log_index: u32,
    pub transaction_hash: Option<String>,
    pub transaction_index: u32,
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub timestamp: i64,
}

impl Log {
    /// `topics[0]`: the event signature hash.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub block_number: u64,
    pub log_index: u32,
    pub transaction_hash: Option<String>,
    pub transaction_index: u32,
    pub from: String,
    pub to: String,
    pub token_address: String,
    pub amount: U256,
    pub kind: TransferType,
    pub token_type: TokenType,
    pub is_fee_or_refund: bool,
    /// ERC721 token id.
    pub token_id: Option<U256>,
    pub timestamp: i64,
}

impl Transfer {
    /// Distinct participants, in `from`, `to` order.
    pub fn participants(&self) -> Vec<&str> {
        if self.from == self.to {
            vec![self.from.as_str()]
        } else {
            vec![self.from.as_str(), self.to.as_str()]
        }
    }
}

/// Per-participant copy of a [`Transfer`], keyed by `(address, block_number, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTransfer {
    pub address: String,
    pub block_number: u64,
    pub log_index: u32,
    pub transaction_hash: Option<String>,
    pub token_address: String,
    pub amount: U256,
    pub kind: TransferType,
    pub token_type: TokenType,
    pub is_fee_or_refund: bool,
    pub timestamp: i64,
}

impl AddressTransfer {
    /// One row per distinct participant of `transfer`.
    pub fn from_transfer(transfer: &Transfer) -> Vec<AddressTransfer> {
        transfer
            .participants()
            .into_iter()
            .map(|address| AddressTransfer {
                address: address.to_string(),
                block_number: transfer.block_number,
                log_index: transfer.log_index,
                transaction_hash: transfer.transaction_hash.clone(),
                token_address: transfer.token_address.clone(),
                amount: transfer.amount,
                kind: transfer.kind,
                token_type: transfer.token_type,
                is_fee_or_refund: transfer.is_fee_or_refund,
                timestamp: transfer.timestamp,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub l2_address: String,
    pub l1_address: Option<String>,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    pub token_type: TokenType,
    /// Block of the first transfer that referenced the token.
    pub block_number: u64,
}

impl Token {
    /// The chain-native token row seeded on first apply.
    pub fn base_token() -> Self {
        Self {
            l2_address: BASE_TOKEN_ADDRESS.to_string(),
            l1_address: Some(ZERO_ADDRESS.to_string()),
            symbol: "ETH".into(),
            name: "Ether".into(),
            decimals: 18,
            token_type: TokenType::BaseToken,
            block_number: 0,
        }
    }
}

/// Point-in-time balance: cumulative sum of deltas for the key up to `block_number`.
///
/// Signed: a negative value only appears when indexing started after genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub address: String,
    pub token_address: String,
    pub block_number: u64,
    pub balance: I256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftItem {
    pub token_id: U256,
    pub token_address: String,
    pub owner: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub metadata_url: Option<String>,
    /// `(block_number, log_index)` of the transfer that set `owner`.
    pub last_transfer: (u64, u32),
}

// ─── Scan ranges ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeStatus {
    /// Owned by a worker; reclaimable once its lease expires.
    Claimed,
    Completed,
    /// Invalidated by a reorg; served before any fresh window.
    Reopened,
}

impl RangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Reopened => "reopened",
        }
    }
}

impl std::str::FromStr for RangeStatus {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claimed" => Ok(Self::Claimed),
            "completed" => Ok(Self::Completed),
            "reopened" => Ok(Self::Reopened),
            other => Err(IndexerError::Other(format!("unknown range status '{other}'"))),
        }
    }
}

/// Inclusive window `[from, to]` of block numbers owned by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockScanRange {
    pub id: u64,
    pub from: u64,
    pub to: u64,
    pub status: RangeStatus,
    pub owner: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl BlockScanRange {
    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn contains(&self, number: u64) -> bool {
        (self.from..=self.to).contains(&number)
    }

    pub fn blocks(&self) -> std::ops::RangeInclusive<u64> {
        self.from..=self.to
    }
}

// ─── Script migrations ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptMigrationStatus {
    NotStarted,
    Pending,
    Failed,
    Completed,
    Outdated,
}

impl ScriptMigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Outdated => "outdated",
        }
    }

    /// Allowed transitions. `Failed -> Pending` is the retry on a later run;
    /// `Completed` only ever moves to `Outdated`.
    pub fn can_transition_to(&self, target: ScriptMigrationStatus) -> bool {
        use ScriptMigrationStatus::*;
        matches!(
            (self, target),
            (NotStarted, Pending)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Failed, Pending)
                | (NotStarted, Outdated)
                | (Failed, Outdated)
                | (Completed, Outdated)
        )
    }

    /// Statuses the runner picks up. `Pending` here means a run was interrupted.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::NotStarted | Self::Pending | Self::Failed)
    }
}

impl std::fmt::Display for ScriptMigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScriptMigrationStatus {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            "outdated" => Ok(Self::Outdated),
            other => Err(IndexerError::Other(format!("unknown script status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptMigration {
    pub name: String,
    /// Ordering key; scripts run oldest first.
    pub timestamp: i64,
    pub status: ScriptMigrationStatus,
    pub params: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str, parent: &str) -> Block {
        Block {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            miner: ZERO_ADDRESS.into(),
            timestamp: (number * 2) as i64,
            tx_count: 0,
            status: BlockStatus::Sealed,
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = block(99, "0x99", "0x98");
        let child = block(100, "0x100", "0x99");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
        assert!(!block(101, "0x101", "0x99").extends(&parent)); // gap
    }

    #[test]
    fn status_order_is_linear() {
        assert!(BlockStatus::Sealed < BlockStatus::Committed);
        assert!(BlockStatus::Committed < BlockStatus::Proven);
        assert!(BlockStatus::Proven < BlockStatus::Executed);
        assert_eq!(BlockStatus::Proven.next(), Some(BlockStatus::Executed));
        assert_eq!(BlockStatus::Executed.next(), None);
        assert!(!BlockStatus::Executed.can_advance_to(BlockStatus::Sealed));
        assert!(!BlockStatus::Committed.can_advance_to(BlockStatus::Committed));
    }

    #[test]
    fn normalize_hex_lowercases() {
        assert_eq!(normalize_hex("0xAbCd"), "0xabcd");
        assert_eq!(normalize_hex("ABCD"), "0xabcd");
    }

    #[test]
    fn address_transfer_one_row_per_participant() {
        let mut t = Transfer {
            block_number: 1,
            log_index: 0,
            transaction_hash: None,
            transaction_index: 0,
            from: "0xa".into(),
            to: "0xb".into(),
            token_address: BASE_TOKEN_ADDRESS.into(),
            amount: U256::from(5),
            kind: TransferType::Transfer,
            token_type: TokenType::BaseToken,
            is_fee_or_refund: false,
            token_id: None,
            timestamp: 0,
        };
        assert_eq!(AddressTransfer::from_transfer(&t).len(), 2);
        t.to = "0xa".into(); // self-transfer
        assert_eq!(AddressTransfer::from_transfer(&t).len(), 1);
    }

    #[test]
    fn script_status_transitions() {
        use ScriptMigrationStatus::*;
        assert!(NotStarted.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(Completed.can_transition_to(Outdated));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(NotStarted));
        assert!(!Outdated.can_transition_to(Pending));
        assert!(!Completed.is_runnable());
        assert!(Failed.is_runnable());
    }
}
