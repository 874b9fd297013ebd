//! The atomically applied output of processing one block.

use serde::{Deserialize, Serialize};

use crate::balance::BalanceDelta;
use crate::types::{
    AddressTransfer, Block, Log, NftItem, Token, Transaction, TransactionReceipt, Transfer,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteSet {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    pub receipts: Vec<TransactionReceipt>,
    pub logs: Vec<Log>,
    pub transfers: Vec<Transfer>,
    pub address_transfers: Vec<AddressTransfer>,
    pub balance_deltas: Vec<BalanceDelta>,
    pub nft_updates: Vec<NftItem>,
    /// Tokens first seen in this block.
    pub tokens: Vec<Token>,
}

impl WriteSet {
    pub fn new(block: Block) -> Self {
        Self {
            block,
            transactions: Vec::new(),
            receipts: Vec::new(),
            logs: Vec::new(),
            transfers: Vec::new(),
            address_transfers: Vec::new(),
            balance_deltas: Vec::new(),
            nft_updates: Vec::new(),
            tokens: Vec::new(),
        }
    }

    pub fn block_number(&self) -> u64 {
        self.block.number
    }

    /// Total rows this write set produces (excluding the block row).
    pub fn row_count(&self) -> usize {
        self.transactions.len()
            + self.receipts.len()
            + self.logs.len()
            + self.transfers.len()
            + self.address_transfers.len()
            + self.balance_deltas.len()
            + self.nft_updates.len()
            + self.tokens.len()
    }
}
