//! Signed balance deltas derived from transfers.
//!
//! A block's transfers are folded into one delta per `(address, token)` so the
//! store writes a single snapshot per key per block.

use std::collections::BTreeMap;

use alloy_primitives::{I256, U256};
use serde::{Deserialize, Serialize};

use crate::types::{TokenType, Transfer, TransferType, ZERO_ADDRESS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub address: String,
    pub token_address: String,
    pub delta: I256,
}

/// Which accounts a transfer debits and credits.
///
/// Bridge deposits and withdrawals are records only: the token contract emits
/// its own mint/burn `Transfer` for the same movement. A base-token `Mint` has
/// no companion `Transfer`, so its deposit credits the receiver.
pub fn balance_legs(transfer: &Transfer) -> (Option<&str>, Option<&str>) {
    match transfer.kind {
        TransferType::Deposit if transfer.token_type == TokenType::BaseToken => {
            (None, Some(transfer.to.as_str()))
        }
        TransferType::Deposit | TransferType::Withdrawal => (None, None),
        TransferType::Transfer | TransferType::Fee | TransferType::Refund | TransferType::Mint => {
            (Some(transfer.from.as_str()), Some(transfer.to.as_str()))
        }
    }
}

/// Amount a transfer moves for balance purposes: ERC721 items count as one.
pub fn balance_amount(transfer: &Transfer) -> U256 {
    match transfer.token_type {
        TokenType::Erc721 => U256::from(1u8),
        _ => transfer.amount,
    }
}

/// Accumulates per-key deltas. The zero address is never a holder.
#[derive(Debug, Default, Clone)]
pub struct BalanceDeltas {
    deltas: BTreeMap<(String, String), I256>,
}

impl BalanceDeltas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_transfer(&mut self, transfer: &Transfer) {
        let amount = I256::from_raw(balance_amount(transfer));
        let (debit, credit) = balance_legs(transfer);
        if let Some(from) = debit {
            self.add(from, &transfer.token_address, -amount);
        }
        if let Some(to) = credit {
            self.add(to, &transfer.token_address, amount);
        }
    }

    pub fn add(&mut self, address: &str, token_address: &str, delta: I256) {
        if address == ZERO_ADDRESS {
            return;
        }
        let entry = self
            .deltas
            .entry((address.to_string(), token_address.to_string()))
            .or_insert(I256::ZERO);
        *entry += delta;
    }

    pub fn get(&self, address: &str, token_address: &str) -> I256 {
        self.deltas
            .get(&(address.to_string(), token_address.to_string()))
            .copied()
            .unwrap_or(I256::ZERO)
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Net deltas, dropping keys whose transfers cancelled out.
    pub fn into_vec(self) -> Vec<BalanceDelta> {
        self.deltas
            .into_iter()
            .filter(|(_, d)| !d.is_zero())
            .map(|((address, token_address), delta)| BalanceDelta {
                address,
                token_address,
                delta,
            })
            .collect()
    }
}
