//! Known-signature transfer decoder.
//!
//! Recognised events:
//!
//! | Event | Topics | Result |
//! |---|---|---|
//! | `Transfer(address,address,uint256)` | 3 | ERC20 (or base token at `0x…800a`) |
//! | `Transfer(address,address,uint256 indexed)` | 4 | ERC721, amount 1 |
//! | `Mint(address,uint256)` | 2 | base-token deposit |
//! | `Withdrawal(address,address,uint256)` | 3 | base-token withdrawal |
//! | `FinalizeDeposit(l1Sender,l2Receiver,l2Token,amount)` | 4 | bridge deposit |
//! | `WithdrawalInitiated(l2Sender,l1Receiver,l2Token,amount)` | 4 | bridge withdrawal |
//! | `BridgeInitialize(l1Token,name,symbol,decimals)` | 2 | token metadata with L1 address |
//!
//! A `Transfer` to the bootloader is a fee, one from the bootloader a refund,
//! one from the zero address a mint.

use alloy_primitives::U256;

use chainscan_core::decoder::LogDecoder;
use chainscan_core::error::DecodeError;
use chainscan_core::types::{
    Log, Token, TokenType, Transfer, TransferType, BASE_TOKEN_ADDRESS, BOOTLOADER_ADDRESS, ZERO_ADDRESS,
};

pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
pub const MINT_TOPIC: &str = "0x0f6798a560793a54c3bcfe86a93cde1e73087d944c0ea20544137d4121396885";
pub const WITHDRAWAL_TOPIC: &str =
    "0x2717ead6b9200dd235aad468c9809ea400fe33ac69b5bfaa6d3e90fc922b6398";
pub const FINALIZE_DEPOSIT_TOPIC: &str =
    "0xb84fba9af218da60d299dc177abd5805e7ac541d2673cbee7808c10017874f63";
pub const WITHDRAWAL_INITIATED_TOPIC: &str =
    "0x2fc3848834aac8e883a2d2a17a7514dc4f2d3dd268089df9b9f5d918259ef3b0";
pub const BRIDGE_INITIALIZATION_TOPIC: &str =
    "0xe6b2ac4004ee4493db8844da5db69722d2128345671818c3c41928655a83fb2c";
pub const BRIDGE_INITIALIZE_TOPIC: &str =
    "0x81e8e92e5873539605a102eddae7ed06d19bea042099a437cbc3644415eb7404";

/// ABI `string` whose offset sits in head word `head` of `bytes`.
///
/// Returns `None` when the offset or length points outside `bytes`.
pub fn abi_string_at(bytes: &[u8], head: usize) -> Option<String> {
    let word_at = |at: usize| -> Option<usize> {
        let word = bytes.get(at..at.checked_add(32)?)?;
        usize::try_from(U256::from_be_slice(word)).ok()
    };
    let offset = word_at(head.checked_mul(32)?)?;
    let len = word_at(offset)?;
    let start = offset.checked_add(32)?;
    let raw = bytes.get(start..start.checked_add(len)?)?;
    Some(String::from_utf8_lossy(raw).into_owned())
}

/// Decoder for the transfer-shaped events of an L2 explorer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferDecoder;

impl TransferDecoder {
    pub fn new() -> Self {
        Self
    }
}

struct Ctx<'a> {
    log: &'a Log,
}

impl<'a> Ctx<'a> {
    fn expect_topics(&self, expected: usize) -> Result<(), DecodeError> {
        if self.log.topics.len() != expected {
            return Err(DecodeError::TopicCount {
                block_number: self.log.block_number,
                log_index: self.log.log_index,
                expected,
                actual: self.log.topics.len(),
            });
        }
        Ok(())
    }

    fn malformed(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError::Malformed {
            block_number: self.log.block_number,
            log_index: self.log.log_index,
            reason: reason.into(),
        }
    }

    fn word(&self, topic: &str) -> Result<U256, DecodeError> {
        let body = topic.strip_prefix("0x").unwrap_or(topic);
        if body.len() != 64 {
            return Err(self.malformed(format!("topic '{topic}' is not 32 bytes")));
        }
        U256::from_str_radix(body, 16).map_err(|e| self.malformed(e.to_string()))
    }

    /// Address packed in the low 20 bytes of an indexed topic.
    fn address(&self, index: usize) -> Result<String, DecodeError> {
        let topic = &self.log.topics[index];
        self.word(topic)?;
        let body = topic.strip_prefix("0x").unwrap_or(topic);
        Ok(format!("0x{}", body[24..].to_ascii_lowercase()))
    }

    /// The first 32-byte word of `data`.
    fn amount(&self) -> Result<U256, DecodeError> {
        let data = self.log.data.strip_prefix("0x").unwrap_or(&self.log.data);
        let word = data
            .get(..64)
            .ok_or_else(|| self.malformed("data shorter than one word"))?;
        U256::from_str_radix(word, 16).map_err(|e| self.malformed(e.to_string()))
    }

    fn transfer(
        &self,
        from: String,
        to: String,
        token_address: String,
        amount: U256,
        kind: TransferType,
        token_type: TokenType,
    ) -> Transfer {
        Transfer {
            block_number: self.log.block_number,
            log_index: self.log.log_index,
            transaction_hash: self.log.transaction_hash.clone(),
            transaction_index: self.log.transaction_index,
            from,
            to,
            token_address,
            amount,
            kind,
            token_type,
            is_fee_or_refund: matches!(kind, TransferType::Fee | TransferType::Refund),
            token_id: None,
            timestamp: self.log.timestamp,
        }
    }

    fn token_type_of(&self, address: &str) -> TokenType {
        if address == BASE_TOKEN_ADDRESS {
            TokenType::BaseToken
        } else {
            TokenType::Erc20
        }
    }

    fn erc_transfer(&self) -> Result<Transfer, DecodeError> {
        let from = self.address(1)?;
        let to = self.address(2)?;
        let kind = if to == BOOTLOADER_ADDRESS {
            TransferType::Fee
        } else if from == BOOTLOADER_ADDRESS {
            TransferType::Refund
        } else if from == ZERO_ADDRESS {
            TransferType::Mint
        } else {
            TransferType::Transfer
        };
        let token_address = self.log.address.to_ascii_lowercase();

        if self.log.topics.len() == 4 {
            let token_id = self.word(&self.log.topics[3])?;
            let mut t = self.transfer(
                from,
                to,
                token_address,
                U256::from(1u8),
                kind,
                TokenType::Erc721,
            );
            t.token_id = Some(token_id);
            return Ok(t);
        }
        self.expect_topics(3)?;
        let token_type = self.token_type_of(&token_address);
        Ok(self.transfer(from, to, token_address, self.amount()?, kind, token_type))
    }

    fn base_token_mint(&self) -> Result<Transfer, DecodeError> {
        self.expect_topics(2)?;
        let account = self.address(1)?;
        Ok(self.transfer(
            account.clone(),
            account,
            BASE_TOKEN_ADDRESS.to_string(),
            self.amount()?,
            TransferType::Deposit,
            TokenType::BaseToken,
        ))
    }

    fn base_token_withdrawal(&self) -> Result<Transfer, DecodeError> {
        self.expect_topics(3)?;
        Ok(self.transfer(
            self.address(1)?,
            self.address(2)?,
            BASE_TOKEN_ADDRESS.to_string(),
            self.amount()?,
            TransferType::Withdrawal,
            TokenType::BaseToken,
        ))
    }

    /// `FinalizeDeposit` and `WithdrawalInitiated` share one layout:
    /// `[sig, from, to, l2Token]`, amount in data. A zero token is the base token.
    fn bridge(&self, kind: TransferType) -> Result<Transfer, DecodeError> {
        self.expect_topics(4)?;
        let mut token_address = self.address(3)?;
        if token_address == ZERO_ADDRESS {
            token_address = BASE_TOKEN_ADDRESS.to_string();
        }
        let token_type = self.token_type_of(&token_address);
        Ok(self.transfer(
            self.address(1)?,
            self.address(2)?,
            token_address,
            self.amount()?,
            kind,
            token_type,
        ))
    }
    /// `[sig, l1Token]`, data `(string name, string symbol, uint8 decimals)`.
    /// The emitting contract is the L2 token.
    fn bridge_initialize(&self) -> Result<Token, DecodeError> {
        self.expect_topics(2)?;
        let l1_address = self.address(1)?;
        let data = self.log.data.strip_prefix("0x").unwrap_or(&self.log.data);
        let bytes = hex::decode(data).map_err(|e| self.malformed(e.to_string()))?;
        let name = abi_string_at(&bytes, 0).ok_or_else(|| self.malformed("bad name offset"))?;
        let symbol = abi_string_at(&bytes, 1).ok_or_else(|| self.malformed("bad symbol offset"))?;
        let decimals = bytes
            .get(64..96)
            .map(U256::from_be_slice)
            .and_then(|d| u8::try_from(d).ok())
            .ok_or_else(|| self.malformed("bad decimals"))?;
        Ok(Token {
            l2_address: self.log.address.to_ascii_lowercase(),
            l1_address: Some(l1_address),
            symbol,
            name,
            decimals,
            token_type: TokenType::Erc20,
            block_number: self.log.block_number,
        })
    }
}

impl LogDecoder for TransferDecoder {
    fn decode(&self, log: &Log) -> Result<Option<Transfer>, DecodeError> {
        let Some(topic0) = log.topic0() else {
            return Ok(None);
        };
        let ctx = Ctx { log };
        let transfer = match topic0.to_ascii_lowercase().as_str() {
            TRANSFER_TOPIC => {
                if log.topics.len() < 3 {
                    // Transfer with unindexed arguments: not a token transfer we track.
                    return Ok(None);
                }
                ctx.erc_transfer()?
            }
            MINT_TOPIC if log.address == BASE_TOKEN_ADDRESS => ctx.base_token_mint()?,
            WITHDRAWAL_TOPIC if log.address == BASE_TOKEN_ADDRESS => ctx.base_token_withdrawal()?,
            FINALIZE_DEPOSIT_TOPIC => ctx.bridge(TransferType::Deposit)?,
            WITHDRAWAL_INITIATED_TOPIC => ctx.bridge(TransferType::Withdrawal)?,
            _ => return Ok(None),
        };
        Ok(Some(transfer))
    }

    fn announced_token(&self, log: &Log) -> Result<Option<Token>, DecodeError> {
        let Some(topic0) = log.topic0() else {
            return Ok(None);
        };
        match topic0.to_ascii_lowercase().as_str() {
            BRIDGE_INITIALIZATION_TOPIC | BRIDGE_INITIALIZE_TOPIC => {
                Ctx { log }.bridge_initialize().map(Some)
            }
            _ => Ok(None),
        }
    }
}
