//! JSON-RPC Chain Client backed by `reqwest`.
//!
//! One HTTP call per request; retries are the block processor's business, so
//! every failure is classified as transient or permanent here and returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use chainscan_core::client::{
    BlockId, ChainClient, RawBlock, RawLog, RawReceipt, RawTransaction, TokenMetadata,
};
use chainscan_core::error::{ClientError, IndexerError};
use chainscan_core::types::{normalize_hex, BlockStatus};

use crate::decoder::abi_string_at;

/// JSON-RPC error codes nodes use for "slow down".
const RATE_LIMIT_CODES: &[i64] = &[-32005, -32029, 429];

const SYMBOL_SELECTOR: &str = "0x95d89b41";
const NAME_SELECTOR: &str = "0x06fdde03";
const DECIMALS_SELECTOR: &str = "0x313ce567";

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// Configuration for [`JsonRpcClient`].
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

pub struct JsonRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, config: RpcClientConfig) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| IndexerError::Config(format!("http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| ClientError::Transient(format!("{method}: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ClientError::Transient(format!("{method}: HTTP {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClientError::Permanent(format!("{method}: HTTP {status}: {body}")));
        }

        let body: JsonRpcResponse = resp.json().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Transient(format!("{method}: {e}"))
            } else {
                ClientError::Permanent(format!("{method}: malformed response: {e}"))
            }
        })?;
        if let Some(err) = body.error {
            return Err(classify_rpc_error(method, &err));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn eth_call(&self, to: &str, data: &str) -> Result<String, ClientError> {
        let result = self
            .call("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ClientError::Permanent("eth_call: non-string result".into()))
    }
}

fn classify_rpc_error(method: &str, err: &JsonRpcError) -> ClientError {
    let msg = err.message.to_ascii_lowercase();
    let transient = RATE_LIMIT_CODES.contains(&err.code)
        || msg.contains("rate limit")
        || msg.contains("timeout")
        || msg.contains("try again");
    let text = format!("{method}: JSON-RPC error {}: {}", err.code, err.message);
    if transient {
        ClientError::Transient(text)
    } else {
        ClientError::Permanent(text)
    }
}

// ─── Response parsing ────────────────────────────────────────────────────────

fn malformed(what: &str) -> ClientError {
    ClientError::Permanent(format!("malformed response: {what}"))
}

/// Parse a hex quantity (`0x1a`).
pub fn parse_hex_u64(s: &str) -> Result<u64, ClientError> {
    let body = s.strip_prefix("0x").unwrap_or(s);
    if body.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(body, 16).map_err(|_| malformed(s))
}

pub fn parse_hex_u256(s: &str) -> Result<U256, ClientError> {
    let body = s.strip_prefix("0x").unwrap_or(s);
    if body.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(body, 16).map_err(|_| malformed(s))
}

fn field<'a>(v: &'a Value, name: &str) -> Result<&'a str, ClientError> {
    v[name].as_str().ok_or_else(|| malformed(name))
}

fn quantity(v: &Value, name: &str) -> Result<u64, ClientError> {
    parse_hex_u64(field(v, name)?)
}

fn opt_address(v: &Value, name: &str) -> Option<String> {
    v[name].as_str().map(normalize_hex)
}

fn block_from_json(v: &Value) -> Result<RawBlock, ClientError> {
    let transactions = v["transactions"]
        .as_array()
        .map(|txs| {
            txs.iter()
                .map(transaction_from_json)
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();
    Ok(RawBlock {
        number: quantity(v, "number")?,
        hash: normalize_hex(field(v, "hash")?),
        parent_hash: normalize_hex(field(v, "parentHash")?),
        miner: opt_address(v, "miner").unwrap_or_default(),
        timestamp: quantity(v, "timestamp")? as i64,
        transactions,
    })
}

fn transaction_from_json(v: &Value) -> Result<RawTransaction, ClientError> {
    Ok(RawTransaction {
        hash: normalize_hex(field(v, "hash")?),
        from: normalize_hex(field(v, "from")?),
        to: opt_address(v, "to"),
        nonce: quantity(v, "nonce")?,
        index: quantity(v, "transactionIndex")? as u32,
        value: parse_hex_u256(v["value"].as_str().unwrap_or("0x0"))?,
    })
}

fn receipt_from_json(v: &Value) -> Result<RawReceipt, ClientError> {
    Ok(RawReceipt {
        transaction_hash: normalize_hex(field(v, "transactionHash")?),
        status: v["status"]
            .as_str()
            .map(parse_hex_u64)
            .transpose()?
            .unwrap_or(1) as u8,
        contract_address: opt_address(v, "contractAddress"),
        gas_used: parse_hex_u256(field(v, "gasUsed")?)?,
        log_count: v["logs"].as_array().map(|l| l.len() as u32).unwrap_or(0),
    })
}

fn log_from_json(v: &Value) -> Result<RawLog, ClientError> {
    let topics = v["topics"]
        .as_array()
        .ok_or_else(|| malformed("topics"))?
        .iter()
        .map(|t| t.as_str().map(normalize_hex).ok_or_else(|| malformed("topic")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(RawLog {
        block_hash: v["blockHash"].as_str().map(normalize_hex),
        log_index: quantity(v, "logIndex")? as u32,
        transaction_hash: opt_address(v, "transactionHash"),
        transaction_index: v["transactionIndex"]
            .as_str()
            .map(parse_hex_u64)
            .transpose()?
            .unwrap_or(0) as u32,
        address: normalize_hex(field(v, "address")?),
        topics,
        data: v["data"].as_str().unwrap_or("0x").to_string(),
    })
}

/// Decode an ABI `string` return value; falls back to a right-padded `bytes32`.
pub fn decode_abi_string(hex_data: &str) -> Option<String> {
    let bytes = hex::decode(hex_data.strip_prefix("0x").unwrap_or(hex_data)).ok()?;
    if bytes.len() >= 64 {
        if let Some(s) = abi_string_at(&bytes, 0) {
            return Some(s);
        }
    }
    if bytes.len() == 32 {
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(32);
        return Some(String::from_utf8_lossy(&bytes[..end]).into_owned());
    }
    None
}

// ─── ChainClient impl ────────────────────────────────────────────────────────

#[async_trait]
impl ChainClient for JsonRpcClient {
    async fn block_number(&self) -> Result<u64, ClientError> {
        let v = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(v.as_str().ok_or_else(|| malformed("eth_blockNumber"))?)
    }

    async fn get_block(&self, id: BlockId) -> Result<Option<RawBlock>, ClientError> {
        let v = match id {
            BlockId::Number(n) => {
                self.call("eth_getBlockByNumber", json!([format!("0x{n:x}"), true]))
                    .await?
            }
            BlockId::Hash(h) => self.call("eth_getBlockByHash", json!([h, true])).await?,
        };
        if v.is_null() {
            return Ok(None);
        }
        block_from_json(&v).map(Some)
    }

    async fn get_receipts(&self, block_number: u64) -> Result<Vec<RawReceipt>, ClientError> {
        let v = self
            .call("eth_getBlockReceipts", json!([format!("0x{block_number:x}")]))
            .await?;
        match v.as_array() {
            Some(items) => items.iter().map(receipt_from_json).collect(),
            None if v.is_null() => Ok(Vec::new()),
            None => Err(malformed("eth_getBlockReceipts")),
        }
    }

    async fn get_logs(&self, block_number: u64) -> Result<Vec<RawLog>, ClientError> {
        let n = format!("0x{block_number:x}");
        let v = self
            .call("eth_getLogs", json!([{ "fromBlock": n, "toBlock": n }]))
            .await?;
        let mut logs = v
            .as_array()
            .ok_or_else(|| malformed("eth_getLogs"))?
            .iter()
            .filter(|l| !l["removed"].as_bool().unwrap_or(false))
            .map(log_from_json)
            .collect::<Result<Vec<_>, _>>()?;
        logs.sort_by_key(|l| l.log_index);
        Ok(logs)
    }

    async fn token_metadata(&self, address: &str) -> Result<TokenMetadata, ClientError> {
        let symbol = self.eth_call(address, SYMBOL_SELECTOR).await?;
        let name = self.eth_call(address, NAME_SELECTOR).await?;
        let decimals = self.eth_call(address, DECIMALS_SELECTOR).await?;
        Ok(TokenMetadata {
            symbol: decode_abi_string(&symbol).unwrap_or_default(),
            name: decode_abi_string(&name).unwrap_or_default(),
            decimals: parse_hex_u256(&decimals)
                .ok()
                .and_then(|d| u8::try_from(d).ok())
                .unwrap_or(0),
            l1_address: None,
        })
    }

    async fn latest_block_with_status(
        &self,
        status: BlockStatus,
    ) -> Result<Option<u64>, ClientError> {
        let tag = match status {
            BlockStatus::Committed => "safe",
            BlockStatus::Executed => "finalized",
            BlockStatus::Sealed | BlockStatus::Proven => return Ok(None),
        };
        match self.call("eth_getBlockByNumber", json!([tag, false])).await {
            Ok(v) if v.is_null() => Ok(None),
            Ok(v) => quantity(&v, "number").map(Some),
            Err(ClientError::Permanent(reason)) => {
                tracing::debug!(tag, %reason, "Block tag not supported by node");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_quantities() {
        assert_eq!(parse_hex_u64("0x1").unwrap(), 1);
        assert_eq!(parse_hex_u64("0xff").unwrap(), 255);
        assert_eq!(parse_hex_u64("0x12a05f200").unwrap(), 5_000_000_000);
        assert!(parse_hex_u64("0xzz").is_err());
        assert_eq!(parse_hex_u256("0x016345785d8a0000").unwrap(), U256::from(100_000_000_000_000_000u64));
    }

    #[test]
    fn block_json_is_normalized() {
        let v = json!({
            "number": "0x64",
            "hash": "0xABCD",
            "parentHash": "0xAB",
            "miner": "0x0000000000000000000000000000000000000000",
            "timestamp": "0x10",
            "transactions": [{
                "hash": "0xFEED",
                "from": "0xA1",
                "to": null,
                "nonce": "0x2",
                "transactionIndex": "0x0",
                "value": "0x0"
            }]
        });
        let block = block_from_json(&v).unwrap();
        assert_eq!(block.number, 100);
        assert_eq!(block.hash, "0xabcd");
        assert_eq!(block.timestamp, 16);
        assert_eq!(block.transactions[0].hash, "0xfeed");
        assert_eq!(block.transactions[0].to, None);
    }

    #[test]
    fn missing_field_is_permanent() {
        let err = block_from_json(&json!({ "number": "0x1" })).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn rate_limits_are_transient() {
        let err = JsonRpcError {
            code: -32005,
            message: "limit exceeded".into(),
        };
        assert!(classify_rpc_error("eth_getLogs", &err).is_transient());
        let err = JsonRpcError {
            code: -32602,
            message: "invalid block number".into(),
        };
        assert!(!classify_rpc_error("eth_getBlockByNumber", &err).is_transient());
    }

    #[test]
    fn abi_string_decoding() {
        // "USDC" as an ABI-encoded dynamic string
        let encoded = format!(
            "0x{:064x}{:064x}{}{}",
            32,
            4,
            hex::encode("USDC"),
            "0".repeat(56)
        );
        assert_eq!(decode_abi_string(&encoded).as_deref(), Some("USDC"));

        let bytes32 = format!("0x{}{}", hex::encode("MKR"), "0".repeat(58));
        assert_eq!(decode_abi_string(&bytes32).as_deref(), Some("MKR"));
    }

    #[test]
    fn abi_string_with_huge_offset_is_rejected() {
        let encoded = format!("0x{:064x}{:064x}", usize::MAX - 8, 4);
        assert_eq!(decode_abi_string(&encoded), None);

        let len_overflow = format!("0x{:064x}{:064x}", 32, usize::MAX);
        assert_eq!(decode_abi_string(&len_overflow), None);
    }

    #[test]
    fn log_json_carries_block_hash() {
        let v = json!({
            "blockHash": "0xBEEF",
            "logIndex": "0x2",
            "transactionHash": "0xAA",
            "address": "0xC0",
            "topics": ["0xDD"],
            "data": "0x"
        });
        let log = log_from_json(&v).unwrap();
        assert_eq!(log.block_hash.as_deref(), Some("0xbeef"));
        assert_eq!(log.log_index, 2);
    }
}
