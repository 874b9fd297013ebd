//! chainscan-evm: JSON-RPC chain client, transfer decoder, block processor
//! and the worker loop.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainscan_evm::{run_indexer, IndexerBuilder, JsonRpcClient, RpcClientConfig, Shutdown, TransferDecoder};
//! use chainscan_storage::InMemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = IndexerBuilder::new().from_block(0).to_block(10_000).build_config();
//! let client = Arc::new(JsonRpcClient::new("http://localhost:3050", RpcClientConfig::default())?);
//! let store = Arc::new(InMemoryStorage::new());
//! let (_trigger, shutdown) = Shutdown::channel();
//! run_indexer(config, store, client, Arc::new(TransferDecoder), shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod decoder;
pub mod processor;
pub mod rpc;
pub mod scripts;
pub mod worker;

pub use builder::IndexerBuilder;
pub use decoder::TransferDecoder;
pub use processor::BlockProcessor;
pub use rpc::{JsonRpcClient, RpcClientConfig};
pub use scripts::{default_scripts, RebuildAddressTransfers, RecomputeBalances};
pub use worker::{run_finality, run_indexer, Shutdown, Worker};
