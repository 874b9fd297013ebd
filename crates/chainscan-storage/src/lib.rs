//! chainscan-storage: storage backends for ChainScan.
//!
//! Backends:
//! - [`memory`]: in-memory (dev/testing, no persistence)
//! - `postgres`: PostgreSQL via `sqlx` (feature `postgres`)
//!
//! Both implement every store trait of `chainscan-core`, so either can be
//! handed to a worker as `Arc<dyn Store>`.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStorage;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresStorage};
