//! LuckyMoney Ledger Core
//!
//! Account ledger for chat lucky-money distributions, on top of an embedded
//! transactional keyspace (RocksDB).
//!
//! # Architecture
//!
//! - **Keyspace Store**: snapshot reads, serialized buffered writes committed as one batch
//! - **Ledger**: available/locked balances with an append-only audit log per owner
//! - **Exact money**: `Decimal` amounts at a fixed precision, convertible to integer units
//!
//! # Invariants
//!
//! - `available >= 0` and `locked >= 0` for every account
//! - Version ids are strictly increasing per owner and records are never mutated
//! - A failed transaction leaves no partial writes behind

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod amount;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod storage;
pub mod types;

// Re-exports
pub use amount::Precision;
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use metrics::LedgerMetrics;
pub use storage::{KeyspaceRead, ReadTxn, Store, Table, WriteTxn};
pub use types::{Account, ExternalDeposit, OwnerId, Reason, VersionRecord, VersionRefs};
