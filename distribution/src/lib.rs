//! LuckyMoney Distribution Engine
//!
//! Lucky-money distributions on top of the account ledger: a sender locks an
//! amount, it is split into shares, group members claim shares, and whatever
//! is left after the expiry window goes back to the sender.
//!
//! # Architecture
//!
//! - **Partition**: random or equal split of an integer-unit total
//! - **Engine**: create / activate / claim / expire, each a single ledger transaction
//! - **Scheduler**: min-heap of pending expiries drained by a bounded worker pool
//! - **Reconciler**: settles claims whose fund transfer did not commit
//! - **Funding**: external deposits and withdrawals behind a gateway trait
//!
//! # Example
//!
//! ```no_run
//! use luckymoney_distribution::{Config, CreateRequest, DistributionEngine, ExpiryQueue, Split};
//! use luckymoney_ledger::{Ledger, OwnerId};
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! fn main() -> luckymoney_distribution::Result<()> {
//!     let config = Config::default();
//!     let ledger = Arc::new(Ledger::open(&config.ledger)?);
//!     let engine = DistributionEngine::new(
//!         ledger,
//!         config.distribution.clone(),
//!         config.compensation.clone(),
//!         ExpiryQueue::new(),
//!     );
//!
//!     let distribution = engine.create(CreateRequest {
//!         sender: OwnerId(1),
//!         sender_name: "alice".to_string(),
//!         asset: config.asset.clone(),
//!         split: Split::Random { total: Decimal::new(1000, 2) },
//!         count: 3,
//!         message: "happy new year".to_string(),
//!     })?;
//!     let receipt = engine.claim(distribution.id, OwnerId(2), "bob")?;
//!     println!("bob got {}", receipt.amount);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod funding;
pub mod future;
pub mod notify;
pub mod partition;
pub mod reconcile;
pub mod scheduler;
pub mod types;

// Re-exports
pub use config::{Config, DistributionConfig, RetryConfig, SchedulerConfig, WithdrawConfig};
pub use engine::{DistributionEngine, Refund, SettledClaim};
pub use error::{Error, Result};
pub use funding::{
    ExternalTransaction, FundingService, TransferGateway, WithdrawOutcome, WithdrawRequest,
};
pub use future::{FutureRegistry, Waiter};
pub use notify::{Notice, NoticeSink, Pusher, TracingSink};
pub use partition::{partition, partition_with};
pub use reconcile::{ReconcileReport, Reconciler};
pub use scheduler::{ExpirationScheduler, ExpiryEntry, ExpiryQueue};
pub use types::{
    ClaimReceipt, CreateRequest, Distribution, DistributionId, DistributionState, Extremes,
    LocationRef, PendingSettlement, Share, ShareClaim, Split, SplitMode,
};
