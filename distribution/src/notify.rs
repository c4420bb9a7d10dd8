//! Outbound notices
//!
//! Producers hand notices to a [`Pusher`], which queues them on an unbounded
//! channel. A single consumer task drains the queue into a [`NoticeSink`], so
//! money-moving code never waits on chat delivery.

use crate::{types::DistributionId, Result};
use async_trait::async_trait;
use luckymoney_ledger::OwnerId;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Something a user should be told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Unclaimed remainder returned to the sender
    DistributionRefunded {
        /// Distribution id
        distribution_id: DistributionId,
        /// Asset symbol
        asset: String,
        /// Refunded amount
        amount: Decimal,
    },
    /// A share was paid to a claimant
    ClaimSettled {
        /// Distribution id
        distribution_id: DistributionId,
        /// Claimant display name
        claimant_name: String,
        /// Asset symbol
        asset: String,
        /// Paid amount
        amount: Decimal,
    },
    /// External deposit credited
    DepositCredited {
        /// External transaction id
        tx_id: String,
        /// Asset symbol
        asset: String,
        /// Credited amount
        amount: Decimal,
    },
    /// Withdraw confirmed by the external network
    WithdrawCompleted {
        /// Asset symbol
        asset: String,
        /// Withdrawn amount
        amount: Decimal,
        /// Target address
        address: String,
    },
    /// Withdraw rejected, funds returned
    WithdrawFailed {
        /// Asset symbol
        asset: String,
        /// Returned amount (fee included)
        amount: Decimal,
        /// Rejection reason
        reason: String,
    },
}

/// Delivery target implemented by the chat transport
#[async_trait]
pub trait NoticeSink: Send + Sync {
    /// Deliver one notice
    async fn deliver(&self, receiver: OwnerId, notice: Notice) -> Result<()>;
}

/// Sink that only logs, for headless deployments
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl NoticeSink for TracingSink {
    async fn deliver(&self, receiver: OwnerId, notice: Notice) -> Result<()> {
        info!(receiver = %receiver, notice = ?notice, "Notice");
        Ok(())
    }
}

/// Non-blocking notice queue
#[derive(Debug, Clone)]
pub struct Pusher {
    tx: mpsc::UnboundedSender<(OwnerId, Notice)>,
}

impl Pusher {
    /// Start the consumer task; it ends once every `Pusher` clone is dropped
    pub fn spawn(sink: Arc<dyn NoticeSink>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<(OwnerId, Notice)>();
        let handle = tokio::spawn(async move {
            while let Some((receiver, notice)) = rx.recv().await {
                if let Err(e) = sink.deliver(receiver, notice).await {
                    warn!(receiver = %receiver, error = %e, "Notice delivery failed");
                }
            }
            debug!("Notice pusher stopped");
        });
        (Self { tx }, handle)
    }

    /// Queue a notice
    pub fn push(&self, receiver: OwnerId, notice: Notice) {
        if self.tx.send((receiver, notice)).is_err() {
            warn!(receiver = %receiver, "Notice pusher closed, dropping notice");
        }
    }
}
