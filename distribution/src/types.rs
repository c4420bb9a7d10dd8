//! Distribution types

use chrono::{DateTime, Utc};
use luckymoney_ledger::OwnerId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric distribution id
pub type DistributionId = u64;

/// Payout mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitMode {
    /// Every share holds the same amount
    Equal,
    /// Randomized split, every share at least one unit
    Random,
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitMode::Equal => write!(f, "equal"),
            SplitMode::Random => write!(f, "random"),
        }
    }
}

/// How the sender wants the pool split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    /// Randomized split of `total`
    Random {
        /// Pool size
        total: Decimal,
    },
    /// `per_share` for every claimant
    Equal {
        /// Amount each claimant receives
        per_share: Decimal,
    },
}

/// Request to create a distribution
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Funding owner
    pub sender: OwnerId,
    /// Sender display name
    pub sender_name: String,
    /// Asset symbol
    pub asset: String,
    /// Amount and mode
    pub split: Split,
    /// Number of shares
    pub count: u32,
    /// Greeting shown to claimants
    pub message: String,
}

/// Location of the announcement in the chat transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRef {
    /// Chat identifier
    pub chat_id: i64,
    /// Message identifier inside the chat
    pub message_id: i64,
}

/// Distribution header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    /// Numeric id
    pub id: DistributionId,
    /// Public serial (16 hex chars)
    pub serial: String,
    /// Funding owner
    pub sender: OwnerId,
    /// Sender display name
    pub sender_name: String,
    /// Asset symbol
    pub asset: String,
    /// Total pool in minor units (authoritative for both modes)
    pub total_units: u64,
    /// Number of shares
    pub share_count: u32,
    /// Payout mode
    pub mode: SplitMode,
    /// Per-share units in equal mode
    pub per_share_units: Option<u64>,
    /// Greeting
    pub message: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Activated by the owner or the first claim
    pub active: bool,
    /// Announcement location
    pub location: Option<LocationRef>,
    /// Shares claimed so far
    pub claimed_count: u32,
    /// Units claimed so far
    pub claimed_units: u64,
    /// Expired and refunded
    pub expired: bool,
    /// Index of the smallest share
    pub min_share: u32,
    /// Index of the largest share
    pub max_share: u32,
}

impl Distribution {
    /// All shares taken
    pub fn is_exhausted(&self) -> bool {
        self.claimed_count >= self.share_count
    }

    /// Unclaimed units
    pub fn remaining_units(&self) -> u64 {
        self.total_units.saturating_sub(self.claimed_units)
    }

    /// Unclaimed shares
    pub fn remaining_shares(&self) -> u32 {
        self.share_count.saturating_sub(self.claimed_count)
    }

    /// Lifecycle state derived from the flags
    pub fn state(&self) -> DistributionState {
        if self.expired {
            DistributionState::Expired
        } else if self.is_exhausted() {
            DistributionState::Exhausted
        } else if self.active {
            DistributionState::Active
        } else {
            DistributionState::Created
        }
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionState {
    /// Funds locked, not yet announced
    Created,
    /// Open for claims
    Active,
    /// Every share claimed
    Exhausted,
    /// Unclaimed remainder refunded
    Expired,
}

/// Who took a share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareClaim {
    /// Claimant
    pub claimant: OwnerId,
    /// Claimant display name
    pub claimant_name: String,
    /// Claim time
    pub claimed_at: DateTime<Utc>,
}

/// One share of a distribution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// Position `0..share_count`
    pub index: u32,
    /// Amount in minor units
    pub units: u64,
    /// Set exactly once
    pub claim: Option<ShareClaim>,
    /// Fund transfer committed
    pub settled: bool,
}

/// Outcome of a claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimReceipt {
    /// Distribution id
    pub distribution_id: DistributionId,
    /// Share taken
    pub share_index: u32,
    /// Amount
    pub amount: Decimal,
    /// Amount in minor units
    pub units: u64,
    /// Shares left after this claim
    pub remaining: u32,
    /// Fund transfer committed; `false` leaves it to reconciliation
    pub settled: bool,
}

/// Smallest and largest share of a finished random distribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extremes {
    /// Smallest share
    pub smallest: Share,
    /// Largest share
    pub largest: Share,
}

/// Claimed share awaiting fund transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingSettlement {
    /// Distribution id
    pub distribution_id: DistributionId,
    /// Share index
    pub share_index: u32,
}
