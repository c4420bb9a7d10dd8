//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Chat user identifier owning accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub i64);

impl OwnerId {
    /// Create new owner ID
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Raw numeric id
    pub fn get(&self) -> i64 {
        self.0
    }

    /// Order-preserving big-endian key bytes (sign bit flipped)
    pub fn key_bytes(&self) -> [u8; 8] {
        ((self.0 as u64) ^ (1 << 63)).to_be_bytes()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for OwnerId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Balance of one owner in one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Owner
    pub owner: OwnerId,

    /// Asset symbol
    pub asset: String,

    /// Spendable balance
    pub available: Decimal,

    /// Balance reserved by Lock, awaiting withdraw, claim or unlock
    pub locked: Decimal,
}

impl Account {
    /// Fresh zero-balance account
    pub fn empty(owner: OwnerId, asset: impl Into<String>) -> Self {
        Self {
            owner,
            asset: asset.into(),
            available: Decimal::ZERO,
            locked: Decimal::ZERO,
        }
    }

    /// available + locked
    pub fn total(&self) -> Decimal {
        self.available + self.locked
    }
}

/// Why a balance changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Reason {
    /// Operator grant
    SystemGrant = 1,
    /// External deposit credited
    Deposit = 2,
    /// Withdraw submitted, funds locked
    Withdraw = 3,
    /// Withdraw confirmed by the external network
    WithdrawSucceeded = 4,
    /// Withdraw rejected, funds unlocked
    WithdrawFailed = 5,
    /// Distribution created, funds locked
    DistributionSent = 6,
    /// Share of a distribution paid out
    DistributionClaimed = 7,
    /// Unclaimed remainder returned to the sender
    DistributionRefunded = 8,
}

impl Reason {
    /// Stable label (metrics, logs)
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::SystemGrant => "system_grant",
            Reason::Deposit => "deposit",
            Reason::Withdraw => "withdraw",
            Reason::WithdrawSucceeded => "withdraw_succeeded",
            Reason::WithdrawFailed => "withdraw_failed",
            Reason::DistributionSent => "distribution_sent",
            Reason::DistributionClaimed => "distribution_claimed",
            Reason::DistributionRefunded => "distribution_refunded",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional references attached to a version record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRefs {
    /// Related distribution
    pub distribution_id: Option<u64>,
    /// External network transaction id
    pub external_tx_id: Option<String>,
    /// External chain height
    pub chain_height: Option<u64>,
    /// Counter-party owner
    pub counterparty_id: Option<OwnerId>,
    /// Counter-party display name
    pub counterparty_name: Option<String>,
    /// External address (withdraw target)
    pub external_address: Option<String>,
    /// Free-form memo
    pub memo: Option<String>,
}

/// Immutable audit entry, one per ledger mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    /// Per-owner sequence number (assigned on append, starts at 1)
    pub id: u64,

    /// Asset symbol
    pub asset: String,

    /// Change to `available`
    pub balance_delta: Decimal,

    /// Change to `locked`
    pub locked_delta: Decimal,

    /// Fee charged with this mutation
    pub fee: Decimal,

    /// `available` after the mutation
    pub available_after: Decimal,

    /// Append time (assigned on append)
    pub timestamp: DateTime<Utc>,

    /// Reason code
    pub reason: Reason,

    /// References
    pub refs: VersionRefs,
}

impl VersionRecord {
    /// Unsequenced record with zero deltas
    pub fn draft(asset: impl Into<String>, reason: Reason) -> Self {
        Self {
            id: 0,
            asset: asset.into(),
            balance_delta: Decimal::ZERO,
            locked_delta: Decimal::ZERO,
            fee: Decimal::ZERO,
            available_after: Decimal::ZERO,
            timestamp: Utc::now(),
            reason,
            refs: VersionRefs::default(),
        }
    }

    /// Set deltas
    pub fn deltas(mut self, balance_delta: Decimal, locked_delta: Decimal) -> Self {
        self.balance_delta = balance_delta;
        self.locked_delta = locked_delta;
        self
    }

    /// Set resulting available balance
    pub fn after(mut self, account: &Account) -> Self {
        self.available_after = account.available;
        self
    }

    /// Set fee
    pub fn fee(mut self, fee: Decimal) -> Self {
        self.fee = fee;
        self
    }

    /// Set references
    pub fn refs(mut self, refs: VersionRefs) -> Self {
        self.refs = refs;
        self
    }
}

/// Credited external transaction, kept for duplicate rejection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalDeposit {
    /// External transaction id
    pub tx_id: String,
    /// Credited owner
    pub owner: OwnerId,
    /// Asset symbol
    pub asset: String,
    /// Credited amount
    pub amount: Decimal,
    /// Chain height
    pub height: u64,
    /// Source address
    pub from: String,
    /// Credit time
    pub credited_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_key_bytes_preserve_order() {
        let ids = [-5i64, -1, 0, 1, 42, i64::MAX];
        for pair in ids.windows(2) {
            assert!(OwnerId(pair[0]).key_bytes() < OwnerId(pair[1]).key_bytes());
        }
    }

    #[test]
    fn test_account_total() {
        let mut account = Account::empty(OwnerId(1), "GRAM");
        account.available = Decimal::new(1050, 2);
        account.locked = Decimal::new(250, 2);
        assert_eq!(account.total(), Decimal::new(1300, 2));
    }

    #[test]
    fn test_version_draft_builder() {
        let account = Account {
            owner: OwnerId(7),
            asset: "GRAM".to_string(),
            available: Decimal::from(90),
            locked: Decimal::from(10),
        };
        let record = VersionRecord::draft("GRAM", Reason::DistributionSent)
            .deltas(Decimal::from(-10), Decimal::from(10))
            .after(&account);
        assert_eq!(record.id, 0);
        assert_eq!(record.available_after, Decimal::from(90));
        assert_eq!(record.reason.as_str(), "distribution_sent");
    }
}
