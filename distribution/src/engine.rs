//! Distribution engine
//!
//! Owns distribution, share and claim storage and drives every balance effect
//! through the ledger's transaction-scoped operations.
//!
//! # Lifecycle
//!
//! `Created → Active → {Exhausted | Expired}`
//!
//! # Money flow
//!
//! 1. **Create**: the sender's pool is locked, then the split is persisted
//!    together with a `DistributionSent` version. If persisting fails the lock
//!    is undone by a compensating unlock.
//! 2. **Claim**: a share is assigned and marked pending in one transaction;
//!    the transfer from the sender's lock to the claimant runs in a second
//!    transaction (`settle_claim`). Pending markers left by a crash between
//!    the two are settled by the reconciler.
//! 3. **Expire**: the unclaimed remainder is unlocked back to the sender.
//!
//! Conservation: `claimed_units + refund == total_units`, and the sender's
//! locked balance for a distribution drops by exactly `total_units` over its
//! lifetime.

use crate::{
    config::{DistributionConfig, RetryConfig},
    partition::{extremes_of, partition},
    scheduler::ExpiryQueue,
    types::{
        ClaimReceipt, CreateRequest, Distribution, DistributionId, Extremes, LocationRef,
        PendingSettlement, Share, ShareClaim, Split, SplitMode,
    },
    Error, Result,
};
use chrono::Utc;
use luckymoney_ledger::{
    KeyspaceRead, Ledger, OwnerId, Reason, Table, VersionRecord, VersionRefs,
};
use rand::RngCore;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const ID_SEQUENCE: &str = "distributions";
/// First id handed out is `ID_FLOOR + 1`
pub const ID_FLOOR: u64 = 100000;
const CHECKPOINT_KEY: &[u8] = b"checkpoint/expiry";
const SERIAL_PREFIX: &[u8] = b"serial/";
const SENDER_PREFIX: &[u8] = b"sender/";

/// Unclaimed funds returned by `expire`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    /// Distribution id
    pub distribution_id: DistributionId,
    /// Refunded owner
    pub sender: OwnerId,
    /// Asset symbol
    pub asset: String,
    /// Refunded amount (zero when every share was claimed)
    pub amount: Decimal,
}

/// Share transfer committed by `settle_claim`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledClaim {
    /// Distribution id
    pub distribution_id: DistributionId,
    /// Share index
    pub share_index: u32,
    /// Paid claimant
    pub claimant: OwnerId,
    /// Claimant display name
    pub claimant_name: String,
    /// Asset symbol
    pub asset: String,
    /// Paid amount
    pub amount: Decimal,
}

/// Distribution engine
#[derive(Debug)]
pub struct DistributionEngine {
    ledger: Arc<Ledger>,
    config: DistributionConfig,
    compensation: RetryConfig,
    queue: ExpiryQueue,
}

impl DistributionEngine {
    /// Create engine over `ledger`, pushing new distributions onto `queue`
    pub fn new(
        ledger: Arc<Ledger>,
        config: DistributionConfig,
        compensation: RetryConfig,
        queue: ExpiryQueue,
    ) -> Self {
        Self {
            ledger,
            config,
            compensation,
            queue,
        }
    }

    /// Ledger handle
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Expiry queue shared with the scheduler
    pub fn queue(&self) -> &ExpiryQueue {
        &self.queue
    }

    /// Distribution rules
    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    /// Lock the sender's funds and materialize a new distribution.
    ///
    /// Blocks the calling thread: the compensating unlock sleeps between
    /// retries. From async code run it under `tokio::task::spawn_blocking`.
    pub fn create(&self, request: CreateRequest) -> Result<Distribution> {
        let message_len = request.message.chars().count();
        if message_len > self.config.max_message_len {
            return Err(Error::MessageTooLong {
                len: message_len,
                max: self.config.max_message_len,
            });
        }
        if request.count == 0 {
            return Err(Error::InvalidShareCount(0));
        }

        let precision = self.ledger.precision();
        let (mode, total_units, per_share_units) = match request.split {
            Split::Random { total } => (SplitMode::Random, precision.to_units(total)?, None),
            Split::Equal { per_share } => {
                let per_share_units = precision.to_units(per_share)?;
                let total_units = per_share_units
                    .checked_mul(u64::from(request.count))
                    .ok_or_else(|| {
                        luckymoney_ledger::Error::InvalidAmount(format!(
                            "{} x {} overflows",
                            per_share, request.count
                        ))
                    })?;
                (SplitMode::Equal, total_units, Some(per_share_units))
            }
        };
        let total = precision.from_units(total_units);

        self.ledger.lock(request.sender, &request.asset, total)?;
        self.materialize(&request, mode, total, total_units, per_share_units)
    }

    /// Persist a distribution whose funds are already locked, releasing the
    /// lock if persisting fails
    fn materialize(
        &self,
        request: &CreateRequest,
        mode: SplitMode,
        total: Decimal,
        total_units: u64,
        per_share_units: Option<u64>,
    ) -> Result<Distribution> {
        match self.persist(request, mode, total, total_units, per_share_units) {
            Ok(distribution) => {
                self.queue.push(distribution.created_at, distribution.id);
                info!(
                    distribution_id = distribution.id,
                    serial = %distribution.serial,
                    sender = %distribution.sender,
                    asset = %distribution.asset,
                    total = %total,
                    shares = distribution.share_count,
                    mode = %mode,
                    "Distribution created"
                );
                Ok(distribution)
            }
            Err(cause) => {
                warn!(
                    sender = %request.sender,
                    asset = %request.asset,
                    total = %total,
                    error = %cause,
                    "Distribution persist failed, releasing lock"
                );
                self.compensate(request.sender, &request.asset, total, &cause)?;
                Err(cause)
            }
        }
    }

    fn persist(
        &self,
        request: &CreateRequest,
        mode: SplitMode,
        total: Decimal,
        total_units: u64,
        per_share_units: Option<u64>,
    ) -> Result<Distribution> {
        let units = partition(total_units, request.count, mode)?;
        let (min_share, max_share) = extremes_of(&units);

        self.ledger.store().update(|tx| {
            tx.ensure_sequence_floor(ID_SEQUENCE, ID_FLOOR)?;
            let id = tx.next_sequence(ID_SEQUENCE)?;
            let serial = loop {
                let candidate = new_serial();
                if !tx.contains(Table::Indices, &serial_key(&candidate))? {
                    break candidate;
                }
                debug!(serial = %candidate, "Serial collision, retrying");
            };

            let distribution = Distribution {
                id,
                serial: serial.clone(),
                sender: request.sender,
                sender_name: request.sender_name.clone(),
                asset: request.asset.clone(),
                total_units,
                share_count: request.count,
                mode,
                per_share_units,
                message: request.message.clone(),
                created_at: Utc::now(),
                active: false,
                location: None,
                claimed_count: 0,
                claimed_units: 0,
                expired: false,
                min_share,
                max_share,
            };
            tx.put(Table::Distributions, distribution_key(id), &distribution)?;

            for (index, units) in units.iter().enumerate() {
                let share = Share {
                    index: index as u32,
                    units: *units,
                    claim: None,
                    settled: false,
                };
                tx.put(Table::Shares, share_key(id, share.index), &share)?;
            }

            tx.put(Table::Indices, serial_key(&serial), &id)?;
            tx.put_raw(Table::Indices, sender_key(request.sender, id), Vec::new());

            let account = Ledger::get_account_in(&*tx, request.sender, &request.asset)?;
            let record = VersionRecord::draft(request.asset.as_str(), Reason::DistributionSent)
                .deltas(-total, total)
                .after(&account)
                .refs(VersionRefs {
                    distribution_id: Some(id),
                    ..Default::default()
                });
            self.ledger.append_version_in(tx, request.sender, record)?;

            Ok(distribution)
        })
    }

    fn compensate(&self, owner: OwnerId, asset: &str, amount: Decimal, cause: &Error) -> Result<()> {
        let attempts = self.compensation.attempts.max(1);
        for attempt in 1..=attempts {
            match self.ledger.unlock(owner, asset, amount) {
                Ok(_) => {
                    info!(owner = %owner, asset = asset, amount = %amount, attempt, "Compensating unlock applied");
                    return Ok(());
                }
                Err(e) => {
                    warn!(owner = %owner, asset = asset, attempt, error = %e, "Compensating unlock failed");
                    if attempt < attempts {
                        std::thread::sleep(self.compensation.delay(attempt));
                    }
                }
            }
        }

        error!(
            owner = %owner,
            asset = asset,
            amount = %amount,
            cause = %cause,
            "Funds stuck in lock: compensating unlock exhausted its retries"
        );
        Err(Error::CompensationFailed(format!(
            "{} {} of {} remain locked after: {}",
            amount, asset, owner, cause
        )))
    }

    /// Owner announces the distribution
    pub fn activate(
        &self,
        id: DistributionId,
        requester: OwnerId,
        location: Option<LocationRef>,
    ) -> Result<Distribution> {
        self.ledger.store().update(|tx| {
            let mut distribution = load_distribution(&*tx, id)?;
            if distribution.sender != requester {
                return Err(Error::PermissionDenied(id));
            }
            if distribution.active {
                return Err(Error::AlreadyActivated(id));
            }
            distribution.active = true;
            distribution.location = location;
            tx.put(Table::Distributions, distribution_key(id), &distribution)?;
            Ok(distribution)
        })
    }

    /// Take the next share and pay it out
    pub fn claim(&self, id: DistributionId, claimant: OwnerId, claimant_name: &str) -> Result<ClaimReceipt> {
        let (distribution, share) = self.ledger.store().update(|tx| {
            let mut distribution = load_distribution(&*tx, id)?;
            let claim_key = claim_key(id, claimant);
            if tx.contains(Table::Claims, &claim_key)? {
                return Err(Error::AlreadyClaimed(id));
            }
            if distribution.expired {
                return Err(Error::DistributionExpired(id));
            }
            if distribution.is_exhausted() {
                return Err(Error::NothingLeft(id));
            }
            if self.config.require_activation && !distribution.active {
                return Err(Error::NotActivated(id));
            }

            let index = distribution.claimed_count;
            let mut share = load_share(&*tx, id, index)?;
            if share.claim.is_some() {
                return Err(luckymoney_ledger::Error::InvariantViolation(format!(
                    "share {} of distribution {} claimed twice",
                    index, id
                ))
                .into());
            }
            share.claim = Some(ShareClaim {
                claimant,
                claimant_name: claimant_name.to_string(),
                claimed_at: Utc::now(),
            });
            tx.put(Table::Shares, share_key(id, index), &share)?;
            tx.put(Table::Claims, claim_key, &index)?;
            tx.put_raw(Table::PendingSettlements, share_key(id, index), Vec::new());

            distribution.claimed_count += 1;
            distribution.claimed_units += share.units;
            distribution.active = true;
            if distribution.claimed_units > distribution.total_units {
                return Err(luckymoney_ledger::Error::InvariantViolation(format!(
                    "distribution {} over-claimed",
                    id
                ))
                .into());
            }
            tx.put(Table::Distributions, distribution_key(id), &distribution)?;
            Ok((distribution, share))
        })?;

        let settled = match self.settle_claim(id, share.index) {
            Ok(_) => true,
            Err(e) => {
                error!(
                    distribution_id = id,
                    share_index = share.index,
                    claimant = %claimant,
                    error = %e,
                    "Claim recorded but transfer failed, left for reconciliation"
                );
                false
            }
        };

        let amount = self.ledger.precision().from_units(share.units);
        info!(
            distribution_id = id,
            share_index = share.index,
            claimant = %claimant,
            amount = %amount,
            remaining = distribution.remaining_shares(),
            settled,
            "Share claimed"
        );

        Ok(ClaimReceipt {
            distribution_id: id,
            share_index: share.index,
            amount,
            units: share.units,
            remaining: distribution.remaining_shares(),
            settled,
        })
    }

    /// Transfer a claimed share from the sender's lock to the claimant.
    ///
    /// Returns `None` when the share is already settled.
    pub fn settle_claim(&self, id: DistributionId, index: u32) -> Result<Option<SettledClaim>> {
        self.ledger.store().update(|tx| {
            let pending = share_key(id, index);
            if !tx.contains(Table::PendingSettlements, &pending)? {
                return Ok(None);
            }
            let distribution = load_distribution(&*tx, id)?;
            let mut share = load_share(&*tx, id, index)?;
            if share.settled {
                tx.delete(Table::PendingSettlements, pending);
                return Ok(None);
            }
            let claim = share.claim.clone().ok_or_else(|| {
                luckymoney_ledger::Error::InvariantViolation(format!(
                    "pending share {} of distribution {} has no claimant",
                    index, id
                ))
            })?;

            let amount = self.ledger.precision().from_units(share.units);
            let (from, to) = self.ledger.transfer_from_locked_in(
                tx,
                distribution.sender,
                claim.claimant,
                &distribution.asset,
                amount,
            )?;

            let credit = VersionRecord::draft(distribution.asset.as_str(), Reason::DistributionClaimed)
                .deltas(amount, Decimal::ZERO)
                .after(&to)
                .refs(VersionRefs {
                    distribution_id: Some(id),
                    counterparty_id: Some(distribution.sender),
                    counterparty_name: Some(distribution.sender_name.clone()),
                    ..Default::default()
                });
            self.ledger.append_version_in(tx, claim.claimant, credit)?;

            let debit = VersionRecord::draft(distribution.asset.as_str(), Reason::DistributionClaimed)
                .deltas(Decimal::ZERO, -amount)
                .after(&from)
                .refs(VersionRefs {
                    distribution_id: Some(id),
                    counterparty_id: Some(claim.claimant),
                    counterparty_name: Some(claim.claimant_name.clone()),
                    ..Default::default()
                });
            self.ledger.append_version_in(tx, distribution.sender, debit)?;

            share.settled = true;
            tx.put(Table::Shares, share_key(id, index), &share)?;
            tx.delete(Table::PendingSettlements, pending);

            Ok(Some(SettledClaim {
                distribution_id: id,
                share_index: index,
                claimant: claim.claimant,
                claimant_name: claim.claimant_name,
                asset: distribution.asset,
                amount,
            }))
        })
    }

    /// Mark expired and refund the unclaimed remainder.
    ///
    /// Returns `None` if the distribution had already expired.
    pub fn expire(&self, id: DistributionId) -> Result<Option<Refund>> {
        let refund = self.ledger.store().update(|tx| {
            let mut distribution = load_distribution(&*tx, id)?;
            if distribution.expired {
                return Ok(None);
            }
            distribution.expired = true;

            let amount = self
                .ledger
                .precision()
                .from_units(distribution.remaining_units());
            if amount > Decimal::ZERO {
                let account = self.ledger.unlock_in(tx, distribution.sender, &distribution.asset, amount)?;
                let record = VersionRecord::draft(distribution.asset.as_str(), Reason::DistributionRefunded)
                    .deltas(amount, -amount)
                    .after(&account)
                    .refs(VersionRefs {
                        distribution_id: Some(id),
                        ..Default::default()
                    });
                self.ledger.append_version_in(tx, distribution.sender, record)?;
            }
            tx.put(Table::Distributions, distribution_key(id), &distribution)?;

            Ok::<_, Error>(Some(Refund {
                distribution_id: id,
                sender: distribution.sender,
                asset: distribution.asset,
                amount,
            }))
        })?;

        if let Some(refund) = &refund {
            info!(
                distribution_id = id,
                sender = %refund.sender,
                refund = %refund.amount,
                "Distribution expired"
            );
        }
        Ok(refund)
    }

    /// Smallest and largest share, once a random distribution is fully claimed
    pub fn extremes(&self, id: DistributionId) -> Result<Option<Extremes>> {
        self.ledger.store().view(|tx| {
            let distribution = load_distribution(&*tx, id)?;
            if !distribution.is_exhausted()
                || distribution.share_count <= 1
                || distribution.mode != SplitMode::Random
            {
                return Ok(None);
            }
            Ok(Some(Extremes {
                smallest: load_share(&*tx, id, distribution.min_share)?,
                largest: load_share(&*tx, id, distribution.max_share)?,
            }))
        })
    }

    // Reads

    /// Distribution by id
    pub fn get(&self, id: DistributionId) -> Result<Distribution> {
        self.ledger.store().view(|tx| load_distribution(&*tx, id))
    }

    /// Distribution by public serial
    pub fn get_by_serial(&self, serial: &str) -> Result<Distribution> {
        self.ledger.store().view(|tx| {
            let id: DistributionId = tx
                .get(Table::Indices, &serial_key(serial))?
                .ok_or_else(|| Error::DistributionNotFound(serial.to_string()))?;
            load_distribution(&*tx, id)
        })
    }

    /// Every share of a distribution, by index
    pub fn shares(&self, id: DistributionId) -> Result<Vec<Share>> {
        self.ledger
            .store()
            .view(|tx| Ok(tx.collect_prefix(Table::Shares, &distribution_key(id))?))
    }

    /// Claimed shares in claim order
    pub fn claim_history(&self, id: DistributionId) -> Result<Vec<Share>> {
        let mut shares = self.shares(id)?;
        shares.retain(|share| share.claim.is_some());
        Ok(shares)
    }

    /// Page through a sender's distributions; returns the page and the total count
    pub fn list_by_sender(
        &self,
        sender: OwnerId,
        offset: usize,
        limit: usize,
        newest_first: bool,
    ) -> Result<(Vec<Distribution>, usize)> {
        self.ledger.store().view(|tx| {
            let prefix = sender_prefix(sender);
            let mut ids = Vec::new();
            tx.scan_prefix(Table::Indices, &prefix, |key, _| {
                ids.push(decode_u64(&key[prefix.len()..])?);
                Ok::<_, Error>(true)
            })?;
            if newest_first {
                ids.reverse();
            }
            let total = ids.len();
            let page = ids
                .into_iter()
                .skip(offset)
                .take(limit)
                .map(|id| load_distribution(&*tx, id))
                .collect::<Result<Vec<_>>>()?;
            Ok((page, total))
        })
    }

    /// Visit distributions with id `>= start` in id order until `f` returns `false`
    pub fn for_each_from<F>(&self, start: DistributionId, mut f: F) -> Result<()>
    where
        F: FnMut(&Distribution) -> bool,
    {
        self.ledger.store().view(|tx| {
            tx.scan(Table::Distributions, &distribution_key(start), |_, value| {
                let distribution: Distribution = bincode::deserialize(value)?;
                Ok::<_, Error>(f(&distribution))
            })
        })
    }

    /// Highest id fully processed by the expiration scheduler
    pub fn checkpoint(&self) -> Result<DistributionId> {
        self.ledger
            .store()
            .view(|tx| Ok(tx.get(Table::Meta, CHECKPOINT_KEY)?.unwrap_or(0)))
    }

    /// Raise the checkpoint to `id`; never lowers it. Returns the stored value.
    pub fn advance_checkpoint(&self, id: DistributionId) -> Result<DistributionId> {
        self.ledger.store().update(|tx| {
            let current: DistributionId = tx.get(Table::Meta, CHECKPOINT_KEY)?.unwrap_or(0);
            if id <= current {
                return Ok(current);
            }
            tx.put(Table::Meta, CHECKPOINT_KEY.to_vec(), &id)?;
            Ok::<_, Error>(id)
        })
    }

    /// Claims whose transfer has not committed yet
    pub fn pending_settlements(&self) -> Result<Vec<PendingSettlement>> {
        self.ledger.store().view(|tx| {
            let mut pending = Vec::new();
            tx.scan(Table::PendingSettlements, &[], |key, _| {
                pending.push(decode_share_key(key)?);
                Ok::<_, Error>(true)
            })?;
            Ok(pending)
        })
    }
}

fn load_distribution(tx: &impl KeyspaceRead, id: DistributionId) -> Result<Distribution> {
    tx.get(Table::Distributions, &distribution_key(id))?
        .ok_or_else(|| Error::DistributionNotFound(id.to_string()))
}

fn load_share(tx: &impl KeyspaceRead, id: DistributionId, index: u32) -> Result<Share> {
    tx.get(Table::Shares, &share_key(id, index))?.ok_or_else(|| {
        luckymoney_ledger::Error::InvariantViolation(format!(
            "share {} of distribution {} missing",
            index, id
        ))
        .into()
    })
}

fn distribution_key(id: DistributionId) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn share_key(id: DistributionId, index: u32) -> Vec<u8> {
    let mut key = distribution_key(id);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn claim_key(id: DistributionId, claimant: OwnerId) -> Vec<u8> {
    let mut key = distribution_key(id);
    key.extend_from_slice(&claimant.key_bytes());
    key
}

fn serial_key(serial: &str) -> Vec<u8> {
    let mut key = SERIAL_PREFIX.to_vec();
    key.extend_from_slice(serial.as_bytes());
    key
}

fn sender_prefix(sender: OwnerId) -> Vec<u8> {
    let mut key = SENDER_PREFIX.to_vec();
    key.extend_from_slice(&sender.key_bytes());
    key
}

fn sender_key(sender: OwnerId, id: DistributionId) -> Vec<u8> {
    let mut key = sender_prefix(sender);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| luckymoney_ledger::Error::Storage(format!("bad key length {}", bytes.len())))?;
    Ok(u64::from_be_bytes(array))
}

fn decode_share_key(key: &[u8]) -> Result<PendingSettlement> {
    if key.len() != 12 {
        return Err(luckymoney_ledger::Error::Storage(format!("bad share key length {}", key.len())).into());
    }
    let distribution_id = decode_u64(&key[..8])?;
    let mut index = [0u8; 4];
    index.copy_from_slice(&key[8..]);
    Ok(PendingSettlement {
        distribution_id,
        share_index: u32::from_be_bytes(index),
    })
}

fn new_serial() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
