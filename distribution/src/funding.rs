//! Deposits and withdrawals against the external value-transfer network
//!
//! The network itself sits behind [`TransferGateway`]. Deposits are credited
//! once per external transaction id. Withdrawals lock `amount + fee`, ask the
//! gateway to send, and wait (bounded) for the outcome to be reported back
//! through [`FundingService::complete_withdraw`].

use crate::{
    config::WithdrawConfig,
    future::FutureRegistry,
    notify::{Notice, Pusher},
    Error, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use luckymoney_ledger::{
    Account, ExternalDeposit, Ledger, OwnerId, Reason, VersionRecord, VersionRefs,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Transaction observed on the external network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTransaction {
    /// Network transaction id
    pub tx_id: String,
    /// Block height
    pub height: u64,
    /// Source address
    pub from: String,
    /// Destination address
    pub to: String,
    /// Asset symbol
    pub asset: String,
    /// Amount
    pub amount: Decimal,
    /// Memo; carries the crediting owner id
    pub memo: String,
}

/// Withdraw handed to the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawRequest {
    /// Correlation token to report the outcome with
    pub token: String,
    /// Debited owner
    pub owner: OwnerId,
    /// Asset symbol
    pub asset: String,
    /// Target address
    pub address: String,
    /// Amount to send (fee excluded)
    pub amount: Decimal,
    /// Fee kept by the service
    pub fee: Decimal,
}

/// Outcome reported by the external network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawOutcome {
    /// Sent
    Succeeded {
        /// Network transaction id, if known
        tx_id: Option<String>,
    },
    /// Refused
    Rejected {
        /// Human-readable reason
        reason: String,
    },
}

/// External network adapter
#[async_trait]
pub trait TransferGateway: Send + Sync {
    /// Whether `tx` is a genuine, final transfer to this service
    async fn validate_transaction(&self, tx: &ExternalTransaction) -> Result<bool>;

    /// Whether `address` can receive funds
    async fn validate_address(&self, address: &str) -> Result<bool>;

    /// Start sending; the outcome arrives later under `request.token`
    async fn initiate_withdraw(&self, request: WithdrawRequest) -> Result<()>;
}

/// Deposit and withdraw flows
pub struct FundingService {
    ledger: Arc<Ledger>,
    gateway: Arc<dyn TransferGateway>,
    withdrawals: Arc<FutureRegistry<WithdrawOutcome>>,
    config: WithdrawConfig,
    pusher: Option<Pusher>,
}

impl std::fmt::Debug for FundingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FundingService")
            .field("config", &self.config)
            .field("pending_withdrawals", &self.withdrawals.pending())
            .finish()
    }
}

impl FundingService {
    /// Create service
    pub fn new(
        ledger: Arc<Ledger>,
        gateway: Arc<dyn TransferGateway>,
        withdrawals: Arc<FutureRegistry<WithdrawOutcome>>,
        config: WithdrawConfig,
        pusher: Option<Pusher>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            withdrawals,
            config,
            pusher,
        }
    }

    /// Credit an external transaction to the owner named in its memo
    pub async fn deposit(&self, tx: ExternalTransaction) -> Result<Account> {
        if self.ledger.has_external_transaction(&tx.tx_id)? {
            return Err(luckymoney_ledger::Error::DuplicateExternalTransaction(tx.tx_id).into());
        }
        if !self.gateway.validate_transaction(&tx).await? {
            info!(tx_id = %tx.tx_id, from = %tx.from, memo = %tx.memo, "Deposit rejected by gateway");
            return Err(Error::InvalidTransaction(tx.tx_id));
        }
        let owner = tx
            .memo
            .trim()
            .parse::<i64>()
            .map(OwnerId)
            .map_err(|e| Error::InvalidMemo(format!("'{}': {}", tx.memo, e)))?;

        let ledger = Arc::clone(&self.ledger);
        let credited = tx.clone();
        let account = tokio::task::spawn_blocking(move || {
            ledger.store().update(|w| {
                let deposit = ExternalDeposit {
                    tx_id: credited.tx_id.clone(),
                    owner,
                    asset: credited.asset.clone(),
                    amount: credited.amount,
                    height: credited.height,
                    from: credited.from.clone(),
                    credited_at: Utc::now(),
                };
                ledger.record_external_deposit_in(w, &deposit)?;
                let account = ledger.deposit_in(w, owner, &credited.asset, credited.amount)?;
                let record = VersionRecord::draft(credited.asset.as_str(), Reason::Deposit)
                    .deltas(credited.amount, Decimal::ZERO)
                    .after(&account)
                    .refs(VersionRefs {
                        external_tx_id: Some(credited.tx_id.clone()),
                        chain_height: Some(credited.height),
                        external_address: Some(credited.from.clone()),
                        ..Default::default()
                    });
                ledger.append_version_in(w, owner, record)?;
                Ok::<_, luckymoney_ledger::Error>(account)
            })
        })
        .await
        .map_err(|e| Error::Other(format!("deposit task failed: {}", e)))??;

        info!(
            tx_id = %tx.tx_id,
            owner = %owner,
            asset = %tx.asset,
            amount = %tx.amount,
            height = tx.height,
            "Deposit credited"
        );
        self.notify(
            owner,
            Notice::DepositCredited {
                tx_id: tx.tx_id,
                asset: tx.asset,
                amount: tx.amount,
            },
        );
        Ok(account)
    }

    /// Send `amount` to `address`, charging the configured fee.
    ///
    /// A gateway that fails to start the transfer yields `Error::Gateway`
    /// with the funds unlocked. On timeout the funds stay locked for operator
    /// follow-up.
    pub async fn withdraw(
        &self,
        owner: OwnerId,
        asset: &str,
        address: &str,
        amount: Decimal,
    ) -> Result<Account> {
        let amount = self.ledger.precision().check(amount)?;
        let fee = self.config.fee;
        let gross = amount.checked_add(fee).ok_or_else(|| {
            luckymoney_ledger::Error::InvalidAmount(format!("{} plus fee {} overflows", amount, fee))
        })?;
        if !self.gateway.validate_address(address).await? {
            return Err(Error::InvalidAddress(address.to_string()));
        }
        let refs = VersionRefs {
            external_address: Some(address.to_string()),
            ..Default::default()
        };

        {
            let asset = asset.to_string();
            let refs = refs.clone();
            self.in_ledger(move |ledger| {
                ledger.store().update(|w| {
                    let account = ledger.lock_in(w, owner, &asset, gross)?;
                    let record = VersionRecord::draft(asset.as_str(), Reason::Withdraw)
                        .deltas(-gross, gross)
                        .fee(fee)
                        .after(&account)
                        .refs(refs);
                    ledger.append_version_in(w, owner, record)?;
                    Ok::<_, luckymoney_ledger::Error>(account)
                })
            })
            .await?;
        }

        let (token, waiter) = self.withdrawals.create();
        info!(owner = %owner, asset = asset, amount = %amount, fee = %fee, address = address, token = %token, "Withdraw submitted");

        let request = WithdrawRequest {
            token: token.clone(),
            owner,
            asset: asset.to_string(),
            address: address.to_string(),
            amount,
            fee,
        };
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let mut transport_failure = None;
        let outcome = match self.gateway.initiate_withdraw(request).await {
            Ok(()) => waiter.wait(timeout).await,
            Err(e) => {
                drop(waiter);
                let reason = match e {
                    Error::Gateway(message) => message,
                    other => other.to_string(),
                };
                transport_failure = Some(reason.clone());
                Ok(WithdrawOutcome::Rejected { reason })
            }
        };

        match outcome {
            Ok(WithdrawOutcome::Succeeded { tx_id }) => {
                let asset_owned = asset.to_string();
                let refs = VersionRefs {
                    external_tx_id: tx_id,
                    ..refs
                };
                let account = self
                    .in_ledger(move |ledger| {
                        ledger.store().update(|w| {
                            let account = ledger.withdraw_in(w, owner, &asset_owned, gross)?;
                            let record = VersionRecord::draft(asset_owned.as_str(), Reason::WithdrawSucceeded)
                                .deltas(Decimal::ZERO, -gross)
                                .fee(fee)
                                .after(&account)
                                .refs(refs);
                            ledger.append_version_in(w, owner, record)?;
                            Ok::<_, luckymoney_ledger::Error>(account)
                        })
                    })
                    .await?;
                info!(owner = %owner, asset = asset, amount = %amount, "Withdraw succeeded");
                self.notify(
                    owner,
                    Notice::WithdrawCompleted {
                        asset: asset.to_string(),
                        amount,
                        address: address.to_string(),
                    },
                );
                Ok(account)
            }
            Ok(WithdrawOutcome::Rejected { reason }) => {
                let asset_owned = asset.to_string();
                let memo = reason.clone();
                self.in_ledger(move |ledger| {
                    ledger.store().update(|w| {
                        let account = ledger.unlock_in(w, owner, &asset_owned, gross)?;
                        let record = VersionRecord::draft(asset_owned.as_str(), Reason::WithdrawFailed)
                            .deltas(gross, -gross)
                            .after(&account)
                            .refs(VersionRefs {
                                memo: Some(memo),
                                ..refs
                            });
                        ledger.append_version_in(w, owner, record)?;
                        Ok::<_, luckymoney_ledger::Error>(account)
                    })
                })
                .await?;
                warn!(owner = %owner, asset = asset, amount = %amount, reason = %reason, "Withdraw rejected, funds unlocked");
                self.notify(
                    owner,
                    Notice::WithdrawFailed {
                        asset: asset.to_string(),
                        amount: gross,
                        reason: reason.clone(),
                    },
                );
                match transport_failure {
                    Some(message) => Err(Error::Gateway(message)),
                    None => Err(Error::WithdrawRejected(reason)),
                }
            }
            Err(e) => {
                error!(
                    owner = %owner,
                    asset = asset,
                    amount = %gross,
                    token = %token,
                    error = %e,
                    "Withdraw outcome unknown, funds remain locked"
                );
                match e {
                    Error::WithdrawTimedOut(_) => Err(Error::WithdrawTimedOut(timeout)),
                    other => Err(other),
                }
            }
        }
    }

    /// Report the outcome of a withdraw; `false` if no withdraw waits on `token`
    pub fn complete_withdraw(&self, token: &str, outcome: WithdrawOutcome) -> bool {
        self.withdrawals.resolve(token, outcome)
    }

    async fn in_ledger<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Ledger) -> luckymoney_ledger::Result<T> + Send + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        let value = tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|e| Error::Other(format!("ledger task failed: {}", e)))??;
        Ok(value)
    }

    fn notify(&self, receiver: OwnerId, notice: Notice) {
        if let Some(pusher) = &self.pusher {
            pusher.push(receiver, notice);
        }
    }
}
