//! Account ledger
//!
//! Balances live in the `accounts` table, the audit trail in
//! `account_versions`. Every public operation runs in its own store
//! transaction; the `*_in` forms take an open [`WriteTxn`] so callers can
//! combine balance effects with their own writes and commit them together.
//!
//! The `*_in` balance primitives never append version records. Callers that
//! move money record the movement themselves with [`Ledger::append_version_in`],
//! choosing the reason and references that describe it.
//!
//! # Example
//!
//! ```no_run
//! use luckymoney_ledger::{Config, Ledger, OwnerId};
//! use rust_decimal::Decimal;
//!
//! fn main() -> luckymoney_ledger::Result<()> {
//!     let ledger = Ledger::open(&Config::default())?;
//!     let account = ledger.deposit(OwnerId(7), "GRAM", Decimal::new(1000, 2))?;
//!     assert_eq!(account.available, Decimal::new(1000, 2));
//!     Ok(())
//! }
//! ```

use crate::{
    amount::Precision,
    metrics::LedgerMetrics,
    storage::{KeyspaceRead, Store, Table, WriteTxn},
    types::{Account, ExternalDeposit, OwnerId, Reason, VersionRecord},
    Config, Error, Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Account ledger over a shared [`Store`]
#[derive(Debug)]
pub struct Ledger {
    store: Arc<Store>,
    precision: Precision,
    metrics: LedgerMetrics,
}

impl Ledger {
    /// Open the store described by `config` and wrap it in a ledger
    pub fn open(config: &Config) -> Result<Self> {
        let store = Arc::new(Store::open(config)?);
        Self::new(store, Precision::new(config.precision))
    }

    /// Ledger over an already opened store
    pub fn new(store: Arc<Store>, precision: Precision) -> Result<Self> {
        let metrics = LedgerMetrics::new()
            .map_err(|e| Error::Other(format!("Failed to create metrics: {}", e)))?;
        Ok(Self {
            store,
            precision,
            metrics,
        })
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Amount precision
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Metrics collector
    pub fn metrics(&self) -> &LedgerMetrics {
        &self.metrics
    }

    // Public operations, one transaction each

    /// Credit an external deposit and record a `Deposit` version
    pub fn deposit(&self, owner: OwnerId, asset: &str, amount: Decimal) -> Result<Account> {
        self.credit_with_reason(owner, asset, amount, Reason::Deposit)
    }

    /// Operator grant, recorded as `SystemGrant`
    pub fn grant(&self, owner: OwnerId, asset: &str, amount: Decimal) -> Result<Account> {
        self.credit_with_reason(owner, asset, amount, Reason::SystemGrant)
    }

    fn credit_with_reason(
        &self,
        owner: OwnerId,
        asset: &str,
        amount: Decimal,
        reason: Reason,
    ) -> Result<Account> {
        let _timer = self.metrics.operation_duration.start_timer();
        let amount = self.check_amount(amount)?;
        let account = self.store.update(|tx| {
            let account = self.deposit_in(tx, owner, asset, amount)?;
            let record = VersionRecord::draft(asset, reason)
                .deltas(amount, Decimal::ZERO)
                .after(&account);
            self.append_version_in(tx, owner, record)?;
            Ok::<_, Error>(account)
        })?;

        tracing::info!(
            owner = %owner,
            asset = asset,
            amount = %amount,
            reason = %reason,
            available = %account.available,
            "Account credited"
        );
        Ok(account)
    }

    /// Remove previously locked funds from the ledger
    pub fn withdraw(&self, owner: OwnerId, asset: &str, amount: Decimal) -> Result<Account> {
        let _timer = self.metrics.operation_duration.start_timer();
        self.store.update(|tx| self.withdraw_in(tx, owner, asset, amount))
    }

    /// Move funds from available to locked
    pub fn lock(&self, owner: OwnerId, asset: &str, amount: Decimal) -> Result<Account> {
        let _timer = self.metrics.operation_duration.start_timer();
        self.store.update(|tx| self.lock_in(tx, owner, asset, amount))
    }

    /// Move funds from locked back to available
    pub fn unlock(&self, owner: OwnerId, asset: &str, amount: Decimal) -> Result<Account> {
        let _timer = self.metrics.operation_duration.start_timer();
        self.store.update(|tx| self.unlock_in(tx, owner, asset, amount))
    }

    /// Debit `from.locked`, credit `to.available`
    pub fn transfer_from_locked(
        &self,
        from: OwnerId,
        to: OwnerId,
        asset: &str,
        amount: Decimal,
    ) -> Result<(Account, Account)> {
        let _timer = self.metrics.operation_duration.start_timer();
        self.store
            .update(|tx| self.transfer_from_locked_in(tx, from, to, asset, amount))
    }

    /// Append a version record in its own transaction
    pub fn append_version(&self, owner: OwnerId, record: VersionRecord) -> Result<VersionRecord> {
        self.store
            .update(|tx| self.append_version_in(tx, owner, record))
    }

    /// Account snapshot
    pub fn get_account(&self, owner: OwnerId, asset: &str) -> Result<Account> {
        self.store.view(|tx| Self::get_account_in(tx, owner, asset))
    }

    /// Every account of `owner`, ordered by asset
    pub fn accounts(&self, owner: OwnerId) -> Result<Vec<Account>> {
        self.store
            .view(|tx| tx.collect_prefix(Table::Accounts, &owner.key_bytes()))
    }

    /// Page through an owner's version records.
    ///
    /// Returns the page and the total number of records.
    pub fn list_versions(
        &self,
        owner: OwnerId,
        offset: u64,
        limit: u64,
        newest_first: bool,
    ) -> Result<(Vec<VersionRecord>, u64)> {
        self.store.view(|tx| {
            let total = tx.sequence(&version_sequence(owner))?;
            let mut page = Vec::new();
            if offset >= total {
                return Ok((page, total));
            }
            let count = limit.min(total - offset);
            for step in 0..count {
                let id = if newest_first {
                    total - offset - step
                } else {
                    offset + step + 1
                };
                let record: VersionRecord = tx
                    .get(Table::AccountVersions, &version_key(owner, id))?
                    .ok_or_else(|| {
                        Error::InvariantViolation(format!("version {} of {} missing", id, owner))
                    })?;
                page.push(record);
            }
            Ok((page, total))
        })
    }

    /// Whether an external transaction id has been credited
    pub fn has_external_transaction(&self, tx_id: &str) -> Result<bool> {
        self.store
            .view(|tx| tx.contains(Table::Deposits, tx_id.as_bytes()))
    }

    // Transaction-scoped operations

    /// Read an account inside any transaction
    pub fn get_account_in(tx: &impl KeyspaceRead, owner: OwnerId, asset: &str) -> Result<Account> {
        tx.get(Table::Accounts, &account_key(owner, asset))?
            .ok_or_else(|| Error::NoSuchAccount {
                owner,
                asset: asset.to_string(),
            })
    }

    /// Credit `available`, creating the account if needed
    pub fn deposit_in(
        &self,
        tx: &mut WriteTxn<'_>,
        owner: OwnerId,
        asset: &str,
        amount: Decimal,
    ) -> Result<Account> {
        let amount = self.check_amount(amount)?;
        let mut account = load_or_empty(tx, owner, asset)?;
        account.available = checked_credit(account.available, amount)?;
        save(tx, &account)?;
        Ok(account)
    }

    /// Debit `locked`
    pub fn withdraw_in(
        &self,
        tx: &mut WriteTxn<'_>,
        owner: OwnerId,
        asset: &str,
        amount: Decimal,
    ) -> Result<Account> {
        let amount = self.check_amount(amount)?;
        let mut account = self.existing(tx, owner, asset)?;
        if account.locked < amount {
            return Err(self.reject(Error::InsufficientFunds {
                owner,
                asset: asset.to_string(),
                requested: amount,
                available: account.locked,
            }));
        }
        account.locked -= amount;
        save(tx, &account)?;
        Ok(account)
    }

    /// Move `amount` from available to locked
    pub fn lock_in(
        &self,
        tx: &mut WriteTxn<'_>,
        owner: OwnerId,
        asset: &str,
        amount: Decimal,
    ) -> Result<Account> {
        let amount = self.check_amount(amount)?;
        let mut account = self.existing(tx, owner, asset)?;
        if account.available < amount {
            return Err(self.reject(Error::InsufficientFunds {
                owner,
                asset: asset.to_string(),
                requested: amount,
                available: account.available,
            }));
        }
        account.available -= amount;
        account.locked = checked_credit(account.locked, amount)?;
        save(tx, &account)?;
        Ok(account)
    }

    /// Move `amount` from locked to available
    pub fn unlock_in(
        &self,
        tx: &mut WriteTxn<'_>,
        owner: OwnerId,
        asset: &str,
        amount: Decimal,
    ) -> Result<Account> {
        let amount = self.check_amount(amount)?;
        let mut account = self.existing(tx, owner, asset)?;
        if account.locked < amount {
            return Err(self.reject(Error::InsufficientFunds {
                owner,
                asset: asset.to_string(),
                requested: amount,
                available: account.locked,
            }));
        }
        account.locked -= amount;
        account.available = checked_credit(account.available, amount)?;
        save(tx, &account)?;
        Ok(account)
    }

    /// Debit `from.locked` and credit `to.available` (creating `to` if absent)
    pub fn transfer_from_locked_in(
        &self,
        tx: &mut WriteTxn<'_>,
        from: OwnerId,
        to: OwnerId,
        asset: &str,
        amount: Decimal,
    ) -> Result<(Account, Account)> {
        let amount = self.check_amount(amount)?;
        let mut source = self.existing(tx, from, asset)?;
        if source.locked < amount {
            return Err(self.reject(Error::InsufficientFunds {
                owner: from,
                asset: asset.to_string(),
                requested: amount,
                available: source.locked,
            }));
        }
        source.locked -= amount;
        save(tx, &source)?;

        // Re-read after saving the source so a self-transfer sees the debit
        let mut target = load_or_empty(tx, to, asset)?;
        target.available = checked_credit(target.available, amount)?;
        save(tx, &target)?;

        if from == to {
            source = target.clone();
        }
        Ok((source, target))
    }

    /// Append a version record, assigning its id and timestamp
    pub fn append_version_in(
        &self,
        tx: &mut WriteTxn<'_>,
        owner: OwnerId,
        mut record: VersionRecord,
    ) -> Result<VersionRecord> {
        record.id = tx.next_sequence(&version_sequence(owner))?;
        record.timestamp = Utc::now();
        tx.put(Table::AccountVersions, version_key(owner, record.id), &record)?;

        self.metrics
            .mutations_total
            .with_label_values(&[record.reason.as_str()])
            .inc();
        tracing::debug!(
            owner = %owner,
            version = record.id,
            reason = %record.reason,
            balance_delta = %record.balance_delta,
            locked_delta = %record.locked_delta,
            "Version appended"
        );
        Ok(record)
    }

    /// Remember an external transaction; rejects ids seen before
    pub fn record_external_deposit_in(
        &self,
        tx: &mut WriteTxn<'_>,
        deposit: &ExternalDeposit,
    ) -> Result<()> {
        if tx.contains(Table::Deposits, deposit.tx_id.as_bytes())? {
            return Err(self.reject(Error::DuplicateExternalTransaction(
                deposit.tx_id.clone(),
            )));
        }
        tx.put(Table::Deposits, deposit.tx_id.as_bytes().to_vec(), deposit)
    }

    // Helpers

    fn check_amount(&self, amount: Decimal) -> Result<Decimal> {
        self.precision.check(amount).map_err(|e| self.reject(e))
    }

    fn existing(&self, tx: &WriteTxn<'_>, owner: OwnerId, asset: &str) -> Result<Account> {
        Self::get_account_in(tx, owner, asset).map_err(|e| self.reject(e))
    }

    fn reject(&self, err: Error) -> Error {
        let kind = match &err {
            Error::InsufficientFunds { .. } => Some("insufficient_funds"),
            Error::NoSuchAccount { .. } => Some("no_such_account"),
            Error::InvalidAmount(_) => Some("invalid_amount"),
            Error::DuplicateExternalTransaction(_) => Some("duplicate_external_transaction"),
            _ => None,
        };
        if let Some(kind) = kind {
            self.metrics.rejections_total.with_label_values(&[kind]).inc();
        }
        err
    }
}

fn account_key(owner: OwnerId, asset: &str) -> Vec<u8> {
    let mut key = owner.key_bytes().to_vec();
    key.extend_from_slice(asset.as_bytes());
    key
}

fn version_key(owner: OwnerId, id: u64) -> Vec<u8> {
    let mut key = owner.key_bytes().to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn version_sequence(owner: OwnerId) -> String {
    format!("versions/{}", owner)
}

fn load_or_empty(tx: &WriteTxn<'_>, owner: OwnerId, asset: &str) -> Result<Account> {
    Ok(tx
        .get(Table::Accounts, &account_key(owner, asset))?
        .unwrap_or_else(|| Account::empty(owner, asset)))
}

fn save(tx: &mut WriteTxn<'_>, account: &Account) -> Result<()> {
    if account.available < Decimal::ZERO || account.locked < Decimal::ZERO {
        return Err(Error::InvariantViolation(format!(
            "negative balance for {} {}",
            account.owner, account.asset
        )));
    }
    tx.put(
        Table::Accounts,
        account_key(account.owner, &account.asset),
        account,
    )
}

fn checked_credit(balance: Decimal, amount: Decimal) -> Result<Decimal> {
    balance
        .checked_add(amount)
        .ok_or_else(|| Error::InvariantViolation(format!("balance overflow adding {}", amount)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ASSET: &str = "GRAM";

    fn test_ledger() -> (Ledger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        (Ledger::open(&config).unwrap(), temp_dir)
    }

    fn dec(units: i64) -> Decimal {
        Decimal::new(units, 2)
    }

    #[test]
    fn test_append_version_standalone() {
        let (ledger, _temp) = test_ledger();
        let owner = OwnerId(7);
        ledger.deposit(owner, ASSET, dec(500)).unwrap();

        let mut draft = VersionRecord::draft(ASSET, Reason::SystemGrant).refs(crate::types::VersionRefs {
            memo: Some("manual adjustment".to_string()),
            ..Default::default()
        });
        draft.timestamp = chrono::DateTime::<Utc>::MIN_UTC;
        let before = Utc::now();
        let appended = ledger.append_version(owner, draft).unwrap();
        assert_eq!(appended.id, 2);
        assert!(appended.timestamp >= before);

        let (versions, total) = ledger.list_versions(owner, 0, 10, true).unwrap();
        assert_eq!(total, 2);
        assert_eq!(versions[0], appended);
        assert_eq!(versions[1].reason, Reason::Deposit);

        // Ids are per owner
        let other = ledger
            .append_version(OwnerId(8), VersionRecord::draft(ASSET, Reason::SystemGrant))
            .unwrap();
        assert_eq!(other.id, 1);
    }

    #[test]
    fn test_deposit_creates_account_and_version() {
        let (ledger, _temp) = test_ledger();
        let owner = OwnerId(1);

        let account = ledger.deposit(owner, ASSET, dec(1000)).unwrap();
        assert_eq!(account.available, dec(1000));
        assert_eq!(account.locked, Decimal::ZERO);

        let (versions, total) = ledger.list_versions(owner, 0, 10, false).unwrap();
        assert_eq!(total, 1);
        assert_eq!(versions[0].id, 1);
        assert_eq!(versions[0].reason, Reason::Deposit);
        assert_eq!(versions[0].balance_delta, dec(1000));
        assert_eq!(versions[0].available_after, dec(1000));
    }

    #[test]
    fn test_lock_unknown_account() {
        let (ledger, _temp) = test_ledger();
        let err = ledger.lock(OwnerId(5), ASSET, dec(1)).unwrap_err();
        assert!(matches!(err, Error::NoSuchAccount { .. }));
    }

    #[test]
    fn test_lock_insufficient_funds_leaves_balance() {
        let (ledger, _temp) = test_ledger();
        let owner = OwnerId(2);
        ledger.deposit(owner, ASSET, dec(500)).unwrap();

        let err = ledger.lock(owner, ASSET, dec(501)).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let account = ledger.get_account(owner, ASSET).unwrap();
        assert_eq!(account.available, dec(500));
        assert_eq!(account.locked, Decimal::ZERO);
        assert_eq!(
            ledger
                .metrics()
                .rejections_total
                .with_label_values(&["insufficient_funds"])
                .get(),
            1
        );
    }

    #[test]
    fn test_lock_unlock_withdraw() {
        let (ledger, _temp) = test_ledger();
        let owner = OwnerId(3);
        ledger.deposit(owner, ASSET, dec(1000)).unwrap();

        let locked = ledger.lock(owner, ASSET, dec(300)).unwrap();
        assert_eq!(locked.available, dec(700));
        assert_eq!(locked.locked, dec(300));

        let unlocked = ledger.unlock(owner, ASSET, dec(100)).unwrap();
        assert_eq!(unlocked.available, dec(800));
        assert_eq!(unlocked.locked, dec(200));

        assert!(ledger.unlock(owner, ASSET, dec(201)).is_err());

        let withdrawn = ledger.withdraw(owner, ASSET, dec(200)).unwrap();
        assert_eq!(withdrawn.available, dec(800));
        assert_eq!(withdrawn.locked, Decimal::ZERO);
        assert!(ledger.withdraw(owner, ASSET, dec(1)).is_err());
    }

    #[test]
    fn test_transfer_from_locked_creates_target() {
        let (ledger, _temp) = test_ledger();
        let (sender, receiver) = (OwnerId(10), OwnerId(11));
        ledger.deposit(sender, ASSET, dec(1000)).unwrap();
        ledger.lock(sender, ASSET, dec(400)).unwrap();

        let (from, to) = ledger
            .transfer_from_locked(sender, receiver, ASSET, dec(150))
            .unwrap();
        assert_eq!(from.locked, dec(250));
        assert_eq!(from.available, dec(600));
        assert_eq!(to.available, dec(150));
        assert_eq!(ledger.get_account(receiver, ASSET).unwrap(), to);
    }

    #[test]
    fn test_transfer_to_self() {
        let (ledger, _temp) = test_ledger();
        let owner = OwnerId(12);
        ledger.deposit(owner, ASSET, dec(100)).unwrap();
        ledger.lock(owner, ASSET, dec(100)).unwrap();

        let (from, to) = ledger
            .transfer_from_locked(owner, owner, ASSET, dec(40))
            .unwrap();
        assert_eq!(from, to);
        assert_eq!(to.available, dec(40));
        assert_eq!(to.locked, dec(60));
    }

    #[test]
    fn test_invalid_amounts() {
        let (ledger, _temp) = test_ledger();
        let owner = OwnerId(4);
        assert!(matches!(
            ledger.deposit(owner, ASSET, Decimal::ZERO),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            ledger.deposit(owner, ASSET, Decimal::new(1, 3)),
            Err(Error::InvalidAmount(_))
        ));
        assert!(ledger.accounts(owner).unwrap().is_empty());
    }

    #[test]
    fn test_list_versions_paging() {
        let (ledger, _temp) = test_ledger();
        let owner = OwnerId(-9);
        for i in 1..=5 {
            ledger.grant(owner, ASSET, dec(i)).unwrap();
        }

        let (page, total) = ledger.list_versions(owner, 1, 2, false).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.iter().map(|v| v.id).collect::<Vec<_>>(), vec![2, 3]);

        let (page, _) = ledger.list_versions(owner, 0, 2, true).unwrap();
        assert_eq!(page.iter().map(|v| v.id).collect::<Vec<_>>(), vec![5, 4]);
        assert_eq!(page[0].reason, Reason::SystemGrant);

        let (page, _) = ledger.list_versions(owner, 4, 10, true).unwrap();
        assert_eq!(page.iter().map(|v| v.id).collect::<Vec<_>>(), vec![1]);

        let (page, _) = ledger.list_versions(owner, 5, 10, true).unwrap();
        assert!(page.is_empty());
    }

    #[test]
    fn test_accounts_listing_is_per_owner() {
        let (ledger, _temp) = test_ledger();
        ledger.deposit(OwnerId(1), "AAA", dec(1)).unwrap();
        ledger.deposit(OwnerId(1), "BBB", dec(2)).unwrap();
        ledger.deposit(OwnerId(2), "AAA", dec(3)).unwrap();

        let accounts = ledger.accounts(OwnerId(1)).unwrap();
        let assets: Vec<_> = accounts.iter().map(|a| a.asset.as_str()).collect();
        assert_eq!(assets, vec!["AAA", "BBB"]);
    }

    #[test]
    fn test_composed_transaction_rolls_back() {
        let (ledger, _temp) = test_ledger();
        let owner = OwnerId(20);
        ledger.deposit(owner, ASSET, dec(100)).unwrap();

        let result: Result<()> = ledger.store().update(|tx| {
            ledger.lock_in(tx, owner, ASSET, dec(60))?;
            // Second lock exceeds what is left, so the first is discarded too
            ledger.lock_in(tx, owner, ASSET, dec(60))?;
            Ok(())
        });
        assert!(result.is_err());

        let account = ledger.get_account(owner, ASSET).unwrap();
        assert_eq!(account.available, dec(100));
        assert_eq!(account.locked, Decimal::ZERO);
    }

    #[test]
    fn test_external_deposit_duplicate() {
        let (ledger, _temp) = test_ledger();
        let deposit = ExternalDeposit {
            tx_id: "tx-1".to_string(),
            owner: OwnerId(1),
            asset: ASSET.to_string(),
            amount: dec(100),
            height: 10,
            from: "addr".to_string(),
            credited_at: Utc::now(),
        };

        ledger
            .store()
            .update(|tx| ledger.record_external_deposit_in(tx, &deposit))
            .unwrap();
        assert!(ledger.has_external_transaction("tx-1").unwrap());

        let err = ledger
            .store()
            .update(|tx| ledger.record_external_deposit_in(tx, &deposit))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateExternalTransaction(_)));
    }

    #[test]
    fn test_state_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        {
            let ledger = Ledger::open(&config).unwrap();
            ledger.deposit(OwnerId(1), ASSET, dec(250)).unwrap();
        }
        let ledger = Ledger::open(&config).unwrap();
        assert_eq!(ledger.get_account(OwnerId(1), ASSET).unwrap().available, dec(250));
        assert_eq!(ledger.list_versions(OwnerId(1), 0, 10, false).unwrap().1, 1);
    }
}
