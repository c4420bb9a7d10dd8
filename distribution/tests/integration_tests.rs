//! Integration tests for the lucky-money service
//!
//! Exercises the engine, scheduler, reconciler and funding flows together
//! against a real on-disk ledger:
//! - Create / claim / expire lifecycle and balance conservation
//! - Concurrent claims
//! - Restart with queue rehydration and the expiry checkpoint
//! - Reconciliation of claims whose transfer did not commit
//! - Deposits and withdrawals through a gateway

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use luckymoney_distribution::{
    CreateRequest, DistributionConfig, DistributionEngine, Error, ExpirationScheduler,
    ExpiryQueue, ExternalTransaction, FundingService, FutureRegistry, Notice, NoticeSink, Pusher,
    Reconciler, Result, RetryConfig, SchedulerConfig, Split, TransferGateway, WithdrawConfig,
    WithdrawOutcome, WithdrawRequest,
};
use luckymoney_ledger::{Config, Ledger, OwnerId, Reason};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const ASSET: &str = "GRAM";
const ALICE: OwnerId = OwnerId(1);

fn dec(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

fn open_engine(dir: &Path) -> Arc<DistributionEngine> {
    let config = Config {
        data_dir: dir.to_path_buf(),
        ..Default::default()
    };
    let ledger = Arc::new(Ledger::open(&config).unwrap());
    Arc::new(DistributionEngine::new(
        ledger,
        DistributionConfig::default(),
        RetryConfig::default(),
        ExpiryQueue::new(),
    ))
}

fn request(split: Split, count: u32) -> CreateRequest {
    CreateRequest {
        sender: ALICE,
        sender_name: "alice".to_string(),
        asset: ASSET.to_string(),
        split,
        count,
        message: "happy new year".to_string(),
    }
}

fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval_ms: 10,
        worker_pool_size: 2,
        reconcile_interval_secs: 1,
    }
}

#[derive(Default)]
struct RecordingSink {
    seen: Mutex<Vec<(OwnerId, Notice)>>,
}

#[async_trait]
impl NoticeSink for RecordingSink {
    async fn deliver(&self, receiver: OwnerId, notice: Notice) -> Result<()> {
        self.seen.lock().push((receiver, notice));
        Ok(())
    }
}

#[test]
fn test_random_distribution_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(temp_dir.path());
    let ledger = Arc::clone(engine.ledger());
    ledger.grant(ALICE, ASSET, dec(2000)).unwrap();

    let distribution = engine
        .create(request(Split::Random { total: dec(1000) }, 3))
        .unwrap();
    assert!(distribution.id > luckymoney_distribution::engine::ID_FLOOR);
    assert_eq!(distribution.total_units, 1000);

    let sender = ledger.get_account(ALICE, ASSET).unwrap();
    assert_eq!(sender.available, dec(1000));
    assert_eq!(sender.locked, dec(1000));

    let mut paid = Decimal::ZERO;
    for claimant in 2..5 {
        let receipt = engine.claim(distribution.id, OwnerId(claimant), "member").unwrap();
        assert!(receipt.settled);
        assert!(receipt.units >= 1);
        paid += receipt.amount;
        let account = ledger.get_account(OwnerId(claimant), ASSET).unwrap();
        assert_eq!(account.available, receipt.amount);
    }
    assert_eq!(paid, dec(1000));

    let sender = ledger.get_account(ALICE, ASSET).unwrap();
    assert_eq!(sender.available, dec(1000));
    assert_eq!(sender.locked, Decimal::ZERO);

    let extremes = engine.extremes(distribution.id).unwrap().unwrap();
    assert!(extremes.smallest.units <= extremes.largest.units);

    let history = engine.claim_history(distribution.id).unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|share| share.settled));

    // Fully claimed: expiry refunds nothing
    let refund = engine.expire(distribution.id).unwrap().unwrap();
    assert_eq!(refund.amount, Decimal::ZERO);
    assert_eq!(ledger.get_account(ALICE, ASSET).unwrap().available, dec(1000));
}

#[test]
fn test_equal_distribution_and_exhaustion() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(temp_dir.path());
    let ledger = Arc::clone(engine.ledger());
    ledger.grant(ALICE, ASSET, dec(500)).unwrap();

    let distribution = engine
        .create(request(Split::Equal { per_share: dec(100) }, 5))
        .unwrap();
    assert_eq!(distribution.total_units, 500);

    for claimant in 10..15 {
        let receipt = engine.claim(distribution.id, OwnerId(claimant), "member").unwrap();
        assert_eq!(receipt.amount, dec(100));
    }
    assert!(matches!(
        engine.claim(distribution.id, OwnerId(99), "late"),
        Err(Error::NothingLeft(_))
    ));

    let stored = engine.get(distribution.id).unwrap();
    assert!(stored.is_exhausted());
    assert_eq!(stored.claimed_units, stored.total_units);
    assert_eq!(ledger.get_account(ALICE, ASSET).unwrap().total(), Decimal::ZERO);
}

#[test]
fn test_claim_is_once_per_claimant() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(temp_dir.path());
    engine.ledger().grant(ALICE, ASSET, dec(1000)).unwrap();

    let distribution = engine
        .create(request(Split::Random { total: dec(1000) }, 4))
        .unwrap();
    let first = engine.claim(distribution.id, OwnerId(2), "bob").unwrap();
    let second = engine.claim(distribution.id, OwnerId(2), "bob");
    assert!(matches!(second, Err(Error::AlreadyClaimed(_))));

    let account = engine.ledger().get_account(OwnerId(2), ASSET).unwrap();
    assert_eq!(account.available, first.amount);
    assert_eq!(engine.get(distribution.id).unwrap().claimed_count, 1);
}

#[test]
fn test_create_rejects_insufficient_funds_without_side_effects() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(temp_dir.path());
    let ledger = Arc::clone(engine.ledger());
    ledger.grant(ALICE, ASSET, dec(100)).unwrap();

    let err = engine
        .create(request(Split::Random { total: dec(1000) }, 3))
        .unwrap_err();
    assert_eq!(err.code(), "insufficient_funds");

    let account = ledger.get_account(ALICE, ASSET).unwrap();
    assert_eq!(account.available, dec(100));
    assert_eq!(account.locked, Decimal::ZERO);
    let (page, total) = engine.list_by_sender(ALICE, 0, 10, true).unwrap();
    assert!(page.is_empty());
    assert_eq!(total, 0);
}

#[test]
fn test_concurrent_claims_never_overpay() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(temp_dir.path());
    engine.ledger().grant(ALICE, ASSET, dec(10_000)).unwrap();

    let distribution = engine
        .create(request(Split::Random { total: dec(10_000) }, 10))
        .unwrap();

    let handles: Vec<_> = (0..32)
        .map(|i| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.claim(distribution.id, OwnerId(100 + i), "racer"))
        })
        .collect();

    let mut winners = 0;
    let mut paid = Decimal::ZERO;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(receipt) => {
                winners += 1;
                paid += receipt.amount;
            }
            Err(Error::NothingLeft(_)) => {}
            Err(e) => panic!("unexpected claim error: {}", e),
        }
    }

    assert_eq!(winners, 10);
    assert_eq!(paid, dec(10_000));
    let sender = engine.ledger().get_account(ALICE, ASSET).unwrap();
    assert_eq!(sender.locked, Decimal::ZERO);

    let mut indices: Vec<u32> = engine
        .claim_history(distribution.id)
        .unwrap()
        .iter()
        .map(|share| share.index)
        .collect();
    indices.dedup();
    assert_eq!(indices.len(), 10);
}

#[tokio::test]
async fn test_scheduler_expires_and_refunds() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(temp_dir.path());
    let ledger = Arc::clone(engine.ledger());
    ledger.grant(ALICE, ASSET, dec(1000)).unwrap();

    let distribution = engine
        .create(request(Split::Random { total: dec(600) }, 3))
        .unwrap();
    let receipt = engine.claim(distribution.id, OwnerId(2), "bob").unwrap();

    let sink = Arc::new(RecordingSink::default());
    let (pusher, pusher_handle) = Pusher::spawn(sink.clone());
    let scheduler = ExpirationScheduler::new(
        Arc::clone(&engine),
        scheduler_config(),
        ChronoDuration::seconds(60),
        Some(pusher),
    );

    // Not due yet
    assert!(scheduler.tick(Utc::now()).is_none());
    assert_eq!(engine.queue().len(), 1);

    let finished = scheduler
        .tick(Utc::now() + ChronoDuration::seconds(61))
        .expect("distribution should be due");
    finished.await.unwrap();

    let stored = engine.get(distribution.id).unwrap();
    assert!(stored.expired);
    assert!(engine.queue().is_empty());
    assert_eq!(engine.checkpoint().unwrap(), distribution.id);

    let refund = dec(600) - receipt.amount;
    let sender = ledger.get_account(ALICE, ASSET).unwrap();
    assert_eq!(sender.locked, Decimal::ZERO);
    assert_eq!(sender.available, dec(400) + refund);

    // Second expiry is a no-op
    assert!(engine.expire(distribution.id).unwrap().is_none());
    assert!(matches!(
        engine.claim(distribution.id, OwnerId(3), "carol"),
        Err(Error::DistributionExpired(_))
    ));

    drop(scheduler);
    pusher_handle.await.unwrap();
    let seen = sink.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, ALICE);
    assert_eq!(
        seen[0].1,
        Notice::DistributionRefunded {
            distribution_id: distribution.id,
            asset: ASSET.to_string(),
            amount: refund,
        }
    );
}

#[tokio::test]
async fn test_restart_rehydrates_above_checkpoint() {
    let temp_dir = TempDir::new().unwrap();
    let (first, second) = {
        let engine = open_engine(temp_dir.path());
        engine.ledger().grant(ALICE, ASSET, dec(1000)).unwrap();
        let first = engine
            .create(request(Split::Random { total: dec(100) }, 2))
            .unwrap();
        let second = engine
            .create(request(Split::Random { total: dec(100) }, 2))
            .unwrap();
        engine.expire(first.id).unwrap();
        engine.advance_checkpoint(first.id).unwrap();
        (first, second)
    };

    let engine = open_engine(temp_dir.path());
    assert_eq!(engine.checkpoint().unwrap(), first.id);
    let scheduler = ExpirationScheduler::new(
        Arc::clone(&engine),
        scheduler_config(),
        ChronoDuration::seconds(60),
        None,
    );
    assert_eq!(scheduler.rehydrate().unwrap(), 1);
    assert_eq!(engine.queue().peek().unwrap().id, second.id);

    let finished = scheduler
        .tick(Utc::now() + ChronoDuration::seconds(120))
        .unwrap();
    finished.await.unwrap();
    assert!(engine.get(second.id).unwrap().expired);
    assert_eq!(engine.checkpoint().unwrap(), second.id);

    let sender = engine.ledger().get_account(ALICE, ASSET).unwrap();
    assert_eq!(sender.available, dec(1000));
    assert_eq!(sender.locked, Decimal::ZERO);

    // Ids keep increasing across restarts
    let third = engine
        .create(request(Split::Random { total: dec(100) }, 2))
        .unwrap();
    assert!(third.id > second.id);
    assert_eq!(engine.get_by_serial(&third.serial).unwrap().id, third.id);
}

#[test]
fn test_reconciler_settles_unfinished_claim() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(temp_dir.path());
    let ledger = Arc::clone(engine.ledger());
    ledger.grant(ALICE, ASSET, dec(1000)).unwrap();

    let distribution = engine
        .create(request(Split::Equal { per_share: dec(100) }, 2))
        .unwrap();

    // Pull the lock out from under the distribution so the transfer fails
    ledger.unlock(ALICE, ASSET, dec(200)).unwrap();
    let receipt = engine.claim(distribution.id, OwnerId(2), "bob").unwrap();
    assert!(!receipt.settled);
    assert_eq!(engine.pending_settlements().unwrap().len(), 1);
    assert!(ledger.get_account(OwnerId(2), ASSET).is_err());

    ledger.lock(ALICE, ASSET, dec(200)).unwrap();
    let reconciler = Reconciler::new(Arc::clone(&engine), Duration::from_secs(60), None);
    let report = reconciler.run_once().unwrap();
    assert_eq!(report.settled, 1);
    assert_eq!(report.failed, 0);
    assert!(engine.pending_settlements().unwrap().is_empty());
    assert_eq!(ledger.get_account(OwnerId(2), ASSET).unwrap().available, dec(100));

    // Nothing left to do on a second pass
    assert_eq!(reconciler.run_once().unwrap().settled, 0);

    let (versions, _) = ledger.list_versions(OwnerId(2), 0, 10, true).unwrap();
    assert_eq!(versions[0].reason, Reason::DistributionClaimed);
    assert_eq!(versions[0].refs.distribution_id, Some(distribution.id));
}

#[test]
fn test_list_by_sender_pages_newest_first() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(temp_dir.path());
    engine.ledger().grant(ALICE, ASSET, dec(10_000)).unwrap();

    let ids: Vec<_> = (0..5)
        .map(|_| {
            engine
                .create(request(Split::Random { total: dec(100) }, 1))
                .unwrap()
                .id
        })
        .collect();

    let (page, total) = engine.list_by_sender(ALICE, 1, 2, true).unwrap();
    assert_eq!(total, 5);
    assert_eq!(page.iter().map(|d| d.id).collect::<Vec<_>>(), vec![ids[3], ids[2]]);

    let (page, _) = engine.list_by_sender(ALICE, 0, 10, false).unwrap();
    assert_eq!(page.iter().map(|d| d.id).collect::<Vec<_>>(), ids);
}

/// Gateway that settles every withdraw with a fixed outcome
struct EchoGateway {
    registry: Arc<FutureRegistry<WithdrawOutcome>>,
    outcome: WithdrawOutcome,
}

#[async_trait]
impl TransferGateway for EchoGateway {
    async fn validate_transaction(&self, tx: &ExternalTransaction) -> Result<bool> {
        Ok(tx.to == "EQservice")
    }

    async fn validate_address(&self, _address: &str) -> Result<bool> {
        Ok(true)
    }

    async fn initiate_withdraw(&self, request: WithdrawRequest) -> Result<()> {
        self.registry.resolve(&request.token, self.outcome.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_deposit_then_distribute_then_withdraw() {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(temp_dir.path());
    let ledger = Arc::clone(engine.ledger());

    let registry = Arc::new(FutureRegistry::new());
    let gateway = Arc::new(EchoGateway {
        registry: Arc::clone(&registry),
        outcome: WithdrawOutcome::Succeeded { tx_id: None },
    });
    let funding = FundingService::new(
        Arc::clone(&ledger),
        gateway,
        registry,
        WithdrawConfig {
            fee: dec(10),
            timeout_secs: 5,
        },
        None,
    );

    let deposit = ExternalTransaction {
        tx_id: "abc".to_string(),
        height: 1,
        from: "EQwallet".to_string(),
        to: "EQservice".to_string(),
        asset: ASSET.to_string(),
        amount: dec(1000),
        memo: ALICE.get().to_string(),
    };
    funding.deposit(deposit.clone()).await.unwrap();
    assert!(matches!(
        funding.deposit(deposit).await,
        Err(Error::Ledger(luckymoney_ledger::Error::DuplicateExternalTransaction(_)))
    ));

    let distribution = engine
        .create(request(Split::Equal { per_share: dec(200) }, 2))
        .unwrap();
    engine.claim(distribution.id, OwnerId(2), "bob").unwrap();

    let bob = funding
        .withdraw(OwnerId(2), ASSET, "EQbob", dec(150))
        .await
        .unwrap();
    assert_eq!(bob.available, dec(40));
    assert_eq!(bob.locked, Decimal::ZERO);

    let alice = ledger.get_account(ALICE, ASSET).unwrap();
    assert_eq!(alice.available, dec(600));
    assert_eq!(alice.locked, dec(200));
}
