//! LuckyMoney daemon
//!
//! `luckyd [run]` starts the expiration scheduler and the reconciler.
//! Operator commands: `grant <owner> <amount>`, `balance <owner>`,
//! `history <owner> [limit]`, `stats`, `backup <dest>`.

use anyhow::{bail, Context};
use luckymoney_distribution::{
    Config, DistributionEngine, ExpirationScheduler, ExpiryQueue, Pusher, Reconciler, TracingSink,
};
use luckymoney_ledger::{Ledger, OwnerId};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match std::env::var("LUCKYMONEY_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => Config::from_env()?,
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("run");

    let ledger = Arc::new(Ledger::open(&config.ledger)?);
    let stats = ledger.store().stats()?;
    tracing::info!(
        data_dir = %config.ledger.data_dir.display(),
        accounts = stats.accounts,
        versions = stats.versions,
        distributions = stats.distributions,
        pending_settlements = stats.pending_settlements,
        "Ledger opened"
    );

    match command {
        "run" => run(config, ledger).await,
        "grant" => {
            let owner = owner_arg(&args, 1)?;
            let amount: Decimal = args
                .get(2)
                .context("usage: luckyd grant <owner> <amount>")?
                .parse()
                .context("invalid amount")?;
            let account = ledger.grant(owner, &config.asset, amount)?;
            println!("{} {}: available {} locked {}", account.owner, account.asset, account.available, account.locked);
            Ok(())
        }
        "balance" => {
            let owner = owner_arg(&args, 1)?;
            for account in ledger.accounts(owner)? {
                println!("{} {}: available {} locked {}", account.owner, account.asset, account.available, account.locked);
            }
            Ok(())
        }
        "history" => {
            let owner = owner_arg(&args, 1)?;
            let limit = match args.get(2) {
                Some(raw) => raw.parse().context("invalid limit")?,
                None => 20,
            };
            let (versions, total) = ledger.list_versions(owner, 0, limit, true)?;
            println!("{} records", total);
            for v in versions {
                println!(
                    "#{} {} {} balance {} locked {} fee {} -> {}",
                    v.id, v.timestamp, v.reason, v.balance_delta, v.locked_delta, v.fee, v.available_after
                );
            }
            Ok(())
        }
        "stats" => {
            println!("{:#?}", stats);
            Ok(())
        }
        "backup" => {
            let dest = args.get(1).context("usage: luckyd backup <dest>")?;
            ledger.store().backup(dest)?;
            println!("backup written to {}", dest);
            Ok(())
        }
        other => bail!("unknown command '{}'", other),
    }
}

async fn run(config: Config, ledger: Arc<Ledger>) -> anyhow::Result<()> {
    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        asset = %config.asset,
        "Starting LuckyMoney daemon"
    );

    let (pusher, pusher_handle) = Pusher::spawn(Arc::new(TracingSink));
    let engine = Arc::new(DistributionEngine::new(
        ledger,
        config.distribution.clone(),
        config.compensation.clone(),
        ExpiryQueue::new(),
    ));

    let scheduler = Arc::new(ExpirationScheduler::new(
        Arc::clone(&engine),
        config.scheduler.clone(),
        config.expire_after(),
        Some(pusher.clone()),
    ));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&engine),
        Duration::from_secs(config.scheduler.reconcile_interval_secs),
        Some(pusher.clone()),
    ));

    {
        let scheduler = Arc::clone(&scheduler);
        let requeued = tokio::task::spawn_blocking(move || scheduler.rehydrate()).await??;
        tracing::info!(requeued, "Pending expiries restored");
    }
    {
        let reconciler = Arc::clone(&reconciler);
        let report = tokio::task::spawn_blocking(move || reconciler.run_once()).await??;
        tracing::info!(settled = report.settled, failed = report.failed, "Startup reconciliation done");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx.clone()));
    let reconciler_handle = tokio::spawn(Arc::clone(&reconciler).run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down LuckyMoney daemon");
    tracing::info!(metrics = %engine.ledger().metrics().gather_text(), "Final ledger metrics");

    shutdown_tx.send(true)?;
    scheduler_handle.await?;
    reconciler_handle.await?;

    drop(scheduler);
    drop(reconciler);
    drop(pusher);
    pusher_handle.await?;
    Ok(())
}

fn owner_arg(args: &[String], index: usize) -> anyhow::Result<OwnerId> {
    let raw = args.get(index).context("missing owner id")?;
    let id: i64 = raw.parse().with_context(|| format!("invalid owner id '{}'", raw))?;
    Ok(OwnerId(id))
}
