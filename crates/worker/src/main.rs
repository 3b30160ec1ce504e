// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! DonorBridge Background Worker
//!
//! Handles scheduled jobs including:
//! - Payout replay over the last `PAYOUT_REPLAY_DAYS` days (daily at 03:30 UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use donorbridge_ingest::{replay_payouts, EventProcessor, IngestService, ReplaySummary};
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_REPLAY_DAYS: i64 = 2;

/// Look-back window for payout replay
fn replay_days_from_env() -> anyhow::Result<i64> {
    match std::env::var("PAYOUT_REPLAY_DAYS") {
        Ok(raw) => {
            let days: i64 = raw
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("PAYOUT_REPLAY_DAYS must be a positive integer"))?;
            if days <= 0 {
                anyhow::bail!("PAYOUT_REPLAY_DAYS must be a positive integer");
            }
            Ok(days)
        }
        Err(_) => Ok(DEFAULT_REPLAY_DAYS),
    }
}

/// `[now - days, now)`
fn replay_window(now: OffsetDateTime, days: i64) -> (OffsetDateTime, OffsetDateTime) {
    (now - time::Duration::days(days), now)
}

/// Log results of a replay run
fn log_replay_summary(summary: &ReplaySummary) {
    info!(
        payouts = summary.payouts,
        reconciled = summary.reconciled,
        deposited = summary.deposited,
        failed_payouts = summary.failed_payouts,
        failed_charges = summary.failed_charges,
        "Payout replay cycle complete"
    );

    for deposit in &summary.deposits {
        info!(
            payout_id = %deposit.payout_id,
            currency = %deposit.currency,
            gross = deposit.gross,
            net = deposit.net,
            fees = deposit.fees,
            refunds = deposit.refunds,
            undelivered = deposit.undelivered,
            "Deposit totals"
        );
        for (fund, ledger) in &deposit.ledgers {
            info!(
                payout_id = %deposit.payout_id,
                fund = %fund,
                gross = ledger.gross,
                net = ledger.net,
                fees = ledger.fees,
                transactions = ledger.transaction_count,
                "Fund ledger"
            );
        }
    }

    if summary.failed_payouts > 0 || summary.failed_charges > 0 {
        warn!(
            failed_payouts = summary.failed_payouts,
            failed_charges = summary.failed_charges,
            "Payout replay finished with failures"
        );
    }
}

async fn run_replay(processor: &EventProcessor, days: i64) {
    let (start, end) = replay_window(OffsetDateTime::now_utc(), days);
    match replay_payouts(processor, start, end).await {
        Ok(summary) => log_replay_summary(&summary),
        Err(e) => error!(error = %e, "Payout replay failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting DonorBridge Worker");

    let replay_days = replay_days_from_env()?;

    let service = match IngestService::from_env() {
        Ok(service) => service,
        Err(e) => {
            // Without Stripe credentials there is nothing to replay
            warn!(error = %e, "Failed to create ingest service - running in minimal mode");

            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };
    let processor: Arc<EventProcessor> = service.processor.clone();

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Replay recent payouts so missed payout.paid webhooks still produce deposits
    // Cron: 03:30 UTC daily, after the gateway's overnight payouts have landed
    let replay_processor = processor.clone();
    scheduler
        .add(Job::new_async("0 30 3 * * *", move |_uuid, _l| {
            let processor = replay_processor.clone();
            Box::pin(async move {
                info!(days = replay_days, "Running scheduled payout replay");
                run_replay(&processor, replay_days).await;
            })
        })?)
        .await?;
    info!(days = replay_days, "Scheduled: Payout replay (daily at 03:30 UTC)");

    // Job 2: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("DonorBridge Worker started successfully with {} scheduled jobs", 2);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
