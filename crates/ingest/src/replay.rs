//! Payout backfill
//!
//! Re-runs payout reconciliation for every paid payout that arrived in a time
//! window. Used to recover deposits whose `payout.paid` webhook was missed or
//! failed.

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{IngestError, IngestResult};
use crate::fetcher::ArrivalWindow;
use crate::payout::PaymentGatewayDeposit;
use crate::processor::EventProcessor;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub payouts: usize,
    pub reconciled: usize,
    pub failed_payouts: usize,
    pub deposited: usize,
    pub failed_charges: usize,
    /// One summary per reconciled payout
    pub deposits: Vec<PaymentGatewayDeposit>,
}

/// Replay payouts arriving in `[start, end)`
pub async fn replay_payouts(
    processor: &EventProcessor,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> IngestResult<ReplaySummary> {
    if start >= end {
        return Err(IngestError::Config(format!(
            "replay window start {} is not before end {}",
            start, end
        )));
    }

    let window = ArrivalWindow {
        gte: start.unix_timestamp(),
        lt: end.unix_timestamp(),
    };
    let payouts = processor.enricher().fetcher().payouts_in_window(window).await?;

    tracing::info!(
        start = %start,
        end = %end,
        payouts = payouts.len(),
        "Replaying payouts"
    );

    let mut summary = ReplaySummary {
        payouts: payouts.len(),
        ..Default::default()
    };

    for payout in &payouts {
        match processor.deposit_payout(payout).await {
            Ok(reconciliation) => {
                summary.reconciled += 1;
                summary.deposited += reconciliation.events.len();
                summary.failed_charges += reconciliation.failed;
                summary.deposits.push(reconciliation.deposit);
            }
            Err(e) => {
                tracing::error!(payout_id = %payout.id, error = %e, "Payout replay failed");
                summary.failed_payouts += 1;
            }
        }
    }

    tracing::info!(
        reconciled = summary.reconciled,
        failed_payouts = summary.failed_payouts,
        deposited = summary.deposited,
        "Payout replay finished"
    );

    Ok(summary)
}
