//! Payout reconciliation
//!
//! A payout is one bank transfer covering many settled payments. Reconciling
//! it walks the payout's balance transactions, sends one deposit-tagged
//! donation event per underlying charge to the deposit sink, and summarizes
//! what was delivered.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::enrich::Enricher;
use crate::error::IngestResult;
use crate::event::PaymentGatewayEvent;
use crate::gateway::{BalanceTransaction, Charge, Payout};
use crate::sink::DonationSink;

/// Fund used when no configured fund key is present on the donation
pub const DEFAULT_FUND: &str = "General";

/// Totals for one fund within a deposit, in dollars of the settlement currency
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FundLedger {
    pub gross: f64,
    pub net: f64,
    pub fees: f64,
    pub transaction_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PaymentGatewayDeposit {
    pub payout_id: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deposit_date: Option<OffsetDateTime>,
    pub currency: String,
    pub gross: f64,
    pub net: f64,
    pub fees: f64,
    /// Refunds netted out of the payout
    pub refunds: f64,
    /// Gross of charges that could not be enriched or delivered
    pub undelivered: f64,
    /// Delivered charges only
    pub ledgers: BTreeMap<String, FundLedger>,
}

impl PaymentGatewayDeposit {
    pub fn new(payout: &Payout) -> Self {
        Self {
            payout_id: payout.id.clone(),
            deposit_date: OffsetDateTime::from_unix_timestamp(payout.arrival_date).ok(),
            currency: payout.currency.to_ascii_uppercase(),
            ..Default::default()
        }
    }

    fn record(&mut self, fund: String, bt: &BalanceTransaction) {
        let gross = bt.amount as f64 / 100.0;
        let net = bt.net as f64 / 100.0;
        let fees = bt.fee as f64 / 100.0;

        self.gross += gross;
        self.net += net;
        self.fees += fees;

        let ledger = self.ledgers.entry(fund).or_default();
        ledger.gross += gross;
        ledger.net += net;
        ledger.fees += fees;
        ledger.transaction_count += 1;
    }

    fn record_refund(&mut self, bt: &BalanceTransaction) {
        self.refunds += (bt.amount as f64 / 100.0).abs();
    }

    fn record_undelivered(&mut self, bt: &BalanceTransaction) {
        self.undelivered += bt.amount as f64 / 100.0;
    }

    pub fn transaction_count(&self) -> usize {
        self.ledgers.values().map(|l| l.transaction_count).sum()
    }
}

#[derive(Debug, Clone)]
pub struct PayoutReconciliation {
    pub deposit: PaymentGatewayDeposit,
    /// One event per delivered charge, in balance transaction order
    pub events: Vec<PaymentGatewayEvent>,
    /// Non-charge transactions and reversals
    pub skipped: usize,
    /// Charges whose enrichment or delivery failed
    pub failed: usize,
}

#[derive(Clone)]
pub struct PayoutReconciler {
    enricher: Enricher,
    donations: Arc<dyn DonationSink>,
}

impl PayoutReconciler {
    pub fn new(enricher: Enricher, donations: Arc<dyn DonationSink>) -> Self {
        Self { enricher, donations }
    }

    /// Reconcile `payout` and notify the deposit sink once per charge. A
    /// failure for one charge is logged and counted; the rest still go out.

    pub async fn reconcile(&self, payout: &Payout) -> IngestResult<PayoutReconciliation> {
        let balance_transactions = self
            .enricher
            .fetcher()
            .payout_balance_transactions(&payout.id)
            .await?;

        let mut reconciliation = PayoutReconciliation {
            deposit: PaymentGatewayDeposit::new(payout),
            events: Vec::with_capacity(balance_transactions.len()),
            skipped: 0,
            failed: 0,
        };

        for bt in &balance_transactions {
            let Some(charge) = bt.source_charge() else {
                if is_refund(bt) {
                    reconciliation.deposit.record_refund(bt);
                }
                reconciliation.skipped += 1;
                continue;
            };

            // A charge without a customer in a payout is a reversal, not a gift
            if charge.customer_id().is_none() {
                tracing::info!(
                    payout_id = %payout.id,
                    charge_id = %charge.id,
                    "Skipping payout charge without customer (likely a reversal)"
                );
                reconciliation.skipped += 1;
                continue;
            }

            let mut event = match self.deposit_event(charge, bt).await {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(
                        payout_id = %payout.id,
                        charge_id = %charge.id,
                        balance_transaction_id = %bt.id,
                        error = %e,
                        "Failed to enrich deposited charge"
                    );
                    reconciliation.deposit.record_undelivered(bt);
                    reconciliation.failed += 1;
                    continue;
                }
            };
            event.set_deposit(payout);

            if let Err(e) = self.donations.charge_deposited(&event).await {
                tracing::error!(
                    payout_id = %payout.id,
                    transaction_id = ?event.donation.transaction_id,
                    error = %e,
                    "Deposit sink failed for charge"
                );
                reconciliation.deposit.record_undelivered(bt);
                reconciliation.failed += 1;
                continue;
            }

            let fund = event.fund().unwrap_or_else(|| DEFAULT_FUND.to_string());
            reconciliation.deposit.record(fund, bt);
            reconciliation.events.push(event);
        }

        let deposit = &reconciliation.deposit;
        tracing::info!(
            payout_id = %payout.id,
            balance_transactions = balance_transactions.len(),
            deposited = deposit.transaction_count(),
            skipped = reconciliation.skipped,
            failed = reconciliation.failed,
            gross = deposit.gross,
            net = deposit.net,
            fees = deposit.fees,
            refunds = deposit.refunds,
            undelivered = deposit.undelivered,
            funds = deposit.ledgers.len(),
            "Payout reconciled"
        );

        Ok(reconciliation)
    }

    async fn deposit_event(
        &self,
        charge: &Charge,
        bt: &BalanceTransaction,
    ) -> IngestResult<PaymentGatewayEvent> {
        match charge.payment_intent_id() {
            None => self.enricher.charge_event(charge, Some(bt.clone())).await,
            Some(intent_id) => {
                let intent = self.enricher.fetcher().payment_intent(intent_id).await?;
                self.enricher
                    .payment_intent_event_from(&intent, Some(bt.clone()))
                    .await
            }
        }
    }
}

fn is_refund(bt: &BalanceTransaction) -> bool {
    matches!(bt.type_.as_str(), "refund" | "payment_refund")
}
