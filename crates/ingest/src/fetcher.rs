//! Secondary lookups for gateway events
//!
//! A webhook payload rarely carries everything normalization needs. The
//! fetcher issues one read per related object; callers decide which objects
//! are worth fetching and run the lookups one after another.

use async_trait::async_trait;
use serde::Serialize;

use crate::client::StripeClient;
use crate::error::IngestResult;
use crate::gateway::{BalanceTransaction, Customer, Invoice, List, PaymentIntent, Payout};

/// Largest page the gateway's list endpoints return
pub const PAGE_LIMIT: usize = 100;

/// Arrival-date window for payout listing, epoch seconds, end exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArrivalWindow {
    pub gte: i64,
    pub lt: i64,
}

#[async_trait]
pub trait GatewayObjectFetcher: Send + Sync {
    /// Customer by id, with payment sources expanded
    async fn customer(&self, id: &str) -> IngestResult<Customer>;

    /// Invoice by id, with the subscription expanded
    async fn invoice(&self, id: &str) -> IngestResult<Invoice>;

    async fn balance_transaction(&self, id: &str) -> IngestResult<BalanceTransaction>;

    async fn payment_intent(&self, id: &str) -> IngestResult<PaymentIntent>;

    /// One page of a payout's balance transactions, sources expanded
    async fn balance_transactions_page(
        &self,
        payout_id: &str,
        starting_after: Option<&str>,
    ) -> IngestResult<List<BalanceTransaction>>;

    /// One page of paid payouts arriving inside `window`
    async fn payouts_page(
        &self,
        window: ArrivalWindow,
        starting_after: Option<&str>,
    ) -> IngestResult<List<Payout>>;

    /// Every balance transaction belonging to a payout
    async fn payout_balance_transactions(
        &self,
        payout_id: &str,
    ) -> IngestResult<Vec<BalanceTransaction>> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .balance_transactions_page(payout_id, cursor.as_deref())
                .await?;
            let done = page.data.len() < PAGE_LIMIT || !page.has_more;
            cursor = page.data.last().map(|bt| bt.id.clone());
            all.extend(page.data);
            if done || cursor.is_none() {
                break;
            }
        }
        tracing::debug!(payout_id = %payout_id, count = all.len(), "Fetched payout balance transactions");
        Ok(all)
    }

    /// Every paid payout arriving inside `window`
    async fn payouts_in_window(&self, window: ArrivalWindow) -> IngestResult<Vec<Payout>> {
        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.payouts_page(window, cursor.as_deref()).await?;
            let done = page.data.len() < PAGE_LIMIT || !page.has_more;
            cursor = page.data.last().map(|p| p.id.clone());
            all.extend(page.data);
            if done || cursor.is_none() {
                break;
            }
        }
        Ok(all)
    }
}

#[derive(Serialize)]
struct ExpandParams {
    expand: Vec<&'static str>,
}

#[derive(Serialize)]
struct BalanceTransactionListParams<'a> {
    payout: &'a str,
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    starting_after: Option<&'a str>,
    expand: Vec<&'static str>,
}

#[derive(Serialize)]
struct PayoutListParams<'a> {
    arrival_date: ArrivalWindow,
    status: &'static str,
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    starting_after: Option<&'a str>,
}

#[async_trait]
impl GatewayObjectFetcher for StripeClient {
    async fn customer(&self, id: &str) -> IngestResult<Customer> {
        let params = ExpandParams {
            expand: vec!["sources"],
        };
        self.get(&format!("/customers/{}", id), &params).await
    }

    async fn invoice(&self, id: &str) -> IngestResult<Invoice> {
        let params = ExpandParams {
            expand: vec!["subscription"],
        };
        self.get(&format!("/invoices/{}", id), &params).await
    }

    async fn balance_transaction(&self, id: &str) -> IngestResult<BalanceTransaction> {
        let params = ExpandParams { expand: vec![] };
        self.get(&format!("/balance_transactions/{}", id), &params)
            .await
    }

    async fn payment_intent(&self, id: &str) -> IngestResult<PaymentIntent> {
        let params = ExpandParams { expand: vec![] };
        self.get(&format!("/payment_intents/{}", id), &params).await
    }

    async fn balance_transactions_page(
        &self,
        payout_id: &str,
        starting_after: Option<&str>,
    ) -> IngestResult<List<BalanceTransaction>> {
        let params = BalanceTransactionListParams {
            payout: payout_id,
            limit: PAGE_LIMIT,
            starting_after,
            expand: vec!["data.source"],
        };
        self.get("/balance_transactions", &params).await
    }

    async fn payouts_page(
        &self,
        window: ArrivalWindow,
        starting_after: Option<&str>,
    ) -> IngestResult<List<Payout>> {
        let params = PayoutListParams {
            arrival_date: window,
            status: "paid",
            limit: PAGE_LIMIT,
            starting_after,
        };
        self.get("/payouts", &params).await
    }
}
