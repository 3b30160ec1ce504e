//! Edge case tests for the ingest pipeline
//!
//! End-to-end scenarios through the processor with an in-memory gateway
//! and a recording sink.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

#[cfg(test)]
mod subscription_tests {
    use std::sync::Arc;

    use time::OffsetDateTime;

    use crate::gateway::{
        Expandable, List, Price, Recurring, Subscription, SubscriptionItem, WebhookEnvelope,
        WebhookEvent,
    };
    use crate::metadata::Metadata;
    use crate::model::Frequency;
    use crate::processor::ProcessOutcome;
    use crate::test_support::{customer, processor_with, usd_config, InMemoryFetcher};

    const TRIAL_END: i64 = 1_711_929_600;

    fn subscription(status: &str) -> Subscription {
        Subscription {
            id: "sub_1".to_string(),
            customer: Some(Expandable::Id("cus_1".to_string())),
            status: status.to_string(),
            start_date: Some(1_709_294_400),
            trial_end: Some(TRIAL_END),
            items: List {
                data: vec![SubscriptionItem {
                    id: "si_1".to_string(),
                    price: Some(Price {
                        unit_amount: Some(2500),
                        currency: Some("usd".to_string()),
                        recurring: Some(Recurring {
                            interval: "month".to_string(),
                            interval_count: Some(3),
                        }),
                        ..Default::default()
                    }),
                    quantity: Some(2),
                }],
                has_more: false,
            },
            ..Default::default()
        }
    }

    fn created(subscription: Subscription) -> WebhookEnvelope {
        WebhookEnvelope {
            id: "evt_sub".to_string(),
            event_type: "customer.subscription.created".to_string(),
            created: None,
            event: WebhookEvent::SubscriptionCreated(Box::new(subscription)),
        }
    }

    fn fetcher() -> Arc<InMemoryFetcher> {
        Arc::new(InMemoryFetcher::new().with_customer(customer("cus_1", "Jane Donor")))
    }

    // =========================================================================
    // Trialing subscription: exactly one recurring donation, starting at trial end
    // =========================================================================
    #[tokio::test]
    async fn test_trialing_subscription_creates_recurring_donation() {
        let (processor, sink) = processor_with(fetcher(), usd_config());

        let outcome = processor.process(&created(subscription("trialing"))).await.unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::RecurringDonationCreated {
                subscription_id: "sub_1".to_string()
            }
        );
        assert_eq!(sink.operations(), vec!["process_account", "process_subscription"]);

        let recurring = &sink.events_for("process_subscription")[0].recurring_donation;
        assert_eq!(
            recurring.start_date,
            Some(OffsetDateTime::from_unix_timestamp(TRIAL_END).unwrap()),
            "Trial end should be the start date"
        );
        assert_eq!(recurring.frequency, Frequency::Quarterly);
        assert_eq!(recurring.amount, Some(50.0));
        assert_eq!(recurring.account_id.as_deref(), Some("acc_crm"));
    }

    // =========================================================================
    // Live subscription: deferred to its first charge, no sink calls
    // =========================================================================
    #[tokio::test]
    async fn test_active_subscription_defers_to_first_charge() {
        let fetcher = fetcher();
        let (processor, sink) = processor_with(fetcher.clone(), usd_config());

        let outcome = processor.process(&created(subscription("active"))).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::Skipped { .. }));
        assert!(sink.calls().is_empty(), "Live subscription must not create a recurring donation");
        assert!(fetcher.calls().is_empty(), "No lookups for a deferred subscription");
    }

    // =========================================================================
    // Auto-migrated subscription: skipped even while trialing
    // =========================================================================
    #[tokio::test]
    async fn test_auto_migrated_subscription_skipped() {
        let (processor, sink) = processor_with(fetcher(), usd_config());
        let mut migrated = subscription("trialing");
        migrated.metadata = Metadata::from_iter([("auto-migrated", "TRUE")]);

        let outcome = processor.process(&created(migrated)).await.unwrap();

        match outcome {
            ProcessOutcome::Skipped { reason } => assert!(reason.contains("auto-migrated")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(sink.calls().is_empty());
    }

    // =========================================================================
    // Subscription deleted: closes the recurring donation
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_deleted_closes_recurring_donation() {
        let (processor, sink) = processor_with(fetcher(), usd_config());
        let envelope = WebhookEnvelope {
            id: "evt_del".to_string(),
            event_type: "customer.subscription.deleted".to_string(),
            created: None,
            event: WebhookEvent::SubscriptionDeleted(Box::new(subscription("canceled"))),
        };

        processor.process(&envelope).await.unwrap();

        let closed = sink.events_for("close_recurring_donation");
        assert_eq!(closed.len(), 1);
        assert!(!closed[0].recurring_donation.active);
        assert_eq!(closed[0].recurring_donation.subscription_id.as_deref(), Some("sub_1"));
    }

    // =========================================================================
    // Subscription without customer: processing error, no sink calls
    // =========================================================================
    #[tokio::test]
    async fn test_trialing_subscription_without_customer_fails() {
        let (processor, sink) = processor_with(fetcher(), usd_config());
        let mut orphan = subscription("trialing");
        orphan.customer = None;

        let result = processor.process(&created(orphan)).await;

        assert!(matches!(result, Err(crate::error::IngestError::MissingRelated(_))));
        assert!(sink.calls().is_empty());
    }
}

#[cfg(test)]
mod donation_tests {
    use std::sync::Arc;

    use crate::config::IngestConfig;
    use crate::gateway::{
        BalanceTransaction, Charge, Expandable, Invoice, List, PaymentIntent, Price, Recurring,
        Subscription, SubscriptionItem, WebhookEnvelope, WebhookEvent,
    };
    use crate::metadata::MetadataKeys;
    use crate::model::DonationStatus;
    use crate::processor::ProcessOutcome;
    use crate::test_support::{charge, customer, processor_with, usd_config, InMemoryFetcher};

    fn failed(charge: Charge) -> WebhookEnvelope {
        WebhookEnvelope {
            id: "evt_charge_failed".to_string(),
            event_type: "charge.failed".to_string(),
            created: None,
            event: WebhookEvent::ChargeFailed(Box::new(charge)),
        }
    }

    fn intent_failed(intent: PaymentIntent) -> WebhookEnvelope {
        WebhookEnvelope {
            id: "evt_pi_failed".to_string(),
            event_type: "payment_intent.payment_failed".to_string(),
            created: None,
            event: WebhookEvent::PaymentIntentFailed(Box::new(intent)),
        }
    }

    fn succeeded(charge: Charge) -> WebhookEnvelope {
        WebhookEnvelope {
            id: "evt_charge".to_string(),
            event_type: "charge.succeeded".to_string(),
            created: None,
            event: WebhookEvent::ChargeSucceeded(Box::new(charge)),
        }
    }

    fn intent_succeeded(intent: PaymentIntent) -> WebhookEnvelope {
        WebhookEnvelope {
            id: "evt_pi".to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            created: None,
            event: WebhookEvent::PaymentIntentSucceeded(Box::new(intent)),
        }
    }

    // =========================================================================
    // Charge belonging to an intent: the intent event handles it
    // =========================================================================
    #[tokio::test]
    async fn test_charge_with_payment_intent_skipped() {
        let fetcher = Arc::new(InMemoryFetcher::new());
        let (processor, sink) = processor_with(fetcher.clone(), usd_config());
        let mut ch = charge("ch_1", Some("cus_1"), 4200, "usd");
        ch.payment_intent = Some(Expandable::Id("pi_1".to_string()));

        let outcome = processor.process(&succeeded(ch)).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::Skipped { .. }));
        assert!(sink.calls().is_empty());
        assert!(fetcher.calls().is_empty(), "Skipped charge should not trigger lookups");
    }

    // =========================================================================
    // Failed charge belonging to an intent: the intent's failure event handles it
    // =========================================================================
    #[tokio::test]
    async fn test_failed_charge_with_payment_intent_skipped() {
        let fetcher = Arc::new(InMemoryFetcher::new());
        let (processor, sink) = processor_with(fetcher.clone(), usd_config());
        let mut ch = charge("ch_1", Some("cus_1"), 4200, "usd");
        ch.status = "failed".to_string();
        ch.payment_intent = Some(Expandable::Id("pi_1".to_string()));

        let outcome = processor.process(&failed(ch)).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::Skipped { .. }));
        assert!(sink.calls().is_empty());
        assert!(fetcher.calls().is_empty());
    }

    // =========================================================================
    // Failed charge without an intent is recorded as a failed donation
    // =========================================================================
    #[tokio::test]
    async fn test_failed_charge_creates_failed_donation() {
        let fetcher =
            Arc::new(InMemoryFetcher::new().with_customer(customer("cus_1", "Jane Donor")));
        let (processor, sink) = processor_with(fetcher, usd_config());
        let mut ch = charge("ch_1", Some("cus_1"), 4200, "usd");
        ch.status = "failed".to_string();

        let outcome = processor.process(&failed(ch)).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::DonationCreated { .. }));
        assert_eq!(sink.operations(), vec!["process_account", "create_donation"]);
        let donation = &sink.events_for("create_donation")[0].donation;
        assert_eq!(donation.status, DonationStatus::Failed);
        assert_eq!(donation.transaction_id.as_deref(), Some("ch_1"));
    }

    // =========================================================================
    // payment_intent.payment_failed goes through the intent path as Failed
    // =========================================================================
    #[tokio::test]
    async fn test_failed_payment_intent_creates_failed_donation() {
        let fetched = PaymentIntent {
            id: "pi_1".to_string(),
            amount: 2500,
            currency: "usd".to_string(),
            customer: Some(Expandable::Id("cus_1".to_string())),
            status: "requires_payment_method".to_string(),
            ..Default::default()
        };
        let fetcher = Arc::new(
            InMemoryFetcher::new()
                .with_customer(customer("cus_1", "Jane Donor"))
                .with_payment_intent(fetched.clone()),
        );
        let (processor, sink) = processor_with(fetcher.clone(), usd_config());

        processor.process(&intent_failed(fetched)).await.unwrap();

        assert_eq!(fetcher.call_count("payment_intent"), 1);
        let donation = &sink.events_for("create_donation")[0].donation;
        assert_eq!(donation.status, DonationStatus::Failed);
        assert_eq!(donation.transaction_id.as_deref(), Some("pi_1"));
        assert_eq!(donation.amount, Some(25.0));
    }

    // =========================================================================
    // $42.00 USD charge for a USD organization, not yet settled
    // =========================================================================
    #[tokio::test]
    async fn test_same_currency_charge() {
        let fetcher =
            Arc::new(InMemoryFetcher::new().with_customer(customer("cus_1", "Jane Donor")));
        let (processor, sink) = processor_with(fetcher, usd_config());

        let outcome = processor
            .process(&succeeded(charge("ch_1", Some("cus_1"), 4200, "usd")))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::DonationCreated {
                transaction_id: Some("ch_1".to_string()),
                recurring: false
            }
        );
        assert_eq!(sink.operations(), vec!["process_account", "create_donation"]);

        let event = &sink.events_for("create_donation")[0];
        assert_eq!(event.donation.amount, Some(42.0));
        assert_eq!(event.donation.original_amount_in_dollars, Some(42.0));
        assert!(!event.donation.currency_converted);
        assert_eq!(event.donation.account_id.as_deref(), Some("acc_crm"));
        assert_eq!(event.donation.contact_id.as_deref(), Some("con_crm"));
        assert_eq!(event.contact.first_name.as_deref(), Some("Jane"));
        assert_eq!(event.contact.last_name.as_deref(), Some("Donor"));
    }

    // =========================================================================
    // 42.00 EUR charge for a USD organization, settled as $45.50
    // =========================================================================
    #[tokio::test]
    async fn test_cross_currency_charge_settled() {
        let fetcher = Arc::new(
            InMemoryFetcher::new()
                .with_customer(customer("cus_1", "Jane Donor"))
                .with_balance_transaction(BalanceTransaction {
                    id: "txn_1".to_string(),
                    amount: 4550,
                    net: 4380,
                    fee: 170,
                    currency: "usd".to_string(),
                    exchange_rate: Some(1.0833),
                    type_: "charge".to_string(),
                    source: None,
                }),
        );
        let (processor, sink) = processor_with(fetcher, usd_config());
        let mut ch = charge("ch_1", Some("cus_1"), 4200, "eur");
        ch.balance_transaction = Some(Expandable::Id("txn_1".to_string()));

        processor.process(&succeeded(ch)).await.unwrap();

        let donation = &sink.events_for("create_donation")[0].donation;
        assert_eq!(donation.amount, Some(45.5), "Amount should be the settled USD value");
        assert_eq!(donation.original_amount_in_dollars, Some(42.0));
        assert_eq!(donation.original_currency.as_deref(), Some("EUR"));
        assert!(donation.currency_converted);
        assert_eq!(donation.exchange_rate, Some(1.0833));
        assert_eq!(donation.net_amount_in_dollars, Some(43.8));
        assert_eq!(donation.fee_in_dollars, Some(1.7));
        assert_eq!(donation.deposit_transaction_id.as_deref(), Some("txn_1"));
    }

    // =========================================================================
    // Guest checkout: no customer, anonymous identity
    // =========================================================================
    #[tokio::test]
    async fn test_guest_charge_is_anonymous() {
        let fetcher = Arc::new(InMemoryFetcher::new());
        let (processor, sink) = processor_with(fetcher.clone(), usd_config());

        processor
            .process(&succeeded(charge("ch_guest", None, 1000, "usd")))
            .await
            .unwrap();

        let event = &sink.events_for("create_donation")[0];
        assert_eq!(event.account.name.as_deref(), Some("Anonymous Account"));
        assert_eq!(event.contact.first_name.as_deref(), Some("Anonymous"));
        assert_eq!(event.contact.last_name.as_deref(), Some("Contact"));
        assert_eq!(fetcher.call_count("customer"), 0);
    }

    // =========================================================================
    // Intent payload is re-fetched; the fetched copy wins
    // =========================================================================
    #[tokio::test]
    async fn test_payment_intent_refetched() {
        let fetched = PaymentIntent {
            id: "pi_1".to_string(),
            amount: 5000,
            currency: "usd".to_string(),
            customer: Some(Expandable::Id("cus_1".to_string())),
            status: "succeeded".to_string(),
            created: Some(1_709_294_400),
            ..Default::default()
        };
        let fetcher = Arc::new(
            InMemoryFetcher::new()
                .with_customer(customer("cus_1", "Jane Donor"))
                .with_payment_intent(fetched),
        );
        let (processor, sink) = processor_with(fetcher.clone(), usd_config());

        // Webhook copy lacks the customer
        let sparse = PaymentIntent {
            id: "pi_1".to_string(),
            status: "succeeded".to_string(),
            ..Default::default()
        };
        processor.process(&intent_succeeded(sparse)).await.unwrap();

        assert_eq!(fetcher.call_count("payment_intent"), 1);
        let event = &sink.events_for("create_donation")[0];
        assert_eq!(event.donation.amount, Some(50.0));
        assert_eq!(event.donation.customer_id.as_deref(), Some("cus_1"));
    }

    // =========================================================================
    // First charge of a live subscription creates the recurring donation
    // =========================================================================
    #[tokio::test]
    async fn test_recurring_first_charge_processes_subscription() {
        let subscription = Subscription {
            id: "sub_1".to_string(),
            customer: Some(Expandable::Id("cus_1".to_string())),
            status: "active".to_string(),
            start_date: Some(1_709_294_400),
            items: List {
                data: vec![SubscriptionItem {
                    price: Some(Price {
                        unit_amount: Some(2000),
                        currency: Some("usd".to_string()),
                        recurring: Some(Recurring {
                            interval: "month".to_string(),
                            interval_count: Some(1),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                has_more: false,
            },
            ..Default::default()
        };
        let invoice = Invoice {
            id: "in_1".to_string(),
            subscription: Some(Expandable::Object(Box::new(subscription))),
            lines: None,
        };
        let intent = PaymentIntent {
            id: "pi_1".to_string(),
            amount: 2000,
            currency: "usd".to_string(),
            customer: Some(Expandable::Id("cus_1".to_string())),
            invoice: Some(Expandable::Id("in_1".to_string())),
            status: "succeeded".to_string(),
            ..Default::default()
        };
        let fetcher = Arc::new(
            InMemoryFetcher::new()
                .with_customer(customer("cus_1", "Jane Donor"))
                .with_invoice(invoice)
                .with_payment_intent(intent.clone()),
        );
        let (processor, sink) = processor_with(fetcher, usd_config());

        let outcome = processor.process(&intent_succeeded(intent)).await.unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::DonationCreated {
                transaction_id: Some("pi_1".to_string()),
                recurring: true
            }
        );
        assert_eq!(
            sink.operations(),
            vec!["process_account", "process_subscription", "create_donation"]
        );
        let donation = &sink.events_for("create_donation")[0].donation;
        assert_eq!(
            donation.recurring_donation_id.as_deref(),
            Some("rd_crm"),
            "Recurring donation id should be threaded onto the donation"
        );
    }

    // =========================================================================
    // Configured fund key resolves case-insensitively
    // =========================================================================
    #[tokio::test]
    async fn test_fund_from_configured_key() {
        let keys = MetadataKeys {
            fund: vec!["Fund".to_string()],
            ..Default::default()
        };
        let config = Arc::new(IngestConfig::new("usd", keys));
        let fetcher =
            Arc::new(InMemoryFetcher::new().with_customer(customer("cus_1", "Jane Donor")));
        let (processor, sink) = processor_with(fetcher, config);
        let mut ch = charge("ch_1", Some("cus_1"), 1000, "usd");
        ch.metadata = [("fund", "Scholarships")].into_iter().collect();

        processor.process(&succeeded(ch)).await.unwrap();

        let event = &sink.events_for("create_donation")[0];
        assert_eq!(event.fund().as_deref(), Some("Scholarships"));
    }

    // =========================================================================
    // Missing customer at the gateway aborts the event before any sink call
    // =========================================================================
    #[tokio::test]
    async fn test_lookup_failure_aborts_before_sinks() {
        let fetcher = Arc::new(InMemoryFetcher::new());
        let (processor, sink) = processor_with(fetcher, usd_config());

        let result = processor
            .process(&succeeded(charge("ch_1", Some("cus_gone"), 1000, "usd")))
            .await;

        assert!(matches!(result, Err(crate::error::IngestError::StripeApi(_))));
        assert!(sink.calls().is_empty());
    }
}

#[cfg(test)]
mod refund_tests {
    use std::sync::Arc;

    use crate::gateway::{
        Charge, Expandable, List, Refund, RefundPayload, WebhookEnvelope, WebhookEvent,
    };
    use crate::processor::ProcessOutcome;
    use crate::test_support::{processor_with, usd_config, InMemoryFetcher};

    fn refunded(payload: RefundPayload) -> WebhookEnvelope {
        WebhookEnvelope {
            id: "evt_refund".to_string(),
            event_type: "charge.refunded".to_string(),
            created: None,
            event: WebhookEvent::ChargeRefunded(payload),
        }
    }

    // =========================================================================
    // Both charge.refunded shapes produce the same refund record
    // =========================================================================
    #[tokio::test]
    async fn test_refund_shapes_produce_same_record() {
        let fetcher = Arc::new(InMemoryFetcher::new());
        let (processor, sink) = processor_with(fetcher.clone(), usd_config());

        let bare = RefundPayload::Refund(Box::new(Refund {
            id: "re_1".to_string(),
            amount: 4200,
            charge: Some(Expandable::Id("ch_1".to_string())),
            payment_intent: Some(Expandable::Id("pi_1".to_string())),
            created: Some(1_709_380_800),
            ..Default::default()
        }));
        let wrapped = RefundPayload::Charge(Box::new(Charge {
            id: "ch_1".to_string(),
            payment_intent: Some(Expandable::Id("pi_1".to_string())),
            refunds: Some(List {
                data: vec![Refund {
                    id: "re_1".to_string(),
                    amount: 4200,
                    created: Some(1_709_380_800),
                    ..Default::default()
                }],
                has_more: false,
            }),
            ..Default::default()
        }));

        let first = processor.process(&refunded(bare)).await.unwrap();
        let second = processor.process(&refunded(wrapped)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first,
            ProcessOutcome::Refunded {
                refund_id: "re_1".to_string(),
                transaction_id: Some("pi_1".to_string())
            }
        );

        let events = sink.events_for("refund_donation");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].donation, events[1].donation);
        assert_eq!(events[0].donation.secondary_id.as_deref(), Some("ch_1"));
        assert!(fetcher.calls().is_empty(), "Refunds need no lookups");
    }

    // =========================================================================
    // Refunded charge without nested refunds is skipped
    // =========================================================================
    #[tokio::test]
    async fn test_refunded_charge_without_refunds_skipped() {
        let (processor, sink) = processor_with(Arc::new(InMemoryFetcher::new()), usd_config());
        let payload = RefundPayload::Charge(Box::new(Charge {
            id: "ch_1".to_string(),
            ..Default::default()
        }));

        let outcome = processor.process(&refunded(payload)).await.unwrap();

        assert!(matches!(outcome, ProcessOutcome::Skipped { .. }));
        assert!(sink.calls().is_empty());
    }

    // =========================================================================
    // Refund of a charge outside any intent keys on the charge id
    // =========================================================================
    #[tokio::test]
    async fn test_refund_without_intent_uses_charge_id() {
        let (processor, sink) = processor_with(Arc::new(InMemoryFetcher::new()), usd_config());
        let payload = RefundPayload::Refund(Box::new(Refund {
            id: "re_2".to_string(),
            charge: Some(Expandable::Id("ch_2".to_string())),
            ..Default::default()
        }));

        processor.process(&refunded(payload)).await.unwrap();

        let donation = &sink.events_for("refund_donation")[0].donation;
        assert_eq!(donation.transaction_id.as_deref(), Some("ch_2"));
        assert_eq!(donation.secondary_id, None);
        assert!(donation.refund_date.is_some());
    }
}

#[cfg(test)]
mod payout_tests {
    use std::sync::Arc;

    use crate::gateway::{
        BalanceTransaction, BalanceTransactionSource, Expandable, PaymentIntent, Payout,
        WebhookEnvelope, WebhookEvent,
    };
    use crate::payout::DEFAULT_FUND;
    use crate::processor::ProcessOutcome;
    use crate::test_support::{
        charge, customer, processor_with, settled, usd_config, InMemoryFetcher, RecordingSink,
    };
    use crate::sink::Sinks;
    use crate::EventProcessor;

    fn payout(id: &str) -> Payout {
        Payout {
            id: id.to_string(),
            amount: 100_000,
            currency: "usd".to_string(),
            arrival_date: 1_709_856_000,
            status: "paid".to_string(),
        }
    }

    fn adjustment(id: &str, type_: &str, amount: i64) -> BalanceTransaction {
        BalanceTransaction {
            id: id.to_string(),
            amount,
            net: amount,
            currency: "usd".to_string(),
            type_: type_.to_string(),
            source: Some(Expandable::Object(Box::new(BalanceTransactionSource::Other))),
            ..Default::default()
        }
    }

    // =========================================================================
    // 250 balance transactions: three pages, one deposit per donor charge
    // =========================================================================
    #[tokio::test]
    async fn test_large_payout_paginates_and_deposits_each_charge() {
        let mut transactions: Vec<BalanceTransaction> = (0..247)
            .map(|i| {
                settled(
                    &format!("txn_{:03}", i),
                    charge(&format!("ch_{:03}", i), Some("cus_1"), 1000, "usd"),
                )
            })
            .collect();
        transactions.push(adjustment("txn_fee", "stripe_fee", -500));
        transactions.push(adjustment("txn_refund", "refund", -1000));
        // Charge without a customer is a reversal
        transactions.push(settled("txn_rev", charge("ch_rev", None, 1000, "usd")));
        assert_eq!(transactions.len(), 250);

        let fetcher = Arc::new(
            InMemoryFetcher::new()
                .with_customer(customer("cus_1", "Jane Donor"))
                .with_payout(payout("po_1"), transactions),
        );
        let (processor, sink) = processor_with(fetcher.clone(), usd_config());

        let reconciliation = processor.deposit_payout(&payout("po_1")).await.unwrap();

        assert_eq!(fetcher.call_count("balance_transactions_page"), 3);
        assert_eq!(reconciliation.events.len(), 247);
        assert_eq!(reconciliation.skipped, 3);
        assert_eq!(reconciliation.failed, 0);
        assert_eq!(sink.events_for("charge_deposited").len(), 247);

        let deposit = &reconciliation.deposit;
        assert_eq!(deposit.gross, 2470.0);
        assert_eq!(deposit.refunds, 10.0);
        assert_eq!(deposit.ledgers[DEFAULT_FUND].transaction_count, 247);

        let first = &reconciliation.events[0].donation;
        assert_eq!(first.deposit_id.as_deref(), Some("po_1"));
        assert!(first.deposit_date.is_some());
        assert_eq!(first.deposit_transaction_id.as_deref(), Some("txn_000"));
        assert_eq!(fetcher.call_count("balance_transaction"), 0, "Balance transactions come from the payout listing");
    }

    // =========================================================================
    // Exactly one page worth of transactions stops on has_more
    // =========================================================================
    #[tokio::test]
    async fn test_full_single_page_stops_on_has_more() {
        let transactions: Vec<BalanceTransaction> = (0..100)
            .map(|i| adjustment(&format!("txn_{:03}", i), "adjustment", 1))
            .collect();
        let fetcher =
            Arc::new(InMemoryFetcher::new().with_payout(payout("po_1"), transactions));
        let (processor, _sink) = processor_with(fetcher.clone(), usd_config());

        let reconciliation = processor.deposit_payout(&payout("po_1")).await.unwrap();

        assert_eq!(fetcher.call_count("balance_transactions_page"), 1);
        assert_eq!(reconciliation.skipped, 100);
        assert!(reconciliation.events.is_empty());
    }

    // =========================================================================
    // Settled charge belonging to an intent is deposited as the intent
    // =========================================================================
    #[tokio::test]
    async fn test_intent_charge_deposited_under_intent_id() {
        let mut ch = charge("ch_1", Some("cus_1"), 3000, "usd");
        ch.payment_intent = Some(Expandable::Id("pi_1".to_string()));
        let intent = PaymentIntent {
            id: "pi_1".to_string(),
            amount: 3000,
            currency: "usd".to_string(),
            customer: Some(Expandable::Id("cus_1".to_string())),
            status: "succeeded".to_string(),
            ..Default::default()
        };
        let fetcher = Arc::new(
            InMemoryFetcher::new()
                .with_customer(customer("cus_1", "Jane Donor"))
                .with_payment_intent(intent)
                .with_payout(payout("po_1"), vec![settled("txn_1", ch)]),
        );
        let (processor, _sink) = processor_with(fetcher, usd_config());

        let reconciliation = processor.deposit_payout(&payout("po_1")).await.unwrap();

        let donation = &reconciliation.events[0].donation;
        assert_eq!(donation.transaction_id.as_deref(), Some("pi_1"));
        assert_eq!(donation.net_amount_in_dollars, Some(29.7));
        assert_eq!(donation.deposit_transaction_id.as_deref(), Some("txn_1"));
    }

    // =========================================================================
    // One failing charge does not stop the rest of the payout
    // =========================================================================
    #[tokio::test]
    async fn test_failures_isolated_per_charge() {
        let transactions = vec![
            settled("txn_1", charge("ch_1", Some("cus_1"), 1000, "usd")),
            // Customer unknown to the gateway: enrichment fails
            settled("txn_2", charge("ch_2", Some("cus_gone"), 1000, "usd")),
            settled("txn_3", charge("ch_3", Some("cus_1"), 1000, "usd")),
        ];
        let fetcher = Arc::new(
            InMemoryFetcher::new()
                .with_customer(customer("cus_1", "Jane Donor"))
                .with_payout(payout("po_1"), transactions),
        );
        let sink = Arc::new(RecordingSink::new().failing_deposit("ch_3"));
        let processor = EventProcessor::new(
            fetcher,
            usd_config(),
            Sinks::new(sink.clone(), sink.clone()),
        );

        let envelope = WebhookEnvelope {
            id: "evt_po".to_string(),
            event_type: "payout.paid".to_string(),
            created: None,
            event: WebhookEvent::PayoutPaid(Box::new(payout("po_1"))),
        };
        let outcome = processor.process(&envelope).await.unwrap();

        let ProcessOutcome::Deposited {
            deposited,
            failed,
            deposit,
        } = outcome
        else {
            panic!("expected a deposit outcome, got {:?}", outcome);
        };
        assert_eq!(deposited, 1);
        assert_eq!(failed, 2);
        assert_eq!(sink.events_for("charge_deposited").len(), 1);

        // Totals cover only the charge that reached the sink
        assert_eq!(deposit.payout_id, "po_1");
        assert_eq!(deposit.gross, 10.0);
        assert_eq!(deposit.net, 9.7);
        assert_eq!(deposit.fees, 0.3);
        assert_eq!(deposit.undelivered, 20.0);
        assert_eq!(deposit.transaction_count(), 1);
        assert_eq!(deposit.ledgers[DEFAULT_FUND].gross, 10.0);
    }
}

#[cfg(test)]
mod dispatch_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use time::OffsetDateTime;

    use crate::error::IngestError;
    use crate::queue::PoolConfig;
    use crate::test_support::{customer, processor_with, usd_config, InMemoryFetcher};
    use crate::webhooks::{sign_payload, DispatchOutcome, WebhookDispatcher};

    const SECRET: &str = "whsec_dispatch_test";

    fn charge_payload(event_id: &str, charge_id: &str) -> String {
        charge_payload_for(event_id, charge_id, "cus_1")
    }

    fn charge_payload_for(event_id: &str, charge_id: &str, customer_id: &str) -> String {
        json!({
            "id": event_id,
            "type": "charge.succeeded",
            "data": {"object": {
                "object": "charge",
                "id": charge_id,
                "customer": customer_id,
                "amount": 1500,
                "currency": "usd",
                "status": "succeeded"
            }}
        })
        .to_string()
    }

    fn signed(payload: &str) -> String {
        sign_payload(payload, SECRET, OffsetDateTime::now_utc().unix_timestamp()).unwrap()
    }

    // =========================================================================
    // Signed handled event is queued and processed after shutdown drains
    // =========================================================================
    #[tokio::test]
    async fn test_dispatch_queues_and_processes() {
        let fetcher =
            Arc::new(InMemoryFetcher::new().with_customer(customer("cus_1", "Jane Donor")));
        let (processor, sink) = processor_with(fetcher, usd_config());
        let dispatcher = WebhookDispatcher::new(
            Arc::new(processor),
            Some(SECRET.to_string()),
            PoolConfig { lanes: 2, depth: 16, ..PoolConfig::default() },
        );

        for n in 0..3 {
            let payload = charge_payload(&format!("evt_{}", n), &format!("ch_{}", n));
            let outcome = dispatcher.dispatch(&payload, Some(&signed(&payload))).unwrap();
            assert!(matches!(outcome, DispatchOutcome::Queued { .. }));
        }
        dispatcher.shutdown().await;

        let created: Vec<String> = sink
            .events_for("create_donation")
            .into_iter()
            .filter_map(|e| e.donation.transaction_id)
            .collect();
        assert_eq!(created, vec!["ch_0", "ch_1", "ch_2"], "Same donor runs in arrival order");
    }

    // =========================================================================
    // A hung lookup for one donor does not hold back other donors on its lane
    // =========================================================================
    #[tokio::test]
    async fn test_hung_event_does_not_block_lane() {
        let fetcher = Arc::new(
            InMemoryFetcher::new()
                .hanging_customer("cus_hang")
                .with_customer(customer("cus_6", "Sam Donor")),
        );
        let (processor, sink) = processor_with(fetcher, usd_config());
        // One lane, so both donors share it
        let dispatcher = WebhookDispatcher::new(
            Arc::new(processor),
            None,
            PoolConfig {
                lanes: 1,
                depth: 16,
                job_timeout: Duration::from_millis(100),
            },
        );

        let hung = charge_payload_for("evt_hang", "ch_hang", "cus_hang");
        let other = charge_payload_for("evt_6", "ch_6", "cus_6");
        dispatcher.dispatch(&hung, None).unwrap();
        dispatcher.dispatch(&other, None).unwrap();
        dispatcher.shutdown().await;

        let created: Vec<String> = sink
            .events_for("create_donation")
            .into_iter()
            .filter_map(|e| e.donation.transaction_id)
            .collect();
        assert_eq!(created, vec!["ch_6"]);
    }

    // =========================================================================
    // Unhandled event types are acknowledged without processing
    // =========================================================================
    #[tokio::test]
    async fn test_dispatch_ignores_unhandled_type() {
        let (processor, sink) = processor_with(Arc::new(InMemoryFetcher::new()), usd_config());
        let dispatcher = WebhookDispatcher::new(Arc::new(processor), None, PoolConfig::default());

        let payload = json!({
            "id": "evt_x",
            "type": "customer.updated",
            "data": {"object": {"object": "customer", "id": "cus_1"}}
        })
        .to_string();
        let outcome = dispatcher.dispatch(&payload, None).unwrap();
        dispatcher.shutdown().await;

        assert_eq!(
            outcome,
            DispatchOutcome::Ignored {
                event_id: "evt_x".to_string(),
                event_type: "customer.updated".to_string()
            }
        );
        assert!(sink.calls().is_empty());
    }

    // =========================================================================
    // Signature problems are rejected before decoding
    // =========================================================================
    #[tokio::test]
    async fn test_dispatch_rejects_bad_signatures() {
        let (processor, sink) = processor_with(Arc::new(InMemoryFetcher::new()), usd_config());
        let dispatcher = WebhookDispatcher::new(
            Arc::new(processor),
            Some(SECRET.to_string()),
            PoolConfig::default(),
        );
        let payload = charge_payload("evt_1", "ch_1");

        assert!(matches!(
            dispatcher.dispatch(&payload, None),
            Err(IngestError::WebhookSignatureInvalid)
        ));
        let wrong = sign_payload(&payload, "whsec_other", OffsetDateTime::now_utc().unix_timestamp())
            .unwrap();
        assert!(matches!(
            dispatcher.dispatch(&payload, Some(&wrong)),
            Err(IngestError::WebhookSignatureInvalid)
        ));
        dispatcher.shutdown().await;

        assert!(sink.calls().is_empty());
    }

    // =========================================================================
    // Malformed payload is a decode error, nothing queued
    // =========================================================================
    #[tokio::test]
    async fn test_dispatch_rejects_malformed_payload() {
        let (processor, _sink) = processor_with(Arc::new(InMemoryFetcher::new()), usd_config());
        let dispatcher = WebhookDispatcher::new(Arc::new(processor), None, PoolConfig::default());

        let result = dispatcher.dispatch("{\"id\": 1}", None);
        dispatcher.shutdown().await;

        assert!(matches!(result, Err(IngestError::Decode(_))));
    }
}

#[cfg(test)]
mod replay_tests {
    use std::sync::Arc;

    use time::macros::datetime;

    use crate::error::IngestError;
    use crate::gateway::Payout;
    use crate::replay::replay_payouts;
    use crate::test_support::{charge, customer, processor_with, settled, usd_config, InMemoryFetcher};

    fn payout(id: &str, arrival_date: i64) -> Payout {
        Payout {
            id: id.to_string(),
            currency: "usd".to_string(),
            arrival_date,
            status: "paid".to_string(),
            ..Default::default()
        }
    }

    // =========================================================================
    // Replay deposits every payout arriving in the window
    // =========================================================================
    #[tokio::test]
    async fn test_replay_window() {
        // 2024-03-01, 2024-03-05 and 2024-04-01 at midnight UTC
        let fetcher = Arc::new(
            InMemoryFetcher::new()
                .with_customer(customer("cus_1", "Jane Donor"))
                .with_payout(
                    payout("po_1", 1_709_251_200),
                    vec![settled("txn_1", charge("ch_1", Some("cus_1"), 1000, "usd"))],
                )
                .with_payout(
                    payout("po_2", 1_709_596_800),
                    vec![
                        settled("txn_2", charge("ch_2", Some("cus_1"), 1000, "usd")),
                        settled("txn_3", charge("ch_3", Some("cus_gone"), 1000, "usd")),
                    ],
                )
                .with_payout(
                    payout("po_3", 1_711_929_600),
                    vec![settled("txn_4", charge("ch_4", Some("cus_1"), 1000, "usd"))],
                ),
        );
        let (processor, sink) = processor_with(fetcher, usd_config());

        let summary = replay_payouts(
            &processor,
            datetime!(2024-03-01 00:00 UTC),
            datetime!(2024-04-01 00:00 UTC),
        )
        .await
        .unwrap();

        assert_eq!(summary.payouts, 2, "Window end is exclusive");
        assert_eq!(summary.reconciled, 2);
        assert_eq!(summary.deposited, 2);
        assert_eq!(summary.failed_charges, 1);
        assert_eq!(summary.failed_payouts, 0);
        assert_eq!(sink.events_for("charge_deposited").len(), 2);

        let payout_ids: Vec<&str> = summary.deposits.iter().map(|d| d.payout_id.as_str()).collect();
        assert_eq!(payout_ids, vec!["po_1", "po_2"]);
        assert_eq!(summary.deposits[1].gross, 10.0);
        assert_eq!(summary.deposits[1].undelivered, 10.0);
    }

    // =========================================================================
    // Empty or inverted windows are rejected
    // =========================================================================
    #[tokio::test]
    async fn test_replay_rejects_inverted_window() {
        let (processor, _sink) = processor_with(Arc::new(InMemoryFetcher::new()), usd_config());
        let at = datetime!(2024-03-01 00:00 UTC);

        let result = replay_payouts(&processor, at, at).await;

        assert!(matches!(result, Err(IngestError::Config(_))));
    }
}
