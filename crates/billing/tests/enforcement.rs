//! Enforcement gate, usage windows, credits and overage settlement

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use common::*;
use uuid::Uuid;
use whatsflow_billing::overage::overage_payment_id;
use whatsflow_billing::{LedgerStore, WebhookOutcome};
use whatsflow_shared::{
    add_months, Action, CreditTransactionType, PaymentKind, PaymentStatus, Resource,
};

// ============================================================================
// Gate
// ============================================================================

#[tokio::test]
async fn test_unlimited_plan_always_allows() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.enterprise).await;

    t.billing
        .usage
        .record_usage(user, Action::SendMessage, 5_000_000)
        .await
        .unwrap();
    for action in [
        Action::SendMessage,
        Action::SendAiMessage,
        Action::SendBroadcast,
        Action::ScrapePage,
        Action::ConnectDevice,
    ] {
        let decision = t.billing.usage.can_perform_action(user, action).await;
        assert!(decision.allowed, "{} should be allowed", action);
        assert!(!decision.overage);
    }

    let summary = t.billing.usage.usage_summary(user).await.unwrap();
    let messages = summary
        .resources
        .iter()
        .find(|r| r.resource == Resource::Messages)
        .unwrap();
    assert!(messages.unlimited);
    assert_eq!(messages.limit, None);
    assert_eq!(messages.percentage, None);
    assert_eq!(messages.used, 5_000_000);
}

#[tokio::test]
async fn test_reached_limit_denies_with_reason() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.starter).await;

    t.billing
        .usage
        .record_usage(user, Action::SendAiMessage, 200)
        .await
        .unwrap();
    let decision = t
        .billing
        .usage
        .can_perform_action(user, Action::SendAiMessage)
        .await;
    assert!(!decision.allowed);
    assert!(decision.needs_upgrade);
    assert!(decision.reason.unwrap().contains("200"));

    // Other resources are unaffected
    assert!(
        t.billing
            .usage
            .can_perform_action(user, Action::SendMessage)
            .await
            .allowed
    );
}

#[tokio::test]
async fn test_missing_feature_denied_before_limit() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.starter).await;

    let decision = t
        .billing
        .usage
        .can_perform_action(user, Action::SendBroadcast)
        .await;
    assert!(!decision.allowed);
    assert!(decision.needs_upgrade);
    assert!(decision.reason.unwrap().contains("Broadcast"));
}

#[tokio::test]
async fn test_outage_fails_open() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.starter).await;
    t.billing
        .usage
        .record_usage(user, Action::SendAiMessage, 200)
        .await
        .unwrap();

    t.store.set_unavailable(true);
    let decision = t
        .billing
        .usage
        .can_perform_action(user, Action::SendAiMessage)
        .await;
    assert!(decision.allowed);
    assert!(decision.degraded);
}

// ============================================================================
// Credits
// ============================================================================

#[tokio::test]
async fn test_credits_cover_part_of_a_charge() {
    let t = setup().await;
    let user = Uuid::new_v4();
    t.billing
        .credits
        .add_credits(user, 30, CreditTransactionType::Promotional, "Welcome", None)
        .await
        .unwrap();

    let result = t
        .billing
        .credits
        .process_overage_charges(user, 50, None)
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.paid_from_credits, 30);
    assert_eq!(result.remaining_charge, 20);
    assert_eq!(t.billing.credits.balance(user).await.unwrap(), 0);
}

#[tokio::test]
async fn test_credits_cover_whole_charge() {
    let t = setup().await;
    let user = Uuid::new_v4();
    t.billing
        .credits
        .add_credits(user, 50, CreditTransactionType::Promotional, "Welcome", None)
        .await
        .unwrap();

    let result = t
        .billing
        .credits
        .process_overage_charges(user, 30, None)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.paid_from_credits, 30);
    assert_eq!(result.remaining_charge, 0);
    assert_eq!(t.billing.credits.balance(user).await.unwrap(), 20);

    let history = t.billing.credits.history(user, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().any(|txn| txn.amount == -30));
}

#[tokio::test]
async fn test_deduction_never_overdraws() {
    let t = setup().await;
    let user = Uuid::new_v4();
    t.billing
        .credits
        .add_credits(user, 10, CreditTransactionType::Adjustment, "Goodwill", None)
        .await
        .unwrap();

    let deducted = t
        .billing
        .credits
        .deduct_credits(user, 11, "Too much", None)
        .await
        .unwrap();
    assert!(!deducted);
    assert_eq!(t.billing.credits.balance(user).await.unwrap(), 10);
    assert_eq!(t.billing.credits.history(user, 10).await.unwrap().len(), 1);
}

// ============================================================================
// Overage settlement at rollover
// ============================================================================

#[tokio::test]
async fn test_rollover_bills_overage_after_credits() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.business).await;
    t.billing
        .credits
        .add_credits(user, 30, CreditTransactionType::Promotional, "Launch offer", None)
        .await
        .unwrap();

    // 150 messages on a 100 limit: 50 over at 1 each
    t.billing
        .usage
        .record_usage(user, Action::SendMessage, 150)
        .await
        .unwrap();
    let decision = t
        .billing
        .usage
        .can_perform_action(user, Action::SendMessage)
        .await;
    assert!(decision.allowed);
    assert!(decision.overage);

    let sub = t.billing.subscriptions.current(user).await.unwrap().unwrap();
    let first_period = t.store.current_usage(sub.id).await.unwrap().unwrap();

    t.clock.set(add_months(T0, 1));
    let summary = t.billing.usage.usage_summary(user).await.unwrap();
    assert_eq!(summary.period_start, Some(add_months(T0, 1)));

    let payment = t
        .store
        .find_payment_by_provider_id(&overage_payment_id(first_period.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.kind, PaymentKind::Overage);
    assert_eq!(payment.amount, 20);
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(t.billing.credits.balance(user).await.unwrap(), 0);
    assert_eq!(event_count(&t, user, "OVERAGE_RECORDED").await, 1);

    // The tenant pays the remainder through a checkout
    let checkout = t
        .billing
        .checkout
        .create_payment_checkout(user, payment.id, &customer())
        .await
        .unwrap();
    let outcome = t
        .billing
        .webhooks
        .handle(&signed(&checkout.order_id, 20, "2"))
        .await;
    assert_eq!(outcome, WebhookOutcome::Applied);
    let paid = t.store.get_payment(payment.id).await.unwrap().unwrap();
    assert_eq!(paid.status, PaymentStatus::Succeeded);
}

#[tokio::test]
async fn test_failed_overage_billing_reopens_period() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.business).await;
    t.billing
        .credits
        .add_credits(user, 30, CreditTransactionType::Promotional, "Launch offer", None)
        .await
        .unwrap();
    t.billing
        .usage
        .record_usage(user, Action::SendMessage, 150)
        .await
        .unwrap();
    let sub = t.billing.subscriptions.current(user).await.unwrap().unwrap();
    let first_period = t.store.current_usage(sub.id).await.unwrap().unwrap();

    // Credits are drawn but the overage payment cannot be written, twice over
    t.clock.set(add_months(T0, 1));
    t.store.fail_next_write("insert_payment");
    t.store.fail_next_write("insert_payment");
    assert_eq!(t.billing.usage.close_stale_periods(100).await.unwrap(), 0);

    let stale = t
        .store
        .stale_usage_periods(add_months(T0, 1), 10)
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, first_period.id);
    assert_eq!(t.billing.credits.balance(user).await.unwrap(), 0);

    // The next sweep finishes billing without touching the credits again
    assert_eq!(t.billing.usage.close_stale_periods(100).await.unwrap(), 1);
    let payment = t
        .store
        .find_payment_by_provider_id(&overage_payment_id(first_period.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.amount, 20);
    assert_eq!(payment.status, PaymentStatus::Pending);

    let debits = t
        .billing
        .credits
        .history(user, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|txn| txn.amount < 0)
        .count();
    assert_eq!(debits, 1);
    assert_eq!(event_count(&t, user, "OVERAGE_RECORDED").await, 1);
    assert!(t
        .store
        .stale_usage_periods(add_months(T0, 1), 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_plan_without_overage_records_but_never_bills() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.starter).await;

    t.billing
        .usage
        .record_usage(user, Action::SendMessage, 1_200)
        .await
        .unwrap();
    let sub = t.billing.subscriptions.current(user).await.unwrap().unwrap();
    let first_period = t.store.current_usage(sub.id).await.unwrap().unwrap();

    t.clock.set(add_months(T0, 1));
    assert_eq!(t.billing.usage.close_stale_periods(100).await.unwrap(), 1);

    assert!(t
        .store
        .find_payment_by_provider_id(&overage_payment_id(first_period.id))
        .await
        .unwrap()
        .is_none());
    let current = t.store.current_usage(sub.id).await.unwrap().unwrap();
    assert_eq!(current.period_start, add_months(T0, 1));
    assert_eq!(current.messages_sent, 0);
}

#[tokio::test]
async fn test_stale_period_sweep_is_idempotent() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.business).await;
    t.billing
        .usage
        .record_usage(user, Action::SendMessage, 110)
        .await
        .unwrap();

    t.clock.set(add_months(T0, 1));
    assert_eq!(t.billing.usage.close_stale_periods(100).await.unwrap(), 1);
    assert_eq!(t.billing.usage.close_stale_periods(100).await.unwrap(), 0);

    let overage_payments = t
        .billing
        .payments
        .list_payments(user, 10)
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.kind == PaymentKind::Overage)
        .count();
    assert_eq!(overage_payments, 1);
}
