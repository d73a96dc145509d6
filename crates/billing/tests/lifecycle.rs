//! Subscription lifecycle scenarios against the in-memory ledger
//!
//! ## Running Tests
//! ```bash
//! cargo test -p whatsflow-billing --test lifecycle
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

mod common;

use common::*;
use time::Duration;
use uuid::Uuid;
use whatsflow_billing::{BillingError, ErrorKind, Reactivation, WebhookOutcome};
use whatsflow_shared::{add_months, Action, SubscriptionStatus};

// ============================================================================
// Trial
// ============================================================================

#[tokio::test]
async fn test_trial_expires_after_seven_days() {
    let t = setup().await;
    let user = Uuid::new_v4();

    let sub = t.billing.subscriptions.start_trial(user).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Trial);
    assert_eq!(sub.plan_id, t.trial.id);
    assert_eq!(sub.trial_ends_at, Some(T0 + Duration::days(7)));

    let summary = t.billing.usage.usage_summary(user).await.unwrap();
    assert_eq!(summary.trial_days_remaining, Some(7));

    t.clock.set(T0 + Duration::days(8));
    let decision = t
        .billing
        .usage
        .can_perform_action(user, Action::SendMessage)
        .await;
    assert!(!decision.allowed);
    assert!(decision.needs_upgrade);

    let sub = t.billing.subscriptions.current(user).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Expired);
    assert_eq!(event_count(&t, user, "SUBSCRIPTION_EXPIRED").await, 1);
}

#[tokio::test]
async fn test_trial_only_once_per_user() {
    let t = setup().await;
    let user = Uuid::new_v4();

    t.billing.subscriptions.start_trial(user).await.unwrap();
    let err = t.billing.subscriptions.start_trial(user).await.unwrap_err();
    assert!(matches!(err, BillingError::TrialAlreadyUsed));

    t.clock.set(T0 + Duration::days(10));
    t.billing.subscriptions.reconcile_due().await.unwrap();
    let err = t.billing.subscriptions.start_trial(user).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);
}

#[tokio::test]
async fn test_paying_during_trial_starts_period_now() {
    let t = setup().await;
    let user = Uuid::new_v4();
    t.billing.subscriptions.start_trial(user).await.unwrap();

    t.clock.set(T0 + Duration::days(3));
    subscribe(&t, user, &t.starter).await;

    let sub = t.billing.subscriptions.current(user).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.plan_id, t.starter.id);
    assert_eq!(sub.current_period_start, T0 + Duration::days(3));
    assert_eq!(sub.current_period_end, add_months(T0 + Duration::days(3), 1));
    assert_eq!(sub.current_price, t.starter.price_monthly);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_at_period_end_keeps_access_until_then() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.starter).await;

    t.clock.set(T0 + Duration::days(10));
    let sub = t.billing.subscriptions.cancel(user, false).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(sub.cancel_at_period_end);

    // Second request is a no-op
    let again = t.billing.subscriptions.cancel(user, false).await.unwrap();
    assert!(again.cancel_at_period_end);
    assert_eq!(event_count(&t, user, "CANCELLATION_SCHEDULED").await, 1);

    t.clock.set(add_months(T0, 1) - Duration::seconds(1));
    assert!(
        t.billing
            .usage
            .can_perform_action(user, Action::SendMessage)
            .await
            .allowed
    );

    t.clock.set(add_months(T0, 1));
    let report = t.billing.subscriptions.reconcile_due().await.unwrap();
    assert_eq!(report.canceled, 1);

    let sub = t.billing.subscriptions.current(user).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Canceled);
    assert!(sub.canceled_at.is_some());
    assert!(
        !t.billing
            .usage
            .can_perform_action(user, Action::SendMessage)
            .await
            .allowed
    );
}

#[tokio::test]
async fn test_immediate_cancel_revokes_access() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.starter).await;

    let sub = t.billing.subscriptions.cancel(user, true).await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Canceled);

    let decision = t
        .billing
        .usage
        .can_perform_action(user, Action::SendMessage)
        .await;
    assert!(!decision.allowed);
    assert!(decision.reason.unwrap().contains("canceled"));
}

#[tokio::test]
async fn test_reactivate_undoes_pending_cancel() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.starter).await;

    t.billing.subscriptions.cancel(user, false).await.unwrap();
    let outcome = t
        .billing
        .subscriptions
        .reactivate(user, &customer())
        .await
        .unwrap();
    let Reactivation::Resumed(sub) = outcome else {
        panic!("expected resumed, got {:?}", outcome);
    };
    assert!(!sub.cancel_at_period_end);
    assert_eq!(sub.status, SubscriptionStatus::Active);

    t.clock.set(add_months(T0, 1));
    t.billing.subscriptions.reconcile_due().await.unwrap();
    let sub = t.billing.subscriptions.current(user).await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_reactivate_after_cancel_opens_new_lifecycle() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.starter).await;
    let first = t.billing.subscriptions.cancel(user, true).await.unwrap();

    t.clock.set(T0 + Duration::days(40));
    let outcome = t
        .billing
        .subscriptions
        .reactivate(user, &customer())
        .await
        .unwrap();
    let Reactivation::Checkout(checkout) = outcome else {
        panic!("expected a checkout, got {:?}", outcome);
    };

    let outcome = t
        .billing
        .webhooks
        .handle(&signed(&checkout.order_id, t.starter.price_monthly, "2"))
        .await;
    assert_eq!(outcome, WebhookOutcome::Applied);

    let sub = t.billing.subscriptions.current(user).await.unwrap().unwrap();
    assert_ne!(sub.id, first.id, "a fresh lifecycle is a new row");
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.current_period_start, T0 + Duration::days(40));
}

// ============================================================================
// Plan changes and admin overrides
// ============================================================================

#[tokio::test]
async fn test_upgrade_binds_new_plan_on_payment() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.starter).await;

    let order_id = checkout(&t, user, &t.business).await;
    // Until the gateway confirms, the old plan applies
    assert!(
        !t.billing
            .usage
            .can_perform_action(user, Action::SendBroadcast)
            .await
            .allowed
    );

    t.billing
        .webhooks
        .handle(&signed(&order_id, t.business.price_monthly, "2"))
        .await;
    let sub = t.billing.subscriptions.current(user).await.unwrap().unwrap();
    assert_eq!(sub.plan_id, t.business.id);
    assert!(
        t.billing
            .usage
            .can_perform_action(user, Action::SendBroadcast)
            .await
            .allowed
    );
}

#[tokio::test]
async fn test_same_plan_checkout_rejected_while_active() {
    let t = setup().await;
    let user = Uuid::new_v4();
    subscribe(&t, user, &t.starter).await;

    let err = t
        .billing
        .checkout
        .create_subscription_checkout(
            user,
            t.starter.id,
            whatsflow_shared::BillingCycle::Monthly,
            &customer(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::SubscriptionAlreadyExists));
}

#[tokio::test]
async fn test_pause_and_resume() {
    let t = setup().await;
    let user = Uuid::new_v4();
    let admin = Uuid::new_v4();
    subscribe(&t, user, &t.starter).await;

    let paused = t
        .billing
        .subscriptions
        .pause(user, Some(admin))
        .await
        .unwrap();
    assert_eq!(paused.status, SubscriptionStatus::Paused);
    let decision = t
        .billing
        .usage
        .can_perform_action(user, Action::SendMessage)
        .await;
    assert!(!decision.allowed);
    assert!(decision.reason.unwrap().contains("paused"));

    let resumed = t.billing.subscriptions.resume(user).await.unwrap();
    assert_eq!(resumed.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_free_status_round_trip() {
    let t = setup().await;
    let user = Uuid::new_v4();
    let admin = Uuid::new_v4();

    let sub = t
        .billing
        .subscriptions
        .make_account_free(user, "NGO programme", admin)
        .await
        .unwrap();
    assert!(sub.is_free);
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(
        t.billing
            .usage
            .can_perform_action(user, Action::ScrapePage)
            .await
            .allowed
    );

    let sub = t
        .billing
        .subscriptions
        .remove_free_status(user, admin)
        .await
        .unwrap();
    assert!(!sub.is_free);
    assert!(
        !t.billing
            .usage
            .can_perform_action(user, Action::ScrapePage)
            .await
            .allowed
    );
    assert_eq!(event_count(&t, user, "ADMIN_OVERRIDE").await, 2);
}
