//! Payment records, invoices, refunds and the retry schedule

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use whatsflow_shared::{
    Clock, CreditTransactionType, Payment, PaymentRetry, PaymentStatus, RetryStatus,
    SubscriptionStatus,
};

use crate::config::BillingConfig;
use crate::credits::CreditLedger;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::gateway::PaymentGateway;
use crate::store::LedgerStore;

/// Retries handled per worker run
const RETRY_BATCH_SIZE: i64 = 100;

/// Invoice number: prefix, the last eight digits of the epoch millis, then a sequence suffix
pub fn format_invoice_number(prefix: &str, now: OffsetDateTime, sequence: i64) -> String {
    let millis = (now.unix_timestamp_nanos() / 1_000_000).rem_euclid(100_000_000);
    format!("{}-{:08}-{:03}", prefix, millis, sequence.rem_euclid(1000))
}

/// Counts from a retry run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub attempted: usize,
    /// Subscription already recovered, nothing to retry
    pub resolved: usize,
    pub failed: usize,
}

pub struct PaymentService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<BillingConfig>,
    credits: Arc<CreditLedger>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    events: BillingEventLogger,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: Arc<BillingConfig>,
        credits: Arc<CreditLedger>,
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> Self {
        let events = BillingEventLogger::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            config,
            credits,
            gateway,
            events,
        }
    }

    pub async fn list_payments(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<Payment>> {
        self.store.list_payments(user_id, limit).await
    }

    pub async fn get_payment(&self, user_id: Uuid, payment_id: Uuid) -> BillingResult<Payment> {
        self.store
            .get_payment(payment_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_id)))
    }

    pub async fn next_invoice_number(&self) -> BillingResult<String> {
        let sequence = self.store.next_invoice_sequence().await?;
        Ok(format_invoice_number(
            &self.config.invoice_prefix,
            self.clock.now(),
            sequence,
        ))
    }

    /// Refund a succeeded payment, optionally returning the amount as credits
    pub async fn refund_payment(
        &self,
        payment_id: Uuid,
        reason: &str,
        issue_credit: bool,
        admin_id: Uuid,
    ) -> BillingResult<Payment> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_id)))?;

        if payment.status != PaymentStatus::Succeeded {
            return Err(BillingError::RefundNotAllowed(payment.status));
        }

        let now = self.clock.now();
        let mut refunded = payment.clone();
        refunded.status = PaymentStatus::Refunded;
        refunded.refund_reason = Some(reason.to_string());
        refunded.refunded_at = Some(now);

        if !self
            .store
            .update_payment(&refunded, &[PaymentStatus::Succeeded])
            .await?
        {
            // Refunded by someone else in the meantime
            let current = self
                .store
                .get_payment(payment_id)
                .await?
                .map(|p| p.status)
                .unwrap_or(PaymentStatus::Refunded);
            return Err(BillingError::RefundNotAllowed(current));
        }

        if issue_credit {
            self.credits
                .add_credits(
                    payment.user_id,
                    payment.amount,
                    CreditTransactionType::Refund,
                    &format!("Refund of {}", payment.provider_payment_id),
                    Some(payment.id),
                )
                .await?;
        }

        tracing::info!(
            user_id = %payment.user_id,
            payment_id = %payment.id,
            amount = payment.amount,
            issue_credit = issue_credit,
            reason = %reason,
            "Payment refunded"
        );
        self.events
            .record(
                BillingEventBuilder::new(payment.user_id, BillingEventType::PaymentRefunded)
                    .order(payment.provider_payment_id.clone())
                    .actor(admin_id, ActorType::Admin)
                    .data(serde_json::json!({
                        "payment_id": payment.id,
                        "amount": payment.amount,
                        "reason": reason,
                        "credited": issue_credit,
                    })),
            )
            .await;

        Ok(refunded)
    }

    /// Schedule the next retry for a failed subscription payment.
    /// Returns `None` once the retry schedule is exhausted.
    pub async fn schedule_retry(
        &self,
        subscription_id: Uuid,
        payment: &Payment,
    ) -> BillingResult<Option<PaymentRetry>> {
        let open = self.store.count_open_retries(subscription_id).await?;
        let attempt = open as usize + 1;
        let Some(offset_days) = self.config.retry_schedule_days.get(attempt - 1).copied() else {
            tracing::info!(
                subscription_id = %subscription_id,
                payment_id = %payment.id,
                attempts = open,
                "Retry schedule exhausted"
            );
            return Ok(None);
        };

        let now = self.clock.now();
        let retry = PaymentRetry {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            subscription_id,
            attempt_number: attempt as i32,
            status: RetryStatus::Pending,
            next_retry_at: now + Duration::days(offset_days),
            attempted_at: None,
            created_at: now,
        };

        match self.store.insert_retry(&retry).await {
            Ok(()) => {}
            Err(BillingError::Duplicate(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        tracing::info!(
            subscription_id = %subscription_id,
            payment_id = %payment.id,
            attempt = attempt,
            next_retry_at = %retry.next_retry_at,
            "Payment retry scheduled"
        );
        self.events
            .record(
                BillingEventBuilder::new(payment.user_id, BillingEventType::PaymentRetryScheduled)
                    .order(payment.provider_payment_id.clone())
                    .data(serde_json::json!({
                        "subscription_id": subscription_id,
                        "attempt": attempt,
                        "next_retry_at": retry.next_retry_at,
                    })),
            )
            .await;

        Ok(Some(retry))
    }

    /// Ask the gateway to charge each due retry again.
    ///
    /// The charge outcome arrives as a notification; a failure schedules the
    /// next attempt from there. When the gateway call itself fails the next
    /// attempt is scheduled here.
    pub async fn process_due_retries(&self) -> BillingResult<RetryReport> {
        let now = self.clock.now();
        let mut report = RetryReport::default();

        for retry in self.store.due_retries(now, RETRY_BATCH_SIZE).await? {
            let sub = self.store.get_subscription(retry.subscription_id).await?;
            let Some(sub) = sub.filter(|s| s.status == SubscriptionStatus::PastDue) else {
                self.store
                    .mark_retry(retry.id, RetryStatus::Succeeded, now)
                    .await?;
                report.resolved += 1;
                continue;
            };

            let outcome = match (&self.gateway, &sub.provider_subscription_id) {
                (Some(gateway), Some(provider_id)) => gateway.retry_payment(provider_id).await,
                _ => Err(BillingError::Config(
                    "no gateway subscription to retry".to_string(),
                )),
            };

            match outcome {
                Ok(()) => {
                    self.store
                        .mark_retry(retry.id, RetryStatus::Attempted, now)
                        .await?;
                    report.attempted += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %sub.user_id,
                        subscription_id = %sub.id,
                        attempt = retry.attempt_number,
                        error = %e,
                        "Payment retry failed"
                    );
                    self.store
                        .mark_retry(retry.id, RetryStatus::Failed, now)
                        .await?;
                    report.failed += 1;

                    if let Some(payment) = self.store.get_payment(retry.payment_id).await? {
                        self.schedule_retry(sub.id, &payment).await?;
                    }
                }
            }
        }

        if report != RetryReport::default() {
            tracing::info!(
                attempted = report.attempted,
                resolved = report.resolved,
                failed = report.failed,
                "Payment retries processed"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedger;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;
    use whatsflow_shared::{BillingCycle, ManualClock, PaymentKind, Subscription};

    const T0: OffsetDateTime = datetime!(2024-07-01 00:00 UTC);

    #[derive(Default)]
    struct CountingGateway {
        retries: AtomicUsize,
    }

    #[async_trait]
    impl PaymentGateway for CountingGateway {
        async fn retry_payment(&self, _: &str) -> BillingResult<()> {
            self.retries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cancel_subscription(&self, _: &str) -> BillingResult<()> {
            Ok(())
        }
    }

    fn service(
        store: Arc<MemoryLedger>,
        clock: Arc<ManualClock>,
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> PaymentService {
        let credits = Arc::new(CreditLedger::new(store.clone(), clock.clone()));
        PaymentService::new(
            store,
            clock,
            Arc::new(BillingConfig::default()),
            credits,
            gateway,
        )
    }

    fn payment(user_id: Uuid, status: PaymentStatus) -> Payment {
        Payment {
            id: Uuid::new_v4(),
            user_id,
            subscription_id: None,
            plan_id: None,
            billing_cycle: Some(BillingCycle::Monthly),
            kind: PaymentKind::Subscription,
            amount: 290_000,
            currency: "LKR".into(),
            status,
            provider_payment_id: format!("SUB-{}", Uuid::new_v4().simple()),
            provider_reference: None,
            description: None,
            invoice_number: None,
            invoice_url: None,
            failure_reason: None,
            refund_reason: None,
            attempted_at: T0,
            paid_at: None,
            refunded_at: None,
            created_at: T0,
        }
    }

    fn past_due(user_id: Uuid) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_id,
            plan_id: Uuid::new_v4(),
            status: SubscriptionStatus::PastDue,
            resume_status: None,
            billing_cycle: BillingCycle::Monthly,
            current_price: 290_000,
            currency: "LKR".into(),
            current_period_start: T0,
            current_period_end: T0,
            trial_ends_at: None,
            next_billing_date: None,
            cancel_at_period_end: false,
            canceled_at: None,
            past_due_since: Some(T0),
            grace_ends_at: Some(T0 + Duration::days(10)),
            is_free: false,
            free_reason: None,
            provider_order_id: None,
            provider_subscription_id: Some("420075032251".into()),
            created_at: T0,
            updated_at: T0,
        }
    }

    #[test]
    fn test_invoice_number_format() {
        let number = format_invoice_number("INV", datetime!(2024-07-01 00:00 UTC), 1042);
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts[0], "INV");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2], "042");
    }

    #[tokio::test]
    async fn test_refund_only_from_succeeded() {
        let store = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(T0));
        let payments = service(store.clone(), clock, None);
        let user = Uuid::new_v4();

        let pending = payment(user, PaymentStatus::Pending);
        store.insert_payment(&pending).await.unwrap();
        let err = payments
            .refund_payment(pending.id, "duplicate", false, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::RefundNotAllowed(PaymentStatus::Pending)));
    }

    #[tokio::test]
    async fn test_refund_issues_credit() {
        let store = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(T0));
        let payments = service(store.clone(), clock, None);
        let user = Uuid::new_v4();

        let paid = payment(user, PaymentStatus::Succeeded);
        store.insert_payment(&paid).await.unwrap();
        let refunded = payments
            .refund_payment(paid.id, "service outage", true, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
        assert_eq!(store.credit_balance(user).await.unwrap(), 290_000);

        // A second refund is refused
        assert!(payments
            .refund_payment(paid.id, "again", true, Uuid::new_v4())
            .await
            .is_err());
        assert_eq!(store.credit_balance(user).await.unwrap(), 290_000);
    }

    #[tokio::test]
    async fn test_retry_schedule_follows_offsets() {
        let store = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(T0));
        let payments = service(store.clone(), clock, None);
        let user = Uuid::new_v4();
        let sub = past_due(user);
        store.insert_subscription(&sub).await.unwrap();

        let mut offsets = Vec::new();
        for _ in 0..4 {
            let failed = payment(user, PaymentStatus::Failed);
            store.insert_payment(&failed).await.unwrap();
            if let Some(retry) = payments.schedule_retry(sub.id, &failed).await.unwrap() {
                offsets.push((retry.next_retry_at - T0).whole_days());
            }
        }
        assert_eq!(offsets, vec![1, 3, 7]);
    }

    #[tokio::test]
    async fn test_due_retries_call_gateway() {
        let store = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(T0));
        let gateway = Arc::new(CountingGateway::default());
        let payments = service(store.clone(), clock.clone(), Some(gateway.clone()));
        let user = Uuid::new_v4();
        let sub = past_due(user);
        store.insert_subscription(&sub).await.unwrap();
        let failed = payment(user, PaymentStatus::Failed);
        store.insert_payment(&failed).await.unwrap();
        payments.schedule_retry(sub.id, &failed).await.unwrap();

        assert_eq!(payments.process_due_retries().await.unwrap().attempted, 0);

        clock.advance(Duration::days(1));
        let report = payments.process_due_retries().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(gateway.retries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovered_subscription_resolves_retry() {
        let store = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(T0));
        let gateway = Arc::new(CountingGateway::default());
        let payments = service(store.clone(), clock.clone(), Some(gateway.clone()));
        let user = Uuid::new_v4();
        let sub = past_due(user);
        store.insert_subscription(&sub).await.unwrap();
        let failed = payment(user, PaymentStatus::Failed);
        store.insert_payment(&failed).await.unwrap();
        payments.schedule_retry(sub.id, &failed).await.unwrap();

        let mut recovered = sub.clone();
        recovered.status = SubscriptionStatus::Active;
        store
            .update_subscription(&recovered, SubscriptionStatus::PastDue)
            .await
            .unwrap();

        clock.advance(Duration::days(2));
        let report = payments.process_due_retries().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(gateway.retries.load(Ordering::SeqCst), 0);
    }
}
