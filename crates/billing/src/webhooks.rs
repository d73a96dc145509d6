//! PayHere notification handling
//!
//! The gateway delivers at least once and retries anything but a 200, so
//! [`WebhookReconciler::handle`] never fails: every outcome, including a
//! rejected signature or an internal error, is acknowledged.
//!
//! Exactly-once effects come from two guards. Payments are unique by
//! `provider_payment_id`, and each status change is conditional on the
//! status that was read. Only the caller that wins the transition applies
//! the lifecycle change and takes an invoice number. A success whose effect
//! cannot be applied is released back to its previous status, so the same
//! notification applies when delivered again.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;
use whatsflow_shared::{
    Clock, CreditTransactionType, Payment, PaymentKind, PaymentStatus, SubscriptionStatus,
};

use crate::config::BillingConfig;
use crate::credits::CreditLedger;
use crate::error::BillingResult;
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::payhere::{verify_notification, GatewayStatus, PayHereNotification};
use crate::payments::PaymentService;
use crate::store::LedgerStore;
use crate::subscriptions::SubscriptionManager;

/// What a notification did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    /// Already processed; nothing changed
    Duplicate,
    /// Failed verification or consistency checks
    Rejected(String),
    /// Valid but not actionable
    Ignored(String),
}

pub struct WebhookReconciler {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<BillingConfig>,
    subscriptions: Arc<SubscriptionManager>,
    payments: Arc<PaymentService>,
    credits: Arc<CreditLedger>,
    events: BillingEventLogger,
}

impl WebhookReconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: Arc<BillingConfig>,
        subscriptions: Arc<SubscriptionManager>,
        payments: Arc<PaymentService>,
        credits: Arc<CreditLedger>,
    ) -> Self {
        let events = BillingEventLogger::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            config,
            subscriptions,
            payments,
            credits,
            events,
        }
    }

    /// Process one notification. Infallible by contract; errors are logged.
    pub async fn handle(&self, notification: &PayHereNotification) -> WebhookOutcome {
        match self.process(notification).await {
            Ok(outcome) => {
                tracing::info!(
                    order_id = %notification.order_id,
                    payment_id = ?notification.payment_id,
                    status = %notification.status(),
                    outcome = ?outcome,
                    "PayHere notification processed"
                );
                outcome
            }
            Err(e) => {
                tracing::error!(
                    order_id = %notification.order_id,
                    payment_id = ?notification.payment_id,
                    error = %e,
                    "PayHere notification processing failed"
                );
                WebhookOutcome::Ignored("processing error".to_string())
            }
        }
    }

    async fn process(&self, n: &PayHereNotification) -> BillingResult<WebhookOutcome> {
        let Some(payhere) = self.config.payhere.as_ref() else {
            tracing::error!(order_id = %n.order_id, "Notification received but PayHere is not configured");
            return Ok(WebhookOutcome::Rejected("gateway not configured".to_string()));
        };

        if n.merchant_id != payhere.merchant_id {
            return Ok(self.reject(n, "merchant id mismatch").await);
        }
        if !verify_notification(n, &payhere.merchant_secret) {
            return Ok(self.reject(n, "invalid signature").await);
        }
        let Some(amount) = n.amount_minor() else {
            return Ok(self.reject(n, "invalid amount").await);
        };

        let Some(payment) = self.locate_payment(n, amount).await? else {
            tracing::warn!(order_id = %n.order_id, "Notification for unknown order");
            return Ok(WebhookOutcome::Ignored("unknown order".to_string()));
        };

        if payment.status.is_terminal() {
            return Ok(WebhookOutcome::Duplicate);
        }
        if payment.amount != amount || !payment.currency.eq_ignore_ascii_case(&n.payhere_currency) {
            tracing::error!(
                order_id = %n.order_id,
                expected_amount = payment.amount,
                notified_amount = amount,
                expected_currency = %payment.currency,
                notified_currency = %n.payhere_currency,
                "Notification amount does not match payment"
            );
            self.record_rejection(payment.user_id, n, "amount mismatch").await;
            return Ok(WebhookOutcome::Rejected("amount mismatch".to_string()));
        }

        match n.status() {
            GatewayStatus::Succeeded => self.apply_success(payment, n).await,
            GatewayStatus::Failed | GatewayStatus::Chargedback => {
                self.apply_failure(payment, n).await
            }
            GatewayStatus::Canceled => self.apply_cancel(payment, n).await,
            GatewayStatus::Pending => {
                if payment.provider_reference.is_none() && n.payment_id.is_some() {
                    let mut updated = payment.clone();
                    updated.provider_reference = n.payment_id.clone();
                    self.store
                        .update_payment(&updated, &[PaymentStatus::Pending])
                        .await?;
                }
                Ok(WebhookOutcome::Ignored("payment pending".to_string()))
            }
        }
    }

    /// Payment row this notification settles. Recurring installments reuse
    /// the checkout's order id and get their own row, cloned from the checkout payment.
    async fn locate_payment(
        &self,
        n: &PayHereNotification,
        amount: i64,
    ) -> BillingResult<Option<Payment>> {
        let key = n.idempotency_key();
        if let Some(payment) = self.store.find_payment_by_provider_id(&key).await? {
            return Ok(Some(payment));
        }
        if key == n.order_id {
            return Ok(None);
        }

        let Some(base) = self.store.find_payment_by_provider_id(&n.order_id).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        let installment = Payment {
            id: Uuid::new_v4(),
            amount,
            currency: n.payhere_currency.clone(),
            status: PaymentStatus::Pending,
            provider_payment_id: key.clone(),
            provider_reference: n.payment_id.clone(),
            invoice_number: None,
            invoice_url: None,
            failure_reason: None,
            refund_reason: None,
            attempted_at: now,
            paid_at: None,
            refunded_at: None,
            created_at: now,
            ..base
        };
        if !self.store.insert_payment(&installment).await? {
            // A concurrent delivery inserted it first
            return self.store.find_payment_by_provider_id(&key).await;
        }
        Ok(Some(installment))
    }

    async fn apply_success(
        &self,
        payment: Payment,
        n: &PayHereNotification,
    ) -> BillingResult<WebhookOutcome> {
        let now = self.clock.now();
        let mut paid = payment.clone();
        paid.status = PaymentStatus::Succeeded;
        paid.paid_at = Some(now);
        paid.failure_reason = None;
        paid.provider_reference = n.payment_id.clone().or(paid.provider_reference);

        if !self
            .store
            .update_payment(&paid, &[PaymentStatus::Pending, PaymentStatus::Failed])
            .await?
        {
            return Ok(WebhookOutcome::Duplicate);
        }

        if let Err(e) = self.grant_payment(&mut paid, n).await {
            // Nothing was granted; put the row back so the next delivery applies it
            if let Err(release) = self
                .store
                .update_payment(&payment, &[PaymentStatus::Succeeded])
                .await
            {
                tracing::error!(
                    payment_id = %payment.id,
                    error = %release,
                    "Failed to release payment after processing error"
                );
            }
            return Err(e);
        }

        match self.payments.next_invoice_number().await {
            Ok(invoice_number) => {
                paid.invoice_number = Some(invoice_number);
                if let Err(e) = self
                    .store
                    .update_payment(&paid, &[PaymentStatus::Succeeded])
                    .await
                {
                    tracing::error!(payment_id = %paid.id, error = %e, "Failed to save invoice number");
                }
            }
            Err(e) => {
                tracing::error!(payment_id = %paid.id, error = %e, "Failed to allocate invoice number");
            }
        }

        tracing::info!(
            user_id = %paid.user_id,
            order_id = %n.order_id,
            amount = paid.amount,
            invoice_number = ?paid.invoice_number,
            "Payment succeeded"
        );
        self.events
            .record(
                BillingEventBuilder::new(paid.user_id, BillingEventType::PaymentSucceeded)
                    .order(paid.provider_payment_id.clone())
                    .actor_type(ActorType::Gateway)
                    .data(serde_json::json!({
                        "payment_id": paid.id,
                        "kind": paid.kind,
                        "amount": paid.amount,
                        "currency": paid.currency,
                        "invoice_number": paid.invoice_number,
                        "method": n.method,
                    })),
            )
            .await;

        Ok(WebhookOutcome::Applied)
    }

    /// Apply what the payment buys. On error nothing has been granted.
    async fn grant_payment(&self, paid: &mut Payment, n: &PayHereNotification) -> BillingResult<()> {
        match paid.kind {
            PaymentKind::Subscription => {
                let sub = self
                    .subscriptions
                    .apply_payment_success(paid, n.subscription_id.as_deref())
                    .await?;
                paid.subscription_id = Some(sub.id);
            }
            PaymentKind::OneTime => {
                self.credits
                    .add_credits(
                        paid.user_id,
                        paid.amount,
                        CreditTransactionType::Adjustment,
                        "Credit top-up",
                        Some(paid.id),
                    )
                    .await?;
            }
            PaymentKind::Overage => {}
        }
        Ok(())
    }

    async fn apply_failure(
        &self,
        payment: Payment,
        n: &PayHereNotification,
    ) -> BillingResult<WebhookOutcome> {
        if payment.status == PaymentStatus::Failed {
            return Ok(WebhookOutcome::Duplicate);
        }

        let status = n.status();
        let mut failed = payment.clone();
        failed.status = PaymentStatus::Failed;
        failed.failure_reason = Some(
            n.status_message
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| status.message().to_string()),
        );
        failed.provider_reference = n.payment_id.clone().or(failed.provider_reference);

        if !self
            .store
            .update_payment(&failed, &[PaymentStatus::Pending])
            .await?
        {
            return Ok(WebhookOutcome::Duplicate);
        }

        let mut retry_at = None;
        if failed.kind == PaymentKind::Subscription {
            if let Some(sub) = self.subscriptions.apply_payment_failure(&failed).await? {
                if sub.status == SubscriptionStatus::PastDue {
                    retry_at = self
                        .payments
                        .schedule_retry(sub.id, &failed)
                        .await?
                        .map(|r| r.next_retry_at);
                }
            }
        }

        tracing::warn!(
            user_id = %failed.user_id,
            order_id = %n.order_id,
            status = %status,
            reason = ?failed.failure_reason,
            "Payment failed"
        );
        self.events
            .record(
                BillingEventBuilder::new(failed.user_id, BillingEventType::PaymentFailed)
                    .order(failed.provider_payment_id.clone())
                    .actor_type(ActorType::Gateway)
                    .data(serde_json::json!({
                        "payment_id": failed.id,
                        "status": status,
                        "reason": failed.failure_reason,
                        "next_retry_at": retry_at,
                    })),
            )
            .await;

        Ok(WebhookOutcome::Applied)
    }

    /// The customer abandoned the checkout; no lifecycle effect
    async fn apply_cancel(
        &self,
        payment: Payment,
        n: &PayHereNotification,
    ) -> BillingResult<WebhookOutcome> {
        if payment.status == PaymentStatus::Failed {
            return Ok(WebhookOutcome::Duplicate);
        }
        let mut canceled = payment.clone();
        canceled.status = PaymentStatus::Failed;
        canceled.failure_reason = Some(GatewayStatus::Canceled.message().to_string());
        canceled.provider_reference = n.payment_id.clone().or(canceled.provider_reference);

        if !self
            .store
            .update_payment(&canceled, &[PaymentStatus::Pending])
            .await?
        {
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(user_id = %canceled.user_id, order_id = %n.order_id, "Payment canceled by customer");
        Ok(WebhookOutcome::Applied)
    }

    async fn reject(&self, n: &PayHereNotification, reason: &str) -> WebhookOutcome {
        tracing::error!(
            order_id = %n.order_id,
            merchant_id = %n.merchant_id,
            reason = %reason,
            "PayHere notification rejected"
        );

        let user_id = match n.custom_1.as_deref().and_then(|s| Uuid::parse_str(s).ok()) {
            Some(id) => Some(id),
            None => self
                .store
                .find_payment_by_provider_id(&n.order_id)
                .await
                .ok()
                .flatten()
                .map(|p| p.user_id),
        };
        if let Some(user_id) = user_id {
            self.record_rejection(user_id, n, reason).await;
        }

        WebhookOutcome::Rejected(reason.to_string())
    }

    async fn record_rejection(&self, user_id: Uuid, n: &PayHereNotification, reason: &str) {
        self.events
            .record(
                BillingEventBuilder::new(user_id, BillingEventType::WebhookRejected)
                    .order(n.order_id.clone())
                    .actor_type(ActorType::Gateway)
                    .data(serde_json::json!({
                        "reason": reason,
                        "status_code": n.status_code,
                        "amount": n.payhere_amount,
                        "currency": n.payhere_currency,
                    })),
            )
            .await;
    }
}
