//! Billing Events Module
//!
//! Append-only billing event log for audit trails and debugging.
//! Events answer "why is this tenant in this state?" questions:
//!
//! - Subscription lifecycle: trial started, activated, canceled, expired, paused
//! - Payments: succeeded, failed, retry scheduled, refunded, rejected notifications
//! - Usage: overage recorded, credits applied, usage warnings
//! - Admin actions: free overrides, plan changes

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;
use whatsflow_shared::Clock;

use crate::error::BillingResult;
use crate::store::LedgerStore;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Subscription lifecycle
    TrialStarted,
    SubscriptionActivated,
    SubscriptionRenewed,
    CancellationScheduled,
    SubscriptionCanceled,
    SubscriptionReactivated,
    SubscriptionExpired,
    SubscriptionPaused,
    SubscriptionResumed,

    // Payments
    CheckoutCreated,
    PaymentSucceeded,
    PaymentFailed,
    PaymentRetryScheduled,
    PaymentRefunded,
    WebhookRejected,

    // Usage and credits
    OverageRecorded,
    CreditApplied,
    CreditsAdded,
    UsageWarning,

    // Admin actions
    AdminOverride,
    PlanCreated,
    PlanUpdated,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::TrialStarted => "TRIAL_STARTED",
            BillingEventType::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            BillingEventType::SubscriptionRenewed => "SUBSCRIPTION_RENEWED",
            BillingEventType::CancellationScheduled => "CANCELLATION_SCHEDULED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::SubscriptionReactivated => "SUBSCRIPTION_REACTIVATED",
            BillingEventType::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            BillingEventType::SubscriptionPaused => "SUBSCRIPTION_PAUSED",
            BillingEventType::SubscriptionResumed => "SUBSCRIPTION_RESUMED",
            BillingEventType::CheckoutCreated => "CHECKOUT_CREATED",
            BillingEventType::PaymentSucceeded => "PAYMENT_SUCCEEDED",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::PaymentRetryScheduled => "PAYMENT_RETRY_SCHEDULED",
            BillingEventType::PaymentRefunded => "PAYMENT_REFUNDED",
            BillingEventType::WebhookRejected => "WEBHOOK_REJECTED",
            BillingEventType::OverageRecorded => "OVERAGE_RECORDED",
            BillingEventType::CreditApplied => "CREDIT_APPLIED",
            BillingEventType::CreditsAdded => "CREDITS_ADDED",
            BillingEventType::UsageWarning => "USAGE_WARNING",
            BillingEventType::AdminOverride => "ADMIN_OVERRIDE",
            BillingEventType::PlanCreated => "PLAN_CREATED",
            BillingEventType::PlanUpdated => "PLAN_UPDATED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the API
    User,
    /// Admin user
    Admin,
    /// Scheduled jobs and lazy reconciliation
    System,
    /// Payment gateway notification
    Gateway,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
            ActorType::Gateway => write!(f, "gateway"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub provider_order_id: Option<String>,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    user_id: Uuid,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    provider_order_id: Option<String>,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            event_data: serde_json::json!({}),
            provider_order_id: None,
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn order(mut self, order_id: impl Into<String>) -> Self {
        self.provider_order_id = Some(order_id.into());
        self
    }

    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    fn build(self, now: OffsetDateTime) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            event_type: self.event_type.to_string(),
            event_data: self.event_data,
            provider_order_id: self.provider_order_id,
            actor_id: self.actor_id,
            actor_type: self.actor_type.to_string(),
            created_at: now,
        }
    }
}

/// Service for logging and querying billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Log a billing event
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event = builder.build(self.clock.now());
        self.store.insert_billing_event(&event).await?;
        Ok(event.id)
    }

    /// Log a billing event, swallowing failures. The audit log never blocks a billing operation.
    pub async fn record(&self, builder: BillingEventBuilder) {
        let event_type = builder.event_type;
        let user_id = builder.user_id;
        if let Err(e) = self.log_event(builder).await {
            tracing::warn!(
                user_id = %user_id,
                event_type = %event_type,
                error = %e,
                "Failed to write billing event"
            );
        }
    }

    /// Most recent events for a user
    pub async fn get_events(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<BillingEvent>> {
        self.store.list_billing_events(user_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedger;
    use time::macros::datetime;
    use whatsflow_shared::ManualClock;

    #[test]
    fn test_event_type_display() {
        assert_eq!(BillingEventType::TrialStarted.to_string(), "TRIAL_STARTED");
        assert_eq!(BillingEventType::WebhookRejected.to_string(), "WEBHOOK_REJECTED");
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::Gateway.to_string(), "gateway");
        assert_eq!(ActorType::Admin.to_string(), "admin");
    }

    #[tokio::test]
    async fn test_log_and_query_events() {
        let store = Arc::new(MemoryLedger::new());
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 00:00 UTC)));
        let logger = BillingEventLogger::new(store, clock);
        let user = Uuid::new_v4();

        logger
            .log_event(
                BillingEventBuilder::new(user, BillingEventType::PaymentSucceeded)
                    .order("SUB-1-ABC")
                    .actor_type(ActorType::Gateway)
                    .data(serde_json::json!({"amount": 1000})),
            )
            .await
            .unwrap();

        let events = logger.get_events(user, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "PAYMENT_SUCCEEDED");
        assert_eq!(events[0].actor_type, "gateway");
        assert_eq!(events[0].provider_order_id.as_deref(), Some("SUB-1-ABC"));
    }
}
