//! PayHere hosted checkout
//!
//! Every checkout first records a pending payment keyed by its order id, so
//! the notification for that order always finds the row it settles.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use whatsflow_shared::{
    BillingCycle, Clock, Payment, PaymentKind, PaymentStatus, Subscription, SubscriptionStatus,
};

use crate::config::{BillingConfig, PayHereConfig};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::payhere::{
    build_checkout, generate_order_id, CheckoutItem, CheckoutPayload, CustomerDetails,
    ONE_TIME_ORDER_PREFIX, SUBSCRIPTION_ORDER_PREFIX,
};
use crate::plans::PlanCatalog;
use crate::store::LedgerStore;

/// A created checkout: the pending payment and the redirect form
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub payment_id: Uuid,
    pub order_id: String,
    pub checkout: CheckoutPayload,
}

/// Body of a subscribe call
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub plan_id: Uuid,
    #[serde(default)]
    pub billing_cycle: BillingCycle,
}

pub struct CheckoutService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<BillingConfig>,
    plans: Arc<PlanCatalog>,
    events: BillingEventLogger,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: Arc<BillingConfig>,
        plans: Arc<PlanCatalog>,
    ) -> Self {
        let events = BillingEventLogger::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            config,
            plans,
            events,
        }
    }

    fn payhere(&self) -> BillingResult<&PayHereConfig> {
        self.config
            .payhere
            .as_ref()
            .ok_or_else(|| BillingError::Config("PayHere is not configured".to_string()))
    }

    async fn open_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self
            .store
            .latest_subscription(user_id)
            .await?
            .filter(|s| !s.status.is_terminal()))
    }

    /// Start a recurring checkout for `plan_id`. The plan is bound when the
    /// gateway confirms the first payment.
    pub async fn create_subscription_checkout(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        billing_cycle: BillingCycle,
        customer: &CustomerDetails,
    ) -> BillingResult<CheckoutResponse> {
        let payhere = self.payhere()?;
        let plan = self.plans.purchasable(plan_id).await?;
        let amount = plan.price_for(billing_cycle);
        if amount <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "plan '{}' has no {} price",
                plan.slug, billing_cycle
            )));
        }

        let open = self.open_subscription(user_id).await?;
        if let Some(sub) = &open {
            let same_plan = sub.plan_id == plan.id && sub.billing_cycle == billing_cycle;
            if sub.status == SubscriptionStatus::Active && same_plan && !sub.cancel_at_period_end {
                return Err(BillingError::SubscriptionAlreadyExists);
            }
        }

        let now = self.clock.now();
        let order_id = generate_order_id(SUBSCRIPTION_ORDER_PREFIX, now);
        let description = format!("{} - {} subscription", plan.name, billing_cycle);

        let payment = Payment {
            id: Uuid::new_v4(),
            user_id,
            subscription_id: open.as_ref().map(|s| s.id),
            plan_id: Some(plan.id),
            billing_cycle: Some(billing_cycle),
            kind: PaymentKind::Subscription,
            amount,
            currency: plan.currency.clone(),
            status: PaymentStatus::Pending,
            provider_payment_id: order_id.clone(),
            provider_reference: None,
            description: Some(description.clone()),
            invoice_number: None,
            invoice_url: None,
            failure_reason: None,
            refund_reason: None,
            attempted_at: now,
            paid_at: None,
            refunded_at: None,
            created_at: now,
        };
        if !self.store.insert_payment(&payment).await? {
            return Err(BillingError::Duplicate(order_id));
        }

        if let Some(mut sub) = open {
            let expected = sub.status;
            sub.provider_order_id = Some(order_id.clone());
            sub.updated_at = now;
            if !self.store.update_subscription(&sub, expected).await? {
                tracing::debug!(
                    user_id = %user_id,
                    order_id = %order_id,
                    "Subscription changed during checkout, order link skipped"
                );
            }
        }

        let checkout = build_checkout(
            payhere,
            customer,
            &CheckoutItem {
                order_id: order_id.clone(),
                description,
                amount,
                currency: plan.currency.clone(),
                recurrence: Some(billing_cycle.recurrence().to_string()),
            },
            user_id,
        );

        tracing::info!(
            user_id = %user_id,
            order_id = %order_id,
            plan = %plan.slug,
            cycle = %billing_cycle,
            amount = amount,
            "Subscription checkout created"
        );
        self.events
            .record(
                BillingEventBuilder::new(user_id, BillingEventType::CheckoutCreated)
                    .order(order_id.clone())
                    .actor(user_id, ActorType::User)
                    .data(serde_json::json!({
                        "plan_id": plan.id,
                        "billing_cycle": billing_cycle,
                        "amount": amount,
                    })),
            )
            .await;

        Ok(CheckoutResponse {
            payment_id: payment.id,
            order_id,
            checkout,
        })
    }

    /// One-time payment, credited to the tenant's balance once paid
    pub async fn create_one_time_checkout(
        &self,
        user_id: Uuid,
        description: &str,
        amount: i64,
        customer: &CustomerDetails,
    ) -> BillingResult<CheckoutResponse> {
        let payhere = self.payhere()?;
        if amount <= 0 {
            return Err(BillingError::InvalidInput(
                "payment amount must be positive".to_string(),
            ));
        }

        let now = self.clock.now();
        let order_id = generate_order_id(ONE_TIME_ORDER_PREFIX, now);
        let currency = self
            .open_subscription(user_id)
            .await?
            .map(|s| s.currency)
            .unwrap_or_else(|| "LKR".to_string());

        let payment = Payment {
            id: Uuid::new_v4(),
            user_id,
            subscription_id: None,
            plan_id: None,
            billing_cycle: None,
            kind: PaymentKind::OneTime,
            amount,
            currency: currency.clone(),
            status: PaymentStatus::Pending,
            provider_payment_id: order_id.clone(),
            provider_reference: None,
            description: Some(description.to_string()),
            invoice_number: None,
            invoice_url: None,
            failure_reason: None,
            refund_reason: None,
            attempted_at: now,
            paid_at: None,
            refunded_at: None,
            created_at: now,
        };
        if !self.store.insert_payment(&payment).await? {
            return Err(BillingError::Duplicate(order_id));
        }

        let checkout = build_checkout(
            payhere,
            customer,
            &CheckoutItem {
                order_id: order_id.clone(),
                description: description.to_string(),
                amount,
                currency,
                recurrence: None,
            },
            user_id,
        );

        tracing::info!(user_id = %user_id, order_id = %order_id, amount = amount, "One-time checkout created");
        self.events
            .record(
                BillingEventBuilder::new(user_id, BillingEventType::CheckoutCreated)
                    .order(order_id.clone())
                    .actor(user_id, ActorType::User)
                    .data(serde_json::json!({ "kind": "one_time", "amount": amount })),
            )
            .await;

        Ok(CheckoutResponse {
            payment_id: payment.id,
            order_id,
            checkout,
        })
    }

    /// Checkout for an existing pending payment, such as an overage remainder
    pub async fn create_payment_checkout(
        &self,
        user_id: Uuid,
        payment_id: Uuid,
        customer: &CustomerDetails,
    ) -> BillingResult<CheckoutResponse> {
        let payhere = self.payhere()?;
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| BillingError::NotFound(format!("payment {}", payment_id)))?;

        if payment.status != PaymentStatus::Pending {
            return Err(BillingError::InvalidInput(format!(
                "payment is already {}",
                payment.status
            )));
        }

        let checkout = build_checkout(
            payhere,
            customer,
            &CheckoutItem {
                order_id: payment.provider_payment_id.clone(),
                description: payment
                    .description
                    .clone()
                    .unwrap_or_else(|| "WhatsFlow payment".to_string()),
                amount: payment.amount,
                currency: payment.currency.clone(),
                recurrence: None,
            },
            user_id,
        );

        Ok(CheckoutResponse {
            payment_id: payment.id,
            order_id: payment.provider_payment_id,
            checkout,
        })
    }
}
