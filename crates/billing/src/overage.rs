//! Usage-based overage billing
//!
//! Overage is computed once, when a usage period closes. Credits are applied
//! first; any uncovered remainder becomes a pending overage payment that is
//! collected through a one-time checkout.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use whatsflow_shared::{
    Clock, Payment, PaymentKind, PaymentStatus, Plan, Resource, UsageStats,
};

use crate::config::BillingConfig;
use crate::credits::CreditLedger;
use crate::error::BillingResult;
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::store::LedgerStore;

/// Per-unit overage pricing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverageRates {
    /// Minor units per message over the limit
    pub message_price: i64,
    pub ai_message_price: i64,
    /// Units at or above which the bulk discount applies
    pub bulk_threshold: i64,
    /// Basis points off the charge, 2000 = 20%
    pub bulk_discount_bps: i64,
}

impl Default for OverageRates {
    fn default() -> Self {
        Self::from_config(&BillingConfig::default())
    }
}

impl OverageRates {
    pub fn from_config(config: &BillingConfig) -> Self {
        Self {
            message_price: config.overage_message_price,
            ai_message_price: config.overage_ai_message_price,
            bulk_threshold: config.bulk_discount_threshold,
            bulk_discount_bps: config.bulk_discount_bps.clamp(0, 10_000),
        }
    }

    pub fn unit_price(&self, resource: Resource) -> i64 {
        match resource {
            Resource::Messages => self.message_price,
            Resource::AiMessages => self.ai_message_price,
            _ => 0,
        }
    }

    /// `units × price`, discounted when `units` reaches the bulk threshold.
    /// Rounded half up to the nearest minor unit.
    pub fn charge_for(&self, resource: Resource, units: i64) -> i64 {
        if units <= 0 {
            return 0;
        }
        let gross = units.saturating_mul(self.unit_price(resource));
        if units >= self.bulk_threshold && self.bulk_discount_bps > 0 {
            let net_bps = 10_000 - self.bulk_discount_bps;
            gross.saturating_mul(net_bps).saturating_add(5_000) / 10_000
        } else {
            gross
        }
    }
}

/// Overage figures of one closed period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodOverage {
    pub messages_overage: i64,
    pub ai_messages_overage: i64,
    /// Total charge in minor units; zero when the plan does not bill overage
    pub amount: i64,
}

/// Outcome of settling a closed period's overage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverageSettlement {
    pub usage_id: Uuid,
    pub overage: PeriodOverage,
    pub paid_from_credits: i64,
    pub remaining_charge: i64,
    /// Pending payment created for the uncovered remainder
    pub payment_id: Option<Uuid>,
}

pub fn calculate(rates: &OverageRates, plan: &Plan, usage: &UsageStats) -> PeriodOverage {
    let messages_overage = plan
        .limits
        .get(Resource::Messages)
        .overage(usage.messages_sent);
    let ai_messages_overage = plan
        .limits
        .get(Resource::AiMessages)
        .overage(usage.ai_messages_count);

    let amount = if plan.allow_overage {
        rates
            .charge_for(Resource::Messages, messages_overage)
            .saturating_add(rates.charge_for(Resource::AiMessages, ai_messages_overage))
    } else {
        0
    };

    PeriodOverage {
        messages_overage,
        ai_messages_overage,
        amount,
    }
}

/// Provider id of the overage payment raised for a usage row
pub fn overage_payment_id(usage_id: Uuid) -> String {
    format!("OVG-{}", usage_id)
}

pub struct OverageService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    credits: Arc<CreditLedger>,
    rates: OverageRates,
    events: BillingEventLogger,
}

impl OverageService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        credits: Arc<CreditLedger>,
        rates: OverageRates,
    ) -> Self {
        let events = BillingEventLogger::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            credits,
            rates,
            events,
        }
    }

    pub fn rates(&self) -> &OverageRates {
        &self.rates
    }

    /// Freeze `row` and bill its overage. Returns `None` when another caller
    /// already closed the row.
    ///
    /// If billing fails after the row is frozen, the row is reopened and the
    /// error returned; the next close resumes without charging credits twice.
    pub async fn close_period(
        &self,
        row: &UsageStats,
        plan: &Plan,
    ) -> BillingResult<Option<OverageSettlement>> {
        let now = self.clock.now();
        let overage = calculate(&self.rates, plan, row);

        let mut closed = row.clone();
        closed.messages_overage = overage.messages_overage;
        closed.ai_messages_overage = overage.ai_messages_overage;
        closed.overage_amount = overage.amount;
        closed.is_current = false;
        closed.updated_at = now;

        if !self.store.close_usage_period(&closed).await? {
            return Ok(None);
        }

        tracing::info!(
            user_id = %row.user_id,
            usage_id = %row.id,
            messages_overage = overage.messages_overage,
            ai_messages_overage = overage.ai_messages_overage,
            amount = overage.amount,
            "Usage period closed"
        );

        match self.settle(row, plan, overage).await {
            Ok(settlement) => Ok(Some(settlement)),
            Err(e) => {
                if let Err(reopen) = self.store.reopen_usage_period(row.id).await {
                    tracing::error!(
                        usage_id = %row.id,
                        error = %reopen,
                        "Failed to reopen usage period after billing error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn settle(
        &self,
        row: &UsageStats,
        plan: &Plan,
        overage: PeriodOverage,
    ) -> BillingResult<OverageSettlement> {
        let now = self.clock.now();
        let mut settlement = OverageSettlement {
            usage_id: row.id,
            overage,
            paid_from_credits: 0,
            remaining_charge: 0,
            payment_id: None,
        };

        if overage.amount == 0 {
            return Ok(settlement);
        }

        // An earlier attempt may have drawn on the balance before failing
        let debited = self.store.credits_debited_for(row.user_id, row.id).await?;
        settlement.paid_from_credits = if debited > 0 {
            debited.min(overage.amount)
        } else {
            self.credits
                .process_overage_charges(row.user_id, overage.amount, Some(row.id))
                .await?
                .paid_from_credits
        };
        settlement.remaining_charge = overage.amount - settlement.paid_from_credits;

        if settlement.paid_from_credits > 0 {
            self.store
                .set_overage_credits_used(row.id, settlement.paid_from_credits)
                .await?;
        }

        if settlement.remaining_charge > 0 {
            let payment = Payment {
                id: Uuid::new_v4(),
                user_id: row.user_id,
                subscription_id: Some(row.subscription_id),
                plan_id: Some(plan.id),
                billing_cycle: None,
                kind: PaymentKind::Overage,
                amount: settlement.remaining_charge,
                currency: plan.currency.clone(),
                status: PaymentStatus::Pending,
                provider_payment_id: overage_payment_id(row.id),
                provider_reference: None,
                description: Some(format!(
                    "Overage for period starting {}",
                    row.period_start.date()
                )),
                invoice_number: None,
                invoice_url: None,
                failure_reason: None,
                refund_reason: None,
                attempted_at: now,
                paid_at: None,
                refunded_at: None,
                created_at: now,
            };
            settlement.payment_id = if self.store.insert_payment(&payment).await? {
                Some(payment.id)
            } else {
                self.store
                    .find_payment_by_provider_id(&payment.provider_payment_id)
                    .await?
                    .map(|p| p.id)
            };
        }

        self.events
            .record(
                BillingEventBuilder::new(row.user_id, BillingEventType::OverageRecorded).data(
                    serde_json::json!({
                        "usage_id": row.id,
                        "messages_overage": overage.messages_overage,
                        "ai_messages_overage": overage.ai_messages_overage,
                        "amount": overage.amount,
                        "paid_from_credits": settlement.paid_from_credits,
                        "remaining_charge": settlement.remaining_charge,
                    }),
                ),
            )
            .await;

        Ok(settlement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use whatsflow_shared::{Limit, PlanFeatures, PlanLimits};

    fn plan(allow_overage: bool) -> Plan {
        let now = datetime!(2024-01-01 00:00 UTC);
        Plan {
            id: Uuid::new_v4(),
            name: "Starter".into(),
            slug: "starter".into(),
            description: None,
            price_monthly: 290_000,
            price_annual: 2_900_000,
            currency: "LKR".into(),
            features: PlanFeatures::default(),
            limits: PlanLimits {
                devices: Limit::finite(1),
                contacts: Limit::finite(100),
                messages_per_month: Limit::finite(1000),
                ai_messages_per_month: Limit::finite(100),
                broadcasts_per_month: Limit::zero(),
                web_scraping_pages: Limit::zero(),
            },
            allow_overage,
            is_active: true,
            display_order: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn usage(messages: i64, ai: i64) -> UsageStats {
        let start = datetime!(2024-01-01 00:00 UTC);
        let mut row = UsageStats::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            start,
            datetime!(2024-02-01 00:00 UTC),
            None,
            start,
        );
        row.messages_sent = messages;
        row.ai_messages_count = ai;
        row
    }

    #[test]
    fn test_charge_below_bulk_threshold() {
        let rates = OverageRates::default();
        assert_eq!(rates.charge_for(Resource::Messages, 999), 999);
        assert_eq!(rates.charge_for(Resource::AiMessages, 10), 20);
        assert_eq!(rates.charge_for(Resource::Messages, 0), 0);
    }

    #[test]
    fn test_bulk_discount_applies_at_threshold() {
        let rates = OverageRates::default();
        // 1000 units × 1 × 0.8
        assert_eq!(rates.charge_for(Resource::Messages, 1000), 800);
        // 1500 units × 2 × 0.8
        assert_eq!(rates.charge_for(Resource::AiMessages, 1500), 2400);
    }

    #[test]
    fn test_calculate_period_overage() {
        let rates = OverageRates::default();
        let overage = calculate(&rates, &plan(true), &usage(1200, 150));
        assert_eq!(overage.messages_overage, 200);
        assert_eq!(overage.ai_messages_overage, 50);
        assert_eq!(overage.amount, 200 + 100);
    }

    #[test]
    fn test_no_charge_without_overage_billing() {
        let rates = OverageRates::default();
        let overage = calculate(&rates, &plan(false), &usage(1200, 0));
        assert_eq!(overage.messages_overage, 200);
        assert_eq!(overage.amount, 0);
    }

    #[test]
    fn test_unlimited_plan_has_no_overage() {
        let rates = OverageRates::default();
        let mut unlimited = plan(true);
        unlimited.limits = PlanLimits::unlimited();
        assert_eq!(
            calculate(&rates, &unlimited, &usage(1_000_000, 1_000_000)),
            PeriodOverage::default()
        );
    }

    #[test]
    fn test_overage_payment_id_format() {
        let id = Uuid::nil();
        assert_eq!(
            overage_payment_id(id),
            "OVG-00000000-0000-0000-0000-000000000000"
        );
    }
}
