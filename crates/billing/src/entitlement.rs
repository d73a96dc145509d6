//! Entitlement Module
//!
//! Answers "what may this tenant do right now?" from a resolved
//! (plan, subscription, period) triple. Everything here is a pure function of
//! its inputs so the gate's policy can be tested without a ledger.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use whatsflow_shared::{Action, Feature, Limit, Plan, Resource, Subscription, SubscriptionStatus};

/// Resolved entitlement of a tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub plan: Plan,
    pub subscription: Subscription,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

impl Entitlement {
    pub fn status(&self) -> SubscriptionStatus {
        self.subscription.status
    }

    pub fn is_free(&self) -> bool {
        self.subscription.is_free
    }

    /// `[current_period_start, current_period_end)`
    pub fn period(&self) -> (OffsetDateTime, OffsetDateTime) {
        (
            self.subscription.current_period_start,
            self.subscription.current_period_end,
        )
    }

    pub fn has_feature(&self, feature: Feature) -> bool {
        self.is_free() || self.plan.features.enabled(feature)
    }

    pub fn limit(&self, resource: Resource) -> Limit {
        if self.is_free() {
            return Limit::UNLIMITED;
        }
        self.plan.limits.get(resource)
    }

    /// Whole days left in the trial, rounded up. `None` outside a trial.
    pub fn trial_days_remaining(&self) -> Option<i64> {
        trial_days_remaining(&self.subscription, self.computed_at)
    }
}

/// Outcome of an enforcement check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub needs_upgrade: bool,
    pub is_past_due: bool,
    /// Allowed past the limit; the excess is billed at period close
    pub overage: bool,
    /// Allowed because the ledger could not be reached
    pub degraded: bool,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            needs_upgrade: false,
            is_past_due: false,
            overage: false,
            degraded: false,
        }
    }

    pub fn allow_overage() -> Self {
        Self {
            overage: true,
            ..Self::allow()
        }
    }

    pub fn allow_degraded() -> Self {
        Self {
            degraded: true,
            ..Self::allow()
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            needs_upgrade: true,
            is_past_due: false,
            overage: false,
            degraded: false,
        }
    }

    pub fn no_subscription() -> Self {
        Self::deny("No active subscription. Please subscribe to continue using WhatsFlow.")
    }
}

/// Denial for a subscription whose status does not entitle the tenant
pub fn status_denial(status: SubscriptionStatus) -> Decision {
    let reason = match status {
        SubscriptionStatus::PastDue => {
            "Your payment failed. Please update your payment method to continue using WhatsFlow."
        }
        SubscriptionStatus::Canceled => {
            "Your subscription has been canceled. Please reactivate to continue."
        }
        SubscriptionStatus::Expired => {
            "Your subscription has expired. Please renew to continue using WhatsFlow."
        }
        SubscriptionStatus::Paused => {
            "Your account is currently paused. Please contact support to reactivate."
        }
        SubscriptionStatus::Trial | SubscriptionStatus::Active => "Subscription is not active",
    };
    Decision {
        is_past_due: status == SubscriptionStatus::PastDue,
        ..Decision::deny(reason)
    }
}

/// Decide whether `action` fits the plan given `used` units already consumed
/// in the current period (or currently held, for cumulative resources).
pub fn evaluate(entitlement: &Entitlement, action: Action, used: i64) -> Decision {
    if entitlement.is_free() {
        return Decision::allow();
    }

    if !entitlement.subscription.grants_access() {
        return status_denial(entitlement.status());
    }

    if let Some(feature) = action.required_feature() {
        if !entitlement.has_feature(feature) {
            return Decision::deny(feature_denial(feature));
        }
    }

    let resource = action.resource();
    let limit = entitlement.limit(resource);
    if limit.allows(used) {
        return Decision::allow();
    }

    if entitlement.plan.allow_overage && resource.is_overage_eligible() {
        return Decision::allow_overage();
    }

    Decision::deny(limit_denial(resource, limit))
}

fn feature_denial(feature: Feature) -> String {
    let name = match feature {
        Feature::AiReplies => "AI replies",
        Feature::Broadcasts => "Broadcast campaigns",
        Feature::WebScraping => "Web scraping",
        other => other.as_str(),
    };
    format!("{} are not available in your plan", name)
}

fn limit_denial(resource: Resource, limit: Limit) -> String {
    let max = limit.max().unwrap_or_default();
    if resource.is_monthly_flow() {
        format!(
            "You've reached your {} limit of {} this month",
            resource.label(),
            max
        )
    } else {
        format!("You've reached your {} limit of {}", resource.label(), max)
    }
}

pub fn trial_days_remaining(subscription: &Subscription, now: OffsetDateTime) -> Option<i64> {
    if subscription.status != SubscriptionStatus::Trial {
        return None;
    }
    let ends = subscription.trial_ends_at?;
    let seconds = (ends - now).whole_seconds();
    if seconds <= 0 {
        return Some(0);
    }
    Some((seconds + 86_399) / 86_400)
}

/// Percentage of a finite limit consumed. `None` when unlimited.
pub fn usage_percentage(used: i64, limit: Limit) -> Option<f64> {
    let max = limit.max()?;
    if max == 0 {
        return Some(if used > 0 { 100.0 } else { 0.0 });
    }
    Some((used as f64 / max as f64 * 100.0).min(100.0))
}
