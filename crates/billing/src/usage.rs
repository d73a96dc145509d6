//! Usage metering and the enforcement gate
//!
//! Counters live in one `usage_stats` row per monthly window. Windows are
//! anchored on the subscription's period start and roll over lazily: the
//! first read or write after a boundary opens the next row and closes the
//! previous one, which settles its overage.
//!
//! The gate fails open. A ledger error or timeout while deciding is logged
//! and the action is allowed with `degraded` set.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;
use whatsflow_shared::{
    add_months, Action, Clock, Resource, Subscription, SubscriptionStatus, UsageStats,
};

use crate::config::BillingConfig;
use crate::entitlement::{evaluate, usage_percentage, Decision, Entitlement};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::overage::OverageService;
use crate::store::LedgerStore;
use crate::subscriptions::SubscriptionManager;

/// Upper bound on windows stepped over when catching up a long-idle subscription
const MAX_WINDOW_STEPS: u32 = 1200;

/// Usage of one resource against its limit
#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub resource: Resource,
    pub used: i64,
    /// `None` when unlimited
    pub limit: Option<i64>,
    pub unlimited: bool,
    pub percentage: Option<f64>,
}

/// Current-period usage of a tenant
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub plan_name: String,
    pub plan_slug: String,
    pub status: SubscriptionStatus,
    pub is_free: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    pub trial_days_remaining: Option<i64>,
    pub overage_enabled: bool,
    pub resources: Vec<ResourceUsage>,
}

/// Monthly usage window containing `now`.
///
/// The current row's window is kept while it contains `now`, unless the
/// subscription started a newer period (a renewal or plan change) in the meantime.
pub fn usage_window(
    sub: &Subscription,
    current: Option<&UsageStats>,
    now: OffsetDateTime,
) -> (OffsetDateTime, OffsetDateTime) {
    if let Some(row) = current {
        let contains_now = row.period_start <= now && now < row.period_end;
        let superseded =
            sub.current_period_start > row.period_start && sub.current_period_start <= now;
        if contains_now && !superseded {
            return (row.period_start, row.period_end);
        }
    }

    let anchor = [
        Some(sub.current_period_start),
        current.map(|row| row.period_end),
    ]
    .into_iter()
    .flatten()
    .filter(|at| *at <= now)
    .max()
    .unwrap_or(now);

    let mut step = 0;
    while step < MAX_WINDOW_STEPS && add_months(anchor, step + 1) <= now {
        step += 1;
    }
    (add_months(anchor, step), add_months(anchor, step + 1))
}

/// Highest warning threshold crossed by moving from `before` to `after`
fn crossed_threshold(thresholds: &[i64], max: i64, before: i64, after: i64) -> Option<i64> {
    if max <= 0 {
        return None;
    }
    thresholds
        .iter()
        .copied()
        .filter(|t| before * 100 < max * t && after * 100 >= max * t)
        .max()
}

pub struct UsageMeter {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<BillingConfig>,
    subscriptions: Arc<SubscriptionManager>,
    overage: Arc<OverageService>,
    events: BillingEventLogger,
}

impl UsageMeter {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: Arc<BillingConfig>,
        subscriptions: Arc<SubscriptionManager>,
        overage: Arc<OverageService>,
    ) -> Self {
        let events = BillingEventLogger::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            config,
            subscriptions,
            overage,
            events,
        }
    }

    /// Usage row for the window containing now, rolling over if a boundary passed
    pub async fn ensure_current_usage(&self, entitlement: &Entitlement) -> BillingResult<UsageStats> {
        let sub = &entitlement.subscription;
        let current = self.store.current_usage(sub.id).await?;
        let now = self.clock.now();
        let (start, end) = usage_window(sub, current.as_ref(), now);

        if let Some(row) = &current {
            if row.period_start == start {
                return Ok(row.clone());
            }
        }

        let row = UsageStats::open(sub.user_id, sub.id, start, end, current.as_ref(), now);
        match self.store.open_usage_period(&row).await {
            Ok(()) => {
                tracing::debug!(
                    user_id = %sub.user_id,
                    period_start = %start,
                    period_end = %end,
                    "Usage period opened"
                );
            }
            // Another request rolled over first
            Err(BillingError::Duplicate(_)) => {
                return self
                    .store
                    .current_usage(sub.id)
                    .await?
                    .ok_or_else(|| BillingError::NotFound(format!("usage for {}", sub.id)));
            }
            Err(e) => return Err(e),
        }

        if let Some(previous) = current {
            if let Err(e) = self.overage.close_period(&previous, &entitlement.plan).await {
                tracing::error!(
                    user_id = %sub.user_id,
                    usage_id = %previous.id,
                    error = %e,
                    "Failed to close usage period"
                );
            }
        }

        Ok(row)
    }

    async fn decide(&self, user_id: Uuid, action: Action) -> BillingResult<Decision> {
        let Some(entitlement) = self.subscriptions.resolve_entitlement(user_id).await? else {
            return Ok(Decision::no_subscription());
        };

        let resource = action.resource();
        let feature_missing = action
            .required_feature()
            .is_some_and(|f| !entitlement.has_feature(f));
        let skip_usage = entitlement.is_free()
            || !entitlement.subscription.grants_access()
            || feature_missing
            || entitlement.limit(resource).is_unlimited();

        let used = if skip_usage {
            0
        } else {
            self.ensure_current_usage(&entitlement).await?.get(resource)
        };

        Ok(evaluate(&entitlement, action, used))
    }

    /// Whether the user may perform `action` now
    pub async fn can_perform_action(&self, user_id: Uuid, action: Action) -> Decision {
        let decision =
            match tokio::time::timeout(self.config.store_timeout, self.decide(user_id, action))
                .await
            {
                Ok(Ok(decision)) => decision,
                Ok(Err(e)) => {
                    tracing::error!(
                        user_id = %user_id,
                        action = %action,
                        error = %e,
                        "Entitlement check failed, allowing action"
                    );
                    return Decision::allow_degraded();
                }
                Err(_) => {
                    tracing::error!(
                        user_id = %user_id,
                        action = %action,
                        timeout_ms = self.config.store_timeout.as_millis() as u64,
                        "Entitlement check timed out, allowing action"
                    );
                    return Decision::allow_degraded();
                }
            };

        if !decision.allowed {
            tracing::info!(
                user_id = %user_id,
                action = %action,
                reason = decision.reason.as_deref().unwrap_or_default(),
                "Action denied"
            );
        } else if decision.overage {
            tracing::debug!(user_id = %user_id, action = %action, "Action allowed as overage");
        }
        decision
    }

    /// Record `count` units after the gated action succeeded. Returns the new counter value.
    ///
    /// Negative counts release cumulative resources (a removed device or contact).
    pub async fn record_usage(&self, user_id: Uuid, action: Action, count: i64) -> BillingResult<i64> {
        let resource = action.resource();
        if count == 0 {
            return Err(BillingError::InvalidInput("count must not be zero".to_string()));
        }
        if count < 0 && resource.is_monthly_flow() {
            return Err(BillingError::InvalidInput(format!(
                "{} usage cannot be decremented",
                resource.label()
            )));
        }

        tokio::time::timeout(
            self.config.store_timeout,
            self.record(user_id, resource, count),
        )
        .await
        .map_err(|_| BillingError::Timeout("record_usage"))?
    }

    async fn record(&self, user_id: Uuid, resource: Resource, count: i64) -> BillingResult<i64> {
        let entitlement = self
            .subscriptions
            .resolve_entitlement(user_id)
            .await?
            .ok_or(BillingError::NoSubscription)?;
        let row = self.ensure_current_usage(&entitlement).await?;
        let value = self.store.increment_usage(row.id, resource, count).await?;

        tracing::debug!(
            user_id = %user_id,
            resource = ?resource,
            count = count,
            value = value,
            "Usage recorded"
        );

        if count > 0 && resource.is_monthly_flow() {
            if let Some(max) = entitlement.limit(resource).max() {
                if let Some(threshold) = crossed_threshold(
                    &self.config.usage_warning_thresholds,
                    max,
                    value - count,
                    value,
                ) {
                    tracing::warn!(
                        user_id = %user_id,
                        resource = ?resource,
                        used = value,
                        limit = max,
                        threshold = threshold,
                        "Usage threshold reached"
                    );
                    self.events
                        .record(
                            BillingEventBuilder::new(user_id, BillingEventType::UsageWarning)
                                .data(serde_json::json!({
                                    "resource": resource,
                                    "used": value,
                                    "limit": max,
                                    "threshold": threshold,
                                })),
                        )
                        .await;
                }
            }
        }

        Ok(value)
    }

    /// Per-resource usage for the current window
    pub async fn usage_summary(&self, user_id: Uuid) -> BillingResult<UsageSummary> {
        let entitlement = self
            .subscriptions
            .resolve_entitlement(user_id)
            .await?
            .ok_or(BillingError::NoSubscription)?;

        let row = if entitlement.subscription.grants_access() {
            Some(self.ensure_current_usage(&entitlement).await?)
        } else {
            self.store.current_usage(entitlement.subscription.id).await?
        };

        let resources = Resource::ALL
            .into_iter()
            .map(|resource| {
                let limit = entitlement.limit(resource);
                let used = row.as_ref().map(|r| r.get(resource)).unwrap_or(0);
                ResourceUsage {
                    resource,
                    used,
                    limit: limit.max(),
                    unlimited: limit.is_unlimited(),
                    percentage: usage_percentage(used, limit),
                }
            })
            .collect();

        Ok(UsageSummary {
            plan_name: entitlement.plan.name.clone(),
            plan_slug: entitlement.plan.slug.clone(),
            status: entitlement.status(),
            is_free: entitlement.is_free(),
            period_start: row.as_ref().map(|r| r.period_start),
            period_end: row.as_ref().map(|r| r.period_end),
            trial_days_remaining: entitlement.trial_days_remaining(),
            overage_enabled: entitlement.plan.allow_overage,
            resources,
        })
    }

    /// Roll over usage rows whose window ended without any activity since.
    /// Returns the number of rows closed.
    pub async fn close_stale_periods(&self, limit: i64) -> BillingResult<usize> {
        let now = self.clock.now();
        let mut closed = 0;

        for row in self.store.stale_usage_periods(now, limit).await? {
            match self.roll_over(&row, now).await {
                Ok(()) => closed += 1,
                Err(e) => {
                    tracing::error!(
                        user_id = %row.user_id,
                        usage_id = %row.id,
                        error = %e,
                        "Failed to roll over usage period"
                    );
                }
            }
        }

        if closed > 0 {
            tracing::info!(closed = closed, "Stale usage periods closed");
        }
        Ok(closed)
    }

    async fn roll_over(&self, row: &UsageStats, now: OffsetDateTime) -> BillingResult<()> {
        let sub = self
            .store
            .get_subscription(row.subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", row.subscription_id)))?;
        let plan = self
            .store
            .get_plan(sub.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", sub.plan_id)))?;

        if sub.status.is_terminal() {
            self.overage.close_period(row, &plan).await?;
        } else {
            // Opening the next window carries cumulative counters and closes this one
            let current = self
                .ensure_current_usage(&Entitlement {
                    plan: plan.clone(),
                    subscription: sub,
                    computed_at: now,
                })
                .await?;
            // Left open by a close that failed after the next window was opened
            if current.id != row.id {
                self.overage.close_period(row, &plan).await?;
            }
        }
        Ok(())
    }
}
