//! Subscription lifecycle
//!
//! States: trial, active, past_due, canceled, paused, expired. Canceled and
//! expired are terminal; reactivation opens a new row. Every write is a
//! conditional update on the status that was read, so concurrent writers
//! (webhooks, the reconcile job, user requests) cannot overwrite each other.
//!
//! Time-based transitions (trial end, deferred cancel, grace expiry) are
//! applied lazily on every read and by the worker's reconcile job.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;
use whatsflow_shared::{BillingCycle, Clock, Payment, Subscription, SubscriptionStatus};

use crate::checkout::{CheckoutResponse, CheckoutService};
use crate::config::BillingConfig;
use crate::entitlement::Entitlement;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::gateway::PaymentGateway;
use crate::payhere::CustomerDetails;
use crate::plans::PlanCatalog;
use crate::store::LedgerStore;

/// Attempts at a conditional write before giving up on a contended row
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Outcome of a reactivation request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum Reactivation {
    /// A pending cancellation was withdrawn or a pause lifted
    Resumed(Subscription),
    AlreadyActive(Subscription),
    /// A fresh lifecycle starts once this checkout is paid
    Checkout(CheckoutResponse),
}

/// Counts from a reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub expired: usize,
    pub canceled: usize,
    /// Rows changed by another writer between read and update
    pub skipped: usize,
}

/// Time-driven transition due for `sub` at `now`, if any
pub fn due_transition(sub: &Subscription, now: OffsetDateTime) -> Option<SubscriptionStatus> {
    let period_over = sub.current_period_end <= now;
    match sub.status {
        SubscriptionStatus::Trial => {
            let trial_over = sub.trial_ends_at.is_some_and(|t| t <= now);
            if sub.cancel_at_period_end && (trial_over || period_over) {
                Some(SubscriptionStatus::Canceled)
            } else if trial_over && !sub.is_free {
                Some(SubscriptionStatus::Expired)
            } else {
                None
            }
        }
        SubscriptionStatus::Active => {
            (sub.cancel_at_period_end && period_over).then_some(SubscriptionStatus::Canceled)
        }
        SubscriptionStatus::PastDue => (!sub.is_free
            && sub.grace_ends_at.is_some_and(|g| g <= now))
        .then_some(SubscriptionStatus::Expired),
        SubscriptionStatus::Paused | SubscriptionStatus::Canceled | SubscriptionStatus::Expired => {
            None
        }
    }
}

pub struct SubscriptionManager {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<BillingConfig>,
    plans: Arc<PlanCatalog>,
    checkout: Arc<CheckoutService>,
    gateway: Option<Arc<dyn PaymentGateway>>,
    events: BillingEventLogger,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: Arc<BillingConfig>,
        plans: Arc<PlanCatalog>,
        checkout: Arc<CheckoutService>,
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> Self {
        let events = BillingEventLogger::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            config,
            plans,
            checkout,
            gateway,
            events,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Latest subscription with any due transition applied
    pub async fn current(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        self.reconcile_user(user_id).await
    }

    /// Plan and subscription of the user, whatever the status
    pub async fn resolve_entitlement(&self, user_id: Uuid) -> BillingResult<Option<Entitlement>> {
        let Some(subscription) = self.reconcile_user(user_id).await? else {
            return Ok(None);
        };
        let plan = self.plans.get(subscription.plan_id).await?;
        Ok(Some(Entitlement {
            plan,
            subscription,
            computed_at: self.clock.now(),
        }))
    }

    /// Entitlement of a user allowed to act. Fails with `NoSubscription` or `NotActive`.
    pub async fn get_active_entitlement(&self, user_id: Uuid) -> BillingResult<Entitlement> {
        let entitlement = self
            .resolve_entitlement(user_id)
            .await?
            .ok_or(BillingError::NoSubscription)?;
        if !entitlement.subscription.grants_access() {
            return Err(BillingError::NotActive {
                status: entitlement.status(),
            });
        }
        Ok(entitlement)
    }

    async fn latest_open(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self
            .store
            .latest_subscription(user_id)
            .await?
            .filter(|s| !s.status.is_terminal()))
    }

    async fn require_latest(&self, user_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .latest_subscription(user_id)
            .await?
            .ok_or(BillingError::NoSubscription)
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Apply any due transition to the user's latest subscription
    pub async fn reconcile_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let Some(sub) = self.store.latest_subscription(user_id).await? else {
            return Ok(None);
        };
        let now = self.clock.now();
        match due_transition(&sub, now) {
            Some(target) => {
                if let Some(updated) = self.apply_due_transition(&sub, target, now).await? {
                    return Ok(Some(updated));
                }
                // Lost the race; whoever won has the current row
                self.store.get_subscription(sub.id).await
            }
            None => Ok(Some(sub)),
        }
    }

    /// Apply due transitions to every subscription whose deadline passed
    pub async fn reconcile_due(&self) -> BillingResult<ReconcileReport> {
        let now = self.clock.now();
        let mut report = ReconcileReport::default();

        for sub in self.store.subscriptions_due(now).await? {
            let Some(target) = due_transition(&sub, now) else {
                continue;
            };
            match self.apply_due_transition(&sub, target, now).await {
                Ok(Some(_)) if target == SubscriptionStatus::Expired => report.expired += 1,
                Ok(Some(_)) => report.canceled += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        user_id = %sub.user_id,
                        subscription_id = %sub.id,
                        error = %e,
                        "Failed to reconcile subscription"
                    );
                }
            }
        }

        if report != ReconcileReport::default() {
            tracing::info!(
                expired = report.expired,
                canceled = report.canceled,
                skipped = report.skipped,
                "Subscription reconciliation complete"
            );
        }
        Ok(report)
    }

    async fn apply_due_transition(
        &self,
        sub: &Subscription,
        target: SubscriptionStatus,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut updated = sub.clone();
        updated.status = target;
        updated.updated_at = now;
        if target == SubscriptionStatus::Canceled {
            updated.canceled_at = Some(now);
            updated.cancel_at_period_end = false;
        }
        updated.next_billing_date = None;

        if !self.store.update_subscription(&updated, sub.status).await? {
            return Ok(None);
        }

        let event_type = if target == SubscriptionStatus::Expired {
            BillingEventType::SubscriptionExpired
        } else {
            BillingEventType::SubscriptionCanceled
        };
        tracing::info!(
            user_id = %sub.user_id,
            subscription_id = %sub.id,
            from = %sub.status,
            to = %target,
            "Subscription transitioned"
        );
        self.events
            .record(
                BillingEventBuilder::new(sub.user_id, event_type).data(serde_json::json!({
                    "subscription_id": sub.id,
                    "from": sub.status,
                    "reason": "deadline_passed",
                })),
            )
            .await;

        self.stop_gateway_billing(&updated).await;
        Ok(Some(updated))
    }

    /// Best effort: the gateway keeps charging a recurring subscription until told otherwise
    async fn stop_gateway_billing(&self, sub: &Subscription) {
        let (Some(gateway), Some(provider_id)) = (&self.gateway, &sub.provider_subscription_id)
        else {
            return;
        };
        if let Err(e) = gateway.cancel_subscription(provider_id).await {
            tracing::warn!(
                user_id = %sub.user_id,
                provider_subscription_id = %provider_id,
                error = %e,
                "Failed to cancel subscription at gateway"
            );
        }
    }

    // =========================================================================
    // User operations
    // =========================================================================

    /// Start the one free trial a user gets
    pub async fn start_trial(&self, user_id: Uuid) -> BillingResult<Subscription> {
        if self.store.has_used_trial(user_id).await? {
            return Err(BillingError::TrialAlreadyUsed);
        }
        if self.latest_open(user_id).await?.is_some() {
            return Err(BillingError::SubscriptionAlreadyExists);
        }

        let plan = self.plans.trial_plan().await?;
        let now = self.clock.now();
        let trial_ends_at = now + Duration::days(self.config.trial_duration_days);

        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id,
            plan_id: plan.id,
            status: SubscriptionStatus::Trial,
            resume_status: None,
            billing_cycle: BillingCycle::Monthly,
            current_price: 0,
            currency: plan.currency.clone(),
            current_period_start: now,
            current_period_end: trial_ends_at,
            trial_ends_at: Some(trial_ends_at),
            next_billing_date: None,
            cancel_at_period_end: false,
            canceled_at: None,
            past_due_since: None,
            grace_ends_at: None,
            is_free: false,
            free_reason: None,
            provider_order_id: None,
            provider_subscription_id: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_subscription(&sub).await {
            Ok(()) => {}
            Err(BillingError::Duplicate(_)) => return Err(BillingError::SubscriptionAlreadyExists),
            Err(e) => return Err(e),
        }

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            trial_ends_at = %trial_ends_at,
            "Trial started"
        );
        self.events
            .record(
                BillingEventBuilder::new(user_id, BillingEventType::TrialStarted)
                    .actor(user_id, ActorType::User)
                    .data(serde_json::json!({
                        "subscription_id": sub.id,
                        "plan_id": plan.id,
                        "trial_days": self.config.trial_duration_days,
                    })),
            )
            .await;

        Ok(sub)
    }

    /// Cancel now, or at the end of the current period. Repeating a cancel is a no-op.
    pub async fn cancel(&self, user_id: Uuid, immediately: bool) -> BillingResult<Subscription> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let sub = self.require_latest(user_id).await?;
            if sub.status.is_terminal() {
                return Ok(sub);
            }

            let now = self.clock.now();
            let deferred = !immediately && sub.status.grants_access();
            let mut updated = sub.clone();
            updated.updated_at = now;

            let event_type = if deferred {
                if sub.cancel_at_period_end {
                    return Ok(sub);
                }
                updated.cancel_at_period_end = true;
                BillingEventType::CancellationScheduled
            } else {
                updated.status = SubscriptionStatus::Canceled;
                updated.canceled_at = Some(now);
                updated.cancel_at_period_end = false;
                updated.resume_status = None;
                updated.next_billing_date = None;
                BillingEventType::SubscriptionCanceled
            };

            if !self.store.update_subscription(&updated, sub.status).await? {
                continue;
            }

            let cancel_at = if deferred { sub.current_period_end } else { now };
            tracing::info!(
                user_id = %user_id,
                subscription_id = %sub.id,
                immediately = !deferred,
                period_end = %sub.current_period_end,
                "Subscription cancellation processed"
            );
            self.events
                .record(
                    BillingEventBuilder::new(user_id, event_type)
                        .actor(user_id, ActorType::User)
                        .data(serde_json::json!({
                            "subscription_id": sub.id,
                            "from": sub.status,
                            "cancel_at": cancel_at,
                        })),
                )
                .await;

            // Deferred cancels stop the gateway too; the paid period still runs out
            self.stop_gateway_billing(&updated).await;
            return Ok(updated);
        }

        Err(conflict(user_id))
    }

    /// Undo a pending cancellation, lift a pause, or start a checkout for a fresh lifecycle
    pub async fn reactivate(
        &self,
        user_id: Uuid,
        customer: &CustomerDetails,
    ) -> BillingResult<Reactivation> {
        let sub = self
            .reconcile_user(user_id)
            .await?
            .ok_or(BillingError::NoSubscription)?;
        let now = self.clock.now();

        match sub.status {
            SubscriptionStatus::Trial | SubscriptionStatus::Active => {
                if !sub.cancel_at_period_end {
                    return Ok(Reactivation::AlreadyActive(sub));
                }
                let mut updated = sub.clone();
                updated.cancel_at_period_end = false;
                updated.updated_at = now;
                if updated.status == SubscriptionStatus::Active {
                    updated.next_billing_date = Some(updated.current_period_end);
                }
                if !self.store.update_subscription(&updated, sub.status).await? {
                    return Err(conflict(user_id));
                }

                tracing::info!(user_id = %user_id, subscription_id = %sub.id, "Pending cancellation withdrawn");
                self.events
                    .record(
                        BillingEventBuilder::new(user_id, BillingEventType::SubscriptionReactivated)
                            .actor(user_id, ActorType::User)
                            .data(serde_json::json!({ "subscription_id": sub.id })),
                    )
                    .await;
                Ok(Reactivation::Resumed(updated))
            }
            SubscriptionStatus::Paused => Ok(Reactivation::Resumed(self.resume(user_id).await?)),
            SubscriptionStatus::PastDue => {
                let checkout = self
                    .checkout
                    .create_subscription_checkout(user_id, sub.plan_id, sub.billing_cycle, customer)
                    .await?;
                Ok(Reactivation::Checkout(checkout))
            }
            SubscriptionStatus::Canceled | SubscriptionStatus::Expired => {
                let ended_at = sub.canceled_at.unwrap_or(sub.updated_at);
                let available_at = ended_at + Duration::days(self.config.reactivation_cooldown_days);
                if now < available_at {
                    return Err(BillingError::ReactivationCooldown { available_at });
                }

                let plan = self.plans.get(sub.plan_id).await?;
                if plan.price_for(sub.billing_cycle) <= 0 || !plan.is_active {
                    return Err(BillingError::InvalidInput(
                        "Select a plan to subscribe to".to_string(),
                    ));
                }
                let checkout = self
                    .checkout
                    .create_subscription_checkout(user_id, plan.id, sub.billing_cycle, customer)
                    .await?;
                Ok(Reactivation::Checkout(checkout))
            }
        }
    }

    /// Suspend access, remembering the state to come back to
    pub async fn pause(&self, user_id: Uuid, admin_id: Option<Uuid>) -> BillingResult<Subscription> {
        let sub = self.require_latest(user_id).await?;
        if sub.status == SubscriptionStatus::Paused {
            return Ok(sub);
        }
        if sub.status.is_terminal() {
            return Err(BillingError::InvalidTransition {
                status: sub.status,
                action: "pause",
            });
        }

        let now = self.clock.now();
        let mut updated = sub.clone();
        updated.resume_status = Some(sub.status);
        updated.status = SubscriptionStatus::Paused;
        updated.updated_at = now;
        if !self.store.update_subscription(&updated, sub.status).await? {
            return Err(conflict(user_id));
        }

        tracing::info!(user_id = %user_id, subscription_id = %sub.id, from = %sub.status, "Subscription paused");
        let mut event = BillingEventBuilder::new(user_id, BillingEventType::SubscriptionPaused)
            .data(serde_json::json!({ "subscription_id": sub.id, "from": sub.status }));
        if let Some(admin_id) = admin_id {
            event = event.actor(admin_id, ActorType::Admin);
        }
        self.events.record(event).await;

        Ok(updated)
    }

    /// Restore the state a paused subscription was in
    pub async fn resume(&self, user_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.require_latest(user_id).await?;
        if sub.status != SubscriptionStatus::Paused {
            if sub.grants_access() {
                return Ok(sub);
            }
            return Err(BillingError::InvalidTransition {
                status: sub.status,
                action: "resume",
            });
        }

        let now = self.clock.now();
        let mut updated = sub.clone();
        updated.status = sub
            .resume_status
            .filter(|s| !s.is_terminal() && *s != SubscriptionStatus::Paused)
            .unwrap_or(SubscriptionStatus::Active);
        updated.resume_status = None;
        updated.updated_at = now;
        if !self
            .store
            .update_subscription(&updated, SubscriptionStatus::Paused)
            .await?
        {
            return Err(conflict(user_id));
        }

        tracing::info!(user_id = %user_id, subscription_id = %sub.id, to = %updated.status, "Subscription resumed");
        self.events
            .record(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionResumed)
                    .data(serde_json::json!({ "subscription_id": sub.id, "to": updated.status })),
            )
            .await;

        Ok(updated)
    }

    // =========================================================================
    // Admin overrides
    // =========================================================================

    /// Grant unlimited access regardless of payment state
    pub async fn make_account_free(
        &self,
        user_id: Uuid,
        reason: &str,
        admin_id: Uuid,
    ) -> BillingResult<Subscription> {
        let now = self.clock.now();
        let latest = self.store.latest_subscription(user_id).await?;

        let sub = match latest {
            Some(sub) if !sub.status.is_terminal() => {
                let mut updated = sub.clone();
                updated.is_free = true;
                updated.free_reason = Some(reason.to_string());
                updated.past_due_since = None;
                updated.grace_ends_at = None;
                updated.updated_at = now;
                match sub.status {
                    SubscriptionStatus::Trial | SubscriptionStatus::PastDue => {
                        updated.status = SubscriptionStatus::Active;
                    }
                    SubscriptionStatus::Paused => {
                        updated.resume_status = Some(SubscriptionStatus::Active);
                    }
                    _ => {}
                }
                if !self.store.update_subscription(&updated, sub.status).await? {
                    return Err(conflict(user_id));
                }
                updated
            }
            previous => {
                let plan_id = match previous {
                    Some(prev) => prev.plan_id,
                    None => self.plans.trial_plan().await?.id,
                };
                let plan = self.plans.get(plan_id).await?;
                let sub = Subscription {
                    id: Uuid::new_v4(),
                    user_id,
                    plan_id,
                    status: SubscriptionStatus::Active,
                    resume_status: None,
                    billing_cycle: BillingCycle::Monthly,
                    current_price: 0,
                    currency: plan.currency,
                    current_period_start: now,
                    current_period_end: BillingCycle::Monthly.advance(now),
                    trial_ends_at: None,
                    next_billing_date: None,
                    cancel_at_period_end: false,
                    canceled_at: None,
                    past_due_since: None,
                    grace_ends_at: None,
                    is_free: true,
                    free_reason: Some(reason.to_string()),
                    provider_order_id: None,
                    provider_subscription_id: None,
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_subscription(&sub).await?;
                sub
            }
        };

        tracing::info!(user_id = %user_id, admin_id = %admin_id, reason = %reason, "Account marked free");
        self.events
            .record(
                BillingEventBuilder::new(user_id, BillingEventType::AdminOverride)
                    .actor(admin_id, ActorType::Admin)
                    .data(serde_json::json!({
                        "action": "make_free",
                        "subscription_id": sub.id,
                        "reason": reason,
                    })),
            )
            .await;

        Ok(sub)
    }

    pub async fn remove_free_status(&self, user_id: Uuid, admin_id: Uuid) -> BillingResult<Subscription> {
        let sub = self.require_latest(user_id).await?;
        if !sub.is_free {
            return Ok(sub);
        }

        let mut updated = sub.clone();
        updated.is_free = false;
        updated.free_reason = None;
        updated.updated_at = self.clock.now();
        if !self.store.update_subscription(&updated, sub.status).await? {
            return Err(conflict(user_id));
        }

        tracing::info!(user_id = %user_id, admin_id = %admin_id, "Free status removed");
        self.events
            .record(
                BillingEventBuilder::new(user_id, BillingEventType::AdminOverride)
                    .actor(admin_id, ActorType::Admin)
                    .data(serde_json::json!({
                        "action": "remove_free",
                        "subscription_id": sub.id,
                    })),
            )
            .await;

        Ok(updated)
    }

    // =========================================================================
    // Payment outcomes
    // =========================================================================

    async fn payment_target(&self, payment: &Payment) -> BillingResult<Option<Subscription>> {
        if let Some(id) = payment.subscription_id {
            if let Some(sub) = self.store.get_subscription(id).await? {
                if sub.user_id == payment.user_id && !sub.status.is_terminal() {
                    return Ok(Some(sub));
                }
            }
        }
        self.latest_open(payment.user_id).await
    }

    /// Bind the paid plan and extend the period by one cycle.
    ///
    /// Trial and past_due become active; a paused subscription stays paused
    /// but resumes as active. Without an open subscription a new one is opened.
    pub async fn apply_payment_success(
        &self,
        payment: &Payment,
        provider_subscription_id: Option<&str>,
    ) -> BillingResult<Subscription> {
        let order_id = payment
            .provider_payment_id
            .split(':')
            .next()
            .unwrap_or(&payment.provider_payment_id)
            .to_string();

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let now = self.clock.now();
            let target = self.payment_target(payment).await?;
            let plan_id = payment
                .plan_id
                .or(target.as_ref().map(|s| s.plan_id))
                .ok_or_else(|| {
                    BillingError::InvalidInput(format!(
                        "payment {} carries no plan",
                        payment.provider_payment_id
                    ))
                })?;
            let cycle = payment
                .billing_cycle
                .or(target.as_ref().map(|s| s.billing_cycle))
                .unwrap_or_default();

            let Some(sub) = target else {
                let fresh = Subscription {
                    id: Uuid::new_v4(),
                    user_id: payment.user_id,
                    plan_id,
                    status: SubscriptionStatus::Active,
                    resume_status: None,
                    billing_cycle: cycle,
                    current_price: payment.amount,
                    currency: payment.currency.clone(),
                    current_period_start: now,
                    current_period_end: cycle.advance(now),
                    trial_ends_at: None,
                    next_billing_date: Some(cycle.advance(now)),
                    cancel_at_period_end: false,
                    canceled_at: None,
                    past_due_since: None,
                    grace_ends_at: None,
                    is_free: false,
                    free_reason: None,
                    provider_order_id: Some(order_id.clone()),
                    provider_subscription_id: provider_subscription_id.map(str::to_string),
                    created_at: now,
                    updated_at: now,
                };
                match self.store.insert_subscription(&fresh).await {
                    Ok(()) => {
                        self.after_activation(&fresh, None, payment).await;
                        return Ok(fresh);
                    }
                    Err(BillingError::Duplicate(_)) => continue,
                    Err(e) => return Err(e),
                }
            };

            let base = if sub.status == SubscriptionStatus::Trial {
                now
            } else {
                sub.current_period_end.max(now)
            };
            let period_end = cycle.advance(base);

            let mut updated = sub.clone();
            if sub.status == SubscriptionStatus::Paused {
                updated.resume_status = Some(SubscriptionStatus::Active);
            } else {
                updated.status = SubscriptionStatus::Active;
            }
            updated.plan_id = plan_id;
            updated.billing_cycle = cycle;
            updated.current_price = payment.amount;
            updated.currency = payment.currency.clone();
            updated.current_period_start = base;
            updated.current_period_end = period_end;
            updated.next_billing_date = Some(period_end);
            updated.past_due_since = None;
            updated.grace_ends_at = None;
            updated.provider_order_id = Some(order_id.clone());
            if let Some(id) = provider_subscription_id {
                updated.provider_subscription_id = Some(id.to_string());
            }
            updated.updated_at = now;

            if self.store.update_subscription(&updated, sub.status).await? {
                self.after_activation(&updated, Some(sub.status), payment).await;
                return Ok(updated);
            }
        }

        Err(conflict(payment.user_id))
    }

    async fn after_activation(
        &self,
        sub: &Subscription,
        previous: Option<SubscriptionStatus>,
        payment: &Payment,
    ) {
        let now = self.clock.now();
        match self.store.resolve_retries(sub.id, now).await {
            Ok(resolved) if resolved > 0 => {
                tracing::info!(subscription_id = %sub.id, resolved = resolved, "Payment retries resolved");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(subscription_id = %sub.id, error = %e, "Failed to resolve payment retries");
            }
        }

        let event_type = match previous {
            Some(SubscriptionStatus::Active) => BillingEventType::SubscriptionRenewed,
            _ => BillingEventType::SubscriptionActivated,
        };
        tracing::info!(
            user_id = %sub.user_id,
            subscription_id = %sub.id,
            previous = ?previous,
            period_end = %sub.current_period_end,
            "Subscription paid"
        );
        self.events
            .record(
                BillingEventBuilder::new(sub.user_id, event_type)
                    .order(payment.provider_payment_id.clone())
                    .actor_type(ActorType::Gateway)
                    .data(serde_json::json!({
                        "subscription_id": sub.id,
                        "plan_id": sub.plan_id,
                        "billing_cycle": sub.billing_cycle,
                        "period_end": sub.current_period_end,
                        "amount": payment.amount,
                    })),
            )
            .await;
    }

    /// Move an active subscription to past_due and start its grace period.
    /// Returns the subscription the failure applies to.
    pub async fn apply_payment_failure(&self, payment: &Payment) -> BillingResult<Option<Subscription>> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(sub) = self.payment_target(payment).await? else {
                return Ok(None);
            };
            if sub.status != SubscriptionStatus::Active || sub.is_free {
                return Ok(Some(sub));
            }

            let now = self.clock.now();
            let mut updated = sub.clone();
            updated.status = SubscriptionStatus::PastDue;
            updated.past_due_since = Some(now);
            updated.grace_ends_at = Some(now + Duration::days(self.config.grace_period_days));
            updated.updated_at = now;

            if self
                .store
                .update_subscription(&updated, SubscriptionStatus::Active)
                .await?
            {
                tracing::warn!(
                    user_id = %sub.user_id,
                    subscription_id = %sub.id,
                    grace_ends_at = ?updated.grace_ends_at,
                    "Subscription past due"
                );
                return Ok(Some(updated));
            }
        }

        Err(conflict(payment.user_id))
    }
}

fn conflict(user_id: Uuid) -> BillingError {
    BillingError::Database(format!(
        "subscription of user {} changed concurrently",
        user_id
    ))
}
