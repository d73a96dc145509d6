//! In-memory ledger (for tests and development without Postgres)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;
use whatsflow_shared::{
    ApiKey, CreditTransaction, Payment, PaymentRetry, PaymentStatus, Plan, Resource, RetryStatus,
    Subscription, SubscriptionStatus, UsageStats,
};

use super::{CreditEntry, LedgerStore};
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;

#[derive(Default)]
struct State {
    plans: HashMap<Uuid, Plan>,
    subscriptions: Vec<Subscription>,
    usage: Vec<UsageStats>,
    payments: Vec<Payment>,
    retries: Vec<PaymentRetry>,
    balances: HashMap<Uuid, i64>,
    credit_transactions: Vec<CreditTransaction>,
    api_keys: Vec<ApiKey>,
    events: Vec<BillingEvent>,
    invoice_sequence: i64,
}

/// Ledger kept behind a single lock. Every trait method is atomic with respect to the others.
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<State>,
    unavailable: AtomicBool,
    failing_writes: Mutex<Vec<&'static str>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a database error, simulating an outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next call to the named write method with a database error.
    /// Covers `insert_subscription`, `update_subscription`, `insert_payment`,
    /// `update_payment` and `apply_credit`.
    pub fn fail_next_write(&self, method: &'static str) {
        if let Ok(mut failing) = self.failing_writes.lock() {
            failing.push(method);
        }
    }

    fn check_available(&self) -> BillingResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BillingError::Database("ledger unavailable".to_string()));
        }
        Ok(())
    }

    fn check_write(&self, method: &'static str) -> BillingResult<()> {
        self.check_available()?;
        if let Ok(mut failing) = self.failing_writes.lock() {
            if let Some(pos) = failing.iter().position(|m| *m == method) {
                failing.remove(pos);
                return Err(BillingError::Database(format!("{method} failed")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn list_plans(&self, include_inactive: bool) -> BillingResult<Vec<Plan>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut plans: Vec<Plan> = state
            .plans
            .values()
            .filter(|p| include_inactive || p.is_active)
            .cloned()
            .collect();
        plans.sort_by_key(|p| (p.display_order, p.created_at));
        Ok(plans)
    }

    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        self.check_available()?;
        Ok(self.state.read().await.plans.get(&id).cloned())
    }

    async fn get_plan_by_slug(&self, slug: &str) -> BillingResult<Option<Plan>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.plans.values().find(|p| p.slug == slug).cloned())
    }

    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state
            .plans
            .values()
            .any(|p| p.id == plan.id || p.slug == plan.slug)
        {
            return Err(BillingError::Duplicate("plans_slug_key".to_string()));
        }
        state.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        match state.plans.get_mut(&plan.id) {
            Some(existing) => {
                *existing = plan.clone();
                Ok(())
            }
            None => Err(BillingError::NotFound(format!("plan {}", plan.id))),
        }
    }

    async fn latest_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        self.check_available()?;
        let state = self.state.read().await;
        // Later inserts win ties on created_at
        Ok(state
            .subscriptions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.user_id == user_id)
            .max_by_key(|(idx, s)| (s.created_at, *idx))
            .map(|(_, s)| s.clone()))
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.subscriptions.iter().find(|s| s.id == id).cloned())
    }

    async fn find_subscription_by_order(
        &self,
        order_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .iter()
            .rev()
            .find(|s| s.provider_order_id.as_deref() == Some(order_id))
            .cloned())
    }

    async fn has_used_trial(&self, user_id: Uuid) -> BillingResult<bool> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .iter()
            .any(|s| s.user_id == user_id && s.trial_ends_at.is_some()))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        self.check_write("insert_subscription")?;
        let mut state = self.state.write().await;
        let has_open = state
            .subscriptions
            .iter()
            .any(|s| s.user_id == subscription.user_id && !s.status.is_terminal());
        if has_open && !subscription.status.is_terminal() {
            return Err(BillingError::Duplicate(
                "subscriptions_one_open_per_user".to_string(),
            ));
        }
        state.subscriptions.push(subscription.clone());
        Ok(())
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected: SubscriptionStatus,
    ) -> BillingResult<bool> {
        self.check_write("update_subscription")?;
        let mut state = self.state.write().await;
        match state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription.id)
        {
            Some(existing) if existing.status == expected => {
                *existing = subscription.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BillingError::NotFound(format!(
                "subscription {}",
                subscription.id
            ))),
        }
    }

    async fn subscriptions_due(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|s| !s.status.is_terminal() && s.status != SubscriptionStatus::Paused)
            .filter(|s| {
                let trial_due = s.status == SubscriptionStatus::Trial
                    && s.trial_ends_at.is_some_and(|t| t <= now);
                let period_due = s.cancel_at_period_end && s.current_period_end <= now;
                let grace_due = s.status == SubscriptionStatus::PastDue
                    && s.grace_ends_at.is_some_and(|g| g <= now);
                trial_due || period_due || grace_due
            })
            .cloned()
            .collect())
    }

    async fn current_usage(&self, subscription_id: Uuid) -> BillingResult<Option<UsageStats>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .usage
            .iter()
            .filter(|u| u.subscription_id == subscription_id && u.is_current)
            .max_by_key(|u| u.period_start)
            .cloned())
    }

    async fn open_usage_period(&self, usage: &UsageStats) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.usage.iter().any(|u| {
            u.subscription_id == usage.subscription_id && u.period_start == usage.period_start
        }) {
            return Err(BillingError::Duplicate(
                "usage_stats_subscription_id_period_start_key".to_string(),
            ));
        }
        state.usage.push(usage.clone());
        Ok(())
    }

    async fn increment_usage(
        &self,
        usage_id: Uuid,
        resource: Resource,
        delta: i64,
    ) -> BillingResult<i64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let row = state
            .usage
            .iter_mut()
            .find(|u| u.id == usage_id)
            .ok_or_else(|| BillingError::NotFound(format!("usage {}", usage_id)))?;
        let counter = row.get_mut(resource);
        *counter = (*counter + delta).max(0);
        Ok(*counter)
    }

    async fn close_usage_period(&self, closed: &UsageStats) -> BillingResult<bool> {
        self.check_available()?;
        let mut state = self.state.write().await;
        match state
            .usage
            .iter_mut()
            .find(|u| u.id == closed.id && u.is_current)
        {
            Some(row) => {
                row.messages_overage = closed.messages_overage;
                row.ai_messages_overage = closed.ai_messages_overage;
                row.overage_amount = closed.overage_amount;
                row.overage_credits_used = closed.overage_credits_used;
                row.is_current = false;
                row.updated_at = closed.updated_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reopen_usage_period(&self, usage_id: Uuid) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(row) = state.usage.iter_mut().find(|u| u.id == usage_id) {
            row.is_current = true;
        }
        Ok(())
    }

    async fn set_overage_credits_used(&self, usage_id: Uuid, amount: i64) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(row) = state.usage.iter_mut().find(|u| u.id == usage_id) {
            row.overage_credits_used = amount;
        }
        Ok(())
    }

    async fn stale_usage_periods(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<UsageStats>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut stale: Vec<UsageStats> = state
            .usage
            .iter()
            .filter(|u| u.is_current && u.period_end <= now)
            .cloned()
            .collect();
        stale.sort_by_key(|u| u.period_end);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn insert_payment(&self, payment: &Payment) -> BillingResult<bool> {
        self.check_write("insert_payment")?;
        let mut state = self.state.write().await;
        if state
            .payments
            .iter()
            .any(|p| p.provider_payment_id == payment.provider_payment_id)
        {
            return Ok(false);
        }
        state.payments.push(payment.clone());
        Ok(true)
    }

    async fn get_payment(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn find_payment_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .payments
            .iter()
            .find(|p| p.provider_payment_id == provider_payment_id)
            .cloned())
    }

    async fn update_payment(
        &self,
        payment: &Payment,
        from: &[PaymentStatus],
    ) -> BillingResult<bool> {
        self.check_write("update_payment")?;
        let mut state = self.state.write().await;
        match state.payments.iter_mut().find(|p| p.id == payment.id) {
            Some(existing) if from.contains(&existing.status) => {
                *existing = payment.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BillingError::NotFound(format!("payment {}", payment.id))),
        }
    }

    async fn list_payments(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<Payment>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        payments.truncate(limit.max(0) as usize);
        Ok(payments)
    }

    async fn next_invoice_sequence(&self) -> BillingResult<i64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        state.invoice_sequence += 1;
        Ok(state.invoice_sequence)
    }

    async fn insert_retry(&self, retry: &PaymentRetry) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.retries.iter().any(|r| {
            r.payment_id == retry.payment_id && r.attempt_number == retry.attempt_number
        }) {
            return Err(BillingError::Duplicate(
                "payment_retries_payment_id_attempt_number_key".to_string(),
            ));
        }
        state.retries.push(retry.clone());
        Ok(())
    }

    async fn count_open_retries(&self, subscription_id: Uuid) -> BillingResult<i64> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .retries
            .iter()
            .filter(|r| r.subscription_id == subscription_id && r.status != RetryStatus::Succeeded)
            .count() as i64)
    }

    async fn due_retries(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<PaymentRetry>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut due: Vec<PaymentRetry> = state
            .retries
            .iter()
            .filter(|r| r.status == RetryStatus::Pending && r.next_retry_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_retry_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        status: RetryStatus,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(retry) = state.retries.iter_mut().find(|r| r.id == id) {
            retry.status = status;
            retry.attempted_at = Some(at);
        }
        Ok(())
    }

    async fn resolve_retries(
        &self,
        subscription_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let mut resolved = 0;
        for retry in state.retries.iter_mut().filter(|r| {
            r.subscription_id == subscription_id
                && r.status != RetryStatus::Succeeded
        }) {
            retry.status = RetryStatus::Succeeded;
            retry.attempted_at = Some(at);
            resolved += 1;
        }
        Ok(resolved)
    }

    async fn credit_balance(&self, user_id: Uuid) -> BillingResult<i64> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .await
            .balances
            .get(&user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn apply_credit(&self, entry: &CreditEntry) -> BillingResult<Option<CreditTransaction>> {
        self.check_write("apply_credit")?;
        let mut state = self.state.write().await;
        let balance = state.balances.get(&entry.user_id).copied().unwrap_or(0);
        let next = balance + entry.amount;
        if next < 0 {
            return Ok(None);
        }
        state.balances.insert(entry.user_id, next);

        let txn = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            amount: entry.amount,
            transaction_type: entry.transaction_type,
            description: entry.description.clone(),
            reference_id: entry.reference_id,
            balance_after: next,
            created_at: entry.created_at,
        };
        state.credit_transactions.push(txn.clone());
        Ok(Some(txn))
    }

    async fn list_credit_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .credit_transactions
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn credits_debited_for(&self, user_id: Uuid, reference_id: Uuid) -> BillingResult<i64> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .credit_transactions
            .iter()
            .filter(|t| {
                t.user_id == user_id && t.reference_id == Some(reference_id) && t.amount < 0
            })
            .map(|t| -t.amount)
            .sum())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> BillingResult<Option<ApiKey>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .api_keys
            .iter()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }

    async fn insert_api_key(&self, key: &ApiKey) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.api_keys.iter().any(|k| k.key_hash == key.key_hash) {
            return Err(BillingError::Duplicate("api_keys_key_hash_key".to_string()));
        }
        state.api_keys.push(key.clone());
        Ok(())
    }

    async fn record_api_key_use(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if let Some(key) = state.api_keys.iter_mut().find(|k| k.id == id) {
            key.requests_count += 1;
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn insert_billing_event(&self, event: &BillingEvent) -> BillingResult<()> {
        self.check_available()?;
        self.state.write().await.events.push(event.clone());
        Ok(())
    }

    async fn list_billing_events(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
