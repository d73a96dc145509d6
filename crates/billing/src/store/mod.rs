//! Ledger store: durable billing state
//!
//! Every service in this crate talks to the ledger through [`LedgerStore`].
//! [`PgLedger`] is the production implementation; [`MemoryLedger`] backs
//! tests and local development.
//!
//! Implementations must make the following operations atomic:
//! - `insert_payment` is a no-op returning `false` for a known `provider_payment_id`
//! - `update_subscription` and `update_payment` only apply when the stored status matches
//! - `increment_usage` adds to the stored counter, never overwrites it
//! - `apply_credit` moves the balance and appends the entry together, refusing to go negative

mod memory;
mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;
use whatsflow_shared::{
    ApiKey, CreditTransaction, CreditTransactionType, Payment, PaymentRetry, PaymentStatus, Plan,
    Resource, RetryStatus, Subscription, SubscriptionStatus, UsageStats,
};

use crate::error::BillingResult;
use crate::events::BillingEvent;

/// A credit movement to append
#[derive(Debug, Clone)]
pub struct CreditEntry {
    pub user_id: Uuid,
    /// Signed amount in minor units
    pub amount: i64,
    pub transaction_type: CreditTransactionType,
    pub description: String,
    pub reference_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Plans

    async fn list_plans(&self, include_inactive: bool) -> BillingResult<Vec<Plan>>;
    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>>;
    async fn get_plan_by_slug(&self, slug: &str) -> BillingResult<Option<Plan>>;
    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()>;
    async fn update_plan(&self, plan: &Plan) -> BillingResult<()>;

    // Subscriptions

    /// Most recently created subscription for the user, terminal or not
    async fn latest_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;
    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;
    async fn find_subscription_by_order(&self, order_id: &str)
        -> BillingResult<Option<Subscription>>;
    /// Whether any subscription of this user ever carried a trial
    async fn has_used_trial(&self, user_id: Uuid) -> BillingResult<bool>;
    /// Fails with `Duplicate` when the user already has a non-terminal subscription
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()>;
    /// Save `subscription` only if the stored status is still `expected`
    async fn update_subscription(
        &self,
        subscription: &Subscription,
        expected: SubscriptionStatus,
    ) -> BillingResult<bool>;
    /// Non-terminal subscriptions with a trial, period or grace deadline at or before `now`
    async fn subscriptions_due(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>>;

    // Usage

    async fn current_usage(&self, subscription_id: Uuid) -> BillingResult<Option<UsageStats>>;
    /// Fails with `Duplicate` when a row for the same period start exists
    async fn open_usage_period(&self, usage: &UsageStats) -> BillingResult<()>;
    /// Add `delta` to one counter, clamped at zero. Returns the new value.
    async fn increment_usage(
        &self,
        usage_id: Uuid,
        resource: Resource,
        delta: i64,
    ) -> BillingResult<i64>;
    /// Persist overage figures and mark the row superseded. `false` if it was already closed.
    async fn close_usage_period(&self, closed: &UsageStats) -> BillingResult<bool>;
    /// Undo a close whose billing did not complete, so the period is picked up again
    async fn reopen_usage_period(&self, usage_id: Uuid) -> BillingResult<()>;
    async fn set_overage_credits_used(&self, usage_id: Uuid, amount: i64) -> BillingResult<()>;
    /// Current rows whose period ended at or before `now`
    async fn stale_usage_periods(&self, now: OffsetDateTime, limit: i64)
        -> BillingResult<Vec<UsageStats>>;

    // Payments

    /// `false` when a payment with the same `provider_payment_id` already exists
    async fn insert_payment(&self, payment: &Payment) -> BillingResult<bool>;
    async fn get_payment(&self, id: Uuid) -> BillingResult<Option<Payment>>;
    async fn find_payment_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>>;
    /// Save `payment` only if the stored status is one of `from`
    async fn update_payment(&self, payment: &Payment, from: &[PaymentStatus])
        -> BillingResult<bool>;
    async fn list_payments(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<Payment>>;
    async fn next_invoice_sequence(&self) -> BillingResult<i64>;

    // Payment retries

    async fn insert_retry(&self, retry: &PaymentRetry) -> BillingResult<()>;
    /// Retries scheduled for the subscription that have not been resolved by a payment
    async fn count_open_retries(&self, subscription_id: Uuid) -> BillingResult<i64>;
    async fn due_retries(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<PaymentRetry>>;
    async fn mark_retry(&self, id: Uuid, status: RetryStatus, at: OffsetDateTime)
        -> BillingResult<()>;
    /// Mark every retry of the subscription that has not succeeded, failed ones
    /// included, as succeeded
    async fn resolve_retries(&self, subscription_id: Uuid, at: OffsetDateTime)
        -> BillingResult<u64>;

    // Credits

    async fn credit_balance(&self, user_id: Uuid) -> BillingResult<i64>;
    /// `None` without any mutation when the entry would take the balance below zero
    async fn apply_credit(&self, entry: &CreditEntry) -> BillingResult<Option<CreditTransaction>>;
    async fn list_credit_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>>;
    /// Total already deducted from the balance against `reference_id`
    async fn credits_debited_for(&self, user_id: Uuid, reference_id: Uuid) -> BillingResult<i64>;

    // API keys

    async fn find_api_key_by_hash(&self, key_hash: &str) -> BillingResult<Option<ApiKey>>;
    async fn insert_api_key(&self, key: &ApiKey) -> BillingResult<()>;
    async fn record_api_key_use(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()>;

    // Audit

    async fn insert_billing_event(&self, event: &BillingEvent) -> BillingResult<()>;
    async fn list_billing_events(&self, user_id: Uuid, limit: i64)
        -> BillingResult<Vec<BillingEvent>>;
}
