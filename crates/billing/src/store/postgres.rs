//! Postgres ledger

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;
use whatsflow_shared::{
    ApiKey, CreditTransaction, Payment, PaymentRetry, PaymentStatus, Plan, Resource, RetryStatus,
    Subscription, SubscriptionStatus, UsageStats,
};

use super::{CreditEntry, LedgerStore};
use crate::error::BillingResult;
use crate::events::BillingEvent;

const PLAN_COLUMNS: &str = "id, name, slug, description, price_monthly, price_annual, currency, \
     features, limits, allow_overage, is_active, display_order, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, status, resume_status, billing_cycle, \
     current_price, currency, current_period_start, current_period_end, trial_ends_at, \
     next_billing_date, cancel_at_period_end, canceled_at, past_due_since, grace_ends_at, \
     is_free, free_reason, provider_order_id, provider_subscription_id, created_at, updated_at";

const USAGE_COLUMNS: &str = "id, user_id, subscription_id, period_start, period_end, \
     devices_used, contacts_count, messages_sent, ai_messages_count, broadcasts_sent, \
     pages_scraped, messages_overage, ai_messages_overage, overage_amount, \
     overage_credits_used, is_current, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, user_id, subscription_id, plan_id, billing_cycle, kind, \
     amount, currency, status, provider_payment_id, provider_reference, description, \
     invoice_number, invoice_url, failure_reason, refund_reason, attempted_at, paid_at, \
     refunded_at, created_at";

const RETRY_COLUMNS: &str =
    "id, payment_id, subscription_id, attempt_number, status, next_retry_at, attempted_at, created_at";

const API_KEY_COLUMNS: &str = "id, business_profile_id, name, key_hash, key_prefix, \
     rate_limit_tier, scopes, is_active, requests_count, last_used_at, created_at";

/// Ledger backed by the billing schema in `migrations/`
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn list_plans(&self, include_inactive: bool) -> BillingResult<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE is_active OR $1 ORDER BY display_order, created_at"
        ))
        .bind(include_inactive)
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    async fn get_plan(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    async fn get_plan_by_slug(&self, slug: &str) -> BillingResult<Option<Plan>> {
        let plan =
            sqlx::query_as::<_, Plan>(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE slug = $1"))
                .bind(slug)
                .fetch_optional(&self.pool)
                .await?;
        Ok(plan)
    }

    async fn insert_plan(&self, plan: &Plan) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (
                id, name, slug, description, price_monthly, price_annual, currency,
                features, limits, allow_overage, is_active, display_order, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(&plan.slug)
        .bind(&plan.description)
        .bind(plan.price_monthly)
        .bind(plan.price_annual)
        .bind(&plan.currency)
        .bind(Json(&plan.features))
        .bind(Json(&plan.limits))
        .bind(plan.allow_overage)
        .bind(plan.is_active)
        .bind(plan.display_order)
        .bind(plan.created_at)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_plan(&self, plan: &Plan) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE plans
            SET name = $2, description = $3, price_monthly = $4, price_annual = $5,
                currency = $6, features = $7, limits = $8, allow_overage = $9,
                is_active = $10, display_order = $11, updated_at = $12
            WHERE id = $1
            "#,
        )
        .bind(plan.id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price_monthly)
        .bind(plan.price_annual)
        .bind(&plan.currency)
        .bind(Json(&plan.features))
        .bind(Json(&plan.limits))
        .bind(plan.allow_overage)
        .bind(plan.is_active)
        .bind(plan.display_order)
        .bind(plan.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::error::BillingError::NotFound(format!("plan {}", plan.id)));
        }
        Ok(())
    }

    async fn latest_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE user_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn find_subscription_by_order(
        &self,
        order_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE provider_order_id = $1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn has_used_trial(&self, user_id: Uuid) -> BillingResult<bool> {
        let used: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM subscriptions WHERE user_id = $1 AND trial_ends_at IS NOT NULL)",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(used)
    }

    async fn insert_subscription(&self, sub: &Subscription) -> BillingResult<()> {
        sqlx::query(&format!(
            "INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                     $17, $18, $19, $20, $21, $22)"
        ))
        .bind(sub.id)
        .bind(sub.user_id)
        .bind(sub.plan_id)
        .bind(sub.status)
        .bind(sub.resume_status)
        .bind(sub.billing_cycle)
        .bind(sub.current_price)
        .bind(&sub.currency)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_ends_at)
        .bind(sub.next_billing_date)
        .bind(sub.cancel_at_period_end)
        .bind(sub.canceled_at)
        .bind(sub.past_due_since)
        .bind(sub.grace_ends_at)
        .bind(sub.is_free)
        .bind(&sub.free_reason)
        .bind(&sub.provider_order_id)
        .bind(&sub.provider_subscription_id)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_subscription(
        &self,
        sub: &Subscription,
        expected: SubscriptionStatus,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan_id = $3, status = $4, resume_status = $5, billing_cycle = $6,
                current_price = $7, currency = $8, current_period_start = $9,
                current_period_end = $10, trial_ends_at = $11, next_billing_date = $12,
                cancel_at_period_end = $13, canceled_at = $14, past_due_since = $15,
                grace_ends_at = $16, is_free = $17, free_reason = $18,
                provider_order_id = $19, provider_subscription_id = $20, updated_at = $21
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(sub.id)
        .bind(expected)
        .bind(sub.plan_id)
        .bind(sub.status)
        .bind(sub.resume_status)
        .bind(sub.billing_cycle)
        .bind(sub.current_price)
        .bind(&sub.currency)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.trial_ends_at)
        .bind(sub.next_billing_date)
        .bind(sub.cancel_at_period_end)
        .bind(sub.canceled_at)
        .bind(sub.past_due_since)
        .bind(sub.grace_ends_at)
        .bind(sub.is_free)
        .bind(&sub.free_reason)
        .bind(&sub.provider_order_id)
        .bind(&sub.provider_subscription_id)
        .bind(sub.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn subscriptions_due(&self, now: OffsetDateTime) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE status NOT IN ('canceled', 'expired', 'paused')
               AND ((status = 'trial' AND trial_ends_at <= $1)
                 OR (cancel_at_period_end AND current_period_end <= $1)
                 OR (status = 'past_due' AND grace_ends_at <= $1))
             ORDER BY created_at"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn current_usage(&self, subscription_id: Uuid) -> BillingResult<Option<UsageStats>> {
        let usage = sqlx::query_as::<_, UsageStats>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_stats
             WHERE subscription_id = $1 AND is_current
             ORDER BY period_start DESC LIMIT 1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(usage)
    }

    async fn open_usage_period(&self, u: &UsageStats) -> BillingResult<()> {
        sqlx::query(&format!(
            "INSERT INTO usage_stats ({USAGE_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        ))
        .bind(u.id)
        .bind(u.user_id)
        .bind(u.subscription_id)
        .bind(u.period_start)
        .bind(u.period_end)
        .bind(u.devices_used)
        .bind(u.contacts_count)
        .bind(u.messages_sent)
        .bind(u.ai_messages_count)
        .bind(u.broadcasts_sent)
        .bind(u.pages_scraped)
        .bind(u.messages_overage)
        .bind(u.ai_messages_overage)
        .bind(u.overage_amount)
        .bind(u.overage_credits_used)
        .bind(u.is_current)
        .bind(u.created_at)
        .bind(u.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_usage(
        &self,
        usage_id: Uuid,
        resource: Resource,
        delta: i64,
    ) -> BillingResult<i64> {
        // Column names come from a closed enum, never from input
        let column = resource.column();
        let value: i64 = sqlx::query_scalar(&format!(
            "UPDATE usage_stats SET {column} = GREATEST({column} + $2, 0), updated_at = NOW()
             WHERE id = $1 RETURNING {column}"
        ))
        .bind(usage_id)
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn close_usage_period(&self, closed: &UsageStats) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE usage_stats
            SET messages_overage = $2, ai_messages_overage = $3, overage_amount = $4,
                overage_credits_used = $5, is_current = FALSE, updated_at = $6
            WHERE id = $1 AND is_current
            "#,
        )
        .bind(closed.id)
        .bind(closed.messages_overage)
        .bind(closed.ai_messages_overage)
        .bind(closed.overage_amount)
        .bind(closed.overage_credits_used)
        .bind(closed.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reopen_usage_period(&self, usage_id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE usage_stats SET is_current = TRUE WHERE id = $1")
            .bind(usage_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_overage_credits_used(&self, usage_id: Uuid, amount: i64) -> BillingResult<()> {
        sqlx::query("UPDATE usage_stats SET overage_credits_used = $2 WHERE id = $1")
            .bind(usage_id)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stale_usage_periods(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<UsageStats>> {
        let rows = sqlx::query_as::<_, UsageStats>(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_stats
             WHERE is_current AND period_end <= $1
             ORDER BY period_end LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_payment(&self, p: &Payment) -> BillingResult<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO payments ({PAYMENT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                     $18, $19, $20)
             ON CONFLICT (provider_payment_id) DO NOTHING"
        ))
        .bind(p.id)
        .bind(p.user_id)
        .bind(p.subscription_id)
        .bind(p.plan_id)
        .bind(p.billing_cycle)
        .bind(p.kind)
        .bind(p.amount)
        .bind(&p.currency)
        .bind(p.status)
        .bind(&p.provider_payment_id)
        .bind(&p.provider_reference)
        .bind(&p.description)
        .bind(&p.invoice_number)
        .bind(&p.invoice_url)
        .bind(&p.failure_reason)
        .bind(&p.refund_reason)
        .bind(p.attempted_at)
        .bind(p.paid_at)
        .bind(p.refunded_at)
        .bind(p.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_payment(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn find_payment_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE provider_payment_id = $1"
        ))
        .bind(provider_payment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn update_payment(&self, p: &Payment, from: &[PaymentStatus]) -> BillingResult<bool> {
        let from: Vec<String> = from.iter().map(|s| s.to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET subscription_id = $3, status = $4, provider_reference = $5,
                invoice_number = $6, invoice_url = $7, failure_reason = $8,
                refund_reason = $9, attempted_at = $10, paid_at = $11, refunded_at = $12
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(p.id)
        .bind(&from)
        .bind(p.subscription_id)
        .bind(p.status)
        .bind(&p.provider_reference)
        .bind(&p.invoice_number)
        .bind(&p.invoice_url)
        .bind(&p.failure_reason)
        .bind(&p.refund_reason)
        .bind(p.attempted_at)
        .bind(p.paid_at)
        .bind(p.refunded_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_payments(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn next_invoice_sequence(&self) -> BillingResult<i64> {
        let seq: i64 = sqlx::query_scalar("SELECT nextval('invoice_number_seq')")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    async fn insert_retry(&self, r: &PaymentRetry) -> BillingResult<()> {
        sqlx::query(&format!(
            "INSERT INTO payment_retries ({RETRY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(r.id)
        .bind(r.payment_id)
        .bind(r.subscription_id)
        .bind(r.attempt_number)
        .bind(r.status)
        .bind(r.next_retry_at)
        .bind(r.attempted_at)
        .bind(r.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_open_retries(&self, subscription_id: Uuid) -> BillingResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM payment_retries WHERE subscription_id = $1 AND status <> 'succeeded'",
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn due_retries(&self, now: OffsetDateTime, limit: i64) -> BillingResult<Vec<PaymentRetry>> {
        let retries = sqlx::query_as::<_, PaymentRetry>(&format!(
            "SELECT {RETRY_COLUMNS} FROM payment_retries
             WHERE status = 'pending' AND next_retry_at <= $1
             ORDER BY next_retry_at LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(retries)
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        status: RetryStatus,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE payment_retries SET status = $2, attempted_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn resolve_retries(
        &self,
        subscription_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payment_retries SET status = 'succeeded', attempted_at = $2
            WHERE subscription_id = $1 AND status <> 'succeeded'
            "#,
        )
        .bind(subscription_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn credit_balance(&self, user_id: Uuid) -> BillingResult<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM user_credits WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }

    async fn apply_credit(&self, entry: &CreditEntry) -> BillingResult<Option<CreditTransaction>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO user_credits (user_id, balance) VALUES ($1, 0) ON CONFLICT (user_id) DO NOTHING")
            .bind(entry.user_id)
            .execute(&mut *tx)
            .await?;

        // Conditional update keeps the balance non-negative under concurrent deductions
        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE user_credits SET balance = balance + $2, updated_at = $3
            WHERE user_id = $1 AND balance + $2 >= 0
            RETURNING balance
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.amount)
        .bind(entry.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance_after) = balance else {
            tx.rollback().await?;
            return Ok(None);
        };

        let txn = sqlx::query_as::<_, CreditTransaction>(
            r#"
            INSERT INTO credit_transactions (
                id, user_id, amount, transaction_type, description, reference_id,
                balance_after, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, user_id, amount, transaction_type, description, reference_id,
                      balance_after, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(entry.amount)
        .bind(entry.transaction_type)
        .bind(&entry.description)
        .bind(entry.reference_id)
        .bind(balance_after)
        .bind(entry.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(txn))
    }

    async fn list_credit_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let txns = sqlx::query_as::<_, CreditTransaction>(
            r#"
            SELECT id, user_id, amount, transaction_type, description, reference_id,
                   balance_after, created_at
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(txns)
    }

    async fn credits_debited_for(&self, user_id: Uuid, reference_id: Uuid) -> BillingResult<i64> {
        let debited: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(-SUM(amount), 0)::BIGINT FROM credit_transactions
            WHERE user_id = $1 AND reference_id = $2 AND amount < 0
            "#,
        )
        .bind(user_id)
        .bind(reference_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(debited)
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> BillingResult<Option<ApiKey>> {
        let key = sqlx::query_as::<_, ApiKey>(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_hash = $1"
        ))
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    async fn insert_api_key(&self, k: &ApiKey) -> BillingResult<()> {
        sqlx::query(&format!(
            "INSERT INTO api_keys ({API_KEY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ))
        .bind(k.id)
        .bind(k.business_profile_id)
        .bind(&k.name)
        .bind(&k.key_hash)
        .bind(&k.key_prefix)
        .bind(k.rate_limit_tier)
        .bind(&k.scopes)
        .bind(k.is_active)
        .bind(k.requests_count)
        .bind(k.last_used_at)
        .bind(k.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_api_key_use(&self, id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        sqlx::query(
            "UPDATE api_keys SET requests_count = requests_count + 1, last_used_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_billing_event(&self, e: &BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (
                id, user_id, event_type, event_data, provider_order_id, actor_id, actor_type, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(e.id)
        .bind(e.user_id)
        .bind(&e.event_type)
        .bind(&e.event_data)
        .bind(&e.provider_order_id)
        .bind(e.actor_id)
        .bind(&e.actor_type)
        .bind(e.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_billing_events(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events = sqlx::query_as::<_, BillingEvent>(
            r#"
            SELECT id, user_id, event_type, event_data, provider_order_id, actor_id, actor_type, created_at
            FROM billing_events
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whatsflow_shared::CreditTransactionType;

    async fn ledger() -> PgLedger {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = whatsflow_shared::create_pool(&url, 2).await.unwrap();
        whatsflow_shared::run_migrations(&pool).await.unwrap();
        PgLedger::new(pool)
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_seeded_trial_plan() {
        let ledger = ledger().await;
        let plan = ledger.get_plan_by_slug("trial").await.unwrap().unwrap();
        assert_eq!(plan.price_monthly, 0);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_apply_credit_never_goes_negative() {
        let ledger = ledger().await;
        let user = Uuid::new_v4();
        let entry = |amount| CreditEntry {
            user_id: user,
            amount,
            transaction_type: CreditTransactionType::Adjustment,
            description: "test".into(),
            reference_id: None,
            created_at: OffsetDateTime::now_utc(),
        };
        assert!(ledger.apply_credit(&entry(100)).await.unwrap().is_some());
        assert!(ledger.apply_credit(&entry(-101)).await.unwrap().is_none());
        assert_eq!(ledger.credit_balance(user).await.unwrap(), 100);
    }
}
