//! Common types used across WhatsFlow billing

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::ParseError;

// =============================================================================
// Enums
// =============================================================================

/// Lifecycle state of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
    Paused,
    Expired,
}

impl SubscriptionStatus {
    /// Only trial and active subscriptions entitle the tenant to act
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Trial | Self::Active)
    }

    /// Canceled and expired subscriptions never transition again; reactivation opens a new row
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Paused => "paused",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "paused" => Ok(Self::Paused),
            "expired" => Ok(Self::Expired),
            _ => Err(ParseError::InvalidValue {
                kind: "subscription status",
                value: s.to_string(),
            }),
        }
    }
}

/// Billing cycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    #[default]
    Monthly,
    Annual,
}

impl BillingCycle {
    /// End of a period of this cycle starting at `from`
    pub fn advance(&self, from: OffsetDateTime) -> OffsetDateTime {
        match self {
            Self::Monthly => add_months(from, 1),
            Self::Annual => add_months(from, 12),
        }
    }

    /// Gateway recurrence string for recurring checkouts
    pub fn recurrence(&self) -> &'static str {
        match self {
            Self::Monthly => "1 Month",
            Self::Annual => "1 Year",
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::Annual => write!(f, "annual"),
        }
    }
}

/// Status of a payment row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// Succeeded and refunded payments never change again from a gateway notification
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Refunded)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Refunded => write!(f, "refunded"),
        }
    }
}

/// What a payment is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Subscription,
    OneTime,
    Overage,
}

/// Credit ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CreditTransactionType {
    Refund,
    Promotional,
    Adjustment,
    Usage,
}

/// State of a scheduled payment retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RetryStatus {
    Pending,
    Attempted,
    Succeeded,
    Failed,
}

/// Rate limit tier attached to an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RateLimitTier {
    Trial,
    Starter,
    Professional,
    Business,
    Enterprise,
    #[default]
    Standard,
}

impl RateLimitTier {
    pub const ALL: [RateLimitTier; 6] = [
        Self::Trial,
        Self::Starter,
        Self::Professional,
        Self::Business,
        Self::Enterprise,
        Self::Standard,
    ];

    /// Requests per window when no override is configured
    pub fn default_requests_per_window(&self) -> u32 {
        match self {
            Self::Trial => 10,
            Self::Starter => 30,
            Self::Professional => 100,
            Self::Business => 300,
            Self::Enterprise => 1000,
            Self::Standard => 60,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Starter => "starter",
            Self::Professional => "professional",
            Self::Business => "business",
            Self::Enterprise => "enterprise",
            Self::Standard => "standard",
        }
    }
}

impl std::fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RateLimitTier {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str() == s.to_lowercase())
            .ok_or_else(|| ParseError::InvalidValue {
                kind: "rate limit tier",
                value: s.to_string(),
            })
    }
}

// =============================================================================
// Plan features and limits
// =============================================================================

/// Closed set of plan feature flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    AiReplies,
    KnowledgeBase,
    WebScraping,
    FileUploads,
    Broadcasts,
    CustomPersonas,
    PrioritySupport,
    AdvancedAnalytics,
    ApiAccess,
    CustomIntegrations,
    DedicatedSupport,
    WhiteLabel,
    CustomAiTraining,
}

impl Feature {
    pub const ALL: [Feature; 13] = [
        Self::AiReplies,
        Self::KnowledgeBase,
        Self::WebScraping,
        Self::FileUploads,
        Self::Broadcasts,
        Self::CustomPersonas,
        Self::PrioritySupport,
        Self::AdvancedAnalytics,
        Self::ApiAccess,
        Self::CustomIntegrations,
        Self::DedicatedSupport,
        Self::WhiteLabel,
        Self::CustomAiTraining,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiReplies => "ai_replies",
            Self::KnowledgeBase => "knowledge_base",
            Self::WebScraping => "web_scraping",
            Self::FileUploads => "file_uploads",
            Self::Broadcasts => "broadcasts",
            Self::CustomPersonas => "custom_personas",
            Self::PrioritySupport => "priority_support",
            Self::AdvancedAnalytics => "advanced_analytics",
            Self::ApiAccess => "api_access",
            Self::CustomIntegrations => "custom_integrations",
            Self::DedicatedSupport => "dedicated_support",
            Self::WhiteLabel => "white_label",
            Self::CustomAiTraining => "custom_ai_training",
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Feature {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|feature| feature.as_str() == s)
            .ok_or_else(|| ParseError::UnknownFeature(s.to_string()))
    }
}

/// Feature flags of a plan. Missing keys are disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanFeatures(pub BTreeMap<Feature, bool>);

impl PlanFeatures {
    pub fn enabled(&self, feature: Feature) -> bool {
        self.0.get(&feature).copied().unwrap_or(false)
    }

    pub fn with(mut self, feature: Feature) -> Self {
        self.0.insert(feature, true);
        self
    }
}

/// A numeric plan limit where any negative value (canonically `-1`) means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Limit(i64);

impl Limit {
    pub const UNLIMITED: Limit = Limit(-1);

    pub fn finite(max: i64) -> Self {
        Self(max.max(0))
    }

    pub fn zero() -> Self {
        Self(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 < 0
    }

    /// Finite ceiling, `None` when unlimited
    pub fn max(&self) -> Option<i64> {
        (!self.is_unlimited()).then_some(self.0)
    }

    /// Whether one more unit fits when `used` units are already consumed
    pub fn allows(&self, used: i64) -> bool {
        match self.max() {
            None => true,
            Some(max) => used < max,
        }
    }

    /// Units consumed beyond the ceiling
    pub fn overage(&self, used: i64) -> i64 {
        match self.max() {
            None => 0,
            Some(max) => (used - max).max(0),
        }
    }

    pub fn raw(&self) -> i64 {
        self.0
    }
}

/// Numeric limits of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanLimits {
    pub devices: Limit,
    pub contacts: Limit,
    pub messages_per_month: Limit,
    pub ai_messages_per_month: Limit,
    pub broadcasts_per_month: Limit,
    #[serde(default = "Limit::zero")]
    pub web_scraping_pages: Limit,
}

impl PlanLimits {
    pub fn unlimited() -> Self {
        Self {
            devices: Limit::UNLIMITED,
            contacts: Limit::UNLIMITED,
            messages_per_month: Limit::UNLIMITED,
            ai_messages_per_month: Limit::UNLIMITED,
            broadcasts_per_month: Limit::UNLIMITED,
            web_scraping_pages: Limit::UNLIMITED,
        }
    }

    pub fn get(&self, resource: Resource) -> Limit {
        match resource {
            Resource::Devices => self.devices,
            Resource::Contacts => self.contacts,
            Resource::Messages => self.messages_per_month,
            Resource::AiMessages => self.ai_messages_per_month,
            Resource::Broadcasts => self.broadcasts_per_month,
            Resource::ScrapedPages => self.web_scraping_pages,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Resource, Limit)> + '_ {
        Resource::ALL.into_iter().map(|r| (r, self.get(r)))
    }
}

/// A metered quantity tracked per usage period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Devices,
    Contacts,
    Messages,
    AiMessages,
    Broadcasts,
    ScrapedPages,
}

impl Resource {
    pub const ALL: [Resource; 6] = [
        Self::Devices,
        Self::Contacts,
        Self::Messages,
        Self::AiMessages,
        Self::Broadcasts,
        Self::ScrapedPages,
    ];

    /// Monthly-flow counters reset at period rollover; cumulative ones carry over
    pub fn is_monthly_flow(&self) -> bool {
        !matches!(self, Self::Devices | Self::Contacts)
    }

    /// Resources that may be billed as overage instead of being blocked
    pub fn is_overage_eligible(&self) -> bool {
        matches!(self, Self::Messages | Self::AiMessages)
    }

    /// Column in `usage_stats`
    pub fn column(&self) -> &'static str {
        match self {
            Self::Devices => "devices_used",
            Self::Contacts => "contacts_count",
            Self::Messages => "messages_sent",
            Self::AiMessages => "ai_messages_count",
            Self::Broadcasts => "broadcasts_sent",
            Self::ScrapedPages => "pages_scraped",
        }
    }

    /// Human readable label used in denial messages
    pub fn label(&self) -> &'static str {
        match self {
            Self::Devices => "device",
            Self::Contacts => "contact",
            Self::Messages => "monthly message",
            Self::AiMessages => "monthly AI message",
            Self::Broadcasts => "monthly broadcast",
            Self::ScrapedPages => "web scraping page",
        }
    }
}

/// Tenant-initiated action gated by the enforcement layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ConnectDevice,
    AddContact,
    SendMessage,
    SendAiMessage,
    SendBroadcast,
    ScrapePage,
}

impl Action {
    pub fn resource(&self) -> Resource {
        match self {
            Self::ConnectDevice => Resource::Devices,
            Self::AddContact => Resource::Contacts,
            Self::SendMessage => Resource::Messages,
            Self::SendAiMessage => Resource::AiMessages,
            Self::SendBroadcast => Resource::Broadcasts,
            Self::ScrapePage => Resource::ScrapedPages,
        }
    }

    /// Feature flag the plan must enable before the limit is even considered
    pub fn required_feature(&self) -> Option<Feature> {
        match self {
            Self::SendAiMessage => Some(Feature::AiReplies),
            Self::SendBroadcast => Some(Feature::Broadcasts),
            Self::ScrapePage => Some(Feature::WebScraping),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectDevice => "connect_device",
            Self::AddContact => "add_contact",
            Self::SendMessage => "send_message",
            Self::SendAiMessage => "send_ai_message",
            Self::SendBroadcast => "send_broadcast",
            Self::ScrapePage => "scrape_page",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect_device" | "add_device" => Ok(Self::ConnectDevice),
            "add_contact" => Ok(Self::AddContact),
            "send_message" => Ok(Self::SendMessage),
            "send_ai_message" => Ok(Self::SendAiMessage),
            "send_broadcast" => Ok(Self::SendBroadcast),
            "scrape_page" => Ok(Self::ScrapePage),
            _ => Err(ParseError::UnknownAction(s.to_string())),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Catalog plan
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    /// Minor currency units
    pub price_monthly: i64,
    pub price_annual: i64,
    pub currency: String,
    #[sqlx(json)]
    pub features: PlanFeatures,
    #[sqlx(json)]
    pub limits: PlanLimits,
    /// Overage-eligible resources are billed instead of blocked past their limit
    pub allow_overage: bool,
    pub is_active: bool,
    pub display_order: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Plan {
    pub fn price_for(&self, cycle: BillingCycle) -> i64 {
        match cycle {
            BillingCycle::Monthly => self.price_monthly,
            BillingCycle::Annual => self.price_annual,
        }
    }
}

/// Tenant subscription. Rows are never deleted; a fresh lifecycle is a new row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    /// State to restore when a paused subscription resumes
    pub resume_status: Option<SubscriptionStatus>,
    pub billing_cycle: BillingCycle,
    /// Price snapshot taken when the plan was bound
    pub current_price: i64,
    pub currency: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub next_billing_date: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub past_due_since: Option<OffsetDateTime>,
    pub grace_ends_at: Option<OffsetDateTime>,
    pub is_free: bool,
    pub free_reason: Option<String>,
    pub provider_order_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Free overrides entitle regardless of status
    pub fn grants_access(&self) -> bool {
        self.is_free || self.status.grants_access()
    }
}

/// Usage counters for one subscription period
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageStats {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Uuid,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub devices_used: i64,
    pub contacts_count: i64,
    pub messages_sent: i64,
    pub ai_messages_count: i64,
    pub broadcasts_sent: i64,
    pub pages_scraped: i64,
    pub messages_overage: i64,
    pub ai_messages_overage: i64,
    pub overage_amount: i64,
    pub overage_credits_used: i64,
    /// False once the next period's row supersedes this one
    pub is_current: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UsageStats {
    /// Fresh period row. Cumulative counters are carried from `previous`.
    pub fn open(
        user_id: Uuid,
        subscription_id: Uuid,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        previous: Option<&UsageStats>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            subscription_id,
            period_start,
            period_end,
            devices_used: previous.map(|p| p.devices_used).unwrap_or(0),
            contacts_count: previous.map(|p| p.contacts_count).unwrap_or(0),
            messages_sent: 0,
            ai_messages_count: 0,
            broadcasts_sent: 0,
            pages_scraped: 0,
            messages_overage: 0,
            ai_messages_overage: 0,
            overage_amount: 0,
            overage_credits_used: 0,
            is_current: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn get(&self, resource: Resource) -> i64 {
        match resource {
            Resource::Devices => self.devices_used,
            Resource::Contacts => self.contacts_count,
            Resource::Messages => self.messages_sent,
            Resource::AiMessages => self.ai_messages_count,
            Resource::Broadcasts => self.broadcasts_sent,
            Resource::ScrapedPages => self.pages_scraped,
        }
    }

    pub fn get_mut(&mut self, resource: Resource) -> &mut i64 {
        match resource {
            Resource::Devices => &mut self.devices_used,
            Resource::Contacts => &mut self.contacts_count,
            Resource::Messages => &mut self.messages_sent,
            Resource::AiMessages => &mut self.ai_messages_count,
            Resource::Broadcasts => &mut self.broadcasts_sent,
            Resource::ScrapedPages => &mut self.pages_scraped,
        }
    }
}

/// Payment attempt, unique by `provider_payment_id`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    /// Plan and cycle a subscription checkout binds on success
    pub plan_id: Option<Uuid>,
    pub billing_cycle: Option<BillingCycle>,
    pub kind: PaymentKind,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub provider_payment_id: String,
    /// Gateway-side payment reference
    pub provider_reference: Option<String>,
    pub description: Option<String>,
    pub invoice_number: Option<String>,
    pub invoice_url: Option<String>,
    pub failure_reason: Option<String>,
    pub refund_reason: Option<String>,
    pub attempted_at: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
    pub refunded_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Scheduled retry of a failed recurring payment
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentRetry {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub subscription_id: Uuid,
    pub attempt_number: i32,
    pub status: RetryStatus,
    pub next_retry_at: OffsetDateTime,
    pub attempted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Append-only credit ledger entry. `amount` is signed.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub transaction_type: CreditTransactionType,
    pub description: String,
    pub reference_id: Option<Uuid>,
    pub balance_after: i64,
    pub created_at: OffsetDateTime,
}

/// External API key
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub business_profile_id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub rate_limit_tier: RateLimitTier,
    pub scopes: Vec<String>,
    pub is_active: bool,
    pub requests_count: i64,
    pub last_used_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Date helpers
// =============================================================================

/// Calendar month arithmetic. The day is clamped to the target month's length.
pub fn add_months(at: OffsetDateTime, months: u32) -> OffsetDateTime {
    let total = at.year() * 12 + (u8::from(at.month()) as i32 - 1) + months as i32;
    let year = total.div_euclid(12);
    let month = match Month::try_from((total.rem_euclid(12) + 1) as u8) {
        Ok(m) => m,
        Err(_) => return at + Duration::days(30 * months as i64),
    };
    let day = at.day().min(time::util::days_in_year_month(year, month));
    match Date::from_calendar_date(year, month, day) {
        Ok(date) => at.replace_date(date),
        Err(_) => at + Duration::days(30 * months as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_add_months_clamps_day() {
        assert_eq!(
            add_months(datetime!(2024-01-31 10:00 UTC), 1),
            datetime!(2024-02-29 10:00 UTC)
        );
        assert_eq!(
            add_months(datetime!(2023-01-31 10:00 UTC), 1),
            datetime!(2023-02-28 10:00 UTC)
        );
        assert_eq!(
            add_months(datetime!(2024-11-15 00:00 UTC), 2),
            datetime!(2025-01-15 00:00 UTC)
        );
    }

    #[test]
    fn test_billing_cycle_advance() {
        let start = datetime!(2024-02-29 00:00 UTC);
        assert_eq!(
            BillingCycle::Annual.advance(start),
            datetime!(2025-02-28 00:00 UTC)
        );
        assert_eq!(
            BillingCycle::Monthly.advance(start),
            datetime!(2024-03-29 00:00 UTC)
        );
    }

    #[test]
    fn test_unlimited_limit_always_allows() {
        let limit = Limit::UNLIMITED;
        assert!(limit.allows(0));
        assert!(limit.allows(i64::MAX - 1));
        assert_eq!(limit.max(), None);
        assert_eq!(limit.overage(1_000_000), 0);
    }

    #[test]
    fn test_finite_limit() {
        let limit = Limit::finite(3);
        assert!(limit.allows(2));
        assert!(!limit.allows(3));
        assert_eq!(limit.overage(5), 2);
        assert_eq!(Limit::finite(-7), Limit::zero());
    }

    #[test]
    fn test_plan_limits_reject_unknown_keys() {
        let json = serde_json::json!({
            "devices": 1,
            "contacts": 100,
            "messages_per_month": 1000,
            "ai_messages_per_month": -1,
            "broadcasts_per_month": 5,
            "carrier_pigeons": 3
        });
        assert!(serde_json::from_value::<PlanLimits>(json).is_err());
    }

    #[test]
    fn test_plan_features_reject_unknown_keys() {
        let ok = serde_json::json!({"ai_replies": true, "broadcasts": false});
        let features: PlanFeatures = serde_json::from_value(ok).unwrap();
        assert!(features.enabled(Feature::AiReplies));
        assert!(!features.enabled(Feature::Broadcasts));
        assert!(!features.enabled(Feature::WhiteLabel));

        let bad = serde_json::json!({"teleportation": true});
        assert!(serde_json::from_value::<PlanFeatures>(bad).is_err());
    }

    #[test]
    fn test_action_parsing_and_mapping() {
        let action: Action = "send_ai_message".parse().unwrap();
        assert_eq!(action.resource(), Resource::AiMessages);
        assert_eq!(action.required_feature(), Some(Feature::AiReplies));
        assert!("fly_to_moon".parse::<Action>().is_err());
    }

    #[test]
    fn test_status_helpers() {
        assert!(SubscriptionStatus::Trial.grants_access());
        assert!(!SubscriptionStatus::PastDue.grants_access());
        assert!(SubscriptionStatus::Expired.is_terminal());
        assert_eq!(
            "past_due".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
    }

    #[test]
    fn test_rate_limit_tier_defaults() {
        assert_eq!(RateLimitTier::Trial.default_requests_per_window(), 10);
        assert_eq!(RateLimitTier::Enterprise.default_requests_per_window(), 1000);
        assert_eq!(RateLimitTier::default(), RateLimitTier::Standard);
        assert_eq!("Business".parse::<RateLimitTier>().unwrap(), RateLimitTier::Business);
    }
}
