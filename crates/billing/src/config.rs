//! Billing configuration
//!
//! All values have defaults and can be overridden from the environment:
//! - `TRIAL_DURATION_DAYS` (7)
//! - `OVERAGE_MESSAGE_PRICE_CENTS` (1), `OVERAGE_AI_MESSAGE_PRICE_CENTS` (2)
//! - `OVERAGE_BULK_THRESHOLD` (1000), `OVERAGE_BULK_DISCOUNT_RATE` (0.20)
//! - `PAYMENT_RETRY_SCHEDULE_DAYS` (1,3,7), `PAYMENT_GRACE_PERIOD_DAYS` (10)
//! - `REACTIVATION_COOLDOWN_DAYS` (0)
//! - `BILLING_STORE_TIMEOUT_MS` (2000)
//! - `PAYHERE_*` gateway credentials

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

const PAYHERE_SANDBOX_CHECKOUT: &str = "https://sandbox.payhere.lk/pay/checkout";
const PAYHERE_LIVE_CHECKOUT: &str = "https://www.payhere.lk/pay/checkout";
const PAYHERE_SANDBOX_API: &str = "https://sandbox.payhere.lk/merchant/v1";
const PAYHERE_LIVE_API: &str = "https://www.payhere.lk/merchant/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayHereMode {
    Sandbox,
    Live,
}

/// PayHere merchant configuration
#[derive(Debug, Clone)]
pub struct PayHereConfig {
    pub merchant_id: String,
    pub merchant_secret: String,
    pub app_id: String,
    pub app_secret: String,
    pub mode: PayHereMode,
    pub return_url: String,
    pub cancel_url: String,
    pub notify_url: String,
    /// Overrides the Subscription Manager API base (tests point this at a mock server)
    pub api_url_override: Option<String>,
}

impl PayHereConfig {
    pub fn from_env() -> BillingResult<Self> {
        let merchant_id = std::env::var("PAYHERE_MERCHANT_ID")
            .map_err(|_| BillingError::Config("PAYHERE_MERCHANT_ID not set".to_string()))?;
        let merchant_secret = std::env::var("PAYHERE_MERCHANT_SECRET")
            .map_err(|_| BillingError::Config("PAYHERE_MERCHANT_SECRET not set".to_string()))?;

        let mode = match std::env::var("PAYHERE_MODE").as_deref() {
            Ok("live") => PayHereMode::Live,
            _ => PayHereMode::Sandbox,
        };

        Ok(Self {
            merchant_id,
            merchant_secret,
            app_id: std::env::var("PAYHERE_APP_ID").unwrap_or_default(),
            app_secret: std::env::var("PAYHERE_APP_SECRET").unwrap_or_default(),
            mode,
            return_url: std::env::var("PAYHERE_RETURN_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing/success".to_string()),
            cancel_url: std::env::var("PAYHERE_CANCEL_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing/cancel".to_string()),
            notify_url: std::env::var("PAYHERE_NOTIFY_URL")
                .unwrap_or_else(|_| "http://localhost:8080/billing/webhook".to_string()),
            api_url_override: std::env::var("PAYHERE_API_URL").ok(),
        })
    }

    pub fn checkout_url(&self) -> &'static str {
        match self.mode {
            PayHereMode::Sandbox => PAYHERE_SANDBOX_CHECKOUT,
            PayHereMode::Live => PAYHERE_LIVE_CHECKOUT,
        }
    }

    pub fn api_url(&self) -> &str {
        if let Some(url) = &self.api_url_override {
            return url;
        }
        match self.mode {
            PayHereMode::Sandbox => PAYHERE_SANDBOX_API,
            PayHereMode::Live => PAYHERE_LIVE_API,
        }
    }

    /// Whether Subscription Manager API credentials are present
    pub fn has_api_credentials(&self) -> bool {
        !self.app_id.is_empty() && !self.app_secret.is_empty()
    }
}

/// Billing policy configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub trial_duration_days: i64,
    /// Minor units per overage message
    pub overage_message_price: i64,
    pub overage_ai_message_price: i64,
    pub bulk_discount_threshold: i64,
    /// Basis points, 2000 = 20%
    pub bulk_discount_bps: i64,
    /// Days after a failure at which each retry runs
    pub retry_schedule_days: Vec<i64>,
    pub grace_period_days: i64,
    pub reactivation_cooldown_days: i64,
    pub store_timeout: Duration,
    /// Percentages of a monthly limit that trigger a usage warning
    pub usage_warning_thresholds: Vec<i64>,
    pub invoice_prefix: String,
    pub payhere: Option<PayHereConfig>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            trial_duration_days: 7,
            overage_message_price: 1,
            overage_ai_message_price: 2,
            bulk_discount_threshold: 1000,
            bulk_discount_bps: 2000,
            retry_schedule_days: vec![1, 3, 7],
            grace_period_days: 10,
            reactivation_cooldown_days: 0,
            store_timeout: Duration::from_millis(2000),
            usage_warning_thresholds: vec![80, 90],
            invoice_prefix: "INV".to_string(),
            payhere: None,
        }
    }
}

impl BillingConfig {
    /// Load configuration from environment variables.
    ///
    /// Missing PayHere credentials are not an error: checkout and webhook
    /// verification are then unavailable but enforcement keeps working.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let payhere = match PayHereConfig::from_env() {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                tracing::warn!(error = %e, "PayHere not configured");
                None
            }
        };

        Self {
            trial_duration_days: env_or("TRIAL_DURATION_DAYS", defaults.trial_duration_days),
            overage_message_price: env_or(
                "OVERAGE_MESSAGE_PRICE_CENTS",
                defaults.overage_message_price,
            ),
            overage_ai_message_price: env_or(
                "OVERAGE_AI_MESSAGE_PRICE_CENTS",
                defaults.overage_ai_message_price,
            ),
            bulk_discount_threshold: env_or(
                "OVERAGE_BULK_THRESHOLD",
                defaults.bulk_discount_threshold,
            ),
            bulk_discount_bps: std::env::var("OVERAGE_BULK_DISCOUNT_RATE")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|rate| (0.0..=1.0).contains(rate))
                .map(|rate| (rate * 10_000.0).round() as i64)
                .unwrap_or(defaults.bulk_discount_bps),
            retry_schedule_days: std::env::var("PAYMENT_RETRY_SCHEDULE_DAYS")
                .ok()
                .map(|v| parse_day_list(&v))
                .filter(|days| !days.is_empty())
                .unwrap_or(defaults.retry_schedule_days),
            grace_period_days: env_or("PAYMENT_GRACE_PERIOD_DAYS", defaults.grace_period_days),
            reactivation_cooldown_days: env_or(
                "REACTIVATION_COOLDOWN_DAYS",
                defaults.reactivation_cooldown_days,
            ),
            store_timeout: Duration::from_millis(env_or(
                "BILLING_STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )),
            usage_warning_thresholds: defaults.usage_warning_thresholds,
            invoice_prefix: std::env::var("INVOICE_PREFIX").unwrap_or(defaults.invoice_prefix),
            payhere,
        }
    }

    pub fn max_retry_attempts(&self) -> usize {
        self.retry_schedule_days.len()
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_day_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|s| s.trim().parse::<i64>().ok())
        .filter(|d| *d > 0)
        .collect()
}
