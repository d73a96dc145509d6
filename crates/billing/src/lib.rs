// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Service constructors take their collaborators explicitly
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! WhatsFlow Billing Module
//!
//! Subscription lifecycle, usage enforcement and PayHere payment reconciliation.
//!
//! ## Features
//!
//! - **Plan Catalog**: Plans with closed feature flags and numeric limits (`-1` = unlimited)
//! - **Subscription Lifecycle**: Trial, active, past due, paused, canceled, expired
//! - **Enforcement Gate**: Per-action allow/deny against the current plan, failing open
//! - **Usage Metering**: Monthly windows with lazy rollover and overage settlement
//! - **Credits**: Append-only ledger applied to overage before external billing
//! - **Webhooks**: Verified, idempotent PayHere notification processing
//! - **Retries**: Scheduled retries of failed recurring payments

pub mod checkout;
pub mod config;
pub mod credits;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gateway;
pub mod overage;
pub mod payhere;
pub mod payments;
pub mod plans;
pub mod store;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;


// Checkout
pub use checkout::{CheckoutResponse, CheckoutService, SubscribeRequest};

// Config
pub use config::{BillingConfig, PayHereConfig, PayHereMode};

// Credits
pub use credits::{CreditLedger, OverageChargeResult};

// Entitlement
pub use entitlement::{Decision, Entitlement};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
};

// Gateway
pub use gateway::{PayHereClient, PaymentGateway};

// Overage
pub use overage::{OverageRates, OverageService, OverageSettlement, PeriodOverage};

// PayHere
pub use payhere::{CheckoutPayload, CustomerDetails, GatewayStatus, PayHereNotification};

// Payments
pub use payments::{PaymentService, RetryReport};

// Plans
pub use plans::{NewPlan, PlanCatalog, PlanUpdate, TRIAL_PLAN_SLUG};

// Store
pub use store::{LedgerStore, MemoryLedger, PgLedger};

// Subscriptions
pub use subscriptions::{Reactivation, ReconcileReport, SubscriptionManager};

// Usage
pub use usage::{ResourceUsage, UsageMeter, UsageSummary};

// Webhooks
pub use webhooks::{WebhookOutcome, WebhookReconciler};

use std::sync::Arc;

use sqlx::PgPool;
use whatsflow_shared::{Clock, SystemClock};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub config: Arc<BillingConfig>,
    pub store: Arc<dyn LedgerStore>,
    pub plans: Arc<PlanCatalog>,
    pub checkout: Arc<CheckoutService>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub usage: Arc<UsageMeter>,
    pub credits: Arc<CreditLedger>,
    pub overage: Arc<OverageService>,
    pub payments: Arc<PaymentService>,
    pub webhooks: Arc<WebhookReconciler>,
    pub events: BillingEventLogger,
}

impl BillingService {
    /// Create a billing service on Postgres, configured from environment variables
    pub fn from_env(pool: PgPool) -> Self {
        Self::new(
            BillingConfig::from_env(),
            Arc::new(PgLedger::new(pool)),
            Arc::new(SystemClock),
        )
    }

    /// Create a billing service with explicit config.
    ///
    /// The PayHere subscription API client is built when app credentials are configured.
    pub fn new(config: BillingConfig, store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        let gateway: Option<Arc<dyn PaymentGateway>> = match config.payhere.clone() {
            Some(payhere) if payhere.has_api_credentials() => match PayHereClient::new(payhere) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    tracing::warn!(error = %e, "PayHere subscription API unavailable");
                    None
                }
            },
            _ => None,
        };
        Self::with_gateway(config, store, clock, gateway)
    }

    /// Create a billing service with an explicit gateway client
    pub fn with_gateway(
        config: BillingConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> Self {
        let config = Arc::new(config);
        let events = BillingEventLogger::new(store.clone(), clock.clone());

        let plans = Arc::new(PlanCatalog::new(store.clone(), clock.clone()));
        let credits = Arc::new(CreditLedger::new(store.clone(), clock.clone()));
        let overage = Arc::new(OverageService::new(
            store.clone(),
            clock.clone(),
            credits.clone(),
            OverageRates::from_config(&config),
        ));
        let checkout = Arc::new(CheckoutService::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            plans.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            plans.clone(),
            checkout.clone(),
            gateway.clone(),
        ));
        let usage = Arc::new(UsageMeter::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            subscriptions.clone(),
            overage.clone(),
        ));
        let payments = Arc::new(PaymentService::new(
            store.clone(),
            clock.clone(),
            config.clone(),
            credits.clone(),
            gateway,
        ));
        let webhooks = Arc::new(WebhookReconciler::new(
            store.clone(),
            clock,
            config.clone(),
            subscriptions.clone(),
            payments.clone(),
            credits.clone(),
        ));

        Self {
            config,
            store,
            plans,
            checkout,
            subscriptions,
            usage,
            credits,
            overage,
            payments,
            webhooks,
            events,
        }
    }

    /// In-memory billing service for tests and local development
    pub fn in_memory(config: BillingConfig, clock: Arc<dyn Clock>) -> (Self, Arc<MemoryLedger>) {
        let store = Arc::new(MemoryLedger::new());
        let service = Self::with_gateway(config, store.clone(), clock, None);
        (service, store)
    }
}
