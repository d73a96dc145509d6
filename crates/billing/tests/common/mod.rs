//! Shared setup for billing integration tests

#![allow(dead_code)]

use std::sync::Arc;

use time::macros::datetime;
use time::OffsetDateTime;
use uuid::Uuid;
use whatsflow_billing::payhere::{format_amount, notification_hash};
use whatsflow_billing::{
    BillingConfig, BillingService, CustomerDetails, LedgerStore, MemoryLedger, NewPlan,
    PayHereConfig, PayHereMode, PayHereNotification, WebhookOutcome, TRIAL_PLAN_SLUG,
};
use whatsflow_shared::{BillingCycle, Feature, Limit, ManualClock, Plan, PlanFeatures, PlanLimits};

pub const T0: OffsetDateTime = datetime!(2024-02-01 08:30 UTC);
pub const MERCHANT_ID: &str = "1221688";
pub const MERCHANT_SECRET: &str = "MjQ1NjcxMjM0NTY3ODkw";

pub struct TestBilling {
    pub billing: BillingService,
    pub store: Arc<MemoryLedger>,
    pub clock: Arc<ManualClock>,
    pub trial: Plan,
    pub starter: Plan,
    pub business: Plan,
    pub enterprise: Plan,
}

pub fn payhere_config() -> PayHereConfig {
    PayHereConfig {
        merchant_id: MERCHANT_ID.to_string(),
        merchant_secret: MERCHANT_SECRET.to_string(),
        app_id: String::new(),
        app_secret: String::new(),
        mode: PayHereMode::Sandbox,
        return_url: "https://app.whatsflow.lk/billing/success".to_string(),
        cancel_url: "https://app.whatsflow.lk/billing/cancel".to_string(),
        notify_url: "https://api.whatsflow.lk/billing/webhook".to_string(),
        api_url_override: None,
    }
}

fn plan(
    name: &str,
    slug: &str,
    price_monthly: i64,
    features: PlanFeatures,
    limits: PlanLimits,
    allow_overage: bool,
    display_order: i32,
) -> NewPlan {
    NewPlan {
        name: name.to_string(),
        slug: slug.to_string(),
        description: None,
        price_monthly,
        price_annual: price_monthly * 10,
        currency: "LKR".to_string(),
        features,
        limits,
        allow_overage,
        display_order,
    }
}

/// Billing service on an in-memory ledger, seeded with a four-plan catalog
pub async fn setup() -> TestBilling {
    setup_with(BillingConfig {
        payhere: Some(payhere_config()),
        ..Default::default()
    })
    .await
}

pub async fn setup_with(config: BillingConfig) -> TestBilling {
    let clock = Arc::new(ManualClock::new(T0));
    let (billing, store) = BillingService::in_memory(config, clock.clone());

    let trial = billing
        .plans
        .create(
            plan(
                "Trial",
                TRIAL_PLAN_SLUG,
                0,
                PlanFeatures::default().with(Feature::AiReplies),
                PlanLimits {
                    devices: Limit::finite(1),
                    contacts: Limit::finite(100),
                    messages_per_month: Limit::finite(100),
                    ai_messages_per_month: Limit::finite(20),
                    broadcasts_per_month: Limit::zero(),
                    web_scraping_pages: Limit::zero(),
                },
                false,
                0,
            ),
            None,
        )
        .await
        .unwrap();
    let starter = billing
        .plans
        .create(
            plan(
                "Starter",
                "starter",
                290_000,
                PlanFeatures::default().with(Feature::AiReplies),
                PlanLimits {
                    devices: Limit::finite(1),
                    contacts: Limit::finite(1_000),
                    messages_per_month: Limit::finite(1_000),
                    ai_messages_per_month: Limit::finite(200),
                    broadcasts_per_month: Limit::zero(),
                    web_scraping_pages: Limit::zero(),
                },
                false,
                1,
            ),
            None,
        )
        .await
        .unwrap();
    let business = billing
        .plans
        .create(
            plan(
                "Business",
                "business",
                990_000,
                PlanFeatures::default()
                    .with(Feature::AiReplies)
                    .with(Feature::Broadcasts)
                    .with(Feature::KnowledgeBase),
                PlanLimits {
                    devices: Limit::finite(3),
                    contacts: Limit::finite(10_000),
                    messages_per_month: Limit::finite(100),
                    ai_messages_per_month: Limit::finite(50),
                    broadcasts_per_month: Limit::finite(20),
                    web_scraping_pages: Limit::finite(100),
                },
                true,
                2,
            ),
            None,
        )
        .await
        .unwrap();
    let enterprise = billing
        .plans
        .create(
            plan(
                "Enterprise",
                "enterprise",
                4_990_000,
                Feature::ALL
                    .into_iter()
                    .fold(PlanFeatures::default(), |f, feature| f.with(feature)),
                PlanLimits::unlimited(),
                false,
                3,
            ),
            None,
        )
        .await
        .unwrap();

    TestBilling {
        billing,
        store,
        clock,
        trial,
        starter,
        business,
        enterprise,
    }
}

/// Notification as PayHere would post it, signed with the test merchant secret
pub fn signed(order_id: &str, amount: i64, status_code: &str) -> PayHereNotification {
    let amount = format_amount(amount);
    PayHereNotification {
        merchant_id: MERCHANT_ID.to_string(),
        order_id: order_id.to_string(),
        payment_id: Some("320027150501".to_string()),
        md5sig: notification_hash(
            MERCHANT_ID,
            order_id,
            &amount,
            "LKR",
            status_code,
            MERCHANT_SECRET,
        ),
        payhere_amount: amount,
        payhere_currency: "LKR".to_string(),
        status_code: status_code.to_string(),
        method: Some("VISA".to_string()),
        ..Default::default()
    }
}

pub fn customer() -> CustomerDetails {
    CustomerDetails::from_full_name("Sunil Fernando", "sunil@example.lk")
}

/// Open a monthly checkout for `plan` and return its order id
pub async fn checkout(t: &TestBilling, user: Uuid, plan: &Plan) -> String {
    t.billing
        .checkout
        .create_subscription_checkout(user, plan.id, BillingCycle::Monthly, &customer())
        .await
        .unwrap()
        .order_id
}

/// Checkout and pay `plan`; the subscription is active afterwards
pub async fn subscribe(t: &TestBilling, user: Uuid, plan: &Plan) -> String {
    let order_id = checkout(t, user, plan).await;
    let outcome = t
        .billing
        .webhooks
        .handle(&signed(&order_id, plan.price_monthly, "2"))
        .await;
    assert_eq!(outcome, WebhookOutcome::Applied);
    order_id
}

pub async fn event_count(t: &TestBilling, user: Uuid, event_type: &str) -> usize {
    t.store
        .list_billing_events(user, 500)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}
