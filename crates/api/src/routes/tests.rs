//! Router tests against the in-memory ledger
//!
//! Requests go through the full router (auth, rate limiting, handlers) via
//! `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use time::macros::datetime;
use tower::ServiceExt;
use uuid::Uuid;
use whatsflow_billing::payhere::{format_amount, notification_hash};
use whatsflow_billing::{
    BillingConfig, BillingService, LedgerStore, MemoryLedger, NewPlan, PayHereConfig, PayHereMode,
    TRIAL_PLAN_SLUG,
};
use whatsflow_shared::{
    Feature, Limit, ManualClock, Plan, PlanFeatures, PlanLimits, RateLimitConfig, RateLimitTier,
    RateLimiter, SubscriptionStatus,
};

use crate::{auth::jwt::ADMIN_ROLE, config::Config, create_router, state::AppState};

const MERCHANT_ID: &str = "1221688";
const MERCHANT_SECRET: &str = "MjQ1NjcxMjM0NTY3ODkw";

struct TestApp {
    app: Router,
    state: AppState,
    store: Arc<MemoryLedger>,
    starter: Plan,
}

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        public_url: "http://localhost:3000".to_string(),
        database_url: "postgres://unused".to_string(),
        database_max_connections: 1,
        redis_url: None,
        jwt_secret: "router-test-jwt-secret-at-least-32-chars".to_string(),
        jwt_expiry_hours: 1,
        api_key_hmac_secret: "router-test-hmac-secret-at-least-32-chars".to_string(),
        enable_billing: true,
        max_request_body_bytes: 64 * 1024,
    }
}

fn payhere_config() -> PayHereConfig {
    PayHereConfig {
        merchant_id: MERCHANT_ID.to_string(),
        merchant_secret: MERCHANT_SECRET.to_string(),
        app_id: String::new(),
        app_secret: String::new(),
        mode: PayHereMode::Sandbox,
        return_url: "https://app.whatsflow.lk/billing/success".to_string(),
        cancel_url: "https://app.whatsflow.lk/billing/cancel".to_string(),
        notify_url: "https://api.whatsflow.lk/api/v1/billing/webhook".to_string(),
        api_url_override: None,
    }
}

fn new_plan(name: &str, slug: &str, price: i64, messages: i64, display_order: i32) -> NewPlan {
    NewPlan {
        name: name.to_string(),
        slug: slug.to_string(),
        description: None,
        price_monthly: price,
        price_annual: price * 10,
        currency: "LKR".to_string(),
        features: PlanFeatures::default().with(Feature::AiReplies),
        limits: PlanLimits {
            devices: Limit::finite(1),
            contacts: Limit::finite(100),
            messages_per_month: Limit::finite(messages),
            ai_messages_per_month: Limit::finite(10),
            broadcasts_per_month: Limit::zero(),
            web_scraping_pages: Limit::zero(),
        },
        allow_overage: false,
        display_order,
    }
}

async fn setup() -> TestApp {
    let clock = Arc::new(ManualClock::new(datetime!(2024-03-01 09:00 UTC)));
    let (billing, store) = BillingService::in_memory(
        BillingConfig {
            payhere: Some(payhere_config()),
            ..Default::default()
        },
        clock,
    );

    billing
        .plans
        .create(new_plan("Trial", TRIAL_PLAN_SLUG, 0, 3, 0), None)
        .await
        .unwrap();
    let starter = billing
        .plans
        .create(new_plan("Starter", "starter", 290_000, 1_000, 1), None)
        .await
        .unwrap();

    let rate_limiter = RateLimiter::new_in_memory(
        RateLimitConfig::default().with_tier_limit(RateLimitTier::Trial, 2),
    );
    let state = AppState::new(test_config(), None, billing, rate_limiter);
    let app = create_router(state.clone());

    TestApp {
        app,
        state,
        store,
        starter,
    }
}

fn token_for(t: &TestApp, user_id: Uuid, role: &str) -> String {
    t.state
        .jwt_manager
        .generate_access_token(user_id, role, "owner@example.lk", Some("Kasun Silva"))
        .unwrap()
        .0
}

async fn issue_key(t: &TestApp, tenant: Uuid, tier: RateLimitTier, scopes: &[&str]) -> String {
    let (key, record) = t
        .state
        .api_key_manager
        .issue(
            tenant,
            "integration",
            tier,
            scopes.iter().map(|s| s.to_string()).collect(),
            time::OffsetDateTime::now_utc(),
        )
        .unwrap();
    t.store.insert_api_key(&record).await.unwrap();
    key
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn api_key_request(method: Method, uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-api-key", key)
        .body(Body::empty())
        .unwrap()
}

async fn send(t: &TestApp, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = t.app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

/// Form body as PayHere posts it to the notify URL
fn notification_form(order_id: &str, amount: i64, status_code: &str) -> String {
    let amount = format_amount(amount);
    let md5sig = notification_hash(
        MERCHANT_ID,
        order_id,
        &amount,
        "LKR",
        status_code,
        MERCHANT_SECRET,
    );
    format!(
        "merchant_id={}&order_id={}&payment_id=320027150501&payhere_amount={}&payhere_currency=LKR&status_code={}&md5sig={}&method=VISA&status_message=Successfully+completed",
        MERCHANT_ID, order_id, amount, status_code, md5sig
    )
}

fn form_request(body: String) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/api/v1/billing/webhook")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap()
}

// ============================================================================
// Health and catalog
// ============================================================================

#[tokio::test]
async fn test_health_without_database() {
    let t = setup().await;
    let (status, _, body) = send(&t, request(Method::GET, "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], "in-memory");
}

#[tokio::test]
async fn test_plan_catalog_is_public() {
    let t = setup().await;
    let (status, _, body) = send(&t, request(Method::GET, "/api/v1/plans", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["plans"].as_array().unwrap().len(), 2);

    let uri = format!("/api/v1/plans/{}", t.starter.id);
    let (status, _, body) = send(&t, request(Method::GET, &uri, None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plan"]["slug"], "starter");

    let uri = format!("/api/v1/plans/{}", Uuid::new_v4());
    let (status, _, body) = send(&t, request(Method::GET, &uri, None, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

// ============================================================================
// Tenant subscription routes
// ============================================================================

#[tokio::test]
async fn test_subscription_routes_require_auth() {
    let t = setup().await;
    let (status, _, body) = send(&t, request(Method::GET, "/api/v1/subscription", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "UNAUTHORIZED");

    let (status, _, _) = send(
        &t,
        request(Method::GET, "/api/v1/subscription", Some("not-a-token"), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_trial_then_usage() {
    let t = setup().await;
    let token = token_for(&t, Uuid::new_v4(), "owner");

    let (status, _, body) = send(
        &t,
        request(Method::POST, "/api/v1/subscription/trial", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["status"], "trial");
    assert_eq!(body["plan"]["slug"], TRIAL_PLAN_SLUG);

    let (status, _, body) = send(
        &t,
        request(Method::POST, "/api/v1/subscription/trial", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (status, _, body) = send(
        &t,
        request(Method::GET, "/api/v1/subscription/usage", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["usage"]["trial_days_remaining"], 7);
}

#[tokio::test]
async fn test_subscribe_and_webhook_activate() {
    let t = setup().await;
    let user = Uuid::new_v4();
    let token = token_for(&t, user, "owner");

    let (status, _, body) = send(
        &t,
        request(
            Method::POST,
            "/api/v1/subscription/subscribe",
            Some(&token),
            Some(json!({ "plan_id": t.starter.id, "billing_cycle": "monthly" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let order_id = body["order_id"].as_str().unwrap().to_string();
    assert!(order_id.starts_with("SUB-"));
    assert_eq!(body["checkout"]["first_name"], "Kasun");

    // Redelivery is acknowledged and changes nothing
    for _ in 0..2 {
        let (status, _, _) = send(
            &t,
            form_request(notification_form(&order_id, t.starter.price_monthly, "2")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, _, body) = send(
        &t,
        request(Method::GET, "/api/v1/subscription", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["status"], "active");
    assert_eq!(body["plan"]["id"], t.starter.id.to_string());

    let (_, _, body) = send(
        &t,
        request(Method::GET, "/api/v1/subscription/payments", Some(&token), None),
    )
    .await;
    assert_eq!(body["payments"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_webhook_always_acknowledges() {
    let t = setup().await;
    let user = Uuid::new_v4();
    let checkout = t
        .state
        .billing
        .checkout
        .create_subscription_checkout(
            user,
            t.starter.id,
            whatsflow_shared::BillingCycle::Monthly,
            &whatsflow_billing::CustomerDetails::from_full_name("Kasun Silva", "k@example.lk"),
        )
        .await
        .unwrap();

    // Garbage
    let (status, _, _) = send(&t, form_request("not a notification".to_string())).await;
    assert_eq!(status, StatusCode::OK);

    // Tampered amount
    let tampered = notification_form(&checkout.order_id, t.starter.price_monthly, "2")
        .replace("payhere_amount=2900.00", "payhere_amount=29.00");
    let (status, _, _) = send(&t, form_request(tampered)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(t
        .state
        .billing
        .subscriptions
        .current(user)
        .await
        .unwrap()
        .is_none());

    // JSON replay of a valid notification
    let amount = format_amount(t.starter.price_monthly);
    let body = json!({
        "merchant_id": MERCHANT_ID,
        "order_id": checkout.order_id,
        "payment_id": "320027150502",
        "payhere_amount": amount,
        "payhere_currency": "LKR",
        "status_code": 2,
        "md5sig": notification_hash(MERCHANT_ID, &checkout.order_id, &amount, "LKR", "2", MERCHANT_SECRET),
    });
    let (status, _, _) = send(
        &t,
        request(Method::POST, "/api/v1/billing/webhook", None, Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sub = t
        .state
        .billing
        .subscriptions
        .current(user)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn test_cancel_without_body_defers() {
    let t = setup().await;
    let token = token_for(&t, Uuid::new_v4(), "owner");
    send(
        &t,
        request(Method::POST, "/api/v1/subscription/trial", Some(&token), None),
    )
    .await;

    let (status, _, body) = send(
        &t,
        request(Method::POST, "/api/v1/subscription/cancel", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["status"], "trial");
    assert_eq!(body["subscription"]["cancel_at_period_end"], true);

    let (status, _, body) = send(
        &t,
        request(Method::POST, "/api/v1/subscription/reactivate", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reactivation"]["outcome"], "resumed");
}

// ============================================================================
// Public API
// ============================================================================

#[tokio::test]
async fn test_public_api_rejects_bad_keys() {
    let t = setup().await;
    let (status, _, _) = send(
        &t,
        request(Method::GET, "/api/v1/public/usage", None, None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, body) = send(
        &t,
        api_key_request(Method::GET, "/api/v1/public/usage", "wfk_forged"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "INVALID_API_KEY");

    // Well-formed key that was never stored
    let (unknown, _, _) = t.state.api_key_manager.generate_key().unwrap();
    let (status, _, _) = send(
        &t,
        api_key_request(Method::GET, "/api/v1/public/usage", &unknown),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_rate_limit_headers_and_429() {
    let t = setup().await;
    let tenant = Uuid::new_v4();
    t.state.billing.subscriptions.start_trial(tenant).await.unwrap();
    let key = issue_key(&t, tenant, RateLimitTier::Trial, &[]).await;
    let uri = "/api/v1/public/actions/send_message";

    for expected_remaining in ["1", "0"] {
        let (status, headers, body) = send(&t, api_key_request(Method::GET, uri, &key)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-ratelimit-limit"], "2");
        assert_eq!(headers["x-ratelimit-remaining"], expected_remaining);
        assert!(headers.contains_key("x-ratelimit-reset"));
        assert_eq!(body["decision"]["allowed"], true);
    }

    let (status, headers, body) = send(&t, api_key_request(Method::GET, uri, &key)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "RATE_LIMITED");
    let retry_after = body["retryAfter"].as_u64().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(headers["x-ratelimit-remaining"], "0");

    // Only the allowed requests are counted against the key
    let hash = t.state.api_key_manager.hash_key(&key).unwrap();
    let record = t.store.find_api_key_by_hash(&hash).await.unwrap().unwrap();
    assert_eq!(record.requests_count, 2);
    assert!(record.last_used_at.is_some());
}

#[tokio::test]
async fn test_perform_action_records_until_limit() {
    let t = setup().await;
    let tenant = Uuid::new_v4();
    t.state.billing.subscriptions.start_trial(tenant).await.unwrap();
    let key = issue_key(&t, tenant, RateLimitTier::Enterprise, &[]).await;
    let uri = "/api/v1/public/actions/send_message";

    // Trial plan allows 3 messages
    for used in 1..=3 {
        let (status, _, body) = send(&t, api_key_request(Method::POST, uri, &key)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["used"], used);
        assert_eq!(body["degraded"], false);
    }

    let (status, _, body) = send(&t, api_key_request(Method::POST, uri, &key)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "ENTITLEMENT_DENIED");
    assert_eq!(body["needsUpgrade"], true);

    let (status, _, _) = send(
        &t,
        api_key_request(Method::POST, "/api/v1/public/actions/fly", &key),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_public_api_without_subscription_needs_upgrade() {
    let t = setup().await;
    let key = issue_key(&t, Uuid::new_v4(), RateLimitTier::Standard, &[]).await;
    let (status, _, body) = send(
        &t,
        api_key_request(Method::POST, "/api/v1/public/actions/send_message", &key),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["needsUpgrade"], true);
}

#[tokio::test]
async fn test_public_api_scopes() {
    let t = setup().await;
    let tenant = Uuid::new_v4();
    t.state.billing.subscriptions.start_trial(tenant).await.unwrap();
    let key = issue_key(&t, tenant, RateLimitTier::Enterprise, &["usage:read"]).await;

    let (status, _, _) = send(
        &t,
        api_key_request(Method::GET, "/api/v1/public/usage", &key),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(
        &t,
        api_key_request(Method::POST, "/api/v1/public/actions/send_message", &key),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// ============================================================================
// Admin
// ============================================================================

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let t = setup().await;
    let owner = token_for(&t, Uuid::new_v4(), "owner");
    let (status, _, _) = send(
        &t,
        request(Method::GET, "/api/v1/admin/plans", Some(&owner), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let admin = token_for(&t, Uuid::new_v4(), ADMIN_ROLE);
    let (status, _, body) = send(
        &t,
        request(Method::GET, "/api/v1/admin/plans", Some(&admin), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["plans"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_admin_free_override_and_api_key() {
    let t = setup().await;
    let admin = token_for(&t, Uuid::new_v4(), ADMIN_ROLE);
    let tenant = Uuid::new_v4();

    let uri = format!("/api/v1/admin/users/{}/free", tenant);
    let (status, _, body) = send(
        &t,
        request(
            Method::POST,
            &uri,
            Some(&admin),
            Some(json!({ "reason": "Partner NGO" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subscription"]["is_free"], true);

    let (status, _, body) = send(
        &t,
        request(
            Method::POST,
            "/api/v1/admin/api-keys",
            Some(&admin),
            Some(json!({
                "business_profile_id": tenant,
                "name": "Partner CRM",
                "rate_limit_tier": "business",
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let key = body["key"].as_str().unwrap().to_string();
    assert!(body["api_key"].get("key_hash").is_none());

    // Free accounts are never limited
    let (status, _, body) = send(
        &t,
        api_key_request(Method::GET, "/api/v1/public/actions/send_broadcast", &key),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["decision"]["allowed"], true);

    let uri = format!("/api/v1/admin/users/{}/events", tenant);
    let (status, _, body) = send(&t, request(Method::GET, &uri, Some(&admin), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["events"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["event_type"] == "ADMIN_OVERRIDE"));
}
