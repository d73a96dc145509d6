//! Tenant subscription routes
//!
//! All handlers act on the authenticated user's own subscription.

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use whatsflow_billing::{
    CheckoutResponse, CustomerDetails, Reactivation, SubscribeRequest, UsageSummary,
};
use whatsflow_shared::{CreditTransaction, Payment, Plan, Subscription};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub success: bool,
    pub subscription: Option<Subscription>,
    pub plan: Option<Plan>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutEnvelope {
    pub success: bool,
    #[serde(flatten)]
    pub checkout: CheckoutResponse,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeBody {
    #[serde(flatten)]
    pub request: SubscribeRequest,
    /// Checkout form details; defaults to the token's name and email
    #[serde(default)]
    pub customer: Option<CustomerDetails>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub immediately: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReactivateBody {
    #[serde(default)]
    pub customer: Option<CustomerDetails>,
}

#[derive(Debug, Serialize)]
pub struct ReactivateResponse {
    pub success: bool,
    pub reactivation: Reactivation,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub success: bool,
    pub usage: UsageSummary,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct PaymentsResponse {
    pub success: bool,
    pub payments: Vec<Payment>,
}

#[derive(Debug, Serialize)]
pub struct CreditsResponse {
    pub success: bool,
    pub balance: i64,
    pub transactions: Vec<CreditTransaction>,
}

#[derive(Debug, Deserialize)]
pub struct TopUpBody {
    /// Amount in cents
    pub amount: i64,
    #[serde(default)]
    pub customer: Option<CustomerDetails>,
}

fn customer_for(user: &AuthUser, provided: Option<CustomerDetails>) -> CustomerDetails {
    provided.unwrap_or_else(|| {
        CustomerDetails::from_full_name(user.name.as_deref().unwrap_or(&user.email), &user.email)
    })
}

fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, 100)
}

/// Current subscription with due transitions applied
pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription = state
        .billing
        .subscriptions
        .reconcile_user(auth_user.user_id)
        .await?;

    let plan = match &subscription {
        Some(sub) => Some(state.billing.plans.get(sub.plan_id).await?),
        None => None,
    };

    Ok(Json(SubscriptionResponse {
        success: true,
        subscription,
        plan,
    }))
}

pub async fn start_trial(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription = state
        .billing
        .subscriptions
        .start_trial(auth_user.user_id)
        .await?;
    let plan = state.billing.plans.get(subscription.plan_id).await?;

    Ok(Json(SubscriptionResponse {
        success: true,
        subscription: Some(subscription),
        plan: Some(plan),
    }))
}

/// Start a checkout. The plan is bound once the gateway confirms payment.
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<SubscribeBody>,
) -> ApiResult<Json<CheckoutEnvelope>> {
    let customer = customer_for(&auth_user, body.customer);
    let checkout = state
        .billing
        .checkout
        .create_subscription_checkout(
            auth_user.user_id,
            body.request.plan_id,
            body.request.billing_cycle,
            &customer,
        )
        .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        plan_id = %body.request.plan_id,
        order_id = %checkout.order_id,
        "Subscription checkout created"
    );

    Ok(Json(CheckoutEnvelope {
        success: true,
        checkout,
    }))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Option<Json<CancelBody>>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let subscription = state
        .billing
        .subscriptions
        .cancel(auth_user.user_id, body.immediately)
        .await?;

    Ok(Json(SubscriptionResponse {
        success: true,
        subscription: Some(subscription),
        plan: None,
    }))
}

pub async fn reactivate(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Option<Json<ReactivateBody>>,
) -> ApiResult<Json<ReactivateResponse>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let customer = customer_for(&auth_user, body.customer);
    let result = state
        .billing
        .subscriptions
        .reactivate(auth_user.user_id, &customer)
        .await?;

    Ok(Json(ReactivateResponse {
        success: true,
        reactivation: result,
    }))
}

/// Per-resource usage for the current window
pub async fn get_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<UsageResponse>> {
    let usage = state.billing.usage.usage_summary(auth_user.user_id).await?;
    Ok(Json(UsageResponse {
        success: true,
        usage,
    }))
}

pub async fn list_payments(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<PaymentsResponse>> {
    let payments = state
        .billing
        .payments
        .list_payments(auth_user.user_id, clamp_limit(query.limit))
        .await?;
    Ok(Json(PaymentsResponse {
        success: true,
        payments,
    }))
}

pub async fn get_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<CreditsResponse>> {
    let balance = state.billing.credits.balance(auth_user.user_id).await?;
    let transactions = state
        .billing
        .credits
        .history(auth_user.user_id, clamp_limit(query.limit))
        .await?;
    Ok(Json(CreditsResponse {
        success: true,
        balance,
        transactions,
    }))
}

/// One-time checkout that adds credits once paid
pub async fn top_up_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(body): Json<TopUpBody>,
) -> ApiResult<Json<CheckoutEnvelope>> {
    if body.amount <= 0 {
        return Err(ApiError::Validation("amount must be positive".to_string()));
    }
    let customer = customer_for(&auth_user, body.customer);
    let checkout = state
        .billing
        .checkout
        .create_one_time_checkout(auth_user.user_id, "Credit top-up", body.amount, &customer)
        .await?;

    Ok(Json(CheckoutEnvelope {
        success: true,
        checkout,
    }))
}
