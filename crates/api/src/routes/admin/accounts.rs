//! Per-tenant admin overrides

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use whatsflow_billing::BillingEvent;
use whatsflow_shared::{CreditTransaction, CreditTransactionType, Payment, Subscription};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct AdminSubscriptionResponse {
    pub success: bool,
    pub subscription: Subscription,
}

#[derive(Debug, Deserialize)]
pub struct FreeAccountBody {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct GrantCreditsBody {
    /// Amount in cents
    pub amount: i64,
    pub description: String,
    #[serde(default = "default_credit_type")]
    pub transaction_type: CreditTransactionType,
}

fn default_credit_type() -> CreditTransactionType {
    CreditTransactionType::Adjustment
}

#[derive(Debug, Serialize)]
pub struct GrantCreditsResponse {
    pub success: bool,
    pub transaction: CreditTransaction,
}

#[derive(Debug, Deserialize)]
pub struct RefundBody {
    pub reason: String,
    #[serde(default)]
    pub issue_credit: bool,
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub success: bool,
    pub payment: Payment,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_events_limit")]
    pub limit: i64,
}

fn default_events_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub success: bool,
    pub events: Vec<BillingEvent>,
}

fn subscription_response(subscription: Subscription) -> Json<AdminSubscriptionResponse> {
    Json(AdminSubscriptionResponse {
        success: true,
        subscription,
    })
}

pub async fn make_account_free(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<FreeAccountBody>,
) -> ApiResult<Json<AdminSubscriptionResponse>> {
    if body.reason.trim().is_empty() {
        return Err(ApiError::Validation("reason is required".to_string()));
    }
    let subscription = state
        .billing
        .subscriptions
        .make_account_free(user_id, body.reason.trim(), admin.user_id)
        .await?;
    Ok(subscription_response(subscription))
}

pub async fn remove_free_status(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<AdminSubscriptionResponse>> {
    let subscription = state
        .billing
        .subscriptions
        .remove_free_status(user_id, admin.user_id)
        .await?;
    Ok(subscription_response(subscription))
}

pub async fn pause_subscription(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<AdminSubscriptionResponse>> {
    let subscription = state
        .billing
        .subscriptions
        .pause(user_id, Some(admin.user_id))
        .await?;
    Ok(subscription_response(subscription))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<AdminSubscriptionResponse>> {
    let subscription = state.billing.subscriptions.resume(user_id).await?;
    Ok(subscription_response(subscription))
}

pub async fn grant_credits(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(user_id): Path<Uuid>,
    Json(body): Json<GrantCreditsBody>,
) -> ApiResult<Json<GrantCreditsResponse>> {
    let transaction = state
        .billing
        .credits
        .add_credits(
            user_id,
            body.amount,
            body.transaction_type,
            &body.description,
            None,
        )
        .await?;

    tracing::info!(
        admin_id = %admin.user_id,
        user_id = %user_id,
        amount = body.amount,
        "Credits granted by admin"
    );

    Ok(Json(GrantCreditsResponse {
        success: true,
        transaction,
    }))
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(payment_id): Path<Uuid>,
    Json(body): Json<RefundBody>,
) -> ApiResult<Json<RefundResponse>> {
    let payment = state
        .billing
        .payments
        .refund_payment(payment_id, &body.reason, body.issue_credit, admin.user_id)
        .await?;
    Ok(Json(RefundResponse {
        success: true,
        payment,
    }))
}

/// Billing audit log for one tenant
pub async fn list_billing_events(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<EventsResponse>> {
    let events = state
        .billing
        .events
        .get_events(user_id, query.limit.clamp(1, 200))
        .await?;
    Ok(Json(EventsResponse {
        success: true,
        events,
    }))
}
