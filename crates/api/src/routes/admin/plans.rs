//! Plan catalog management

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;
use whatsflow_billing::{NewPlan, PlanUpdate};

use crate::{
    auth::AuthUser,
    error::ApiResult,
    routes::plans::{PlanResponse, PlansResponse},
    state::AppState,
};

/// All plans, inactive ones included
pub async fn list_all_plans(State(state): State<AppState>) -> ApiResult<Json<PlansResponse>> {
    let plans = state.billing.plans.list_all().await?;
    Ok(Json(PlansResponse {
        success: true,
        plans,
    }))
}

pub async fn create_plan(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(input): Json<NewPlan>,
) -> ApiResult<(StatusCode, Json<PlanResponse>)> {
    let plan = state
        .billing
        .plans
        .create(input, Some(admin.user_id))
        .await?;

    tracing::info!(admin_id = %admin.user_id, plan_id = %plan.id, slug = %plan.slug, "Plan created");

    Ok((
        StatusCode::CREATED,
        Json(PlanResponse {
            success: true,
            plan,
        }),
    ))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Path(plan_id): Path<Uuid>,
    Json(update): Json<PlanUpdate>,
) -> ApiResult<Json<PlanResponse>> {
    let plan = state
        .billing
        .plans
        .update(plan_id, update, Some(admin.user_id))
        .await?;

    Ok(Json(PlanResponse {
        success: true,
        plan,
    }))
}
