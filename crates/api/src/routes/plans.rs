//! Public plan catalog

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;
use whatsflow_shared::Plan;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub success: bool,
    pub plans: Vec<Plan>,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub success: bool,
    pub plan: Plan,
}

/// Active plans in display order
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<PlansResponse>> {
    let plans = state.billing.plans.list().await?;
    Ok(Json(PlansResponse {
        success: true,
        plans,
    }))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<Uuid>,
) -> ApiResult<Json<PlanResponse>> {
    let plan = state.billing.plans.get(plan_id).await?;
    Ok(Json(PlanResponse {
        success: true,
        plan,
    }))
}
