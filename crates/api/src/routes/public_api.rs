//! Public API: enforcement checks for integrations holding an API key
//!
//! The key's business profile is the billing tenant. These routes sit behind
//! `require_api_key`, so every response already carries rate limit headers.

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use whatsflow_billing::{Decision, UsageSummary};
use whatsflow_shared::Action;

use crate::{
    auth::ApiClient,
    error::{ApiError, ApiResult},
    state::AppState,
};

pub const SCOPE_USAGE_READ: &str = "usage:read";
pub const SCOPE_USAGE_WRITE: &str = "usage:write";

impl ApiClient {
    /// Keys without scopes have full access
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }

    fn require_scope(&self, scope: &str) -> ApiResult<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DecisionResponse {
    pub success: bool,
    pub action: Action,
    pub decision: Decision,
}

#[derive(Debug, Default, Deserialize)]
pub struct PerformBody {
    #[serde(default)]
    pub count: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformResponse {
    pub success: bool,
    pub action: Action,
    pub recorded: i64,
    /// New counter value; absent when the ledger could not be written
    pub used: Option<i64>,
    pub overage: bool,
    pub degraded: bool,
}

#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub success: bool,
    pub usage: UsageSummary,
}

fn parse_action(raw: &str) -> ApiResult<Action> {
    raw.parse()
        .map_err(|e: whatsflow_shared::ParseError| ApiError::BadRequest(e.to_string()))
}

/// Ask whether an action is allowed without recording anything
pub async fn check_action(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(action): Path<String>,
) -> ApiResult<Json<DecisionResponse>> {
    client.require_scope(SCOPE_USAGE_READ)?;
    let action = parse_action(&action)?;
    let decision = state
        .billing
        .usage
        .can_perform_action(client.business_profile_id, action)
        .await;

    Ok(Json(DecisionResponse {
        success: true,
        action,
        decision,
    }))
}

/// Check and record an action in one call.
///
/// A denial is a 403 with `needsUpgrade`. When the ledger is unreachable the
/// action is allowed and the response is marked `degraded`.
pub async fn perform_action(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
    Path(action): Path<String>,
    body: Option<Json<PerformBody>>,
) -> ApiResult<Json<PerformResponse>> {
    client.require_scope(SCOPE_USAGE_WRITE)?;
    let action = parse_action(&action)?;
    let count = body.and_then(|Json(b)| b.count).unwrap_or(1);
    if count < 1 {
        return Err(ApiError::Validation("count must be at least 1".to_string()));
    }

    let tenant = client.business_profile_id;
    let decision = state.billing.usage.can_perform_action(tenant, action).await;
    if !decision.allowed {
        tracing::info!(
            business_profile_id = %tenant,
            action = %action,
            reason = ?decision.reason,
            "Public API action denied"
        );
        return Err(ApiError::EntitlementDenied {
            message: decision
                .reason
                .unwrap_or_else(|| "Action not allowed on current plan".to_string()),
            is_past_due: decision.is_past_due,
        });
    }

    let (used, degraded) = match state.billing.usage.record_usage(tenant, action, count).await {
        Ok(used) => (Some(used), decision.degraded),
        Err(e) if e.is_infrastructure() => {
            tracing::error!(
                business_profile_id = %tenant,
                action = %action,
                error = %e,
                "Usage not recorded, allowing action"
            );
            (None, true)
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Json(PerformResponse {
        success: true,
        action,
        recorded: if used.is_some() { count } else { 0 },
        used,
        overage: decision.overage,
        degraded,
    }))
}

pub async fn get_usage(
    State(state): State<AppState>,
    Extension(client): Extension<ApiClient>,
) -> ApiResult<Json<UsageResponse>> {
    client.require_scope(SCOPE_USAGE_READ)?;
    let usage = state
        .billing
        .usage
        .usage_summary(client.business_profile_id)
        .await?;
    Ok(Json(UsageResponse {
        success: true,
        usage,
    }))
}
