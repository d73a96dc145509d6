//! Issuing public API keys

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use whatsflow_shared::{ApiKey, RateLimitTier};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyBody {
    pub business_profile_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub rate_limit_tier: RateLimitTier,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateApiKeyResponse {
    pub success: bool,
    /// Shown once; only the hash is stored
    pub key: String,
    pub api_key: ApiKey,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(body): Json<CreateApiKeyBody>,
) -> ApiResult<(StatusCode, Json<CreateApiKeyResponse>)> {
    let name = body.name.trim();
    if name.is_empty() || name.len() > 100 {
        return Err(ApiError::Validation(
            "name must be between 1 and 100 characters".to_string(),
        ));
    }

    let (key, record) = state
        .api_key_manager
        .issue(
            body.business_profile_id,
            name,
            body.rate_limit_tier,
            body.scopes,
            OffsetDateTime::now_utc(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "API key generation failed");
            ApiError::Internal
        })?;

    state.billing.store.insert_api_key(&record).await?;

    tracing::info!(
        admin_id = %admin.user_id,
        api_key_id = %record.id,
        business_profile_id = %record.business_profile_id,
        tier = %record.rate_limit_tier,
        "API key issued"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse {
            success: true,
            key,
            api_key: record,
        }),
    ))
}
