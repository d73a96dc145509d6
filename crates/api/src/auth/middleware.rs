//! Authentication and rate limiting middleware
//!
//! Dashboard routes authenticate with a Bearer JWT (`require_auth`).
//! The public API authenticates with an API key and is rate limited per key
//! (`require_api_key`). Every public API response carries
//! `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`.

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use time::OffsetDateTime;
use uuid::Uuid;
use whatsflow_shared::{RateLimitDecision, RateLimitTier};

use crate::error::ApiError;
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

static RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Authenticated dashboard user extracted from a JWT
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: String,
    pub email: String,
    pub name: Option<String>,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == super::jwt::ADMIN_ROLE
    }
}

/// Caller of the public API, resolved from its API key
#[derive(Debug, Clone)]
pub struct ApiClient {
    pub key_id: Uuid,
    /// Billing tenant the key belongs to
    pub business_profile_id: Uuid,
    pub tier: RateLimitTier,
    pub scopes: Vec<String>,
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
}

fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .and_then(|header| header.strip_prefix("ApiKey "))
        })
        .map(str::trim)
}

/// Require a valid access token
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(request.headers()) else {
        tracing::debug!(path = %path, "require_auth: missing bearer token");
        return ApiError::Unauthorized.into_response();
    };

    match state.jwt_manager.validate_access_token(token) {
        Ok(claims) => {
            let auth_user = AuthUser {
                user_id: claims.sub,
                role: claims.role,
                email: claims.email,
                name: claims.name,
            };
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "require_auth: token rejected");
            ApiError::InvalidToken.into_response()
        }
    }
}

/// Require an admin role. Must run after `require_auth`.
pub async fn require_admin(request: Request, next: Next) -> Response {
    match request.extensions().get::<AuthUser>() {
        Some(user) if user.is_admin() => next.run(request).await,
        Some(user) => {
            tracing::warn!(user_id = %user.user_id, "Non-admin attempted admin route");
            ApiError::Forbidden.into_response()
        }
        None => ApiError::Unauthorized.into_response(),
    }
}

/// Authenticate an API key and apply the per-key rate limit.
///
/// Rate limiting is independent of the tenant's subscription status.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let client = match authenticate_api_key(&state, request.headers()).await {
        Ok(client) => client,
        Err(err) => return err.into_response(),
    };

    let decision = state
        .rate_limiter
        .check_api_key(client.key_id, client.tier)
        .await;

    if !decision.allowed {
        tracing::info!(
            api_key_id = %client.key_id,
            tier = %client.tier,
            limit = decision.limit,
            "API key rate limited"
        );
        let retry_after = decision.retry_after_seconds.unwrap_or(1);
        let mut response = ApiError::RateLimited { retry_after }.into_response();
        set_rate_limit_headers(response.headers_mut(), &decision);
        return response;
    }

    // Usage accounting never blocks the request
    if let Err(e) = state
        .billing
        .store
        .record_api_key_use(client.key_id, OffsetDateTime::now_utc())
        .await
    {
        tracing::warn!(api_key_id = %client.key_id, error = %e, "Failed to record API key use");
    }

    request.extensions_mut().insert(client);
    let mut response = next.run(request).await;
    set_rate_limit_headers(response.headers_mut(), &decision);
    response
}

async fn authenticate_api_key(state: &AppState, headers: &HeaderMap) -> Result<ApiClient, ApiError> {
    let key = extract_api_key(headers).ok_or(ApiError::Unauthorized)?;

    let well_formed = state
        .api_key_manager
        .validate_key(key)
        .map_err(|_| ApiError::Internal)?;
    if !well_formed {
        return Err(ApiError::InvalidApiKey);
    }

    let key_hash = state
        .api_key_manager
        .hash_key(key)
        .map_err(|_| ApiError::Internal)?;
    let record = state
        .billing
        .store
        .find_api_key_by_hash(&key_hash)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "API key lookup failed");
            ApiError::ServiceUnavailable
        })?;

    match record {
        Some(record) if record.is_active => Ok(ApiClient {
            key_id: record.id,
            business_profile_id: record.business_profile_id,
            tier: record.rate_limit_tier,
            scopes: record.scopes,
        }),
        Some(record) => {
            tracing::warn!(api_key_id = %record.id, "Inactive API key used");
            Err(ApiError::InvalidApiKey)
        }
        None => Err(ApiError::InvalidApiKey),
    }
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(RATE_LIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(
        RATE_LIMIT_REMAINING.clone(),
        HeaderValue::from(decision.remaining),
    );
    headers.insert(
        RATE_LIMIT_RESET.clone(),
        HeaderValue::from(decision.reset_at.unix_timestamp()),
    );
}
