//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;
use whatsflow_billing::BillingService;
use whatsflow_shared::RateLimiter;

use crate::auth::{ApiKeyManager, JwtManager};
use crate::config::Config;

/// State handed to every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// `None` when running on the in-memory ledger
    pub pool: Option<PgPool>,
    pub billing: Arc<BillingService>,
    pub rate_limiter: RateLimiter,
    pub jwt_manager: Arc<JwtManager>,
    pub api_key_manager: Arc<ApiKeyManager>,
}

impl AppState {
    pub fn new(
        config: Config,
        pool: Option<PgPool>,
        billing: BillingService,
        rate_limiter: RateLimiter,
    ) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        let api_key_manager = ApiKeyManager::new(&config.api_key_hmac_secret);
        Self {
            config: Arc::new(config),
            pool,
            billing: Arc::new(billing),
            rate_limiter,
            jwt_manager: Arc::new(jwt_manager),
            api_key_manager: Arc::new(api_key_manager),
        }
    }
}
