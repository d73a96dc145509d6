//! Fixed-window rate limiting per API key
//!
//! Each API key gets `N` requests per window, `N` chosen by the key's tier.
//! Limits are configurable via environment variables:
//! - `RATE_LIMIT_WINDOW_SECONDS`: window length (default: 60)
//! - `RATE_LIMIT_TIER_<TIER>`: requests per window for a tier, e.g. `RATE_LIMIT_TIER_BUSINESS=500`
//! - `RATE_LIMIT_STORE_TIMEOUT_MS`: counter store timeout before failing open (default: 250)
//!
//! Windows are fixed, not sliding: a client can land up to `2N` requests
//! across a window boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::counter::{CounterStore, InMemoryCounterStore};
use crate::error::CounterError;
use crate::types::RateLimitTier;

/// Rate limit configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub store_timeout: Duration,
    tier_limits: HashMap<RateLimitTier, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            store_timeout: Duration::from_millis(250),
            tier_limits: RateLimitTier::ALL
                .into_iter()
                .map(|tier| (tier, tier.default_requests_per_window()))
                .collect(),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_parse::<u64>("RATE_LIMIT_WINDOW_SECONDS").filter(|s| *s > 0) {
            config.window = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("RATE_LIMIT_STORE_TIMEOUT_MS") {
            config.store_timeout = Duration::from_millis(ms);
        }
        for tier in RateLimitTier::ALL {
            let var = format!("RATE_LIMIT_TIER_{}", tier.as_str().to_uppercase());
            if let Some(limit) = env_parse::<u32>(&var) {
                config.tier_limits.insert(tier, limit);
            }
        }

        config
    }

    pub fn with_tier_limit(mut self, tier: RateLimitTier, limit: u32) -> Self {
        self.tier_limits.insert(tier, limit);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Requests allowed per window for `tier`
    pub fn limit_for(&self, tier: RateLimitTier) -> u32 {
        self.tier_limits
            .get(&tier)
            .copied()
            .unwrap_or_else(|| tier.default_requests_per_window())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Rate limit check result
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub tier: RateLimitTier,
    pub limit: u32,
    pub remaining: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_at: OffsetDateTime,
    pub retry_after_seconds: Option<u64>,
    /// Counter store was unavailable and the request was let through
    pub degraded: bool,
}

/// Rate limiter service
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: Arc<RateLimitConfig>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    /// Create a new in-memory rate limiter
    pub fn new_in_memory(config: RateLimitConfig) -> Self {
        Self::new(Arc::new(InMemoryCounterStore::new()), config)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request against an API key's window.
    ///
    /// Never fails: a counter store error or timeout lets the request through.
    pub async fn check_api_key(&self, api_key_id: Uuid, tier: RateLimitTier) -> RateLimitDecision {
        let key = format!("ratelimit:api:{}", api_key_id);
        let limit = self.config.limit_for(tier);
        let now = OffsetDateTime::now_utc();

        let counted = match tokio::time::timeout(
            self.config.store_timeout,
            self.store.incr_with_ttl(&key, self.config.window),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CounterError::Timeout(
                self.config.store_timeout.as_millis() as u64
            )),
        };

        match counted {
            Ok(snapshot) => {
                let allowed = snapshot.count <= u64::from(limit);
                let remaining = u64::from(limit).saturating_sub(snapshot.count) as u32;
                let ttl_secs = snapshot.ttl.as_secs().clamp(1, self.config.window.as_secs().max(1));

                if !allowed {
                    tracing::debug!(
                        api_key_id = %api_key_id,
                        tier = %tier,
                        count = snapshot.count,
                        limit = limit,
                        "API key rate limited"
                    );
                }

                RateLimitDecision {
                    allowed,
                    tier,
                    limit,
                    remaining,
                    reset_at: now + time::Duration::seconds(ttl_secs as i64),
                    retry_after_seconds: (!allowed).then_some(ttl_secs),
                    degraded: false,
                }
            }
            Err(e) => {
                tracing::warn!(
                    api_key_id = %api_key_id,
                    error = %e,
                    "Rate limit check failed, allowing request"
                );
                RateLimitDecision {
                    allowed: true,
                    tier,
                    limit,
                    remaining: limit,
                    reset_at: now + time::Duration::seconds(self.config.window.as_secs() as i64),
                    retry_after_seconds: None,
                    degraded: true,
                }
            }
        }
    }

    /// Clean up expired windows (call periodically when running without Redis)
    pub async fn cleanup(&self) -> usize {
        self.store.cleanup().await
    }
}
