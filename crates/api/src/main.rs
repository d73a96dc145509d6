use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use whatsflow_api::{create_router, AppState, Config};
use whatsflow_billing::BillingService;
use whatsflow_shared::{
    create_pool, run_migrations, CounterStore, InMemoryCounterStore, RateLimitConfig, RateLimiter,
    RedisCounterStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,whatsflow_api=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let counter_store: Arc<dyn CounterStore> = match &config.redis_url {
        Some(url) => match RedisCounterStore::connect(url).await {
            Ok(store) => {
                tracing::info!("Rate limiter using Redis");
                Arc::new(store)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, rate limiter using process memory");
                Arc::new(InMemoryCounterStore::new())
            }
        },
        None => {
            tracing::info!("REDIS_URL not set, rate limiter using process memory");
            Arc::new(InMemoryCounterStore::new())
        }
    };
    let rate_limiter = RateLimiter::new(counter_store, RateLimitConfig::from_env());
    spawn_counter_cleanup(rate_limiter.clone());

    let billing = BillingService::from_env(pool.clone());
    if billing.config.payhere.is_none() {
        tracing::warn!("PayHere is not configured; checkouts and notifications will be rejected");
    }

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, Some(pool), billing, rate_limiter);
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "WhatsFlow API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

/// Expired in-memory counters are only dropped here; Redis expires its own keys
fn spawn_counter_cleanup(rate_limiter: RateLimiter) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let removed = rate_limiter.cleanup().await;
            if removed > 0 {
                tracing::debug!(removed, "Expired rate limit counters removed");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
