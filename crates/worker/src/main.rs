#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! WhatsFlow Background Worker
//!
//! Handles scheduled jobs:
//! - Subscription lifecycle reconciliation (every 5 minutes)
//! - Failed payment retries through the PayHere subscription API (hourly)
//! - Closing usage periods of idle tenants (hourly, on the half hour)

mod jobs;

use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use whatsflow_billing::BillingService;
use whatsflow_shared::create_pool;

const WORKER_MAX_CONNECTIONS: u32 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting WhatsFlow Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url, WORKER_MAX_CONNECTIONS)
        .await
        .context("failed to connect to database")?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool));
    if billing.config.payhere.is_none() {
        tracing::warn!("PayHere is not configured; payment retries will fail until it is");
    }

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Lifecycle reconciliation every 5 minutes
    let service = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                jobs::reconcile_subscriptions(&service).await;
            })
        })?)
        .await?;
    info!("Scheduled: Subscription reconciliation (every 5 minutes)");

    // Job 2: Payment retries at the top of every hour
    let service = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                jobs::retry_failed_payments(&service).await;
            })
        })?)
        .await?;
    info!("Scheduled: Payment retries (hourly)");

    // Job 3: Stale usage periods on the half hour
    let service = billing.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                jobs::close_stale_usage(&service).await;
            })
        })?)
        .await?;
    info!("Scheduled: Stale usage period closing (hourly)");

    scheduler.start().await?;
    info!("Worker started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    scheduler.shutdown().await?;

    Ok(())
}
