//! Scheduled billing jobs
//!
//! Each job logs its own failures and never panics; a failed run is simply
//! picked up again on the next tick.

use whatsflow_billing::{BillingService, ReconcileReport, RetryReport};

/// Usage rows closed per run
pub const STALE_PERIOD_BATCH: i64 = 500;

/// Expire ended trials and grace periods, apply cancellations that reached period end
pub async fn reconcile_subscriptions(billing: &BillingService) -> Option<ReconcileReport> {
    match billing.subscriptions.reconcile_due().await {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::error!(error = %e, "Subscription reconciliation failed");
            None
        }
    }
}

/// Ask the gateway to retry failed recurring payments that are due
pub async fn retry_failed_payments(billing: &BillingService) -> Option<RetryReport> {
    match billing.payments.process_due_retries().await {
        Ok(report) => {
            if report.attempted > 0 {
                tracing::info!(
                    attempted = report.attempted,
                    resolved = report.resolved,
                    failed = report.failed,
                    "Payment retry run complete"
                );
            }
            Some(report)
        }
        Err(e) => {
            tracing::error!(error = %e, "Payment retry run failed");
            None
        }
    }
}

/// Roll over usage windows for tenants that have been idle past their period end
pub async fn close_stale_usage(billing: &BillingService) -> Option<usize> {
    match billing.usage.close_stale_periods(STALE_PERIOD_BATCH).await {
        Ok(closed) => {
            if closed > 0 {
                tracing::info!(closed, "Stale usage periods closed");
            }
            Some(closed)
        }
        Err(e) => {
            tracing::error!(error = %e, "Closing stale usage periods failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::{macros::datetime, Duration};
    use uuid::Uuid;
    use whatsflow_billing::{BillingConfig, LedgerStore, MemoryLedger, NewPlan, TRIAL_PLAN_SLUG};
    use whatsflow_shared::{Limit, ManualClock, PlanFeatures, PlanLimits, SubscriptionStatus};

    use super::*;

    async fn billing() -> (BillingService, Arc<MemoryLedger>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 00:00 UTC)));
        let (billing, store) = BillingService::in_memory(BillingConfig::default(), clock.clone());
        billing
            .plans
            .create(
                NewPlan {
                    name: "Trial".to_string(),
                    slug: TRIAL_PLAN_SLUG.to_string(),
                    description: None,
                    price_monthly: 0,
                    price_annual: 0,
                    currency: "LKR".to_string(),
                    features: PlanFeatures::default(),
                    limits: PlanLimits {
                        devices: Limit::finite(1),
                        contacts: Limit::finite(50),
                        messages_per_month: Limit::finite(100),
                        ai_messages_per_month: Limit::zero(),
                        broadcasts_per_month: Limit::zero(),
                        web_scraping_pages: Limit::zero(),
                    },
                    allow_overage: false,
                    display_order: 0,
                },
                None,
            )
            .await
            .unwrap();
        (billing, store, clock)
    }

    #[tokio::test]
    async fn test_reconcile_expires_ended_trial() {
        let (billing, store, clock) = billing().await;
        let user = Uuid::new_v4();
        billing.subscriptions.start_trial(user).await.unwrap();

        let report = reconcile_subscriptions(&billing).await.unwrap();
        assert_eq!(report, ReconcileReport::default());

        clock.advance(Duration::days(8));
        let report = reconcile_subscriptions(&billing).await.unwrap();
        assert_eq!(report.expired, 1);

        let sub = store.latest_subscription(user).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Expired);
    }

    #[tokio::test]
    async fn test_jobs_survive_store_outage() {
        let (billing, store, _clock) = billing().await;
        store.set_unavailable(true);

        assert!(reconcile_subscriptions(&billing).await.is_none());
        assert!(retry_failed_payments(&billing).await.is_none());
        assert!(close_stale_usage(&billing).await.is_none());
    }

    #[tokio::test]
    async fn test_idle_runs_do_nothing() {
        let (billing, _store, _clock) = billing().await;
        assert_eq!(
            retry_failed_payments(&billing).await,
            Some(RetryReport::default())
        );
        assert_eq!(close_stale_usage(&billing).await, Some(0));
    }
}
