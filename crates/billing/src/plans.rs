//! Plan catalog
//!
//! Plans are loaded from the ledger and validated on write. Feature and limit
//! keys are closed sets: unknown keys fail deserialization before a plan can be stored.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use whatsflow_shared::{Clock, Plan, PlanFeatures, PlanLimits};

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::store::LedgerStore;

/// Slug of the plan bound by `start_trial`
pub const TRIAL_PLAN_SLUG: &str = "trial";

/// Input for creating a plan
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub price_monthly: i64,
    pub price_annual: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub features: PlanFeatures,
    pub limits: PlanLimits,
    #[serde(default)]
    pub allow_overage: bool,
    #[serde(default)]
    pub display_order: i32,
}

fn default_currency() -> String {
    "LKR".to_string()
}

/// Partial plan update; absent fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlanUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price_monthly: Option<i64>,
    pub price_annual: Option<i64>,
    pub features: Option<PlanFeatures>,
    pub limits: Option<PlanLimits>,
    pub allow_overage: Option<bool>,
    pub is_active: Option<bool>,
    pub display_order: Option<i32>,
}

pub struct PlanCatalog {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: BillingEventLogger,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        let events = BillingEventLogger::new(store.clone(), clock.clone());
        Self {
            store,
            clock,
            events,
        }
    }

    /// Active plans ordered for display
    pub async fn list(&self) -> BillingResult<Vec<Plan>> {
        self.store.list_plans(false).await
    }

    pub async fn list_all(&self) -> BillingResult<Vec<Plan>> {
        self.store.list_plans(true).await
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Plan> {
        self.store
            .get_plan(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", id)))
    }

    pub async fn get_by_slug(&self, slug: &str) -> BillingResult<Plan> {
        self.store
            .get_plan_by_slug(slug)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan '{}'", slug)))
    }

    pub async fn trial_plan(&self) -> BillingResult<Plan> {
        self.get_by_slug(TRIAL_PLAN_SLUG).await
    }

    /// Active plan that a tenant may subscribe to
    pub async fn purchasable(&self, id: Uuid) -> BillingResult<Plan> {
        let plan = self.get(id).await?;
        if !plan.is_active {
            return Err(BillingError::InvalidInput(format!(
                "plan '{}' is not available",
                plan.slug
            )));
        }
        if plan.slug == TRIAL_PLAN_SLUG {
            return Err(BillingError::InvalidInput(
                "the trial plan cannot be purchased".to_string(),
            ));
        }
        Ok(plan)
    }

    pub async fn create(&self, input: NewPlan, admin_id: Option<Uuid>) -> BillingResult<Plan> {
        validate_slug(&input.slug)?;
        validate_prices(input.price_monthly, input.price_annual)?;
        validate_limits(&input.limits)?;
        if input.name.trim().is_empty() {
            return Err(BillingError::InvalidInput("plan name is required".to_string()));
        }

        let now = self.clock.now();
        let plan = Plan {
            id: Uuid::new_v4(),
            name: input.name,
            slug: input.slug,
            description: input.description,
            price_monthly: input.price_monthly,
            price_annual: input.price_annual,
            currency: input.currency,
            features: input.features,
            limits: input.limits,
            allow_overage: input.allow_overage,
            is_active: true,
            display_order: input.display_order,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_plan(&plan).await?;

        tracing::info!(plan_id = %plan.id, slug = %plan.slug, "Plan created");
        if let Some(admin_id) = admin_id {
            self.events
                .record(
                    BillingEventBuilder::new(admin_id, BillingEventType::PlanCreated)
                        .actor(admin_id, ActorType::Admin)
                        .data(serde_json::json!({ "plan_id": plan.id, "slug": plan.slug })),
                )
                .await;
        }

        Ok(plan)
    }

    /// Apply a partial update. Existing subscriptions keep their price snapshot.
    pub async fn update(
        &self,
        id: Uuid,
        update: PlanUpdate,
        admin_id: Option<Uuid>,
    ) -> BillingResult<Plan> {
        let mut plan = self.get(id).await?;

        if let Some(name) = update.name.clone() {
            plan.name = name;
        }
        if let Some(description) = update.description.clone() {
            plan.description = Some(description);
        }
        if let Some(price) = update.price_monthly {
            plan.price_monthly = price;
        }
        if let Some(price) = update.price_annual {
            plan.price_annual = price;
        }
        if let Some(features) = update.features.clone() {
            plan.features = features;
        }
        if let Some(limits) = update.limits {
            validate_limits(&limits)?;
            plan.limits = limits;
        }
        if let Some(allow) = update.allow_overage {
            plan.allow_overage = allow;
        }
        if let Some(active) = update.is_active {
            plan.is_active = active;
        }
        if let Some(order) = update.display_order {
            plan.display_order = order;
        }
        validate_prices(plan.price_monthly, plan.price_annual)?;
        plan.updated_at = self.clock.now();

        self.store.update_plan(&plan).await?;

        tracing::info!(plan_id = %plan.id, slug = %plan.slug, "Plan updated");
        if let Some(admin_id) = admin_id {
            self.events
                .record(
                    BillingEventBuilder::new(admin_id, BillingEventType::PlanUpdated)
                        .actor(admin_id, ActorType::Admin)
                        .data(serde_json::json!({ "plan_id": plan.id, "changes": update })),
                )
                .await;
        }

        Ok(plan)
    }
}

fn validate_slug(slug: &str) -> BillingResult<()> {
    let valid = !slug.is_empty()
        && slug.len() <= 50
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !valid {
        return Err(BillingError::InvalidInput(format!(
            "invalid plan slug '{}'",
            slug
        )));
    }
    Ok(())
}

fn validate_prices(monthly: i64, annual: i64) -> BillingResult<()> {
    if monthly < 0 || annual < 0 {
        return Err(BillingError::InvalidInput(
            "plan prices cannot be negative".to_string(),
        ));
    }
    Ok(())
}

/// `-1` is the only negative value accepted as "unlimited"
fn validate_limits(limits: &PlanLimits) -> BillingResult<()> {
    for (resource, limit) in limits.iter() {
        if limit.raw() < -1 {
            return Err(BillingError::InvalidInput(format!(
                "{} limit must be -1 or non-negative, got {}",
                resource.label(),
                limit.raw()
            )));
        }
    }
    Ok(())
}
