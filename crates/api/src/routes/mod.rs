//! API routes

pub mod admin;
pub mod health;
pub mod plans;
pub mod public_api;
pub mod subscription;
pub mod webhook;

#[cfg(test)]
mod tests;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, patch, post},
    Router,
};

use crate::{
    auth::{require_admin, require_api_key, require_auth},
    state::AppState,
};

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Public catalog (no auth)
    let mut public_routes = Router::new()
        .route("/plans", get(plans::list_plans))
        .route("/plans/:plan_id", get(plans::get_plan));

    // PayHere notify URL (verified by signature, not by auth)
    if state.config.enable_billing {
        public_routes = public_routes.route("/billing/webhook", post(webhook::payhere_webhook));
    }

    // Tenant routes (JWT)
    let mut tenant_routes = Router::new()
        .route("/subscription", get(subscription::get_subscription))
        .route("/subscription/usage", get(subscription::get_usage));

    if state.config.enable_billing {
        tenant_routes = tenant_routes
            .route("/subscription/trial", post(subscription::start_trial))
            .route("/subscription/subscribe", post(subscription::subscribe))
            .route("/subscription/cancel", post(subscription::cancel))
            .route("/subscription/reactivate", post(subscription::reactivate))
            .route("/subscription/payments", get(subscription::list_payments))
            .route("/subscription/credits", get(subscription::get_credits))
            .route("/subscription/credits/top-up", post(subscription::top_up_credits));
    }

    let tenant_routes = tenant_routes.route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_auth,
    ));

    // Platform admin routes (JWT with admin role)
    let admin_routes = Router::new()
        .route("/admin/plans", get(admin::list_all_plans).post(admin::create_plan))
        .route("/admin/plans/:plan_id", patch(admin::update_plan))
        .route("/admin/users/:user_id/free", post(admin::make_account_free))
        .route("/admin/users/:user_id/free", delete(admin::remove_free_status))
        .route("/admin/users/:user_id/pause", post(admin::pause_subscription))
        .route("/admin/users/:user_id/resume", post(admin::resume_subscription))
        .route("/admin/users/:user_id/credits", post(admin::grant_credits))
        .route("/admin/users/:user_id/events", get(admin::list_billing_events))
        .route("/admin/payments/:payment_id/refund", post(admin::refund_payment))
        .route("/admin/api-keys", post(admin::create_api_key))
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    // External integrations (API key, rate limited per key)
    let public_api_routes = Router::new()
        .route("/actions/:action", get(public_api::check_action).post(public_api::perform_action))
        .route("/usage", get(public_api::get_usage))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let api_routes = Router::new()
        .merge(public_routes)
        .merge(tenant_routes)
        .merge(admin_routes)
        .nest("/public", public_api_routes);

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .layer(DefaultBodyLimit::max(state.config.max_request_body_bytes))
        .with_state(state)
}
