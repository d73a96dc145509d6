//! PayHere notify URL
//!
//! PayHere posts `application/x-www-form-urlencoded`; JSON is accepted for
//! replays. The response is always 200 so the gateway never retries a
//! notification we have already decided about. Outcomes are logged and
//! rejected notifications are recorded in the billing event log.

use axum::{
    extract::{FromRequest, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    Form, Json,
};
use serde_json::{json, Value};
use whatsflow_billing::{PayHereNotification, WebhookOutcome};

use crate::state::AppState;

pub async fn payhere_webhook(
    State(state): State<AppState>,
    request: Request,
) -> (StatusCode, Json<Value>) {
    let is_json = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));

    let parsed = if is_json {
        Json::<PayHereNotification>::from_request(request, &state)
            .await
            .map(|Json(n)| n)
            .map_err(|e| e.body_text())
    } else {
        Form::<PayHereNotification>::from_request(request, &state)
            .await
            .map(|Form(n)| n)
            .map_err(|e| e.body_text())
    };

    let notification = match parsed {
        Ok(n) => n,
        Err(reason) => {
            tracing::warn!(reason = %reason, "Unparseable PayHere notification");
            return acknowledged();
        }
    };

    tracing::info!(
        order_id = %notification.order_id,
        status_code = %notification.status_code,
        "PayHere notification received"
    );

    match state.billing.webhooks.handle(&notification).await {
        WebhookOutcome::Applied => {
            tracing::info!(order_id = %notification.order_id, "PayHere notification applied");
        }
        WebhookOutcome::Duplicate => {
            tracing::debug!(order_id = %notification.order_id, "Duplicate PayHere notification");
        }
        WebhookOutcome::Ignored(reason) => {
            tracing::info!(order_id = %notification.order_id, reason = %reason, "PayHere notification ignored");
        }
        WebhookOutcome::Rejected(reason) => {
            tracing::warn!(order_id = %notification.order_id, reason = %reason, "PayHere notification rejected");
        }
    }

    acknowledged()
}

fn acknowledged() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "received": true })))
}
