//! PayHere Subscription Manager API client
//!
//! Used for server-initiated actions on recurring subscriptions: retrying a
//! failed charge and canceling at the gateway. Transient failures (connect
//! errors, timeouts, 5xx) are retried with jittered exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::config::PayHereConfig;
use crate::error::{BillingError, BillingResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);
const MAX_RETRIES: usize = 3;

/// Outbound operations on a gateway-managed recurring subscription
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Ask the gateway to charge a failed installment again
    async fn retry_payment(&self, provider_subscription_id: &str) -> BillingResult<()>;

    /// Stop future installments
    async fn cancel_subscription(&self, provider_subscription_id: &str) -> BillingResult<()>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: i32,
    #[serde(default)]
    msg: Option<String>,
}

/// Transient errors are retried; permanent ones are returned immediately
enum CallError {
    Transient(BillingError),
    Permanent(BillingError),
}

impl CallError {
    fn into_inner(self) -> BillingError {
        match self {
            CallError::Transient(e) | CallError::Permanent(e) => e,
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            CallError::Transient(err.into())
        } else {
            CallError::Permanent(err.into())
        }
    }
}

fn classify_status(status: StatusCode, context: &str) -> Result<(), CallError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(CallError::Transient(BillingError::Gateway(format!(
            "{} returned {}",
            context, status
        ))))
    } else {
        Err(CallError::Permanent(BillingError::Gateway(format!(
            "{} returned {}",
            context, status
        ))))
    }
}

pub struct PayHereClient {
    http: Client,
    config: PayHereConfig,
}

impl PayHereClient {
    pub fn new(config: PayHereConfig) -> BillingResult<Self> {
        if !config.has_api_credentials() {
            return Err(BillingError::Config(
                "PAYHERE_APP_ID and PAYHERE_APP_SECRET are required for the subscription API"
                    .to_string(),
            ));
        }
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Config(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn basic_auth_header(&self) -> String {
        let credentials = format!("{}:{}", self.config.app_id, self.config.app_secret);
        format!("Basic {}", STANDARD.encode(credentials))
    }

    async fn access_token(&self) -> Result<String, CallError> {
        let response = self
            .http
            .post(format!("{}/oauth/token", self.config.api_url()))
            .header("Authorization", self.basic_auth_header())
            .json(&serde_json::json!({ "grant_type": "client_credentials" }))
            .send()
            .await?;
        classify_status(response.status(), "token endpoint")?;

        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }

    async fn subscription_call(
        &self,
        path: &str,
        provider_subscription_id: &str,
    ) -> Result<(), CallError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}/subscription/{}", self.config.api_url(), path))
            .bearer_auth(token)
            .json(&serde_json::json!({ "subscription_id": provider_subscription_id }))
            .send()
            .await?;
        classify_status(response.status(), path)?;

        let body: ApiResponse = response.json().await?;
        if body.status < 0 {
            return Err(CallError::Permanent(BillingError::Gateway(
                body.msg
                    .unwrap_or_else(|| format!("{} rejected with status {}", path, body.status)),
            )));
        }
        Ok(())
    }

    async fn call_with_retry(&self, path: &str, provider_subscription_id: &str) -> BillingResult<()> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .take(MAX_RETRIES)
            .map(jitter);

        Retry::start(retry_strategy, || async {
            match self.subscription_call(path, provider_subscription_id).await {
                Ok(()) => Ok(Ok(())),
                Err(CallError::Transient(e)) => {
                    tracing::debug!(
                        subscription_id = %provider_subscription_id,
                        error = %e,
                        "Transient gateway error - will retry"
                    );
                    Err(e)
                }
                // Wrapped in Ok to stop retrying
                Err(permanent) => Ok(Err(permanent.into_inner())),
            }
        })
        .await
        .unwrap_or_else(Err)
    }
}

#[async_trait]
impl PaymentGateway for PayHereClient {
    async fn retry_payment(&self, provider_subscription_id: &str) -> BillingResult<()> {
        self.call_with_retry("retry-payment", provider_subscription_id)
            .await?;
        tracing::info!(subscription_id = %provider_subscription_id, "Payment retry initiated at PayHere");
        Ok(())
    }

    async fn cancel_subscription(&self, provider_subscription_id: &str) -> BillingResult<()> {
        self.call_with_retry("cancel", provider_subscription_id).await?;
        tracing::info!(subscription_id = %provider_subscription_id, "Subscription canceled at PayHere");
        Ok(())
    }
}
