//! Client for the billing collaborator that owns gift balances, spend
//! settings, and usage charges.

use crate::models::{RecordUsageCharge, SpendSafetySettings, UsageChargeResult, UsageLedgerSummary};
use crate::services::metrics::record_collaborator_call;
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use service_core::error::AppError;
use service_core::observability::{current_request_id, inject_trace_headers};
use std::time::Duration;
use tracing::{instrument, warn};

#[async_trait]
pub trait BillingClient: Send + Sync {
    async fn get_usage_ledger_summary(&self, shop_id: &str)
        -> Result<UsageLedgerSummary, AppError>;

    async fn get_spend_safety_settings(
        &self,
        shop_id: &str,
    ) -> Result<SpendSafetySettings, AppError>;

    /// Must be idempotent per `charge.idempotency_key`.
    async fn record_usage_charge(
        &self,
        charge: &RecordUsageCharge,
    ) -> Result<UsageChargeResult, AppError>;
}

/// JSON-over-HTTP implementation.
///
/// Transport failures, 429 and 5xx are retried with exponential backoff until
/// the retry budget runs out. Charges are retried too; the collaborator
/// dedupes them by idempotency key. Other 4xx responses fail immediately.
#[derive(Clone)]
pub struct HttpBillingClient {
    client: Client,
    base_url: Url,
    retry_budget: Duration,
}

#[derive(Serialize)]
struct UsageChargeBody<'a> {
    total_cost_usd: rust_decimal::Decimal,
    idempotency_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

impl HttpBillingClient {
    pub fn new(base_url: &str, timeout: Duration, retry_budget: Duration) -> Result<Self, AppError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Invalid billing service URL '{}': {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Billing service URL '{}' cannot be used as a base",
                base_url
            )));
        }

        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            base_url,
            retry_budget,
        })
    }

    fn shop_url(&self, shop_id: &str, tail: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // cannot_be_a_base was rejected in new(), so segments are always available
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["v1", "shops", shop_id]).extend(tail);
        }
        url
    }

    async fn send_json<T, F>(&self, operation: &'static str, build: F) -> Result<T, AppError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(self.retry_budget),
            ..Default::default()
        };

        let request_id = current_request_id();

        let result = retry(policy, || async {
            let mut headers = HeaderMap::new();
            inject_trace_headers(&mut headers, request_id.as_deref());

            let response = build().headers(headers).send().await.map_err(|e| {
                let err = AppError::BadGateway(format!("{} request failed: {}", operation, e));
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    warn!(operation, error = %e, "Billing collaborator unreachable, will retry");
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })?;

            let status = response.status();
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                warn!(operation, status = status.as_u16(), "Billing collaborator error, will retry");
                return Err(backoff::Error::transient(AppError::BadGateway(format!(
                    "{} returned {}",
                    operation, status
                ))));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(AppError::BadGateway(format!(
                    "{} returned {}: {}",
                    operation, status, body
                ))));
            }

            response.json::<T>().await.map_err(|e| {
                backoff::Error::permanent(AppError::BadGateway(format!(
                    "{} returned an unreadable body: {}",
                    operation, e
                )))
            })
        })
        .await;

        record_collaborator_call(operation, if result.is_ok() { "ok" } else { "error" });
        result
    }
}

#[async_trait]
impl BillingClient for HttpBillingClient {
    #[instrument(skip(self))]
    async fn get_usage_ledger_summary(
        &self,
        shop_id: &str,
    ) -> Result<UsageLedgerSummary, AppError> {
        let url = self.shop_url(shop_id, &["usage-ledger", "summary"]);
        self.send_json("get_usage_ledger_summary", || self.client.get(url.clone()))
            .await
    }

    #[instrument(skip(self))]
    async fn get_spend_safety_settings(
        &self,
        shop_id: &str,
    ) -> Result<SpendSafetySettings, AppError> {
        let url = self.shop_url(shop_id, &["spend-safety"]);
        self.send_json("get_spend_safety_settings", || self.client.get(url.clone()))
            .await
    }

    #[instrument(skip(self, charge), fields(shop_id = %charge.shop_id, idempotency_key = %charge.idempotency_key))]
    async fn record_usage_charge(
        &self,
        charge: &RecordUsageCharge,
    ) -> Result<UsageChargeResult, AppError> {
        let url = self.shop_url(&charge.shop_id, &["usage-charges"]);
        let body = UsageChargeBody {
            total_cost_usd: charge.total_cost_usd,
            idempotency_key: &charge.idempotency_key,
            description: charge.description.as_deref(),
        };

        self.send_json("record_usage_charge", || {
            self.client
                .post(url.clone())
                .header("idempotency-key", charge.idempotency_key.as_str())
                .json(&body)
        })
        .await
    }
}
