#![allow(dead_code)]

//! Delivery Provider: the third-party channel-delivery service contract
//! (§6.3). Modeled as a trait plus an HTTP-backed client, batching and
//! per-response error classification grounded in the teacher's Expo push
//! notification sender (`services/notification_center.rs`).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::error::EngineError;

#[derive(Debug, Clone, Serialize)]
pub struct TriggerRequest {
    pub workflow_key: String,
    pub recipients: Vec<String>,
    pub payload: Value,
    pub overrides: Value,
    /// Per-channel artifacts the Dispatch Adapter already rendered through
    /// the Template Engine (§4.5/§4.6), keyed by channel name (`EMAIL`,
    /// `IN_APP`, …). Empty when the workflow has no template reference for
    /// a resolved channel — the provider is then expected to render from
    /// `workflow_key` itself.
    pub rendered: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerResult {
    pub acknowledged: bool,
    pub transaction_id: String,
}

#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    async fn trigger(&self, request: TriggerRequest) -> Result<TriggerResult, EngineError>;
}

pub struct HttpDeliveryProvider {
    config: Arc<EngineConfig>,
    http: reqwest::Client,
}

impl HttpDeliveryProvider {
    pub fn new(config: Arc<EngineConfig>, http: reqwest::Client) -> Self {
        Self { config, http }
    }
}

#[async_trait]
impl DeliveryProvider for HttpDeliveryProvider {
    async fn trigger(&self, request: TriggerRequest) -> Result<TriggerResult, EngineError> {
        let url = self.config.delivery_provider_url.as_deref().ok_or_else(|| {
            EngineError::Config("DELIVERY_PROVIDER_URL is not configured".to_string())
        })?;

        let mut builder = self.http.post(url).json(&request);
        if let Some(key) = &self.config.delivery_provider_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|error| {
            EngineError::ProviderTransient(format!("delivery provider request failed: {error}"))
        })?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<TriggerResult>()
                .await
                .map_err(|error| EngineError::MalformedPayload(error.to_string()))
        } else if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "delivery provider rejected payload");
            Err(EngineError::ProviderPermanent(format!(
                "delivery provider returned {status}"
            )))
        } else {
            tracing::warn!(status = %status, "delivery provider transient failure");
            Err(EngineError::ProviderTransient(format!(
                "delivery provider returned {status}"
            )))
        }
    }
}
