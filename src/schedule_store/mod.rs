#![allow(dead_code)]

//! Schedule Store: the abstract contract for the durable, CRON-aware
//! workflow scheduler the engine depends on but does not define (§6.2).
//! No concrete SDK for such a scheduler exists in this project's
//! dependency corpus, so the contract is expressed as a trait; the only
//! implementation shipped here speaks a small JSON/HTTP RPC surface,
//! following the same "thin client behind a trait" shape the dispatch
//! adapter uses for the Delivery Provider.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::error::EngineError;

pub const SCHEDULE_ID_PREFIX: &str = "rule-";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub cron_expressions: Vec<String>,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleAction {
    pub workflow_type: String,
    pub args: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ScheduleState {
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleObject {
    pub id: String,
    pub spec: ScheduleSpec,
    pub action: ScheduleAction,
    pub state: ScheduleState,
    pub memo: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct StartWorkflowOptions {
    pub task_queue: String,
    pub start_delay: Duration,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// The `notification-trigger` activity's retry policy (§4.4): initial
    /// 1s, coefficient 2, max 5min, max 10 attempts.
    pub fn notification_trigger_default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(5 * 60),
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowDescription {
    pub id: String,
    pub running: bool,
}

/// Error classification for Schedule Store RPCs (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStoreErrorKind {
    NotFound,
    Unavailable,
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create_schedule(
        &self,
        spec: ScheduleSpec,
        action: ScheduleAction,
        state: ScheduleState,
        memo: Map<String, Value>,
        id: &str,
    ) -> Result<(), EngineError>;

    async fn update_schedule(
        &self,
        id: &str,
        spec: ScheduleSpec,
        state: ScheduleState,
    ) -> Result<(), EngineError>;

    async fn delete_schedule(&self, id: &str) -> Result<(), EngineError>;

    async fn list_schedules(&self, prefix: Option<&str>) -> Result<Vec<ScheduleObject>, EngineError>;

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleObject>, EngineError>;

    async fn start_workflow(
        &self,
        workflow_type: &str,
        id: &str,
        args: Map<String, Value>,
        opts: StartWorkflowOptions,
    ) -> Result<(), EngineError>;

    async fn describe_workflow(&self, id: &str) -> Result<Option<WorkflowDescription>, EngineError>;

    async fn ensure_namespace(&self, name: &str) -> Result<(), EngineError>;
}

/// HTTP-backed `ScheduleStore`. Talks JSON-over-HTTP to
/// `SCHEDULE_STORE_ADDRESS`; swapping in a real scheduler SDK later only
/// requires a new trait impl, not changes to any caller.
pub struct HttpScheduleStoreClient {
    config: Arc<EngineConfig>,
    http: reqwest::Client,
    base_url: String,
}

impl HttpScheduleStoreClient {
    pub fn new(config: Arc<EngineConfig>, http: reqwest::Client) -> Self {
        let base_url = if config.schedule_store_address.starts_with("http") {
            config.schedule_store_address.clone()
        } else {
            format!("http://{}", config.schedule_store_address)
        };
        Self {
            config,
            http,
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/namespaces/{}{}", self.base_url, self.config.schedule_store_namespace, path)
    }

    fn classify(status: reqwest::StatusCode) -> EngineError {
        if status == reqwest::StatusCode::NOT_FOUND {
            EngineError::ScheduleStoreNotFound("schedule not found".to_string())
        } else {
            EngineError::ScheduleStoreUnavailable(format!("schedule store returned {status}"))
        }
    }
}

#[async_trait]
impl ScheduleStore for HttpScheduleStoreClient {
    async fn create_schedule(
        &self,
        spec: ScheduleSpec,
        action: ScheduleAction,
        state: ScheduleState,
        memo: Map<String, Value>,
        id: &str,
    ) -> Result<(), EngineError> {
        let body = ScheduleObject {
            id: id.to_string(),
            spec,
            action,
            state,
            memo,
        };
        let response = self
            .http
            .put(self.url(&format!("/schedules/{id}")))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::ScheduleStoreUnavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify(response.status()))
        }
    }

    async fn update_schedule(
        &self,
        id: &str,
        spec: ScheduleSpec,
        state: ScheduleState,
    ) -> Result<(), EngineError> {
        let response = self
            .http
            .patch(self.url(&format!("/schedules/{id}")))
            .json(&serde_json::json!({ "spec": spec, "state": state }))
            .send()
            .await
            .map_err(|e| EngineError::ScheduleStoreUnavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify(response.status()))
        }
    }

    async fn delete_schedule(&self, id: &str) -> Result<(), EngineError> {
        let response = self
            .http
            .delete(self.url(&format!("/schedules/{id}")))
            .send()
            .await
            .map_err(|e| EngineError::ScheduleStoreUnavailable(e.to_string()))?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::classify(response.status()))
        }
    }

    async fn list_schedules(&self, prefix: Option<&str>) -> Result<Vec<ScheduleObject>, EngineError> {
        let mut request = self.http.get(self.url("/schedules"));
        if let Some(prefix) = prefix {
            request = request.query(&[("prefix", prefix)]);
        }
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::ScheduleStoreUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::classify(response.status()));
        }
        response
            .json::<Vec<ScheduleObject>>()
            .await
            .map_err(|e| EngineError::ScheduleStoreUnavailable(e.to_string()))
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleObject>, EngineError> {
        let response = self
            .http
            .get(self.url(&format!("/schedules/{id}")))
            .send()
            .await
            .map_err(|e| EngineError::ScheduleStoreUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::classify(response.status()));
        }
        response
            .json::<ScheduleObject>()
            .await
            .map(Some)
            .map_err(|e| EngineError::ScheduleStoreUnavailable(e.to_string()))
    }

    async fn start_workflow(
        &self,
        workflow_type: &str,
        id: &str,
        args: Map<String, Value>,
        opts: StartWorkflowOptions,
    ) -> Result<(), EngineError> {
        let body = serde_json::json!({
            "workflow_type": workflow_type,
            "args": args,
            "task_queue": opts.task_queue,
            "start_delay_ms": opts.start_delay.as_millis() as u64,
        });
        let response = self
            .http
            .put(self.url(&format!("/workflows/{id}")))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::ScheduleStoreUnavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::classify(response.status()))
        }
    }

    async fn describe_workflow(&self, id: &str) -> Result<Option<WorkflowDescription>, EngineError> {
        let response = self
            .http
            .get(self.url(&format!("/workflows/{id}")))
            .send()
            .await
            .map_err(|e| EngineError::ScheduleStoreUnavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::classify(response.status()));
        }
        response
            .json::<WorkflowDescription>()
            .await
            .map(Some)
            .map_err(|e| EngineError::ScheduleStoreUnavailable(e.to_string()))
    }

    async fn ensure_namespace(&self, name: &str) -> Result<(), EngineError> {
        let response = self
            .http
            .put(format!("{}/namespaces/{name}", self.base_url))
            .json(&serde_json::json!({ "retention_days": 7 }))
            .send()
            .await
            .map_err(|e| EngineError::ScheduleStoreUnavailable(e.to_string()))?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::CONFLICT {
            Ok(())
        } else {
            Err(Self::classify(response.status()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_matches_notification_trigger_spec() {
        let policy = RetryPolicy::notification_trigger_default();
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
        assert_eq!(policy.max_interval, Duration::from_secs(300));
        assert_eq!(policy.max_attempts, 10);
    }
}
