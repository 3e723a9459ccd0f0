#![allow(dead_code)]

//! Dispatch Adapter (§4.6): turns a Notification Record plus its Workflow
//! Definition into a concrete `DeliveryProvider::trigger` call.

use std::sync::Arc;

use serde_json::Value;

use crate::delivery::{DeliveryProvider, TriggerRequest, TriggerResult};
use crate::error::EngineError;
use crate::model::{Channel, NotificationRecord, WorkflowDefinition};
use crate::template::channel::EmailOptions;
use crate::template::{interpolate_plain, TemplateEngine};

pub struct DispatchAdapter {
    delivery: Arc<dyn DeliveryProvider>,
    templates: Arc<TemplateEngine>,
}

impl DispatchAdapter {
    pub fn new(delivery: Arc<dyn DeliveryProvider>, templates: Arc<TemplateEngine>) -> Self {
        Self { delivery, templates }
    }

    /// Resolves the channel set a notification dispatches on (§4.6 step 1):
    /// the record's own `channels`, falling back to the workflow's
    /// `default_channels`.
    pub fn resolve_channels(record: &NotificationRecord, workflow: &WorkflowDefinition) -> Vec<Channel> {
        record
            .channels
            .clone()
            .unwrap_or_else(|| workflow.default_channels.clone())
    }

    /// The per-channel template key a workflow has on file for `channel`,
    /// read out of its `template_overrides` map (§3 Workflow Definition:
    /// "optional per-channel template references").
    fn template_key_for(workflow: &WorkflowDefinition, channel: Channel) -> Option<String> {
        workflow
            .template_overrides
            .get(channel.as_str())
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Renders every resolved channel that has a template reference on the
    /// workflow (§4.6 step 2), through the Template Engine (§4.5). A
    /// channel with no template reference, or whose template fails to
    /// resolve, is skipped rather than failing dispatch — the Delivery
    /// Provider is expected to fall back to rendering from `workflow_key`
    /// for that channel, and rendering errors never fail the dispatch (§7).
    async fn render_channels(
        &self,
        record: &NotificationRecord,
        workflow: &WorkflowDefinition,
        channels: &[Channel],
    ) -> Value {
        let mut rendered = serde_json::Map::new();
        let email_opts = EmailOptions::default();
        for channel in channels {
            let Some(template_key) = Self::template_key_for(workflow, *channel) else {
                continue;
            };
            match self
                .templates
                .render_by_key(&template_key, &record.tenant, &record.payload, &email_opts)
                .await
            {
                Ok(outcome) => {
                    if !outcome.errors.is_empty() {
                        tracing::warn!(
                            channel = channel.as_str(),
                            template_key = %template_key,
                            errors = ?outcome.errors,
                            "template render produced non-fatal errors"
                        );
                    }
                    match serde_json::to_value(&outcome.rendered) {
                        Ok(value) => {
                            rendered.insert(channel.as_str().to_string(), value);
                        }
                        Err(error) => {
                            tracing::warn!(channel = channel.as_str(), %error, "failed to serialize rendered channel payload");
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        channel = channel.as_str(),
                        template_key = %template_key,
                        %error,
                        "no renderable template for channel; dispatch continues"
                    );
                }
            }
        }
        Value::Object(rendered)
    }

    /// Recursively interpolates every string leaf of `overrides` against
    /// `record.payload` (§4.6 step 2). Non-string leaves pass through
    /// unchanged.
    fn render_overrides(overrides: &Value, payload_vars: &serde_json::Map<String, Value>) -> Value {
        match overrides {
            Value::String(s) => Value::String(interpolate_plain(s, payload_vars)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| Self::render_overrides(item, payload_vars))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::render_overrides(v, payload_vars)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub async fn dispatch(
        &self,
        record: &NotificationRecord,
        workflow: &WorkflowDefinition,
    ) -> Result<TriggerResult, EngineError> {
        let channels = Self::resolve_channels(record, workflow);
        let rendered = self.render_channels(record, workflow, &channels).await;

        let rendered_overrides = match &record.overrides {
            Some(overrides) => Self::render_overrides(overrides, &record.payload),
            None => Value::Object(serde_json::Map::new()),
        };

        let request = TriggerRequest {
            workflow_key: workflow.workflow_key.clone(),
            recipients: record.recipients.clone(),
            payload: Value::Object(record.payload.clone()),
            overrides: rendered_overrides,
            rendered,
        };

        self.delivery.trigger(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    use crate::catalog::CatalogClient;
    use crate::model::{PublishStatus, Tenant, WorkflowType};

    /// A `TemplateEngine` needs a `CatalogClient`, which wraps a `PgPool`.
    /// `connect_lazy` builds the pool without opening a connection, which
    /// is fine here: every test workflow has `template_overrides: Null`, so
    /// `render_channels` never has a template key to look up and the pool
    /// is never touched.
    fn template_engine_for_test() -> Arc<TemplateEngine> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool construction does not require a live connection");
        Arc::new(TemplateEngine::new(Arc::new(CatalogClient::new(pool)), 300, 10))
    }

    struct RecordingProvider {
        last_request: Mutex<Option<TriggerRequest>>,
    }

    #[async_trait]
    impl DeliveryProvider for RecordingProvider {
        async fn trigger(&self, request: TriggerRequest) -> Result<TriggerResult, EngineError> {
            *self.last_request.lock().unwrap() = Some(request);
            Ok(TriggerResult {
                acknowledged: true,
                transaction_id: "tx-1".to_string(),
            })
        }
    }

    fn workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf-1".to_string(),
            tenant: None,
            workflow_key: "welcome".to_string(),
            name: "Welcome".to_string(),
            description: None,
            workflow_type: WorkflowType::Static,
            default_channels: vec![Channel::Email],
            template_overrides: Value::Null,
            publish_status: PublishStatus::Publish,
            deactivated: false,
        }
    }

    fn record(overrides: Option<Value>, channels: Option<Vec<Channel>>) -> NotificationRecord {
        let tenant: Tenant = None;
        NotificationRecord {
            id: "n-1".to_string(),
            tenant,
            business_id: None,
            name: None,
            description: None,
            payload: json!({"name": "Ada"}).as_object().unwrap().clone(),
            recipients: vec!["ada@example.com".to_string()],
            notification_workflow_id: "wf-1".to_string(),
            notification_rule_id: None,
            channels,
            overrides,
            publish_status: PublishStatus::Publish,
            deactivated: false,
            notification_status: crate::model::NotificationStatus::Processing,
            scheduled_for: None,
            transaction_id: None,
            error_details: None,
            processed_at: None,
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn resolve_channels_falls_back_to_workflow_defaults() {
        let wf = workflow();
        let rec = record(None, None);
        assert_eq!(DispatchAdapter::resolve_channels(&rec, &wf), vec![Channel::Email]);
    }

    #[test]
    fn resolve_channels_prefers_record_channels() {
        let wf = workflow();
        let rec = record(None, Some(vec![Channel::Sms]));
        assert_eq!(DispatchAdapter::resolve_channels(&rec, &wf), vec![Channel::Sms]);
    }

    #[tokio::test]
    async fn dispatch_interpolates_string_leaves_of_overrides() {
        let provider = Arc::new(RecordingProvider {
            last_request: Mutex::new(None),
        });
        let adapter = DispatchAdapter::new(provider.clone(), template_engine_for_test());
        let overrides = json!({"email": {"subject": "Hi {{ name }}", "count": 3}});
        let rec = record(Some(overrides), None);
        let wf = workflow();

        adapter.dispatch(&rec, &wf).await.unwrap();

        let sent = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(sent.overrides["email"]["subject"], json!("Hi Ada"));
        assert_eq!(sent.overrides["email"]["count"], json!(3));
    }

    #[test]
    fn template_key_for_reads_the_workflow_override_for_the_channel() {
        let mut wf = workflow();
        wf.template_overrides = json!({"EMAIL": "welcome-email"});
        assert_eq!(
            DispatchAdapter::template_key_for(&wf, Channel::Email),
            Some("welcome-email".to_string())
        );
        assert_eq!(DispatchAdapter::template_key_for(&wf, Channel::Sms), None);
    }

    #[tokio::test]
    async fn dispatch_produces_empty_rendered_map_when_no_channel_has_a_template_reference() {
        let provider = Arc::new(RecordingProvider {
            last_request: Mutex::new(None),
        });
        let adapter = DispatchAdapter::new(provider.clone(), template_engine_for_test());
        let rec = record(None, None);
        let wf = workflow();

        adapter.dispatch(&rec, &wf).await.unwrap();

        let sent = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(sent.rendered, json!({}));
    }
}
