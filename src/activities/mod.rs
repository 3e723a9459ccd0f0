#![allow(dead_code)]

//! Workflow Activities (§4.4): the two activity families the Schedule
//! Store's workflows call back into. Both must be idempotent — the
//! Schedule Store retries on transient failure.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::CatalogClient;
use crate::dispatch::DispatchAdapter;
use crate::error::EngineError;
use crate::model::{Channel, NotificationStatus, PublishStatus, Tenant};

#[derive(Debug, Clone, Deserialize)]
pub struct RuleScheduledInput {
    pub rule_id: String,
    pub tenant: Tenant,
    pub business_id: Option<String>,
    /// The rule's target workflow id is read back off the rule record
    /// itself by `getRule`; carried here only because the Schedule Store
    /// passes it as a convenience field on the `rule-scheduled` args (§4.4).
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub rule_payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RuleScheduledOutcome {
    Created { notification_id: String },
    SkippedInactive,
}

pub struct Activities {
    catalog: Arc<CatalogClient>,
    dispatch: Arc<DispatchAdapter>,
}

impl Activities {
    pub fn new(catalog: Arc<CatalogClient>, dispatch: Arc<DispatchAdapter>) -> Self {
        Self { catalog, dispatch }
    }

    /// `rule-scheduled` activity (§4.4). Fired when a CRON schedule's
    /// workflow runs; creates the PENDING notification the polling
    /// pipeline will later pick up and dispatch. Does not dispatch itself.
    pub async fn rule_scheduled(&self, input: RuleScheduledInput) -> Result<RuleScheduledOutcome, EngineError> {
        let tenant = input
            .tenant
            .clone()
            .ok_or_else(|| EngineError::MissingTenant("rule-scheduled activity requires a tenant".to_string()))?;
        let tenant: Tenant = Some(tenant);

        let rule = self
            .catalog
            .get_rule(&input.rule_id, &tenant)
            .await?
            .ok_or_else(|| EngineError::RuleNotFound(input.rule_id.clone()))?;

        if rule.publish_status != PublishStatus::Publish || rule.deactivated {
            tracing::info!(rule_id = %input.rule_id, "rule-scheduled activity: rule inactive, skipping");
            return Ok(RuleScheduledOutcome::SkippedInactive);
        }

        let workflow = self
            .catalog
            .get_workflow_definition(&rule.notification_workflow_id, &tenant)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(rule.notification_workflow_id.clone()))?;

        let recipients = derive_recipients(&input.rule_payload)?;

        let channels = if workflow.default_channels.is_empty() {
            vec![Channel::InApp]
        } else {
            workflow.default_channels.clone()
        };

        let mut record = Map::new();
        record.insert("tenant".to_string(), tenant_value(&tenant));
        record.insert("business_id".to_string(), value_or_null(input.business_id.clone()));
        record.insert("name".to_string(), Value::String(format!("Scheduled: {}", rule.name)));
        record.insert(
            "notification_workflow_id".to_string(),
            Value::String(rule.notification_workflow_id.clone()),
        );
        record.insert("notification_rule_id".to_string(), Value::String(rule.id.clone()));
        record.insert("payload".to_string(), Value::Object(input.rule_payload.clone()));
        record.insert(
            "recipients".to_string(),
            Value::Array(recipients.into_iter().map(Value::String).collect()),
        );
        record.insert(
            "channels".to_string(),
            Value::Array(channels.iter().map(|c| Value::String(c.as_str().to_string())).collect()),
        );
        record.insert("publish_status".to_string(), Value::String("PUBLISH".to_string()));
        record.insert("deactivated".to_string(), Value::Bool(false));
        record.insert(
            "notification_status".to_string(),
            Value::String(NotificationStatus::Pending.as_str().to_string()),
        );

        let created = self.catalog.create_notification(&record).await?;
        Ok(RuleScheduledOutcome::Created {
            notification_id: created.id,
        })
    }

    /// `notification-trigger` activity (§4.4). Fired by the polling
    /// pipeline's workflow for a notification already marked PROCESSING.
    pub async fn notification_trigger(&self, notification_id: &str) -> Result<(), EngineError> {
        let record = self
            .catalog
            .get_notification(notification_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(notification_id.to_string()))?;

        if record.notification_status != NotificationStatus::Processing {
            tracing::info!(
                notification_id,
                status = record.notification_status.as_str(),
                "notification-trigger activity: status changed since admission, skipping"
            );
            return Ok(());
        }

        let now = chrono::Utc::now();
        let still_dispatchable = record.publish_status == PublishStatus::Publish && !record.deactivated;
        if !still_dispatchable {
            self.catalog
                .update_notification_status(
                    notification_id,
                    NotificationStatus::Retracted,
                    &[NotificationStatus::Processing],
                    None,
                    None,
                )
                .await?;
            return Ok(());
        }
        let _ = now; // scheduled_for already honored at admission time; re-checked here is publish/deactivation only.

        let workflow = self
            .catalog
            .get_workflow_definition(&record.notification_workflow_id, &record.tenant)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(record.notification_workflow_id.clone()))?;

        match self.dispatch.dispatch(&record, &workflow).await {
            Ok(result) => {
                self.catalog
                    .update_notification_status(
                        notification_id,
                        NotificationStatus::Sent,
                        &[NotificationStatus::Processing],
                        None,
                        Some(result.transaction_id),
                    )
                    .await?;
                Ok(())
            }
            Err(error) => {
                let retries = record.retries_so_far() + 1;
                let error_details = serde_json::json!({
                    "kind": error_kind(&error),
                    "message": error.to_string(),
                    "retries": retries,
                });
                self.catalog
                    .update_notification_status(
                        notification_id,
                        NotificationStatus::Failed,
                        &[NotificationStatus::Processing],
                        Some(error_details),
                        None,
                    )
                    .await?;
                Err(error)
            }
        }
    }
}

fn error_kind(error: &EngineError) -> &'static str {
    match error {
        EngineError::ProviderTransient(_) => "ProviderTransient",
        EngineError::ProviderPermanent(_) => "ProviderPermanent",
        EngineError::MalformedPayload(_) => "MalformedPayload",
        _ => "Internal",
    }
}

fn tenant_value(tenant: &Tenant) -> Value {
    match tenant {
        Some(t) => Value::String(t.clone()),
        None => Value::Null,
    }
}

fn value_or_null(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

/// Derives `recipients` from the CRON rule payload (§4.4 step 5): a
/// `recipients` array if present, else a singleton `recipient`, else
/// `NoRecipients`.
fn derive_recipients(rule_payload: &Map<String, Value>) -> Result<Vec<String>, EngineError> {
    if let Some(Value::Array(items)) = rule_payload.get("recipients") {
        let recipients: Vec<String> = items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        if !recipients.is_empty() {
            return Ok(recipients);
        }
    }
    if let Some(Value::String(single)) = rule_payload.get("recipient") {
        return Ok(vec![single.clone()]);
    }
    Err(EngineError::NoRecipients(
        "rule_payload has neither `recipients` nor `recipient`".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_recipients_prefers_array() {
        let mut payload = Map::new();
        payload.insert(
            "recipients".to_string(),
            Value::Array(vec![Value::String("a@example.com".to_string())]),
        );
        payload.insert("recipient".to_string(), Value::String("b@example.com".to_string()));
        assert_eq!(derive_recipients(&payload).unwrap(), vec!["a@example.com"]);
    }

    #[test]
    fn derive_recipients_falls_back_to_singleton() {
        let mut payload = Map::new();
        payload.insert("recipient".to_string(), Value::String("solo@example.com".to_string()));
        assert_eq!(derive_recipients(&payload).unwrap(), vec!["solo@example.com"]);
    }

    #[test]
    fn derive_recipients_fails_with_neither() {
        let payload = Map::new();
        assert!(matches!(derive_recipients(&payload), Err(EngineError::NoRecipients(_))));
    }
}
