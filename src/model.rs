//! Domain types shared across the Catalog Access Layer, the polling
//! pipeline, the workflow activities, and the dispatch adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The multi-tenancy scope identifier. `None` means "global".
pub type Tenant = Option<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PublishStatus {
    Draft,
    Publish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowType {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Email,
    InApp,
    Sms,
    Push,
    Chat,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::InApp => "IN_APP",
            Channel::Sms => "SMS",
            Channel::Push => "PUSH",
            Channel::Chat => "CHAT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerType {
    Cron,
    /// Any other trigger type the Catalog DB may carry; out of scope for
    /// reconciliation (§3).
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Retracted,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Processing => "PROCESSING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Failed => "FAILED",
            NotificationStatus::Retracted => "RETRACTED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub cron: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub tenant: Tenant,
    pub workflow_key: String,
    pub name: String,
    pub description: Option<String>,
    pub workflow_type: WorkflowType,
    pub default_channels: Vec<Channel>,
    pub template_overrides: Value,
    pub publish_status: PublishStatus,
    pub deactivated: bool,
}

impl WorkflowDefinition {
    pub fn is_eligible(&self) -> bool {
        self.publish_status == PublishStatus::Publish && !self.deactivated
    }
}

#[derive(Debug, Clone)]
pub struct NotificationRule {
    pub id: String,
    pub tenant: Tenant,
    pub business_id: Option<String>,
    pub name: String,
    pub notification_workflow_id: String,
    pub trigger_type: TriggerType,
    pub trigger_config: Option<TriggerConfig>,
    pub rule_payload: Map<String, Value>,
    pub publish_status: PublishStatus,
    pub deactivated: bool,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRule {
    /// Eligibility per §3: published, not deactivated, CRON-triggered, and
    /// the CRON expression parses. Does NOT check the referenced workflow
    /// definition — the catalog layer joins and filters on that.
    pub fn is_self_eligible(&self) -> bool {
        if self.publish_status != PublishStatus::Publish || self.deactivated {
            return false;
        }
        if self.trigger_type != TriggerType::Cron {
            return false;
        }
        match &self.trigger_config {
            Some(cfg) => match &cfg.cron {
                Some(expr) => crate::reconciliation::parse_cron(expr).is_ok(),
                None => false,
            },
            None => false,
        }
    }

    pub fn timezone(&self) -> String {
        self.trigger_config
            .as_ref()
            .and_then(|cfg| cfg.timezone.clone())
            .unwrap_or_else(|| "UTC".to_string())
    }

    pub fn schedule_id(&self) -> String {
        schedule_id(&self.id, &self.tenant)
    }
}

pub fn schedule_id(rule_id: &str, tenant: &Tenant) -> String {
    format!("rule-{rule_id}-{}", tenant.as_deref().unwrap_or("null"))
}

#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub id: String,
    pub tenant: Tenant,
    pub business_id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub payload: Map<String, Value>,
    pub recipients: Vec<String>,
    pub notification_workflow_id: String,
    pub notification_rule_id: Option<String>,
    pub channels: Option<Vec<Channel>>,
    pub overrides: Option<Value>,
    pub publish_status: PublishStatus,
    pub deactivated: bool,
    pub notification_status: NotificationStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub transaction_id: Option<String>,
    pub error_details: Option<Value>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRecord {
    /// Dispatchable-now invariant (§3): published, not deactivated, PENDING,
    /// and `scheduled_for` is either absent or `<= now` (inclusive boundary).
    pub fn is_dispatchable_now(&self, now: DateTime<Utc>) -> bool {
        self.publish_status == PublishStatus::Publish
            && !self.deactivated
            && self.notification_status == NotificationStatus::Pending
            && self.scheduled_for.map(|at| at <= now).unwrap_or(true)
    }

    pub fn retries_so_far(&self) -> u32 {
        self.error_details
            .as_ref()
            .and_then(|v| v.get("retries"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }
}

#[derive(Debug, Clone)]
pub struct Template {
    pub id: String,
    pub tenant: Tenant,
    pub template_key: String,
    pub name: Option<String>,
    pub subject_template: Option<String>,
    pub body_template: String,
    pub channel_type: Channel,
    pub publish_status: PublishStatus,
    pub deactivated: bool,
}

impl Template {
    pub fn is_resolvable(&self, ctx_tenant: &Tenant) -> bool {
        if self.publish_status != PublishStatus::Publish || self.deactivated {
            return false;
        }
        self.tenant.is_none() || self.tenant == *ctx_tenant
    }
}

/// `scheduledMode` parameter of `pollNotifications` (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledMode {
    Any,
    EligibleNow,
    OnlyScheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorStatusFilter {
    /// New-work / due-scheduled loops: `notification_status = PENDING`.
    Pending,
    /// Failed-retry loop: `notification_status = FAILED`.
    Failed,
}

impl PriorStatusFilter {
    pub fn as_status(&self) -> NotificationStatus {
        match self {
            PriorStatusFilter::Pending => NotificationStatus::Pending,
            PriorStatusFilter::Failed => NotificationStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PollOptions {
    pub tenant: Tenant,
    pub batch_size: u32,
    pub updated_after: Option<DateTime<Utc>>,
    pub include_processed: bool,
    pub scheduled_mode: Option<ScheduledMode>,
    pub status_filter: Option<PriorStatusFilter>,
}

impl Default for ScheduledMode {
    fn default() -> Self {
        ScheduledMode::Any
    }
}
