#![allow(dead_code)]

//! Catalog Access Layer: typed, tenant-scoped reads and narrow writes
//! against the Catalog DB. This is the only component permitted to speak
//! to the database directly.
//!
//! Dynamic-SQL identifiers (columns/tables) are never accepted from the
//! network in this layer — every query below is fixed at compile time —
//! but writes still go through `jsonb_populate_record` so Postgres, not
//! hand-maintained Rust structs, resolves column types.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};

use crate::error::{map_db_error, EngineError};
use crate::model::{
    Channel, NotificationRecord, NotificationRule, NotificationStatus, PollOptions,
    PriorStatusFilter, PublishStatus, ScheduledMode, Template, Tenant, TriggerConfig,
    TriggerType, WorkflowDefinition, WorkflowType,
};

pub struct CatalogClient {
    pool: PgPool,
}

impl CatalogClient {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `getActiveCronRules(tenant?)` — rules joined with their workflow
    /// definitions, filtered to rules and workflows that both pass their
    /// eligibility invariants (§3, §4.1).
    pub async fn get_active_cron_rules(
        &self,
        tenant: &Tenant,
    ) -> Result<Vec<NotificationRule>, EngineError> {
        let rows = sqlx::query(
            "SELECT r.id, r.tenant, r.business_id, r.name, r.notification_workflow_id,
                    r.trigger_type, r.trigger_config, r.rule_payload,
                    r.publish_status, r.deactivated, r.updated_at
             FROM notification_rule r
             JOIN notification_workflow w
               ON w.id = r.notification_workflow_id
              AND (w.tenant = r.tenant OR w.tenant IS NULL)
             WHERE r.trigger_type = 'CRON'
               AND r.publish_status = 'PUBLISH'
               AND r.deactivated = false
               AND w.publish_status = 'PUBLISH'
               AND w.deactivated = false
               AND ($1::text IS NULL OR r.tenant = $1)
             ORDER BY r.id ASC",
        )
        .bind(tenant.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            let rule = row_to_rule(&row)?;
            if rule.is_self_eligible() {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    /// `getRule(id, tenant)` → rule or null.
    pub async fn get_rule(
        &self,
        id: &str,
        tenant: &Tenant,
    ) -> Result<Option<NotificationRule>, EngineError> {
        let row = sqlx::query(
            "SELECT id, tenant, business_id, name, notification_workflow_id,
                    trigger_type, trigger_config, rule_payload,
                    publish_status, deactivated, updated_at
             FROM notification_rule
             WHERE id = $1 AND tenant IS NOT DISTINCT FROM $2
             LIMIT 1",
        )
        .bind(id)
        .bind(tenant.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        row.as_ref().map(row_to_rule).transpose()
    }

    /// `getWorkflowDefinition(id, tenant)` — tenant-scoped lookup, falling
    /// back to a global (`tenant IS NULL`) definition, returning the first
    /// eligible hit.
    pub async fn get_workflow_definition(
        &self,
        id: &str,
        tenant: &Tenant,
    ) -> Result<Option<WorkflowDefinition>, EngineError> {
        let row = sqlx::query(
            "SELECT id, tenant, workflow_key, name, description, workflow_type,
                    default_channels, template_overrides, publish_status, deactivated
             FROM notification_workflow
             WHERE id = $1 AND tenant IS NOT DISTINCT FROM $2
             LIMIT 1",
        )
        .bind(id)
        .bind(tenant.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        if let Some(row) = row {
            let wf = row_to_workflow(&row)?;
            if wf.is_eligible() {
                return Ok(Some(wf));
            }
            return Ok(None);
        }

        if tenant.is_none() {
            return Ok(None);
        }

        let row = sqlx::query(
            "SELECT id, tenant, workflow_key, name, description, workflow_type,
                    default_channels, template_overrides, publish_status, deactivated
             FROM notification_workflow
             WHERE id = $1 AND tenant IS NULL
             LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        match row {
            Some(row) => {
                let wf = row_to_workflow(&row)?;
                Ok(wf.is_eligible().then_some(wf))
            }
            None => Ok(None),
        }
    }

    /// `pollNotifications(opts)` (§4.3) — ordered `(record)` list matching
    /// tenant scope, publish/deactivation eligibility, status/scheduling
    /// predicates, and the `updatedAfter` watermark.
    pub async fn poll_notifications(
        &self,
        opts: &PollOptions,
    ) -> Result<Vec<NotificationRecord>, EngineError> {
        let batch_size = opts.batch_size.clamp(1, 1000) as i64;
        let now = Utc::now();

        let status_clause = if opts.include_processed {
            None
        } else {
            Some(match opts.status_filter {
                Some(PriorStatusFilter::Failed) => "notification_status = 'FAILED'",
                _ => "notification_status IN ('PENDING', 'FAILED')",
            })
        };

        let scheduled_clause = match opts.scheduled_mode.unwrap_or(ScheduledMode::Any) {
            ScheduledMode::Any => None,
            ScheduledMode::EligibleNow => {
                Some("(scheduled_for IS NULL OR scheduled_for <= $next)")
            }
            ScheduledMode::OnlyScheduled => {
                Some("notification_status = 'PENDING' AND scheduled_for <= $next")
            }
        };

        // Fixed, parameterized SQL assembled from a small set of known
        // clauses — no user-controlled identifiers ever reach this query.
        let mut sql = String::from(
            "SELECT id, tenant, business_id, name, description, payload, recipients,
                    notification_workflow_id, notification_rule_id, channels, overrides,
                    publish_status, deactivated, notification_status, scheduled_for,
                    transaction_id, error_details, processed_at, updated_at
             FROM notification
             WHERE publish_status = 'PUBLISH' AND deactivated = false",
        );
        let mut next_param = 1;
        let mut binds: Vec<BindValue> = Vec::new();

        sql.push_str(&format!(" AND ($${next_param} IS NULL OR tenant = $${next_param})"));
        binds.push(BindValue::Text(opts.tenant.clone()));
        next_param += 1;

        if let Some(clause) = status_clause {
            sql.push_str(" AND ");
            sql.push_str(clause);
        }

        if let Some(clause) = scheduled_clause {
            let placeholder = format!("${next_param}");
            sql.push_str(" AND ");
            sql.push_str(&clause.replace("$next", &placeholder));
            binds.push(BindValue::Timestamp(now));
            next_param += 1;
        }

        if let Some(after) = opts.updated_after {
            sql.push_str(&format!(" AND updated_at > ${next_param}"));
            binds.push(BindValue::Timestamp(after));
            next_param += 1;
        }

        sql.push_str(" ORDER BY updated_at ASC, id ASC LIMIT ");
        sql.push_str(&format!("${next_param}"));
        binds.push(BindValue::BatchSize(batch_size));

        // Placeholder numbering above used `$$n` as a scratch marker for
        // the tenant clause (bound once, referenced twice); rewrite to
        // real sqlx placeholders in bind order.
        let sql = rewrite_placeholders(&sql);

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = match bind {
                BindValue::Text(v) => query.bind(v.clone()),
                BindValue::Timestamp(v) => query.bind(*v),
                BindValue::BatchSize(v) => query.bind(*v),
            };
        }

        let rows = query.fetch_all(&self.pool).await.map_err(map_db_error)?;
        rows.iter().map(row_to_notification).collect()
    }

    /// `createNotification(record)` via `jsonb_populate_record`, matching
    /// the Catalog Access Layer's write idiom.
    pub async fn create_notification(
        &self,
        payload: &Map<String, Value>,
    ) -> Result<NotificationRecord, EngineError> {
        if payload.is_empty() {
            return Err(EngineError::Validation(
                "cannot create an empty notification".to_string(),
            ));
        }

        let row = sqlx::query(
            "INSERT INTO notification
             SELECT r.* FROM jsonb_populate_record(NULL::notification, $1) r
             RETURNING id, tenant, business_id, name, description, payload, recipients,
                       notification_workflow_id, notification_rule_id, channels, overrides,
                       publish_status, deactivated, notification_status, scheduled_for,
                       transaction_id, error_details, processed_at, updated_at",
        )
        .bind(Value::Object(payload.clone()))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        let row = row.ok_or_else(|| {
            EngineError::Internal("insert into notification returned no row".to_string())
        })?;
        row_to_notification(&row)
    }

    /// Dedicated single-row read used by the `notification-trigger`
    /// activity (§4.4) to load the record it was handed an id for.
    pub async fn get_notification(&self, id: &str) -> Result<Option<NotificationRecord>, EngineError> {
        let row = sqlx::query(
            "SELECT id, tenant, business_id, name, description, payload, recipients,
                    notification_workflow_id, notification_rule_id, channels, overrides,
                    publish_status, deactivated, notification_status, scheduled_for,
                    transaction_id, error_details, processed_at, updated_at
             FROM notification
             WHERE id = $1
             LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        row.as_ref().map(row_to_notification).transpose()
    }

    /// `updateNotificationStatus(id, newStatus, opts)` — conditional update
    /// on prior status; returns `true` iff the row was actually updated.
    pub async fn update_notification_status(
        &self,
        id: &str,
        new_status: NotificationStatus,
        allowed_prior: &[NotificationStatus],
        error_details: Option<Value>,
        transaction_id: Option<String>,
    ) -> Result<bool, EngineError> {
        let prior: Vec<&'static str> = allowed_prior.iter().map(|s| s.as_str()).collect();

        let result = sqlx::query(
            "UPDATE notification
             SET notification_status = $1,
                 error_details = COALESCE($2, error_details),
                 transaction_id = COALESCE($3, transaction_id),
                 processed_at = CASE WHEN $1 IN ('SENT', 'RETRACTED') THEN now() ELSE processed_at END,
                 updated_at = now()
             WHERE id = $4 AND notification_status = ANY($5)",
        )
        .bind(new_status.as_str())
        .bind(error_details)
        .bind(transaction_id)
        .bind(id)
        .bind(&prior)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(result.rows_affected() > 0)
    }

    /// `getLastRuleUpdate(tenant?)` — seeds the reconciliation watermark.
    pub async fn get_last_rule_update(
        &self,
        tenant: &Tenant,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let row = sqlx::query(
            "SELECT max(updated_at) AS max_updated_at
             FROM notification_rule
             WHERE trigger_type = 'CRON'
               AND ($1::text IS NULL OR tenant = $1)",
        )
        .bind(tenant.as_deref())
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_error)?;

        Ok(row.try_get::<Option<DateTime<Utc>>, _>("max_updated_at").unwrap_or(None))
    }

    /// Rules touched since `watermark`, used by the incremental
    /// reconciliation loop (§4.2).
    pub async fn get_rules_updated_since(
        &self,
        watermark: DateTime<Utc>,
    ) -> Result<Vec<NotificationRule>, EngineError> {
        let rows = sqlx::query(
            "SELECT id, tenant, business_id, name, notification_workflow_id,
                    trigger_type, trigger_config, rule_payload,
                    publish_status, deactivated, updated_at
             FROM notification_rule
             WHERE trigger_type = 'CRON' AND updated_at > $1
             ORDER BY updated_at ASC, id ASC",
        )
        .bind(watermark)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;

        rows.iter().map(row_to_rule).collect()
    }

    pub async fn get_template(
        &self,
        template_key: &str,
        tenant: &Tenant,
    ) -> Result<Option<Template>, EngineError> {
        let row = sqlx::query(
            "SELECT id, tenant, template_key, name, subject_template, body_template,
                    channel_type, publish_status, deactivated
             FROM notification_template
             WHERE template_key = $1 AND tenant IS NOT DISTINCT FROM $2
             LIMIT 1",
        )
        .bind(template_key)
        .bind(tenant.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        if let Some(row) = row {
            return Ok(Some(row_to_template(&row)?));
        }
        if tenant.is_none() {
            return Ok(None);
        }

        let row = sqlx::query(
            "SELECT id, tenant, template_key, name, subject_template, body_template,
                    channel_type, publish_status, deactivated
             FROM notification_template
             WHERE template_key = $1 AND tenant IS NULL
             LIMIT 1",
        )
        .bind(template_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?;

        row.as_ref().map(row_to_template).transpose()
    }

    /// Idempotent; there is no persistent connection state beyond the pool
    /// itself, so this just closes it.
    pub async fn shutdown(&self) {
        self.pool.close().await;
    }
}

enum BindValue {
    Text(Option<String>),
    Timestamp(DateTime<Utc>),
    BatchSize(i64),
}

/// Rewrites the scratch `$$n` tenant-clause marker into the correctly
/// numbered real placeholder it already matches (it is always `$1`), and
/// leaves other placeholders untouched. Isolated as a pure function so it
/// can be unit tested without a database.
fn rewrite_placeholders(sql: &str) -> String {
    sql.replace("$$1", "$1")
}

fn row_to_rule(row: &sqlx::postgres::PgRow) -> Result<NotificationRule, EngineError> {
    let trigger_config: Option<Value> = row
        .try_get("trigger_config")
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    let trigger_config = trigger_config
        .map(|v| serde_json::from_value::<TriggerConfig>(v))
        .transpose()
        .map_err(|e| EngineError::Internal(format!("malformed trigger_config: {e}")))?;

    let rule_payload: Value = row
        .try_get("rule_payload")
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    let rule_payload = rule_payload.as_object().cloned().unwrap_or_default();

    let trigger_type_raw: String = row
        .try_get("trigger_type")
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    let trigger_type = if trigger_type_raw.eq_ignore_ascii_case("CRON") {
        TriggerType::Cron
    } else {
        TriggerType::Other
    };

    let publish_status_raw: String = row
        .try_get("publish_status")
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    Ok(NotificationRule {
        id: row.try_get("id").map_err(|e| EngineError::Internal(e.to_string()))?,
        tenant: row.try_get("tenant").map_err(|e| EngineError::Internal(e.to_string()))?,
        business_id: row
            .try_get("business_id")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        name: row.try_get("name").map_err(|e| EngineError::Internal(e.to_string()))?,
        notification_workflow_id: row
            .try_get("notification_workflow_id")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        trigger_type,
        trigger_config,
        rule_payload,
        publish_status: parse_publish_status(&publish_status_raw),
        deactivated: row
            .try_get("deactivated")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
    })
}

fn row_to_workflow(row: &sqlx::postgres::PgRow) -> Result<WorkflowDefinition, EngineError> {
    let default_channels: Value = row
        .try_get("default_channels")
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    let default_channels = default_channels
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(parse_channel)
                .collect()
        })
        .unwrap_or_default();

    let workflow_type_raw: String = row
        .try_get("workflow_type")
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    let publish_status_raw: String = row
        .try_get("publish_status")
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    Ok(WorkflowDefinition {
        id: row.try_get("id").map_err(|e| EngineError::Internal(e.to_string()))?,
        tenant: row.try_get("tenant").map_err(|e| EngineError::Internal(e.to_string()))?,
        workflow_key: row
            .try_get("workflow_key")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        name: row.try_get("name").map_err(|e| EngineError::Internal(e.to_string()))?,
        description: row
            .try_get("description")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        workflow_type: if workflow_type_raw.eq_ignore_ascii_case("DYNAMIC") {
            WorkflowType::Dynamic
        } else {
            WorkflowType::Static
        },
        default_channels,
        template_overrides: row
            .try_get("template_overrides")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        publish_status: parse_publish_status(&publish_status_raw),
        deactivated: row
            .try_get("deactivated")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
    })
}

fn row_to_notification(row: &sqlx::postgres::PgRow) -> Result<NotificationRecord, EngineError> {
    let payload: Value = row.try_get("payload").map_err(|e| EngineError::Internal(e.to_string()))?;
    let payload = payload.as_object().cloned().unwrap_or_default();

    let recipients: Value = row
        .try_get("recipients")
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    let recipients = recipients
        .as_array()
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    let channels: Option<Value> = row
        .try_get("channels")
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    let channels = channels.and_then(|v| {
        v.as_array().map(|arr| {
            arr.iter()
                .filter_map(|c| c.as_str())
                .filter_map(parse_channel)
                .collect()
        })
    });

    let publish_status_raw: String = row
        .try_get("publish_status")
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    let notification_status_raw: String = row
        .try_get("notification_status")
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    Ok(NotificationRecord {
        id: row.try_get("id").map_err(|e| EngineError::Internal(e.to_string()))?,
        tenant: row.try_get("tenant").map_err(|e| EngineError::Internal(e.to_string()))?,
        business_id: row
            .try_get("business_id")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        name: row.try_get("name").map_err(|e| EngineError::Internal(e.to_string()))?,
        description: row
            .try_get("description")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        payload,
        recipients,
        notification_workflow_id: row
            .try_get("notification_workflow_id")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        notification_rule_id: row
            .try_get("notification_rule_id")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        channels,
        overrides: row.try_get("overrides").map_err(|e| EngineError::Internal(e.to_string()))?,
        publish_status: parse_publish_status(&publish_status_raw),
        deactivated: row
            .try_get("deactivated")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        notification_status: parse_notification_status(&notification_status_raw),
        scheduled_for: row
            .try_get("scheduled_for")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        transaction_id: row
            .try_get("transaction_id")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        error_details: row
            .try_get("error_details")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        processed_at: row
            .try_get("processed_at")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| EngineError::Internal(e.to_string()))?,
    })
}

fn row_to_template(row: &sqlx::postgres::PgRow) -> Result<Template, EngineError> {
    let channel_raw: String = row
        .try_get("channel_type")
        .map_err(|e| EngineError::Internal(e.to_string()))?;
    let publish_status_raw: String = row
        .try_get("publish_status")
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    Ok(Template {
        id: row.try_get("id").map_err(|e| EngineError::Internal(e.to_string()))?,
        tenant: row.try_get("tenant").map_err(|e| EngineError::Internal(e.to_string()))?,
        template_key: row
            .try_get("template_key")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        name: row.try_get("name").map_err(|e| EngineError::Internal(e.to_string()))?,
        subject_template: row
            .try_get("subject_template")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        body_template: row
            .try_get("body_template")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
        channel_type: parse_channel(&channel_raw).unwrap_or(Channel::Email),
        publish_status: parse_publish_status(&publish_status_raw),
        deactivated: row
            .try_get("deactivated")
            .map_err(|e| EngineError::Internal(e.to_string()))?,
    })
}

fn parse_publish_status(raw: &str) -> PublishStatus {
    if raw.eq_ignore_ascii_case("PUBLISH") {
        PublishStatus::Publish
    } else {
        PublishStatus::Draft
    }
}

fn parse_notification_status(raw: &str) -> NotificationStatus {
    match raw.to_ascii_uppercase().as_str() {
        "PROCESSING" => NotificationStatus::Processing,
        "SENT" => NotificationStatus::Sent,
        "FAILED" => NotificationStatus::Failed,
        "RETRACTED" => NotificationStatus::Retracted,
        _ => NotificationStatus::Pending,
    }
}

fn parse_channel(raw: &str) -> Option<Channel> {
    match raw.to_ascii_uppercase().as_str() {
        "EMAIL" => Some(Channel::Email),
        "IN_APP" => Some(Channel::InApp),
        "SMS" => Some(Channel::Sms),
        "PUSH" => Some(Channel::Push),
        "CHAT" => Some(Channel::Chat),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::rewrite_placeholders;

    #[test]
    fn rewrites_scratch_tenant_placeholder() {
        let sql = "WHERE ($$1 IS NULL OR tenant = $$1) AND updated_at > $2";
        assert_eq!(
            rewrite_placeholders(sql),
            "WHERE ($1 IS NULL OR tenant = $1) AND updated_at > $2"
        );
    }
}
