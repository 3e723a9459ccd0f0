#![allow(dead_code)]

//! Thin control-plane surface (ambient — §SPEC_FULL §2). The engine's real
//! work happens in background loops; these routes exist for operators and
//! orchestration probes, not for the notification data path itself.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::activities::RuleScheduledInput;
use crate::engine::{Engine, HealthStatus};
use crate::error::EngineError;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/reload-cron-rules", post(reload_cron_rules))
        .route("/templates/{template_key}/validate", get(validate_template))
        .route("/activities/rule-scheduled", post(activity_rule_scheduled))
        .route("/activities/notification-trigger", post(activity_notification_trigger))
        .with_state(engine)
}

async fn healthz(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let health = engine.health_check().await;
    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn status(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.status().await)
}

#[derive(Debug, Deserialize)]
struct ReloadQuery {
    tenant: Option<String>,
}

/// Guarded by `INTERNAL_API_KEY` in production (§SPEC_FULL §2 ambient
/// config keys) — this triggers an immediate full reconciliation pass and
/// is not meant to be publicly reachable.
async fn reload_cron_rules(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    Query(query): Query<ReloadQuery>,
) -> Result<impl IntoResponse, EngineError> {
    authorize(&engine, &headers)?;
    let stats = engine.reload_cron_rules(query.tenant).await;
    Ok(Json(json!({
        "created": stats.created,
        "updated": stats.updated,
        "deleted": stats.deleted,
        "errors": stats.errors,
    })))
}

#[derive(Debug, Deserialize)]
struct ValidateQuery {
    tenant: Option<String>,
}

/// Exposes the Template Engine's Validator (§4.5 `validate(template,
/// context)`) for operators checking already-authored templates — this is
/// read-only validation of stored content, not template authoring, which
/// stays out of scope.
async fn validate_template(
    State(engine): State<Arc<Engine>>,
    Path(template_key): Path<String>,
    Query(query): Query<ValidateQuery>,
) -> Result<impl IntoResponse, EngineError> {
    let tenant = query.tenant;
    let template = engine
        .state()
        .catalog
        .get_template(&template_key, &tenant)
        .await?
        .ok_or_else(|| EngineError::TemplateNotFound(template_key.clone()))?;

    let result = engine.state().templates.validate(&template, &tenant).await;
    Ok(Json(json!({
        "valid": result.valid,
        "errors": result.errors,
    })))
}

#[derive(Debug, Deserialize)]
struct NotificationTriggerBody {
    notification_id: String,
}

/// Inbound worker surface for the `rule-scheduled` activity (§4.4) — the
/// callback a Schedule Store's task-queue worker hits when a CRON
/// schedule's workflow fires. Guarded the same way `/reload-cron-rules`
/// is, since both mutate the Catalog on an unauthenticated network path.
async fn activity_rule_scheduled(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    Json(input): Json<RuleScheduledInput>,
) -> Result<impl IntoResponse, EngineError> {
    authorize(&engine, &headers)?;
    let outcome = engine.activities().rule_scheduled(input).await?;
    Ok(Json(outcome))
}

/// Inbound worker surface for the `notification-trigger` activity (§4.4) —
/// invoked for a notification already admitted into `PROCESSING` by the
/// polling pipeline (§4.3); this is the call that ultimately reaches the
/// Dispatch Adapter and the Delivery Provider.
async fn activity_notification_trigger(
    State(engine): State<Arc<Engine>>,
    headers: HeaderMap,
    Json(body): Json<NotificationTriggerBody>,
) -> Result<impl IntoResponse, EngineError> {
    authorize(&engine, &headers)?;
    engine.activities().notification_trigger(&body.notification_id).await?;
    Ok(Json(json!({ "ok": true })))
}

fn authorize(engine: &Engine, headers: &HeaderMap) -> Result<(), EngineError> {
    let Some(expected) = &engine.state().config.internal_api_key else {
        if engine.state().config.is_production() {
            return Err(EngineError::Config(
                "INTERNAL_API_KEY is required in production".to_string(),
            ));
        }
        return Ok(());
    };

    let provided = headers
        .get("x-internal-api-key")
        .and_then(|value| value.to_str().ok());

    match provided {
        Some(key) if key == expected => Ok(()),
        _ => Err(EngineError::Validation("invalid or missing x-internal-api-key".to_string())),
    }
}
