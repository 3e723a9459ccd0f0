#![allow(dead_code)]

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Error taxonomy for the engine. Every fallible operation in the engine
/// returns `Result<T, EngineError>`; the control-plane surface is the only
/// place these get turned into HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("schedule store unavailable: {0}")]
    ScheduleStoreUnavailable(String),

    #[error("schedule not found: {0}")]
    ScheduleStoreNotFound(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("template cycle detected: {0}")]
    TemplateCycle(String),

    #[error("template malformed: {0}")]
    TemplateMalformed(String),

    #[error("delivery provider transient failure: {0}")]
    ProviderTransient(String),

    #[error("delivery provider permanent failure: {0}")]
    ProviderPermanent(String),

    #[error("malformed dispatch payload: {0}")]
    MalformedPayload(String),

    #[error("rule not found: {0}")]
    RuleNotFound(String),

    #[error("workflow definition not found: {0}")]
    WorkflowNotFound(String),

    #[error("notification has no recipients: {0}")]
    NoRecipients(String),

    #[error("notification not found: {0}")]
    NotFound(String),

    #[error("engine not initialized")]
    NotInitialized,

    #[error("missing tenant: {0}")]
    MissingTenant(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// True for error kinds where the Workflow Activities retry policy (§4.4)
    /// should NOT schedule another attempt.
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound(_)
                | EngineError::MalformedPayload(_)
                | EngineError::RuleNotFound(_)
                | EngineError::WorkflowNotFound(_)
                | EngineError::NoRecipients(_)
                | EngineError::ProviderPermanent(_)
        )
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Config(_) | EngineError::Validation(_) | EngineError::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::MissingTenant(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_)
            | EngineError::RuleNotFound(_)
            | EngineError::WorkflowNotFound(_)
            | EngineError::TemplateNotFound(_)
            | EngineError::ScheduleStoreNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::CatalogUnavailable(_)
            | EngineError::ScheduleStoreUnavailable(_)
            | EngineError::ProviderTransient(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let kind = error_kind(&self);
        let body = json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "kind": kind,
            "message": self.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

fn error_kind(error: &EngineError) -> &'static str {
    match error {
        EngineError::Config(_) => "Config",
        EngineError::CatalogUnavailable(_) => "CatalogUnavailable",
        EngineError::Validation(_) => "Validation",
        EngineError::ScheduleStoreUnavailable(_) => "ScheduleStoreUnavailable",
        EngineError::ScheduleStoreNotFound(_) => "ScheduleStoreNotFound",
        EngineError::TemplateNotFound(_) => "TemplateNotFound",
        EngineError::TemplateCycle(_) => "TemplateCycle",
        EngineError::TemplateMalformed(_) => "TemplateMalformed",
        EngineError::ProviderTransient(_) => "ProviderTransient",
        EngineError::ProviderPermanent(_) => "ProviderPermanent",
        EngineError::MalformedPayload(_) => "MalformedPayload",
        EngineError::RuleNotFound(_) => "RuleNotFound",
        EngineError::WorkflowNotFound(_) => "WorkflowNotFound",
        EngineError::NoRecipients(_) => "NoRecipients",
        EngineError::NotFound(_) => "NotFound",
        EngineError::NotInitialized => "NotInitialized",
        EngineError::MissingTenant(_) => "MissingTenant",
        EngineError::Internal(_) => "Internal",
    }
}

/// Maps a raw `sqlx::Error` onto the taxonomy, logging first. Ported from
/// the Catalog Access Layer's database-error mapping idiom.
pub fn map_db_error(error: sqlx::Error) -> EngineError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "catalog query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return EngineError::Validation("duplicate value violates a unique constraint".to_string());
    }
    EngineError::CatalogUnavailable("catalog operation failed".to_string())
}
