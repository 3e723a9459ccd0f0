use std::sync::Arc;

use sqlx::PgPool;

use crate::catalog::CatalogClient;
use crate::config::EngineConfig;
use crate::delivery::{DeliveryProvider, HttpDeliveryProvider};
use crate::schedule_store::{HttpScheduleStoreClient, ScheduleStore};
use crate::template::TemplateEngine;

/// Shared handles threaded through every engine component. Cheap to clone
/// (everything inside is an `Arc` or already `Clone`).
#[derive(Clone)]
pub struct EngineState {
    pub config: Arc<EngineConfig>,
    pub catalog: Arc<CatalogClient>,
    pub schedule_store: Arc<dyn ScheduleStore>,
    pub delivery: Arc<dyn DeliveryProvider>,
    pub templates: Arc<TemplateEngine>,
    pub http_client: reqwest::Client,
}

impl EngineState {
    pub async fn build(config: EngineConfig) -> Result<Self, crate::error::EngineError> {
        let catalog_url = config
            .catalog_url
            .clone()
            .ok_or_else(|| crate::error::EngineError::Config("CATALOG_URL is required".into()))?;

        let pool = PgPool::connect(&catalog_url).await.map_err(|error| {
            crate::error::EngineError::CatalogUnavailable(format!(
                "failed to connect to catalog: {error}"
            ))
        })?;

        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|error| crate::error::EngineError::Internal(error.to_string()))?;

        let config = Arc::new(config);
        let catalog = Arc::new(CatalogClient::new(pool));
        let schedule_store: Arc<dyn ScheduleStore> = Arc::new(HttpScheduleStoreClient::new(
            config.clone(),
            http_client.clone(),
        ));
        let delivery: Arc<dyn DeliveryProvider> = Arc::new(HttpDeliveryProvider::new(
            config.clone(),
            http_client.clone(),
        ));
        let templates = Arc::new(TemplateEngine::new(
            catalog.clone(),
            config.template_cache_ttl_seconds,
            config.template_max_depth,
        ));

        Ok(Self {
            config,
            catalog,
            schedule_store,
            delivery,
            templates,
            http_client,
        })
    }
}
