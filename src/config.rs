#![allow(dead_code)]

use std::env;

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub app_name: String,
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub internal_api_key: Option<String>,

    pub catalog_url: Option<String>,
    pub catalog_key: Option<String>,

    pub schedule_store_address: String,
    pub schedule_store_namespace: String,
    pub schedule_store_task_queue: String,
    pub max_concurrent_activities: u32,
    pub max_concurrent_workflows: u32,

    pub delivery_provider_key: Option<String>,
    pub delivery_provider_url: Option<String>,

    pub poll_interval_ms: u64,
    pub failed_poll_interval_ms: u64,
    pub scheduled_poll_interval_ms: u64,
    pub poll_batch_size: u32,
    pub rule_poll_interval_ms: u64,

    pub default_timezone: String,
    pub job_retry_attempts: u32,
    pub job_retry_delay_ms: u64,

    pub template_cache_ttl_seconds: u64,
    pub template_max_depth: u32,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "xnovu-engine"),
            environment: env_or("ENVIRONMENT", "development"),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8080),
            internal_api_key: env_opt("INTERNAL_API_KEY"),

            catalog_url: env_opt("CATALOG_URL"),
            catalog_key: env_opt("CATALOG_KEY"),

            schedule_store_address: env_or("SCHEDULE_STORE_ADDRESS", "localhost:7233"),
            schedule_store_namespace: env_or("SCHEDULE_STORE_NAMESPACE", "default"),
            schedule_store_task_queue: env_or(
                "SCHEDULE_STORE_TASK_QUEUE",
                "xnovu-notification-processing",
            ),
            max_concurrent_activities: env_parse_or("MAX_CONCURRENT_ACTIVITIES", 100),
            max_concurrent_workflows: env_parse_or("MAX_CONCURRENT_WORKFLOWS", 50),

            delivery_provider_key: env_opt("DELIVERY_PROVIDER_KEY"),
            delivery_provider_url: env_opt("DELIVERY_PROVIDER_URL"),

            poll_interval_ms: env_parse_or("POLL_INTERVAL_MS", 10_000),
            failed_poll_interval_ms: env_parse_or("FAILED_POLL_INTERVAL_MS", 60_000),
            scheduled_poll_interval_ms: env_parse_or("SCHEDULED_POLL_INTERVAL_MS", 30_000),
            poll_batch_size: env_parse_or("POLL_BATCH_SIZE", 100),
            rule_poll_interval_ms: env_parse_or("RULE_POLL_INTERVAL_MS", 30_000),

            default_timezone: env_or("DEFAULT_TIMEZONE", "UTC"),
            job_retry_attempts: env_parse_or("JOB_RETRY_ATTEMPTS", 3),
            job_retry_delay_ms: env_parse_or("JOB_RETRY_DELAY_MS", 5_000),

            template_cache_ttl_seconds: env_parse_or("TEMPLATE_CACHE_TTL_SECONDS", 300),
            template_max_depth: env_parse_or("TEMPLATE_MAX_DEPTH", 10),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    /// Fatal startup validation. Exit code 3 (§6.4) is returned by `main`
    /// when this fails.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.poll_batch_size == 0 || self.poll_batch_size > 1000 {
            return Err(EngineError::Config(
                "POLL_BATCH_SIZE must be between 1 and 1000".to_string(),
            ));
        }
        if self.catalog_url.is_none() {
            return Err(EngineError::Config("CATALOG_URL is required".to_string()));
        }
        if self.is_production() && self.internal_api_key.is_none() {
            return Err(EngineError::Config(
                "INTERNAL_API_KEY is required in production".to_string(),
            ));
        }
        if self.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(EngineError::Config(format!(
                "DEFAULT_TIMEZONE '{}' is not a recognized timezone",
                self.default_timezone
            )));
        }
        Ok(())
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    fn base_config() -> EngineConfig {
        EngineConfig {
            app_name: "xnovu-engine".to_string(),
            environment: "development".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8080,
            internal_api_key: None,
            catalog_url: Some("postgres://localhost/catalog".to_string()),
            catalog_key: None,
            schedule_store_address: "localhost:7233".to_string(),
            schedule_store_namespace: "default".to_string(),
            schedule_store_task_queue: "xnovu-notification-processing".to_string(),
            max_concurrent_activities: 100,
            max_concurrent_workflows: 50,
            delivery_provider_key: None,
            delivery_provider_url: None,
            poll_interval_ms: 10_000,
            failed_poll_interval_ms: 60_000,
            scheduled_poll_interval_ms: 30_000,
            poll_batch_size: 100,
            rule_poll_interval_ms: 30_000,
            default_timezone: "UTC".to_string(),
            job_retry_attempts: 3,
            job_retry_delay_ms: 5_000,
            template_cache_ttl_seconds: 300,
            template_max_depth: 10,
        }
    }

    #[test]
    fn rejects_missing_catalog_url() {
        let mut config = base_config();
        config.catalog_url = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_production_without_internal_api_key() {
        let mut config = base_config();
        config.environment = "production".to_string();
        assert!(config.validate().is_err());
        config.internal_api_key = Some("secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_oversized_batch_size() {
        let mut config = base_config();
        config.poll_batch_size = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_timezone() {
        let mut config = base_config();
        config.default_timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
    }
}
