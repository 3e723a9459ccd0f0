#![allow(dead_code)]

//! Rule Reconciliation Loop (§4.2): keeps the Schedule Store's schedule
//! objects exactly in sync with the set of active CRON rules in the
//! Catalog DB.
//!
//! CRON parsing is not hand-rolled; the `cron` crate is the authoritative
//! parser at admission time (§9 "CRON semantics"), normalized from the
//! five-field unix form the catalog stores into the seconds-prefixed,
//! year-suffixed form the crate expects.

use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::watch;

use crate::catalog::CatalogClient;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::model::{NotificationRule, PublishStatus, Tenant};
use crate::schedule_store::{
    ScheduleAction, ScheduleSpec, ScheduleState, ScheduleStore, SCHEDULE_ID_PREFIX,
};

/// Validates a CRON expression without committing to a particular field
/// count. The catalog stores the common five-field unix form
/// (`minute hour dom month dow`) with `MON`..`SUN` extensions; the `cron`
/// crate parses the seconds-prefixed, year-suffixed quartz-like form, so
/// we pad it the same way a schedule-aware embedder would.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, String> {
    let normalized = normalize_cron_expr(expr)?;
    cron::Schedule::from_str(&normalized).map_err(|e| format!("invalid cron expression: {e}"))
}

fn normalize_cron_expr(expr: &str) -> Result<String, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {expr} *")),
        6 => Ok(format!("{expr} *")),
        7 => Ok(expr.to_owned()),
        n => Err(format!("expected 5, 6, or 7 cron fields, got {n}")),
    }
}

/// Outcome counters of a reconciliation pass, returned by
/// `reconcile_schedules` (§4.2 public contract).
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ReconcileStats {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub errors: u32,
}

impl ReconcileStats {
    fn merge(&mut self, other: ReconcileStats) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
        self.errors += other.errors;
    }
}

/// Builds the schedule shape for an active rule (§4.2 "Schedule shape").
fn build_schedule(rule: &NotificationRule, default_timezone: &str) -> (ScheduleSpec, ScheduleAction, ScheduleState, Map<String, Value>) {
    let cron_expr = rule
        .trigger_config
        .as_ref()
        .and_then(|c| c.cron.clone())
        .unwrap_or_default();
    let timezone = rule
        .trigger_config
        .as_ref()
        .and_then(|c| c.timezone.clone())
        .unwrap_or_else(|| default_timezone.to_string());

    let spec = ScheduleSpec {
        cron_expressions: vec![cron_expr],
        timezone,
    };

    let mut args = Map::new();
    args.insert("rule_id".to_string(), json!(rule.id));
    args.insert("tenant".to_string(), json!(rule.tenant));
    args.insert("business_id".to_string(), json!(rule.business_id));
    args.insert("workflow_id".to_string(), json!(rule.notification_workflow_id));
    args.insert("rule_payload".to_string(), Value::Object(rule.rule_payload.clone()));

    let action = ScheduleAction {
        workflow_type: "rule-scheduled".to_string(),
        args,
    };

    let state = ScheduleState {
        paused: rule.deactivated || rule.publish_status != PublishStatus::Publish,
    };

    let mut memo = Map::new();
    memo.insert("rule_id".to_string(), json!(rule.id));
    memo.insert("tenant".to_string(), json!(rule.tenant));
    memo.insert("rule_name".to_string(), json!(rule.name));

    (spec, action, state, memo)
}

/// `syncRule(rule)` (§4.2): create-or-update the rule's schedule if it is
/// eligible, else delete it. A rule whose trigger_config failed to parse
/// is never active, so it always takes the delete branch.
pub async fn sync_rule(
    store: &dyn ScheduleStore,
    config: &EngineConfig,
    rule: &NotificationRule,
) -> Result<(), EngineError> {
    let id = rule.schedule_id();

    if !rule.is_self_eligible() {
        return match store.delete_schedule(&id).await {
            Ok(()) => Ok(()),
            Err(EngineError::ScheduleStoreNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        };
    }

    let (spec, action, state, memo) = build_schedule(rule, &config.default_timezone);

    match store.get_schedule(&id).await {
        Ok(Some(_)) => match store.update_schedule(&id, spec.clone(), state).await {
            Ok(()) => Ok(()),
            Err(EngineError::ScheduleStoreNotFound(_)) => {
                store.create_schedule(spec, action, state, memo, &id).await
            }
            Err(e) => Err(e),
        },
        Ok(None) => store.create_schedule(spec, action, state, memo, &id).await,
        Err(EngineError::ScheduleStoreNotFound(_)) => {
            store.create_schedule(spec, action, state, memo, &id).await
        }
        Err(e) => Err(e),
    }
}

fn decode_rule_id_from_schedule(id: &str) -> bool {
    id.starts_with(SCHEDULE_ID_PREFIX)
}

/// `syncAllRules` / `reconcileSchedules` (§4.2 full-pass algorithm).
/// Never aborts on a per-rule error; errors are counted and logged.
pub async fn reconcile_schedules(
    catalog: &CatalogClient,
    store: &dyn ScheduleStore,
    config: &EngineConfig,
    tenant: &Tenant,
) -> ReconcileStats {
    let mut stats = ReconcileStats::default();

    let rules = match catalog.get_active_cron_rules(tenant).await {
        Ok(rules) => rules,
        Err(error) => {
            tracing::error!(%error, "reconciliation: failed to fetch active cron rules");
            stats.errors += 1;
            return stats;
        }
    };

    let schedules = match store.list_schedules(Some(SCHEDULE_ID_PREFIX)).await {
        Ok(schedules) => schedules,
        Err(error) => {
            tracing::error!(%error, "reconciliation: failed to list schedules");
            stats.errors += 1;
            return stats;
        }
    };

    let expected_ids: std::collections::HashSet<String> =
        rules.iter().map(|r| r.schedule_id()).collect();
    let current_ids: std::collections::HashSet<String> = schedules
        .into_iter()
        .map(|s| s.id)
        .filter(|id| decode_rule_id_from_schedule(id))
        .collect();

    for rule in &rules {
        let id = rule.schedule_id();
        let existed = current_ids.contains(&id);
        match sync_rule(store, config, rule).await {
            Ok(()) => {
                if existed {
                    stats.updated += 1;
                } else {
                    stats.created += 1;
                }
            }
            Err(error) => {
                tracing::warn!(rule_id = %rule.id, %error, "reconciliation: failed to sync rule");
                stats.errors += 1;
            }
        }
    }

    for orphan_id in current_ids.difference(&expected_ids) {
        match store.delete_schedule(orphan_id).await {
            Ok(()) => stats.deleted += 1,
            Err(EngineError::ScheduleStoreNotFound(_)) => {}
            Err(error) => {
                tracing::warn!(schedule_id = %orphan_id, %error, "reconciliation: failed to delete orphan schedule");
                stats.errors += 1;
            }
        }
    }

    stats
}

/// Status snapshot exposed by the Engine Controller's `status()` (§4.7).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReconciliationStatus {
    pub last_full_pass_at: Option<DateTime<Utc>>,
    pub last_incremental_tick_at: Option<DateTime<Utc>>,
    pub watermark: Option<DateTime<Utc>>,
    pub last_stats: ReconcileStats,
}

/// Shared handle the incremental loop and the on-demand `reload_cron_rules`
/// controller operation both drive. Timestamps are stored as Unix millis in
/// `AtomicI64` so `status()`/`health_check()` can read them without locking.
pub struct ReconciliationHandle {
    catalog: Arc<CatalogClient>,
    store: Arc<dyn ScheduleStore>,
    config: Arc<EngineConfig>,
    watermark_millis: AtomicI64,
    last_full_pass_millis: AtomicI64,
    last_tick_millis: AtomicI64,
    last_stats: std::sync::Mutex<ReconcileStats>,
}

impl ReconciliationHandle {
    pub async fn new(
        catalog: Arc<CatalogClient>,
        store: Arc<dyn ScheduleStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let seed = catalog.get_last_rule_update(&None).await.ok().flatten();
        Self {
            catalog,
            store,
            config,
            watermark_millis: AtomicI64::new(seed.map(|t| t.timestamp_millis()).unwrap_or(0)),
            last_full_pass_millis: AtomicI64::new(0),
            last_tick_millis: AtomicI64::new(0),
            last_stats: std::sync::Mutex::new(ReconcileStats::default()),
        }
    }

    fn watermark(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.watermark_millis.load(Ordering::Relaxed))
            .unwrap_or_else(|| DateTime::from_timestamp_millis(0).unwrap())
    }

    fn advance_watermark(&self, candidate: DateTime<Utc>) {
        let candidate_millis = candidate.timestamp_millis();
        self.watermark_millis
            .fetch_max(candidate_millis, Ordering::Relaxed);
    }

    /// `reloadCronRules(tenant?)` (§4.7): an immediate full reconciliation
    /// pass, optionally scoped to one tenant.
    pub async fn run_full_pass(&self, tenant: &Tenant) -> ReconcileStats {
        let stats = reconcile_schedules(&self.catalog, self.store.as_ref(), &self.config, tenant).await;
        self.last_full_pass_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        *self.last_stats.lock().expect("reconciliation stats lock poisoned") = stats;
        stats
    }

    async fn run_incremental_tick(&self) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let watermark = self.watermark();

        let rules = match self.catalog.get_rules_updated_since(watermark).await {
            Ok(rules) => rules,
            Err(error) => {
                tracing::error!(%error, "incremental reconciliation: catalog read failed");
                stats.errors += 1;
                self.last_tick_millis
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                return stats;
            }
        };

        let mut max_seen = watermark;
        for rule in &rules {
            match sync_rule(self.store.as_ref(), &self.config, rule).await {
                Ok(()) => {
                    if rule.is_self_eligible() {
                        stats.updated += 1;
                    } else {
                        stats.deleted += 1;
                    }
                }
                Err(error) => {
                    tracing::warn!(rule_id = %rule.id, %error, "incremental reconciliation: sync failed");
                    stats.errors += 1;
                }
            }
            if rule.updated_at > max_seen {
                max_seen = rule.updated_at;
            }
        }

        if max_seen > watermark {
            self.advance_watermark(max_seen);
        }

        self.last_tick_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        let mut last = self.last_stats.lock().expect("reconciliation stats lock poisoned");
        last.merge(stats);
        *last
    }

    pub fn status(&self) -> ReconciliationStatus {
        let to_dt = |millis: i64| {
            if millis == 0 {
                None
            } else {
                DateTime::from_timestamp_millis(millis)
            }
        };
        ReconciliationStatus {
            last_full_pass_at: to_dt(self.last_full_pass_millis.load(Ordering::Relaxed)),
            last_incremental_tick_at: to_dt(self.last_tick_millis.load(Ordering::Relaxed)),
            watermark: Some(self.watermark()),
            last_stats: *self.last_stats.lock().expect("reconciliation stats lock poisoned"),
        }
    }

    pub fn ticked_within(&self, max_age: Duration) -> bool {
        let last = self.last_tick_millis.load(Ordering::Relaxed).max(
            self.last_full_pass_millis.load(Ordering::Relaxed),
        );
        if last == 0 {
            return false;
        }
        let age_ms = (Utc::now().timestamp_millis() - last).max(0) as u64;
        Duration::from_millis(age_ms) <= max_age
    }
}

/// Runs the incremental reconciliation loop (§4.2 "Incremental mode") until
/// `shutdown` fires. A full pass is performed once at startup (before the
/// loop body) so the process starts converged.
pub async fn run_incremental_loop(handle: Arc<ReconciliationHandle>, mut shutdown: watch::Receiver<bool>) {
    handle.run_full_pass(&None).await;

    let mut ticker = tokio::time::interval(Duration::from_millis(handle.config.rule_poll_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = handle.run_incremental_tick().await;
                if stats.created + stats.updated + stats.deleted > 0 || stats.errors > 0 {
                    tracing::info!(
                        created = stats.created,
                        updated = stats.updated,
                        deleted = stats.deleted,
                        errors = stats.errors,
                        "rule reconciliation tick"
                    );
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("rule reconciliation loop shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_five_field_cron() {
        assert_eq!(normalize_cron_expr("0 9 * * MON").unwrap(), "0 0 9 * * MON *");
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(normalize_cron_expr("0 9 * *").is_err());
    }

    #[test]
    fn parses_valid_weekly_cron() {
        assert!(parse_cron("0 9 * * MON").is_ok());
    }

    #[test]
    fn rejects_garbage_cron() {
        assert!(parse_cron("not a cron expression").is_err());
    }

    #[test]
    fn decodes_engine_prefixed_schedule_ids_only() {
        assert!(decode_rule_id_from_schedule("rule-abc-null"));
        assert!(!decode_rule_id_from_schedule("other-schedule"));
    }
}
