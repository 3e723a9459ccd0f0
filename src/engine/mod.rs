#![allow(dead_code)]

//! Engine Controller (§4.7): the single process-wide entry point that owns
//! every loop's lifecycle. `init()` is a barrier — concurrent callers await
//! the same initialization (§5 "Singleton semantics": accessing the
//! controller before `init` fails with `NotInitialized`; `init` itself is
//! idempotent and safe to call from multiple tasks).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;

use crate::activities::Activities;
use crate::dispatch::DispatchAdapter;
use crate::error::EngineError;
use crate::model::Tenant;
use crate::polling::{self, PollingState, PollingStatus};
use crate::reconciliation::{self, ReconciliationHandle, ReconciliationStatus};
use crate::state::EngineState;

/// Health status reported by `health_check()` (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub details: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub initialized: bool,
    pub paused: bool,
    pub reconciliation: ReconciliationStatus,
    pub polling: PollingStatus,
}

/// Restart supervision bound for each long-running loop task (§9 ambient
/// note): a loop that panics is restarted, but only a handful of times —
/// beyond that the process is worse off staying up than exiting and
/// letting its orchestrator restart it fresh.
const MAX_LOOP_RESTARTS: u32 = 5;

/// Margin applied to a loop's own tick interval when judging it degraded
/// in `health_check()` (§4.7: "degraded if any loop hasn't ticked within
/// 2 × its interval").
const DEGRADED_INTERVAL_MULTIPLIER: u32 = 2;

pub struct Engine {
    state: EngineState,
    reconciliation: Arc<ReconciliationHandle>,
    polling: Arc<PollingState>,
    activities: Arc<Activities>,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Option<JoinSet<()>>>,
    initialized: AtomicBool,
    paused: AtomicBool,
}

impl Engine {
    /// Assembles the controller and its dependent loop state around
    /// already-built shared handles, without starting any background
    /// task. `init()` is the only thing that spawns loops.
    pub async fn build(state: EngineState) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let reconciliation = Arc::new(
            ReconciliationHandle::new(state.catalog.clone(), state.schedule_store.clone(), state.config.clone())
                .await,
        );
        let polling = Arc::new(PollingState::new(
            state.catalog.clone(),
            state.schedule_store.clone(),
            state.config.clone(),
        ));
        let dispatch = Arc::new(DispatchAdapter::new(state.delivery.clone(), state.templates.clone()));
        let activities = Arc::new(Activities::new(state.catalog.clone(), dispatch));

        Self {
            state,
            reconciliation,
            polling,
            activities,
            shutdown_tx,
            loops: Mutex::new(None),
            initialized: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub fn activities(&self) -> &Arc<Activities> {
        &self.activities
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// `init(config)` (§4.7): warms the Schedule Store namespace and
    /// starts the Rule Reconciliation Loop and the three Polling Pipeline
    /// loops. Idempotent — a second call is a no-op.
    pub async fn init(&self) -> Result<(), EngineError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.state
            .schedule_store
            .ensure_namespace(&self.state.config.schedule_store_namespace)
            .await?;

        let mut loops = JoinSet::new();

        loops.spawn(supervised(
            "reconciliation",
            self.shutdown_tx.subscribe(),
            {
                let handle = self.reconciliation.clone();
                move |shutdown| {
                    let handle = handle.clone();
                    async move { reconciliation::run_incremental_loop(handle, shutdown).await }
                }
            },
        ));

        loops.spawn(supervised("new-work", self.shutdown_tx.subscribe(), {
            let polling_state = self.polling.clone();
            move |shutdown| {
                let polling_state = polling_state.clone();
                async move { polling::run_new_work_loop(polling_state, shutdown).await }
            }
        }));

        loops.spawn(supervised("failed-retry", self.shutdown_tx.subscribe(), {
            let polling_state = self.polling.clone();
            move |shutdown| {
                let polling_state = polling_state.clone();
                async move { polling::run_failed_retry_loop(polling_state, shutdown).await }
            }
        }));

        loops.spawn(supervised("due-scheduled", self.shutdown_tx.subscribe(), {
            let polling_state = self.polling.clone();
            move |shutdown| {
                let polling_state = polling_state.clone();
                async move { polling::run_due_scheduled_loop(polling_state, shutdown).await }
            }
        }));

        *self.loops.lock().await = Some(loops);
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!("engine controller initialized");
        Ok(())
    }

    /// `pause()` (§4.7): pauses Polling Pipeline admission. Does **not**
    /// pause individual CRON schedules on the Schedule Store — those keep
    /// firing `rule-scheduled` activities, which only enqueue PENDING
    /// notifications; it is admission into dispatch that stops. No "pause
    /// all" RPC exists on the `ScheduleStore` trait's work-processing
    /// surface (§6.2 lists no such operation), so that half of the
    /// distilled spec's wording is realized entirely via the polling gate.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.polling.set_paused(true);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.polling.set_paused(false);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// `reloadCronRules(tenant?)` (§4.7): an immediate full reconciliation
    /// pass, optionally scoped to a single tenant.
    pub async fn reload_cron_rules(&self, tenant: Tenant) -> reconciliation::ReconcileStats {
        self.reconciliation.run_full_pass(&tenant).await
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            initialized: self.initialized.load(Ordering::SeqCst),
            paused: self.is_paused(),
            reconciliation: self.reconciliation.status(),
            polling: self.polling.status().await,
        }
    }

    /// `healthCheck()` (§4.7): unhealthy if `init` never completed or the
    /// Schedule Store is unreachable; degraded if any loop hasn't ticked
    /// within 2x its configured interval.
    pub async fn health_check(&self) -> HealthCheck {
        if !self.initialized.load(Ordering::SeqCst) {
            return HealthCheck {
                status: HealthStatus::Unhealthy,
                details: vec!["engine not initialized".to_string()],
            };
        }

        if let Err(error) = self
            .state
            .schedule_store
            .describe_workflow("healthcheck-probe")
            .await
        {
            if matches!(error, EngineError::ScheduleStoreUnavailable(_)) {
                return HealthCheck {
                    status: HealthStatus::Unhealthy,
                    details: vec![format!("schedule store unreachable: {error}")],
                };
            }
        }

        let mut details = Vec::new();
        let config = &self.state.config;

        if !self
            .reconciliation
            .ticked_within(degraded_threshold(config.rule_poll_interval_ms))
        {
            details.push("rule reconciliation loop has not ticked recently".to_string());
        }
        if !self
            .polling
            .ticked_within(polling::LoopKind::NewWork, degraded_threshold(config.poll_interval_ms))
        {
            details.push("new-work polling loop has not ticked recently".to_string());
        }
        if !self.polling.ticked_within(
            polling::LoopKind::FailedRetry,
            degraded_threshold(config.failed_poll_interval_ms),
        ) {
            details.push("failed-retry polling loop has not ticked recently".to_string());
        }
        if !self.polling.ticked_within(
            polling::LoopKind::DueScheduled,
            degraded_threshold(config.scheduled_poll_interval_ms),
        ) {
            details.push("due-scheduled polling loop has not ticked recently".to_string());
        }

        let status = if details.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthCheck { status, details }
    }

    /// `shutdown()` (§4.7): signals every loop, waits up to 10s each for
    /// it to observe the signal and return, then closes the catalog pool.
    /// Idempotent — a second call with no running loops is a no-op.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let mut guard = self.loops.lock().await;
        if let Some(mut loops) = guard.take() {
            let deadline = Duration::from_secs(10);
            while let Ok(Some(result)) = tokio::time::timeout(deadline, loops.join_next()).await {
                if let Err(error) = result {
                    tracing::warn!(%error, "engine shutdown: loop task ended abnormally");
                }
            }
        }

        self.state.catalog.shutdown().await;
        self.initialized.store(false, Ordering::SeqCst);
        tracing::info!("engine controller shut down");
    }
}

fn degraded_threshold(interval_ms: u64) -> Duration {
    Duration::from_millis(interval_ms * DEGRADED_INTERVAL_MULTIPLIER as u64)
}

/// Wraps a loop future in restart-on-panic supervision bounded by
/// `MAX_LOOP_RESTARTS` (§9 ambient note). A loop that returns normally
/// (i.e. observed shutdown) is not restarted.
fn supervised<F, Fut>(
    name: &'static str,
    shutdown: watch::Receiver<bool>,
    make_future: F,
) -> impl std::future::Future<Output = ()>
where
    F: Fn(watch::Receiver<bool>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    async move {
        let mut restarts = 0u32;
        loop {
            let shutdown = shutdown.clone();
            let handle = tokio::spawn((make_future)(shutdown));
            match handle.await {
                Ok(()) => return,
                Err(join_error) => {
                    restarts += 1;
                    tracing::error!(loop_name = name, %join_error, restarts, "loop task panicked");
                    if restarts > MAX_LOOP_RESTARTS {
                        tracing::error!(loop_name = name, "loop exceeded restart budget, giving up");
                        return;
                    }
                }
            }
        }
    }
}
