#![allow(dead_code)]

//! Notification Polling Pipeline (§4.3): three cooperating loops — new-work,
//! failed-retry, due-scheduled — that each observe the Catalog DB for
//! dispatchable notifications and admit them into the Schedule Store as
//! workflow starts, under at-most-once admission via conditional status
//! transitions.
//!
//! Each loop owns its own `tokio::time::interval` and is multiplexed
//! against a shared shutdown signal via `tokio::select!` (§9 ambient note:
//! independent cadence per loop rather than one coarse-grained sleep loop).

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::catalog::CatalogClient;
use crate::config::EngineConfig;
use crate::model::{NotificationRecord, NotificationStatus, PollOptions, PriorStatusFilter, ScheduledMode};
use crate::schedule_store::{RetryPolicy, ScheduleStore, StartWorkflowOptions};

/// Which loop is admitting a given tick; only used for logging/labels and
/// to pick the conditional prior-state for the admission write (§4.3
/// step 2: PENDING for new/due-scheduled, FAILED for retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    NewWork,
    FailedRetry,
    DueScheduled,
}

impl LoopKind {
    fn prior_status(self) -> NotificationStatus {
        match self {
            LoopKind::NewWork | LoopKind::DueScheduled => NotificationStatus::Pending,
            LoopKind::FailedRetry => NotificationStatus::Failed,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LoopKind::NewWork => "new_work",
            LoopKind::FailedRetry => "failed_retry",
            LoopKind::DueScheduled => "due_scheduled",
        }
    }
}

/// Per-process dedupe set (§3 "In-flight Dedupe Set"): absorbs overlapping
/// ticks across the three loops without a distributed lock.
#[derive(Default)]
struct DedupeSet(Mutex<HashSet<String>>);

impl DedupeSet {
    async fn try_acquire(&self, id: &str) -> bool {
        let mut guard = self.0.lock().await;
        if guard.contains(id) {
            return false;
        }
        guard.insert(id.to_string());
        true
    }

    async fn release(&self, id: &str) {
        self.0.lock().await.remove(id);
    }
}

/// Shared per-process polling state: the new-work watermark and the
/// in-flight dedupe set. Only the new-work loop advances the watermark
/// (§4.3); the failed-retry and due-scheduled loops select on status/
/// `scheduled_for` directly and do not use it.
pub struct PollingState {
    catalog: Arc<CatalogClient>,
    schedule_store: Arc<dyn ScheduleStore>,
    config: Arc<EngineConfig>,
    watermark_millis: AtomicI64,
    dedupe: DedupeSet,
    last_tick_millis: [AtomicI64; 3],
    /// Gates tick bodies when the Engine Controller is paused (§4.7
    /// `pause()`/`resume()`). Deliberately does not touch the Schedule
    /// Store's CRON schedules — `rule-scheduled` activities keep firing
    /// and keep enqueuing PENDING notifications; it is only admission into
    /// dispatch that stops.
    paused: std::sync::atomic::AtomicBool,
}

/// Status snapshot exposed by `status()` (§4.7).
#[derive(Debug, Clone, serde::Serialize)]
pub struct PollingStatus {
    pub watermark: DateTime<Utc>,
    pub in_flight: usize,
    pub last_new_work_tick_at: Option<DateTime<Utc>>,
    pub last_failed_retry_tick_at: Option<DateTime<Utc>>,
    pub last_due_scheduled_tick_at: Option<DateTime<Utc>>,
}

impl PollingState {
    pub fn new(catalog: Arc<CatalogClient>, schedule_store: Arc<dyn ScheduleStore>, config: Arc<EngineConfig>) -> Self {
        Self {
            catalog,
            schedule_store,
            config,
            watermark_millis: AtomicI64::new(0),
            dedupe: DedupeSet::default(),
            last_tick_millis: [AtomicI64::new(0), AtomicI64::new(0), AtomicI64::new(0)],
            paused: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn watermark(&self) -> DateTime<Utc> {
        let millis = self.watermark_millis.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(millis).unwrap_or_else(|| DateTime::from_timestamp_millis(0).unwrap())
    }

    fn advance_watermark(&self, candidate: DateTime<Utc>) {
        self.watermark_millis
            .fetch_max(candidate.timestamp_millis(), Ordering::Relaxed);
    }

    fn mark_tick(&self, kind: LoopKind) {
        let idx = match kind {
            LoopKind::NewWork => 0,
            LoopKind::FailedRetry => 1,
            LoopKind::DueScheduled => 2,
        };
        self.last_tick_millis[idx].store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub async fn status(&self) -> PollingStatus {
        let to_dt = |millis: i64| {
            if millis == 0 {
                None
            } else {
                DateTime::from_timestamp_millis(millis)
            }
        };
        PollingStatus {
            watermark: self.watermark(),
            in_flight: self.dedupe.0.lock().await.len(),
            last_new_work_tick_at: to_dt(self.last_tick_millis[0].load(Ordering::Relaxed)),
            last_failed_retry_tick_at: to_dt(self.last_tick_millis[1].load(Ordering::Relaxed)),
            last_due_scheduled_tick_at: to_dt(self.last_tick_millis[2].load(Ordering::Relaxed)),
        }
    }

    pub fn ticked_within(&self, kind: LoopKind, max_age: Duration) -> bool {
        let idx = match kind {
            LoopKind::NewWork => 0,
            LoopKind::FailedRetry => 1,
            LoopKind::DueScheduled => 2,
        };
        let last = self.last_tick_millis[idx].load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let age_ms = (Utc::now().timestamp_millis() - last).max(0) as u64;
        Duration::from_millis(age_ms) <= max_age
    }

    /// One admission attempt for a single record (§4.3 "Admission per
    /// record"). Returns `true` if a workflow start was actually issued.
    async fn admit(&self, kind: LoopKind, record: &NotificationRecord, now: DateTime<Utc>) -> bool {
        if !self.dedupe.try_acquire(&record.id).await {
            return false;
        }

        let prior = kind.prior_status();
        let admitted = match self
            .catalog
            .update_notification_status(&record.id, NotificationStatus::Processing, &[prior], None, None)
            .await
        {
            Ok(ok) => ok,
            Err(error) => {
                tracing::warn!(notification_id = %record.id, %error, "polling: admission status write failed");
                self.dedupe.release(&record.id).await;
                return false;
            }
        };

        if !admitted {
            self.dedupe.release(&record.id).await;
            return false;
        }

        let start_delay = record
            .scheduled_for
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);

        let workflow_id = format!("trigger-notification-{}-{}", record.id, Uuid::new_v4());
        let mut args = Map::new();
        args.insert("notification_id".to_string(), json!(record.id));

        let opts = StartWorkflowOptions {
            task_queue: self.config.schedule_store_task_queue.clone(),
            start_delay,
            retry_policy: Some(RetryPolicy::notification_trigger_default()),
        };

        let result = self
            .schedule_store
            .start_workflow("notification-trigger", &workflow_id, args, opts)
            .await;

        match result {
            Ok(()) => {
                self.dedupe.release(&record.id).await;
                true
            }
            Err(error) => {
                tracing::warn!(notification_id = %record.id, %error, "polling: workflow start failed, rolling back status");
                let rollback = if let Err(rollback_err) = self
                    .catalog
                    .update_notification_status(
                        &record.id,
                        prior,
                        &[NotificationStatus::Processing],
                        None,
                        None,
                    )
                    .await
                {
                    tracing::error!(notification_id = %record.id, error = %rollback_err, "polling: status rollback failed");
                    false
                } else {
                    true
                };
                let _ = rollback;
                self.dedupe.release(&record.id).await;
                false
            }
        }
    }

    /// Runs one tick of the new-work loop (§4.3). Advances the watermark
    /// to the maximum `updated_at` observed in the batch, advancing even
    /// for records this tick failed to admit (admission failures are
    /// someone-else-already-took-it races, not reasons to reprocess).
    /// Returns the batch size observed, so the caller can implement the
    /// "exactly batchSize rows ⇒ tick again immediately" backpressure rule.
    async fn tick_new_work(&self) -> usize {
        self.mark_tick(LoopKind::NewWork);
        if self.is_paused() {
            return 0;
        }
        let now = Utc::now();
        let opts = PollOptions {
            tenant: None,
            batch_size: self.config.poll_batch_size,
            updated_after: Some(self.watermark()),
            include_processed: false,
            scheduled_mode: Some(ScheduledMode::EligibleNow),
            status_filter: Some(PriorStatusFilter::Pending),
        };

        let batch = match self.catalog.poll_notifications(&opts).await {
            Ok(batch) => batch,
            Err(error) => {
                tracing::error!(%error, "new-work loop: poll failed");
                return 0;
            }
        };

        let len = batch.len();
        let mut max_updated = self.watermark();
        for record in &batch {
            if record.updated_at > max_updated {
                max_updated = record.updated_at;
            }
            self.admit(LoopKind::NewWork, record, now).await;
        }
        if max_updated > self.watermark() {
            self.advance_watermark(max_updated);
        }
        len
    }

    async fn tick_failed_retry(&self) {
        self.mark_tick(LoopKind::FailedRetry);
        if self.is_paused() {
            return;
        }
        let now = Utc::now();
        let opts = PollOptions {
            tenant: None,
            batch_size: self.config.poll_batch_size,
            updated_after: None,
            include_processed: false,
            scheduled_mode: Some(ScheduledMode::Any),
            status_filter: Some(PriorStatusFilter::Failed),
        };

        let batch = match self.catalog.poll_notifications(&opts).await {
            Ok(batch) => batch,
            Err(error) => {
                tracing::error!(%error, "failed-retry loop: poll failed");
                return;
            }
        };

        for record in &batch {
            if record.retries_so_far() >= self.config.job_retry_attempts {
                continue;
            }
            self.admit(LoopKind::FailedRetry, record, now).await;
        }
    }

    async fn tick_due_scheduled(&self) {
        self.mark_tick(LoopKind::DueScheduled);
        if self.is_paused() {
            return;
        }
        let now = Utc::now();
        let opts = PollOptions {
            tenant: None,
            batch_size: self.config.poll_batch_size,
            updated_after: None,
            include_processed: false,
            scheduled_mode: Some(ScheduledMode::OnlyScheduled),
            status_filter: Some(PriorStatusFilter::Pending),
        };

        let batch = match self.catalog.poll_notifications(&opts).await {
            Ok(batch) => batch,
            Err(error) => {
                tracing::error!(%error, "due-scheduled loop: poll failed");
                return;
            }
        };

        for record in &batch {
            self.admit(LoopKind::DueScheduled, record, now).await;
        }
    }
}

/// New-work loop: the default interval, re-ticking immediately (ignoring
/// the interval) whenever a tick returns a full batch (§4.3 backpressure).
pub async fn run_new_work_loop(state: Arc<PollingState>, mut shutdown: watch::Receiver<bool>) {
    let batch_size = state.config.poll_batch_size as usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(state.config.poll_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                loop {
                    let observed = state.tick_new_work().await;
                    if observed < batch_size {
                        break;
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("new-work loop shutting down");
                    return;
                }
            }
        }
    }
}

pub async fn run_failed_retry_loop(state: Arc<PollingState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(state.config.failed_poll_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => state.tick_failed_retry().await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("failed-retry loop shutting down");
                    return;
                }
            }
        }
    }
}

pub async fn run_due_scheduled_loop(state: Arc<PollingState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(state.config.scheduled_poll_interval_ms));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => state.tick_due_scheduled().await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("due-scheduled loop shutting down");
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
    fn prior_status_matches_loop_kind() {
        assert_eq!(LoopKind::NewWork.prior_status(), NotificationStatus::Pending);
        assert_eq!(LoopKind::DueScheduled.prior_status(), NotificationStatus::Pending);
        assert_eq!(LoopKind::FailedRetry.prior_status(), NotificationStatus::Failed);
    }

    #[tokio::test]
    async fn dedupe_set_rejects_reacquire_until_released() {
        let set = DedupeSet::default();
        assert!(set.try_acquire("a").await);
        assert!(!set.try_acquire("a").await);
        set.release("a").await;
        assert!(set.try_acquire("a").await);
    }
}
