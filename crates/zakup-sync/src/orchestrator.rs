//! Task orchestration: per-entity lanes, a bounded worker pool, retry with
//! backoff, and dependency admission between parent and child entities.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zakup_client::{BackoffPolicy, UpstreamSource};
use zakup_core::{EntityKind, JobState, SyncJob, SyncStatus, Trigger};
use zakup_store::SyncStorage;

use crate::job::{cancel_pair, run_entity_job, CancelHandle, CancelToken, Clock, JobConfig, SyncError};
use crate::transform::MappingRegistry;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrent entity jobs; the upstream budget is shared regardless.
    pub workers: usize,
    /// Attempts per job before it goes terminal.
    pub max_attempts: u32,
    pub retry_backoff: BackoffPolicy,
    /// How long a child job waits before re-checking its parent.
    pub admission_retry_delay: StdDuration,
    pub job: JobConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            retry_backoff: BackoffPolicy {
                max_retries: 3,
                base_delay: StdDuration::from_secs(5),
                max_delay: StdDuration::from_secs(10 * 60),
            },
            admission_retry_delay: StdDuration::from_secs(30),
            job: JobConfig::default(),
        }
    }
}

/// What happened to a trigger request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Enqueued,
    /// A job for this entity is already queued or running.
    Coalesced,
    /// The entity is paused; the job is held until resume.
    Held,
}

/// Raised exactly once when a job exhausts its attempts.
#[derive(Debug, Clone)]
pub struct Alert {
    pub entity: EntityKind,
    pub job_id: Uuid,
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Default)]
struct Lane {
    /// A job for this entity is queued, held, or running.
    busy: bool,
    paused: bool,
    held: Vec<SyncJob>,
    job_state: Option<JobState>,
}

struct Inner {
    source: Arc<dyn UpstreamSource>,
    storage: Arc<dyn SyncStorage>,
    mappings: MappingRegistry,
    clock: Arc<dyn Clock>,
    cfg: OrchestratorConfig,
    lanes: Mutex<HashMap<EntityKind, Lane>>,
    queue_tx: mpsc::UnboundedSender<SyncJob>,
    workers: Arc<Semaphore>,
    alerts: Mutex<Vec<Alert>>,
    cancel: CancelToken,
}

/// Owns the dispatch loop and the per-entity lane table. One orchestrator
/// per process; triggers come from the scheduler or the CLI.
pub struct Orchestrator {
    inner: Arc<Inner>,
    cancel_handle: CancelHandle,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Spawns the dispatcher; must run inside a tokio runtime.
    pub fn new(
        source: Arc<dyn UpstreamSource>,
        storage: Arc<dyn SyncStorage>,
        mappings: MappingRegistry,
        clock: Arc<dyn Clock>,
        cfg: OrchestratorConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (cancel_handle, cancel) = cancel_pair();
        let workers = Arc::new(Semaphore::new(cfg.workers.max(1)));

        let inner = Arc::new(Inner {
            source,
            storage,
            mappings,
            clock,
            cfg,
            lanes: Mutex::new(HashMap::new()),
            queue_tx,
            workers,
            alerts: Mutex::new(Vec::new()),
            cancel,
        });

        let dispatcher = tokio::spawn(dispatch_loop(inner.clone(), queue_rx));
        Self {
            inner,
            cancel_handle,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Enqueue a sync job for the entity unless one is already in flight.
    pub async fn trigger(
        &self,
        entity: EntityKind,
        trigger: Trigger,
    ) -> Result<TriggerOutcome, SyncError> {
        let job = SyncJob::queued(entity, trigger, self.inner.clock.now());

        let outcome = {
            let mut lanes = self.inner.lanes.lock().expect("lane table poisoned");
            let lane = lanes.entry(entity).or_default();
            if lane.busy {
                return Ok(TriggerOutcome::Coalesced);
            }
            lane.busy = true;
            lane.job_state = Some(JobState::Queued);
            if lane.paused {
                lane.held.push(job.clone());
                TriggerOutcome::Held
            } else {
                TriggerOutcome::Enqueued
            }
        };

        // The lane is already claimed; if the job row cannot be written,
        // release it so a later trigger can take over instead of coalescing
        // against a job that will never run.
        if let Err(err) = self.inner.storage.record_job(&job).await {
            let mut lanes = self.inner.lanes.lock().expect("lane table poisoned");
            let lane = lanes.entry(entity).or_default();
            lane.busy = false;
            lane.job_state = None;
            lane.held.retain(|held| held.id != job.id);
            return Err(err.into());
        }
        if outcome == TriggerOutcome::Enqueued {
            self.inner.enqueue(job);
        }
        debug!(%entity, ?trigger, ?outcome, "trigger");
        Ok(outcome)
    }

    /// Trigger every entity in dependency order.
    pub async fn trigger_all(&self, trigger: Trigger) -> Result<(), SyncError> {
        for entity in EntityKind::DEPENDENCY_ORDER {
            self.trigger(entity, trigger).await?;
        }
        Ok(())
    }

    /// Hold future jobs for the entity. A job already running finishes.
    pub fn pause(&self, entity: EntityKind) {
        let mut lanes = self.inner.lanes.lock().expect("lane table poisoned");
        lanes.entry(entity).or_default().paused = true;
        info!(%entity, "paused");
    }

    /// Release the entity and dispatch anything held while paused.
    pub fn resume(&self, entity: EntityKind) {
        let held = {
            let mut lanes = self.inner.lanes.lock().expect("lane table poisoned");
            let lane = lanes.entry(entity).or_default();
            lane.paused = false;
            std::mem::take(&mut lane.held)
        };
        for job in held {
            self.inner.enqueue(job);
        }
        info!(%entity, "resumed");
    }

    pub async fn status(&self, entity: EntityKind) -> Result<SyncStatus, SyncError> {
        let cursor = self.inner.storage.cursor(entity).await?;
        let (job_state, paused) = {
            let lanes = self.inner.lanes.lock().expect("lane table poisoned");
            lanes
                .get(&entity)
                .map(|lane| (lane.job_state, lane.paused))
                .unwrap_or((None, false))
        };
        Ok(SyncStatus {
            entity,
            position: cursor.position,
            last_success_at: cursor.last_success_at,
            consecutive_failures: cursor.consecutive_failures,
            job_state,
            paused,
        })
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.inner.alerts.lock().expect("alert list poisoned").clone()
    }

    /// Cancel running jobs and stop the dispatcher. Committed work stays.
    pub async fn shutdown(&self) {
        self.cancel_handle.cancel();
        let handle = self
            .dispatcher
            .lock()
            .expect("dispatcher handle poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut queue_rx: mpsc::UnboundedReceiver<SyncJob>) {
    loop {
        let job = tokio::select! {
            job = queue_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = inner.cancel.cancelled() => break,
        };

        let permit = match inner.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            inner.run_job(job).await;
            drop(permit);
        });
    }
    debug!("dispatcher stopped");
}

impl Inner {
    fn enqueue(&self, job: SyncJob) {
        if self.queue_tx.send(job).is_err() {
            warn!("job dropped: dispatcher is gone");
        }
    }

    fn finish_lane(&self, entity: EntityKind, state: JobState) {
        let mut lanes = self.lanes.lock().expect("lane table poisoned");
        let lane = lanes.entry(entity).or_default();
        lane.busy = false;
        lane.job_state = Some(state);
    }

    fn set_lane_state(&self, entity: EntityKind, state: JobState) {
        let mut lanes = self.lanes.lock().expect("lane table poisoned");
        lanes.entry(entity).or_default().job_state = Some(state);
    }

    async fn record_job_or_log(&self, job: &SyncJob) {
        if let Err(err) = self.storage.record_job(job).await {
            warn!(entity = %job.entity, job = %job.id, error = %err, "failed to persist job row");
        }
    }

    /// A child runs only against a parent snapshot at least as fresh as the
    /// moment the child was queued. Deferral does not consume an attempt.
    async fn admitted(&self, job: &SyncJob) -> Result<bool, SyncError> {
        let Some(parent) = job.entity.parent() else {
            return Ok(true);
        };
        let parent_cursor = self.storage.cursor(parent).await?;
        Ok(parent_cursor
            .last_success_at
            .is_some_and(|ts| ts >= job.queued_at))
    }

    async fn run_job(self: Arc<Self>, mut job: SyncJob) {
        if self.cancel.is_cancelled() {
            self.finish_lane(job.entity, JobState::Failed);
            return;
        }

        match self.admitted(&job).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(entity = %job.entity, job = %job.id, "parent not fresh yet, deferring");
                let inner = self.clone();
                let delay = self.cfg.admission_retry_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.enqueue(job);
                });
                return;
            }
            Err(err) => {
                self.fail_terminally(job, &err).await;
                return;
            }
        }

        job.state = JobState::Running;
        job.attempt_count += 1;
        job.started_at = Some(self.clock.now());
        self.set_lane_state(job.entity, JobState::Running);
        self.record_job_or_log(&job).await;

        let result = run_entity_job(
            job.entity,
            self.source.as_ref(),
            self.storage.as_ref(),
            &self.mappings,
            &self.cfg.job,
            self.clock.as_ref(),
            &self.cancel,
        )
        .await;

        match result {
            Ok(report) => {
                job.state = JobState::Succeeded;
                job.finished_at = Some(self.clock.now());
                job.error_summary = None;
                self.record_job_or_log(&job).await;
                self.finish_lane(job.entity, JobState::Succeeded);
                info!(
                    entity = %job.entity,
                    job = %job.id,
                    applied = report.applied,
                    unchanged = report.unchanged,
                    skipped = report.skipped,
                    "job succeeded"
                );
            }
            Err(SyncError::Cancelled) => {
                job.state = JobState::Failed;
                job.finished_at = Some(self.clock.now());
                job.error_summary = Some("cancelled".to_string());
                self.record_job_or_log(&job).await;
                self.finish_lane(job.entity, JobState::Failed);
                info!(entity = %job.entity, job = %job.id, "job cancelled");
            }
            Err(err) if err.is_retryable() && job.attempt_count < self.cfg.max_attempts => {
                if let Err(rec_err) = self.storage.record_failure(job.entity, self.clock.now()).await
                {
                    warn!(entity = %job.entity, error = %rec_err, "failed to record failure");
                }
                job.state = JobState::Failed;
                job.error_summary = Some(err.to_string());
                self.record_job_or_log(&job).await;

                let delay = self
                    .cfg
                    .retry_backoff
                    .jittered_delay(job.attempt_count.saturating_sub(1) as usize);
                warn!(
                    entity = %job.entity,
                    job = %job.id,
                    attempt = job.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "job failed, will retry"
                );

                let inner = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    job.state = JobState::Queued;
                    inner.record_job_or_log(&job).await;
                    inner.set_lane_state(job.entity, JobState::Queued);
                    inner.enqueue(job);
                });
            }
            Err(err) => {
                if let Err(rec_err) = self.storage.record_failure(job.entity, self.clock.now()).await
                {
                    warn!(entity = %job.entity, error = %rec_err, "failed to record failure");
                }
                self.fail_terminally(job, &err).await;
            }
        }
    }

    /// Terminal failure path: one state write, one alert, one error log.
    async fn fail_terminally(&self, mut job: SyncJob, err: &SyncError) {
        job.state = JobState::FailedExhausted;
        job.finished_at = Some(self.clock.now());
        job.error_summary = Some(err.to_string());
        self.record_job_or_log(&job).await;
        self.finish_lane(job.entity, JobState::FailedExhausted);

        error!(
            entity = %job.entity,
            job = %job.id,
            attempts = job.attempt_count,
            error = %err,
            "job exhausted its attempts"
        );
        self.alerts.lock().expect("alert list poisoned").push(Alert {
            entity: job.entity,
            job_id: job.id,
            at: self.clock.now(),
            message: format!("{} sync exhausted after {} attempts: {err}", job.entity, job.attempt_count),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanConfig;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use zakup_client::{FetchError, PageQuery, UpstreamPage};
    use zakup_core::{CursorPosition, SyncCursor};
    use zakup_store::MemoryStorage;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    /// Always fails with a retryable error; counts fetch attempts.
    struct FailingSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl UpstreamSource for FailingSource {
        async fn fetch(
            &self,
            _entity: EntityKind,
            _query: &PageQuery,
        ) -> Result<UpstreamPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::Timeout)
        }
    }

    /// Returns one short page per fetch; enough for a single-window run.
    struct OnePageSource;

    #[async_trait]
    impl UpstreamSource for OnePageSource {
        async fn fetch(
            &self,
            _entity: EntityKind,
            _query: &PageQuery,
        ) -> Result<UpstreamPage, FetchError> {
            Ok(UpstreamPage {
                items: vec![json!({"id": 1, "trd_buy_id": 1, "name_ru": "x"})],
                total: Some(1),
            })
        }
    }

    fn cfg() -> OrchestratorConfig {
        OrchestratorConfig {
            workers: 2,
            max_attempts: 2,
            retry_backoff: BackoffPolicy {
                max_retries: 1,
                base_delay: StdDuration::from_millis(100),
                max_delay: StdDuration::from_secs(1),
            },
            admission_retry_delay: StdDuration::from_millis(200),
            job: JobConfig {
                plan: PlanConfig {
                    window: chrono::Duration::seconds(50),
                    safety_lag: chrono::Duration::seconds(100),
                    page_size: 100,
                    initial_sync_from: t(0),
                },
                budget: StdDuration::from_secs(60),
                archive_raw: false,
            },
        }
    }

    async fn seed(storage: &MemoryStorage, entity: EntityKind, position: CursorPosition) {
        storage
            .seed_cursor(SyncCursor {
                position: Some(position),
                ..SyncCursor::initial(entity)
            })
            .await;
    }

    /// Polls until the entity has at least `min` records, on the virtual clock.
    async fn wait_for_records(storage: &MemoryStorage, entity: EntityKind, min: usize) {
        for _ in 0..500 {
            if storage.records(entity).await.len() >= min {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        panic!("{entity} never reached {min} records");
    }

    async fn wait_for_alert(orchestrator: &Orchestrator) {
        for _ in 0..500 {
            if !orchestrator.alerts().is_empty() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        panic!("no alert was raised");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_job_raises_exactly_one_alert() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, EntityKind::Procurement, CursorPosition::Timestamp(t(100))).await;
        let source = Arc::new(FailingSource { calls: AtomicU32::new(0) });

        let orchestrator = Orchestrator::new(
            source.clone(),
            storage.clone(),
            MappingRegistry::builtin(),
            Arc::new(FixedClock(t(300))),
            cfg(),
        );

        let outcome = orchestrator
            .trigger(EntityKind::Procurement, Trigger::Manual)
            .await
            .unwrap();
        assert_eq!(outcome, TriggerOutcome::Enqueued);

        wait_for_alert(&orchestrator).await;
        // Let any stray retries play out, then confirm the alert is singular.
        tokio::time::sleep(StdDuration::from_secs(5)).await;
        assert_eq!(orchestrator.alerts().len(), 1);

        let jobs = storage.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::FailedExhausted);
        assert_eq!(jobs[0].attempt_count, 2);

        let status = orchestrator.status(EntityKind::Procurement).await.unwrap();
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.position, Some(CursorPosition::Timestamp(t(100))));
        assert_eq!(status.job_state, Some(JobState::FailedExhausted));

        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_coalesce_while_a_job_is_in_flight() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, EntityKind::Procurement, CursorPosition::Timestamp(t(100))).await;

        // Fetch stalls so the first job is still running on the second trigger.
        struct SlowSource;
        #[async_trait]
        impl UpstreamSource for SlowSource {
            async fn fetch(
                &self,
                _entity: EntityKind,
                _query: &PageQuery,
            ) -> Result<UpstreamPage, FetchError> {
                tokio::time::sleep(StdDuration::from_secs(2)).await;
                Ok(UpstreamPage { items: Vec::new(), total: Some(0) })
            }
        }

        let orchestrator = Orchestrator::new(
            Arc::new(SlowSource),
            storage.clone(),
            MappingRegistry::builtin(),
            Arc::new(FixedClock(t(300))),
            cfg(),
        );

        let first = orchestrator
            .trigger(EntityKind::Procurement, Trigger::Scheduled)
            .await
            .unwrap();
        let second = orchestrator
            .trigger(EntityKind::Procurement, Trigger::Scheduled)
            .await
            .unwrap();
        assert_eq!(first, TriggerOutcome::Enqueued);
        assert_eq!(second, TriggerOutcome::Coalesced);

        assert_eq!(storage.jobs().await.len(), 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn child_defers_until_its_parent_has_a_fresh_success() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, EntityKind::Lot, CursorPosition::Timestamp(t(100))).await;
        // Parent cursor exists but has never succeeded.
        seed(&storage, EntityKind::Procurement, CursorPosition::Timestamp(t(150))).await;

        let orchestrator = Orchestrator::new(
            Arc::new(OnePageSource),
            storage.clone(),
            MappingRegistry::builtin(),
            Arc::new(FixedClock(t(300))),
            cfg(),
        );

        orchestrator
            .trigger(EntityKind::Lot, Trigger::Manual)
            .await
            .unwrap();

        // Held in admission limbo: no lot records appear.
        tokio::time::sleep(StdDuration::from_secs(1)).await;
        assert!(storage.records(EntityKind::Lot).await.is_empty());

        // Parent succeeds after the child was queued; the deferral loop
        // picks it up on the next admission check.
        storage
            .seed_cursor(SyncCursor {
                position: Some(CursorPosition::Timestamp(t(150))),
                last_success_at: Some(t(300)),
                last_attempt_at: Some(t(300)),
                consecutive_failures: 0,
                ..SyncCursor::initial(EntityKind::Procurement)
            })
            .await;

        wait_for_records(&storage, EntityKind::Lot, 1).await;
        let jobs = storage.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Succeeded);
        // One recorded attempt: the deferrals consumed none.
        assert_eq!(jobs[0].attempt_count, 1);

        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_row_write_releases_the_lane() {
        use std::sync::atomic::AtomicBool;
        use zakup_core::{CanonicalRecord, PositionDecodeError, SyncJob as CoreSyncJob};
        use zakup_store::{CommitOutcome, RawSnapshot, StoreError};

        /// Delegates to memory storage, failing the first job-row write.
        struct FlakyJobStore {
            inner: MemoryStorage,
            fail_next: AtomicBool,
        }

        #[async_trait]
        impl zakup_store::SyncStorage for FlakyJobStore {
            async fn cursor(&self, entity: EntityKind) -> Result<SyncCursor, StoreError> {
                self.inner.cursor(entity).await
            }

            async fn commit_batch(
                &self,
                entity: EntityKind,
                records: &[CanonicalRecord],
                new_position: &CursorPosition,
                raw: Option<&RawSnapshot>,
                committed_at: DateTime<Utc>,
            ) -> Result<CommitOutcome, StoreError> {
                self.inner
                    .commit_batch(entity, records, new_position, raw, committed_at)
                    .await
            }

            async fn record_failure(
                &self,
                entity: EntityKind,
                at: DateTime<Utc>,
            ) -> Result<(), StoreError> {
                self.inner.record_failure(entity, at).await
            }

            async fn record_job(&self, job: &CoreSyncJob) -> Result<(), StoreError> {
                if self.fail_next.swap(false, Ordering::SeqCst) {
                    return Err(StoreError::CorruptCursor(PositionDecodeError(
                        "job table unavailable".to_string(),
                    )));
                }
                self.inner.record_job(job).await
            }

            async fn record_count(&self, entity: EntityKind) -> Result<u64, StoreError> {
                self.inner.record_count(entity).await
            }
        }

        let storage = Arc::new(FlakyJobStore {
            inner: MemoryStorage::new(),
            fail_next: AtomicBool::new(true),
        });
        seed(&storage.inner, EntityKind::Procurement, CursorPosition::Timestamp(t(100))).await;

        let orchestrator = Orchestrator::new(
            Arc::new(OnePageSource),
            storage.clone(),
            MappingRegistry::builtin(),
            Arc::new(FixedClock(t(300))),
            cfg(),
        );

        let err = orchestrator
            .trigger(EntityKind::Procurement, Trigger::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));

        // The failed trigger must not leave the lane claimed: the next
        // trigger enqueues instead of coalescing, and the sync runs.
        let outcome = orchestrator
            .trigger(EntityKind::Procurement, Trigger::Manual)
            .await
            .unwrap();
        assert_eq!(outcome, TriggerOutcome::Enqueued);
        wait_for_records(&storage.inner, EntityKind::Procurement, 1).await;

        orchestrator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn paused_entity_holds_jobs_until_resume() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage, EntityKind::Procurement, CursorPosition::Timestamp(t(100))).await;

        let orchestrator = Orchestrator::new(
            Arc::new(OnePageSource),
            storage.clone(),
            MappingRegistry::builtin(),
            Arc::new(FixedClock(t(300))),
            cfg(),
        );

        orchestrator.pause(EntityKind::Procurement);
        let outcome = orchestrator
            .trigger(EntityKind::Procurement, Trigger::Manual)
            .await
            .unwrap();
        assert_eq!(outcome, TriggerOutcome::Held);

        tokio::time::sleep(StdDuration::from_secs(1)).await;
        assert!(storage.records(EntityKind::Procurement).await.is_empty());
        let status = orchestrator.status(EntityKind::Procurement).await.unwrap();
        assert!(status.paused);
        assert_eq!(status.job_state, Some(JobState::Queued));

        orchestrator.resume(EntityKind::Procurement);
        wait_for_records(&storage, EntityKind::Procurement, 1).await;
        orchestrator.shutdown().await;
    }
}
