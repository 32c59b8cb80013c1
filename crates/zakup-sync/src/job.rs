//! One sync run for one entity: plan a unit of work, fetch its pages,
//! transform, commit, repeat until caught up, cancelled, or out of budget.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zakup_client::{FetchError, UpstreamSource};
use zakup_core::{CursorKind, EntityKind};
use zakup_store::{RawSnapshot, StoreError, SyncStorage};

use crate::plan::{plan_next, PlanConfig};
use crate::transform::{transform_batch, MappingRegistry};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Upstream(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("job cancelled")]
    Cancelled,
    #[error("job exceeded its wall-clock budget")]
    BudgetExceeded,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Upstream(err) => err.is_retryable(),
            SyncError::Storage(err) => err.is_retryable(),
            SyncError::Cancelled => false,
            SyncError::BudgetExceeded => true,
        }
    }
}

/// Time source the runner plans and stamps against. Production uses the
/// system clock; tests pin it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Cooperative cancellation. The handle flips a flag; the running job checks
/// it between fetches and before each commit, so a cancelled job never leaves
/// a half-applied batch.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    fn check(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested (or the handle is gone).
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub plan: PlanConfig,
    /// Wall-clock cap for one run; whatever committed before the cap stays.
    pub budget: StdDuration,
    /// Archive each committed batch's raw payload alongside the records.
    pub archive_raw: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            plan: PlanConfig::default(),
            budget: StdDuration::from_secs(20 * 60),
            archive_raw: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub windows: u32,
    pub pages: u32,
    pub fetched: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub skipped: u64,
}

/// Run one entity to completion. Each planned unit commits independently, so
/// a failure partway through loses at most the in-flight unit; the cursor
/// already covers everything committed before it.
pub async fn run_entity_job(
    entity: EntityKind,
    source: &dyn UpstreamSource,
    storage: &dyn SyncStorage,
    mappings: &MappingRegistry,
    cfg: &JobConfig,
    clock: &dyn Clock,
    cancel: &CancelToken,
) -> Result<JobReport, SyncError> {
    let deadline = Instant::now() + cfg.budget;
    let mapping = mappings.mapping(entity);
    let single_page = entity.cursor_kind() == CursorKind::Page;
    let mut report = JobReport::default();

    loop {
        cancel.check()?;

        let cursor = storage.cursor(entity).await?;
        let parent_position = match entity.parent() {
            Some(parent) => storage.cursor(parent).await?.position,
            None => None,
        };

        let Some(plan) = plan_next(
            entity.cursor_kind(),
            cursor.position.as_ref(),
            parent_position.as_ref(),
            &cfg.plan,
            clock.now(),
        ) else {
            debug!(%entity, "caught up");
            break;
        };

        let mut query = plan.query.clone();
        let mut items: Vec<Value> = Vec::new();
        let mut short_page = false;
        loop {
            cancel.check()?;
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(SyncError::BudgetExceeded)?;
            let page = tokio::time::timeout(remaining, source.fetch(entity, &query))
                .await
                .map_err(|_| SyncError::BudgetExceeded)??;

            report.pages += 1;
            let page_len = page.items.len();
            items.extend(page.items);

            if (page_len as u32) < query.limit {
                short_page = true;
                break;
            }
            if single_page {
                break;
            }
            query.page += 1;
        }

        cancel.check()?;
        let synced_at = clock.now();
        let (records, skips) = transform_batch(mapping, &items, synced_at);
        for (idx, reason) in &skips {
            warn!(%entity, index = idx, %reason, "skipping malformed record");
        }

        let raw = cfg.archive_raw.then(|| RawSnapshot {
            entity,
            fetched_at: synced_at,
            payload: Value::Array(items.clone()),
            item_count: items.len() as u32,
        });

        let outcome = storage
            .commit_batch(entity, &records, &plan.end_position, raw.as_ref(), synced_at)
            .await?;

        report.windows += 1;
        report.fetched += items.len() as u64;
        report.applied += outcome.applied;
        report.unchanged += outcome.unchanged;
        report.skipped += skips.len() as u64;
        debug!(
            %entity,
            position = %plan.end_position,
            applied = outcome.applied,
            unchanged = outcome.unchanged,
            skipped = skips.len(),
            "unit committed"
        );

        // A short page on a page cursor means the directory listing ended.
        if single_page && short_page {
            break;
        }
    }

    info!(
        %entity,
        windows = report.windows,
        fetched = report.fetched,
        applied = report.applied,
        skipped = report.skipped,
        "sync run finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use zakup_client::{PageQuery, UpstreamPage};
    use zakup_core::CursorPosition;
    use zakup_store::MemoryStorage;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    async fn seed(storage: &MemoryStorage, entity: EntityKind, position: CursorPosition) {
        storage
            .seed_cursor(zakup_core::SyncCursor {
                position: Some(position),
                ..zakup_core::SyncCursor::initial(entity)
            })
            .await;
    }

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    /// Scripted upstream: pops a canned response per fetch and records the
    /// queries it saw.
    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<UpstreamPage, FetchError>>>,
        queries: Mutex<Vec<PageQuery>>,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<UpstreamPage, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                queries: Mutex::new(Vec::new()),
            }
        }

        fn queries(&self) -> Vec<PageQuery> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl UpstreamSource for ScriptedSource {
        async fn fetch(
            &self,
            _entity: EntityKind,
            query: &PageQuery,
        ) -> Result<UpstreamPage, FetchError> {
            self.queries.lock().unwrap().push(query.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(UpstreamPage {
                        items: Vec::new(),
                        total: Some(0),
                    })
                })
        }
    }

    fn page_of(ids: std::ops::Range<u64>) -> Result<UpstreamPage, FetchError> {
        let items: Vec<Value> = ids
            .map(|i| json!({"id": i, "name_ru": format!("закуп {i}")}))
            .collect();
        let total = items.len() as u64;
        Ok(UpstreamPage {
            items,
            total: Some(total),
        })
    }

    fn job_cfg(window_secs: i64, lag_secs: i64) -> JobConfig {
        JobConfig {
            plan: PlanConfig {
                window: chrono::Duration::seconds(window_secs),
                safety_lag: chrono::Duration::seconds(lag_secs),
                page_size: 100,
                initial_sync_from: t(0),
            },
            budget: StdDuration::from_secs(60),
            archive_raw: false,
        }
    }

    #[tokio::test]
    async fn windows_drain_until_horizon_and_cursor_lands_on_it() {
        let storage = MemoryStorage::new();
        seed(&storage, EntityKind::Procurement, CursorPosition::Timestamp(t(100))).await;
        let source = ScriptedSource::new(vec![page_of(0..10), page_of(10..20)]);
        let (_handle, cancel) = cancel_pair();

        // Horizon is now - lag = t(200): two 50s windows from t(100).
        let report = run_entity_job(
            EntityKind::Procurement,
            &source,
            &storage,
            &MappingRegistry::builtin(),
            &job_cfg(50, 100),
            &FixedClock(t(300)),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(report.windows, 2);
        assert_eq!(report.fetched, 20);
        assert_eq!(report.applied, 20);
        assert_eq!(report.skipped, 0);

        let cursor = storage.cursor(EntityKind::Procurement).await.unwrap();
        assert_eq!(cursor.position, Some(CursorPosition::Timestamp(t(200))));
        assert_eq!(
            storage.records(EntityKind::Procurement).await.len(),
            20
        );

        let queries = source.queries();
        assert_eq!(queries[0].updated_from, Some(t(100)));
        assert_eq!(queries[0].updated_to, Some(t(150)));
        assert_eq!(queries[1].updated_from, Some(t(150)));
        assert_eq!(queries[1].updated_to, Some(t(200)));
    }

    #[tokio::test]
    async fn full_window_pages_until_short_page() {
        let storage = MemoryStorage::new();
        seed(&storage, EntityKind::Procurement, CursorPosition::Timestamp(t(100))).await;
        let mut cfg = job_cfg(50, 150);
        cfg.plan.page_size = 10;
        // Single window [100, 150); it needs two pages (10 then 4).
        let source = ScriptedSource::new(vec![page_of(0..10), page_of(10..14)]);
        let (_handle, cancel) = cancel_pair();

        let report = run_entity_job(
            EntityKind::Procurement,
            &source,
            &storage,
            &MappingRegistry::builtin(),
            &cfg,
            &FixedClock(t(300)),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(report.pages, 2);
        assert_eq!(report.fetched, 14);
        let queries = source.queries();
        assert_eq!(queries[0].page, 1);
        assert_eq!(queries[1].page, 2);
        assert_eq!(queries[1].updated_from, queries[0].updated_from);
    }

    #[tokio::test]
    async fn empty_window_still_advances_the_cursor() {
        let storage = MemoryStorage::new();
        seed(&storage, EntityKind::Procurement, CursorPosition::Timestamp(t(100))).await;
        let source = ScriptedSource::new(vec![Ok(UpstreamPage {
            items: Vec::new(),
            total: Some(0),
        })]);
        let (_handle, cancel) = cancel_pair();

        let report = run_entity_job(
            EntityKind::Procurement,
            &source,
            &storage,
            &MappingRegistry::builtin(),
            &job_cfg(50, 150),
            &FixedClock(t(300)),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(report.windows, 1);
        assert_eq!(report.fetched, 0);
        let cursor = storage.cursor(EntityKind::Procurement).await.unwrap();
        assert_eq!(cursor.position, Some(CursorPosition::Timestamp(t(150))));
    }

    #[tokio::test]
    async fn upstream_failure_leaves_the_cursor_untouched() {
        let storage = MemoryStorage::new();
        seed(&storage, EntityKind::Procurement, CursorPosition::Timestamp(t(100))).await;
        let source = ScriptedSource::new(vec![Err(FetchError::Timeout)]);
        let (_handle, cancel) = cancel_pair();

        let err = run_entity_job(
            EntityKind::Procurement,
            &source,
            &storage,
            &MappingRegistry::builtin(),
            &job_cfg(50, 100),
            &FixedClock(t(300)),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::Upstream(FetchError::Timeout)));
        assert!(err.is_retryable());
        let cursor = storage.cursor(EntityKind::Procurement).await.unwrap();
        assert_eq!(cursor.position, Some(CursorPosition::Timestamp(t(100))));
        assert!(storage.records(EntityKind::Procurement).await.is_empty());
    }

    #[tokio::test]
    async fn child_plans_stop_at_the_parent_position() {
        let storage = MemoryStorage::new();
        seed(&storage, EntityKind::Procurement, CursorPosition::Timestamp(t(150))).await;
        seed(&storage, EntityKind::Lot, CursorPosition::Timestamp(t(100))).await;
        let source = ScriptedSource::new(vec![Ok(UpstreamPage {
            items: vec![json!({"id": 1, "trd_buy_id": 7})],
            total: Some(1),
        })]);
        let (_handle, cancel) = cancel_pair();

        let report = run_entity_job(
            EntityKind::Lot,
            &source,
            &storage,
            &MappingRegistry::builtin(),
            &job_cfg(500, 0),
            &FixedClock(t(10_000)),
            &cancel,
        )
        .await
        .unwrap();

        // One window capped at the parent's t(150), then caught up.
        assert_eq!(report.windows, 1);
        let cursor = storage.cursor(EntityKind::Lot).await.unwrap();
        assert_eq!(cursor.position, Some(CursorPosition::Timestamp(t(150))));
    }

    #[tokio::test]
    async fn page_cursor_steps_until_a_short_page() {
        let storage = MemoryStorage::new();
        let mut cfg = job_cfg(50, 100);
        cfg.plan.page_size = 2;
        let source = ScriptedSource::new(vec![
            Ok(UpstreamPage {
                items: vec![json!({"bin": "100"}), json!({"bin": "101"})],
                total: None,
            }),
            Ok(UpstreamPage {
                items: vec![json!({"bin": "102"})],
                total: None,
            }),
        ]);
        let (_handle, cancel) = cancel_pair();

        let report = run_entity_job(
            EntityKind::Participant,
            &source,
            &storage,
            &MappingRegistry::builtin(),
            &cfg,
            &FixedClock(t(300)),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(report.windows, 2);
        assert_eq!(report.fetched, 3);
        let cursor = storage.cursor(EntityKind::Participant).await.unwrap();
        assert_eq!(cursor.position, Some(CursorPosition::Page(3)));
        let queries = source.queries();
        assert_eq!(queries[0].page, 1);
        assert_eq!(queries[1].page, 2);
        assert_eq!(queries[0].updated_from, None);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_any_fetch() {
        let storage = MemoryStorage::new();
        let source = ScriptedSource::new(vec![page_of(0..10)]);
        let (handle, cancel) = cancel_pair();
        handle.cancel();

        let err = run_entity_job(
            EntityKind::Procurement,
            &source,
            &storage,
            &MappingRegistry::builtin(),
            &job_cfg(50, 100),
            &FixedClock(t(300)),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert!(!err.is_retryable());
        assert!(source.queries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_upstream_trips_the_wall_clock_budget() {
        struct StalledSource;

        #[async_trait::async_trait]
        impl UpstreamSource for StalledSource {
            async fn fetch(
                &self,
                _entity: EntityKind,
                _query: &PageQuery,
            ) -> Result<UpstreamPage, FetchError> {
                tokio::time::sleep(StdDuration::from_secs(3600)).await;
                Ok(UpstreamPage {
                    items: Vec::new(),
                    total: None,
                })
            }
        }

        let storage = MemoryStorage::new();
        let mut cfg = job_cfg(50, 100);
        cfg.budget = StdDuration::from_secs(5);
        let (_handle, cancel) = cancel_pair();

        seed(&storage, EntityKind::Procurement, CursorPosition::Timestamp(t(100))).await;
        let err = run_entity_job(
            EntityKind::Procurement,
            &StalledSource,
            &storage,
            &MappingRegistry::builtin(),
            &cfg,
            &FixedClock(t(300)),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::BudgetExceeded));
        assert!(err.is_retryable());
    }
}
