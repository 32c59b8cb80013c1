//! In-memory `SyncStorage` with the same merge and cursor semantics as the
//! Postgres store. Backs the engine's scenario tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;
use zakup_core::{CanonicalRecord, CursorPosition, EntityKind, SyncCursor, SyncJob};

use crate::{check_monotonic, CommitOutcome, RawSnapshot, StoreError, SyncStorage};

#[derive(Debug, Clone)]
pub struct StoredRaw {
    pub entity: EntityKind,
    pub fetched_at: DateTime<Utc>,
    pub sha256: String,
    pub item_count: u32,
}

#[derive(Debug, Default)]
struct MemoryInner {
    cursors: HashMap<EntityKind, SyncCursor>,
    records: BTreeMap<(EntityKind, String), CanonicalRecord>,
    raw: Vec<StoredRaw>,
    jobs: HashMap<Uuid, SyncJob>,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a cursor directly, bypassing the commit path. Test setup only.
    pub async fn seed_cursor(&self, cursor: SyncCursor) {
        let mut inner = self.inner.lock().await;
        inner.cursors.insert(cursor.entity, cursor);
    }

    pub async fn records(&self, entity: EntityKind) -> Vec<CanonicalRecord> {
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .filter(|((e, _), _)| *e == entity)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub async fn record(&self, entity: EntityKind, natural_key: &str) -> Option<CanonicalRecord> {
        let inner = self.inner.lock().await;
        inner
            .records
            .get(&(entity, natural_key.to_string()))
            .cloned()
    }

    pub async fn jobs(&self) -> Vec<SyncJob> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<_> = inner.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.queued_at);
        jobs
    }

    pub async fn raw_snapshots(&self) -> Vec<StoredRaw> {
        self.inner.lock().await.raw.clone()
    }
}

#[async_trait]
impl SyncStorage for MemoryStorage {
    async fn cursor(&self, entity: EntityKind) -> Result<SyncCursor, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .cursors
            .get(&entity)
            .cloned()
            .unwrap_or_else(|| SyncCursor::initial(entity)))
    }

    async fn commit_batch(
        &self,
        entity: EntityKind,
        records: &[CanonicalRecord],
        new_position: &CursorPosition,
        raw: Option<&RawSnapshot>,
        committed_at: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.inner.lock().await;

        let current = inner.cursors.get(&entity).and_then(|c| c.position);
        check_monotonic(entity, current.as_ref(), new_position)?;

        let mut outcome = CommitOutcome::default();
        for record in records {
            let key = (entity, record.natural_key.clone());
            match inner.records.get_mut(&key) {
                Some(existing) => {
                    // Field-wise merge, matching the JSONB `||` upsert: new
                    // values win per field, untouched fields survive, and a
                    // batch changing neither attributes nor the parent key
                    // is a no-op.
                    let mut merged = existing.attrs.clone();
                    merged.extend(record.attrs.clone());
                    if merged != existing.attrs
                        || existing.dependency_key != record.dependency_key
                    {
                        existing.attrs = merged;
                        existing.dependency_key = record.dependency_key.clone();
                        existing.synced_at = record.synced_at;
                        outcome.applied += 1;
                    } else {
                        outcome.unchanged += 1;
                    }
                }
                None => {
                    inner.records.insert(key, record.clone());
                    outcome.applied += 1;
                }
            }
        }

        if let Some(raw) = raw {
            let sha256 = raw.content_hash();
            inner.raw.push(StoredRaw {
                entity: raw.entity,
                fetched_at: raw.fetched_at,
                sha256,
                item_count: raw.item_count,
            });
        }

        let cursor = inner
            .cursors
            .entry(entity)
            .or_insert_with(|| SyncCursor::initial(entity));
        cursor.position = Some(*new_position);
        cursor.last_success_at = Some(committed_at);
        cursor.last_attempt_at = Some(committed_at);
        cursor.consecutive_failures = 0;

        Ok(outcome)
    }

    async fn record_failure(
        &self,
        entity: EntityKind,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let cursor = inner
            .cursors
            .entry(entity)
            .or_insert_with(|| SyncCursor::initial(entity));
        cursor.last_attempt_at = Some(at);
        cursor.consecutive_failures += 1;
        Ok(())
    }

    async fn record_job(&self, job: &SyncJob) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn record_count(&self, entity: EntityKind) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.records.keys().filter(|(e, _)| *e == entity).count() as u64)
    }
}
