//! Storage boundary: transactional upsert-by-natural-key plus cursor rows.
//!
//! The one rule that everything else leans on: a batch of canonical records
//! and the cursor advance that bounds it commit in the same transaction.
//! Crash anywhere and the mirror resumes from the last durable position with
//! no loss and no duplication (upserts are keyed by the upstream natural key).

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use zakup_core::{
    CanonicalRecord, CursorPosition, EntityKind, PositionDecodeError, SyncCursor, SyncJob,
};

pub use memory::MemoryStorage;

pub const CRATE_NAME: &str = "zakup-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("cursor for {entity} would regress from {current} to {requested}")]
    CursorRegression {
        entity: EntityKind,
        current: String,
        requested: String,
    },
    #[error("cursor kind mismatch for {entity}: stored {current}, requested {requested}")]
    CursorKindMismatch {
        entity: EntityKind,
        current: String,
        requested: String,
    },
    #[error("corrupt cursor position: {0}")]
    CorruptCursor(#[from] PositionDecodeError),
}

impl StoreError {
    /// Constraint/schema mismatches and invariant violations are fatal;
    /// everything else (connection loss, lock timeouts) is worth a retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Db(sqlx::Error::Database(db)) => db.constraint().is_none(),
            StoreError::Db(_) | StoreError::Migration(_) => true,
            StoreError::CursorRegression { .. }
            | StoreError::CursorKindMismatch { .. }
            | StoreError::CorruptCursor(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Rows inserted or materially changed.
    pub applied: u64,
    /// Rows whose attributes already matched (idempotent re-application).
    pub unchanged: u64,
}

/// Raw upstream payload archived alongside the batch it produced.
#[derive(Debug, Clone)]
pub struct RawSnapshot {
    pub entity: EntityKind,
    pub fetched_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub item_count: u32,
}

impl RawSnapshot {
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

/// Transactional store the sync engine writes through.
#[async_trait]
pub trait SyncStorage: Send + Sync {
    /// Cursor row for the entity; an initial (position = none) cursor if the
    /// entity has never synced.
    async fn cursor(&self, entity: EntityKind) -> Result<SyncCursor, StoreError>;

    /// Upsert `records` and advance the cursor to `new_position` atomically.
    /// Rejects regressions; re-committing an identical batch is a no-op
    /// beyond confirming equality.
    async fn commit_batch(
        &self,
        entity: EntityKind,
        records: &[CanonicalRecord],
        new_position: &CursorPosition,
        raw: Option<&RawSnapshot>,
        committed_at: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError>;

    /// Record a failed attempt: bumps `last_attempt_at` and
    /// `consecutive_failures`, never the position.
    async fn record_failure(
        &self,
        entity: EntityKind,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Persist a job row (insert or full update keyed by job id).
    async fn record_job(&self, job: &SyncJob) -> Result<(), StoreError>;

    async fn record_count(&self, entity: EntityKind) -> Result<u64, StoreError>;
}

/// Enforced before any cursor write, inside the owning transaction.
fn check_monotonic(
    entity: EntityKind,
    current: Option<&CursorPosition>,
    requested: &CursorPosition,
) -> Result<(), StoreError> {
    let Some(current) = current else {
        return Ok(());
    };
    match current.try_cmp(requested) {
        Some(std::cmp::Ordering::Greater) => Err(StoreError::CursorRegression {
            entity,
            current: current.encode(),
            requested: requested.encode(),
        }),
        Some(_) => Ok(()),
        None => Err(StoreError::CursorKindMismatch {
            entity,
            current: current.encode(),
            requested: requested.encode(),
        }),
    }
}

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SyncStorage for PgStorage {
    async fn cursor(&self, entity: EntityKind) -> Result<SyncCursor, StoreError> {
        let row = sqlx::query(
            "SELECT position, last_success_at, last_attempt_at, consecutive_failures \
             FROM sync_cursors WHERE entity = $1",
        )
        .bind(entity.wire_name())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(SyncCursor::initial(entity));
        };

        let position = row
            .try_get::<Option<String>, _>("position")?
            .map(|raw| CursorPosition::decode(&raw))
            .transpose()?;

        Ok(SyncCursor {
            entity,
            position,
            last_success_at: row.try_get("last_success_at")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            consecutive_failures: row.try_get::<i32, _>("consecutive_failures")? as u32,
        })
    }

    async fn commit_batch(
        &self,
        entity: EntityKind,
        records: &[CanonicalRecord],
        new_position: &CursorPosition,
        raw: Option<&RawSnapshot>,
        committed_at: DateTime<Utc>,
    ) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row-level lock per entity: concurrent commits for different
        // entities proceed, a second commit for the same entity waits.
        let current = sqlx::query(
            "SELECT position FROM sync_cursors WHERE entity = $1 FOR UPDATE",
        )
        .bind(entity.wire_name())
        .fetch_optional(&mut *tx)
        .await?;

        let current_position = current
            .and_then(|row| row.try_get::<Option<String>, _>("position").ok().flatten())
            .map(|raw| CursorPosition::decode(&raw))
            .transpose()?;
        check_monotonic(entity, current_position.as_ref(), new_position)?;

        let mut outcome = CommitOutcome::default();
        for record in records {
            let result = sqlx::query(
                "INSERT INTO records (entity, natural_key, dependency_key, attrs, synced_at, first_seen_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $5, $5) \
                 ON CONFLICT (entity, natural_key) DO UPDATE SET \
                   dependency_key = EXCLUDED.dependency_key, \
                   attrs = records.attrs || EXCLUDED.attrs, \
                   synced_at = EXCLUDED.synced_at, \
                   updated_at = EXCLUDED.updated_at \
                 WHERE records.attrs IS DISTINCT FROM records.attrs || EXCLUDED.attrs \
                    OR records.dependency_key IS DISTINCT FROM EXCLUDED.dependency_key",
            )
            .bind(entity.wire_name())
            .bind(&record.natural_key)
            .bind(&record.dependency_key)
            .bind(record.attrs_json())
            .bind(record.synced_at)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                outcome.applied += 1;
            } else {
                outcome.unchanged += 1;
            }
        }

        if let Some(raw) = raw {
            sqlx::query(
                "INSERT INTO raw_payloads (id, entity, fetched_at, sha256, item_count, payload) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(Uuid::new_v4())
            .bind(raw.entity.wire_name())
            .bind(raw.fetched_at)
            .bind(raw.content_hash())
            .bind(raw.item_count as i32)
            .bind(&raw.payload)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO sync_cursors (entity, position, last_success_at, last_attempt_at, consecutive_failures) \
             VALUES ($1, $2, $3, $3, 0) \
             ON CONFLICT (entity) DO UPDATE SET \
               position = EXCLUDED.position, \
               last_success_at = EXCLUDED.last_success_at, \
               last_attempt_at = EXCLUDED.last_attempt_at, \
               consecutive_failures = 0",
        )
        .bind(entity.wire_name())
        .bind(new_position.encode())
        .bind(committed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(%entity, applied = outcome.applied, unchanged = outcome.unchanged,
               position = %new_position, "batch committed");
        Ok(outcome)
    }

    async fn record_failure(
        &self,
        entity: EntityKind,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_cursors (entity, position, last_success_at, last_attempt_at, consecutive_failures) \
             VALUES ($1, NULL, NULL, $2, 1) \
             ON CONFLICT (entity) DO UPDATE SET \
               last_attempt_at = EXCLUDED.last_attempt_at, \
               consecutive_failures = sync_cursors.consecutive_failures + 1",
        )
        .bind(entity.wire_name())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_job(&self, job: &SyncJob) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_jobs (id, entity, trigger_kind, state, attempt_count, queued_at, started_at, finished_at, error_summary) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (id) DO UPDATE SET \
               state = EXCLUDED.state, \
               attempt_count = EXCLUDED.attempt_count, \
               started_at = EXCLUDED.started_at, \
               finished_at = EXCLUDED.finished_at, \
               error_summary = EXCLUDED.error_summary",
        )
        .bind(job.id)
        .bind(job.entity.wire_name())
        .bind(match job.trigger {
            zakup_core::Trigger::Scheduled => "scheduled",
            zakup_core::Trigger::Manual => "manual",
        })
        .bind(job.state.to_string())
        .bind(job.attempt_count as i32)
        .bind(job.queued_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.error_summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_count(&self, entity: EntityKind) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM records WHERE entity = $1")
            .bind(entity.wire_name())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")? as u64)
    }
}
