//! Core domain model for the goszakup procurement mirror.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "zakup-core";

/// Upstream entity kinds, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Procurement,
    Lot,
    Contract,
    Participant,
}

impl EntityKind {
    /// Fixed processing order: parents before children.
    pub const DEPENDENCY_ORDER: [EntityKind; 4] = [
        EntityKind::Procurement,
        EntityKind::Lot,
        EntityKind::Contract,
        EntityKind::Participant,
    ];

    /// Upstream REST endpoint name for this entity.
    pub fn wire_name(self) -> &'static str {
        match self {
            EntityKind::Procurement => "trd_buy",
            EntityKind::Lot => "lot",
            EntityKind::Contract => "contract",
            EntityKind::Participant => "participant",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "trd_buy" => Some(EntityKind::Procurement),
            "lot" => Some(EntityKind::Lot),
            "contract" => Some(EntityKind::Contract),
            "participant" => Some(EntityKind::Participant),
            _ => None,
        }
    }

    /// Parent entity whose records must exist before ours commit.
    pub fn parent(self) -> Option<EntityKind> {
        match self {
            EntityKind::Procurement => None,
            EntityKind::Lot => Some(EntityKind::Procurement),
            EntityKind::Contract => Some(EntityKind::Lot),
            // The participant directory is independent; ordering relative to
            // contracts is advisory only.
            EntityKind::Participant => None,
        }
    }

    /// How this entity's listing is cursored upstream.
    pub fn cursor_kind(self) -> CursorKind {
        match self {
            EntityKind::Participant => CursorKind::Page,
            _ => CursorKind::Timestamp,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    Timestamp,
    Page,
}

/// Durable resume position for one entity's listing.
///
/// Positions are opaque strings in storage; in memory they carry the variant
/// so monotonicity checks stay type-safe. Comparing across variants is a
/// storage invariant violation, surfaced as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CursorPosition {
    Timestamp(DateTime<Utc>),
    Page(u64),
}

impl CursorPosition {
    pub fn encode(&self) -> String {
        match self {
            CursorPosition::Timestamp(ts) => {
                format!("ts:{}", ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            CursorPosition::Page(page) => format!("page:{page}"),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, PositionDecodeError> {
        if let Some(rest) = raw.strip_prefix("ts:") {
            let ts = DateTime::parse_from_rfc3339(rest)
                .map_err(|_| PositionDecodeError(raw.to_string()))?;
            Ok(CursorPosition::Timestamp(ts.with_timezone(&Utc)))
        } else if let Some(rest) = raw.strip_prefix("page:") {
            let page = rest
                .parse()
                .map_err(|_| PositionDecodeError(raw.to_string()))?;
            Ok(CursorPosition::Page(page))
        } else {
            Err(PositionDecodeError(raw.to_string()))
        }
    }

    /// Ordering within a cursor kind; `None` if the variants differ.
    pub fn try_cmp(&self, other: &CursorPosition) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (CursorPosition::Timestamp(a), CursorPosition::Timestamp(b)) => Some(a.cmp(b)),
            (CursorPosition::Page(a), CursorPosition::Page(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for CursorPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unparseable cursor position {0:?}")]
pub struct PositionDecodeError(pub String);

/// One row per entity kind; moved only by a successful batch commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub entity: EntityKind,
    pub position: Option<CursorPosition>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl SyncCursor {
    pub fn initial(entity: EntityKind) -> Self {
        Self {
            entity,
            position: None,
            last_success_at: None,
            last_attempt_at: None,
            consecutive_failures: 0,
        }
    }
}

/// Expected type for a mapped attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Int,
    Decimal,
    Timestamp,
    Bool,
}

/// Typed canonical value. Raw upstream maps never cross the transform
/// boundary; everything downstream is one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Text(String),
    Int(i64),
    Decimal(f64),
    Timestamp(DateTime<Utc>),
    Bool(bool),
}

impl AttrValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            AttrValue::Text(_) => FieldKind::Text,
            AttrValue::Int(_) => FieldKind::Int,
            AttrValue::Decimal(_) => FieldKind::Decimal,
            AttrValue::Timestamp(_) => FieldKind::Timestamp,
            AttrValue::Bool(_) => FieldKind::Bool,
        }
    }

    /// Plain JSON projection used for JSONB storage (timestamps as RFC 3339).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Text(s) => serde_json::Value::String(s.clone()),
            AttrValue::Int(i) => serde_json::Value::from(*i),
            AttrValue::Decimal(d) => {
                serde_json::Number::from_f64(*d).map_or(serde_json::Value::Null, Into::into)
            }
            AttrValue::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            AttrValue::Bool(b) => serde_json::Value::Bool(*b),
        }
    }
}

/// Transformed, validated record keyed by the upstream's stable identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub entity: EntityKind,
    pub natural_key: String,
    /// Natural key of the parent record, when the entity has one.
    pub dependency_key: Option<String>,
    pub attrs: BTreeMap<String, AttrValue>,
    pub synced_at: DateTime<Utc>,
}

impl CanonicalRecord {
    pub fn attrs_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .attrs
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// Why a single raw payload was skipped instead of transformed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    #[error("payload is not a JSON object")]
    NotObject,
    #[error("natural key missing from payload")]
    MissingNaturalKey,
    #[error("required field {field} missing")]
    MissingField { field: String },
    #[error("field {field} failed coercion to {expected:?}")]
    Coercion { field: String, expected: FieldKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// Job lifecycle.
///
/// Queued -> Running -> Succeeded
/// Queued -> Running -> Failed -> Queued (until max_attempts)
/// Queued -> Running -> FailedExhausted (terminal, alert raised)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    FailedExhausted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::FailedExhausted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::FailedExhausted => "failed_exhausted",
        };
        f.write_str(s)
    }
}

/// Durable record of one sync job run for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub entity: EntityKind,
    pub trigger: Trigger,
    pub state: JobState,
    pub attempt_count: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_summary: Option<String>,
}

impl SyncJob {
    pub fn queued(entity: EntityKind, trigger: Trigger, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity,
            trigger,
            state: JobState::Queued,
            attempt_count: 0,
            queued_at: now,
            started_at: None,
            finished_at: None,
            error_summary: None,
        }
    }
}

/// Operator-visible snapshot combining cursor state and the current job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub entity: EntityKind,
    pub position: Option<CursorPosition>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub job_state: Option<JobState>,
    pub paused: bool,
}
