//! Change discovery: turns a cursor into the next bounded unit of work.

use chrono::{DateTime, Duration, Utc};
use zakup_client::PageQuery;
use zakup_core::{CursorKind, CursorPosition};

#[derive(Debug, Clone)]
pub struct PlanConfig {
    /// Width of one timestamp window.
    pub window: Duration,
    /// Buffer subtracted from "now": records updated closer to the present
    /// than this may not be visible in upstream listings yet.
    pub safety_lag: Duration,
    pub page_size: u32,
    /// Where a never-synced timestamp cursor starts.
    pub initial_sync_from: DateTime<Utc>,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            window: Duration::hours(6),
            safety_lag: Duration::minutes(15),
            page_size: 100,
            initial_sync_from: DateTime::parse_from_rfc3339("2016-01-01T00:00:00Z")
                .expect("valid epoch")
                .with_timezone(&Utc),
        }
    }
}

/// One plannable unit: the query to issue and the position the cursor lands
/// on once the unit commits.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkPlan {
    pub query: PageQuery,
    pub end_position: CursorPosition,
}

/// `None` means caught up: nothing to fetch, cursor untouched.
///
/// Timestamp windows are capped at `now - safety_lag` and, when the entity
/// has a parent, at the parent's committed position, so a child never plans
/// past what its parent has durably ingested. Page cursors just step to the
/// next page; the runner stops stepping when a page comes back short.
pub fn plan_next(
    kind: CursorKind,
    position: Option<&CursorPosition>,
    parent_position: Option<&CursorPosition>,
    cfg: &PlanConfig,
    now: DateTime<Utc>,
) -> Option<WorkPlan> {
    match kind {
        CursorKind::Timestamp => {
            let start = match position {
                Some(CursorPosition::Timestamp(ts)) => *ts,
                _ => cfg.initial_sync_from,
            };

            let mut horizon = now - cfg.safety_lag;
            if let Some(CursorPosition::Timestamp(parent_ts)) = parent_position {
                horizon = horizon.min(*parent_ts);
            }

            let end = (start + cfg.window).min(horizon);
            if end <= start {
                return None;
            }

            Some(WorkPlan {
                query: PageQuery {
                    page: 1,
                    limit: cfg.page_size,
                    updated_from: Some(start),
                    updated_to: Some(end),
                },
                end_position: CursorPosition::Timestamp(end),
            })
        }
        CursorKind::Page => {
            let page = match position {
                Some(CursorPosition::Page(p)) => *p,
                _ => 1,
            };
            Some(WorkPlan {
                query: PageQuery {
                    page,
                    limit: cfg.page_size,
                    updated_from: None,
                    updated_to: None,
                },
                end_position: CursorPosition::Page(page + 1),
            })
        }
    }
}
