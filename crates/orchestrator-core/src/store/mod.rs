pub mod fs;
pub mod memory;

use crate::error::OrchestratorError;
use crate::execution::{Execution, ExecutionId, ExecutionStatus};
use crate::log_event::LogEvent;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;

pub use fs::{FsExecutionStore, FsLogEventStore};
pub use memory::{MemoryExecutionStore, MemoryLogEventStore};

/// Listing refinements, resolved by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// 0 means unbounded.
    pub limit: usize,
    /// Empty means every status.
    pub statuses: Vec<ExecutionStatus>,
}

impl ListFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<ExecutionStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    pub fn matches(&self, execution: &Execution) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&execution.status)
    }

    fn is_full(&self, collected: usize) -> bool {
        self.limit > 0 && collected >= self.limit
    }
}

/// Position of a record in newest-first listing order.
pub type OrderKey = (Reverse<DateTime<Utc>>, ExecutionId);

pub fn order_key(execution: &Execution) -> OrderKey {
    (Reverse(execution.started_at), execution.execution_id.clone())
}

/// Durable execution records.
#[async_trait::async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new record. `Conflict` if the id already exists.
    async fn create(&self, execution: &Execution) -> Result<(), OrchestratorError>;

    /// `Ok(None)` when no record exists.
    async fn get(&self, execution_id: &ExecutionId)
        -> Result<Option<Execution>, OrchestratorError>;

    /// Conditional replace: `ExecutionNotFound` when absent, `InvalidRequest`
    /// when it would move a terminal record.
    async fn update(&self, execution: &Execution) -> Result<(), OrchestratorError>;

    /// Newest `started_at` first, bounded by `filter.limit`.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Execution>, OrchestratorError>;

    async fn delete(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError>;
}

/// Per-execution ordered log lines.
#[async_trait::async_trait]
pub trait LogEventStore: Send + Sync {
    /// Store events, skipping any whose identity is already stored.
    /// New events must continue the index sequence without gaps; an index
    /// already held by a different event is a `Conflict`.
    /// Returns how many events were newly stored.
    async fn append(
        &self,
        execution_id: &ExecutionId,
        events: &[LogEvent],
    ) -> Result<usize, OrchestratorError>;

    /// All events in index order.
    async fn list_all(&self, execution_id: &ExecutionId)
        -> Result<Vec<LogEvent>, OrchestratorError>;

    /// Highest assigned index, 0 when none.
    async fn max_index(&self, execution_id: &ExecutionId) -> Result<u64, OrchestratorError>;

    /// Schedule removal once the grace window elapses.
    async fn expire(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError>;

    /// Drop logs whose grace window ended at or before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>)
        -> Result<Vec<ExecutionId>, OrchestratorError>;
}

/// Drive a paged scan until the filter's limit is met or pages run out.
/// `fetch_page` receives the cursor returned with the previous page and
/// returns the matching records of the next page plus the cursor to resume
/// from, `None` once the scan is exhausted.
pub(crate) fn collect_pages<C, F>(
    filter: &ListFilter,
    mut fetch_page: F,
) -> Result<Vec<Execution>, OrchestratorError>
where
    F: FnMut(Option<&C>) -> Result<(Vec<Execution>, Option<C>), OrchestratorError>,
{
    let mut out = Vec::new();
    let mut cursor: Option<C> = None;
    loop {
        let (page, next) = fetch_page(cursor.as_ref())?;
        for execution in page {
            if filter.is_full(out.len()) {
                return Ok(out);
            }
            out.push(execution);
        }
        match next {
            Some(key) if !filter.is_full(out.len()) => cursor = Some(key),
            _ => return Ok(out),
        }
    }
}

/// Validation shared by log store backends. Returns the events that are new,
/// in index order, or a `Conflict` when an index collides or skips ahead.
pub(crate) fn plan_append<'a>(
    execution_id: &ExecutionId,
    events: &'a [LogEvent],
    current_max: u64,
    is_known: impl Fn(&LogEvent) -> bool,
) -> Result<Vec<&'a LogEvent>, OrchestratorError> {
    let mut fresh: Vec<&LogEvent> = Vec::new();
    let mut batch_keys = std::collections::HashSet::new();
    for event in events {
        if event.execution_id != *execution_id {
            return Err(OrchestratorError::InvalidRequest(format!(
                "log event for {} appended to {}",
                event.execution_id, execution_id
            )));
        }
        if is_known(event) || !batch_keys.insert(event.key()) {
            continue;
        }
        fresh.push(event);
    }
    fresh.sort_by_key(|e| e.index);
    let mut expected = current_max + 1;
    for event in &fresh {
        if event.index != expected {
            return Err(OrchestratorError::Conflict(format!(
                "log index {} for execution {} (next free index is {})",
                event.index, execution_id, expected
            )));
        }
        expected += 1;
    }
    Ok(fresh)
}
