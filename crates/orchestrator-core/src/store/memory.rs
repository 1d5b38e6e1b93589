use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};

use super::{
    collect_pages, order_key, plan_append, ExecutionStore, ListFilter, LogEventStore, OrderKey,
};
use crate::error::OrchestratorError;
use crate::execution::{Execution, ExecutionId};
use crate::log_event::{EventKey, LogEvent};

const DEFAULT_PAGE_SIZE: usize = 100;
const DEFAULT_BATCH_SIZE: usize = 25;

fn lock_err<E: std::fmt::Display>(e: E) -> OrchestratorError {
    OrchestratorError::StoreUnavailable(e.to_string())
}

#[derive(Default)]
struct Records {
    by_id: HashMap<ExecutionId, Execution>,
    by_start: BTreeSet<OrderKey>,
}

pub struct MemoryExecutionStore {
    records: RwLock<Records>,
    page_size: usize,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Cap on records examined per internal listing page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            records: RwLock::new(Records::default()),
            page_size: page_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create(&self, execution: &Execution) -> Result<(), OrchestratorError> {
        let mut records = self.records.write().map_err(lock_err)?;
        if records.by_id.contains_key(&execution.execution_id) {
            return Err(OrchestratorError::Conflict(format!(
                "execution {} already exists",
                execution.execution_id
            )));
        }
        records.by_start.insert(order_key(execution));
        records
            .by_id
            .insert(execution.execution_id.clone(), execution.clone());
        Ok(())
    }

    async fn get(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Option<Execution>, OrchestratorError> {
        let records = self.records.read().map_err(lock_err)?;
        Ok(records.by_id.get(execution_id).cloned())
    }

    async fn update(&self, execution: &Execution) -> Result<(), OrchestratorError> {
        let mut records = self.records.write().map_err(lock_err)?;
        let current = records
            .by_id
            .get_mut(&execution.execution_id)
            .ok_or_else(|| {
                OrchestratorError::ExecutionNotFound(execution.execution_id.to_string())
            })?;
        current.check_transition(execution)?;
        *current = execution.clone();
        Ok(())
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Execution>, OrchestratorError> {
        let records = self.records.read().map_err(lock_err)?;
        collect_pages(filter, |cursor: Option<&OrderKey>| {
            let lower = match cursor {
                Some(key) => Bound::Excluded(key.clone()),
                None => Bound::Unbounded,
            };
            let keys: Vec<&OrderKey> = records
                .by_start
                .range((lower, Bound::Unbounded))
                .take(self.page_size)
                .collect();
            let next = if keys.len() == self.page_size {
                keys.last().map(|k| (*k).clone())
            } else {
                None
            };
            let page = keys
                .into_iter()
                .filter_map(|(_, id)| records.by_id.get(id))
                .filter(|e| filter.matches(e))
                .cloned()
                .collect();
            Ok((page, next))
        })
    }

    async fn delete(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
        let mut records = self.records.write().map_err(lock_err)?;
        let removed = records
            .by_id
            .remove(execution_id)
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;
        records.by_start.remove(&order_key(&removed));
        Ok(())
    }
}

#[derive(Default)]
struct ExecutionLog {
    events: Vec<LogEvent>,
    keys: HashSet<EventKey>,
    expires_at: Option<DateTime<Utc>>,
}

impl ExecutionLog {
    fn max_index(&self) -> u64 {
        self.events.last().map(|e| e.index).unwrap_or(0)
    }
}

pub struct MemoryLogEventStore {
    logs: RwLock<HashMap<ExecutionId, ExecutionLog>>,
    batch_size: usize,
    grace: Duration,
}

impl MemoryLogEventStore {
    pub fn new() -> Self {
        Self::with_options(DEFAULT_BATCH_SIZE, Duration::seconds(60))
    }

    pub fn with_options(batch_size: usize, grace: Duration) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            batch_size: batch_size.max(1),
            grace,
        }
    }

    pub fn expires_at(&self, execution_id: &ExecutionId) -> Option<DateTime<Utc>> {
        self.logs
            .read()
            .ok()
            .and_then(|logs| logs.get(execution_id).and_then(|l| l.expires_at))
    }
}

impl Default for MemoryLogEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LogEventStore for MemoryLogEventStore {
    async fn append(
        &self,
        execution_id: &ExecutionId,
        events: &[LogEvent],
    ) -> Result<usize, OrchestratorError> {
        let mut stored = 0;
        for batch in events.chunks(self.batch_size) {
            let mut logs = self.logs.write().map_err(lock_err)?;
            let log = logs.entry(execution_id.clone()).or_default();
            let fresh = plan_append(execution_id, batch, log.max_index(), |e| {
                log.keys.contains(&e.key())
            })?;
            for event in fresh {
                log.keys.insert(event.key());
                log.events.push(event.clone());
                stored += 1;
            }
        }
        Ok(stored)
    }

    async fn list_all(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<LogEvent>, OrchestratorError> {
        let logs = self.logs.read().map_err(lock_err)?;
        Ok(logs
            .get(execution_id)
            .map(|l| l.events.clone())
            .unwrap_or_default())
    }

    async fn max_index(&self, execution_id: &ExecutionId) -> Result<u64, OrchestratorError> {
        let logs = self.logs.read().map_err(lock_err)?;
        Ok(logs.get(execution_id).map(|l| l.max_index()).unwrap_or(0))
    }

    async fn expire(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
        let mut logs = self.logs.write().map_err(lock_err)?;
        let log = logs.entry(execution_id.clone()).or_default();
        if log.expires_at.is_none() {
            log.expires_at = Some(Utc::now() + self.grace);
        }
        Ok(())
    }

    async fn purge_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionId>, OrchestratorError> {
        let mut logs = self.logs.write().map_err(lock_err)?;
        let expired: Vec<ExecutionId> = logs
            .iter()
            .filter(|(_, l)| l.expires_at.is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            logs.remove(id);
        }
        Ok(expired)
    }
}
