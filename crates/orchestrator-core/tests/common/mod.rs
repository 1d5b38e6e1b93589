#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use orchestrator_core::execution::{Execution, ExecutionId, ExecutionStatus};
use orchestrator_core::log_event::RawLogLine;
use orchestrator_core::runner::{RunnerRegistry, StartedTask, TaskRunner, TaskSpec, TaskState};
use orchestrator_core::service::{Orchestrator, OrchestratorOptions};
use orchestrator_core::store::memory::{MemoryExecutionStore, MemoryLogEventStore};
use orchestrator_core::store::{ExecutionStore, ListFilter, LogEventStore};
use orchestrator_core::OrchestratorError;

/// Scripted runner that records how often each operation was called.
pub struct FakeRunner {
    name: String,
    next_ids: Mutex<VecDeque<String>>,
    start_failure: Mutex<Option<String>>,
    states: Mutex<HashMap<ExecutionId, TaskState>>,
    logs: Mutex<HashMap<ExecutionId, Vec<RawLogLine>>>,
    pub start_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub last_spec: Mutex<Option<TaskSpec>>,
}

impl FakeRunner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            next_ids: Mutex::new(VecDeque::new()),
            start_failure: Mutex::new(None),
            states: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            start_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            last_spec: Mutex::new(None),
        }
    }

    pub fn queue_id(&self, id: &str) {
        self.next_ids.lock().unwrap().push_back(id.to_string());
    }

    pub fn fail_next_start(&self, message: &str) {
        *self.start_failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_state(&self, id: &str, state: TaskState) {
        self.states
            .lock()
            .unwrap()
            .insert(ExecutionId::from(id), state);
    }

    pub fn set_logs(&self, id: &str, lines: Vec<RawLogLine>) {
        self.logs.lock().unwrap().insert(ExecutionId::from(id), lines);
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TaskRunner for FakeRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start_task(&self, spec: TaskSpec) -> Result<StartedTask, OrchestratorError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.start_failure.lock().unwrap().take() {
            return Err(OrchestratorError::RunnerUnavailable(message));
        }
        let id = self
            .next_ids
            .lock()
            .unwrap()
            .pop_front()
            .map(ExecutionId::from_string)
            .unwrap_or_else(ExecutionId::generate);
        self.states
            .lock()
            .unwrap()
            .insert(id.clone(), TaskState::Running);
        *self.last_spec.lock().unwrap() = Some(spec);
        Ok(StartedTask {
            log_stream_name: format!("fake/{}", id),
            execution_id: id,
            started_at: None,
            image: Some("fake:latest".into()),
        })
    }

    async fn task_status(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<TaskState, OrchestratorError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.states
            .lock()
            .unwrap()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::TaskNotFound(execution_id.to_string()))
    }

    async fn stop_task(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut states = self.states.lock().unwrap();
        let state = states
            .get_mut(execution_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(execution_id.to_string()))?;
        if state.is_terminal() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "task {} already terminated",
                execution_id
            )));
        }
        *state = TaskState::Stopped {
            exit_code: Some(143),
            finished_at: None,
        };
        Ok(())
    }

    async fn fetch_logs(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<RawLogLine>, OrchestratorError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.logs
            .lock()
            .unwrap()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::LogStreamNotFound(format!("fake/{}", execution_id)))
    }
}

/// Execution store whose writes always fail, for degraded-tracking paths.
pub struct UnavailableStore;

#[async_trait::async_trait]
impl ExecutionStore for UnavailableStore {
    async fn create(&self, _execution: &Execution) -> Result<(), OrchestratorError> {
        Err(OrchestratorError::StoreUnavailable("store offline".into()))
    }

    async fn get(&self, _id: &ExecutionId) -> Result<Option<Execution>, OrchestratorError> {
        Err(OrchestratorError::StoreUnavailable("store offline".into()))
    }

    async fn update(&self, _execution: &Execution) -> Result<(), OrchestratorError> {
        Err(OrchestratorError::StoreUnavailable("store offline".into()))
    }

    async fn list(&self, _filter: &ListFilter) -> Result<Vec<Execution>, OrchestratorError> {
        Err(OrchestratorError::StoreUnavailable("store offline".into()))
    }

    async fn delete(&self, _id: &ExecutionId) -> Result<(), OrchestratorError> {
        Err(OrchestratorError::StoreUnavailable("store offline".into()))
    }
}

pub struct Harness {
    pub runner: Arc<FakeRunner>,
    pub executions: Arc<MemoryExecutionStore>,
    pub logs: Arc<MemoryLogEventStore>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn harness() -> Harness {
    harness_with_options(OrchestratorOptions::default())
}

pub fn harness_with_options(options: OrchestratorOptions) -> Harness {
    let runner = Arc::new(FakeRunner::new("fake"));
    let executions = Arc::new(MemoryExecutionStore::with_page_size(2));
    let logs = Arc::new(MemoryLogEventStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        executions.clone(),
        logs.clone(),
        RunnerRegistry::single(runner.clone()),
        options,
    ));
    Harness {
        runner,
        executions,
        logs,
        orchestrator,
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn execution(id: &str, started_at: DateTime<Utc>) -> Execution {
    Execution::new_running(
        ExecutionId::from(id),
        "fake".into(),
        "tester".into(),
        format!("echo {}", id),
        started_at,
        format!("fake/{}", id),
    )
}

pub fn finished(id: &str, started_at: DateTime<Utc>, status: ExecutionStatus) -> Execution {
    let mut exec = execution(id, started_at);
    let exit = match status {
        ExecutionStatus::Succeeded => Some(0),
        ExecutionStatus::Failed => Some(1),
        _ => None,
    };
    exec.mark_finished(status, exit, started_at + chrono::Duration::seconds(5))
        .unwrap();
    exec
}

pub async fn seed(store: &dyn ExecutionStore, executions: &[Execution]) {
    for exec in executions {
        store.create(exec).await.unwrap();
    }
}

pub async fn stored_ids(store: &dyn LogEventStore, id: &str) -> Vec<u64> {
    store
        .list_all(&ExecutionId::from(id))
        .await
        .unwrap()
        .iter()
        .map(|e| e.index)
        .collect()
}
