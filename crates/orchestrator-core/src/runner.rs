use crate::error::OrchestratorError;
use crate::execution::{ExecutionId, ExecutionStatus, GitSource};
use crate::log_event::RawLogLine;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a runner needs to launch one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub caller: String,
    pub command: String,
    pub image: Option<String>,
    pub env: BTreeMap<String, String>,
    pub git: Option<GitSource>,
}

impl TaskSpec {
    /// Shell script that runs the command, preceded by a shallow clone of
    /// the git source when one is given.
    pub fn script(&self) -> String {
        let Some(git) = &self.git else {
            return self.command.clone();
        };
        let path = git.checkout_path();
        let mut clone = String::from("git clone --depth 1");
        if let Some(git_ref) = git.git_ref.as_deref().filter(|r| !r.is_empty()) {
            clone.push_str(&format!(" --branch {}", shell_escape(git_ref)));
        }
        format!(
            "{} {} {} && cd {} && {}",
            clone,
            shell_escape(&git.repo),
            shell_escape(&path),
            shell_escape(&path),
            self.command
        )
    }
}

/// Single-quote `s` for POSIX sh.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Runner reply to a successful launch.
#[derive(Debug, Clone)]
pub struct StartedTask {
    pub execution_id: ExecutionId,
    pub started_at: Option<DateTime<Utc>>,
    pub log_stream_name: String,
    /// Image the runner actually used (request image or its default).
    pub image: Option<String>,
}

/// Live task state as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Succeeded {
        finished_at: Option<DateTime<Utc>>,
    },
    Failed {
        exit_code: Option<i32>,
        finished_at: Option<DateTime<Utc>>,
    },
    Stopped {
        exit_code: Option<i32>,
        finished_at: Option<DateTime<Utc>>,
    },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }

    pub fn status(&self) -> ExecutionStatus {
        match self {
            TaskState::Running => ExecutionStatus::Running,
            TaskState::Succeeded { .. } => ExecutionStatus::Succeeded,
            TaskState::Failed { .. } => ExecutionStatus::Failed,
            TaskState::Stopped { .. } => ExecutionStatus::Stopped,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            TaskState::Running => None,
            TaskState::Succeeded { .. } => Some(0),
            TaskState::Failed { exit_code, .. } | TaskState::Stopped { exit_code, .. } => {
                *exit_code
            }
        }
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TaskState::Running => None,
            TaskState::Succeeded { finished_at }
            | TaskState::Failed { finished_at, .. }
            | TaskState::Stopped { finished_at, .. } => *finished_at,
        }
    }

    /// Classify a finished process by its exit code alone. A signal exit
    /// (137, 143) is a failure here; only a runner that recorded a stop
    /// request may report `Stopped`, via [`TaskState::after_stop`].
    pub fn from_exit(exit_code: i32, finished_at: Option<DateTime<Utc>>) -> Self {
        match exit_code {
            0 => TaskState::Succeeded { finished_at },
            code => TaskState::Failed {
                exit_code: Some(code),
                finished_at,
            },
        }
    }

    /// Classify a finished process whose stop was requested. A clean exit
    /// still counts as success.
    pub fn after_stop(exit_code: Option<i32>, finished_at: Option<DateTime<Utc>>) -> Self {
        match exit_code {
            Some(0) => TaskState::Succeeded { finished_at },
            exit_code => TaskState::Stopped {
                exit_code,
                finished_at,
            },
        }
    }
}

/// Contract every compute backend implements.
///
/// Runners mint execution ids. `stop_task` must re-check the live task first:
/// a missing task is `TaskNotFound`, an already finished one is
/// `InvalidRequest`, and a task that is already stopping counts as success.
/// `fetch_logs` returns the complete line set, paginating and deduplicating
/// the platform's pages itself; it fails with `LogStreamNotFound` before the
/// task has produced a stream.
#[async_trait::async_trait]
pub trait TaskRunner: Send + Sync {
    /// Name of this runner instance (from config).
    fn name(&self) -> &str;

    async fn start_task(&self, spec: TaskSpec) -> Result<StartedTask, OrchestratorError>;

    async fn task_status(&self, execution_id: &ExecutionId) -> Result<TaskState, OrchestratorError>;

    async fn stop_task(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError>;

    async fn fetch_logs(&self, execution_id: &ExecutionId)
        -> Result<Vec<RawLogLine>, OrchestratorError>;

    /// Remove platform artifacts of a finished task (containers, temp files).
    async fn cleanup(&self, _execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
        Ok(())
    }
}

/// Named runners available to an orchestrator, plus the default for run
/// requests that name none.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: BTreeMap<String, Arc<dyn TaskRunner>>,
    default: Option<String>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(runner: Arc<dyn TaskRunner>) -> Self {
        let mut registry = Self::new();
        registry.register(runner);
        registry
    }

    /// Add a runner. The first one registered becomes the default.
    pub fn register(&mut self, runner: Arc<dyn TaskRunner>) {
        let name = runner.name().to_string();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.runners.insert(name, runner);
    }

    pub fn set_default(&mut self, name: &str) -> Result<(), OrchestratorError> {
        if !self.runners.contains_key(name) {
            return Err(OrchestratorError::RunnerNotFound(name.to_string()));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn TaskRunner>, OrchestratorError> {
        self.runners
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::RunnerNotFound(name.to_string()))
    }

    /// Runner by name, or the default when `name` is `None`.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn TaskRunner>, OrchestratorError> {
        match name.or(self.default.as_deref()) {
            Some(name) => self.get(name),
            None => Err(OrchestratorError::Config("no task runner configured".into())),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(|k| k.as_str())
    }
}
