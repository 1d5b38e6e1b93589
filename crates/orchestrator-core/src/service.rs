use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{ErrorKind, OrchestratorError};
use crate::execution::{Execution, ExecutionId, ExecutionStatus, RunRequest};
use crate::log_event::LogEvent;
use crate::merge::index_new_lines;
use crate::runner::{RunnerRegistry, TaskRunner, TaskSpec};
use crate::secrets::SecretClassifier;
use crate::store::{ExecutionStore, ListFilter, LogEventStore};
use crate::telemetry::{RequestContext, Warning, WarningCode};

#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    /// Base of the push channel offered to log clients of running executions.
    /// `{execution_id}` is substituted when present, otherwise the id is
    /// appended as a query parameter.
    pub log_push_endpoint: Option<String>,
    pub classifier: SecretClassifier,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunResponse {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogsResponse {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub events: Vec<LogEvent>,
    pub last_index: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_channel: Option<String>,
}

impl LogsResponse {
    /// Events after `index`, for clients resuming from a cached position.
    pub fn events_after(&self, index: u64) -> &[LogEvent] {
        let start = self.events.partition_point(|e| e.index <= index);
        &self.events[start..]
    }
}

/// One async mutex per execution id, so merges of the same execution run one
/// at a time while different executions proceed in parallel.
#[derive(Default)]
struct MergeLocks {
    locks: Mutex<HashMap<ExecutionId, Weak<tokio::sync::Mutex<()>>>>,
}

impl MergeLocks {
    fn acquire(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Arc<tokio::sync::Mutex<()>>, OrchestratorError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        locks.retain(|_, weak| weak.strong_count() > 0);
        if let Some(lock) = locks.get(execution_id).and_then(Weak::upgrade) {
            return Ok(lock);
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(execution_id.clone(), Arc::downgrade(&lock));
        Ok(lock)
    }
}

/// Run, status, list, kill and logs over the two stores and the configured
/// runners. Holds no execution state of its own.
pub struct Orchestrator {
    executions: Arc<dyn ExecutionStore>,
    logs: Arc<dyn LogEventStore>,
    runners: RunnerRegistry,
    options: OrchestratorOptions,
    merge_locks: MergeLocks,
}

fn require_id(execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
    if execution_id.is_empty() {
        return Err(OrchestratorError::InvalidRequest(
            "execution id is required".into(),
        ));
    }
    Ok(())
}

impl Orchestrator {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        logs: Arc<dyn LogEventStore>,
        runners: RunnerRegistry,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            executions,
            logs,
            runners,
            options,
            merge_locks: MergeLocks::default(),
        }
    }

    pub fn executions(&self) -> &Arc<dyn ExecutionStore> {
        &self.executions
    }

    pub fn log_store(&self) -> &Arc<dyn LogEventStore> {
        &self.logs
    }

    pub fn runners(&self) -> &RunnerRegistry {
        &self.runners
    }

    /// Launch a command and start tracking it.
    ///
    /// Once the runner has started the task, only a duplicate-id conflict is
    /// reported as an error. Any other failure to persist the record comes
    /// back as a `DegradedTracking` warning on a successful response.
    #[instrument(
        name = "run_command",
        skip_all,
        fields(request_id = %ctx.request_id, caller = %ctx.caller)
    )]
    pub async fn run_command(
        &self,
        ctx: &RequestContext,
        request: RunRequest,
    ) -> Result<RunResponse, OrchestratorError> {
        if request.command.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "command is required".into(),
            ));
        }
        let runner = self.runners.resolve(request.runner.as_deref())?;

        let secret_names = self.options.classifier.classify(request.env.keys());
        info!(
            runner = runner.name(),
            command = %request.command,
            image = ?request.image,
            env = ?self.options.classifier.redact_env(&request.env),
            secrets = secret_names.len(),
            "starting task"
        );

        let started = runner
            .start_task(TaskSpec {
                caller: ctx.caller.clone(),
                command: request.command.clone(),
                image: request.image.clone(),
                env: request.env.clone(),
                git: request.git.clone(),
            })
            .await?;

        let mut execution = Execution::new_running(
            started.execution_id.clone(),
            runner.name().to_string(),
            ctx.caller.clone(),
            request.command,
            started.started_at.unwrap_or_else(Utc::now),
            started.log_stream_name,
        );
        execution.image_id = started.image.or(request.image);
        execution.git = request.git;
        execution.lock = request.lock;
        execution.created_by_request_id = Some(ctx.request_id.clone());
        execution.modified_by_request_id = Some(ctx.request_id.clone());

        let mut warnings = Vec::new();
        match self.executions.create(&execution).await {
            Ok(()) => {
                info!(execution_id = %execution.execution_id, "execution recorded");
            }
            Err(e) if e.kind() == ErrorKind::Conflict => return Err(e),
            Err(e) => {
                warn!(
                    execution_id = %execution.execution_id,
                    error = %e,
                    "task started but execution record was not written"
                );
                warnings.push(Warning::new(
                    WarningCode::DegradedTracking,
                    format!(
                        "execution {} is running but could not be recorded: {}",
                        execution.execution_id, e
                    ),
                ));
            }
        }

        Ok(RunResponse {
            execution_id: execution.execution_id,
            status: ExecutionStatus::Running,
            warnings,
        })
    }

    /// Persisted snapshot; never polls the runner.
    #[instrument(
        name = "get_execution_status",
        skip_all,
        fields(request_id = %ctx.request_id, caller = %ctx.caller)
    )]
    pub async fn get_execution_status(
        &self,
        ctx: &RequestContext,
        execution_id: &ExecutionId,
    ) -> Result<Execution, OrchestratorError> {
        let mut execution = self.load(execution_id).await?;
        execution.exit_code = execution.visible_exit_code();
        Ok(execution)
    }

    #[instrument(
        name = "list_executions",
        skip_all,
        fields(request_id = %ctx.request_id, caller = %ctx.caller)
    )]
    pub async fn list_executions(
        &self,
        ctx: &RequestContext,
        filter: &ListFilter,
    ) -> Result<Vec<Execution>, OrchestratorError> {
        let mut executions = self.executions.list(filter).await?;
        for execution in &mut executions {
            execution.exit_code = execution.visible_exit_code();
        }
        debug!(count = executions.len(), "listed executions");
        Ok(executions)
    }

    /// Ask the owning runner to stop a running task. The terminal state is
    /// recorded later, once the runner reports the task as finished.
    #[instrument(
        name = "kill_execution",
        skip_all,
        fields(request_id = %ctx.request_id, caller = %ctx.caller)
    )]
    pub async fn kill_execution(
        &self,
        ctx: &RequestContext,
        execution_id: &ExecutionId,
    ) -> Result<(), OrchestratorError> {
        let execution = self.load(execution_id).await?;
        if execution.is_terminal() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "execution {} already terminated ({})",
                execution_id, execution.status
            )));
        }
        let runner = self.runner_for(&execution)?;
        runner.stop_task(execution_id).await?;
        info!(execution_id = %execution_id, runner = runner.name(), "stop requested");
        Ok(())
    }

    #[instrument(
        name = "get_logs",
        skip_all,
        fields(request_id = %ctx.request_id, caller = %ctx.caller)
    )]
    pub async fn get_logs(
        &self,
        ctx: &RequestContext,
        execution_id: &ExecutionId,
    ) -> Result<LogsResponse, OrchestratorError> {
        let execution = self.load(execution_id).await?;
        if execution.is_terminal() {
            let events = self.logs.list_all(execution_id).await?;
            let last_index = events.last().map(|e| e.index).unwrap_or(0);
            return Ok(LogsResponse {
                execution_id: execution.execution_id,
                status: execution.status,
                events,
                last_index,
                live_channel: None,
            });
        }

        let events = self.merge_logs(&execution).await?;
        let last_index = events.last().map(|e| e.index).unwrap_or(0);
        Ok(LogsResponse {
            live_channel: self.live_channel(execution_id),
            execution_id: execution.execution_id,
            status: execution.status,
            events,
            last_index,
        })
    }

    /// Remove a finished execution: runner artifacts (best effort), the
    /// record, and its logs after the store's grace window.
    #[instrument(
        name = "cleanup_execution",
        skip_all,
        fields(request_id = %ctx.request_id, caller = %ctx.caller)
    )]
    pub async fn cleanup_execution(
        &self,
        ctx: &RequestContext,
        execution_id: &ExecutionId,
    ) -> Result<Vec<Warning>, OrchestratorError> {
        let execution = self.load(execution_id).await?;
        if !execution.is_terminal() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "execution {} is still running",
                execution_id
            )));
        }

        let mut warnings = Vec::new();
        let cleaned = match self.runner_for(&execution) {
            Ok(runner) => runner.cleanup(execution_id).await,
            Err(e) => Err(e),
        };
        if let Err(e) = cleaned {
            warn!(execution_id = %execution_id, error = %e, "runner cleanup failed");
            warnings.push(Warning::new(
                WarningCode::CleanupFailed,
                format!("runner artifacts for {} were not removed: {}", execution_id, e),
            ));
        }

        self.executions.delete(execution_id).await?;
        self.logs.expire(execution_id).await?;
        info!(execution_id = %execution_id, "execution cleaned up");
        Ok(warnings)
    }

    /// Purge logs whose expiry grace window has elapsed.
    pub async fn prune_expired_logs(&self) -> Result<Vec<ExecutionId>, OrchestratorError> {
        let purged = self.logs.purge_expired(Utc::now()).await?;
        if !purged.is_empty() {
            info!(count = purged.len(), "purged expired logs");
        }
        Ok(purged)
    }

    /// Fetch the runner's full line set, store lines not seen before with
    /// indices continuing from the stored maximum, and return everything
    /// stored for the execution in index order.
    pub(crate) async fn merge_logs(
        &self,
        execution: &Execution,
    ) -> Result<Vec<LogEvent>, OrchestratorError> {
        let execution_id = &execution.execution_id;
        let lock = self.merge_locks.acquire(execution_id)?;
        let _guard = lock.lock().await;

        let max_index = self.logs.max_index(execution_id).await?;
        let mut stored = self.logs.list_all(execution_id).await?;

        let runner = self.runner_for(execution)?;
        let raw = match runner.fetch_logs(execution_id).await {
            Ok(lines) => lines,
            Err(OrchestratorError::LogStreamNotFound(stream)) => {
                debug!(
                    execution_id = %execution_id,
                    stream = %stream,
                    "log stream not created yet"
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let fresh = index_new_lines(execution_id, &stored, max_index, raw);
        if !fresh.is_empty() {
            let appended = self.logs.append(execution_id, &fresh).await?;
            debug!(
                execution_id = %execution_id,
                appended,
                last_index = max_index + fresh.len() as u64,
                "merged log lines"
            );
            stored.extend(fresh);
        }
        Ok(stored)
    }

    fn live_channel(&self, execution_id: &ExecutionId) -> Option<String> {
        let endpoint = self.options.log_push_endpoint.as_deref()?;
        if endpoint.contains("{execution_id}") {
            Some(endpoint.replace("{execution_id}", execution_id.as_str()))
        } else {
            let sep = if endpoint.contains('?') { '&' } else { '?' };
            Some(format!("{}{}execution_id={}", endpoint, sep, execution_id))
        }
    }

    pub(crate) async fn load(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Execution, OrchestratorError> {
        require_id(execution_id)?;
        self.executions
            .get(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))
    }

    pub(crate) fn runner_for(
        &self,
        execution: &Execution,
    ) -> Result<Arc<dyn TaskRunner>, OrchestratorError> {
        self.runners.get(&execution.runner)
    }
}
