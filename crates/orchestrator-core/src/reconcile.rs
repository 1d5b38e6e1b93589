use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::OrchestratorError;
use crate::execution::{ExecutionId, ExecutionStatus};
use crate::runner::TaskState;
use crate::service::Orchestrator;
use crate::store::ListFilter;
use crate::telemetry::{RequestContext, Warning, WarningCode};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncReport {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    /// True when this sync recorded the terminal state.
    pub transitioned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<Warning>,
}

/// Records completion of executions. Nothing else writes terminal state, not
/// even a kill: the reconciler polls the owning runner and, once the task
/// has finished, captures its logs a final time and updates the record.
pub struct CompletionReconciler {
    orchestrator: Arc<Orchestrator>,
}

impl CompletionReconciler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Poll the runner for one execution and record completion if the task
    /// has finished. A runner that no longer knows the task finishes the
    /// execution as FAILED without an exit code.
    #[instrument(
        name = "sync_execution",
        skip_all,
        fields(request_id = %ctx.request_id, execution_id = %execution_id)
    )]
    pub async fn sync(
        &self,
        ctx: &RequestContext,
        execution_id: &ExecutionId,
    ) -> Result<SyncReport, OrchestratorError> {
        let execution = self.orchestrator.load(execution_id).await?;
        if execution.is_terminal() {
            return Ok(SyncReport {
                execution_id: execution.execution_id,
                status: execution.status,
                transitioned: false,
                exit_code: execution.exit_code,
                warnings: Vec::new(),
            });
        }

        let runner = self.orchestrator.runner_for(&execution)?;
        let state = match runner.task_status(execution_id).await {
            Ok(state) => state,
            Err(OrchestratorError::TaskNotFound(task)) => {
                warn!(task = %task, "runner lost track of a running execution");
                TaskState::Failed {
                    exit_code: None,
                    finished_at: None,
                }
            }
            Err(e) => return Err(e),
        };
        if !state.is_terminal() {
            return Ok(SyncReport {
                execution_id: execution.execution_id,
                status: ExecutionStatus::Running,
                transitioned: false,
                exit_code: None,
                warnings: Vec::new(),
            });
        }

        let mut warnings = Vec::new();
        if let Err(e) = self.orchestrator.merge_logs(&execution).await {
            warn!(error = %e, "final log capture failed");
            warnings.push(Warning::new(
                WarningCode::LogCaptureFailed,
                format!("final logs for {} were not captured: {}", execution_id, e),
            ));
        }

        let mut finished = execution;
        finished.mark_finished(
            state.status(),
            state.exit_code(),
            state.finished_at().unwrap_or_else(Utc::now),
        )?;
        finished.modified_by_request_id = Some(ctx.request_id.clone());
        self.orchestrator.executions().update(&finished).await?;
        info!(
            status = %finished.status,
            exit_code = ?finished.exit_code,
            duration_seconds = ?finished.duration_seconds,
            "execution finished"
        );

        Ok(SyncReport {
            execution_id: finished.execution_id,
            status: finished.status,
            transitioned: true,
            exit_code: finished.exit_code,
            warnings,
        })
    }

    /// Sync every execution currently recorded as RUNNING. A failure on one
    /// execution is logged and does not stop the others.
    pub async fn sync_running(
        &self,
        ctx: &RequestContext,
    ) -> Result<Vec<SyncReport>, OrchestratorError> {
        let running = self
            .orchestrator
            .executions()
            .list(&ListFilter::all().with_statuses(vec![ExecutionStatus::Running]))
            .await?;
        let mut reports = Vec::with_capacity(running.len());
        for execution in running {
            match self.sync(ctx, &execution.execution_id).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(execution_id = %execution.execution_id, error = %e, "sync failed")
                }
            }
        }
        Ok(reports)
    }
}
