use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, TimeZone, Utc};
use orchestrator_core::config::RunnerConfig;
use orchestrator_core::error::OrchestratorError;
use orchestrator_core::execution::ExecutionId;
use orchestrator_core::log_event::RawLogLine;
use orchestrator_core::runner::{shell_escape, StartedTask, TaskRunner, TaskSpec, TaskState};
use tokio::process::Command;
use tracing::{debug, info, warn};

const DEFAULT_TASK_ROOT: &str = "/tmp/remoterun-tasks";

const PID_FILE: &str = "pid";
const EXIT_FILE: &str = "exit_code";
const STOPPED_FILE: &str = "stopped";
const LOG_FILE: &str = "output.log";

/// Local runner: runs each task as a detached process group on this host.
///
/// Per-task directory:
/// `task.sh` (the command), `run.sh` (wrapper), `pid` (process group id),
/// `output.log` with one `<epoch-ms> <line>` entry per output line,
/// `exit_code` once the command returned, `stopped` once a stop was requested.
pub struct LocalRunner {
    config: RunnerConfig,
}

impl LocalRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    fn task_root(&self) -> PathBuf {
        PathBuf::from(self.config.work_dir.as_deref().unwrap_or(DEFAULT_TASK_ROOT))
    }

    fn task_dir(&self, execution_id: &ExecutionId) -> PathBuf {
        self.task_root().join(execution_id.as_str())
    }

    /// Existing task directory, or `TaskNotFound`.
    fn existing_task_dir(&self, execution_id: &ExecutionId) -> Result<PathBuf, OrchestratorError> {
        let dir = self.task_dir(execution_id);
        if dir.join(PID_FILE).exists() {
            Ok(dir)
        } else {
            Err(OrchestratorError::TaskNotFound(execution_id.to_string()))
        }
    }

    async fn read_pgid(&self, dir: &Path) -> Result<u32, OrchestratorError> {
        let pid_str = tokio::fs::read_to_string(dir.join(PID_FILE)).await?;
        pid_str.trim().parse().map_err(|_| {
            OrchestratorError::Internal(format!("Invalid process group: '{}'", pid_str.trim()))
        })
    }

    /// True while any process of the task's group exists.
    async fn is_alive(&self, pgid: u32) -> bool {
        matches!(
            Command::new("kill")
                .args(["-0", "--", &format!("-{}", pgid)])
                .output()
                .await,
            Ok(o) if o.status.success()
        )
    }
}

/// Wrapper that timestamps every output line and records the exit code
/// after the last line has been written.
fn wrapper_script(dir: &Path) -> String {
    let path = |name: &str| shell_escape(&dir.join(name).to_string_lossy());
    format!(
        "( sh {task}; code=$?; echo \"$code $(date +%s)\" > {exit_tmp} ) 2>&1 | \
         while IFS= read -r line || [ -n \"$line\" ]; do \
         printf '%s000 %s\\n' \"$(date +%s)\" \"$line\"; \
         done >> {log}\n\
         mv {exit_tmp} {exit}\n",
        task = path("task.sh"),
        exit_tmp = path("exit_code.tmp"),
        log = path(LOG_FILE),
        exit = path(EXIT_FILE),
    )
}

/// Parse the `exit_code` file: `<code> <epoch-secs>`.
fn parse_exit_file(raw: &str) -> Option<(i32, Option<DateTime<Utc>>)> {
    let mut parts = raw.split_whitespace();
    let code = parts.next()?.parse().ok()?;
    let finished_at = parts
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    Some((code, finished_at))
}

/// Parse `output.log`. A line's identity is its line number, which is stable
/// because the file is append-only.
pub fn parse_output_log(contents: &str) -> Vec<RawLogLine> {
    contents
        .lines()
        .enumerate()
        .filter_map(|(n, line)| {
            let (stamp, message) = line.split_once(' ').unwrap_or((line, ""));
            let timestamp: i64 = stamp.parse().ok()?;
            Some(RawLogLine::new(timestamp, message).with_event_id((n + 1).to_string()))
        })
        .collect()
}

#[async_trait::async_trait]
impl TaskRunner for LocalRunner {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start_task(&self, spec: TaskSpec) -> Result<StartedTask, OrchestratorError> {
        let execution_id = ExecutionId::generate();
        let task_dir = self.task_dir(&execution_id);
        let workspace = task_dir.join("workspace");
        std::fs::create_dir_all(&workspace)?;

        std::fs::write(task_dir.join("task.sh"), spec.script())?;
        std::fs::write(task_dir.join("run.sh"), wrapper_script(&task_dir))?;

        // Request env wins over runner env
        let mut env = self.config.env.clone();
        env.extend(spec.env);

        // The launcher leads a new process group and exits at once; the
        // backgrounded wrapper stays in that group and is reaped by init.
        let launch = format!(
            "nohup sh {} > /dev/null 2>&1 &",
            shell_escape(&task_dir.join("run.sh").to_string_lossy())
        );
        debug!("Local exec: {}", launch);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&launch)
            .current_dir(&workspace)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| OrchestratorError::RunnerUnavailable(format!("Failed to spawn: {}", e)))?;

        let pgid = child
            .id()
            .ok_or_else(|| OrchestratorError::RunnerUnavailable("launcher exited early".into()))?;
        tokio::fs::write(task_dir.join(PID_FILE), pgid.to_string()).await?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| OrchestratorError::RunnerUnavailable(format!("Failed to spawn: {}", e)))?;
        if !output.status.success() {
            return Err(OrchestratorError::RunnerUnavailable(format!(
                "launcher failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!("Execution {} started locally in process group {}", execution_id, pgid);

        Ok(StartedTask {
            log_stream_name: task_dir.join(LOG_FILE).display().to_string(),
            execution_id,
            started_at: Some(Utc::now()),
            image: None,
        })
    }

    async fn task_status(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<TaskState, OrchestratorError> {
        let dir = self.existing_task_dir(execution_id)?;

        if let Ok(raw) = tokio::fs::read_to_string(dir.join(EXIT_FILE)).await {
            let (code, finished_at) = parse_exit_file(&raw).ok_or_else(|| {
                OrchestratorError::Internal(format!("Invalid exit file for {}", execution_id))
            })?;
            if dir.join(STOPPED_FILE).exists() {
                return Ok(TaskState::after_stop(Some(code), finished_at));
            }
            return Ok(TaskState::from_exit(code, finished_at));
        }

        let pgid = self.read_pgid(&dir).await?;
        if self.is_alive(pgid).await {
            return Ok(TaskState::Running);
        }

        // Gone without writing an exit code: stopped by us, or lost.
        if dir.join(STOPPED_FILE).exists() {
            Ok(TaskState::after_stop(None, None))
        } else {
            Ok(TaskState::Failed {
                exit_code: None,
                finished_at: None,
            })
        }
    }

    async fn stop_task(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
        let dir = self.existing_task_dir(execution_id)?;
        if dir.join(EXIT_FILE).exists() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "task {} already terminated",
                execution_id
            )));
        }

        let pgid = self.read_pgid(&dir).await?;
        let already_stopping = dir.join(STOPPED_FILE).exists();
        if !self.is_alive(pgid).await {
            return Err(OrchestratorError::InvalidRequest(format!(
                "task {} already terminated",
                execution_id
            )));
        }
        if already_stopping {
            return Ok(());
        }

        std::fs::write(dir.join(STOPPED_FILE), Utc::now().to_rfc3339())?;
        warn!("Stopping local execution {} (process group {})", execution_id, pgid);
        let output = Command::new("kill")
            .args(["-TERM", "--", &format!("-{}", pgid)])
            .output()
            .await
            .map_err(|e| OrchestratorError::RunnerUnavailable(format!("kill failed: {}", e)))?;
        if !output.status.success() {
            return Err(OrchestratorError::RunnerUnavailable(format!(
                "kill failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn fetch_logs(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<RawLogLine>, OrchestratorError> {
        let log_file = self.task_dir(execution_id).join(LOG_FILE);
        match tokio::fs::read_to_string(&log_file).await {
            Ok(contents) => Ok(parse_output_log(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(
                OrchestratorError::LogStreamNotFound(log_file.display().to_string()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn cleanup(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
        let task_dir = self.task_dir(execution_id);
        if task_dir.exists() {
            info!("Cleaning up local task dir: {}", task_dir.display());
            std::fs::remove_dir_all(task_dir)?;
        }
        Ok(())
    }
}
