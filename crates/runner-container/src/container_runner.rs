use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Output;

use chrono::{DateTime, Datelike, Utc};
use orchestrator_core::config::{ContainerRuntime, RunnerConfig};
use orchestrator_core::error::OrchestratorError;
use orchestrator_core::execution::ExecutionId;
use orchestrator_core::log_event::RawLogLine;
use orchestrator_core::runner::{StartedTask, TaskRunner, TaskSpec, TaskState};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

const DEFAULT_STATE_ROOT: &str = "/tmp/remoterun-containers";

/// Container runner: each task is a detached Docker/Podman container.
///
/// The runtime does not record who stopped a container, so `stop_task`
/// leaves a `<container>.stopped` marker under the runner's state directory
/// (`work_dir`, else `/tmp/remoterun-containers`).
pub struct ContainerRunner {
    config: RunnerConfig,
}

/// Subset of `inspect --format '{{json .State}}'`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    status: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    finished_at: Option<String>,
    #[serde(default, rename = "OOMKilled")]
    oom_killed: bool,
}

impl ContainerState {
    /// Map the runtime state to a task state. Exits count as stops only when
    /// a stop was requested, and never when the kernel killed the container
    /// for running out of memory.
    fn task_state(&self, stop_requested: bool) -> TaskState {
        match self.status.as_str() {
            "exited" | "dead" => {
                let finished_at = self.finished_at.as_deref().and_then(parse_time);
                if stop_requested && !self.oom_killed {
                    TaskState::after_stop(Some(self.exit_code), finished_at)
                } else {
                    TaskState::from_exit(self.exit_code, finished_at)
                }
            }
            // created, running, paused, restarting, removing
            _ => TaskState::Running,
        }
    }
}

impl ContainerRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Get the container runtime command ("docker" or "podman").
    fn runtime_cmd(&self) -> &'static str {
        match self.config.runtime() {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }

    /// Container name for a given execution.
    pub fn container_name(&self, execution_id: &ExecutionId) -> String {
        format!("{}-{}", self.config.name_prefix(), execution_id)
    }

    fn stop_marker(&self, execution_id: &ExecutionId) -> PathBuf {
        PathBuf::from(self.config.work_dir.as_deref().unwrap_or(DEFAULT_STATE_ROOT))
            .join(format!("{}.stopped", self.container_name(execution_id)))
    }

    fn record_stop(&self, execution_id: &ExecutionId) -> Result<PathBuf, OrchestratorError> {
        let marker = self.stop_marker(execution_id);
        if let Some(dir) = marker.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&marker, Utc::now().to_rfc3339())?;
        Ok(marker)
    }

    fn stop_requested(&self, execution_id: &ExecutionId) -> bool {
        self.stop_marker(execution_id).exists()
    }

    fn clear_stop(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
        match std::fs::remove_file(self.stop_marker(execution_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Request image, else the runner's default.
    fn image_for<'a>(&'a self, spec: &'a TaskSpec) -> Result<&'a str, OrchestratorError> {
        spec.image
            .as_deref()
            .or(self.config.default_image.as_deref())
            .ok_or_else(|| {
                OrchestratorError::Config(format!(
                    "runner '{}' has no default_image and the request named none",
                    self.config.name
                ))
            })
    }

    /// Arguments for `run` that launch the task detached.
    pub fn run_args(
        &self,
        execution_id: &ExecutionId,
        spec: &TaskSpec,
    ) -> Result<Vec<String>, OrchestratorError> {
        let image = self.image_for(spec)?;
        let mut args: Vec<String> = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name(execution_id),
            "--label".to_string(),
            format!("remoterun.execution_id={}", execution_id),
            "--label".to_string(),
            format!("remoterun.caller={}", spec.caller),
        ];

        // Request env wins over runner env
        let mut env = self.config.env.clone();
        env.extend(spec.env.clone());
        for (key, val) in &env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, val));
        }

        args.push(image.to_string());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(spec.script());
        Ok(args)
    }

    /// Run a container runtime command and return its output.
    /// A missing container comes back as `TaskNotFound`.
    async fn run_output(&self, args: &[&str]) -> Result<Output, OrchestratorError> {
        let runtime = self.runtime_cmd();
        debug!("Running: {} {}", runtime, args.first().unwrap_or(&""));

        let output = Command::new(runtime).args(args).output().await.map_err(|e| {
            OrchestratorError::RunnerUnavailable(format!("Failed to run {}: {}", runtime, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_container(&stderr) {
                return Err(OrchestratorError::TaskNotFound(
                    args.last().unwrap_or(&"").to_string(),
                ));
            }
            return Err(OrchestratorError::RunnerUnavailable(format!(
                "{} {} failed: {}",
                runtime,
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn run_cmd(&self, args: &[&str]) -> Result<String, OrchestratorError> {
        let output = self.run_output(args).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn inspect(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<ContainerState, OrchestratorError> {
        let name = self.container_name(execution_id);
        let raw = self
            .run_cmd(&["inspect", "--format", "{{json .State}}", &name])
            .await
            .map_err(|e| match e {
                OrchestratorError::TaskNotFound(_) => {
                    OrchestratorError::TaskNotFound(execution_id.to_string())
                }
                other => other,
            })?;
        serde_json::from_str(&raw).map_err(|e| {
            OrchestratorError::RunnerUnavailable(format!(
                "unexpected inspect output for {}: {}",
                name, e
            ))
        })
    }
}

#[async_trait::async_trait]
impl TaskRunner for ContainerRunner {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start_task(&self, spec: TaskSpec) -> Result<StartedTask, OrchestratorError> {
        let execution_id = ExecutionId::generate();
        let args = self.run_args(&execution_id, &spec)?;
        let image = self.image_for(&spec)?.to_string();

        let args_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let container_id = self.run_cmd(&args_refs).await?;
        let name = self.container_name(&execution_id);
        info!(
            "Execution {} started in container {} ({})",
            execution_id,
            name,
            container_id.get(..12).unwrap_or(&container_id)
        );

        // The container exists now; a failed inspect only loses the start time.
        let started_at = match self.inspect(&execution_id).await {
            Ok(state) => state.started_at.as_deref().and_then(parse_time),
            Err(e) => {
                warn!("Could not read start time of {}: {}", name, e);
                None
            }
        };

        Ok(StartedTask {
            execution_id,
            started_at,
            log_stream_name: format!("{}/{}", self.runtime_cmd(), name),
            image: Some(image),
        })
    }

    async fn task_status(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<TaskState, OrchestratorError> {
        let state = self.inspect(execution_id).await?;
        Ok(state.task_state(self.stop_requested(execution_id)))
    }

    async fn stop_task(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
        let state = self.inspect(execution_id).await?;
        match state.status.as_str() {
            "exited" | "dead" => {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "task {} already terminated",
                    execution_id
                )))
            }
            "removing" | "stopping" => return Ok(()),
            _ => {}
        }
        let name = self.container_name(execution_id);
        warn!("Stopping container {} for execution {}", name, execution_id);
        let marker = self.record_stop(execution_id)?;
        if let Err(e) = self.run_cmd(&["stop", &name]).await {
            let _ = std::fs::remove_file(&marker);
            return Err(e);
        }
        Ok(())
    }

    async fn fetch_logs(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<RawLogLine>, OrchestratorError> {
        let name = self.container_name(execution_id);
        let output = self
            .run_output(&["logs", "--timestamps", &name])
            .await
            .map_err(|e| match e {
                OrchestratorError::TaskNotFound(_) => OrchestratorError::LogStreamNotFound(
                    format!("{}/{}", self.runtime_cmd(), name),
                ),
                other => other,
            })?;
        let mut lines = parse_logs("stdout", &String::from_utf8_lossy(&output.stdout));
        lines.extend(parse_logs("stderr", &String::from_utf8_lossy(&output.stderr)));
        Ok(lines)
    }

    async fn cleanup(&self, execution_id: &ExecutionId) -> Result<(), OrchestratorError> {
        let name = self.container_name(execution_id);
        info!("Removing container {} for execution {}", name, execution_id);
        match self.run_cmd(&["rm", "-f", &name]).await {
            Ok(_) | Err(OrchestratorError::TaskNotFound(_)) => self.clear_stop(execution_id),
            Err(e) => Err(e),
        }
    }
}

fn is_missing_container(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Runtimes report an unset time as the zero value (year 1).
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.year() > 1)
}

/// Parse `logs --timestamps` output from one stream. Each line's identity is
/// its stream, nanosecond timestamp and ordinal among lines sharing that
/// timestamp, which stays stable across repeated fetches.
pub fn parse_logs(stream: &str, output: &str) -> Vec<RawLogLine> {
    let mut seen: HashMap<i64, u32> = HashMap::new();
    output
        .lines()
        .filter_map(|line| {
            let (stamp, message) = line.split_once(' ').unwrap_or((line, ""));
            let at = DateTime::parse_from_rfc3339(stamp).ok()?;
            let nanos = at.timestamp_nanos_opt()?;
            let ordinal = seen.entry(nanos).or_insert(0);
            *ordinal += 1;
            Some(
                RawLogLine::new(at.timestamp_millis(), message)
                    .with_event_id(format!("{}-{}-{}", stream, nanos, ordinal)),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::config::RunnerType;
    use orchestrator_core::execution::GitSource;
    use std::collections::BTreeMap;

    fn runner() -> ContainerRunner {
        ContainerRunner::new(RunnerConfig {
            name: "docker".into(),
            runner_type: RunnerType::Container,
            runtime: None,
            default_image: Some("alpine:3.20".into()),
            name_prefix: None,
            work_dir: None,
            labels: vec![],
            env: BTreeMap::from([
                ("CI".to_string(), "true".to_string()),
                ("LEVEL".to_string(), "info".to_string()),
            ]),
        })
    }

    fn spec(command: &str) -> TaskSpec {
        TaskSpec {
            caller: "alice".into(),
            command: command.into(),
            image: None,
            env: BTreeMap::from([("LEVEL".to_string(), "debug".to_string())]),
            git: None,
        }
    }

    #[test]
    fn test_run_args_use_default_image_and_merged_env() {
        let id = ExecutionId::from("abc123");
        let args = runner().run_args(&id, &spec("echo hi")).unwrap();
        assert_eq!(&args[..4], &["run", "-d", "--name", "remoterun-abc123"]);
        assert!(args.contains(&"remoterun.execution_id=abc123".to_string()));
        assert!(args.contains(&"remoterun.caller=alice".to_string()));
        assert!(args.contains(&"CI=true".to_string()));
        assert!(args.contains(&"LEVEL=debug".to_string()));
        assert!(!args.contains(&"LEVEL=info".to_string()));
        assert_eq!(
            &args[args.len() - 4..],
            &["alpine:3.20", "sh", "-c", "echo hi"]
        );
    }

    #[test]
    fn test_run_args_prefer_request_image() {
        let mut spec = spec("true");
        spec.image = Some("rust:1.80".into());
        spec.git = Some(GitSource {
            repo: "https://example.test/app.git".into(),
            git_ref: None,
            path: Some("src".into()),
        });
        let args = runner().run_args(&ExecutionId::from("x"), &spec).unwrap();
        assert_eq!(args[args.len() - 4], "rust:1.80");
        assert!(args[args.len() - 1]
            .starts_with("git clone --depth 1 'https://example.test/app.git' 'src'"));
    }

    #[test]
    fn test_run_args_require_some_image() {
        let mut config = runner().config;
        config.default_image = None;
        let err = ContainerRunner::new(config)
            .run_args(&ExecutionId::from("x"), &spec("true"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    fn state(json: &str) -> ContainerState {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_task_state_from_inspect() {
        let running = state(r#"{"Status":"running","ExitCode":0,"OOMKilled":false}"#);
        assert_eq!(running.task_state(false), TaskState::Running);
        assert_eq!(state(r#"{"Status":"created"}"#).task_state(false), TaskState::Running);

        let done = state(
            r#"{"Status":"exited","ExitCode":0,"FinishedAt":"2024-05-01T10:00:05.5Z"}"#,
        )
        .task_state(false);
        assert_eq!(done.status().as_str(), "SUCCEEDED");
        assert!(done.finished_at().is_some());
        assert_eq!(
            state(r#"{"Status":"exited","ExitCode":2}"#).task_state(false).exit_code(),
            Some(2)
        );
    }

    #[test]
    fn test_signal_exit_is_failure_without_stop_request() {
        let exited = state(r#"{"Status":"exited","ExitCode":143}"#);
        let task = exited.task_state(false);
        assert_eq!(task.status().as_str(), "FAILED");
        assert_eq!(task.exit_code(), Some(143));
        assert_eq!(exited.task_state(true).status().as_str(), "STOPPED");
    }

    #[test]
    fn test_oom_kill_is_failure_even_after_stop_request() {
        let oom = state(r#"{"Status":"exited","ExitCode":137,"OOMKilled":true}"#);
        assert_eq!(oom.task_state(false).status().as_str(), "FAILED");
        assert_eq!(oom.task_state(true).status().as_str(), "FAILED");
        assert_eq!(oom.task_state(true).exit_code(), Some(137));
    }

    #[test]
    fn test_stop_marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = runner().config;
        config.work_dir = Some(dir.path().join("state").display().to_string());
        let runner = ContainerRunner::new(config);
        let id = ExecutionId::from("abc123");

        assert!(!runner.stop_requested(&id));
        let marker = runner.record_stop(&id).unwrap();
        assert!(marker.ends_with("remoterun-abc123.stopped"));
        assert!(runner.stop_requested(&id));
        assert!(!runner.stop_requested(&ExecutionId::from("other")));

        runner.clear_stop(&id).unwrap();
        assert!(!runner.stop_requested(&id));
        runner.clear_stop(&id).unwrap();
    }

    #[test]
    fn test_zero_time_is_unset() {
        assert_eq!(parse_time("0001-01-01T00:00:00Z"), None);
        assert!(parse_time("2024-05-01T10:00:00Z").is_some());
    }

    #[test]
    fn test_parse_logs_assigns_stable_ids() {
        let output = "2024-05-01T10:00:00.000000001Z hello\n\
                      2024-05-01T10:00:00.000000001Z hello\n\
                      2024-05-01T10:00:01.5Z done\n\
                      not a log line";
        let lines = parse_logs("stdout", output);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].message, "hello");
        assert_ne!(lines[0].event_id, lines[1].event_id);
        assert_eq!(lines[2].timestamp, 1_714_557_601_500);
        assert_eq!(parse_logs("stdout", output), lines);
    }

    #[test]
    fn test_missing_container_detection() {
        assert!(is_missing_container("Error: No such container: remoterun-x"));
        assert!(is_missing_container("Error: no such object: remoterun-x"));
        assert!(!is_missing_container("permission denied"));
    }
}
