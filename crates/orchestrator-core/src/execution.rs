use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    /// Fresh runner-side identifier. Only task runners mint ids.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Succeeded => "SUCCEEDED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "RUNNING" => Ok(ExecutionStatus::Running),
            "SUCCEEDED" => Ok(ExecutionStatus::Succeeded),
            "FAILED" => Ok(ExecutionStatus::Failed),
            "STOPPED" => Ok(ExecutionStatus::Stopped),
            other => Err(OrchestratorError::InvalidRequest(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

/// Repository to clone into the task's working directory before the command runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitSource {
    pub repo: String,
    #[serde(default, rename = "ref")]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl GitSource {
    /// Checkout directory, defaulting to the repository's base name.
    pub fn checkout_path(&self) -> String {
        if let Some(path) = self.path.as_deref().filter(|p| !p.trim().is_empty()) {
            return path.to_string();
        }
        let base = self
            .repo
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("repo")
            .trim_end_matches(".git");
        if base.is_empty() {
            "repo".to_string()
        } else {
            base.to_string()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub command: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub git: Option<GitSource>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub lock: Option<String>,
    /// Named runner; the registry default when absent.
    #[serde(default)]
    pub runner: Option<String>,
}

impl RunRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// One tracked command run, as persisted by an `ExecutionStore`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub runner: String,
    pub created_by: String,
    #[serde(default)]
    pub owned_by: BTreeSet<String>,
    pub command: String,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub git: Option<GitSource>,
    #[serde(default)]
    pub lock: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    pub log_stream_name: String,
    #[serde(default)]
    pub created_by_request_id: Option<String>,
    #[serde(default)]
    pub modified_by_request_id: Option<String>,
}

impl Execution {
    pub fn new_running(
        execution_id: ExecutionId,
        runner: String,
        created_by: String,
        command: String,
        started_at: DateTime<Utc>,
        log_stream_name: String,
    ) -> Self {
        let mut owned_by = BTreeSet::new();
        owned_by.insert(created_by.clone());
        Self {
            execution_id,
            runner,
            created_by,
            owned_by,
            command,
            image_id: None,
            git: None,
            lock: None,
            status: ExecutionStatus::Running,
            started_at,
            completed_at: None,
            exit_code: None,
            duration_seconds: None,
            log_stream_name,
            created_by_request_id: None,
            modified_by_request_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move a RUNNING execution into a terminal state. Sets `completed_at`
    /// exactly once and derives the duration from `started_at`.
    pub fn mark_finished(
        &mut self,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "{} is not a terminal status",
                status
            )));
        }
        if self.is_terminal() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "execution {} already terminated ({})",
                self.execution_id, self.status
            )));
        }
        let completed_at = completed_at.max(self.started_at);
        self.status = status;
        self.exit_code = exit_code;
        self.completed_at = Some(completed_at);
        self.duration_seconds = Some((completed_at - self.started_at).num_seconds());
        Ok(())
    }

    /// Exit code as surfaced to callers: never while the execution is running.
    pub fn visible_exit_code(&self) -> Option<i32> {
        if self.is_terminal() {
            self.exit_code
        } else {
            None
        }
    }

    /// Guard applied by stores before replacing `self` with `next`.
    /// A terminal record may be rewritten (e.g. audit fields) but never
    /// moved to another status or completion time.
    pub fn check_transition(&self, next: &Execution) -> Result<()> {
        if next.status.is_terminal() != next.completed_at.is_some() {
            return Err(OrchestratorError::InvalidRequest(format!(
                "execution {}: completed_at must be set exactly when status is terminal",
                next.execution_id
            )));
        }
        if next.started_at != self.started_at {
            return Err(OrchestratorError::InvalidRequest(format!(
                "execution {}: started_at is immutable",
                next.execution_id
            )));
        }
        if self.is_terminal()
            && (next.status != self.status || next.completed_at != self.completed_at)
        {
            return Err(OrchestratorError::InvalidRequest(format!(
                "execution {} already terminated ({})",
                self.execution_id, self.status
            )));
        }
        Ok(())
    }

    pub fn to_summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "execution_id": self.execution_id,
            "runner": self.runner,
            "status": self.status,
            "command": self.command,
            "image_id": self.image_id,
            "created_by": self.created_by,
            "owned_by": self.owned_by,
            "started_at": self.started_at.to_rfc3339(),
            "completed_at": self.completed_at.map(|t| t.to_rfc3339()),
            "exit_code": self.visible_exit_code(),
            "duration_seconds": self.duration_seconds,
            "log_stream_name": self.log_stream_name,
        })
    }
}
