pub mod config;
pub mod error;
pub mod execution;
pub mod log_event;
pub mod merge;
pub mod reconcile;
pub mod runner;
pub mod secrets;
pub mod service;
pub mod store;
pub mod telemetry;

pub use config::Config;
pub use error::{ErrorKind, OrchestratorError};
pub use execution::{Execution, ExecutionId, ExecutionStatus, GitSource, RunRequest};
pub use log_event::{LogEvent, RawLogLine};
pub use reconcile::{CompletionReconciler, SyncReport};
pub use runner::{RunnerRegistry, StartedTask, TaskRunner, TaskSpec, TaskState};
pub use service::{LogsResponse, Orchestrator, OrchestratorOptions, RunResponse};
pub use store::{ExecutionStore, ListFilter, LogEventStore};
pub use telemetry::{RequestContext, Warning, WarningCode};
