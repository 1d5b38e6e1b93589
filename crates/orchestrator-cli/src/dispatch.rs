use std::sync::Arc;

use anyhow::Context;
use chrono::Duration;
use orchestrator_core::config::{Config, RunnerConfig, RunnerType};
use orchestrator_core::runner::{RunnerRegistry, TaskRunner};
use orchestrator_core::secrets::SecretClassifier;
use orchestrator_core::service::{Orchestrator, OrchestratorOptions};
use orchestrator_core::store::{FsExecutionStore, FsLogEventStore};
use orchestrator_core::RequestContext;
use tracing::debug;

pub fn load_config() -> anyhow::Result<Config> {
    Config::load_default().context("failed to load config")
}

/// Create a runner from its config entry.
pub fn create_runner(runner_config: RunnerConfig) -> Arc<dyn TaskRunner> {
    match runner_config.runner_type {
        RunnerType::Container => Arc::new(runner_container::ContainerRunner::new(runner_config)),
        RunnerType::Local => Arc::new(runner_local::LocalRunner::new(runner_config)),
    }
}

/// All configured runners, with `defaults.runner` as the default.
pub fn create_registry(config: &Config) -> anyhow::Result<RunnerRegistry> {
    let mut registry = RunnerRegistry::new();
    for runner_config in &config.runners {
        registry.register(create_runner(runner_config.clone()));
    }
    if let Some(name) = config.defaults.runner.as_deref() {
        registry.set_default(name)?;
    }
    Ok(registry)
}

/// Orchestrator over the file-backed stores in the configured data directory.
pub fn create_orchestrator(config: &Config) -> anyhow::Result<Arc<Orchestrator>> {
    let root = config.store_dir();
    let executions = FsExecutionStore::open(&root, config.store.list_page_size)
        .with_context(|| format!("failed to open store at {}", root.display()))?;
    let grace = Duration::seconds(config.defaults.log_retention_grace_secs as i64);
    let logs = FsLogEventStore::open(&root, config.store.log_batch_size, grace)
        .with_context(|| format!("failed to open log store at {}", root.display()))?;

    let registry = create_registry(config)?;
    debug!(
        store = %root.display(),
        runners = ?registry.names().collect::<Vec<_>>(),
        "orchestrator ready"
    );

    let options = OrchestratorOptions {
        log_push_endpoint: config.defaults.log_push_endpoint.clone(),
        classifier: SecretClassifier::with_extra_patterns(config.secrets.extra_patterns.clone()),
    };
    Ok(Arc::new(Orchestrator::new(
        Arc::new(executions),
        Arc::new(logs),
        registry,
        options,
    )))
}

/// Request context for one CLI invocation, attributed to the local user.
pub fn request_context() -> RequestContext {
    let caller = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    RequestContext::new(caller)
}
