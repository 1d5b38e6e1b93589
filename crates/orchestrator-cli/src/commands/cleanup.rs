use crate::commands::print_warnings;
use crate::dispatch;
use orchestrator_core::config::Config;
use orchestrator_core::execution::ExecutionId;

pub async fn run(config: &Config, execution_id: &str) -> anyhow::Result<()> {
    let orchestrator = dispatch::create_orchestrator(config)?;
    let execution_id = ExecutionId::from(execution_id);

    let warnings = orchestrator
        .cleanup_execution(&dispatch::request_context(), &execution_id)
        .await?;
    print_warnings(&warnings);
    println!(
        "Execution {} removed; logs expire in {}s.",
        execution_id, config.defaults.log_retention_grace_secs
    );

    Ok(())
}
