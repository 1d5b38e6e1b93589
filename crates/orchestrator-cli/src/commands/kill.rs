use crate::dispatch;
use orchestrator_core::config::Config;
use orchestrator_core::execution::ExecutionId;

pub async fn run(config: &Config, execution_id: &str) -> anyhow::Result<()> {
    let orchestrator = dispatch::create_orchestrator(config)?;
    let execution_id = ExecutionId::from(execution_id);

    orchestrator
        .kill_execution(&dispatch::request_context(), &execution_id)
        .await?;
    println!("Stop requested for {}.", execution_id);
    println!("Run `remoterun sync {}` to record the final state.", execution_id);

    Ok(())
}
