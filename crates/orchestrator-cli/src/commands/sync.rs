use crate::commands::print_warnings;
use crate::dispatch;
use orchestrator_core::config::Config;
use orchestrator_core::execution::ExecutionId;
use orchestrator_core::CompletionReconciler;

pub async fn run(config: &Config, execution_id: Option<&str>, json: bool) -> anyhow::Result<()> {
    let orchestrator = dispatch::create_orchestrator(config)?;
    let ctx = dispatch::request_context();
    let reconciler = CompletionReconciler::new(orchestrator);

    let reports = match execution_id {
        Some(id) => vec![reconciler.sync(&ctx, &ExecutionId::from(id)).await?],
        None => reconciler.sync_running(&ctx).await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    if reports.is_empty() {
        println!("No running executions.");
        return Ok(());
    }
    for report in &reports {
        let change = if report.transitioned { "finished" } else { "unchanged" };
        println!(
            "{:<34} {:<10} {:<10} {}",
            report.execution_id,
            report.status,
            change,
            report.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
        );
        print_warnings(&report.warnings);
    }

    Ok(())
}
