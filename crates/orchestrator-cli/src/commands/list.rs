use crate::commands::status_icon;
use crate::dispatch;
use orchestrator_core::config::Config;
use orchestrator_core::execution::ExecutionStatus;
use orchestrator_core::store::ListFilter;

pub async fn run(
    config: &Config,
    statuses: &[String],
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let statuses = statuses
        .iter()
        .map(|s| s.parse::<ExecutionStatus>())
        .collect::<Result<Vec<_>, _>>()?;
    let filter = ListFilter::all().with_limit(limit).with_statuses(statuses);

    let orchestrator = dispatch::create_orchestrator(config)?;
    let executions = orchestrator
        .list_executions(&dispatch::request_context(), &filter)
        .await?;

    if json {
        let json_executions: Vec<_> = executions.iter().map(|e| e.to_summary_json()).collect();
        println!("{}", serde_json::to_string_pretty(&json_executions)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!("No executions found.");
        return Ok(());
    }
    println!(
        "{:<2} {:<34} {:<12} {:<10} {:<6} {:<20} {}",
        "", "EXECUTION ID", "RUNNER", "STATUS", "EXIT", "STARTED", "COMMAND"
    );
    println!("{}", "-".repeat(100));
    for e in &executions {
        println!(
            "{:<2} {:<34} {:<12} {:<10} {:<6} {:<20} {}",
            status_icon(e),
            e.execution_id,
            e.runner,
            e.status,
            e.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            e.started_at.format("%Y-%m-%d %H:%M:%S"),
            truncate(&e.command, 40),
        );
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
