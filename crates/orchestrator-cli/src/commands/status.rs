use crate::commands::{print_warnings, status_icon};
use crate::dispatch;
use orchestrator_core::config::Config;
use orchestrator_core::execution::{Execution, ExecutionId};
use orchestrator_core::CompletionReconciler;

pub async fn run(
    config: &Config,
    execution_id: &str,
    refresh: bool,
    json: bool,
) -> anyhow::Result<()> {
    let orchestrator = dispatch::create_orchestrator(config)?;
    let ctx = dispatch::request_context();
    let execution_id = ExecutionId::from(execution_id);

    if refresh {
        let report = CompletionReconciler::new(orchestrator.clone())
            .sync(&ctx, &execution_id)
            .await?;
        print_warnings(&report.warnings);
    }

    let execution = orchestrator
        .get_execution_status(&ctx, &execution_id)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        print_status(&execution);
    }

    Ok(())
}

fn print_status(execution: &Execution) {
    println!("{}  Execution: {}", status_icon(execution), execution.execution_id);
    println!("   Command:   {}", execution.command);
    println!("   Runner:    {}", execution.runner);
    println!("   Status:    {}", execution.status);
    println!("   Started:   {}", execution.started_at);
    if let Some(image) = &execution.image_id {
        println!("   Image:     {}", image);
    }
    if let Some(git) = &execution.git {
        println!(
            "   Git:       {}{}",
            git.repo,
            git.git_ref.as_deref().map(|r| format!(" @ {}", r)).unwrap_or_default()
        );
    }
    if let Some(finished) = execution.completed_at {
        println!("   Finished:  {}", finished);
    }
    if let Some(secs) = execution.duration_seconds {
        println!("   Duration:  {}s", secs);
    }
    if let Some(code) = execution.exit_code {
        println!("   Exit:      {}", code);
    }
    println!("   Logs:      {}", execution.log_stream_name);
    println!("   Owner:     {}", execution.created_by);
}
