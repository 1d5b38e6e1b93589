use std::time::Duration;

use chrono::DateTime;

use crate::commands::print_warnings;
use crate::dispatch;
use orchestrator_core::config::Config;
use orchestrator_core::execution::ExecutionId;
use orchestrator_core::log_event::LogEvent;
use orchestrator_core::CompletionReconciler;

pub async fn run(
    config: &Config,
    execution_id: &str,
    follow: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let orchestrator = dispatch::create_orchestrator(config)?;
    let ctx = dispatch::request_context();
    let execution_id = ExecutionId::from(execution_id);

    let Some(interval) = follow else {
        let logs = orchestrator.get_logs(&ctx, &execution_id).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&logs)?);
        } else {
            for event in &logs.events {
                println!("{}", format_event(event));
            }
            if let Some(channel) = &logs.live_channel {
                eprintln!("Live updates: {}", channel);
            }
        }
        return Ok(());
    };

    // Poll mode: record completion as it happens so the loop can end.
    let reconciler = CompletionReconciler::new(orchestrator.clone());
    let mut printed = 0;
    loop {
        let report = reconciler.sync(&ctx, &execution_id).await?;
        print_warnings(&report.warnings);

        let logs = orchestrator.get_logs(&ctx, &execution_id).await?;
        for event in logs.events_after(printed) {
            if json {
                println!("{}", serde_json::to_string(event)?);
            } else {
                println!("{}", format_event(event));
            }
        }
        printed = logs.last_index;

        if logs.status.is_terminal() {
            eprintln!("Execution {} finished: {}", execution_id, logs.status);
            break;
        }
        tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
    }

    Ok(())
}

fn format_event(event: &LogEvent) -> String {
    match DateTime::from_timestamp_millis(event.timestamp) {
        Some(at) => format!("{} {}", at.format("%H:%M:%S%.3f"), event.message),
        None => event.message.clone(),
    }
}
