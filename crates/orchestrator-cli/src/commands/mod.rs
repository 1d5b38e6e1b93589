pub mod cleanup;
pub mod config;
pub mod kill;
pub mod list;
pub mod logs;
pub mod prune;
pub mod run;
pub mod runners;
pub mod status;
pub mod sync;

use orchestrator_core::execution::Execution;
use orchestrator_core::telemetry::Warning;

/// Status marker used in human-readable output.
pub fn status_icon(execution: &Execution) -> &'static str {
    use orchestrator_core::ExecutionStatus::*;
    match execution.status {
        Running => "▶",
        Succeeded => "✓",
        Failed => "✗",
        Stopped => "■",
    }
}

pub fn print_warnings(warnings: &[Warning]) {
    for warning in warnings {
        eprintln!("Warning: {}", warning);
    }
}
