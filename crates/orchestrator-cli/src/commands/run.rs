use std::collections::BTreeMap;

use crate::commands::print_warnings;
use crate::dispatch;
use orchestrator_core::config::Config;
use orchestrator_core::execution::{GitSource, RunRequest};

pub struct RunArgs {
    pub command: String,
    pub runner: Option<String>,
    pub image: Option<String>,
    pub env: BTreeMap<String, String>,
    pub repo: Option<String>,
    pub git_ref: Option<String>,
    pub path: Option<String>,
    pub lock: Option<String>,
}

pub async fn run(config: &Config, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let orchestrator = dispatch::create_orchestrator(config)?;
    let ctx = dispatch::request_context();

    let request = RunRequest {
        command: args.command,
        image: args.image,
        git: args.repo.map(|repo| GitSource {
            repo,
            git_ref: args.git_ref,
            path: args.path,
        }),
        env: args.env,
        lock: args.lock,
        runner: args.runner,
    };

    let response = orchestrator.run_command(&ctx, request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("▶ Command started:");
        println!("  ID:      {}", response.execution_id);
        println!("  Status:  {}", response.status);
        println!("  Request: {}", ctx.request_id);
        print_warnings(&response.warnings);
    }

    Ok(())
}
