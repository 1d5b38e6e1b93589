use orchestrator_core::config::{Config, RunnerType};

pub async fn run(config: &Config, json: bool) -> anyhow::Result<()> {
    if config.runners.is_empty() {
        println!("No runners configured.");
        println!("Run `remoterun config --init` to create a sample config.");
        return Ok(());
    }

    let default = config.default_runner().map(|r| r.name.as_str());

    if json {
        let entries: Vec<serde_json::Value> = config
            .runners
            .iter()
            .map(|r| {
                serde_json::json!({
                    "name": r.name,
                    "type": r.runner_type.to_string(),
                    "runtime": runtime_label(r),
                    "default_image": r.default_image,
                    "labels": r.labels,
                    "default": Some(r.name.as_str()) == default,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        println!("{:<15} {:<12} {:<10} {:<20} {}", "NAME", "TYPE", "RUNTIME", "IMAGE", "LABELS");
        println!("{}", "-".repeat(72));
        for r in &config.runners {
            let marker = if Some(r.name.as_str()) == default { "*" } else { "" };
            println!(
                "{:<15} {:<12} {:<10} {:<20} {}",
                format!("{}{}", r.name, marker),
                r.runner_type,
                runtime_label(r),
                r.default_image.as_deref().unwrap_or("-"),
                r.labels.join(", "),
            );
        }
    }

    Ok(())
}

fn runtime_label(r: &orchestrator_core::config::RunnerConfig) -> String {
    match r.runner_type {
        RunnerType::Container => r.runtime().to_string(),
        RunnerType::Local => "sh".to_string(),
    }
}
