use std::path::Path;

use anyhow::Context;
use orchestrator_core::Config;

const SAMPLE_CONFIG: &str = r#"# remoterun configuration

runners:
  - name: docker
    type: container
    runtime: docker
    default_image: alpine:3.20
    env:
      CI: "true"
    labels:
      - isolated

  - name: local
    type: local
    work_dir: /tmp/remoterun-tasks
    labels:
      - quick-tasks

store:
  list_page_size: 100
  log_batch_size: 25

defaults:
  runner: docker
  log_retention_grace_secs: 60

secrets:
  extra_patterns:
    - SIGNING
"#;

pub async fn run(path: bool, init: bool) -> anyhow::Result<()> {
    let config_path = Config::default_path();
    if path {
        println!("{}", config_path.display());
    } else if init {
        if write_sample(&config_path)? {
            println!("Sample config written to: {}", config_path.display());
        } else {
            println!(
                "Config already exists at: {} (remove it to reinitialize)",
                config_path.display()
            );
        }
    } else {
        describe(&config_path)?;
    }
    Ok(())
}

/// Write the sample config unless a file is already there. The sample is
/// parsed first so a broken template never reaches disk.
fn write_sample(config_path: &Path) -> anyhow::Result<bool> {
    if config_path.exists() {
        return Ok(false);
    }
    Config::from_yaml(SAMPLE_CONFIG).context("built-in sample config is invalid")?;
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(config_path, SAMPLE_CONFIG)?;
    Ok(true)
}

fn describe(config_path: &Path) -> anyhow::Result<()> {
    println!("Config path: {}", config_path.display());
    if !config_path.exists() {
        println!("Status:      not found (using defaults)");
        println!("Run `remoterun config --init` to create one.");
        return Ok(());
    }

    let config = Config::load_from(config_path)
        .with_context(|| format!("invalid config at {}", config_path.display()))?;
    println!("Store:       {}", config.store_dir().display());
    println!(
        "Log grace:   {}s after cleanup",
        config.defaults.log_retention_grace_secs
    );
    if !config.secrets.extra_patterns.is_empty() {
        println!("Secrets:     +{}", config.secrets.extra_patterns.join(", "));
    }
    let default = config.default_runner().map(|r| r.name.as_str());
    println!("Runners:     {}", config.runners.len());
    for r in &config.runners {
        let marker = if Some(r.name.as_str()) == default {
            " (default)"
        } else {
            ""
        };
        println!("  - {} [{}]{}", r.name, r.runner_type, marker);
    }
    Ok(())
}
