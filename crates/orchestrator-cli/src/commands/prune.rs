use crate::dispatch;
use orchestrator_core::config::Config;

pub async fn run(config: &Config) -> anyhow::Result<()> {
    let orchestrator = dispatch::create_orchestrator(config)?;
    let purged = orchestrator.prune_expired_logs().await?;

    if purged.is_empty() {
        println!("No expired logs.");
    } else {
        for id in &purged {
            println!("Purged logs of {}", id);
        }
    }

    Ok(())
}
