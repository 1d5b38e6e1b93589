use clap::{Parser, Subcommand};
use orchestrator_core::OrchestratorError;

mod commands;
mod dispatch;
mod logging;

#[derive(Parser)]
#[command(name = "remoterun")]
#[command(about = "Run commands on task runners and track their executions", long_about = None)]
struct Cli {
    /// Debug-level logging (overrides REMOTERUN_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a command on a runner
    Run {
        /// Shell command to run
        command: String,

        /// Runner name (defaults to the configured default)
        #[arg(short, long)]
        runner: Option<String>,

        /// Container image (container runners)
        #[arg(short, long)]
        image: Option<String>,

        /// Environment variable, KEY=VALUE (repeatable)
        #[arg(short, long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// Git repository to clone before running
        #[arg(long)]
        repo: Option<String>,

        /// Branch or tag to check out
        #[arg(long = "ref", requires = "repo")]
        git_ref: Option<String>,

        /// Checkout directory
        #[arg(long, requires = "repo")]
        path: Option<String>,

        /// Lock label recorded with the execution
        #[arg(long)]
        lock: Option<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the recorded status of an execution
    Status {
        /// Execution ID
        execution_id: String,

        /// Poll the runner and record completion first
        #[arg(long)]
        refresh: bool,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// List executions, newest first
    List {
        /// Only these statuses (repeatable): running, succeeded, failed, stopped
        #[arg(short, long)]
        status: Vec<String>,

        /// Maximum number of executions (0 for all)
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Stop a running execution
    Kill {
        /// Execution ID
        execution_id: String,
    },

    /// Show execution logs
    Logs {
        /// Execution ID
        execution_id: String,

        /// Keep polling every N seconds until the execution finishes
        #[arg(short, long)]
        follow: Option<u64>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Record completion of finished executions
    Sync {
        /// Execution ID (all running executions when omitted)
        execution_id: Option<String>,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Remove a finished execution and schedule its logs for removal
    Cleanup {
        /// Execution ID
        execution_id: String,
    },

    /// Purge logs whose retention grace window has passed
    Prune {},

    /// List configured runners
    Runners {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show or initialize the config file
    Config {
        /// Print the config file path
        #[arg(long)]
        path: bool,

        /// Write a sample config
        #[arg(long)]
        init: bool,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

async fn execute(command: Commands) -> anyhow::Result<()> {
    use Commands::*;

    match command {
        Run {
            command,
            runner,
            image,
            env,
            repo,
            git_ref,
            path,
            lock,
            json,
        } => {
            let config = dispatch::load_config()?;
            let args = commands::run::RunArgs {
                command,
                runner,
                image,
                env: env.into_iter().collect(),
                repo,
                git_ref,
                path,
                lock,
            };
            commands::run::run(&config, args, json).await?;
        }
        Status {
            execution_id,
            refresh,
            json,
        } => {
            let config = dispatch::load_config()?;
            commands::status::run(&config, &execution_id, refresh, json).await?;
        }
        List {
            status,
            limit,
            json,
        } => {
            let config = dispatch::load_config()?;
            commands::list::run(&config, &status, limit, json).await?;
        }
        Kill { execution_id } => {
            let config = dispatch::load_config()?;
            commands::kill::run(&config, &execution_id).await?;
        }
        Logs {
            execution_id,
            follow,
            json,
        } => {
            let config = dispatch::load_config()?;
            commands::logs::run(&config, &execution_id, follow, json).await?;
        }
        Sync { execution_id, json } => {
            let config = dispatch::load_config()?;
            commands::sync::run(&config, execution_id.as_deref(), json).await?;
        }
        Cleanup { execution_id } => {
            let config = dispatch::load_config()?;
            commands::cleanup::run(&config, &execution_id).await?;
        }
        Prune {} => {
            let config = dispatch::load_config()?;
            commands::prune::run(&config).await?;
        }
        Runners { json } => {
            let config = dispatch::load_config()?;
            commands::runners::run(&config, json).await?;
        }
        Config { path, init } => {
            commands::config::run(path, init).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    if let Err(e) = execute(cli.command).await {
        match e.downcast_ref::<OrchestratorError>() {
            Some(err) => eprintln!("error[{}]: {}", err.kind().code(), err),
            None => eprintln!("error: {:#}", e),
        }
        std::process::exit(1);
    }
}
