//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. `--verbose` flag (debug for everything)
//! 2. `REMOTERUN_LOG` environment variable, any `EnvFilter` directive
//!    (e.g. "info", "orchestrator_core=debug")
//! 3. default to `warn`

use tracing_subscriber::{fmt, EnvFilter};

const LOG_ENV: &str = "REMOTERUN_LOG";

/// Initialise the global subscriber. Logs go to stderr so command output on
/// stdout stays parseable.
pub fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();
}
