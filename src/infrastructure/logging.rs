use crate::infrastructure::error::InfraError;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

const COMMAND_LOG: &str = "commands.log";

/// Sends JSON-lines events to `logs/commands.log`. `RUST_LOG` overrides the `info`
/// default. Returns `false` when a global subscriber was already installed.
pub fn init_logging(logs_dir: &Path) -> Result<bool, InfraError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(COMMAND_LOG))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    Ok(tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_current_span(false)
        .try_init()
        .is_ok())
}
