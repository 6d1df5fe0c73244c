//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "PXEVM_LOG";

/// Filter for stderr logging: `--verbose` wins, then `PXEVM_LOG`, then info
pub fn log_filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("pxevm=debug");
    }
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("pxevm=info"))
}

/// Install the global subscriber. Logs go to stderr so stdout stays
/// parseable when `--json` is used.
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
