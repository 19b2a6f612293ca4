//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Filter priority:
//! 1. `--verbose` (debug for this crate)
//! 2. `WAVEFORGE_LOG`, any `EnvFilter` directive (e.g. "waveforge=debug")
//! 3. `info`
//!
//! Logs go to stderr so command output on stdout stays machine readable.

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "WAVEFORGE_LOG";

/// Initialise the global subscriber. Call once at startup.
pub fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let filter = build_filter(verbose, std::env::var(LOG_ENV).ok().as_deref());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    result.map_err(|e| anyhow!("Failed to initialise logging: {}", e))
}

fn build_filter(verbose: bool, env_directive: Option<&str>) -> EnvFilter {
    if verbose {
        return EnvFilter::new("waveforge=debug,info");
    }
    env_directive
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
