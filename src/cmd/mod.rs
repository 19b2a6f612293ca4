//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled                               |
//! |------------|------------------------------------------------|
//! | `plan`     | `Plan`, `Init`                                 |
//! | `pipeline` | `Advance`, `Poll`, `Status`, `Reset`, `Recover` |
//! | `task`     | `Task`, `Review`                               |
//! | `branch`   | `Branch`                                       |
//! | `config`   | `Config`                                       |

pub mod branch;
pub mod config;
pub mod pipeline;
pub mod plan;
pub mod task;

pub use branch::cmd_branch;
pub use config::cmd_config;
pub use pipeline::{cmd_advance, cmd_poll, cmd_recover, cmd_reset, cmd_status};
pub use plan::{cmd_init, cmd_plan};
pub use task::{cmd_review, cmd_task};

use anyhow::Result;
use std::path::Path;

use waveforge::config::Config;
use waveforge::machine::DeliveryMachine;

use super::Cli;

pub(crate) fn load_config(project_dir: &Path, cli: &Cli) -> Result<Config> {
    let config = Config::new(project_dir.to_path_buf(), cli.trunk.as_deref())?;
    for warning in &config.settings.env_warnings {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}

/// The machine over live services and the pipeline the command targets.
pub(crate) fn open_pipeline(project_dir: &Path, cli: &Cli) -> Result<(DeliveryMachine, String)> {
    let config = load_config(project_dir, cli)?;
    let pipeline_id = config.resolve_pipeline(cli.pipeline.as_deref())?;
    let machine = config.machine(config.live_services()?);
    Ok((machine, pipeline_id))
}
