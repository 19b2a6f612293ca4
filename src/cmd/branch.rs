//! Branch inspection and cleanup, `waveforge branch`.

use anyhow::Result;
use console::style;
use std::path::Path;

use waveforge::branch::BranchCoordinator;

use super::super::{BranchCommands, Cli};
use super::load_config;

pub async fn cmd_branch(project_dir: &Path, cli: &Cli, command: BranchCommands) -> Result<()> {
    use dialoguer::Confirm;

    let config = load_config(project_dir, cli)?;
    let services = config.live_services()?;
    let branches = BranchCoordinator::new(services.vcs, config.settings.trunk());

    match command {
        BranchCommands::Target { branch } => {
            println!("{}", branches.resolve_merge_target(&branch)?);
        }
        BranchCommands::Cleanup { branch, force } => {
            if !force {
                let confirm = Confirm::new()
                    .with_prompt(format!("Delete {} locally and on the remote?", branch))
                    .default(false)
                    .interact()
                    .unwrap_or(false);
                if !confirm {
                    println!("Cleanup cancelled");
                    return Ok(());
                }
            }

            let report = branches.cleanup(&branch).await?;
            for warning in &report.warnings {
                println!("{} {}", style("warning:").yellow(), warning);
            }
            println!(
                "{}: local {}, remote {}",
                report.branch,
                if report.deleted_local { "deleted" } else { "absent" },
                if report.deleted_remote { "deleted" } else { "absent" }
            );
        }
    }
    Ok(())
}
