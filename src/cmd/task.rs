//! Operator task outcomes and review feedback resolution.

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;

use waveforge::ledger::ArtifactLedger;
use waveforge::task::TaskArtifacts;

use super::super::{Cli, ReviewCommands, TaskCommands};
use super::open_pipeline;

fn read_artifacts(path: &Path) -> Result<TaskArtifacts> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read artifacts file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse artifacts file: {}", path.display()))
}

pub fn cmd_task(project_dir: &Path, cli: &Cli, command: TaskCommands) -> Result<()> {
    let (machine, pipeline_id) = open_pipeline(project_dir, cli)?;

    match command {
        TaskCommands::Complete { id, artifacts } => {
            let artifacts = match artifacts {
                Some(path) => read_artifacts(&path)?,
                None => TaskArtifacts::default(),
            };
            machine.complete_task(&pipeline_id, &id, artifacts)?;
            println!("Task {} marked {}", id, style("pass").green());
        }
        TaskCommands::Block { id, reason } => {
            machine.block_task(&pipeline_id, &id, &reason)?;
            println!("Task {} marked {}: {}", id, style("blocked").red(), reason);
            println!("The next 'waveforge advance' moves the pipeline to FAILED.");
        }
        TaskCommands::Verify { id, symbols } => {
            let book = machine.store().load_tasks(&pipeline_id)?;
            let symbols = if symbols.is_empty() {
                ArtifactLedger::query(&book, &id)?.exports_added.clone()
            } else {
                symbols
            };
            let check = machine.ledger().verify(&book, &id, &symbols)?;

            for symbol in &check.verified {
                println!("  {} {}", style("✓").green(), symbol);
            }
            for symbol in &check.missing {
                println!("  {} {}", style("✗").red(), symbol);
            }
            for file in &check.missing_files {
                println!("  {} {} (file missing)", style("✗").red(), file);
            }

            if !check.is_satisfied() {
                bail!("Task {} failed verification: {}", id, check.describe_failure());
            }
            println!("Task {} artifacts verified", id);
        }
    }
    Ok(())
}

pub fn cmd_review(project_dir: &Path, cli: &Cli, command: ReviewCommands) -> Result<()> {
    let (machine, pipeline_id) = open_pipeline(project_dir, cli)?;

    match command {
        ReviewCommands::Resolved => {
            if machine.resolve_review_fix(&pipeline_id)? {
                println!("Review feedback marked addressed; run 'waveforge advance' to re-publish.");
            } else {
                println!("No outstanding review feedback for {}.", pipeline_id);
            }
        }
    }
    Ok(())
}
