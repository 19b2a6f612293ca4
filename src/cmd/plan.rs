//! Wave planning and pipeline creation.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use waveforge::branch::BranchNames;
use waveforge::dag::{Wave, WavePartitioner};
use waveforge::task::TaskBook;

use super::super::Cli;
use super::load_config;

pub fn cmd_plan(tasks: &Path, json: bool) -> Result<()> {
    let book = TaskBook::from_input(tasks)?;
    let waves = WavePartitioner::from_tasks(&book.tasks)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&waves).context("Failed to serialize waves")?
        );
        return Ok(());
    }

    println!();
    println!("{} tasks in {} waves", book.tasks.len(), waves.len());
    print_waves(&book, &waves);
    Ok(())
}

pub fn cmd_init(
    project_dir: &Path,
    cli: &Cli,
    spec: &str,
    tasks: &Path,
    id: Option<&str>,
) -> Result<()> {
    let config = load_config(project_dir, cli)?;
    config.ensure_directories()?;

    let book = TaskBook::from_input(tasks)?;
    let names = BranchNames::new(spec)?;
    let pipeline_id = id.unwrap_or(names.spec()).to_string();

    let machine = config.machine(config.live_services()?);
    let doc = machine
        .create(&pipeline_id, spec, book.clone())
        .with_context(|| format!("Failed to create pipeline '{}'", pipeline_id))?;

    println!();
    println!(
        "Created pipeline {} ({} tasks in {} waves)",
        style(&pipeline_id).bold(),
        book.tasks.len(),
        doc.total_waves
    );
    println!("Integration branch: {}", names.integration());
    print_waves(&book, &doc.waves);
    println!("Run 'waveforge advance' to set up branches and start wave 1.");
    println!();
    Ok(())
}

fn print_waves(book: &TaskBook, waves: &[Wave]) {
    println!();
    for wave in waves {
        println!(
            "{}  {}",
            style(format!("Wave {}", wave.number)).bold(),
            style(&wave.rationale).dim()
        );
        for id in &wave.tasks {
            let description = book.get(id).map(|t| t.description.as_str()).unwrap_or("");
            println!("  {:<8} {}", id, description);
        }
        for risk in &wave.conflicts {
            println!(
                "  {} {} is touched by {}",
                style("conflict risk:").yellow(),
                risk.resource,
                risk.tasks.join(", ")
            );
        }
        println!();
    }
}
