//! Driving a pipeline: advance, poll, status, reset and recover.

use anyhow::{Context, Result, anyhow};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

use waveforge::machine::{RECOVERABLE_PHASES, StatusReport, StepOutcome};
use waveforge::state::Phase;
use waveforge::task::TaskStatus;

use super::super::Cli;
use super::open_pipeline;

fn print_outcome(outcome: &StepOutcome) {
    match outcome {
        StepOutcome::Transitioned {
            to: Phase::Completed,
            ..
        } => println!("{} {}", style("✓").green().bold(), outcome),
        StepOutcome::Transitioned {
            to: Phase::Failed, ..
        } => println!("{} {}", style("✗").red().bold(), outcome),
        StepOutcome::Transitioned { .. } => println!("{} {}", style("→").cyan(), outcome),
        StepOutcome::NeedsManualCheck { .. } => {
            println!("{} {}", style("!").yellow().bold(), outcome)
        }
        StepOutcome::Waiting { .. } | StepOutcome::Idle { .. } => {
            println!("{} {}", style("·").dim(), outcome)
        }
    }
}

pub async fn cmd_advance(project_dir: &Path, cli: &Cli, until_blocked: bool) -> Result<()> {
    let (machine, pipeline_id) = open_pipeline(project_dir, cli)?;

    loop {
        let outcome = machine
            .step(&pipeline_id)
            .await
            .with_context(|| format!("Step of pipeline '{}' failed", pipeline_id))?;
        print_outcome(&outcome);
        if !until_blocked || !outcome.made_progress() {
            break;
        }
    }
    Ok(())
}

pub async fn cmd_poll(project_dir: &Path, cli: &Cli) -> Result<()> {
    let (machine, pipeline_id) = open_pipeline(project_dir, cli)?;
    let phase = machine.status(&pipeline_id)?.state.phase;
    if phase != Phase::AwaitingReview {
        println!("Pipeline {} is in {}, not awaiting review.", pipeline_id, phase);
        return Ok(());
    }

    let interval = Duration::from_millis(machine.poll_config().poll_interval_ms);
    let max_polls = machine.poll_config().max_polls();

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg}")
            .expect("progress bar template is a valid static string"),
    );
    spinner.enable_steady_tick(Duration::from_millis(120));
    spinner.set_message("Polling review status...");

    loop {
        let outcome = match machine.step(&pipeline_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                spinner.abandon_with_message("Poll failed; state is unchanged");
                return Err(e.into());
            }
        };

        match &outcome {
            StepOutcome::Waiting {
                poll: Some(report), ..
            } => {
                spinner.set_message(format!(
                    "Review pending (poll {} of {}, {}s elapsed)",
                    report.poll_count,
                    max_polls,
                    report.elapsed_ms / 1000
                ));
            }
            _ => {
                spinner.finish_and_clear();
                print_outcome(&outcome);
                return Ok(());
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                spinner.abandon_with_message("Interrupted; polling state is saved");
                return Ok(());
            }
        }
    }
}

pub fn cmd_status(project_dir: &Path, cli: &Cli, json: bool) -> Result<()> {
    let (machine, pipeline_id) = open_pipeline(project_dir, cli)?;
    let report = machine.status(&pipeline_id)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize status")?
        );
        return Ok(());
    }

    print_status(&report);
    Ok(())
}

fn print_status(report: &StatusReport) {
    let state = &report.state;
    let phase = match state.phase {
        Phase::Completed => style(state.phase.to_string()).green().bold(),
        Phase::Failed => style(state.phase.to_string()).red().bold(),
        _ => style(state.phase.to_string()).cyan().bold(),
    };

    println!();
    println!("Pipeline {}", style(&state.pipeline_id).bold());
    println!("=========={}", "=".repeat(state.pipeline_id.len()));
    println!();
    println!("Spec:         {}", state.spec_id);
    println!("Phase:        {}", phase);
    if state.phase == Phase::Completed {
        println!("Waves:        {} of {} merged", state.history.len(), state.total_waves);
    } else {
        let (passed, total) = report.wave_progress();
        println!(
            "Wave:         {} of {} ({} of {} tasks pass)",
            state.current_wave, state.total_waves, passed, total
        );
    }
    if let Some(branch) = &state.integration_branch {
        println!("Integration:  {}", branch);
    }
    if let Some(branch) = &state.wave_branch {
        println!("Wave branch:  {}", branch);
    }
    if let Some(pr) = &state.pull_request_ref {
        println!("Change-set:   #{}", pr);
    }
    if state.review_status.poll_count > 0 {
        let decision = state
            .review_status
            .decision
            .map(|d| d.to_string())
            .unwrap_or_else(|| "pending".to_string());
        println!(
            "Review:       {} after {} polls ({} blocking)",
            decision, state.review_status.poll_count, state.review_status.blocking_count
        );
    }
    if state.review_cycles > 0 {
        println!("Review cycles: {}", state.review_cycles);
    }
    if let Some(fix) = &state.execution.review_fix
        && !fix.resolved
    {
        println!(
            "Review fix:   cycle {} outstanding ({} blocking)",
            fix.cycle, fix.blocking_count
        );
    }
    if let Some(error) = &state.last_error {
        println!("Last error:   {}", style(error).red());
    }

    if let Some(wave) = state.current_wave_plan() {
        println!();
        println!("{:<8} {:<12} Description", "Task", "Status");
        println!("{:<8} {:<12} -----------", "--------", "------------");
        for id in &wave.tasks {
            let Some(task) = report.tasks.get(id) else {
                continue;
            };
            let status = match task.status {
                TaskStatus::Pass => style("pass").green(),
                TaskStatus::Blocked => style("blocked").red(),
                TaskStatus::InProgress => style("in progress").yellow(),
                TaskStatus::Pending => style("pending").dim(),
            };
            println!("{:<8} {:<12} {}", task.id, status, task.description);
        }
    }

    if !state.history.is_empty() {
        println!();
        println!("Merged waves:");
        for entry in &state.history {
            println!(
                "  wave {} via #{} at {} ({} review cycles)",
                entry.wave,
                entry.pull_request_ref,
                entry.merged_at.format("%Y-%m-%d %H:%M"),
                entry.review_cycles
            );
        }
    }
    println!();
}

pub async fn cmd_reset(project_dir: &Path, cli: &Cli, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let (machine, pipeline_id) = open_pipeline(project_dir, cli)?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "This restarts the current wave of '{}', unblocking its tasks. Continue?",
                pipeline_id
            ))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    let report = machine.reset(&pipeline_id).await?;
    println!(
        "Reset {} from {} to EXECUTE at wave {}",
        pipeline_id, report.from, report.wave
    );
    if !report.unblocked.is_empty() {
        println!("Unblocked tasks: {}", report.unblocked.join(", "));
    }
    Ok(())
}

pub fn cmd_recover(project_dir: &Path, cli: &Cli, phase: &str) -> Result<()> {
    let target: Phase = phase.parse().map_err(|e: String| anyhow!(e))?;
    if !RECOVERABLE_PHASES.contains(&target) {
        let allowed: Vec<String> = RECOVERABLE_PHASES.iter().map(|p| p.to_string()).collect();
        return Err(anyhow!(
            "Cannot recover into {}; choose one of {}",
            target,
            allowed.join(", ")
        ));
    }

    let (machine, pipeline_id) = open_pipeline(project_dir, cli)?;
    let doc = machine
        .recover(&pipeline_id, target)
        .with_context(|| format!("Recovery of '{}' into {} failed", pipeline_id, target))?;
    println!(
        "Recovered {} into {} at wave {} of {}",
        pipeline_id, doc.phase, doc.current_wave, doc.total_waves
    );
    Ok(())
}
