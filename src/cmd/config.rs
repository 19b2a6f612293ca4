//! Configuration view and validation commands, `waveforge config`.

use anyhow::Result;
use std::path::Path;

use waveforge::waveforge_config::{
    ENV_GITHUB_TOKEN, ENV_MAX_POLL_DURATION, ENV_POLL_INTERVAL, ENV_TRUNK, WaveforgeToml,
};

use super::super::{Cli, ConfigCommands};
use super::load_config;

fn print_toml(toml: &WaveforgeToml) {
    println!("[git]");
    println!("  trunk = \"{}\"", toml.git.trunk);
    println!("  remote = \"{}\"", toml.git.remote);
    println!();
    println!("[review]");
    println!("  poll_interval_ms = {}", toml.review.poll_interval_ms);
    println!("  max_poll_duration_ms = {}", toml.review.max_poll_duration_ms);
    println!();
    println!("[execution]");
    println!("  max_parallel = {}", toml.execution.max_parallel);
    match &toml.execution.command {
        Some(command) => println!("  command = \"{}\"", command),
        None => println!("  command = (none, tasks are completed with 'waveforge task complete')"),
    }
    println!();
    println!("[github]");
    match &toml.github.repo {
        Some(repo) => println!("  repo = \"{}\"", repo),
        None => println!("  repo = (from remote URL)"),
    }
    println!("  api_url = \"{}\"", toml.github.api_url);
    println!();
}

pub fn cmd_config(project_dir: &Path, cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config = load_config(project_dir, cli)?;
    let config_path = config.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Waveforge Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
                println!();
                print_toml(&WaveforgeToml::load(&config_path)?);
            } else {
                println!("No waveforge.toml found at {}", config_path.display());
                println!();
                println!("Using default configuration:");
                print_toml(&WaveforgeToml::default());
                println!("Run 'waveforge config init' to create a waveforge.toml file.");
                println!();
            }

            println!(
                "Effective values (with {}, {}, {} and CLI overrides):",
                ENV_TRUNK, ENV_POLL_INTERVAL, ENV_MAX_POLL_DURATION
            );
            println!("  trunk = \"{}\"", config.settings.trunk());
            let poll = config.settings.poll();
            println!("  poll_interval_ms = {}", poll.poll_interval_ms);
            println!("  max_poll_duration_ms = {}", poll.max_poll_duration_ms);
            println!("  max_parallel = {}", config.settings.max_parallel());
            println!(
                "  {} = {}",
                ENV_GITHUB_TOKEN,
                if config.settings.github_token.is_some() {
                    "set"
                } else {
                    "not set"
                }
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() && config.settings.env_warnings.is_empty() {
                println!("No waveforge.toml found. Using defaults (valid).");
                return Ok(());
            }

            let warnings = config.settings.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("waveforge.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            config.ensure_directories()?;
            WaveforgeToml::default().save(&config_path)?;

            println!("Created waveforge.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [git] trunk, remote");
            println!("  - [review] poll_interval_ms, max_poll_duration_ms");
            println!("  - [execution] max_parallel, command");
            println!("  - [github] repo, api_url");
            println!();
        }
    }

    Ok(())
}
