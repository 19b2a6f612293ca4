use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "waveforge")]
#[command(
    version,
    about = "Deliver dependent tasks in waves through branch, review and merge"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Trunk branch integration branches are cut from. Overrides waveforge.toml.
    #[arg(long, global = true)]
    pub trunk: Option<String>,

    /// Pipeline to act on (defaults to the only one)
    #[arg(short, long, global = true)]
    pub pipeline: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Partition a task file into waves without creating a pipeline
    Plan {
        /// Task file (JSON list, or an object with a `tasks` key)
        tasks: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Create a pipeline for a spec from a task file
    Init {
        /// Spec identifier, e.g. "2024-01-15-user-auth"
        spec: String,
        #[arg(short, long)]
        tasks: PathBuf,
        /// Pipeline id (defaults to the normalized spec id)
        #[arg(long)]
        id: Option<String>,
    },
    /// Advance the pipeline by one step
    Advance {
        /// Keep stepping while progress is made
        #[arg(long)]
        until_blocked: bool,
    },
    /// Poll the review system until a decision or the budget runs out
    Poll,
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Start the current wave over
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// Force a damaged state document into a known phase
    Recover {
        /// EXECUTE, AWAITING_REVIEW or READY_TO_MERGE
        #[arg(long)]
        phase: String,
    },
    /// Record task outcomes of the current wave
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    Review {
        #[command(subcommand)]
        command: ReviewCommands,
    },
    /// Inspect and clean up wave branches
    Branch {
        #[command(subcommand)]
        command: BranchCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    /// Mark a task passed
    Complete {
        id: String,
        /// JSON file with files_created, files_modified, exports_added, test_files
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },
    /// Mark a task blocked; the next advance fails the pipeline
    Block {
        id: String,
        #[arg(long)]
        reason: String,
    },
    /// Check a task's recorded artifacts against the codebase
    Verify {
        id: String,
        /// Symbols to check (defaults to everything the task exported)
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ReviewCommands {
    /// Mark outstanding review feedback as addressed
    Resolved,
}

#[derive(Subcommand, Clone)]
pub enum BranchCommands {
    /// Show the branch a branch merges into
    Target { branch: String },
    /// Delete a merged wave branch locally and on the remote
    Cleanup {
        branch: String,
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default waveforge.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    waveforge::logging::init_logging(cli.verbose, cli.json_logs)?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Plan { tasks, json } => cmd::cmd_plan(tasks, *json)?,
        Commands::Init { spec, tasks, id } => {
            cmd::cmd_init(&project_dir, &cli, spec, tasks, id.as_deref())?
        }
        Commands::Advance { until_blocked } => {
            cmd::cmd_advance(&project_dir, &cli, *until_blocked).await?
        }
        Commands::Poll => cmd::cmd_poll(&project_dir, &cli).await?,
        Commands::Status { json } => cmd::cmd_status(&project_dir, &cli, *json)?,
        Commands::Reset { force } => cmd::cmd_reset(&project_dir, &cli, *force).await?,
        Commands::Recover { phase } => cmd::cmd_recover(&project_dir, &cli, phase)?,
        Commands::Task { command } => cmd::cmd_task(&project_dir, &cli, command.clone())?,
        Commands::Review { command } => cmd::cmd_review(&project_dir, &cli, command.clone())?,
        Commands::Branch { command } => {
            cmd::cmd_branch(&project_dir, &cli, command.clone()).await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, &cli, command.clone())?,
    }

    Ok(())
}
