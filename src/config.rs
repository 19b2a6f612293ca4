use anyhow::{Context, Result, anyhow};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::ledger::FsSymbolLocator;
use crate::machine::{DeliveryMachine, MachineSettings};
use crate::services::{ChangeSetPublisher, ReviewService, Services, TaskExecutor};
use crate::services::git::GitCli;
use crate::services::github::{GitHubClient, GitHubUnavailable, parse_owner_repo_from_url};
use crate::services::shell::ShellTaskExecutor;
use crate::state::StateStore;
use crate::waveforge_config::{CONFIG_FILE, WaveforgeConfig};

/// Directory under the project holding config and pipeline state.
pub const STATE_DIR: &str = ".waveforge";

/// Runtime configuration for one invocation.
///
/// Resolves the project and state directories and turns the layered
/// settings into a ready-to-use [`DeliveryMachine`].
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub settings: WaveforgeConfig,
}

impl Config {
    pub fn new(project_dir: PathBuf, trunk: Option<&str>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let settings = WaveforgeConfig::load(&project_dir, &state_dir)?.with_trunk(trunk);

        Ok(Self {
            project_dir,
            state_dir,
            settings,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.state_dir.join("artifacts")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        Ok(())
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.state_dir)
    }

    pub fn machine_settings(&self) -> MachineSettings {
        MachineSettings {
            trunk: self.settings.trunk().to_string(),
            poll: self.settings.poll(),
            max_parallel: self.settings.max_parallel(),
            project_dir: self.project_dir.clone(),
        }
    }

    /// `owner/name` of the GitHub repository: config first, then the remote URL.
    pub fn github_repo(&self, git: &GitCli) -> Result<String> {
        if let Some(repo) = &self.settings.toml.github.repo {
            return Ok(repo.clone());
        }
        let url = git
            .remote_url()?
            .ok_or_else(|| anyhow!("Remote '{}' has no URL", self.settings.toml.git.remote))?;
        parse_owner_repo_from_url(&url).ok_or_else(|| {
            anyhow!(
                "Cannot derive owner/name from remote URL '{}'; set github.repo in {}",
                url,
                CONFIG_FILE
            )
        })
    }

    /// The live collaborators: git, GitHub and the optional task command.
    ///
    /// An unresolvable GitHub repository is not an error here; it surfaces
    /// on the first call that needs GitHub.
    pub fn live_services(&self) -> Result<Services> {
        let git = Arc::new(GitCli::new(&self.project_dir, &self.settings.toml.git.remote));
        let (review, publisher): (Arc<dyn ReviewService>, Arc<dyn ChangeSetPublisher>) =
            match self.github_repo(&git) {
                Ok(repo) => {
                    let github = Arc::new(GitHubClient::new(
                        &self.settings.toml.github.api_url,
                        &repo,
                        self.settings.github_token.clone(),
                    ));
                    (github.clone(), github)
                }
                Err(e) => {
                    debug!(error = %e, "GitHub repository not resolved");
                    let offline = Arc::new(GitHubUnavailable::new(e.to_string()));
                    (offline.clone(), offline)
                }
            };

        let executor = self
            .settings
            .toml
            .execution
            .command
            .as_deref()
            .map(|command| {
                Arc::new(ShellTaskExecutor::new(command, self.artifacts_dir()))
                    as Arc<dyn TaskExecutor>
            });

        Ok(Services {
            vcs: git,
            review,
            publisher,
            executor,
            locator: Arc::new(FsSymbolLocator::new(&self.project_dir)),
        })
    }

    pub fn machine(&self, services: Services) -> DeliveryMachine {
        DeliveryMachine::new(self.store(), services, self.machine_settings())
    }

    /// Pick the pipeline to act on: the given id, or the only one there is.
    pub fn resolve_pipeline(&self, requested: Option<&str>) -> Result<String> {
        if let Some(id) = requested {
            return Ok(id.to_string());
        }
        let ids = self.store().list()?;
        match ids.as_slice() {
            [only] => Ok(only.clone()),
            [] => Err(anyhow!(
                "No pipelines found in {}. Run 'waveforge init' first.",
                self.state_dir.display()
            )),
            _ => Err(anyhow!(
                "Several pipelines exist ({}); pass --pipeline",
                ids.join(", ")
            )),
        }
    }
}
