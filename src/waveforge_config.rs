//! Project configuration read from `.waveforge/waveforge.toml`.
//!
//! Settings are layered file → environment → CLI. Every key is optional;
//! a missing file means all defaults.
//!
//! # Configuration File Format
//!
//! ```toml
//! [git]
//! trunk = "main"
//! remote = "origin"
//!
//! [review]
//! poll_interval_ms = 120000
//! max_poll_duration_ms = 1800000
//!
//! [execution]
//! max_parallel = 4
//! command = "scripts/run-task.sh"
//!
//! [github]
//! repo = "owner/name"
//! api_url = "https://api.github.com"
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::review::PollConfig;
use crate::services::github::DEFAULT_API_URL;

pub const CONFIG_FILE: &str = "waveforge.toml";

pub const ENV_TRUNK: &str = "WAVEFORGE_TRUNK";
pub const ENV_POLL_INTERVAL: &str = "WAVEFORGE_POLL_INTERVAL_MS";
pub const ENV_MAX_POLL_DURATION: &str = "WAVEFORGE_MAX_POLL_DURATION_MS";
pub const ENV_GITHUB_TOKEN: &str = "GITHUB_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSection {
    /// Branch integration branches are cut from
    #[serde(default = "default_trunk")]
    pub trunk: String,
    #[serde(default = "default_remote")]
    pub remote: String,
}

fn default_trunk() -> String {
    "main".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

impl Default for GitSection {
    fn default() -> Self {
        Self {
            trunk: default_trunk(),
            remote: default_remote(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Tasks of one wave dispatched at once
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Shell command run per task; tasks are completed by hand when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

fn default_max_parallel() -> usize {
    4
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitHubSection {
    /// `owner/name`; derived from the remote URL when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            repo: None,
            api_url: default_api_url(),
        }
    }
}

/// Root of `waveforge.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveforgeToml {
    #[serde(default)]
    pub git: GitSection,
    #[serde(default)]
    pub review: PollConfig,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub github: GitHubSection,
}

impl WaveforgeToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse `waveforge.toml`; a zero poll interval is rejected.
    pub fn parse(content: &str) -> Result<Self> {
        let toml: Self = toml::from_str(content).context("Failed to parse waveforge.toml")?;
        if toml.review.poll_interval_ms == 0 {
            bail!("review.poll_interval_ms must be greater than 0");
        }
        Ok(toml)
    }

    /// Load `<state_dir>/waveforge.toml`, or defaults if it does not exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize waveforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides through `lookup`.
    ///
    /// Unparseable numeric values and a zero poll interval are ignored and
    /// reported as warnings.
    pub fn apply_env<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();

        if let Some(trunk) = lookup(ENV_TRUNK).filter(|v| !v.trim().is_empty()) {
            self.git.trunk = trunk.trim().to_string();
        }
        for (key, slot) in [
            (ENV_POLL_INTERVAL, &mut self.review.poll_interval_ms),
            (ENV_MAX_POLL_DURATION, &mut self.review.max_poll_duration_ms),
        ] {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse::<u64>() {
                    Ok(0) if key == ENV_POLL_INTERVAL => warnings.push(format!(
                        "Ignoring {}='{}': must be greater than 0",
                        key, raw
                    )),
                    Ok(value) => *slot = value,
                    Err(_) => warnings.push(format!("Ignoring {}='{}': not a number", key, raw)),
                }
            }
        }

        warnings
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.git.trunk.trim().is_empty() {
            warnings.push("git.trunk is empty".to_string());
        }
        if self.review.max_poll_duration_ms < self.review.poll_interval_ms {
            warnings.push(format!(
                "review.max_poll_duration_ms ({}) is shorter than poll_interval_ms ({}): only one poll fits",
                self.review.max_poll_duration_ms, self.review.poll_interval_ms
            ));
        }
        if self.execution.max_parallel == 0 {
            warnings.push("execution.max_parallel is 0; 1 will be used".to_string());
        }
        if let Some(repo) = &self.github.repo
            && repo.split('/').filter(|part| !part.is_empty()).count() != 2
        {
            warnings.push(format!("github.repo '{}' is not of the form owner/name", repo));
        }
        if !self.github.api_url.starts_with("http://") && !self.github.api_url.starts_with("https://")
        {
            warnings.push(format!(
                "github.api_url '{}' is not an http(s) URL",
                self.github.api_url
            ));
        }

        warnings
    }
}

/// Effective configuration: file, then environment, then CLI.
#[derive(Debug, Clone)]
pub struct WaveforgeConfig {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub toml: WaveforgeToml,
    /// `GITHUB_TOKEN`, also read from a `.env` file in the project
    pub github_token: Option<String>,
    /// Warnings from environment parsing
    pub env_warnings: Vec<String>,
}

impl WaveforgeConfig {
    pub fn load(project_dir: &Path, state_dir: &Path) -> Result<Self> {
        // A .env next to the project is optional
        let _ = dotenvy::from_path(project_dir.join(".env"));

        let mut toml = WaveforgeToml::load_or_default(state_dir)?;
        let env_warnings = toml.apply_env(|key| std::env::var(key).ok());
        let github_token = std::env::var(ENV_GITHUB_TOKEN)
            .ok()
            .filter(|t| !t.trim().is_empty());

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            state_dir: state_dir.to_path_buf(),
            toml,
            github_token,
            env_warnings,
        })
    }

    /// Apply a `--trunk` style CLI override.
    pub fn with_trunk(mut self, trunk: Option<&str>) -> Self {
        if let Some(trunk) = trunk {
            self.toml.git.trunk = trunk.to_string();
        }
        self
    }

    pub fn trunk(&self) -> &str {
        &self.toml.git.trunk
    }

    pub fn poll(&self) -> PollConfig {
        self.toml.review
    }

    pub fn max_parallel(&self) -> usize {
        self.toml.execution.max_parallel.max(1)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.env_warnings.clone();
        warnings.extend(self.toml.validate());
        warnings
    }
}
