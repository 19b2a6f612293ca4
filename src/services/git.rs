//! Version control via git2 for local refs and the git CLI for the remote.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use git2::{BranchType, Repository};
use tracing::debug;

use crate::errors::ServiceError;
use crate::services::{BranchScope, VersionControlService};

pub struct GitCli {
    repo_dir: PathBuf,
    remote: String,
}

impl GitCli {
    pub fn new(repo_dir: impl Into<PathBuf>, remote: &str) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            remote: remote.to_string(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    fn open(&self) -> Result<Repository, ServiceError> {
        Ok(Repository::open(&self.repo_dir)?)
    }

    /// URL of the configured remote, if any.
    pub fn remote_url(&self) -> Result<Option<String>, ServiceError> {
        let repo = self.open()?;
        let url = match repo.find_remote(&self.remote) {
            Ok(remote) => remote.url().map(String::from),
            Err(_) => None,
        };
        Ok(url)
    }

    async fn git(&self, args: &[&str]) -> Result<String, ServiceError> {
        debug!(args = ?args, "Running git");
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ServiceError::Spawn {
                program: "git".into(),
                source,
            })?;

        if !output.status.success() {
            return Err(ServiceError::Command {
                program: "git".into(),
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn local_exists(&self, name: &str) -> Result<bool, ServiceError> {
        let repo = self.open()?;
        Ok(repo.find_branch(name, BranchType::Local).is_ok())
    }

    async fn remote_exists(&self, name: &str) -> Result<bool, ServiceError> {
        let out = self
            .git(&["ls-remote", "--heads", &self.remote, name])
            .await?;
        let target = format!("refs/heads/{}", name);
        Ok(out
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(target.as_str())))
    }
}

#[async_trait]
impl VersionControlService for GitCli {
    async fn create_branch(&self, name: &str, from: &str) -> Result<(), ServiceError> {
        // Pick up merges that happened on the remote since the last fetch.
        if self.remote_exists(from).await.unwrap_or(false) {
            self.git(&["fetch", &self.remote, from]).await?;
        }

        let repo = self.open()?;
        let remote_ref = format!("refs/remotes/{}/{}", self.remote, from);
        let local_ref = format!("refs/heads/{}", from);
        let start = repo
            .find_reference(&remote_ref)
            .or_else(|_| repo.find_reference(&local_ref))?;
        let commit = start.peel_to_commit()?;
        repo.branch(name, &commit, false)?;
        debug!(branch = name, from, commit = %commit.id(), "Created branch");
        Ok(())
    }

    async fn branch_exists(&self, name: &str, scope: BranchScope) -> Result<bool, ServiceError> {
        match scope {
            BranchScope::Local => self.local_exists(name),
            BranchScope::Remote => self.remote_exists(name).await,
            BranchScope::Any => {
                if self.local_exists(name)? {
                    Ok(true)
                } else {
                    self.remote_exists(name).await
                }
            }
        }
    }

    async fn checkout(&self, name: &str) -> Result<(), ServiceError> {
        self.git(&["checkout", name]).await.map(|_| ())
    }

    async fn push(&self, branch: &str) -> Result<(), ServiceError> {
        self.git(&["push", "-u", &self.remote, branch])
            .await
            .map(|_| ())
    }

    async fn delete_branch(&self, name: &str, scope: BranchScope) -> Result<(), ServiceError> {
        if matches!(scope, BranchScope::Local | BranchScope::Any) && self.local_exists(name)? {
            let repo = self.open()?;
            let mut branch = repo.find_branch(name, BranchType::Local)?;
            branch.delete()?;
        }
        if matches!(scope, BranchScope::Remote | BranchScope::Any)
            && self.remote_exists(name).await?
        {
            self.git(&["push", &self.remote, "--delete", name]).await?;
        }
        Ok(())
    }

    async fn current_branch(&self) -> Result<String, ServiceError> {
        let repo = self.open()?;
        let head = repo.head()?;
        head.shorthand()
            .map(String::from)
            .ok_or_else(|| ServiceError::Other("HEAD is not a named branch".into()))
    }
}
