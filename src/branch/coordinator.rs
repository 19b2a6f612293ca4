use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::branch::names::{BRANCH_PREFIX, BranchNames};
use crate::errors::BranchError;
use crate::services::{BranchScope, VersionControlService};

/// What `setup` found and did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupReport {
    pub integration_branch: String,
    pub wave_branch: String,
    pub actions_taken: Vec<String>,
}

/// What `cleanup` removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub branch: String,
    pub deleted_local: bool,
    pub deleted_remote: bool,
    pub warnings: Vec<String>,
}

/// Enforces the trunk → integration → wave branching discipline.
pub struct BranchCoordinator {
    vcs: Arc<dyn VersionControlService>,
    trunk: String,
}

impl BranchCoordinator {
    pub fn new(vcs: Arc<dyn VersionControlService>, trunk: &str) -> Self {
        Self {
            vcs,
            trunk: trunk.to_string(),
        }
    }

    pub fn trunk(&self) -> &str {
        &self.trunk
    }

    /// Ensure the integration and wave branches exist locally and remotely,
    /// and check out the wave branch.
    ///
    /// Safe to repeat: existing branches are left alone.
    pub async fn setup(&self, spec: &str, wave: u32) -> Result<SetupReport, BranchError> {
        let names = BranchNames::new(spec)?;
        let integration = names.integration();
        let wave_branch = names.wave(wave);
        let mut actions = Vec::new();

        self.ensure(&integration, &self.trunk, &mut actions).await?;
        // Wave branches always start from the integration branch, never trunk.
        self.ensure(&wave_branch, &integration, &mut actions).await?;

        if self.vcs.current_branch().await? != wave_branch {
            self.vcs.checkout(&wave_branch).await?;
            actions.push(format!("checked out {}", wave_branch));
        }

        info!(
            integration = %integration,
            wave_branch = %wave_branch,
            actions = actions.len(),
            "Branches ready"
        );

        Ok(SetupReport {
            integration_branch: integration,
            wave_branch,
            actions_taken: actions,
        })
    }

    async fn ensure(
        &self,
        branch: &str,
        from: &str,
        actions: &mut Vec<String>,
    ) -> Result<(), BranchError> {
        let local = self.vcs.branch_exists(branch, BranchScope::Local).await?;
        let remote = self.vcs.branch_exists(branch, BranchScope::Remote).await?;

        if !local {
            // A remote copy wins over a fresh start point.
            let start = if remote { branch } else { from };
            self.vcs.create_branch(branch, start).await?;
            actions.push(format!("created {} from {}", branch, start));
        }
        if !remote {
            self.vcs.push(branch).await?;
            actions.push(format!("pushed {}", branch));
        }
        Ok(())
    }

    /// Where a change-set from `branch` must merge into.
    pub fn resolve_merge_target(&self, branch: &str) -> Result<String, BranchError> {
        if let Some((spec, _)) = BranchNames::parse_wave(branch) {
            return Ok(format!("{}{}", BRANCH_PREFIX, spec));
        }
        if BranchNames::is_integration(branch) {
            return Ok(self.trunk.clone());
        }
        Err(BranchError::UnknownBranch {
            branch: branch.to_string(),
        })
    }

    /// Delete a merged branch locally and remotely.
    pub async fn cleanup(&self, branch: &str) -> Result<CleanupReport, BranchError> {
        if branch == self.trunk {
            return Err(BranchError::Protected {
                branch: branch.to_string(),
                reason: "it is the trunk".to_string(),
            });
        }
        if self.vcs.current_branch().await? == branch {
            return Err(BranchError::Protected {
                branch: branch.to_string(),
                reason: "it is currently checked out".to_string(),
            });
        }

        let mut report = CleanupReport {
            branch: branch.to_string(),
            ..Default::default()
        };

        if BranchNames::parse_wave(branch).is_none() {
            let warning = format!("{} does not look like a wave branch", branch);
            warn!(branch, "Cleaning up a branch that does not look like a wave branch");
            report.warnings.push(warning);
        }

        if self.vcs.branch_exists(branch, BranchScope::Local).await? {
            self.vcs.delete_branch(branch, BranchScope::Local).await?;
            report.deleted_local = true;
        }
        if self.vcs.branch_exists(branch, BranchScope::Remote).await? {
            self.vcs.delete_branch(branch, BranchScope::Remote).await?;
            report.deleted_remote = true;
        }

        info!(
            branch,
            local = report.deleted_local,
            remote = report.deleted_remote,
            "Cleaned up branch"
        );
        Ok(report)
    }
}
