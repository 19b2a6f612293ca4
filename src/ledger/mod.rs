//! Artifact ledger: verifiable facts published by passed tasks.
//!
//! Records live on the tasks of the pipeline's [`TaskBook`]; the ledger
//! enforces write-once semantics and combines the recorded facts with a live
//! look at the codebase before a dependent task may start.

mod locator;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::LedgerError;
use crate::task::{Task, TaskArtifacts, TaskBook, TaskStatus};

pub use locator::{FsSymbolLocator, SymbolLocator};

/// Result of checking expected symbols against recorded and live facts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub verified: Vec<String>,
    pub missing: Vec<String>,
    /// Recorded files that no longer exist on disk
    pub missing_files: Vec<String>,
}

impl Verification {
    pub fn is_satisfied(&self) -> bool {
        self.missing.is_empty() && self.missing_files.is_empty()
    }

    /// One-line description of what is missing.
    pub fn describe_failure(&self) -> String {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing symbols: {}", self.missing.join(", ")));
        }
        if !self.missing_files.is_empty() {
            parts.push(format!("missing files: {}", self.missing_files.join(", ")));
        }
        parts.join("; ")
    }
}

#[derive(Clone)]
pub struct ArtifactLedger {
    project_dir: PathBuf,
    locator: Arc<dyn SymbolLocator>,
}

impl ArtifactLedger {
    pub fn new(project_dir: impl Into<PathBuf>, locator: Arc<dyn SymbolLocator>) -> Self {
        Self {
            project_dir: project_dir.into(),
            locator,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Record the artifacts of a passed task.
    ///
    /// Recording an identical set twice is a no-op.
    pub fn record(
        book: &mut TaskBook,
        task_id: &str,
        artifacts: TaskArtifacts,
    ) -> Result<(), LedgerError> {
        let task = book.get_mut(task_id).ok_or_else(|| LedgerError::UnknownTask {
            task: task_id.to_string(),
        })?;

        if task.status != TaskStatus::Pass {
            return Err(LedgerError::NotPassed {
                task: task_id.to_string(),
                status: task.status.to_string(),
            });
        }

        match &task.artifacts {
            Some(existing) if *existing == artifacts => {
                debug!(task = task_id, "Artifacts already recorded");
                Ok(())
            }
            Some(existing) if !existing.is_empty() => Err(LedgerError::DuplicateArtifact {
                task: task_id.to_string(),
            }),
            _ => {
                task.artifacts = Some(artifacts);
                Ok(())
            }
        }
    }

    pub fn query<'b>(book: &'b TaskBook, task_id: &str) -> Result<&'b TaskArtifacts, LedgerError> {
        let task = book.get(task_id).ok_or_else(|| LedgerError::UnknownTask {
            task: task_id.to_string(),
        })?;
        task.artifacts.as_ref().ok_or_else(|| LedgerError::NotFound {
            task: task_id.to_string(),
        })
    }

    /// Check expected symbols against one task's record and the live codebase.
    pub fn verify(
        &self,
        book: &TaskBook,
        task_id: &str,
        expected_symbols: &[String],
    ) -> Result<Verification, LedgerError> {
        let record = Self::query(book, task_id)?;
        let mut result = Verification::default();

        for symbol in expected_symbols {
            let recorded = record.exports_added.iter().any(|s| s == symbol);
            if recorded && self.locator.locate(symbol) {
                result.verified.push(symbol.clone());
            } else {
                result.missing.push(symbol.clone());
            }
        }

        result.missing_files = self.missing_files(record);
        Ok(result)
    }

    /// Verify the expected symbols of `task` against all its predecessors.
    ///
    /// A symbol counts as provided when any predecessor verifies it.
    pub fn verify_dependencies(
        &self,
        book: &TaskBook,
        task: &Task,
    ) -> Result<Verification, LedgerError> {
        let mut verified: BTreeSet<String> = BTreeSet::new();
        let mut missing_files: BTreeSet<String> = BTreeSet::new();

        for dep in &task.depends_on {
            let check = match self.verify(book, dep, &task.expected_symbols) {
                Ok(check) => check,
                // A predecessor completed without a record provides nothing.
                Err(LedgerError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            verified.extend(check.verified);
            missing_files.extend(check.missing_files);
        }

        let missing: Vec<String> = task
            .expected_symbols
            .iter()
            .filter(|s| !verified.contains(*s))
            .cloned()
            .collect();

        if !missing.is_empty() {
            warn!(task = %task.id, missing = ?missing, "Predecessor artifacts incomplete");
        }

        Ok(Verification {
            verified: task
                .expected_symbols
                .iter()
                .filter(|s| verified.contains(*s))
                .cloned()
                .collect(),
            missing,
            missing_files: missing_files.into_iter().collect(),
        })
    }

    fn missing_files(&self, record: &TaskArtifacts) -> Vec<String> {
        record
            .claimed_files()
            .filter(|f| !self.project_dir.join(f).exists())
            .map(String::from)
            .collect()
    }
}
