//! Task definitions and the persisted task book.
//!
//! This module provides:
//! - `Task`, one unit of work with its dependencies and touched resources
//! - `TaskArtifacts`, what a passed task produced
//! - `TaskBook`, the task graph of one pipeline instance as stored in `tasks.json`
//!
//! Input task files may be JSON or YAML, either a bare list of tasks or an
//! object with a `tasks` key.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::atomic;
use crate::errors::{PlanError, StoreError};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started yet
    #[default]
    Pending,
    /// Dispatched to a worker
    InProgress,
    /// Completed and verified
    Pass,
    /// Cannot reach pass without operator intervention
    Blocked,
}

impl TaskStatus {
    /// Check if the task has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Pass | Self::Blocked)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Pass => write!(f, "pass"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Files and symbols a passed task produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskArtifacts {
    #[serde(default, alias = "filesCreated")]
    pub files_created: Vec<String>,
    #[serde(default, alias = "filesModified")]
    pub files_modified: Vec<String>,
    #[serde(default, alias = "exportsAdded")]
    pub exports_added: Vec<String>,
    #[serde(default, alias = "testFiles")]
    pub test_files: Vec<String>,
}

impl TaskArtifacts {
    pub fn is_empty(&self) -> bool {
        self.files_created.is_empty()
            && self.files_modified.is_empty()
            && self.exports_added.is_empty()
            && self.test_files.is_empty()
    }

    /// All files the record claims exist (created, modified and test files).
    pub fn claimed_files(&self) -> impl Iterator<Item = &str> {
        self.files_created
            .iter()
            .chain(&self.files_modified)
            .chain(&self.test_files)
            .map(String::as_str)
    }
}

/// A unit of work in the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier (e.g., "1", "auth-api")
    pub id: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Tasks that must pass before this one may start
    #[serde(default, alias = "dependsOn")]
    pub depends_on: BTreeSet<String>,
    /// Files or modules this task expects to modify (advisory)
    #[serde(default, alias = "touchedResources")]
    pub touched_resources: BTreeSet<String>,
    /// Symbols this task expects its predecessors to have exported
    #[serde(default, alias = "expectedSymbols")]
    pub expected_symbols: Vec<String>,
    /// Populated only once the task passes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<TaskArtifacts>,
    /// Why the task is blocked
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "lastError")]
    pub last_error: Option<String>,
}

impl Task {
    /// Create a pending task with the given dependencies.
    pub fn new(id: &str, description: &str, depends_on: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            touched_resources: BTreeSet::new(),
            expected_symbols: Vec::new(),
            artifacts: None,
            last_error: None,
        }
    }

    /// Builder-style helper to declare touched resources.
    pub fn touching(mut self, resources: &[&str]) -> Self {
        self.touched_resources = resources.iter().map(|r| r.to_string()).collect();
        self
    }

    /// Builder-style helper to declare expected predecessor symbols.
    pub fn expecting(mut self, symbols: &[&str]) -> Self {
        self.expected_symbols = symbols.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskInput {
    List(Vec<Task>),
    File { tasks: Vec<Task> },
}

/// The task graph of one pipeline instance with live status bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBook {
    /// SHA-256 of the task file the plan was built from
    pub source_hash: String,
    pub tasks: Vec<Task>,
}

impl TaskBook {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            source_hash: String::new(),
            tasks,
        }
    }

    /// Read a planning input file (JSON or YAML, chosen by extension).
    pub fn from_input(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

        let input: TaskInput = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| PlanError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| PlanError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        };

        let tasks = match input {
            TaskInput::List(tasks) | TaskInput::File { tasks } => tasks,
        };

        Ok(Self {
            source_hash: hash_content(&content),
            tasks,
        })
    }

    /// Load the persisted task book.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let bytes = std::fs::read(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Persist the task book atomically.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(self).map_err(StoreError::Serialize)?;
        atomic::write_atomic(path, &bytes).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Check if every listed task has passed.
    pub fn all_pass<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> bool {
        ids.into_iter()
            .all(|id| self.get(id).is_some_and(|t| t.status == TaskStatus::Pass))
    }

    /// First blocked task among the listed ids.
    pub fn first_blocked<'a>(&self, ids: impl IntoIterator<Item = &'a String>) -> Option<&Task> {
        ids.into_iter()
            .filter_map(|id| self.get(id))
            .find(|t| t.status == TaskStatus::Blocked)
    }

    /// Mark a task blocked with a reason.
    pub fn block(&mut self, id: &str, reason: &str) -> bool {
        match self.get_mut(id) {
            Some(task) => {
                task.status = TaskStatus::Blocked;
                task.last_error = Some(reason.to_string());
                true
            }
            None => false,
        }
    }

    /// Reset blocked and in-progress tasks among `ids` back to pending.
    ///
    /// Passed tasks keep their status and artifacts.
    pub fn unblock<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) -> Vec<String> {
        let mut reset = Vec::new();
        for id in ids {
            if let Some(task) = self.get_mut(id)
                && matches!(task.status, TaskStatus::Blocked | TaskStatus::InProgress)
            {
                task.status = TaskStatus::Pending;
                task.last_error = None;
                reset.push(id.clone());
            }
        }
        reset
    }
}

fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_task_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert!(TaskStatus::Pass.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn test_from_input_json_list_with_camel_case_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(
            &path,
            r#"[
                {"id": "1", "description": "schema"},
                {"id": "2", "dependsOn": ["1"], "touchedResources": ["src/db.rs"]}
            ]"#,
        )
        .unwrap();

        let book = TaskBook::from_input(&path).unwrap();
        assert_eq!(book.tasks.len(), 2);
        assert!(book.tasks[1].depends_on.contains("1"));
        assert!(book.tasks[1].touched_resources.contains("src/db.rs"));
        assert_eq!(book.tasks[1].status, TaskStatus::Pending);
        assert_eq!(book.source_hash.len(), 64);
    }

    #[test]
    fn test_from_input_yaml_object() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");
        fs::write(
            &path,
            "tasks:\n  - id: a\n    description: first\n  - id: b\n    depends_on: [a]\n",
        )
        .unwrap();

        let book = TaskBook::from_input(&path).unwrap();
        assert_eq!(book.tasks.len(), 2);
        assert_eq!(book.get("b").unwrap().depends_on.len(), 1);
    }

    #[test]
    fn test_from_input_parse_error_carries_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, "{not json").unwrap();

        let err = TaskBook::from_input(&path).unwrap_err();
        assert!(matches!(err, PlanError::Parse { .. }));
        assert!(err.to_string().contains("tasks.json"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let book = TaskBook::new(vec![Task::new("1", "one", &[]), Task::new("2", "two", &["1"])]);

        book.save(&path).unwrap();
        let loaded = TaskBook::load(&path).unwrap();
        assert_eq!(loaded, book);
    }

    #[test]
    fn test_block_and_unblock_keep_passed_tasks() {
        let mut book = TaskBook::new(vec![Task::new("1", "", &[]), Task::new("2", "", &[])]);
        book.get_mut("1").unwrap().status = TaskStatus::Pass;
        assert!(book.block("2", "tests failed"));
        assert_eq!(book.get("2").unwrap().last_error.as_deref(), Some("tests failed"));

        let ids = vec!["1".to_string(), "2".to_string()];
        assert_eq!(book.first_blocked(&ids).unwrap().id, "2");

        let reset = book.unblock(&ids);
        assert_eq!(reset, vec!["2".to_string()]);
        assert_eq!(book.get("1").unwrap().status, TaskStatus::Pass);
        assert_eq!(book.get("2").unwrap().status, TaskStatus::Pending);
        assert!(book.get("2").unwrap().last_error.is_none());
    }

    #[test]
    fn test_all_pass() {
        let mut book = TaskBook::new(vec![Task::new("1", "", &[]), Task::new("2", "", &[])]);
        let ids = vec!["1".to_string(), "2".to_string()];
        assert!(!book.all_pass(&ids));
        book.get_mut("1").unwrap().status = TaskStatus::Pass;
        book.get_mut("2").unwrap().status = TaskStatus::Pass;
        assert!(book.all_pass(&ids));
        assert!(!book.all_pass(&["missing".to_string()]));
    }
}
