//! Durable storage for state documents and task books.
//!
//! Layout under the state directory:
//!
//! ```text
//! pipelines/<pipeline_id>/state.json
//! pipelines/<pipeline_id>/tasks.json
//! pipelines/<pipeline_id>/state.lock
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use crate::atomic;
use crate::errors::StoreError;
use crate::state::document::PipelineState;
use crate::state::lock::StateLock;
use crate::task::TaskBook;

const STATE_FILE: &str = "state.json";
const TASKS_FILE: &str = "tasks.json";
const LOCK_FILE: &str = "state.lock";

/// Reads and writes the documents of every pipeline under one state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pipeline_dir(&self, pipeline_id: &str) -> PathBuf {
        self.root.join("pipelines").join(pipeline_id)
    }

    pub fn state_path(&self, pipeline_id: &str) -> PathBuf {
        self.pipeline_dir(pipeline_id).join(STATE_FILE)
    }

    pub fn tasks_path(&self, pipeline_id: &str) -> PathBuf {
        self.pipeline_dir(pipeline_id).join(TASKS_FILE)
    }

    pub fn lock_path(&self, pipeline_id: &str) -> PathBuf {
        self.pipeline_dir(pipeline_id).join(LOCK_FILE)
    }

    pub fn exists(&self, pipeline_id: &str) -> bool {
        self.state_path(pipeline_id).exists()
    }

    /// Take the exclusive invocation lock of a pipeline.
    pub fn lock(&self, pipeline_id: &str) -> Result<StateLock, StoreError> {
        check_pipeline_id(pipeline_id)?;
        StateLock::acquire(pipeline_id, &self.lock_path(pipeline_id))
    }

    /// Load and validate a state document.
    pub fn load(&self, pipeline_id: &str) -> Result<PipelineState, StoreError> {
        let doc = self.load_unchecked(pipeline_id)?;
        doc.validate().map_err(|violations| StoreError::Invalid {
            pipeline: pipeline_id.to_string(),
            violations,
        })?;
        Ok(doc)
    }

    /// Load a state document without checking invariants.
    ///
    /// Only the recovery path uses this; everything else goes through `load`.
    pub fn load_unchecked(&self, pipeline_id: &str) -> Result<PipelineState, StoreError> {
        check_pipeline_id(pipeline_id)?;
        let path = self.state_path(pipeline_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    pipeline: pipeline_id.to_string(),
                });
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })
    }

    /// Validate, timestamp and atomically persist a state document.
    ///
    /// A document that fails validation leaves the file on disk untouched.
    pub fn save(&self, pipeline_id: &str, doc: &mut PipelineState) -> Result<(), StoreError> {
        check_pipeline_id(pipeline_id)?;
        doc.validate().map_err(|violations| StoreError::Invalid {
            pipeline: pipeline_id.to_string(),
            violations,
        })?;

        let previous = doc.updated_at;
        doc.updated_at = Utc::now();
        let path = self.state_path(pipeline_id);
        let bytes = match serde_json::to_vec_pretty(doc) {
            Ok(bytes) => bytes,
            Err(e) => {
                doc.updated_at = previous;
                return Err(StoreError::Serialize(e));
            }
        };

        if let Err(source) = atomic::write_atomic(&path, &bytes) {
            doc.updated_at = previous;
            return Err(StoreError::Io { path, source });
        }

        debug!(pipeline = pipeline_id, phase = %doc.phase, wave = doc.current_wave, "Saved state document");
        Ok(())
    }

    pub fn load_tasks(&self, pipeline_id: &str) -> Result<TaskBook, StoreError> {
        check_pipeline_id(pipeline_id)?;
        let path = self.tasks_path(pipeline_id);
        if !path.exists() {
            return Err(StoreError::NotFound {
                pipeline: pipeline_id.to_string(),
            });
        }
        TaskBook::load(&path)
    }

    pub fn save_tasks(&self, pipeline_id: &str, book: &TaskBook) -> Result<(), StoreError> {
        check_pipeline_id(pipeline_id)?;
        book.save(&self.tasks_path(pipeline_id))
    }

    /// Ids of every pipeline with a state document, sorted.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join("pipelines");
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(STATE_FILE).exists())
            .filter_map(|entry| entry.file_name().to_str().map(String::from))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Pipeline ids become directory names; reject anything that could escape.
fn check_pipeline_id(pipeline_id: &str) -> Result<(), StoreError> {
    let ok = !pipeline_id.is_empty()
        && !pipeline_id.starts_with('.')
        && pipeline_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::Invalid {
            pipeline: pipeline_id.to_string(),
            violations: vec![format!("'{}' is not a valid pipeline id", pipeline_id)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Wave;
    use crate::state::document::{HistoryEntry, Phase};
    use crate::task::Task;
    use tempfile::tempdir;

    fn plan() -> Vec<Wave> {
        vec![
            Wave {
                number: 1,
                tasks: vec!["1".into(), "2".into()],
                rationale: "2 tasks with no dependencies".into(),
                conflicts: Vec::new(),
            },
            Wave {
                number: 2,
                tasks: vec!["3".into()],
                rationale: "1 task whose dependencies complete in wave(s) 1".into(),
                conflicts: Vec::new(),
            },
        ]
    }

    fn without_timestamp(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes)
            .lines()
            .filter(|line| !line.trim_start().starts_with("\"updated_at\""))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let err = store.load("auth").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { pipeline } if pipeline == "auth"));
    }

    #[test]
    fn test_save_then_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut doc = PipelineState::new("auth", "auth", plan());

        store.save("auth", &mut doc).unwrap();
        let loaded = store.load("auth").unwrap();

        assert_eq!(loaded, doc);
        assert!(store.exists("auth"));
        assert_eq!(store.list().unwrap(), vec!["auth".to_string()]);
    }

    #[test]
    fn test_load_save_is_idempotent_apart_from_timestamp() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut doc = PipelineState::new("auth", "auth", plan());
        doc.phase = Phase::Execute;
        doc.integration_branch = Some("feature/auth".into());
        doc.wave_branch = Some("feature/auth-wave-2".into());
        doc.current_wave = 2;
        doc.history.push(HistoryEntry {
            wave: 1,
            pull_request_ref: "12".into(),
            merged_at: Utc::now(),
            review_cycles: 1,
        });
        store.save("auth", &mut doc).unwrap();
        let first = fs::read(store.state_path("auth")).unwrap();

        let mut reloaded = store.load("auth").unwrap();
        store.save("auth", &mut reloaded).unwrap();
        let second = fs::read(store.state_path("auth")).unwrap();

        assert_eq!(without_timestamp(&first), without_timestamp(&second));
    }

    #[test]
    fn test_invalid_document_is_rejected_and_disk_unchanged() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut doc = PipelineState::new("auth", "auth", plan());
        store.save("auth", &mut doc).unwrap();
        let before = fs::read(store.state_path("auth")).unwrap();

        doc.current_wave = 9;
        let err = store.save("auth", &mut doc).unwrap_err();

        assert!(matches!(err, StoreError::Invalid { .. }));
        assert_eq!(fs::read(store.state_path("auth")).unwrap(), before);
    }

    #[test]
    fn test_load_rejects_document_violating_invariants() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut doc = PipelineState::new("auth", "auth", plan());
        store.save("auth", &mut doc).unwrap();

        // Edit the file behind the store's back.
        doc.phase = Phase::AwaitingReview;
        let bytes = serde_json::to_vec_pretty(&doc).unwrap();
        fs::write(store.state_path("auth"), bytes).unwrap();

        assert!(matches!(store.load("auth"), Err(StoreError::Invalid { .. })));
        let unchecked = store.load_unchecked("auth").unwrap();
        assert_eq!(unchecked.phase, Phase::AwaitingReview);
    }

    #[test]
    fn test_corrupt_json_is_reported() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::create_dir_all(store.pipeline_dir("auth")).unwrap();
        fs::write(store.state_path("auth"), "{\"schema_version\": 1,").unwrap();

        assert!(matches!(store.load("auth"), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_interrupted_save_keeps_previous_document() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut doc = PipelineState::new("auth", "auth", plan());
        store.save("auth", &mut doc).unwrap();

        // A crash after writing the temp file but before the rename.
        let path = store.state_path("auth");
        atomic::write_temp(&path, b"{\"half\": ").unwrap();

        let loaded = store.load("auth").unwrap();
        assert_eq!(loaded.instance_id, doc.instance_id);
    }

    #[test]
    fn test_rejects_unsafe_pipeline_ids() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        assert!(matches!(store.load("../etc"), Err(StoreError::Invalid { .. })));
        assert!(matches!(store.load(""), Err(StoreError::Invalid { .. })));
    }

    #[test]
    fn test_tasks_roundtrip() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let book = TaskBook::new(vec![Task::new("1", "schema", &[])]);

        store.save_tasks("auth", &book).unwrap();
        assert_eq!(store.load_tasks("auth").unwrap(), book);
        assert!(matches!(
            store.load_tasks("other"),
            Err(StoreError::NotFound { .. })
        ));
    }
}
