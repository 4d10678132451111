//! Crash-safe harvest progress tracking.
//!
//! A checkpoint is a JSON snapshot of per-task outcomes, persisted
//! periodically during a run and unconditionally at run end. Loading fails
//! soft: a missing or corrupt file degrades to a fresh run instead of
//! crashing, and a stale checkpoint from a prior run is the resume source of
//! truth unless the caller disables resume.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Status of a harvesting task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

/// One harvest task, keyed by its stable app id.
///
/// Mutated only by the orchestrator while the task is in flight; the
/// concurrency gate guarantees a single owner per app id.
#[derive(Debug, Clone)]
pub struct HarvestTask {
    pub app_id: String,
    pub pkg_name: Option<String>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub sources_fetched: Vec<String>,
}

impl HarvestTask {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            pkg_name: None,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            sources_fetched: Vec::new(),
        }
    }
}

/// Persisted per-task outcome: `{status, pkg_name|error}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkg_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate progress snapshot for one harvest run.
///
/// Invariant: `completed + failed + skipped <= total_tasks`; counters are
/// monotonically non-decreasing within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestCheckpoint {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Epoch seconds.
    pub last_updated: i64,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRecord>,
}

impl HarvestCheckpoint {
    /// A fresh checkpoint sized to the discovered task count.
    pub fn create(total_tasks: usize) -> Self {
        Self {
            total_tasks,
            completed: 0,
            failed: 0,
            skipped: 0,
            last_updated: Utc::now().timestamp(),
            tasks: BTreeMap::new(),
        }
    }

    pub fn is_completed(&self, app_id: &str) -> bool {
        self.tasks
            .get(app_id)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    }

    pub fn record_completed(&mut self, app_id: &str, pkg_name: Option<String>) {
        self.tasks.insert(
            app_id.to_string(),
            TaskRecord {
                status: TaskStatus::Completed,
                pkg_name,
                error: None,
            },
        );
        self.completed += 1;
    }

    pub fn record_failed(&mut self, app_id: &str, error: impl Into<String>) {
        self.tasks.insert(
            app_id.to_string(),
            TaskRecord {
                status: TaskStatus::Failed,
                pkg_name: None,
                error: Some(error.into()),
            },
        );
        self.failed += 1;
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now().timestamp();
    }
}

/// File-backed checkpoint persistence at a fixed path under the data dir.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted checkpoint, if any.
    ///
    /// Any read or decode error is treated as "no checkpoint": logged,
    /// never fatal.
    pub fn load(&self) -> Option<HarvestCheckpoint> {
        if !self.path.exists() {
            return None;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(checkpoint) => Some(checkpoint),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to decode checkpoint");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read checkpoint");
                None
            }
        }
    }

    /// Persist the full checkpoint state.
    ///
    /// The caller logs and continues on error: progress tracking is
    /// best-effort relative to the harvest itself.
    pub fn save(&self, checkpoint: &HarvestCheckpoint) -> Result<(), HarvestError> {
        let text = serde_json::to_string_pretty(checkpoint)?;
        std::fs::write(&self.path, text).map_err(|e| HarvestError::Checkpoint(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Skipped,
        ] {
            let parsed: TaskStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
    }

    #[test]
    fn create_starts_zeroed() {
        let cp = HarvestCheckpoint::create(120);
        assert_eq!(cp.total_tasks, 120);
        assert_eq!(cp.completed, 0);
        assert_eq!(cp.failed, 0);
        assert_eq!(cp.skipped, 0);
        assert!(cp.tasks.is_empty());
        assert!(cp.last_updated > 0);
    }

    #[test]
    fn counters_track_outcomes() {
        let mut cp = HarvestCheckpoint::create(3);
        cp.record_completed("org.app.One", Some("one".into()));
        cp.record_failed("org.app.Two", "boom");
        assert_eq!(cp.completed, 1);
        assert_eq!(cp.failed, 1);
        assert!(cp.is_completed("org.app.One"));
        assert!(!cp.is_completed("org.app.Two"));
        assert!(cp.completed + cp.failed + cp.skipped <= cp.total_tasks);
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join(".harvest_checkpoint.json"));

        let mut cp = HarvestCheckpoint::create(7);
        cp.record_completed("org.app.One", Some("one".into()));
        store.save(&cp).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.total_tasks, 7);
        assert_eq!(loaded.completed, 1);
        assert_eq!(
            loaded.tasks.get("org.app.One").map(|t| t.status),
            Some(TaskStatus::Completed)
        );
    }

    #[test]
    fn wire_format_uses_lowercase_status_strings() {
        let mut cp = HarvestCheckpoint::create(1);
        cp.record_failed("org.app.One", "boom");
        let json = serde_json::to_value(&cp).unwrap();
        assert_eq!(json["tasks"]["org.app.One"]["status"], "failed");
        assert_eq!(json["tasks"]["org.app.One"]["error"], "boom");
        assert!(json["tasks"]["org.app.One"].get("pkg_name").is_none());
    }

    #[test]
    fn load_fails_soft_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("missing.json"));
        assert!(store.load().is_none());
    }

    #[test]
    fn load_fails_soft_on_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(CheckpointStore::new(path).load().is_none());
    }
}
