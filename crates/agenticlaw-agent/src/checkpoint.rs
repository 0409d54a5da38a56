//! Checkpoint Manager (C4) — pre-mutation file snapshots and a useful-info
//! snapshot per turn, rolled back on cancellation.
//!
//! At most one active checkpoint per session. `record_file` is idempotent
//! per path: the first mutation of a turn wins the snapshot.

use crate::store::{TodoItem, UsefulInfoItem};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub path: PathBuf,
    /// `None` means the file did not exist before this turn's first mutation.
    pub prior_content: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub message_count: usize,
    pub file_snapshots: Vec<FileSnapshot>,
    pub useful_info_snapshot: Vec<UsefulInfoItem>,
    pub todo_snapshot: Vec<TodoItem>,
    pub timestamp: DateTime<Utc>,
}

/// What a turn's checkpoint restores on rollback, besides the message count
/// the session log is truncated to.
pub struct RollbackState {
    pub message_count: usize,
    pub useful_info: Vec<UsefulInfoItem>,
    pub todos: Vec<TodoItem>,
}

#[derive(Default)]
pub struct CheckpointManager {
    active: DashMap<String, Checkpoint>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an active checkpoint for `session_id`. Overwrites any uncommitted
    /// checkpoint for the same session (logged as a warning — the spec calls
    /// this a caller bug, not a panic).
    pub fn create(
        &self,
        session_id: impl Into<String>,
        message_count_before_turn: usize,
        useful_info_snapshot: Vec<UsefulInfoItem>,
        todo_snapshot: Vec<TodoItem>,
    ) {
        let session_id = session_id.into();
        if self.active.contains_key(&session_id) {
            warn!(
                session = %session_id,
                "checkpoint: overwriting uncommitted checkpoint"
            );
        }
        self.active.insert(
            session_id.clone(),
            Checkpoint {
                session_id,
                message_count: message_count_before_turn,
                file_snapshots: Vec::new(),
                useful_info_snapshot,
                todo_snapshot,
                timestamp: Utc::now(),
            },
        );
    }

    /// Record the pre-mutation state of `path`, reading it now. No-op if
    /// this path already has a snapshot in the active checkpoint, or if
    /// there is no active checkpoint for this session.
    pub async fn record_file(&self, session_id: &str, path: &std::path::Path) {
        let Some(mut entry) = self.active.get_mut(session_id) else {
            return;
        };
        if entry.file_snapshots.iter().any(|s| s.path == path) {
            return;
        }
        let prior_content = match tokio::fs::read_to_string(path).await {
            Ok(c) => Some(c),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "checkpoint: failed to snapshot file, recording as absent");
                None
            }
        };
        entry.file_snapshots.push(FileSnapshot {
            path: path.to_path_buf(),
            prior_content,
            timestamp: Utc::now(),
        });
    }

    /// Turn succeeded: discard the checkpoint.
    pub fn commit(&self, session_id: &str) {
        self.active.remove(session_id);
    }

    /// Turn cancelled: restore every snapshot in reverse order (write back
    /// prior content, or delete if the file did not exist before), restore
    /// useful-info, clear the checkpoint, and return the message count the
    /// session log must be truncated to. Failures on individual files are
    /// logged and do not abort the rest of the rollback.
    pub async fn rollback(&self, session_id: &str) -> Option<RollbackState> {
        let (_, checkpoint) = self.active.remove(session_id)?;

        for snapshot in checkpoint.file_snapshots.iter().rev() {
            let result = match &snapshot.prior_content {
                Some(content) => tokio::fs::write(&snapshot.path, content).await,
                None => match tokio::fs::remove_file(&snapshot.path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e),
                },
            };
            if let Err(e) = result {
                warn!(path = %snapshot.path.display(), error = %e, "checkpoint: rollback failed for file");
            }
        }

        Some(RollbackState {
            message_count: checkpoint.message_count,
            useful_info: checkpoint.useful_info_snapshot,
            todos: checkpoint.todo_snapshot,
        })
    }

    pub fn has_active(&self, session_id: &str) -> bool {
        self.active.contains_key(session_id)
    }
}

#[async_trait::async_trait]
impl agenticlaw_tools::CheckpointSink for CheckpointManager {
    async fn record_file(&self, session_id: &str, path: &std::path::Path) {
        CheckpointManager::record_file(self, session_id, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn commit_discards_snapshots() {
        let mgr = CheckpointManager::new();
        mgr.create("s1", 3, Vec::new(), Vec::new());
        assert!(mgr.has_active("s1"));
        mgr.commit("s1");
        assert!(!mgr.has_active("s1"));
    }

    #[tokio::test]
    async fn rollback_restores_modified_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        tokio::fs::write(&path, "original").await.unwrap();

        let mgr = CheckpointManager::new();
        mgr.create("s1", 5, Vec::new(), Vec::new());
        mgr.record_file("s1", &path).await;
        tokio::fs::write(&path, "mutated").await.unwrap();

        let state = mgr.rollback("s1").await.unwrap();
        assert_eq!(state.message_count, 5);
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "original");
        assert!(!mgr.has_active("s1"));
    }

    #[tokio::test]
    async fn rollback_deletes_newly_created_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("new.txt");

        let mgr = CheckpointManager::new();
        mgr.create("s1", 0, Vec::new(), Vec::new());
        mgr.record_file("s1", &path).await;
        tokio::fs::write(&path, "created").await.unwrap();

        mgr.rollback("s1").await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn record_file_idempotent_per_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.txt");
        tokio::fs::write(&path, "v1").await.unwrap();

        let mgr = CheckpointManager::new();
        mgr.create("s1", 0, Vec::new(), Vec::new());
        mgr.record_file("s1", &path).await;
        tokio::fs::write(&path, "v2").await.unwrap();
        mgr.record_file("s1", &path).await; // should not overwrite snapshot with v2

        mgr.rollback("s1").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "v1");
    }
}
