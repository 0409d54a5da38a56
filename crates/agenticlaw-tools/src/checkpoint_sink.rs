//! Late-bound hook (C4) that file-mutating tools call before touching disk.
//!
//! The checkpoint manager lives in the agent crate, which depends on this
//! crate, so the binding runs through a trait object set after construction —
//! the same pattern `tools::spawn::RuntimeHandle` uses to reach the runtime.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait::async_trait]
pub trait CheckpointSink: Send + Sync {
    /// Record the pre-mutation state of `path` under the active checkpoint
    /// for `session_id`, if one exists. Idempotent per path within a turn.
    async fn record_file(&self, session_id: &str, path: &Path);
}

pub type CheckpointSinkHandle = Arc<RwLock<Option<Arc<dyn CheckpointSink>>>>;

pub fn create_checkpoint_sink_handle() -> CheckpointSinkHandle {
    Arc::new(RwLock::new(None))
}

/// Look up `_session_id` in a tool's argument map and, if a sink is bound,
/// record `path` before the caller mutates it.
pub async fn record_file_if_bound(handle: &CheckpointSinkHandle, args: &serde_json::Value, path: &Path) {
    let Some(session_id) = args.get("_session_id").and_then(|v| v.as_str()) else {
        return;
    };
    if let Some(sink) = handle.read().await.as_ref() {
        sink.record_file(session_id, path).await;
    }
}
