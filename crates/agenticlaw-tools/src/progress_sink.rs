//! Late-bound hook (execution-context UI sink, spec: "the UI sink for
//! progress events") that long-running tools use to stream partial output
//! before the call completes. Same binding pattern as `checkpoint_sink`: the
//! routing of a batch to the right in-flight turn lives in the agent crate,
//! which depends on this one, so the binding runs through a trait object set
//! after construction.

use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    /// Stream a batch of sanitized output lines for an in-flight tool call.
    async fn emit(&self, session_id: &str, tool_call_id: &str, tool_name: &str, lines: Vec<String>);
}

pub type ProgressSinkHandle = Arc<RwLock<Option<Arc<dyn ProgressSink>>>>;

pub fn create_progress_sink_handle() -> ProgressSinkHandle {
    Arc::new(RwLock::new(None))
}

/// Look up `_session_id`/`_tool_call_id` in a tool's argument map and, if a
/// sink is bound, forward `lines`. No-op when `lines` is empty or
/// `_session_id` is missing (e.g. the tool was invoked directly in a test,
/// bypassing the dispatcher that injects it).
pub async fn emit_progress_if_bound(
    handle: &ProgressSinkHandle,
    args: &serde_json::Value,
    tool_name: &str,
    lines: Vec<String>,
) {
    if lines.is_empty() {
        return;
    }
    let Some(session_id) = args.get("_session_id").and_then(|v| v.as_str()) else {
        return;
    };
    let tool_call_id = args
        .get("_tool_call_id")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if let Some(sink) = handle.read().await.as_ref() {
        sink.emit(session_id, tool_call_id, tool_name, lines).await;
    }
}
