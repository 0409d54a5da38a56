//! Late-bound hooks (C13/C14) the notebook and TODO tools call into.
//!
//! The stores themselves live in the agent crate, which depends on this one,
//! so the binding runs through a trait object set after construction — same
//! pattern as [`crate::checkpoint_sink`].

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

pub trait NotebookSink: Send + Sync {
    fn add(&self, session_id: &str, message_index: usize, path: &str, note: &str) -> Value;
    fn update(&self, session_id: &str, message_index: usize, path: &str, id: &str, note: &str) -> Option<Value>;
    fn delete(&self, session_id: &str, message_index: usize, path: &str, id: &str) -> bool;
    fn for_path(&self, path: &str) -> Vec<Value>;
    fn mark_useful(
        &self,
        session_id: &str,
        file_path: &str,
        start_line: u32,
        end_line: u32,
        description: Option<String>,
    ) -> Value;
    fn useful_info(&self, session_id: &str) -> Vec<Value>;
}

pub trait TodoSink: Send + Sync {
    fn add(&self, session_id: &str, content: &str, parent_id: Option<String>) -> Value;
    fn set_status(&self, session_id: &str, id: &str, status: &str) -> bool;
    fn delete(&self, session_id: &str, id: &str) -> usize;
    fn list(&self, session_id: &str) -> Vec<Value>;
}

pub type NotebookSinkHandle = Arc<RwLock<Option<Arc<dyn NotebookSink>>>>;
pub type TodoSinkHandle = Arc<RwLock<Option<Arc<dyn TodoSink>>>>;

pub fn create_notebook_sink_handle() -> NotebookSinkHandle {
    Arc::new(RwLock::new(None))
}

pub fn create_todo_sink_handle() -> TodoSinkHandle {
    Arc::new(RwLock::new(None))
}
