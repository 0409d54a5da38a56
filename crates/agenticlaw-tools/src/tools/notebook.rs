//! Notebook & Useful-Info tool (C13) — per-file/folder developer notes and
//! per-session surfaced code regions, both journaled/snapshotted for
//! rollback by the agent crate's stores this tool is bound to.

use crate::registry::{Tool, ToolResult};
use crate::store_sinks::NotebookSinkHandle;
use serde_json::{json, Value};

pub struct NotebookTool {
    sink: NotebookSinkHandle,
}

impl NotebookTool {
    pub fn new(sink: NotebookSinkHandle) -> Self {
        Self { sink }
    }
}

#[async_trait::async_trait]
impl Tool for NotebookTool {
    fn name(&self) -> &str {
        "notebook"
    }

    fn description(&self) -> &str {
        "Record or read developer notes attached to a file or folder, and mark code regions as useful-info surfaced on later turns."
    }

    fn prompt(&self) -> &str {
        "Use the notebook tool to leave yourself notes that persist across turns:\n\
         - add <path> <note>: attach a note to a file (or a folder if path ends in '/')\n\
         - update <path> <id> <note>: edit an existing note\n\
         - delete <path> <id>: remove a note\n\
         - for_path <path>: list notes attached to a file or its parent folders\n\
         - mark_useful <file_path> <start_line> <end_line> [description]: flag a code region worth remembering\n\
         - useful_info: list this session's surfaced regions, newest first"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {
                    "type": "string",
                    "enum": ["add", "update", "delete", "for_path", "mark_useful", "useful_info"]
                },
                "path": {"type": "string", "description": "File or folder path (add/update/delete/for_path)"},
                "id": {"type": "string", "description": "Note id (update/delete)"},
                "note": {"type": "string", "description": "Note text (add/update)"},
                "file_path": {"type": "string", "description": "File path (mark_useful)"},
                "start_line": {"type": "integer", "description": "1-based start line (mark_useful)"},
                "end_line": {"type": "integer", "description": "1-based end line (mark_useful)"},
                "description": {"type": "string", "description": "Optional description (mark_useful)"}
            }
        })
    }

    fn is_read_only(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let command = match args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolResult::error("'command' is required"),
        };

        let guard = self.sink.read().await;
        let sink = match guard.as_ref() {
            Some(s) => s,
            None => return ToolResult::error("Notebook store not initialized"),
        };

        let session_id = args.get("_session_id").and_then(|v| v.as_str()).unwrap_or("");
        let message_index = args
            .get("_message_index")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        match command {
            "add" => {
                let (Some(path), Some(note)) = (
                    args.get("path").and_then(|v| v.as_str()),
                    args.get("note").and_then(|v| v.as_str()),
                ) else {
                    return ToolResult::error("'path' and 'note' are required for 'add'");
                };
                ToolResult::Json(sink.add(session_id, message_index, path, note))
            }
            "update" => {
                let (Some(path), Some(id), Some(note)) = (
                    args.get("path").and_then(|v| v.as_str()),
                    args.get("id").and_then(|v| v.as_str()),
                    args.get("note").and_then(|v| v.as_str()),
                ) else {
                    return ToolResult::error("'path', 'id', and 'note' are required for 'update'");
                };
                match sink.update(session_id, message_index, path, id, note) {
                    Some(entry) => ToolResult::Json(entry),
                    None => ToolResult::error(format!("no note '{id}' found at '{path}'")),
                }
            }
            "delete" => {
                let (Some(path), Some(id)) = (
                    args.get("path").and_then(|v| v.as_str()),
                    args.get("id").and_then(|v| v.as_str()),
                ) else {
                    return ToolResult::error("'path' and 'id' are required for 'delete'");
                };
                if sink.delete(session_id, message_index, path, id) {
                    ToolResult::text(format!("Deleted note {id}"))
                } else {
                    ToolResult::error(format!("no note '{id}' found at '{path}'"))
                }
            }
            "for_path" => {
                let Some(path) = args.get("path").and_then(|v| v.as_str()) else {
                    return ToolResult::error("'path' is required for 'for_path'");
                };
                ToolResult::Json(Value::Array(sink.for_path(path)))
            }
            "mark_useful" => {
                let (Some(file_path), Some(start_line), Some(end_line)) = (
                    args.get("file_path").and_then(|v| v.as_str()),
                    args.get("start_line").and_then(|v| v.as_u64()),
                    args.get("end_line").and_then(|v| v.as_u64()),
                ) else {
                    return ToolResult::error(
                        "'file_path', 'start_line', and 'end_line' are required for 'mark_useful'",
                    );
                };
                let description = args
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                ToolResult::Json(sink.mark_useful(
                    session_id,
                    file_path,
                    start_line as u32,
                    end_line as u32,
                    description,
                ))
            }
            "useful_info" => ToolResult::Json(Value::Array(sink.useful_info(session_id))),
            _ => ToolResult::error(format!("Unknown command: {command}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct MockSink {
        notes: std::sync::Mutex<Vec<(String, String)>>,
    }

    impl crate::store_sinks::NotebookSink for MockSink {
        fn add(&self, _session_id: &str, _message_index: usize, path: &str, note: &str) -> Value {
            self.notes.lock().unwrap().push((path.to_string(), note.to_string()));
            json!({"id": "n1", "path": path, "note": note})
        }
        fn update(&self, _session_id: &str, _message_index: usize, _path: &str, id: &str, note: &str) -> Option<Value> {
            Some(json!({"id": id, "note": note}))
        }
        fn delete(&self, _session_id: &str, _message_index: usize, _path: &str, _id: &str) -> bool {
            true
        }
        fn for_path(&self, path: &str) -> Vec<Value> {
            self.notes
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| p == path)
                .map(|(p, n)| json!({"path": p, "note": n}))
                .collect()
        }
        fn mark_useful(&self, _session_id: &str, file_path: &str, start_line: u32, end_line: u32, _description: Option<String>) -> Value {
            json!({"file_path": file_path, "start_line": start_line, "end_line": end_line})
        }
        fn useful_info(&self, _session_id: &str) -> Vec<Value> {
            vec![json!({"file_path": "a.rs"})]
        }
    }

    fn tool() -> NotebookTool {
        let handle: NotebookSinkHandle = Arc::new(RwLock::new(Some(Arc::new(MockSink::default()))));
        NotebookTool::new(handle)
    }

    #[tokio::test]
    async fn add_then_for_path_round_trips() {
        let t = tool();
        let r = t.execute(json!({"command": "add", "path": "a.rs", "note": "careful here"})).await;
        assert!(!r.is_error());
        let r = t.execute(json!({"command": "for_path", "path": "a.rs"})).await;
        assert!(r.to_content_string().contains("careful here"));
    }

    #[tokio::test]
    async fn mark_useful_requires_line_range() {
        let t = tool();
        let r = t.execute(json!({"command": "mark_useful", "file_path": "a.rs"})).await;
        assert!(r.is_error());
    }

    #[tokio::test]
    async fn unbound_sink_errors() {
        let handle: NotebookSinkHandle = Arc::new(RwLock::new(None));
        let t = NotebookTool::new(handle);
        let r = t.execute(json!({"command": "useful_info"})).await;
        assert!(r.is_error());
    }
}
