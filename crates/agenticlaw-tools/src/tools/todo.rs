//! TODO tool (C14) — per-session hierarchical TODO list, backed by the
//! agent crate's `TodoStore` this tool is bound to.

use crate::registry::{Tool, ToolResult};
use crate::store_sinks::TodoSinkHandle;
use serde_json::{json, Value};

pub struct TodoTool {
    sink: TodoSinkHandle,
}

impl TodoTool {
    pub fn new(sink: TodoSinkHandle) -> Self {
        Self { sink }
    }
}

#[async_trait::async_trait]
impl Tool for TodoTool {
    fn name(&self) -> &str {
        "todo"
    }

    fn description(&self) -> &str {
        "Track a hierarchical TODO list for this session: add items, mark them completed, delete them (cascades to children), or list the current tree."
    }

    fn prompt(&self) -> &str {
        "Use the todo tool to track multi-step work:\n\
         - add <content> [parent_id]: add an item, optionally nested under another\n\
         - set_status <id> <pending|completed>: update an item's status\n\
         - delete <id>: remove an item and all its descendants\n\
         - list: show the current tree"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {
                    "type": "string",
                    "enum": ["add", "set_status", "delete", "list"]
                },
                "content": {"type": "string", "description": "Item text (add)"},
                "parent_id": {"type": "string", "description": "Parent item id (add, optional)"},
                "id": {"type": "string", "description": "Item id (set_status/delete)"},
                "status": {"type": "string", "enum": ["pending", "completed"], "description": "New status (set_status)"}
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
            None => return ToolResult::error("TODO store not initialized"),
        };

        let session_id = args.get("_session_id").and_then(|v| v.as_str()).unwrap_or("");

        match command {
            "add" => {
                let Some(content) = args.get("content").and_then(|v| v.as_str()) else {
                    return ToolResult::error("'content' is required for 'add'");
                };
                let parent_id = args.get("parent_id").and_then(|v| v.as_str()).map(str::to_string);
                ToolResult::Json(sink.add(session_id, content, parent_id))
            }
            "set_status" => {
                let (Some(id), Some(status)) = (
                    args.get("id").and_then(|v| v.as_str()),
                    args.get("status").and_then(|v| v.as_str()),
                ) else {
                    return ToolResult::error("'id' and 'status' are required for 'set_status'");
                };
                if sink.set_status(session_id, id, status) {
                    ToolResult::text(format!("Updated {id} to {status}"))
                } else {
                    ToolResult::error(format!("no TODO item '{id}'"))
                }
            }
            "delete" => {
                let Some(id) = args.get("id").and_then(|v| v.as_str()) else {
                    return ToolResult::error("'id' is required for 'delete'");
                };
                let removed = sink.delete(session_id, id);
                ToolResult::text(format!("Removed {removed} item(s)"))
            }
            "list" => ToolResult::Json(Value::Array(sink.list(session_id))),
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
        items: std::sync::Mutex<Vec<Value>>,
    }

    impl crate::store_sinks::TodoSink for MockSink {
        fn add(&self, _session_id: &str, content: &str, parent_id: Option<String>) -> Value {
            let item = json!({"id": "t1", "content": content, "status": "pending", "parent_id": parent_id});
            self.items.lock().unwrap().push(item.clone());
            item
        }
        fn set_status(&self, _session_id: &str, id: &str, status: &str) -> bool {
            id == "t1" && (status == "pending" || status == "completed")
        }
        fn delete(&self, _session_id: &str, _id: &str) -> usize {
            1
        }
        fn list(&self, _session_id: &str) -> Vec<Value> {
            self.items.lock().unwrap().clone()
        }
    }

    fn tool() -> TodoTool {
        let handle: TodoSinkHandle = Arc::new(RwLock::new(Some(Arc::new(MockSink::default()))));
        TodoTool::new(handle)
    }

    #[tokio::test]
    async fn add_then_list_round_trips() {
        let t = tool();
        let r = t.execute(json!({"command": "add", "content": "write tests"})).await;
        assert!(!r.is_error());
        let r = t.execute(json!({"command": "list"})).await;
        assert!(r.to_content_string().contains("write tests"));
    }

    #[tokio::test]
    async fn set_status_unknown_id_errors() {
        let t = tool();
        let r = t.execute(json!({"command": "set_status", "id": "nope", "status": "completed"})).await;
        assert!(r.is_error());
    }

    #[tokio::test]
    async fn add_requires_content() {
        let t = tool();
        let r = t.execute(json!({"command": "add"})).await;
        assert!(r.is_error());
    }
}
