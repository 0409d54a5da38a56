//! Edit tool — find and replace exact strings, or replace a line range

use crate::checkpoint_sink::{record_file_if_bound, CheckpointSinkHandle};
use crate::registry::{Tool, ToolResult};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub struct EditTool {
    workspace_root: PathBuf,
    checkpoint_sink: CheckpointSinkHandle,
}

impl EditTool {
    pub fn new(workspace_root: impl AsRef<Path>, checkpoint_sink: CheckpointSinkHandle) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            checkpoint_sink,
        }
    }
}

#[async_trait::async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Edit a file. Either replace an exact string match (old_string/new_string, \
         must be unique unless replace_all) or replace a line range (start_line/end_line/new_content, \
         1-based inclusive)."
    }

    fn prompt(&self) -> &str {
        "Always read a file before editing it. The old_string must match exactly \
         including whitespace and indentation. For line-range edits, line numbers come \
         from a prior read's numbered output."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to find and replace"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace all occurrences (default: false)"
                },
                "start_line": {
                    "type": "integer",
                    "description": "1-based start line for a line-range edit"
                },
                "end_line": {
                    "type": "integer",
                    "description": "1-based inclusive end line for a line-range edit"
                },
                "new_content": {
                    "type": "string",
                    "description": "Replacement content for a line-range edit"
                }
            },
            "required": ["file_path"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let path = match args
            .get("file_path")
            .or(args.get("path"))
            .and_then(|v| v.as_str())
        {
            Some(p) => p,
            None => return ToolResult::error("Missing required parameter: file_path"),
        };

        let full_path = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.workspace_root.join(path)
        };

        let content = match fs::read_to_string(&full_path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("Failed to read file: {}", e)),
        };

        let new_content = if args.get("start_line").is_some() || args.get("end_line").is_some() {
            match apply_line_range_edit(&content, &args) {
                Ok(c) => c,
                Err(e) => return ToolResult::error(e),
            }
        } else {
            match apply_string_replace(&content, &args) {
                Ok(c) => c,
                Err(e) => return ToolResult::error(e),
            }
        };

        record_file_if_bound(&self.checkpoint_sink, &args, &full_path).await;

        match fs::write(&full_path, &new_content).await {
            Ok(()) => {
                debug!("edit: {}", path);
                ToolResult::text(format!("Edited {}", path))
            }
            Err(e) => ToolResult::error(format!("Failed to write: {}", e)),
        }
    }
}

fn apply_string_replace(content: &str, args: &Value) -> Result<String, String> {
    let old = args["old_string"]
        .as_str()
        .ok_or_else(|| "Missing required parameter: old_string".to_string())?;
    let new = args["new_string"]
        .as_str()
        .ok_or_else(|| "Missing required parameter: new_string".to_string())?;
    let replace_all = args["replace_all"].as_bool().unwrap_or(false);

    if !content.contains(old) {
        return Err("old_string not found in file".to_string());
    }

    if replace_all {
        return Ok(content.replace(old, new));
    }

    let count = content.matches(old).count();
    if count > 1 {
        let candidates = matching_line_numbers(content, old, 5);
        return Err(format!(
            "old_string found {} times — must be unique. Candidate lines: {}. \
             Use replace_all or provide more surrounding context.",
            count, candidates
        ));
    }
    Ok(content.replacen(old, new, 1))
}

/// Return a comma-separated list of 1-based line numbers where `needle`
/// starts, capped at `limit` entries (with a "..." suffix if truncated).
fn matching_line_numbers(content: &str, needle: &str, limit: usize) -> String {
    let mut lines_found = Vec::new();
    let mut offset = 0usize;
    let mut search_from = 0usize;
    while let Some(pos) = content[search_from..].find(needle) {
        let abs_pos = search_from + pos;
        let line_no = content[..abs_pos].matches('\n').count() + 1;
        lines_found.push(line_no);
        search_from = abs_pos + needle.len().max(1);
        offset += 1;
        if offset >= limit {
            break;
        }
    }
    let mut s = lines_found
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if content.matches(needle).count() > limit {
        s.push_str(", ...");
    }
    s
}

fn apply_line_range_edit(content: &str, args: &Value) -> Result<String, String> {
    let start_line = args["start_line"]
        .as_u64()
        .ok_or_else(|| "Missing required parameter: start_line".to_string())? as usize;
    let end_line = args["end_line"]
        .as_u64()
        .ok_or_else(|| "Missing required parameter: end_line".to_string())? as usize;
    let new_content = args["new_content"]
        .as_str()
        .ok_or_else(|| "Missing required parameter: new_content".to_string())?;

    if start_line == 0 || end_line < start_line {
        return Err("start_line must be >= 1 and end_line >= start_line".to_string());
    }

    let lines: Vec<&str> = content.lines().collect();
    if start_line > lines.len() {
        return Err(format!(
            "start_line {} is past end of file ({} lines)",
            start_line,
            lines.len()
        ));
    }
    let end_line = end_line.min(lines.len());

    let mut out = String::new();
    for line in &lines[..start_line - 1] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(new_content);
    if !new_content.ends_with('\n') {
        out.push('\n');
    }
    for line in &lines[end_line..] {
        out.push_str(line);
        out.push('\n');
    }
    if !content.ends_with('\n') && end_line == lines.len() {
        out.pop();
    }
    Ok(out)
}
