//! Bash tool — execute shell commands with timeout, background support, and cancellation
//!
//! Implements the `terminal-execute` handler (C7): line-buffered capture with
//! a control-sequence sanitizer for UI preview, a caller-supplied timeout that
//! escalates SIGTERM -> SIGKILL, and registration with the process supervisor
//! so shutdown can reap stray children.

use crate::process_supervisor::ProcessSupervisor;
use crate::progress_sink::{create_progress_sink_handle, emit_progress_if_bound, ProgressSinkHandle};
use crate::registry::{Tool, ToolResult};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Grace period between SIGTERM and SIGKILL when a command exceeds its timeout.
const TIMEOUT_KILL_GRACE: Duration = Duration::from_millis(100);
/// UI batching: commit a full group of this many lines immediately.
const UI_BATCH_LINES: usize = 5;
/// UI batching: commit any residual lines after this much inactivity.
const UI_BATCH_IDLE: Duration = Duration::from_millis(50);

pub struct BashTool {
    workspace_root: PathBuf,
    default_timeout_secs: u64,
    supervisor: Arc<ProcessSupervisor>,
    progress_sink: ProgressSinkHandle,
}

impl BashTool {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        Self::with_supervisor(workspace_root, Arc::new(ProcessSupervisor::new()))
    }

    pub fn with_supervisor(
        workspace_root: impl AsRef<Path>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        Self::with_supervisor_and_progress(workspace_root, supervisor, create_progress_sink_handle())
    }

    /// `progress_sink` receives batched, sanitized output lines while the
    /// command runs — see the batching comment on `execute_cancellable`.
    pub fn with_supervisor_and_progress(
        workspace_root: impl AsRef<Path>,
        supervisor: Arc<ProcessSupervisor>,
        progress_sink: ProgressSinkHandle,
    ) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            default_timeout_secs: 30,
            supervisor,
            progress_sink,
        }
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }
}

/// Strip ANSI/OSC/CSI control sequences, normalize tabs, drop other control
/// bytes. Applied per line for the UI preview; the raw bytes are retained
/// separately for the final tool-result.
fn sanitize_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => {
                // ESC-introduced sequence: CSI (`[`), OSC (`]`), or a single
                // following byte for other short escapes. Consume until a
                // terminator (letter for CSI, BEL/ST for OSC).
                if let Some(&next) = chars.peek() {
                    if next == '[' {
                        chars.next();
                        for c2 in chars.by_ref() {
                            if c2.is_ascii_alphabetic() {
                                break;
                            }
                        }
                    } else if next == ']' {
                        chars.next();
                        for c2 in chars.by_ref() {
                            if c2 == '\u{7}' || c2 == '\u{1b}' {
                                break;
                            }
                        }
                    } else {
                        chars.next();
                    }
                }
            }
            '\t' => out.push_str("    "),
            c if c.is_control() && c != '\n' => {}
            c => out.push(c),
        }
    }
    out
}

#[async_trait::async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a bash command. Use for git, npm, docker, system commands. \
         Captures stdout and stderr. Set timeout in seconds (default 30, max 600). \
         Include a short description of what the command does."
    }

    fn prompt(&self) -> &str {
        "Use the bash tool for terminal operations. Quote paths with spaces. \
         Prefer dedicated tools (read, write, edit, glob, grep) over bash equivalents."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 30, max 600)"
                },
                "description": {
                    "type": "string",
                    "description": "Short description of what this command does"
                },
                "run_in_background": {
                    "type": "boolean",
                    "description": "Move the process to the background set instead of waiting for it to finish"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        self.execute_cancellable(args, CancellationToken::new()).await
    }

    /// Cancellable execution: spawns the process with kill_on_drop(true),
    /// registers it with the process supervisor, and races against the
    /// CancellationToken, the caller's timeout, and natural exit.
    async fn execute_cancellable(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let command = match args["command"].as_str() {
            Some(c) => c,
            None => return ToolResult::error("Missing required parameter: command"),
        };

        let timeout_secs = args["timeout"]
            .as_u64()
            .unwrap_or(self.default_timeout_secs)
            .min(600);
        let run_in_background = args["run_in_background"].as_bool().unwrap_or(false);

        if let Some(desc) = args["description"].as_str() {
            debug!("bash [{}]: {}", desc, command);
        } else {
            debug!("bash: {}", &command[..command.len().min(80)]);
        }

        let mut child = match Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace_root)
            .kill_on_drop(true)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return ToolResult::error(format!("Failed to spawn: {}", e)),
        };

        let pid = child.id().unwrap_or(0);
        let proc_id = self.supervisor.register(pid, command);
        if run_in_background {
            self.supervisor.move_to_background(proc_id);
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (raw_tx, mut raw_rx) = tokio::sync::mpsc::unbounded_channel::<(bool, String)>();

        let stdout_tx = raw_tx.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(pipe) = stdout {
                let mut reader = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let _ = stdout_tx.send((false, line));
                }
            }
        });
        let stderr_task = tokio::spawn(async move {
            if let Some(pipe) = stderr {
                let mut reader = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let _ = raw_tx.send((true, line));
                }
            }
        });

        // Drain the line channel, batching for the UI (full groups of 5
        // immediately, residual after 50ms idle), while accumulating the raw
        // transcript for the final tool-result.
        let mut stdout_lines: Vec<String> = Vec::new();
        let mut stderr_lines: Vec<String> = Vec::new();
        let mut pending_batch: Vec<String> = Vec::new();
        let timeout_duration = Duration::from_secs(timeout_secs);
        let deadline = Instant::now() + timeout_duration;

        let status = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    self.supervisor.reap(proc_id);
                    stdout_task.abort();
                    stderr_task.abort();
                    return ToolResult::text("[process killed by interrupt]");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = child.start_kill();
                    tokio::time::sleep(TIMEOUT_KILL_GRACE).await;
                    let _ = child.kill().await;
                    self.supervisor.reap(proc_id);
                    stdout_task.abort();
                    stderr_task.abort();
                    return ToolResult::error(format!("Command timed out after {}s", timeout_secs));
                }
                line = raw_rx.recv() => {
                    match line {
                        Some((is_err, text)) => {
                            if is_err { stderr_lines.push(text.clone()); } else { stdout_lines.push(text.clone()); }
                            pending_batch.push(sanitize_line(&text));
                            if pending_batch.len() >= UI_BATCH_LINES {
                                emit_progress_if_bound(
                                    &self.progress_sink,
                                    &args,
                                    self.name(),
                                    std::mem::take(&mut pending_batch),
                                ).await;
                            }
                        }
                        None => {
                            // Pipes closed; wait for exit status.
                            match child.wait().await {
                                Ok(s) => break s,
                                Err(e) => {
                                    self.supervisor.reap(proc_id);
                                    return ToolResult::error(format!("Failed to wait: {}", e));
                                }
                            }
                        }
                    }
                }
                _ = tokio::time::sleep(UI_BATCH_IDLE), if !pending_batch.is_empty() => {
                    emit_progress_if_bound(
                        &self.progress_sink,
                        &args,
                        self.name(),
                        std::mem::take(&mut pending_batch),
                    ).await;
                }
            }
        };

        self.supervisor.reap(proc_id);
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if run_in_background {
            return ToolResult::text(format!("[running in background, pid={}]", pid));
        }

        format_lines(&status, &stdout_lines, &stderr_lines)
    }
}

fn format_lines(status: &std::process::ExitStatus, stdout: &[String], stderr: &[String]) -> ToolResult {
    let stdout = stdout.join("\n");
    let stderr = stderr.join("\n");

    let result = if status.success() {
        if stderr.is_empty() {
            stdout.trim().to_string()
        } else {
            format!("{}\n{}", stdout.trim(), stderr.trim())
        }
    } else {
        format!(
            "Exit code: {}\n{}\n{}",
            status.code().unwrap_or(-1),
            stdout.trim(),
            stderr.trim()
        )
    };

    if result.is_empty() {
        ToolResult::text("(no output)")
    } else if result.len() > 30000 {
        ToolResult::text(format!(
            "{}\n... [truncated, {} total chars]",
            &result[..30000],
            result.len()
        ))
    } else {
        ToolResult::text(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_sequences() {
        let sanitized = sanitize_line("\u{1b}[31mred text\u{1b}[0m");
        assert_eq!(sanitized, "red text");
    }

    #[test]
    fn normalizes_tabs() {
        assert_eq!(sanitize_line("a\tb"), "a    b");
    }

    #[tokio::test]
    async fn runs_simple_command() {
        let tool = BashTool::new(std::env::temp_dir());
        let result = tool.execute(json!({"command": "echo hello"})).await;
        assert!(!result.is_error());
        assert!(result.to_content_string().contains("hello"));
    }

    #[tokio::test]
    async fn times_out_long_running_command() {
        let tool = BashTool::new(std::env::temp_dir());
        let result = tool
            .execute(json!({"command": "sleep 5", "timeout": 1}))
            .await;
        assert!(result.is_error());
        assert!(result.to_content_string().contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_kills_process() {
        let tool = BashTool::new(std::env::temp_dir());
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel2.cancel();
        });
        let result = tool
            .execute_cancellable(json!({"command": "sleep 5"}), cancel)
            .await;
        assert!(result.to_content_string().contains("killed"));
    }

    struct MockProgressSink {
        batches: std::sync::Mutex<Vec<(String, String, Vec<String>)>>,
    }

    #[async_trait::async_trait]
    impl crate::progress_sink::ProgressSink for MockProgressSink {
        async fn emit(&self, session_id: &str, tool_call_id: &str, tool_name: &str, lines: Vec<String>) {
            self.batches.lock().unwrap().push((
                session_id.to_string(),
                tool_call_id.to_string(),
                lines,
            ));
        }
    }

    #[tokio::test]
    async fn forwards_batched_output_to_bound_progress_sink() {
        let sink = Arc::new(MockProgressSink { batches: std::sync::Mutex::new(Vec::new()) });
        let handle: ProgressSinkHandle = Arc::new(tokio::sync::RwLock::new(Some(
            sink.clone() as Arc<dyn crate::progress_sink::ProgressSink>
        )));
        let tool = BashTool::with_supervisor_and_progress(
            std::env::temp_dir(),
            Arc::new(ProcessSupervisor::new()),
            handle,
        );
        let result = tool
            .execute(json!({
                "command": "for i in 1 2 3 4 5 6; do echo line$i; done",
                "_session_id": "s1",
                "_tool_call_id": "call-1"
            }))
            .await;
        assert!(!result.is_error());

        let batches = sink.batches.lock().unwrap();
        assert!(!batches.is_empty(), "expected at least one forwarded batch");
        for (session_id, tool_call_id, lines) in batches.iter() {
            assert_eq!(session_id, "s1");
            assert_eq!(tool_call_id, "call-1");
            assert!(!lines.is_empty());
        }
    }

    #[tokio::test]
    async fn unbound_progress_sink_is_a_quiet_no_op() {
        let tool = BashTool::new(std::env::temp_dir());
        let result = tool
            .execute(json!({"command": "echo no listeners"}))
            .await;
        assert!(!result.is_error());
        assert!(result.to_content_string().contains("no listeners"));
    }
}
