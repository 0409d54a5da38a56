//! Spawn tool (C10): one instance per sub-agent profile, registered under a
//! name that corresponds to the profile id (`agent_<id>`). The main agent
//! calls it with a single `prompt` string; everything else — system prompt,
//! tool allowlist — comes from the profile the tool was built with.
//!
//! Code prepares the child's session and artifacts, the child reasons within
//! its allowlisted tools, code captures the result and hands it back as the
//! tool-call result.

use crate::registry::{Tool, ToolResult};
use agenticlaw_core::SubAgentProfile;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared handle to the agent runtime, set after construction.
/// This breaks the circular dependency: tools need runtime, runtime needs tools.
pub type RuntimeHandle = Arc<RwLock<Option<Arc<dyn SpawnableRuntime>>>>;

/// Shared handle to the subagent registry for lifecycle management.
pub type SubagentRegistryHandle = Arc<dyn SubagentControl>;

/// Trait for subagent lifecycle control — implemented by SubagentRegistry.
/// Decouples the tool layer from the agent layer.
#[async_trait::async_trait]
pub trait SubagentControl: Send + Sync {
    /// Register a new subagent, returns its purpose-hash name.
    fn register(&self, purpose: &str, session_id: &str, parent: Option<&str>) -> String;
    /// Mark complete with output and tokens.
    fn mark_complete(&self, name: &str, output: &str, tokens: usize);
    /// Mark failed.
    fn mark_failed(&self, name: &str, error: &str);
    /// Check if paused.
    fn is_paused(&self, name: &str) -> bool;
    /// Check if killed.
    fn is_killed(&self, name: &str) -> bool;
    /// Wait on the pause gate (blocks until resumed or killed).
    async fn wait_for_resume(&self, name: &str);
    /// Pause a subagent (recursive).
    fn pause(&self, name: &str) -> Result<(), String>;
    /// Resume a subagent (recursive).
    fn resume(&self, name: &str) -> Result<(), String>;
    /// Kill a subagent (recursive).
    fn kill(&self, name: &str) -> Result<(), String>;
    /// Query subagent info.
    fn query(&self, name: &str) -> Result<SubagentInfoSnapshot, String>;
    /// List all subagents.
    fn list_all(&self) -> Vec<SubagentInfoSnapshot>;
    /// Find by prefix.
    fn find_by_prefix(&self, prefix: &str) -> Option<String>;
}

/// Snapshot of subagent info (decoupled from agent crate types).
#[derive(Debug, Clone)]
pub struct SubagentInfoSnapshot {
    pub name: String,
    pub purpose: String,
    pub status: String,
    pub tokens: usize,
    pub elapsed_ms: u64,
    pub last_output: String,
    pub children: Vec<String>,
    pub parent: Option<String>,
}

impl std::fmt::Display for SubagentInfoSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] — {} ({}ms, ~{}tok)",
            self.name, self.status, self.purpose, self.elapsed_ms, self.tokens
        )?;
        if !self.last_output.is_empty() {
            let preview = if self.last_output.len() > 100 {
                format!("{}...", &self.last_output[..97])
            } else {
                self.last_output.clone()
            };
            write!(f, "\n  └─ {}", preview)?;
        }
        Ok(())
    }
}

/// Trait that the agent runtime implements to support spawning.
/// Decouples the tool from the concrete runtime type.
#[async_trait::async_trait]
pub trait SpawnableRuntime: Send + Sync {
    /// Run a child agent turn with the given system prompt and user message,
    /// restricted to `allowed_tools`. `parent_session_id`, when present, is
    /// the session that should receive an internal record of the child's
    /// final output (spec: visible on reload, excluded from provider
    /// requests). Returns (output_text, token_estimate).
    async fn spawn_child(
        &self,
        session_id: &str,
        system_prompt: &str,
        user_message: &str,
        max_iterations: usize,
        allowed_tools: &[String],
        parent_session_id: Option<&str>,
    ) -> Result<(String, usize), String>;
}

pub struct SpawnTool {
    #[allow(dead_code)]
    workspace_root: PathBuf,
    profile: SubAgentProfile,
    tool_name: String,
    runtime: RuntimeHandle,
    /// Directory for run artifacts. If None, artifact recording is disabled.
    runs_dir: Option<PathBuf>,
    /// Counter for generating unique child IDs within a session.
    child_counter: Arc<std::sync::atomic::AtomicU64>,
    /// Subagent registry for lifecycle tracking.
    subagent_registry: Option<Arc<RwLock<Option<SubagentRegistryHandle>>>>,
    max_iterations: usize,
}

impl SpawnTool {
    pub fn new(workspace_root: impl AsRef<Path>, profile: SubAgentProfile, runtime: RuntimeHandle) -> Self {
        let tool_name = format!("agent_{}", profile.id);
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            profile,
            tool_name,
            runtime,
            runs_dir: dirs::home_dir().map(|h| h.join("tmp/agent-runs")),
            child_counter: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            subagent_registry: None,
            max_iterations: 25,
        }
    }

    pub fn with_runs_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.runs_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_subagent_registry(
        mut self,
        registry: Arc<RwLock<Option<SubagentRegistryHandle>>>,
    ) -> Self {
        self.subagent_registry = Some(registry);
        self
    }

    fn next_child_id(&self) -> u64 {
        self.child_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Write an artifact to the run directory (code, not agent).
    async fn write_artifact(&self, run_dir: &Path, name: &str, content: &str) {
        if let Err(e) = tokio::fs::create_dir_all(run_dir).await {
            tracing::warn!("failed to create run dir: {}", e);
            return;
        }
        if let Err(e) = tokio::fs::write(run_dir.join(name), content).await {
            tracing::warn!("failed to write artifact {}: {}", name, e);
        }
    }
}

#[async_trait::async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.profile.description
    }

    fn prompt(&self) -> &str {
        "Pack the full context the sub-agent needs into `prompt` — it cannot see this \
         conversation or read anything you haven't told it to look at. Be specific about \
         location and goal."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["prompt"],
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The full task for the sub-agent, including any context \
                        it needs — it has no access to this conversation."
                }
            }
        })
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let prompt = match args.get("prompt").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolResult::error("'prompt' is required"),
        };
        let parent_session_id = args
            .get("_session_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let child_id = self.next_child_id();
        let session_id = format!(
            "{}-child-{}-{}",
            self.profile.id,
            child_id,
            chrono::Utc::now().format("%H%M%S")
        );

        // Register with subagent registry for lifecycle tracking
        let purpose_preview: String = prompt.chars().take(120).collect();
        let subagent_name = if let Some(ref reg_handle) = self.subagent_registry {
            let guard = reg_handle.read().await;
            guard
                .as_ref()
                .map(|reg| reg.register(&purpose_preview, &session_id, parent_session_id.as_deref()))
        } else {
            None
        };

        tracing::info!(
            child = %session_id,
            profile = %self.profile.id,
            "spawning sub-agent"
        );

        let run_dir = self
            .runs_dir
            .as_ref()
            .map(|d| d.join(format!("child-{}", session_id)));

        if let Some(ref dir) = run_dir {
            self.write_artifact(dir, "prompt.md", prompt).await;
            self.write_artifact(
                dir,
                "manifest.yaml",
                &format!(
                    "child_id: {}\nprofile: {}\nstarted: {}\nstatus: running\n",
                    session_id,
                    self.profile.id,
                    chrono::Utc::now().to_rfc3339()
                ),
            )
            .await;
        }

        let start = std::time::Instant::now();

        let runtime_guard = self.runtime.read().await;
        let runtime = match runtime_guard.as_ref() {
            Some(r) => r.clone(),
            None => {
                return ToolResult::error(
                    "Runtime not initialized — spawn tool cannot create child agents",
                );
            }
        };
        drop(runtime_guard); // release lock before async work

        let result = runtime
            .spawn_child(
                &session_id,
                &self.profile.system_prompt,
                prompt,
                self.max_iterations,
                &self.profile.allowed_tools,
                parent_session_id.as_deref(),
            )
            .await;
        let wall_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok((output, tokens)) => {
                tracing::info!(
                    child = %session_id,
                    tokens = tokens,
                    wall_ms = wall_ms,
                    "child completed successfully"
                );

                if let (Some(ref name), Some(ref reg_handle)) =
                    (&subagent_name, &self.subagent_registry)
                {
                    let guard = reg_handle.read().await;
                    if let Some(ref reg) = *guard {
                        reg.mark_complete(name, output, *tokens);
                    }
                }

                if let Some(ref dir) = run_dir {
                    self.write_artifact(dir, "output.md", output).await;
                    self.write_artifact(
                        dir,
                        "metrics.yaml",
                        &format!(
                            "tokens: {}\nwall_ms: {}\noutcome: success\n",
                            tokens, wall_ms
                        ),
                    )
                    .await;
                    self.write_artifact(dir, "manifest.yaml", &format!(
                        "child_id: {}\nprofile: {}\nstarted: {}\nended: {}\nstatus: success\ntokens: {}\nwall_ms: {}\n",
                        session_id, self.profile.id, chrono::Utc::now().to_rfc3339(), chrono::Utc::now().to_rfc3339(), tokens, wall_ms
                    )).await;
                }

                let name_info = subagent_name.as_deref().unwrap_or(&session_id);
                ToolResult::text(format!("[{}] {}", name_info, output))
            }
            Err(e) => {
                tracing::warn!(
                    child = %session_id,
                    error = %e,
                    wall_ms = wall_ms,
                    "child failed"
                );

                if let (Some(ref name), Some(ref reg_handle)) =
                    (&subagent_name, &self.subagent_registry)
                {
                    let guard = reg_handle.read().await;
                    if let Some(ref reg) = *guard {
                        reg.mark_failed(name, &e.to_string());
                    }
                }

                if let Some(ref dir) = run_dir {
                    self.write_artifact(dir, "output.md", &format!("ERROR: {}", e))
                        .await;
                    self.write_artifact(
                        dir,
                        "metrics.yaml",
                        &format!(
                            "tokens: 0\nwall_ms: {}\noutcome: failed\nerror: {:?}\n",
                            wall_ms, e
                        ),
                    )
                    .await;
                }

                ToolResult::error(format!("Sub-agent failed: {}", e))
            }
        }
    }
}
