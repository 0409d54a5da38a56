//! Agenticlaw Tools — modular tool implementations
//!
//! Each tool is a self-contained file in src/tools/.
//! To add a tool: create the file, implement Tool trait, register below.
//! To remove a tool: delete the file, remove from mod.rs and registry below.

pub mod checkpoint_sink;
pub mod permission;
pub mod process_supervisor;
pub mod progress_sink;
pub mod registry;
pub mod store_sinks;
pub mod tools;

pub use checkpoint_sink::{create_checkpoint_sink_handle, CheckpointSink, CheckpointSinkHandle};
pub use permission::{PermissionDecision, PermissionGate, SensitiveCommandRule};
pub use process_supervisor::{ProcessId, ProcessSupervisor};
pub use progress_sink::{create_progress_sink_handle, ProgressSink, ProgressSinkHandle};
pub use registry::{Tool, ToolRegistry, ToolResult};
pub use store_sinks::{
    create_notebook_sink_handle, create_todo_sink_handle, NotebookSink, NotebookSinkHandle,
    TodoSink, TodoSinkHandle,
};
pub use tools::notebook::NotebookTool;
pub use tools::spawn::{RuntimeHandle, SpawnTool, SpawnableRuntime, SubagentRegistryHandle};
pub use tools::subagent::SubagentTool;
pub use tools::todo::TodoTool;

use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared handle to a subagent registry, set after the agent runtime constructs
/// its `SubagentRegistry`. Mirrors `RuntimeHandle`'s late-binding pattern so the
/// tools crate never depends on the agent crate directly.
pub type SubagentControlHandle = Arc<RwLock<Option<SubagentRegistryHandle>>>;

/// Create the default tool registry with all builtin tools.
///
/// Edit this function to add or remove tools from the agent.
/// Create a runtime handle for the spawn tool. Call this before creating the registry,
/// then set the runtime after constructing AgentRuntime.
pub fn create_runtime_handle() -> RuntimeHandle {
    Arc::new(RwLock::new(None))
}

/// Create a handle for the subagent lifecycle-control tool. Bind it after
/// constructing the agent's `SubagentRegistry`.
pub fn create_subagent_control_handle() -> SubagentControlHandle {
    Arc::new(RwLock::new(None))
}

pub fn create_default_registry(workspace_root: impl AsRef<Path>) -> ToolRegistry {
    create_default_registry_with_spawn(
        workspace_root,
        create_runtime_handle(),
        create_subagent_control_handle(),
        Arc::new(ProcessSupervisor::new()),
        create_checkpoint_sink_handle(),
        create_notebook_sink_handle(),
        create_todo_sink_handle(),
        create_progress_sink_handle(),
    )
}

/// Create registry with a shared runtime handle for the spawn tool.
/// After constructing AgentRuntime, call `runtime_handle.write().await = Some(runtime)`.
///
/// `supervisor` is shared with every shell-spawning tool so the caller can
/// invoke `supervisor.shutdown_all()` once, on process exit, and reap every
/// child regardless of which tool spawned it. `checkpoint_sink`, `notebook_sink`,
/// `todo_sink`, and `progress_sink` are bound after the agent crate constructs
/// its `CheckpointManager`/`NotebookStore`/`TodoStore`/progress router; the
/// tools that depend on them call through the handle rather than owning the
/// store directly.
pub fn create_default_registry_with_spawn(
    workspace_root: impl AsRef<Path>,
    runtime_handle: RuntimeHandle,
    subagent_control: SubagentControlHandle,
    supervisor: Arc<ProcessSupervisor>,
    checkpoint_sink: CheckpointSinkHandle,
    notebook_sink: NotebookSinkHandle,
    todo_sink: TodoSinkHandle,
    progress_sink: ProgressSinkHandle,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let root = workspace_root.as_ref();

    // --- Core tools (read-only) ---
    registry.register(tools::read::ReadTool::new(root));
    registry.register(tools::glob::GlobTool::new(root));
    registry.register(tools::grep::GrepTool::new(root));
    registry.register(tools::code_search::CodeSearchTool::new(root));

    // --- Mutation tools ---
    registry.register(tools::write::WriteTool::new(root, checkpoint_sink.clone()));
    registry.register(tools::edit::EditTool::new(root, checkpoint_sink));
    registry.register(tools::bash::BashTool::with_supervisor_and_progress(
        root,
        supervisor,
        progress_sink,
    ));

    // --- Per-session persistent state (C13/C14) ---
    registry.register(tools::notebook::NotebookTool::new(notebook_sink));
    registry.register(tools::todo::TodoTool::new(todo_sink));

    // --- Sub-agent spawning and lifecycle control ---
    // One tool per profile (id `explore` -> tool `agent_explore`), plus
    // whatever the workspace's `.snow/config.toml` points
    // `subagent_profile_paths` at — a user profile with the same id as a
    // built-in overrides it.
    let config = agenticlaw_core::RuntimeConfig::load(root);
    for profile in agenticlaw_core::load_profiles(&config.subagent_profile_paths) {
        registry.register(
            tools::spawn::SpawnTool::new(root, profile, runtime_handle.clone())
                .with_subagent_registry(subagent_control.clone()),
        );
    }
    registry.register(tools::subagent::SubagentTool::new(subagent_control));

    registry
}

/// Create a policy-scoped tool registry.
///
/// Only registers tools whose names appear in `allowed_tools`.
/// Used by operator containers to enforce policy at the tool registration level.
/// If a tool isn't registered, the LLM never sees it and can't call it.
pub fn create_policy_registry(workspace_root: impl AsRef<Path>, allowed_tools: &[&str]) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let root = workspace_root.as_ref();
    let checkpoint_sink = create_checkpoint_sink_handle();
    let notebook_sink = create_notebook_sink_handle();
    let todo_sink = create_todo_sink_handle();

    for name in allowed_tools {
        match *name {
            "read" => registry.register(tools::read::ReadTool::new(root)),
            "glob" => registry.register(tools::glob::GlobTool::new(root)),
            "grep" => registry.register(tools::grep::GrepTool::new(root)),
            "code_search" => registry.register(tools::code_search::CodeSearchTool::new(root)),
            "write" => registry.register(tools::write::WriteTool::new(root, checkpoint_sink.clone())),
            "edit" => registry.register(tools::edit::EditTool::new(root, checkpoint_sink.clone())),
            // `BashTool::new` binds a fresh, un-hooked progress sink — no
            // UI consumer is listening for this registry's batched output.
            "bash" => registry.register(tools::bash::BashTool::new(root)),
            "notebook" => registry.register(tools::notebook::NotebookTool::new(notebook_sink.clone())),
            "todo" => registry.register(tools::todo::TodoTool::new(todo_sink.clone())),
            _ => tracing::warn!("Unknown tool in policy: {}", name),
        }
    }

    registry
}

/// Build the tool registry a sub-agent sees: exactly the tools named in its
/// profile's `allowed_tools`, with `spawn` expanding to one tool per built-in
/// profile so a sub-agent can itself delegate (spec: "children can spawn
/// grandchildren"). Children get a fresh, un-hooked checkpoint sink — file
/// mutations inside a sub-agent are not covered by the top-level session's
/// rollback; see DESIGN.md. `notebook_store`/`todo_store`/`progress_sink`, by
/// contrast, are the runtime's real, already-bound sinks: the sub-agent's
/// distinct session id keeps its notes/TODOs/progress batches separate from
/// its parent's without needing a dedicated store or routing table.
pub fn create_scoped_registry_for_profile(
    workspace_root: impl AsRef<Path>,
    allowed_tools: &[String],
    runtime_handle: RuntimeHandle,
    subagent_control: SubagentControlHandle,
    notebook_store: Arc<dyn NotebookSink>,
    todo_store: Arc<dyn TodoSink>,
    progress_sink: Arc<dyn ProgressSink>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let root = workspace_root.as_ref();
    let checkpoint_sink = create_checkpoint_sink_handle();
    let notebook_sink: NotebookSinkHandle = Arc::new(RwLock::new(Some(notebook_store)));
    let todo_sink: TodoSinkHandle = Arc::new(RwLock::new(Some(todo_store)));
    let progress_sink_handle: ProgressSinkHandle = Arc::new(RwLock::new(Some(progress_sink)));

    for name in allowed_tools {
        match name.as_str() {
            "read" => registry.register(tools::read::ReadTool::new(root)),
            "glob" => registry.register(tools::glob::GlobTool::new(root)),
            "grep" => registry.register(tools::grep::GrepTool::new(root)),
            "code_search" => registry.register(tools::code_search::CodeSearchTool::new(root)),
            "write" => registry.register(tools::write::WriteTool::new(root, checkpoint_sink.clone())),
            "edit" => registry.register(tools::edit::EditTool::new(root, checkpoint_sink.clone())),
            "bash" => registry.register(tools::bash::BashTool::with_supervisor_and_progress(
                root,
                Arc::new(ProcessSupervisor::new()),
                progress_sink_handle.clone(),
            )),
            "notebook" => registry.register(tools::notebook::NotebookTool::new(notebook_sink.clone())),
            "todo" => registry.register(tools::todo::TodoTool::new(todo_sink.clone())),
            "spawn" => {
                for profile in agenticlaw_core::builtin_profiles() {
                    registry.register(
                        tools::spawn::SpawnTool::new(root, profile, runtime_handle.clone())
                            .with_subagent_registry(subagent_control.clone()),
                    );
                }
            }
            "subagent" => registry.register(tools::subagent::SubagentTool::new(subagent_control.clone())),
            _ => tracing::warn!("Unknown tool in sub-agent profile: {}", name),
        }
    }

    registry
}
