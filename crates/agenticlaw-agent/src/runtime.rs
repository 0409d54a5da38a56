//! Agent runtime - the core agentic loop with .ctx persistence

use crate::checkpoint::CheckpointManager;
use crate::session::{Session, SessionKey, SessionRegistry};
use crate::store::{NotebookStore, TodoStore, UsefulInfoStore};
use crate::subagent::SubagentRegistry;
use agenticlaw_llm::retry::stream_with_retry;
use agenticlaw_llm::{
    AccumulatedToolCall, AnthropicProvider, ContentBlock, LlmProvider, LlmRequest, LlmTool,
    StreamDelta,
};
use agenticlaw_tools::permission::{
    AutoApproveSink, ConfirmationSink, PermissionDecision, SensitiveCommandRule,
};
use agenticlaw_tools::{PermissionGate, ProcessSupervisor, SpawnableRuntime};
use agenticlaw_tools::ToolRegistry;
use dashmap::DashMap;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug)]
pub enum AgentEvent {
    AgentStart,
    TurnStart {
        message_count_before: usize,
    },
    Text(String),
    Thinking(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        arguments: String,
    },
    ToolExecuting {
        id: String,
        name: String,
    },
    /// A tool call the permission gate denied. The remaining calls in the
    /// same batch still run — a synthetic tool-result quoting `reason` is
    /// sent back to the model in this one's place.
    ToolSkipped {
        id: String,
        name: String,
        reason: String,
    },
    ToolResult {
        id: String,
        name: String,
        result: String,
        is_error: bool,
    },
    /// A higher-priority human message preempted the in-flight turn and was
    /// spliced into the conversation (queue-architecture steering, C12).
    SteeringInjected {
        content: String,
    },
    /// A queued message was appended once the current turn went idle.
    FollowUpInjected {
        content: String,
    },
    /// Layer hit context limit — should sleep instead of compacting.
    Sleep {
        token_count: usize,
    },
    TurnEnd {
        stop_reason: String,
    },
    Done {
        stop_reason: String,
    },
    /// The turn was cancelled and any file mutations made during it were
    /// rolled back.
    Aborted,
    /// A batch of sanitized output lines from an in-flight tool call (C7:
    /// bash streams stdout/stderr in groups of 5 or after 50ms idle).
    ToolProgress {
        id: String,
        name: String,
        lines: Vec<String>,
    },
    Error(String),
}

pub struct AgentConfig {
    pub default_model: String,
    pub max_tool_iterations: usize,
    pub system_prompt: Option<String>,
    pub workspace_root: PathBuf,
    /// Context utilization percentage that triggers sleep (0.0 - 1.0).
    /// Resolved against model's max context window at runtime.
    pub sleep_threshold_pct: f64,
    /// Retry a mid-stream idle-timeout/incomplete-stream fault by
    /// transparently restarting the provider call (C2). Off by default for
    /// `spawn_child` sub-turns, on for top-level turns.
    pub retry_mid_stream: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_model: "claude-opus-4-6-20250929".to_string(),
            max_tool_iterations: 25,
            system_prompt: None,
            workspace_root: std::env::current_dir().unwrap_or_default(),
            sleep_threshold_pct: 0.55,
            retry_mid_stream: true,
        }
    }
}

pub struct AgentRuntime {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionRegistry>,
    config: AgentConfig,
    checkpoint: Arc<CheckpointManager>,
    permissions: Arc<PermissionGate>,
    /// Per-file/folder developer notes (C13).
    notebook: Arc<NotebookStore>,
    /// Per-session surfaced code regions (C13).
    useful_info: Arc<UsefulInfoStore>,
    /// Per-session hierarchical TODO list (C14).
    todos: Arc<TodoStore>,
    /// session_id -> this turn's event channel, so a tool call anywhere in
    /// the registry (including a sub-agent's scoped one) can route a
    /// progress batch back to whichever turn is actually waiting on it.
    /// Entries live only for the duration of the turn that registered them.
    progress_routes: Arc<DashMap<String, mpsc::Sender<AgentEvent>>>,
    /// Set by [`bootstrap`]; lets `spawn_child` build a sub-agent a tool
    /// registry scoped to its profile instead of handing it the full set.
    subagent_handles: Option<(
        agenticlaw_tools::RuntimeHandle,
        agenticlaw_tools::SubagentControlHandle,
    )>,
}

/// Removes its turn's route when dropped, regardless of which return path
/// the turn takes.
struct ProgressRouteGuard {
    routes: Arc<DashMap<String, mpsc::Sender<AgentEvent>>>,
    session_id: String,
}

impl Drop for ProgressRouteGuard {
    fn drop(&mut self) {
        self.routes.remove(&self.session_id);
    }
}

/// Binds `agenticlaw_tools::ProgressSink` to a runtime's live turns: a tool
/// call carries only `_session_id`, so routing a batch back to the right
/// event channel means looking it up in the shared table the runtime's
/// turns register themselves in.
struct RuntimeProgressSink {
    routes: Arc<DashMap<String, mpsc::Sender<AgentEvent>>>,
}

#[async_trait::async_trait]
impl agenticlaw_tools::ProgressSink for RuntimeProgressSink {
    async fn emit(&self, session_id: &str, tool_call_id: &str, tool_name: &str, lines: Vec<String>) {
        let Some(tx) = self.routes.get(session_id).map(|e| e.value().clone()) else {
            return;
        };
        let _ = tx
            .send(AgentEvent::ToolProgress {
                id: tool_call_id.to_string(),
                name: tool_name.to_string(),
                lines,
            })
            .await;
    }
}

impl AgentRuntime {
    pub fn new(api_key: &str, tools: ToolRegistry, config: AgentConfig) -> Self {
        Self {
            provider: Arc::new(AnthropicProvider::new(api_key)),
            tools: Arc::new(tools),
            sessions: Arc::new(SessionRegistry::new()),
            config,
            checkpoint: Arc::new(CheckpointManager::new()),
            permissions: Arc::new(PermissionGate::new(AutoApproveSink)),
            notebook: Arc::new(NotebookStore::new()),
            useful_info: Arc::new(UsefulInfoStore::new()),
            todos: Arc::new(TodoStore::new()),
            progress_routes: Arc::new(DashMap::new()),
            subagent_handles: None,
        }
    }

    pub fn with_provider(
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools: Arc::new(tools),
            sessions: Arc::new(SessionRegistry::new()),
            config,
            checkpoint: Arc::new(CheckpointManager::new()),
            permissions: Arc::new(PermissionGate::new(AutoApproveSink)),
            notebook: Arc::new(NotebookStore::new()),
            useful_info: Arc::new(UsefulInfoStore::new()),
            todos: Arc::new(TodoStore::new()),
            progress_routes: Arc::new(DashMap::new()),
            subagent_handles: None,
        }
    }

    /// Override the checkpoint manager and permission gate this runtime
    /// drives turns with. Used by [`bootstrap`] to share them with the
    /// late-bound handles the tool registry was built with.
    pub fn with_checkpoint_and_permissions(
        mut self,
        checkpoint: Arc<CheckpointManager>,
        permissions: Arc<PermissionGate>,
    ) -> Self {
        self.checkpoint = checkpoint;
        self.permissions = permissions;
        self
    }

    /// Override the notebook/useful-info/TODO stores this runtime drives
    /// turns with. Used by [`bootstrap`] to share them with the late-bound
    /// `notebook`/`todo` tool sinks.
    pub fn with_stores(
        mut self,
        notebook: Arc<NotebookStore>,
        useful_info: Arc<UsefulInfoStore>,
        todos: Arc<TodoStore>,
    ) -> Self {
        self.notebook = notebook;
        self.useful_info = useful_info;
        self.todos = todos;
        self
    }

    /// Wire the handles needed to build profile-scoped tool registries for
    /// spawned children. Without this, `spawn_child` falls back to handing
    /// children the full top-level registry.
    pub fn with_subagent_handles(
        mut self,
        runtime_handle: agenticlaw_tools::RuntimeHandle,
        subagent_control: agenticlaw_tools::SubagentControlHandle,
    ) -> Self {
        self.subagent_handles = Some((runtime_handle, subagent_control));
        self
    }

    /// The shared session_id -> event-channel table `bootstrap` binds a
    /// `ProgressSink` against, so tool calls anywhere (including inside a
    /// scoped sub-agent registry) can stream progress to the turn that's
    /// actually waiting on it.
    pub fn progress_routes(&self) -> Arc<DashMap<String, mpsc::Sender<AgentEvent>>> {
        self.progress_routes.clone()
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }
    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }
    pub fn tool_definitions(&self) -> Vec<LlmTool> {
        self.tools.get_definitions()
    }
    pub fn workspace(&self) -> &Path {
        &self.config.workspace_root
    }
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
    pub fn checkpoint(&self) -> &Arc<CheckpointManager> {
        &self.checkpoint
    }
    pub fn permissions(&self) -> &Arc<PermissionGate> {
        &self.permissions
    }
    pub fn notebook(&self) -> &Arc<NotebookStore> {
        &self.notebook
    }
    pub fn useful_info(&self) -> &Arc<UsefulInfoStore> {
        &self.useful_info
    }
    pub fn todos(&self) -> &Arc<TodoStore> {
        &self.todos
    }

    /// Resolve which session a CLI/TUI turn should use: an explicit name (resumed
    /// from its .ctx file if one exists, else freshly created), the most
    /// recently modified session in the workspace when `resume` is set, or
    /// a freshly generated session id. Returns `None` only when `resume` was
    /// requested but the workspace has no `.ctx` files to resume from.
    pub fn resolve_session(
        &self,
        session_name: Option<&str>,
        resume: bool,
    ) -> Option<(SessionKey, PathBuf)> {
        let workspace_root = &self.config.workspace_root;
        if let Some(name) = session_name {
            let key = SessionKey::new(name);
            if let Some(latest) = crate::ctx_file::find_by_id(workspace_root, name) {
                if let Ok(resumed) = crate::ctx_file::parse_for_resume(&latest) {
                    self.sessions.resume_from_ctx(&resumed);
                    return Some((key, latest));
                }
            }
            let ctx_path = crate::ctx_file::session_ctx_path(workspace_root, name);
            return Some((key, ctx_path));
        }
        if resume {
            let ctx = crate::ctx_file::find_latest(workspace_root)?;
            let resumed = crate::ctx_file::parse_for_resume(&ctx).ok()?;
            let key = SessionKey::new(&resumed.session_id);
            let path = resumed.ctx_path.clone();
            self.sessions.resume_from_ctx(&resumed);
            return Some((key, path));
        }
        let session_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let key = SessionKey::new(&session_id);
        let path = crate::ctx_file::session_ctx_path(workspace_root, &session_id);
        Some((key, path))
    }

    /// Get or create a session with .ctx persistence.
    fn get_session(&self, session_key: &SessionKey) -> Arc<Session> {
        self.sessions.create_with_ctx(
            session_key,
            self.config.system_prompt.as_deref(),
            &self.config.workspace_root,
        )
    }

    /// Run a turn without cancellation support (legacy API).
    pub async fn run_turn(
        &self,
        session_key: &SessionKey,
        user_message: &str,
        event_tx: mpsc::Sender<AgentEvent>,
    ) -> Result<(), String> {
        // Use a token that is never cancelled
        let cancel = CancellationToken::new();
        self.run_turn_cancellable(session_key, user_message, event_tx, cancel)
            .await
    }

    /// Run a turn with cancellation support.
    ///
    /// When `cancel` is triggered:
    /// - The current LLM stream is aborted immediately
    /// - In-flight tool executions are cancelled
    /// - Every file mutated since the turn began is rolled back to its
    ///   pre-turn content (C4), and the in-memory/`.ctx` log is truncated to
    ///   match, so a cancelled turn leaves no partial trace.
    /// - The turn returns `Ok(())`
    ///
    /// Callers should cancel the token when a new HITL message arrives,
    /// then call `run_turn_cancellable` again with the new message.
    pub async fn run_turn_cancellable(
        &self,
        session_key: &SessionKey,
        user_message: &str,
        event_tx: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) -> Result<(), String> {
        let session = self.get_session(session_key);
        let session_id = session_key.as_str().to_string();
        self.progress_routes.insert(session_id.clone(), event_tx.clone());
        let _progress_route = ProgressRouteGuard {
            routes: self.progress_routes.clone(),
            session_id: session_id.clone(),
        };
        let _ = event_tx.send(AgentEvent::AgentStart).await;

        // Claude Opus context window: 200k tokens. TODO: get from provider.
        let max_context = 200_000;
        let message_count_before_turn = session.message_count().await;
        let should_sleep = session
            .add_user_message(user_message, self.config.sleep_threshold_pct, max_context)
            .await;

        if should_sleep {
            let token_count = session.token_count().await;
            let _ = event_tx.send(AgentEvent::Sleep { token_count }).await;
            return Ok(());
        }

        self.checkpoint.create(
            session_id.clone(),
            message_count_before_turn,
            self.useful_info.snapshot(&session_id),
            self.todos.snapshot(&session_id),
        );
        let _ = event_tx
            .send(AgentEvent::TurnStart {
                message_count_before: message_count_before_turn,
            })
            .await;

        let mut iterations = 0;
        let mut aborted = false;

        'turn: loop {
            // Check cancellation before starting each iteration
            if cancel.is_cancelled() {
                debug!("Turn cancelled before iteration {}", iterations + 1);
                aborted = true;
                break;
            }

            iterations += 1;
            if iterations > self.config.max_tool_iterations {
                let _ = event_tx
                    .send(AgentEvent::Error(
                        "Max tool iterations exceeded".to_string(),
                    ))
                    .await;
                break;
            }

            let messages = session.get_messages_for_provider().await;
            let model = session
                .model()
                .await
                .unwrap_or_else(|| self.config.default_model.clone());
            let tools_for_request = self.tools.get_definitions();
            let system = session.system_prompt().await;
            let provider = self.provider.clone();
            let retry_mid_stream = self.config.retry_mid_stream;

            let stream = {
                let model = model.clone();
                let messages = messages.clone();
                let system = system.clone();
                let tools_for_request = tools_for_request.clone();
                stream_with_retry(
                    move || {
                        let provider = provider.clone();
                        let model = model.clone();
                        let messages = messages.clone();
                        let system = system.clone();
                        let tools_for_request = tools_for_request.clone();
                        async move {
                            let request = LlmRequest {
                                model,
                                messages,
                                tools: Some(tools_for_request),
                                max_tokens: Some(8192),
                                system,
                                ..Default::default()
                            };
                            provider.complete_stream(request, None).await
                        }
                    },
                    cancel.clone(),
                    retry_mid_stream,
                    |attempt, err| {
                        warn!(attempt, error = %err, "retrying LLM stream");
                    },
                )
                .await
            };

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = event_tx.send(AgentEvent::Error(e.to_string())).await;
                    if let Some(state) = self.checkpoint.rollback(&session_id).await {
                        self.useful_info.restore(&session_id, state.useful_info);
                        self.todos.restore(&session_id, state.todos);
                        self.notebook.rollback_after(&session_id, message_count_before_turn);
                    }
                    return Err(e.to_string());
                }
            };

            let mut text_content = String::new();
            let mut tool_calls: Vec<AccumulatedToolCall> = Vec::new();
            let mut current_tool: Option<AccumulatedToolCall> = None;
            let mut stop_reason = "end_turn".to_string();
            let mut cancelled = false;

            tokio::pin!(stream);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("LLM stream cancelled by HITL preemption");
                        cancelled = true;
                        break;
                    }
                    delta_opt = stream.next() => {
                        match delta_opt {
                            Some(Ok(delta)) => match delta {
                                StreamDelta::Text(text) => {
                                    text_content.push_str(&text);
                                    let _ = event_tx.send(AgentEvent::Text(text)).await;
                                }
                                StreamDelta::Thinking(thinking) => {
                                    let _ = event_tx.send(AgentEvent::Thinking(thinking)).await;
                                }
                                StreamDelta::ToolCallStart { id, name } => {
                                    current_tool = Some(AccumulatedToolCall { id: id.clone(), name: name.clone(), arguments: String::new() });
                                    let _ = event_tx.send(AgentEvent::ToolCallStart { id, name }).await;
                                }
                                StreamDelta::ToolCallDelta { id, arguments } => {
                                    if let Some(ref mut tool) = current_tool { tool.arguments.push_str(&arguments); }
                                    let _ = event_tx.send(AgentEvent::ToolCallDelta { id, arguments }).await;
                                }
                                StreamDelta::ToolCallEnd { id: _, .. } => {
                                    if let Some(tool) = current_tool.take() { tool_calls.push(tool); }
                                }
                                StreamDelta::Done { stop_reason: sr, .. } => {
                                    if let Some(r) = sr { stop_reason = r; }
                                }
                                StreamDelta::Error(e) => {
                                    let _ = event_tx.send(AgentEvent::Error(e)).await;
                                }
                                _ => {}
                            },
                            Some(Err(e)) => { let _ = event_tx.send(AgentEvent::Error(e.to_string())).await; }
                            None => break,
                        }
                    }
                }
            }

            if cancelled {
                // Save any partial text we got before cancellation; rollback
                // below discards it along with any file mutations.
                if !text_content.is_empty() {
                    session.add_assistant_text(&text_content).await;
                }
                aborted = true;
                break 'turn;
            }

            // Save to in-memory session + .ctx file
            if tool_calls.is_empty() {
                session.add_assistant_text(&text_content).await;
            } else {
                let blocks: Vec<ContentBlock> = tool_calls
                    .iter()
                    .map(|tc| ContentBlock::ToolUse {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        input: tc.parse_arguments(),
                    })
                    .collect();
                session
                    .add_assistant_with_tools(
                        if text_content.is_empty() {
                            None
                        } else {
                            Some(&text_content)
                        },
                        blocks,
                    )
                    .await;
            }

            if tool_calls.is_empty() {
                let _ = event_tx
                    .send(AgentEvent::TurnEnd {
                        stop_reason: stop_reason.clone(),
                    })
                    .await;
                let _ = event_tx.send(AgentEvent::Done { stop_reason }).await;
                self.checkpoint.commit(&session_id);
                info!(
                    "Turn complete: session={}, messages={}, tokens≈{}",
                    session_key,
                    session.message_count().await,
                    session.token_count().await
                );
                return Ok(());
            }

            if cancel.is_cancelled() {
                aborted = true;
                break 'turn;
            }

            let batch_names: Vec<String> = tool_calls.iter().map(|tc| tc.name.clone()).collect();
            let results = self
                .dispatch_tool_batch(
                    &session_id,
                    message_count_before_turn,
                    &tool_calls,
                    &batch_names,
                    &cancel,
                    &event_tx,
                )
                .await;
            for (tc, result_str, is_error) in results {
                session.add_tool_result(&tc.id, &result_str, is_error).await;
            }

            if cancel.is_cancelled() {
                aborted = true;
                break 'turn;
            }

            debug!(
                "Tool calls executed, continuing loop (iteration {})",
                iterations
            );
        }

        if aborted {
            if let Some(state) = self.checkpoint.rollback(&session_id).await {
                session.truncate_to(state.message_count).await;
                self.useful_info.restore(&session_id, state.useful_info);
                self.todos.restore(&session_id, state.todos);
                self.notebook.rollback_after(&session_id, message_count_before_turn);
            }
            let _ = event_tx.send(AgentEvent::Aborted).await;
            let _ = event_tx
                .send(AgentEvent::Done {
                    stop_reason: "cancelled".to_string(),
                })
                .await;
            info!(
                "Turn cancelled and rolled back: session={}, messages={}",
                session_key,
                session.message_count().await
            );
            return Ok(());
        }

        self.checkpoint.commit(&session_id);
        info!(
            "Turn complete: session={}, messages={}, tokens≈{}",
            session_key,
            session.message_count().await,
            session.token_count().await
        );
        Ok(())
    }

    /// Runs one assistant turn's tool-call batch: read-only calls run
    /// concurrently, everything else runs sequentially (so a later call
    /// observes an earlier mutation's effects, per §4.6). Every call is
    /// first consulted against the permission gate, with `_session_id`,
    /// `_message_index`, and `_tool_call_id` injected into its arguments so
    /// mutation tools can record a pre-mutation checkpoint snapshot or a
    /// notebook journal entry keyed to this turn, and long-running tools can
    /// stream progress batches back to the right call. Results are returned
    /// in the same order the assistant emitted the calls, regardless of
    /// which group ran them or how long each took.
    async fn dispatch_tool_batch(
        &self,
        session_id: &str,
        message_index: usize,
        tool_calls: &[AccumulatedToolCall],
        batch_names: &[String],
        cancel: &CancellationToken,
        event_tx: &mpsc::Sender<AgentEvent>,
    ) -> Vec<(AccumulatedToolCall, String, bool)> {
        let mut slots: Vec<Option<(AccumulatedToolCall, String, bool)>> =
            (0..tool_calls.len()).map(|_| None).collect();

        // Read-only calls can run concurrently; everything else (writes,
        // shell, spawn) runs sequentially in emission order so mutations
        // observe each other deterministically.
        let mut parallel_indices = Vec::new();
        let mut sequential_indices = Vec::new();
        for (i, tc) in tool_calls.iter().enumerate() {
            if self.tools.list_read_only().iter().any(|n| *n == tc.name.as_str()) {
                parallel_indices.push(i);
            } else {
                sequential_indices.push(i);
            }
        }

        let parallel_futs = parallel_indices.iter().map(|&i| {
            let tc = tool_calls[i].clone();
            self.dispatch_one(session_id, message_index, tc, batch_names, cancel, event_tx)
        });
        let parallel_results = futures::future::join_all(parallel_futs).await;
        for (&i, res) in parallel_indices.iter().zip(parallel_results) {
            slots[i] = Some(res);
        }

        for &i in &sequential_indices {
            let tc = tool_calls[i].clone();
            let res = self
                .dispatch_one(session_id, message_index, tc, batch_names, cancel, event_tx)
                .await;
            slots[i] = Some(res);
        }

        slots.into_iter().map(|s| s.expect("every index filled")).collect()
    }

    async fn dispatch_one(
        &self,
        session_id: &str,
        message_index: usize,
        tc: AccumulatedToolCall,
        batch_names: &[String],
        cancel: &CancellationToken,
        event_tx: &mpsc::Sender<AgentEvent>,
    ) -> (AccumulatedToolCall, String, bool) {
        if cancel.is_cancelled() {
            return (tc, String::new(), true);
        }

        let mut args = tc.parse_arguments();
        if let Some(obj) = args.as_object_mut() {
            obj.insert(
                "_message_index".to_string(),
                serde_json::Value::from(message_index),
            );
            obj.insert(
                "_session_id".to_string(),
                serde_json::Value::String(session_id.to_string()),
            );
            obj.insert(
                "_tool_call_id".to_string(),
                serde_json::Value::String(tc.id.clone()),
            );
        }

        let batched_with: Vec<String> = batch_names
            .iter()
            .filter(|n| *n != &tc.name)
            .cloned()
            .collect();
        match self.permissions.gate(&tc.name, &args, &batched_with).await {
            PermissionDecision::Deny { reason } => {
                let _ = event_tx
                    .send(AgentEvent::ToolSkipped {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        reason: reason.clone(),
                    })
                    .await;
                let result_str = format!("Tool call rejected by user: {}", reason);
                let _ = event_tx
                    .send(AgentEvent::ToolResult {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        result: result_str.clone(),
                        is_error: true,
                    })
                    .await;
                return (tc, result_str, true);
            }
            PermissionDecision::Allow => {}
        }

        let _ = event_tx
            .send(AgentEvent::ToolExecuting {
                id: tc.id.clone(),
                name: tc.name.clone(),
            })
            .await;

        let result = self
            .tools
            .execute_cancellable(&tc.name, args, cancel.clone())
            .await;
        let is_error = result.is_error();
        let result_str = result.to_content_string();
        let result_str = if result_str.len() > 50000 {
            format!(
                "{}...\n[truncated, {} total chars]",
                &result_str[..50000],
                result_str.len()
            )
        } else {
            result_str
        };
        let _ = event_tx
            .send(AgentEvent::ToolResult {
                id: tc.id.clone(),
                name: tc.name.clone(),
                result: result_str.clone(),
                is_error,
            })
            .await;
        (tc, result_str, is_error)
    }
}

#[async_trait::async_trait]
impl SpawnableRuntime for AgentRuntime {
    async fn spawn_child(
        &self,
        session_id: &str,
        system_prompt: &str,
        user_message: &str,
        max_iterations: usize,
        allowed_tools: &[String],
        parent_session_id: Option<&str>,
    ) -> Result<(String, usize), String> {
        let session_key = SessionKey::from(format!("subagent:{}", session_id));

        // Create child session with system prompt
        let session = self
            .sessions
            .get_or_create(&session_key, Some(system_prompt));
        session.set_system_prompt(system_prompt).await;

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);

        // Scope the child to its profile's allowlist when we have the
        // handles to do so; otherwise it inherits the full registry this
        // runtime was constructed with (e.g. in tests that build an
        // `AgentRuntime` directly rather than through `bootstrap`).
        let runtime_tools: Arc<ToolRegistry> = match &self.subagent_handles {
            Some((runtime_handle, subagent_control)) if !allowed_tools.is_empty() => {
                let notebook_store: Arc<dyn agenticlaw_tools::NotebookSink> =
                    Arc::new(crate::store::NotebookAndUsefulInfoSink {
                        notebook: self.notebook.clone(),
                        useful_info: self.useful_info.clone(),
                    });
                let todo_store: Arc<dyn agenticlaw_tools::TodoSink> = self.todos.clone();
                let progress_store: Arc<dyn agenticlaw_tools::ProgressSink> =
                    Arc::new(RuntimeProgressSink { routes: self.progress_routes.clone() });
                Arc::new(agenticlaw_tools::create_scoped_registry_for_profile(
                    &self.config.workspace_root,
                    allowed_tools,
                    runtime_handle.clone(),
                    subagent_control.clone(),
                    notebook_store,
                    todo_store,
                    progress_store,
                ))
            }
            _ => self.tools.clone(),
        };
        let runtime_provider = self.provider.clone();
        let runtime_sessions = self.sessions.clone();
        let runtime_permissions = self.permissions.clone();
        let default_model = self.config.default_model.clone();
        let retry_mid_stream = self.config.retry_mid_stream;
        let sk = session_key.clone();
        let msg = user_message.to_string();
        let child_id = session_id.to_string();

        // Register this child's event channel so bash (or any other
        // progress-emitting tool) in its scoped registry can stream batches
        // back here; removed just before the spawned task returns, so the
        // `rx.recv()` loop below still sees the channel close naturally.
        let progress_routes = self.progress_routes.clone();
        let progress_key = sk.as_str().to_string();
        progress_routes.insert(progress_key.clone(), tx.clone());

        let handle = tokio::spawn(async move {
            let _progress_route = ProgressRouteGuard {
                routes: progress_routes,
                session_id: progress_key,
            };
            let session = runtime_sessions.get(&sk).unwrap();
            let max_context = 200_000;
            session.add_user_message(&msg, 0.55, max_context).await;

            let mut iterations = 0;
            loop {
                iterations += 1;
                if iterations > max_iterations {
                    let _ = tx
                        .send(AgentEvent::Error("Max tool iterations exceeded".into()))
                        .await;
                    break;
                }

                let messages = session.get_messages().await;
                let model = session
                    .model()
                    .await
                    .unwrap_or_else(|| default_model.clone());

                let system = session.system_prompt().await;
                let tool_defs = runtime_tools.get_definitions();
                let provider = runtime_provider.clone();
                let stream = stream_with_retry(
                    move || {
                        let provider = provider.clone();
                        let model = model.clone();
                        let messages = messages.clone();
                        let system = system.clone();
                        let tool_defs = tool_defs.clone();
                        async move {
                            let request = agenticlaw_llm::LlmRequest {
                                model,
                                messages,
                                tools: Some(tool_defs),
                                max_tokens: Some(8192),
                                system,
                                ..Default::default()
                            };
                            provider.complete_stream(request, None).await
                        }
                    },
                    CancellationToken::new(),
                    retry_mid_stream,
                    |attempt, err| {
                        tracing::warn!(attempt, error = %err, "retrying sub-agent LLM stream");
                    },
                )
                .await;

                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = tx.send(AgentEvent::Error(e.to_string())).await;
                        return Err(e.to_string());
                    }
                };

                let mut text_content = String::new();
                let mut tool_calls: Vec<agenticlaw_llm::AccumulatedToolCall> = Vec::new();
                let mut current_tool: Option<agenticlaw_llm::AccumulatedToolCall> = None;

                tokio::pin!(stream);

                while let Some(delta_result) = stream.next().await {
                    match delta_result {
                        Ok(delta) => match delta {
                            agenticlaw_llm::StreamDelta::Text(text) => {
                                text_content.push_str(&text);
                                let _ = tx.send(AgentEvent::Text(text)).await;
                            }
                            agenticlaw_llm::StreamDelta::Thinking(t) => {
                                let _ = tx.send(AgentEvent::Thinking(t)).await;
                            }
                            agenticlaw_llm::StreamDelta::ToolCallStart { id, name } => {
                                current_tool = Some(agenticlaw_llm::AccumulatedToolCall {
                                    id: id.clone(),
                                    name: name.clone(),
                                    arguments: String::new(),
                                });
                                let _ = tx.send(AgentEvent::ToolCallStart { id, name }).await;
                            }
                            agenticlaw_llm::StreamDelta::ToolCallDelta { id, arguments } => {
                                if let Some(ref mut tool) = current_tool {
                                    tool.arguments.push_str(&arguments);
                                }
                                let _ = tx.send(AgentEvent::ToolCallDelta { id, arguments }).await;
                            }
                            agenticlaw_llm::StreamDelta::ToolCallEnd { id: _, .. } => {
                                if let Some(tool) = current_tool.take() {
                                    tool_calls.push(tool);
                                }
                            }
                            agenticlaw_llm::StreamDelta::Done { .. } => {}
                            agenticlaw_llm::StreamDelta::Error(e) => {
                                let _ = tx.send(AgentEvent::Error(e)).await;
                            }
                            _ => {}
                        },
                        Err(e) => {
                            let _ = tx.send(AgentEvent::Error(e.to_string())).await;
                        }
                    }
                }

                if tool_calls.is_empty() {
                    session.add_assistant_text(&text_content).await;
                    let _ = tx
                        .send(AgentEvent::Done {
                            stop_reason: "end_turn".into(),
                        })
                        .await;
                    break;
                } else {
                    let blocks: Vec<agenticlaw_llm::ContentBlock> = tool_calls
                        .iter()
                        .map(|tc| agenticlaw_llm::ContentBlock::ToolUse {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            input: tc.parse_arguments(),
                        })
                        .collect();
                    session
                        .add_assistant_with_tools(
                            if text_content.is_empty() {
                                None
                            } else {
                                Some(&text_content)
                            },
                            blocks,
                        )
                        .await;
                }

                // `runtime_tools` is already scoped to the profile's
                // allowlist above, so a call to a tool outside it simply
                // isn't registered — the dispatcher never sees it. Every
                // call here runs sequentially; sub-agents don't get the
                // parallel-read-tool split the top-level turn loop does.
                for tc in tool_calls {
                    let mut args = tc.parse_arguments();
                    if let Some(obj) = args.as_object_mut() {
                        obj.insert(
                            "_session_id".to_string(),
                            serde_json::Value::String(sk.as_str().to_string()),
                        );
                        // Sub-agent turns have no checkpoint/rollback of their own
                        // (see `spawn_child`), so there is no turn-start index to
                        // anchor a notebook journal entry to.
                        obj.insert("_message_index".to_string(), serde_json::Value::from(0));
                        obj.insert(
                            "_tool_call_id".to_string(),
                            serde_json::Value::String(tc.id.clone()),
                        );
                    }
                    let decision = runtime_permissions.gate(&tc.name, &args, &[]).await;
                    if let PermissionDecision::Deny { reason } = decision {
                        let result_str = format!("Tool call rejected by user: {}", reason);
                        let _ = tx
                            .send(AgentEvent::ToolResult {
                                id: tc.id.clone(),
                                name: tc.name.clone(),
                                result: result_str.clone(),
                                is_error: true,
                            })
                            .await;
                        session.add_tool_result(&tc.id, &result_str, true).await;
                        continue;
                    }

                    let _ = tx
                        .send(AgentEvent::ToolExecuting {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                        })
                        .await;
                    let result = runtime_tools.execute(&tc.name, args).await;
                    let is_error = result.is_error();
                    let result_str = result.to_content_string();
                    let result_str = if result_str.len() > 50000 {
                        format!("{}...\n[truncated]", &result_str[..50000])
                    } else {
                        result_str
                    };
                    let _ = tx
                        .send(AgentEvent::ToolResult {
                            id: tc.id.clone(),
                            name: tc.name.clone(),
                            result: result_str.clone(),
                            is_error,
                        })
                        .await;
                    session.add_tool_result(&tc.id, &result_str, is_error).await;
                }
            }
            Ok(())
        });

        // Collect output from child
        let mut output = String::new();
        let mut token_estimate = 0usize;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Text(t) => {
                    output.push_str(&t);
                    token_estimate += t.len() / 4;
                }
                AgentEvent::Error(e) => {
                    if e != "Max tool iterations exceeded" {
                        tracing::warn!(child = %child_id, "child error: {}", e);
                    }
                }
                _ => {}
            }
        }

        let run_result = handle.await.map_err(|e| e.to_string())?;

        // Record the child's activity on the parent session as an internal
        // message: visible on reload, excluded from the next provider
        // request (see `Session::append_sub_agent_internal`).
        if let Some(parent_id) = parent_session_id {
            let parent_key = SessionKey::from(parent_id.to_string());
            if let Some(parent_session) = self.sessions.get(&parent_key) {
                let summary = match &run_result {
                    Ok(()) => output.clone(),
                    Err(e) => format!("(failed: {e})"),
                };
                parent_session
                    .append_sub_agent_internal(session_id, &summary)
                    .await;
            }
        }

        // Clean up child session
        self.sessions.remove(&session_key);

        run_result?;
        Ok((output, token_estimate))
    }
}

/// Fully wires an [`AgentRuntime`] together with the tool registry's
/// late-bound handles (C4's checkpoint sink, C10's spawn-back and subagent
/// control) so every tool actually reaches the mechanisms it was built
/// against, instead of the dangling handles a bare `create_default_registry`
/// leaves behind. `confirmation_sink` drives the permission gate (C5); pass
/// [`AutoApproveSink`] for headless (`--ask`/`--task`) invocations, or a
/// UI-backed sink for interactive sessions.
pub async fn bootstrap(
    api_key: &str,
    config: AgentConfig,
    confirmation_sink: impl ConfirmationSink + 'static,
) -> Arc<AgentRuntime> {
    let api_key = api_key.to_string();
    bootstrap_with(
        config,
        confirmation_sink,
        move |registry, config| AgentRuntime::new(&api_key, registry, config),
    )
    .await
}

/// As [`bootstrap`], but for a caller-supplied provider (e.g. an
/// `ANTHROPIC_API_URL` proxy endpoint) instead of the default Anthropic
/// client.
pub async fn bootstrap_with_provider(
    provider: Arc<dyn LlmProvider>,
    config: AgentConfig,
    confirmation_sink: impl ConfirmationSink + 'static,
) -> Arc<AgentRuntime> {
    bootstrap_with(config, confirmation_sink, move |registry, config| {
        AgentRuntime::with_provider(provider, registry, config)
    })
    .await
}

async fn bootstrap_with(
    config: AgentConfig,
    confirmation_sink: impl ConfirmationSink + 'static,
    make_runtime: impl FnOnce(ToolRegistry, AgentConfig) -> AgentRuntime,
) -> Arc<AgentRuntime> {
    let workspace_root = config.workspace_root.clone();
    let runtime_handle = agenticlaw_tools::create_runtime_handle();
    let subagent_control_handle = agenticlaw_tools::create_subagent_control_handle();
    let checkpoint_sink_handle = agenticlaw_tools::create_checkpoint_sink_handle();
    let notebook_sink_handle = agenticlaw_tools::create_notebook_sink_handle();
    let todo_sink_handle = agenticlaw_tools::create_todo_sink_handle();
    let progress_sink_handle = agenticlaw_tools::create_progress_sink_handle();
    let supervisor = Arc::new(ProcessSupervisor::new());

    let registry = agenticlaw_tools::create_default_registry_with_spawn(
        &workspace_root,
        runtime_handle.clone(),
        subagent_control_handle.clone(),
        supervisor,
        checkpoint_sink_handle.clone(),
        notebook_sink_handle.clone(),
        todo_sink_handle.clone(),
        progress_sink_handle.clone(),
    );

    let checkpoint = Arc::new(CheckpointManager::new());
    let permissions = Arc::new(PermissionGate::new(confirmation_sink));
    let notebook = Arc::new(NotebookStore::new());
    let useful_info = Arc::new(UsefulInfoStore::new());
    let todos = Arc::new(TodoStore::new());

    {
        let sink: Arc<dyn agenticlaw_tools::CheckpointSink> = checkpoint.clone();
        *checkpoint_sink_handle.write().await = Some(sink);
    }
    {
        let sink: Arc<dyn agenticlaw_tools::NotebookSink> = Arc::new(crate::store::NotebookAndUsefulInfoSink {
            notebook: notebook.clone(),
            useful_info: useful_info.clone(),
        });
        *notebook_sink_handle.write().await = Some(sink);
    }
    {
        let sink: Arc<dyn agenticlaw_tools::TodoSink> = todos.clone();
        *todo_sink_handle.write().await = Some(sink);
    }

    let runtime = Arc::new(
        make_runtime(registry, config)
            .with_checkpoint_and_permissions(checkpoint, permissions)
            .with_stores(notebook, useful_info, todos)
            .with_subagent_handles(runtime_handle.clone(), subagent_control_handle.clone()),
    );

    {
        let handle: Arc<dyn SpawnableRuntime> = runtime.clone();
        *runtime_handle.write().await = Some(handle);
    }
    {
        let sink: Arc<dyn agenticlaw_tools::ProgressSink> =
            Arc::new(RuntimeProgressSink { routes: runtime.progress_routes() });
        *progress_sink_handle.write().await = Some(sink);
    }

    let subagent_registry = Arc::new(SubagentRegistry::new());
    {
        let control: agenticlaw_tools::SubagentRegistryHandle = subagent_registry;
        *subagent_control_handle.write().await = Some(control);
    }

    runtime
}
