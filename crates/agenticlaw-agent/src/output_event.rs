//! `OutputEvent` — the wire type broadcast to every connected client (WS, SSE,
//! TUI). `runtime::AgentEvent` is the internal per-turn event stream; gateway
//! code converts one to the other so every transport shares one shape.

/// Events emitted to all connected clients.
#[derive(Debug, Clone)]
pub enum OutputEvent {
    /// Streaming text delta
    Delta { session: String, content: String },
    /// Thinking content
    Thinking { session: String, content: String },
    /// Tool call started
    ToolCall {
        session: String,
        id: String,
        name: String,
    },
    /// Tool call arguments streaming
    ToolCallDelta {
        session: String,
        id: String,
        arguments: String,
    },
    /// Tool executing
    ToolExecuting {
        session: String,
        id: String,
        name: String,
    },
    /// Tool result
    ToolResult {
        session: String,
        id: String,
        name: String,
        result: String,
        is_error: bool,
    },
    /// Tool parked (interrupted by human)
    ToolParked {
        session: String,
        id: String,
        name: String,
    },
    /// Batched partial output from an in-flight tool call (C7).
    ToolProgress {
        session: String,
        id: String,
        name: String,
        lines: Vec<String>,
    },
    /// Turn complete
    Done { session: String },
    /// Error
    Error { session: String, message: String },
    /// Session sleeping
    Sleep { session: String, token_count: usize },
    /// .ctx file updated — full content for client catchup
    CtxUpdate { session: String, content: String },
    /// A tool call needs interactive approval (C5). `request_id` must be
    /// echoed back in the matching `tool_confirmation_response` so the
    /// gateway can resolve the right pending request.
    ToolConfirmationRequest {
        request_id: String,
        tool_name: String,
        arguments: serde_json::Value,
        batched_with: Vec<String>,
        sensitivity_description: Option<String>,
        allow_always: bool,
    },
}
