//! SSE transport — the headless HTTP surface alongside the WebSocket one.
//!
//! `GET /events` opens a Server-Sent Events stream and immediately emits a
//! `connected` event carrying a connection id. `POST /message` accepts a
//! JSON envelope and drives the same agent runtime the WS protocol does,
//! via `rpc::route_rpc`, so both transports share one chat/abort pipeline.

use crate::rpc::{self, ConnectionContext};
use crate::ws::WsState;
use agenticlaw_agent::OutputEvent;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::stream::{Stream, StreamExt};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Client-to-server envelope for `POST /message`.
#[derive(serde::Deserialize)]
struct IncomingSseMessage {
    #[serde(rename = "type")]
    kind: String,
    content: Option<String>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(rename = "requestId")]
    request_id: Option<String>,
    response: Option<Value>,
    #[serde(rename = "yoloMode")]
    yolo_mode: Option<bool>,
}

/// `GET /events` — establishes an SSE connection and streams every
/// `OutputEvent` broadcast by the runtime, translated to the wire event
/// names the spec names (`message`, `tool_call`, `tool_result`, ...).
pub async fn events_handler(
    State(state): State<Arc<WsState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let mut output_rx = state.output_tx.subscribe();

    let connected = futures::stream::once({
        let connection_id = connection_id.clone();
        async move {
            Ok(Event::default()
                .event("connected")
                .data(json!({ "connectionId": connection_id }).to_string()))
        }
    });

    let forwarded = async_stream::stream! {
        loop {
            match output_rx.recv().await {
                Ok(event) => {
                    if let Some((name, data)) = output_event_to_sse(&event) {
                        yield Ok(Event::default().event(name).data(data.to_string()));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE connection {} lagged, dropped {} events", connection_id, n);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(connected.chain(forwarded))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
}

/// Maps a broadcast `OutputEvent` to an SSE `(event name, JSON body)` pair.
/// Returns `None` for events the SSE surface doesn't forward (e.g. internal
/// ctx-file update notices, which only the WS console renders).
fn output_event_to_sse(event: &OutputEvent) -> Option<(&'static str, Value)> {
    match event {
        OutputEvent::Delta { session, content } => Some((
            "message",
            json!({ "sessionId": session, "content": content }),
        )),
        OutputEvent::Thinking { session, content } => Some((
            "thinking",
            json!({ "sessionId": session, "content": content }),
        )),
        OutputEvent::ToolCall { session, id, name } => Some((
            "tool_call",
            json!({ "sessionId": session, "id": id, "name": name }),
        )),
        OutputEvent::ToolResult {
            session,
            id,
            name,
            result,
            is_error,
        } => Some((
            "tool_result",
            json!({
                "sessionId": session, "id": id, "name": name,
                "result": result, "isError": is_error,
            }),
        )),
        OutputEvent::Done { session } => Some(("complete", json!({ "sessionId": session }))),
        OutputEvent::Error { session, message } => Some((
            "error",
            json!({ "sessionId": session, "message": message }),
        )),
        OutputEvent::Sleep { session, token_count } => Some((
            "usage",
            json!({ "sessionId": session, "tokenCount": token_count }),
        )),
        OutputEvent::ToolConfirmationRequest {
            request_id,
            tool_name,
            arguments,
            batched_with,
            sensitivity_description,
            allow_always,
        } => Some((
            "tool_confirmation_request",
            json!({
                "requestId": request_id,
                "toolName": tool_name,
                "arguments": arguments,
                "batchedWith": batched_with,
                "sensitivityDescription": sensitivity_description,
                "allowAlways": allow_always,
            }),
        )),
        // Tool-arg streaming, "parked", and ctx-update notices have no SSE
        // counterpart named in the transport's event list.
        OutputEvent::ToolCallDelta { .. }
        | OutputEvent::ToolExecuting { .. }
        | OutputEvent::ToolParked { .. }
        | OutputEvent::ToolProgress { .. }
        | OutputEvent::CtxUpdate { .. } => None,
    }
}

/// `POST /message` — dispatches a client message through the same RPC
/// handlers the WS protocol uses (`chat.send`, `chat.abort`, and
/// `tool_confirmation_response` to resolve a pending C5 confirmation).
pub async fn message_handler(
    State(state): State<Arc<WsState>>,
    Json(body): Json<IncomingSseMessage>,
) -> impl IntoResponse {
    let ctx = ConnectionContext {
        authenticated: true,
        agent: state.agent.clone(),
        output_tx: state.output_tx.clone(),
        pending_confirmations: state.pending_confirmations.clone(),
    };

    let session = body
        .session_id
        .clone()
        .unwrap_or_else(|| "sse-default".to_string());

    match body.kind.as_str() {
        "chat" | "image" => {
            let content = body.content.unwrap_or_default();
            if !body.images.is_empty() {
                info!("SSE message carries {} image(s); not yet decoded into the turn", body.images.len());
            }
            if let Some(yolo) = body.yolo_mode {
                state.agent.permissions().set_yolo(yolo);
            }
            let params = json!({ "session": session, "message": content });
            match rpc::route_rpc("chat.send", params, &ctx).await {
                Ok(v) => Json(json!({ "ok": true, "result": v })).into_response(),
                Err((code, msg)) => Json(json!({ "ok": false, "code": code, "error": msg })).into_response(),
            }
        }
        "abort" => {
            let params = json!({ "session": session });
            match rpc::route_rpc("chat.abort", params, &ctx).await {
                Ok(v) => Json(json!({ "ok": true, "result": v })).into_response(),
                Err((code, msg)) => Json(json!({ "ok": false, "code": code, "error": msg })).into_response(),
            }
        }
        "tool_confirmation_response" => {
            let request_id = body.request_id.unwrap_or_default();
            let decision = body.response.unwrap_or_else(|| json!({}));
            let choice = crate::confirmation::parse_confirmation_choice(&decision);
            if state.pending_confirmations.resolve(&request_id, choice) {
                Json(json!({ "ok": true })).into_response()
            } else {
                Json(json!({
                    "ok": false,
                    "error": format!("no pending confirmation for requestId: {}", request_id),
                }))
                .into_response()
            }
        }
        "user_question_response" => {
            let request_id = body.request_id.unwrap_or_default();
            warn!(
                "SSE user_question_response for requestId={} has no pending request to resolve on this transport",
                request_id
            );
            Json(json!({
                "ok": false,
                "error": "no pending question on the SSE transport",
            }))
            .into_response()
        }
        other => {
            Json(json!({ "ok": false, "error": format!("unknown message type: {}", other) }))
                .into_response()
        }
    }
}
